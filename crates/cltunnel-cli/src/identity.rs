//! CLI identity document
//!
//! Stores the base domain every subdomain is created under, as pretty-printed
//! JSON in `~/.cl-tunnel/config.json`. Written by `init`, read-only after.

use anyhow::{Context, Result};
use cltunnel_ingress::validate_domain;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityDocument {
    /// Base domain, e.g. `example.com`
    pub domain: String,
}

impl IdentityDocument {
    /// Create a document for a validated domain
    pub fn new(domain: &str) -> Result<Self> {
        validate_domain(domain)?;
        Ok(Self {
            domain: domain.to_string(),
        })
    }

    /// `<subdomain>.<domain>`
    pub fn hostname(&self, subdomain: &str) -> String {
        format!("{}.{}", subdomain, self.domain)
    }

    /// Name of `hostname` relative to the base domain
    ///
    /// Hostnames outside the domain are returned unchanged.
    pub fn subdomain_of<'a>(&self, hostname: &'a str) -> &'a str {
        let suffix_len = self.domain.len() + 1;
        let split = hostname.len().saturating_sub(suffix_len);
        if split > 0 && hostname.is_char_boundary(split) {
            let (name, suffix) = hostname.split_at(split);
            if suffix.starts_with('.') && suffix[1..].eq_ignore_ascii_case(&self.domain) {
                return name;
            }
        }
        hostname
    }
}

/// Reads and writes the identity document
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, `None` if `init` has not run yet
    pub fn load(&self) -> Result<Option<IdentityDocument>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&self.path)
            .context(format!("Failed to read config file: {:?}", self.path))?;

        let document: IdentityDocument = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", self.path))?;

        validate_domain(&document.domain)
            .context(format!("Invalid domain in config file: {:?}", self.path))?;

        Ok(Some(document))
    }

    /// Save the document, creating the parent directory if needed
    pub fn save(&self, document: &IdentityDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(document).context("Failed to serialize config")?;

        fs::write(&self.path, json)
            .context(format!("Failed to write config file: {:?}", self.path))?;

        Ok(())
    }

    /// Raw JSON as stored, for display
    pub fn read_raw(&self) -> Result<String> {
        fs::read_to_string(&self.path)
            .context(format!("Failed to read config file: {:?}", self.path))
    }
}
