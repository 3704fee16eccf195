//! Error types shared by the document, rule and input layers
//!
//! Transaction-level failures live in [`crate::transaction`], which wraps these.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::schema::SchemaViolations;

/// Errors produced while turning text into an [`crate::IngressDocument`] and back
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The text is not valid YAML at all; nothing was interpreted
    #[error("Malformed document: {0}")]
    Malformed(#[source] serde_yaml::Error),

    /// The YAML is well-formed but violates the document contract
    #[error("Schema validation failed: {0}")]
    Schema(SchemaViolations),

    #[error("Failed to serialize document: {0}")]
    Serialize(#[source] serde_yaml::Error),
}

/// Errors from loading a document off disk
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Rule set logic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleSetError {
    #[error("Ingress rule for {hostname} already exists. Use --force to override it")]
    Conflict { hostname: String },

    #[error("No ingress rule found for {hostname}")]
    NotFound { hostname: String },
}

/// A single rejected input field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputError {
    pub field: &'static str,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: \"{}\". {}", self.field, self.value, self.reason)
    }
}

/// Every rejected input field from one validation pass
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct InputErrors(pub Vec<InputError>);

impl InputErrors {
    pub fn iter(&self) -> impl Iterator<Item = &InputError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether any error concerns the given field
    pub fn has_field(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }
}

impl fmt::Display for InputErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validation errors:")?;
        for err in &self.0 {
            write!(f, "\n  {}", err)?;
        }
        Ok(())
    }
}
