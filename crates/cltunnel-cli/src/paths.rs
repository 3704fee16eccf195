//! File locations used by the CLI
//!
//! Built once at startup and passed down explicitly.

use anyhow::{Context, Result};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliPaths {
    pub home: PathBuf,
    /// cloudflared's ingress configuration
    pub cloudflared_config: PathBuf,
    /// cl-tunnel's own settings (`{"domain": ...}`)
    pub identity_file: PathBuf,
}

impl CliPaths {
    /// Default layout under `home`
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            cloudflared_config: home.join(".cloudflared").join("config.yml"),
            identity_file: home.join(".cl-tunnel").join("config.json"),
            home,
        }
    }

    /// Default layout under the current user's home directory
    pub fn discover() -> Result<Self> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(Self::with_home(home))
    }

    /// Point at a different cloudflared configuration file
    pub fn with_cloudflared_config(mut self, path: Option<PathBuf>) -> Self {
        if let Some(path) = path {
            self.cloudflared_config = path;
        }
        self
    }

    pub fn launch_agents_dir(&self) -> PathBuf {
        self.home.join("Library").join("LaunchAgents")
    }

    pub fn user_logs_dir(&self) -> PathBuf {
        self.home.join("Library").join("Logs")
    }
}
