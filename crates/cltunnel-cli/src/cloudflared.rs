//! The `cloudflared` binary as the engine's validator and route registrar

use cltunnel_ingress::{ExternalError, RouteRegistrar, SemanticValidator};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::command::run;

pub const BINARY_NAME: &str = "cloudflared";

/// Handle on an installed cloudflared binary
#[derive(Debug, Clone)]
pub struct Cloudflared {
    binary: PathBuf,
}

impl Cloudflared {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Find cloudflared on the PATH
    pub fn locate() -> Option<Self> {
        Self::locate_with("which")
    }

    /// Resolve cloudflared with the `lookup` program; `None` when either is
    /// missing
    fn locate_with(lookup: &str) -> Option<Self> {
        let output = match Command::new(lookup).arg(BINARY_NAME).output() {
            Ok(output) => output,
            Err(e) => {
                debug!(lookup = %lookup, error = %e, "Could not run PATH lookup");
                return None;
            }
        };

        if !output.status.success() {
            return None;
        }

        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if path.is_empty() {
            return None;
        }

        debug!(path = %path, "Found cloudflared");
        Some(Self::new(path))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    /// `cloudflared service install`
    pub fn service_install(&self) -> Result<(), ExternalError> {
        run(self.command().args(["service", "install"]))?;
        Ok(())
    }

    /// `cloudflared service uninstall`
    pub fn service_uninstall(&self) -> Result<(), ExternalError> {
        run(self.command().args(["service", "uninstall"]))?;
        Ok(())
    }
}

impl SemanticValidator for Cloudflared {
    fn check(&self, config_path: &Path) -> Result<(), ExternalError> {
        run(self
            .command()
            .arg("--config")
            .arg(config_path)
            .args(["tunnel", "ingress", "validate"]))?;

        debug!(config = %config_path.display(), "cloudflared accepted ingress rules");
        Ok(())
    }
}

impl RouteRegistrar for Cloudflared {
    fn register_route(&self, tunnel: &Uuid, hostname: &str) -> Result<(), ExternalError> {
        run(self
            .command()
            .args(["tunnel", "route", "dns"])
            .arg(tunnel.to_string())
            .arg(hostname))?;

        info!(tunnel = %tunnel, hostname = %hostname, "DNS route registered");
        Ok(())
    }
}
