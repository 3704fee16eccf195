//! Collaborators the engine consumes but does not implement
//!
//! Implementations wrap `cloudflared` and the platform service manager. Every
//! call is synchronous and either succeeds or returns an [`ExternalError`]
//! carrying the collaborator's diagnostics verbatim.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// A failed external call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{action} failed: {diagnostics}")]
pub struct ExternalError {
    /// What was attempted, e.g. `cloudflared tunnel ingress validate`
    pub action: String,
    /// Opaque output of the collaborator; never parsed
    pub diagnostics: String,
}

impl ExternalError {
    pub fn new(action: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            diagnostics: diagnostics.into(),
        }
    }
}

/// The authoritative check of whether cloudflared accepts a configuration
pub trait SemanticValidator {
    /// Validate the configuration file at `config_path`
    fn check(&self, config_path: &Path) -> Result<(), ExternalError>;
}

/// Registers a public hostname for a tunnel (DNS route)
pub trait RouteRegistrar {
    fn register_route(&self, tunnel: &Uuid, hostname: &str) -> Result<(), ExternalError>;
}

/// Log files written by the supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// Which of the service's output streams to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogStream {
    /// cloudflared writes everything to stderr by default
    #[default]
    Stderr,
    Stdout,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStream::Stderr => write!(f, "err"),
            LogStream::Stdout => write!(f, "out"),
        }
    }
}

/// Platform service manager running the tunnel agent
///
/// The transaction engine only uses [`ServiceSupervisor::restart`]; the rest
/// backs the service install and log commands.
pub trait ServiceSupervisor {
    /// Path of the service definition (plist, unit file)
    fn descriptor_path(&self) -> PathBuf;

    /// Configuration file the service is started with, if the descriptor
    /// names one with `--config`
    ///
    /// `None` when the descriptor does not exist or passes no `--config`, in
    /// which case cloudflared falls back to its default search path.
    fn service_config(&self) -> Result<Option<PathBuf>, ExternalError>;

    /// Restart the agent so it picks up the current configuration
    fn restart(&self) -> Result<(), ExternalError>;

    fn stop(&self) -> Result<(), ExternalError>;

    /// Whether the descriptor already runs `<binary> tunnel run`
    fn is_patched(&self, binary: &Path) -> Result<bool, ExternalError>;

    /// Make the descriptor run `<binary> tunnel run`; idempotent
    fn patch(&self, binary: &Path) -> Result<(), ExternalError>;

    /// Reload the service definition after patching it
    fn reload_definition(&self) -> Result<(), ExternalError>;

    /// Log files, if the platform writes them to disk
    fn log_paths(&self) -> Option<LogPaths>;

    /// Last `lines` lines of the given stream
    fn tail_logs(&self, stream: LogStream, lines: usize) -> Result<String, ExternalError>;

    /// How to install cloudflared on this platform
    fn install_instructions(&self) -> Vec<String>;
}
