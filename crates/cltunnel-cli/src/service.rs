//! cloudflared service supervision for macOS (launchd) and Linux (systemd)
//!
//! The service definition itself is created by `cloudflared service install`;
//! these supervisors restart and stop it, patch it to run the locally managed
//! tunnel, and read its logs.

use anyhow::{bail, Result};
use cltunnel_ingress::{ExternalError, LogPaths, LogStream, ServiceSupervisor};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use crate::command::run;
use crate::descriptor::{self, DescriptorError, ProgramArguments};
use crate::paths::CliPaths;

const INSTALL_DOCS_URL: &str = "https://developers.cloudflare.com/cloudflare-one/connections/connect-apps/install-and-setup/installation/";

/// Platform type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOS,
    Linux,
    Unsupported,
}

impl Platform {
    /// Detect the current platform
    pub fn current() -> Self {
        #[cfg(target_os = "macos")]
        {
            Platform::MacOS
        }
        #[cfg(target_os = "linux")]
        {
            Platform::Linux
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            Platform::Unsupported
        }
    }
}

/// Supervisor for the platform this binary runs on
pub fn detect(paths: &CliPaths) -> Result<Box<dyn ServiceSupervisor>> {
    for_platform(Platform::current(), paths)
}

pub fn for_platform(platform: Platform, paths: &CliPaths) -> Result<Box<dyn ServiceSupervisor>> {
    match platform {
        Platform::MacOS => Ok(Box::new(LaunchdSupervisor::new(paths))),
        Platform::Linux => Ok(Box::new(SystemdSupervisor::new())),
        Platform::Unsupported => {
            bail!("Service management is not supported on this platform")
        }
    }
}

/// Point `paths` at the configuration file the supervised service loads
///
/// Editing any other file would leave the running tunnel unchanged. Without
/// an installed descriptor, or when it names no `--config`, `paths` is kept.
pub fn follow_service_config(
    paths: CliPaths,
    supervisor: &dyn ServiceSupervisor,
) -> Result<CliPaths> {
    match supervisor.service_config()? {
        Some(config) => {
            debug!(config = %config.display(), "Using configuration file of the service");
            Ok(paths.with_cloudflared_config(Some(config)))
        }
        None => Ok(paths),
    }
}

fn read_descriptor(path: &Path) -> Result<String, ExternalError> {
    fs::read_to_string(path).map_err(|e| {
        ExternalError::new(
            format!("read service file {}", path.display()),
            e.to_string(),
        )
    })
}

fn write_descriptor(path: &Path, contents: &str) -> Result<(), ExternalError> {
    fs::write(path, contents).map_err(|e| {
        ExternalError::new(
            format!("write service file {}", path.display()),
            e.to_string(),
        )
    })
}

fn descriptor_error(path: &Path, err: DescriptorError) -> ExternalError {
    ExternalError::new(
        format!("parse service file {}", path.display()),
        err.to_string(),
    )
}

fn tail_file(path: &Path, lines: usize) -> Result<String, ExternalError> {
    if !path.exists() {
        return Ok("No logs available".to_string());
    }

    let output = run(Command::new("tail")
        .arg("-n")
        .arg(lines.to_string())
        .arg(path))?;

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

// ============ macOS (launchd) ============

/// launchd user agent installed by cloudflared
pub struct LaunchdSupervisor {
    label: String,
    plist_path: PathBuf,
    logs: LogPaths,
}

impl LaunchdSupervisor {
    pub const LABEL: &'static str = "com.cloudflare.cloudflared";

    pub fn new(paths: &CliPaths) -> Self {
        let logs_dir = paths.user_logs_dir();
        Self {
            label: Self::LABEL.to_string(),
            plist_path: paths
                .launch_agents_dir()
                .join(format!("{}.plist", Self::LABEL)),
            logs: LogPaths {
                stdout: logs_dir.join(format!("{}.out.log", Self::LABEL)),
                stderr: logs_dir.join(format!("{}.err.log", Self::LABEL)),
            },
        }
    }

    /// `gui/<uid>`, the launchd domain of the logged in user
    fn gui_domain(&self) -> Result<String, ExternalError> {
        let output = run(Command::new("id").arg("-u"))?;
        let uid = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(format!("gui/{}", uid))
    }

    fn service_target(&self) -> Result<String, ExternalError> {
        Ok(format!("{}/{}", self.gui_domain()?, self.label))
    }

    fn arguments(&self) -> Result<ProgramArguments, ExternalError> {
        let plist = read_descriptor(&self.plist_path)?;
        descriptor::launchd_arguments(&plist).map_err(|e| descriptor_error(&self.plist_path, e))
    }
}

impl ServiceSupervisor for LaunchdSupervisor {
    fn descriptor_path(&self) -> PathBuf {
        self.plist_path.clone()
    }

    fn service_config(&self) -> Result<Option<PathBuf>, ExternalError> {
        if !self.plist_path.exists() {
            return Ok(None);
        }
        Ok(self.arguments()?.config_path())
    }

    fn restart(&self) -> Result<(), ExternalError> {
        let target = self.service_target()?;
        run(Command::new("launchctl").args(["kickstart", "-k", target.as_str()]))?;
        info!(service = %self.label, "Service restarted");
        Ok(())
    }

    fn stop(&self) -> Result<(), ExternalError> {
        run(Command::new("launchctl").args(["stop", self.label.as_str()]))?;
        info!(service = %self.label, "Service stopped");
        Ok(())
    }

    fn is_patched(&self, binary: &Path) -> Result<bool, ExternalError> {
        Ok(self.arguments()?.runs_tunnel(binary))
    }

    fn patch(&self, binary: &Path) -> Result<(), ExternalError> {
        let plist = read_descriptor(&self.plist_path)?;
        match descriptor::patch_launchd(&plist, binary)
            .map_err(|e| descriptor_error(&self.plist_path, e))?
        {
            Some(patched) => {
                write_descriptor(&self.plist_path, &patched)?;
                info!(path = %self.plist_path.display(), "Service file patched");
            }
            None => debug!(path = %self.plist_path.display(), "Service file already patched"),
        }
        Ok(())
    }

    fn reload_definition(&self) -> Result<(), ExternalError> {
        let domain = self.gui_domain()?;
        let target = format!("{}/{}", domain, self.label);

        // not loaded yet is fine
        if let Err(e) = run(Command::new("launchctl").args(["bootout", target.as_str()])) {
            warn!(error = %e, "launchctl bootout failed");
        }
        run(Command::new("launchctl")
            .args(["bootstrap", domain.as_str()])
            .arg(&self.plist_path))?;
        run(Command::new("launchctl").args(["kickstart", "-k", target.as_str()]))?;

        info!(service = %self.label, "Service definition reloaded");
        Ok(())
    }

    fn log_paths(&self) -> Option<LogPaths> {
        Some(self.logs.clone())
    }

    fn tail_logs(&self, stream: LogStream, lines: usize) -> Result<String, ExternalError> {
        let path = match stream {
            LogStream::Stderr => &self.logs.stderr,
            LogStream::Stdout => &self.logs.stdout,
        };
        tail_file(path, lines)
    }

    fn install_instructions(&self) -> Vec<String> {
        vec![
            "You can install it with brew:".to_string(),
            "  brew install cloudflared".to_string(),
            format!("Or visit the Cloudflare docs: {}", INSTALL_DOCS_URL),
        ]
    }
}

// ============ Linux (systemd) ============

/// System unit installed by `cloudflared service install`
pub struct SystemdSupervisor {
    unit: String,
    unit_path: PathBuf,
}

impl SystemdSupervisor {
    pub const UNIT: &'static str = "cloudflared";

    pub fn new() -> Self {
        Self::with_unit_path(
            Path::new("/etc/systemd/system").join(format!("{}.service", Self::UNIT)),
        )
    }

    pub fn with_unit_path(unit_path: impl Into<PathBuf>) -> Self {
        Self {
            unit: Self::UNIT.to_string(),
            unit_path: unit_path.into(),
        }
    }

    fn arguments(&self) -> Result<ProgramArguments, ExternalError> {
        let unit = read_descriptor(&self.unit_path)?;
        descriptor::systemd_arguments(&unit).map_err(|e| descriptor_error(&self.unit_path, e))
    }

    fn systemctl(&self, action: &str) -> Result<(), ExternalError> {
        run(Command::new("systemctl").args([action, self.unit.as_str()]))?;
        Ok(())
    }
}

impl Default for SystemdSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceSupervisor for SystemdSupervisor {
    fn descriptor_path(&self) -> PathBuf {
        self.unit_path.clone()
    }

    fn service_config(&self) -> Result<Option<PathBuf>, ExternalError> {
        if !self.unit_path.exists() {
            return Ok(None);
        }
        Ok(self.arguments()?.config_path())
    }

    fn restart(&self) -> Result<(), ExternalError> {
        self.systemctl("restart")?;
        info!(service = %self.unit, "Service restarted");
        Ok(())
    }

    fn stop(&self) -> Result<(), ExternalError> {
        self.systemctl("stop")?;
        info!(service = %self.unit, "Service stopped");
        Ok(())
    }

    fn is_patched(&self, binary: &Path) -> Result<bool, ExternalError> {
        Ok(self.arguments()?.runs_tunnel(binary))
    }

    fn patch(&self, binary: &Path) -> Result<(), ExternalError> {
        let unit = read_descriptor(&self.unit_path)?;
        match descriptor::patch_systemd(&unit, binary)
            .map_err(|e| descriptor_error(&self.unit_path, e))?
        {
            Some(patched) => {
                write_descriptor(&self.unit_path, &patched)?;
                info!(path = %self.unit_path.display(), "Service file patched");
            }
            None => debug!(path = %self.unit_path.display(), "Service file already patched"),
        }
        Ok(())
    }

    fn reload_definition(&self) -> Result<(), ExternalError> {
        run(Command::new("systemctl").arg("daemon-reload"))?;
        self.restart()
    }

    fn log_paths(&self) -> Option<LogPaths> {
        None
    }

    fn tail_logs(&self, stream: LogStream, lines: usize) -> Result<String, ExternalError> {
        // journald keeps both streams together
        debug!(stream = %stream, "Reading journal");
        let output = run(Command::new("journalctl")
            .arg("-u")
            .arg(&self.unit)
            .arg("-n")
            .arg(lines.to_string())
            .arg("--no-pager"))?;

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn install_instructions(&self) -> Vec<String> {
        vec![
            "Install it with your distribution's package manager, or download a release from:"
                .to_string(),
            "  https://github.com/cloudflare/cloudflared/releases".to_string(),
            format!("Or visit the Cloudflare docs: {}", INSTALL_DOCS_URL),
        ]
    }
}
