//! End-to-end tests against a fake cloudflared

use cltunnel_cli::{listing, CliPaths, Cloudflared, IdentityDocument, IdentityStore};
use cltunnel_ingress::{
    document, ExternalError, IngressRule, LogPaths, LogStream, Mutation, RollbackOutcome,
    ServiceSupervisor, ServiceTarget, TransactionCoordinator,
};
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const CONFIG: &str = "tunnel: 6ff42ae2-765d-4adf-8112-31c55c1551ef
credentials-file: /tmp/6ff42ae2.json
warp-routing:
  enabled: true
ingress:
  - hostname: a.example.com
    service: http://localhost:3000
  - service: http_status:404
";

/// Counts restarts instead of talking to a service manager
#[derive(Default)]
struct CountingSupervisor {
    restarts: Cell<usize>,
}

impl ServiceSupervisor for CountingSupervisor {
    fn descriptor_path(&self) -> PathBuf {
        PathBuf::from("/dev/null")
    }

    fn service_config(&self) -> Result<Option<PathBuf>, ExternalError> {
        Ok(None)
    }

    fn restart(&self) -> Result<(), ExternalError> {
        self.restarts.set(self.restarts.get() + 1);
        Ok(())
    }

    fn stop(&self) -> Result<(), ExternalError> {
        Ok(())
    }

    fn is_patched(&self, _binary: &Path) -> Result<bool, ExternalError> {
        Ok(true)
    }

    fn patch(&self, _binary: &Path) -> Result<(), ExternalError> {
        Ok(())
    }

    fn reload_definition(&self) -> Result<(), ExternalError> {
        Ok(())
    }

    fn log_paths(&self) -> Option<LogPaths> {
        None
    }

    fn tail_logs(&self, _stream: LogStream, _lines: usize) -> Result<String, ExternalError> {
        Ok(String::new())
    }

    fn install_instructions(&self) -> Vec<String> {
        Vec::new()
    }
}

struct Workspace {
    dir: TempDir,
    paths: CliPaths,
    cloudflared: Cloudflared,
}

impl Workspace {
    fn calls(&self) -> String {
        fs::read_to_string(self.dir.path().join("calls.log")).unwrap_or_default()
    }
}

/// Home directory with a cloudflared config and a fake cloudflared that
/// rejects any config mentioning `rejected.example.com`
#[cfg(unix)]
fn workspace() -> Workspace {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let paths = CliPaths::with_home(dir.path());
    fs::create_dir_all(paths.cloudflared_config.parent().unwrap()).unwrap();
    fs::write(&paths.cloudflared_config, CONFIG).unwrap();

    let binary = dir.path().join("cloudflared");
    let script = format!(
        r#"#!/bin/sh
echo "$@" >> '{calls}'
if [ "$1" = "--config" ] && grep -q rejected.example.com "$2"; then
  echo "Validating rules from $2"
  echo "error: hostname rejected.example.com is not allowed" >&2
  exit 1
fi
exit 0
"#,
        calls = dir.path().join("calls.log").display()
    );
    fs::write(&binary, script).unwrap();
    fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();

    Workspace {
        cloudflared: Cloudflared::new(binary),
        paths,
        dir,
    }
}

fn add(hostname: &str, port: u16) -> Mutation {
    Mutation::add(
        IngressRule::for_host(hostname, ServiceTarget::local_port(port)),
        false,
    )
}

#[cfg(unix)]
#[test]
fn test_add_with_cloudflared() {
    let ws = workspace();
    let supervisor = CountingSupervisor::default();
    let coordinator = TransactionCoordinator::new(
        &ws.paths.cloudflared_config,
        &ws.cloudflared,
        &ws.cloudflared,
        &supervisor,
    );

    coordinator.execute(add("b.example.com", 4000)).unwrap();

    let calls = ws.calls();
    let lines: Vec<_> = calls.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with("tunnel ingress validate"));
    assert_eq!(
        lines[1],
        "tunnel route dns 6ff42ae2-765d-4adf-8112-31c55c1551ef b.example.com"
    );
    assert_eq!(supervisor.restarts.get(), 1);

    let written = fs::read_to_string(&ws.paths.cloudflared_config).unwrap();
    assert!(written.contains("warp-routing"));
    let (_, doc) = document::load(&ws.paths.cloudflared_config).unwrap();
    let hostnames: Vec<_> = doc.ingress.iter().map(|r| r.hostname.as_deref()).collect();
    assert_eq!(
        hostnames,
        vec![Some("a.example.com"), Some("b.example.com"), None]
    );

    let identity = IdentityDocument::new("example.com").unwrap();
    let names: Vec<_> = listing::rows(&identity, &doc)
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[cfg(unix)]
#[test]
fn test_rejected_config_is_rolled_back() {
    let ws = workspace();
    let supervisor = CountingSupervisor::default();
    let coordinator = TransactionCoordinator::new(
        &ws.paths.cloudflared_config,
        &ws.cloudflared,
        &ws.cloudflared,
        &supervisor,
    );

    let err = coordinator
        .execute(add("rejected.example.com", 4000))
        .unwrap_err();

    assert!(matches!(err.rollback, RollbackOutcome::Restored));
    assert!(err
        .to_string()
        .contains("error: hostname rejected.example.com is not allowed"));
    assert_eq!(
        fs::read_to_string(&ws.paths.cloudflared_config).unwrap(),
        CONFIG
    );
    assert_eq!(supervisor.restarts.get(), 0);
    assert!(!ws.calls().contains("route dns"));
}

#[cfg(unix)]
#[test]
fn test_remove_with_cloudflared() {
    let ws = workspace();
    let supervisor = CountingSupervisor::default();
    let coordinator = TransactionCoordinator::new(
        &ws.paths.cloudflared_config,
        &ws.cloudflared,
        &ws.cloudflared,
        &supervisor,
    );

    coordinator
        .execute(Mutation::remove("a.example.com"))
        .unwrap();

    assert!(!ws.calls().contains("route dns"));
    let (_, doc) = document::load(&ws.paths.cloudflared_config).unwrap();
    assert_eq!(doc.ingress.len(), 1);
    assert_eq!(supervisor.restarts.get(), 1);
}

fn cl_tunnel(home: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_cl-tunnel"));
    command
        .env("HOME", home)
        .env_remove("CL_TUNNEL_CLOUDFLARED_CONFIG")
        .env_remove("RUST_LOG");
    command
}

#[cfg(unix)]
#[test]
fn test_init_writes_identity() {
    let dir = TempDir::new().unwrap();

    let output = cl_tunnel(dir.path())
        .args(["init", "example.com"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let store = IdentityStore::new(CliPaths::with_home(dir.path()).identity_file);
    assert_eq!(
        store.load().unwrap(),
        Some(IdentityDocument::new("example.com").unwrap())
    );
}

#[cfg(unix)]
#[test]
fn test_init_rejects_bad_domain() {
    let dir = TempDir::new().unwrap();

    let output = cl_tunnel(dir.path())
        .args(["init", "--", "-bad-"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid domain"));
    assert!(!CliPaths::with_home(dir.path()).identity_file.exists());
}
