//! cl-tunnel - map local ports to public hostnames through a cloudflared tunnel

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cltunnel_cli::{listing, service, CliPaths, Cloudflared, IdentityDocument, IdentityStore};
use cltunnel_ingress::{
    document, validate_new_entry, validate_subdomain, IngressDocument, IngressRule, LogStream,
    Mutation, ServiceSupervisor, ServiceTarget, TransactionCoordinator, TransactionError,
};

/// Exit status when a rollback failed and the user has to step in
const EXIT_ROLLBACK_FAILED: u8 = 2;

/// cl-tunnel - Expose local ports under your domain with cloudflared
#[derive(Parser, Debug)]
#[command(name = "cl-tunnel")]
#[command(about = "Manage cloudflared ingress rules for local development", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path of the cloudflared configuration file
    #[arg(long, global = true, env = "CL_TUNNEL_CLOUDFLARED_CONFIG")]
    cloudflared_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Save the base domain new subdomains are created under
    Init {
        /// Base domain, e.g. example.com
        domain: String,
    },
    /// Route <subdomain>.<domain> to a local port
    Add {
        subdomain: String,
        /// Local port to expose
        port: String,
        /// Replace an existing rule for the same hostname
        #[arg(short, long)]
        force: bool,
    },
    /// Remove the ingress rule for <subdomain>.<domain>
    Remove { subdomain: String },
    /// List ingress rules
    List,
    /// Show the cl-tunnel configuration
    Config,
    /// Install the cloudflared service and patch it to run the tunnel
    InstallService,
    /// Stop and uninstall the cloudflared service
    RemoveService,
    /// Tail cloudflared tunnel logs
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
        /// Stream to read; cloudflared logs everything to err by default
        #[arg(long, value_enum, default_value_t = StreamArg::Err)]
        stream: StreamArg,
    },
    /// Restart the cloudflared tunnel
    Restart,
    /// Stop the cloudflared tunnel
    Stop,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StreamArg {
    Err,
    Out,
}

impl From<StreamArg> for LogStream {
    fn from(stream: StreamArg) -> Self {
        match stream {
            StreamArg::Err => LogStream::Stderr,
            StreamArg::Out => LogStream::Stdout,
        }
    }
}

/// Everything commands need once cloudflared is known to be set up
struct Setup {
    paths: CliPaths,
    cloudflared: Cloudflared,
    supervisor: Box<dyn ServiceSupervisor>,
    document: IngressDocument,
    identity: IdentityDocument,
}

impl Setup {
    fn coordinator(&self) -> TransactionCoordinator<'_> {
        TransactionCoordinator::new(
            &self.paths.cloudflared_config,
            &self.cloudflared,
            &self.cloudflared,
            self.supervisor.as_ref(),
        )
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("❌ {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(&e),
    }
}

/// Print the error and pick the exit status
fn report(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<TransactionError>() {
        Some(tx) => {
            // already includes its cause and the rollback outcome
            eprintln!("❌ {}", tx);
            if tx.rollback_failed() {
                ExitCode::from(EXIT_ROLLBACK_FAILED)
            } else {
                ExitCode::FAILURE
            }
        }
        None => {
            eprintln!("❌ {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_given = cli.cloudflared_config.is_some();
    let paths = CliPaths::discover()?.with_cloudflared_config(cli.cloudflared_config);
    debug!(?paths, "Resolved paths");

    match cli.command {
        Commands::Init { domain } => handle_init(&paths, &domain),
        Commands::InstallService => handle_install_service(&paths),
        Commands::RemoveService => handle_remove_service(&paths),
        Commands::Add {
            subdomain,
            port,
            force,
        } => handle_add(&check_setup(paths, config_given)?, &subdomain, &port, force),
        Commands::Remove { subdomain } => {
            handle_remove(&check_setup(paths, config_given)?, &subdomain)
        }
        Commands::List => handle_list(&check_setup(paths, config_given)?),
        Commands::Config => handle_config(&check_setup(paths, config_given)?),
        Commands::Logs { lines, stream } => {
            handle_logs(&check_setup(paths, config_given)?, stream.into(), lines)
        }
        Commands::Restart => handle_restart(&check_setup(paths, config_given)?),
        Commands::Stop => handle_stop(&check_setup(paths, config_given)?),
    }
}

/// Verify cloudflared, its configuration and the identity document
///
/// Unless `config_given`, the configuration edited is the one the installed
/// service is started with.
fn check_setup(paths: CliPaths, config_given: bool) -> Result<Setup> {
    let supervisor = service::detect(&paths)?;
    let paths = if config_given {
        paths
    } else {
        service::follow_service_config(paths, supervisor.as_ref())?
    };

    let Some(cloudflared) = Cloudflared::locate() else {
        eprintln!("cloudflared is not installed. Please install it before using this tool");
        for line in supervisor.install_instructions() {
            println!("{}", line);
        }
        bail!("cloudflared not found on PATH");
    };

    let document = match document::load(&paths.cloudflared_config) {
        Ok((_, document)) => document,
        Err(e) => {
            eprintln!("Failed to get cloudflared config: {}", e);
            print_tunnel_setup_help();
            bail!("cloudflared is not set up");
        }
    };

    let store = IdentityStore::new(&paths.identity_file);
    let identity = match store.load() {
        Ok(Some(identity)) => identity,
        Ok(None) => {
            eprintln!("CLI config file does not exist");
            println!("Please run: cl-tunnel init <domain>");
            bail!("cl-tunnel is not initialized");
        }
        Err(e) => {
            eprintln!("Failed to get CLI config: {:#}", e);
            println!("Please run: cl-tunnel init <domain>");
            bail!("cl-tunnel is not initialized");
        }
    };

    Ok(Setup {
        paths,
        cloudflared,
        supervisor,
        document,
        identity,
    })
}

fn print_tunnel_setup_help() {
    println!("Make sure to properly setup cloudflared tunnel before using this tool:");
    println!("1. Run `cloudflared tunnel login` to login to your cloudflare account");
    println!("2. Run `cloudflared tunnel create <tunnel-name>` to create a new tunnel. You can name it whatever you want, like: local-dev-mac-tunnel");
    println!();
    println!("This will authenticate cloudflared with your account, create a new tunnel, and write a config file to ~/.cloudflared/config.yml");
    println!();
    println!("Then you can start using this tool");
}

fn handle_init(paths: &CliPaths, domain: &str) -> Result<()> {
    println!("Initializing CLI configuration with domain: {}", domain);

    let identity = IdentityDocument::new(domain)?;
    let store = IdentityStore::new(&paths.identity_file);
    store.save(&identity)?;

    println!("✅ Configuration written to: {}", store.path().display());
    println!("{}", store.read_raw()?);
    Ok(())
}

fn handle_add(setup: &Setup, subdomain: &str, port: &str, force: bool) -> Result<()> {
    let entry = validate_new_entry(subdomain, port)?;
    let hostname = setup.identity.hostname(&entry.subdomain);
    println!("Adding mapping: {} -> localhost:{}", hostname, entry.port);

    let rule = IngressRule::for_host(hostname.clone(), ServiceTarget::local_port(entry.port));
    let receipt = setup.coordinator().execute(Mutation::add(rule, force))?;
    debug!(states = ?receipt.states, "Transaction committed");

    println!("✅ Ingress rule for {} added: https://{}", subdomain, hostname);
    Ok(())
}

fn handle_remove(setup: &Setup, subdomain: &str) -> Result<()> {
    validate_subdomain(subdomain)?;
    let hostname = setup.identity.hostname(subdomain);
    println!("Removing mapping for: {}", hostname);

    setup.coordinator().execute(Mutation::remove(&hostname))?;

    println!("✅ Ingress rule for {} removed", subdomain);
    println!("   The DNS route for {} is left in place", hostname);
    Ok(())
}

fn handle_list(setup: &Setup) -> Result<()> {
    let rows = listing::rows(&setup.identity, &setup.document);
    if rows.is_empty() {
        println!("No ingress rules configured");
        println!("Add one with: cl-tunnel add <subdomain> <port>");
        return Ok(());
    }

    println!("{}", listing::render(&rows));
    Ok(())
}

fn handle_config(setup: &Setup) -> Result<()> {
    let store = IdentityStore::new(&setup.paths.identity_file);
    println!("{}", store.path().display());
    println!("{}", store.read_raw()?);
    Ok(())
}

fn handle_install_service(paths: &CliPaths) -> Result<()> {
    let supervisor = service::detect(paths)?;
    let Some(cloudflared) = Cloudflared::locate() else {
        for line in supervisor.install_instructions() {
            println!("{}", line);
        }
        bail!("cloudflared is not installed");
    };

    println!("Installing cloudflared service...");
    cloudflared
        .service_install()
        .context("Failed to install service")?;
    println!("✅ Service installed");

    let descriptor = supervisor.descriptor_path();
    if !descriptor.exists() {
        bail!("Service file not found at: {}", descriptor.display());
    }

    println!("Found cloudflared binary at: {}", cloudflared.binary().display());
    println!("Patching service file at: {}", descriptor.display());

    if supervisor.is_patched(cloudflared.binary())? {
        println!("Service file already patched");
    } else {
        supervisor.patch(cloudflared.binary())?;
        println!("✅ Service file patched");
        println!("Reloading cloudflared service definition...");
        supervisor.reload_definition()?;
    }

    println!("✅ Service restarted");
    Ok(())
}

fn handle_remove_service(paths: &CliPaths) -> Result<()> {
    let supervisor = service::detect(paths)?;
    let cloudflared = Cloudflared::locate().context("cloudflared is not installed")?;

    println!("Stopping cloudflared service...");
    if let Err(e) = supervisor.stop() {
        warn!(error = %e, "Failed to stop service");
    }

    println!("Removing cloudflared service...");
    cloudflared
        .service_uninstall()
        .context("Failed to remove service")?;

    println!("✅ Service removed");
    Ok(())
}

fn handle_logs(setup: &Setup, stream: LogStream, lines: usize) -> Result<()> {
    match setup.supervisor.log_paths() {
        Some(logs) => {
            let path = match stream {
                LogStream::Stderr => logs.stderr,
                LogStream::Stdout => logs.stdout,
            };
            println!("Reading logs from: {}", path.display());
        }
        None => println!("Reading logs from the system journal"),
    }

    let output = setup.supervisor.tail_logs(stream, lines)?;
    print!("{}", output);
    Ok(())
}

fn handle_restart(setup: &Setup) -> Result<()> {
    println!("Restarting cloudflared tunnel...");
    setup
        .supervisor
        .restart()
        .context("Failed to restart cloudflared tunnel")?;
    println!("✅ Cloudflared tunnel restarted");
    Ok(())
}

fn handle_stop(setup: &Setup) -> Result<()> {
    println!("Stopping cloudflared tunnel...");
    setup
        .supervisor
        .stop()
        .context("Failed to stop cloudflared tunnel")?;
    println!("✅ Cloudflared tunnel stopped");
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_add() {
        let cli = Cli::try_parse_from(["cl-tunnel", "add", "api", "3000", "--force"]).unwrap();
        match cli.command {
            Commands::Add {
                subdomain,
                port,
                force,
            } => {
                assert_eq!(subdomain, "api");
                assert_eq!(port, "3000");
                assert!(force);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_logs_defaults() {
        let cli = Cli::try_parse_from(["cl-tunnel", "logs"]).unwrap();
        match cli.command {
            Commands::Logs { lines, stream } => {
                assert_eq!(lines, 50);
                assert!(matches!(stream, StreamArg::Err));
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::try_parse_from(["cl-tunnel", "logs", "-n", "10", "--stream", "out"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Logs {
                lines: 10,
                stream: StreamArg::Out
            }
        ));
    }

    #[test]
    fn test_config_override_flag() {
        let cli = Cli::try_parse_from([
            "cl-tunnel",
            "list",
            "--cloudflared-config",
            "/tmp/config.yml",
        ])
        .unwrap();
        assert_eq!(cli.cloudflared_config, Some(PathBuf::from("/tmp/config.yml")));
    }
}
