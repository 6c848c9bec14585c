mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tyger_install::{InstallError, log_error};

#[derive(Parser)]
#[command(name = "tyger-install")]
#[command(about = "Install and uninstall Tyger cloud environments", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the Azure resources of a Tyger environment
    Cloud {
        #[command(subcommand)]
        command: CloudCommands,
    },
    /// Validate a configuration file without touching the cloud
    Validate {
        /// Path to the configuration file
        #[arg(short = 'f', long = "file", env = "TYGER_INSTALL_CONFIG")]
        file: PathBuf,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum CloudCommands {
    /// Install the shared resources and the organizations
    Install {
        /// Path to the configuration file
        #[arg(short = 'f', long = "file", env = "TYGER_INSTALL_CONFIG")]
        file: PathBuf,
        /// Organization to install (repeatable, default: all)
        #[arg(long = "org")]
        orgs: Vec<String>,
        /// Only install organization resources
        #[arg(long)]
        skip_shared: bool,
    },
    /// Remove organizations, or the whole environment with --all
    Uninstall {
        /// Path to the configuration file
        #[arg(short = 'f', long = "file", env = "TYGER_INSTALL_CONFIG")]
        file: PathBuf,
        /// Organization to uninstall (repeatable, default: all)
        #[arg(long = "org", conflicts_with = "all")]
        orgs: Vec<String>,
        /// Also remove clusters, the database server and the shared resource group
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());

    let result = match cli.command {
        Commands::Version => {
            println!("tyger-install {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Validate { file } => commands::validate::handle(&file),
        Commands::Cloud {
            command:
                CloudCommands::Install {
                    file,
                    orgs,
                    skip_shared,
                },
        } => commands::install::handle(&token, &file, &orgs, skip_shared).await,
        Commands::Cloud {
            command: CloudCommands::Uninstall { file, orgs, all },
        } => commands::uninstall::handle(&token, &file, &orgs, all).await,
    };

    match result {
        Ok(()) => Ok(()),
        Err(InstallError::AlreadyLogged) => std::process::exit(1),
        Err(InstallError::Cancelled) => {
            eprintln!("{}", "Canceled".yellow());
            std::process::exit(1);
        }
        Err(err) => {
            log_error(&err, "");
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr; `RUST_LOG` overrides the default level
fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info"),
    };
    let filter = if verbose {
        filter.add_directive(tracing::Level::DEBUG.into())
    } else {
        filter
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))
}

/// Cancel `token` on Ctrl+C or SIGTERM
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        tracing::warn!("Canceling...");
        token.cancel();
    });
}
