//! OBELISK Indexer CLI
//!
//! Entry point for the indexer binary:
//! - `start` - run the service against a named network
//! - `version` - print version information

use clap::{ArgAction, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use obelisk_indexer::config::Settings;

/// OBELISK Event Indexer
#[derive(Parser, Debug)]
#[command(name = "obelisk-indexer")]
#[command(author, version, about, long_about = None)]
#[command(disable_help_flag = true)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Print help
    #[arg(long, action = ArgAction::HelpLong, global = true)]
    help: Option<bool>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the indexer
    Start {
        /// Network to index (e.g. blast, base)
        #[arg(short = 'n', long, env = "API_NETWORK")]
        network: String,

        /// API port
        #[arg(short = 'p', long)]
        port: Option<u16>,

        /// API host
        #[arg(short = 'h', long)]
        host: Option<String>,

        /// Log level (trace, debug, info, warn, error)
        #[arg(short = 'l', long)]
        level: Option<String>,

        /// Ingest by polling only; no WebSocket subscription
        #[arg(long)]
        disable_websocket: bool,

        /// Serve queries without ingesting
        #[arg(long)]
        readonly: bool,

        /// Confirmation window in blocks
        #[arg(short = 'm', long)]
        confirmation: Option<u64>,

        /// First block to index when the store is empty
        #[arg(short = 'f', long)]
        from_block: Option<u64>,

        /// Snapshot persistence interval in blocks
        #[arg(short = 'i', long)]
        interval: Option<u64>,

        /// Snapshot retention horizon in blocks
        #[arg(short = 'o', long)]
        outdated: Option<u64>,
    },

    /// Show version information
    Version,
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            network,
            port,
            host,
            level,
            disable_websocket,
            readonly,
            confirmation,
            from_block,
            interval,
            outdated,
        } => {
            let mut settings = Settings::load(&network)
                .map_err(|e| eyre::eyre!("failed to load configuration: {e}"))?;

            // CLI flags override files and environment.
            if let Some(port) = port {
                settings.api.port = port;
            }
            if let Some(host) = host {
                settings.api.host = host;
            }
            if let Some(level) = level {
                settings.logging.level = level;
            }
            if let Some(confirmation) = confirmation {
                settings.ingest.confirmation = confirmation;
            }
            if from_block.is_some() {
                settings.ingest.from_block = from_block;
            }
            if let Some(interval) = interval {
                settings.snapshot.interval = interval;
            }
            if let Some(outdated) = outdated {
                settings.snapshot.outdated = outdated;
            }
            settings.ingest.disable_websocket |= disable_websocket;
            settings.ingest.readonly |= readonly;

            init_tracing(&settings.logging.level, &settings.logging.format);

            if let Err(errors) = settings.validate() {
                for message in &errors {
                    error!(%message, "Invalid configuration");
                }
                eyre::bail!("invalid configuration ({} errors)", errors.len());
            }

            info!(
                version = obelisk_indexer::VERSION,
                network = %settings.network.name,
                "Starting OBELISK indexer"
            );

            let shutdown = CancellationToken::new();
            spawn_signal_handler(shutdown.clone());

            obelisk_indexer::app::run(settings, shutdown)
                .await
                .map_err(|e| eyre::eyre!("indexer failed: {e}"))?;
        }
        Commands::Version => {
            println!("obelisk-indexer {}", obelisk_indexer::VERSION);
        }
    }

    Ok(())
}

/// Cancel the shutdown token on SIGINT/SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received interrupt");
        }

        shutdown.cancel();
    });
}
