//! flotillad: the Flotilla daemon.
//!
//! # Usage
//!
//! ```text
//! flotillad run --config /etc/flotilla/flotillad.toml --data-dir /var/lib/flotilla
//! flotillad default-config > flotillad.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flotillad::{DaemonConfig, LogConfig, LogFormat, Manager, Overrides, open_store};

#[derive(Parser)]
#[command(name = "flotillad", about = "Flotilla progressive delivery daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane until interrupted.
    Run {
        /// Path to flotillad.toml. Missing file means defaults.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Keep state in memory only.
        #[arg(long)]
        in_memory: bool,

        /// Concurrent reconcile passes per controller.
        #[arg(long)]
        workers: Option<usize>,

        /// Seconds between full resyncs.
        #[arg(long)]
        resync_secs: Option<u64>,

        /// Emit JSON log lines.
        #[arg(long)]
        json_logs: bool,
    },
    /// Print the default configuration file.
    DefaultConfig,
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log.filter()));
    match log.format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            in_memory,
            workers,
            resync_secs,
            json_logs,
        } => {
            let overrides = Overrides {
                data_dir,
                in_memory,
                workers,
                resync_secs,
                json_logs,
            };
            let config = DaemonConfig::load(config.as_deref())?.apply(&overrides);
            init_tracing(&config.log);
            run(config).await
        }
        Command::DefaultConfig => {
            print!("{}", DaemonConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("flotilla daemon starting");

    let store = open_store(&config.store)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start controllers ──────────────────────────────────────

    info!(
        workers = config.controller.workers,
        resync_secs = config.controller.resync_interval_secs,
        "starting controllers"
    );
    let manager = tokio::spawn(Manager::new(store, config.controller.clone()).run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    manager.await?;
    info!("flotilla daemon stopped");
    Ok(())
}
