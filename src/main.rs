//! Telegram forwarder CLI - main entry point

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use telegram_forwarder::config::{Config, DEFAULT_BACKFILL_DELAY_SECS};
use telegram_forwarder::{commands, metrics};

#[derive(Parser)]
#[command(name = "telegram_forwarder")]
#[command(about = "Forward Telegram channel posts to a webhook", long_about = None)]
#[command(version)]
struct Cli {
    /// Address to expose Prometheus metrics (e.g., 0.0.0.0:9898)
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward new posts from the monitored channels (restarts on failure)
    Listen,

    /// Replay every reply to THREAD_MESSAGE_ID in each channel
    Backfill {
        /// Delay between records sent to the webhook, in seconds
        #[arg(long, default_value_t = DEFAULT_BACKFILL_DELAY_SECS)]
        delay: f64,
    },

    /// Interactive one-time login that writes the session file
    InitSession,
}

/// Log level comes from LOG_LEVEL unless RUST_LOG is set.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;
    init_tracing(&config.log_level);

    if let Some(addr) = cli.metrics_addr.as_deref() {
        match addr.parse::<SocketAddr>() {
            Ok(socket) => metrics::spawn_metrics_server(socket),
            Err(err) => warn!(%addr, "Invalid metrics address: {}", err),
        }
    }

    match cli.command {
        Commands::Listen => commands::listen::run(&config).await?,
        Commands::Backfill { delay } => {
            commands::scrape_thread::run(&config, delay).await?;
        }
        Commands::InitSession => commands::init_session::run(&config).await?,
    }

    Ok(())
}
