//! Thread backfill binary.
//!
//! Example:
//!   cargo run --bin scrape_thread -- --delay 1.5

use clap::Parser;
use telegram_forwarder::commands::scrape_thread;
use telegram_forwarder::config::DEFAULT_BACKFILL_DELAY_SECS;
use telegram_forwarder::Config;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scrape_thread")]
#[command(about = "Send every reply of THREAD_MESSAGE_ID to the webhook")]
struct Args {
    /// Delay between messages sent to the webhook, in seconds
    #[arg(long, default_value_t = DEFAULT_BACKFILL_DELAY_SECS)]
    delay: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let report = scrape_thread::run(&config, args.delay).await?;
    println!("Sent {}/{} records", report.delivered, report.records);
    Ok(())
}
