//! Replay a reply thread to the webhook.

use std::time::Duration;

use tracing::info;

use crate::backfill::{BackfillReport, ThreadBackfill};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pipeline::Forwarder;
use crate::session::{get_client, SessionLock};
use crate::telegram::TelegramSource;

pub async fn run(config: &Config, delay_secs: f64) -> Result<BackfillReport> {
    let thread_id = config
        .thread_message_id
        .ok_or_else(|| Error::Config("THREAD_MESSAGE_ID is not set".into()))?;
    let delay = Duration::try_from_secs_f64(delay_secs)
        .map_err(|_| Error::InvalidArgument(format!("invalid delay: {}", delay_secs)))?;

    let _lock = SessionLock::acquire(config.lock_file())?;
    let client = get_client(config).await?;
    let source = TelegramSource::connect(client, &config.channels).await?;

    let backfill = ThreadBackfill::new(Forwarder::from_config(config)?, delay);
    let report = backfill.run(&source, &config.channels, thread_id).await?;

    info!(
        thread_id,
        records = report.records,
        delivered = report.delivered,
        "Thread backfill finished"
    );
    Ok(report)
}
