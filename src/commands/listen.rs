//! Live forwarding under the restart supervisor.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::ingest::LiveIngestor;
use crate::session::{get_client, SessionLock};
use crate::supervisor::{install_signal_handler, run_supervised, RestartPolicy, SupervisorExit};
use crate::telegram::TelegramSource;

/// One connect-subscribe-ingest cycle.
async fn live_session(config: &Config, attempt: u32, shutdown: CancellationToken) -> Result<()> {
    if attempt > 0 {
        info!(attempt, "Restarting live session");
    }

    let connect = async {
        let client = get_client(config).await?;
        TelegramSource::connect(client, &config.channels).await
    };
    let mut source = tokio::select! {
        source = connect => source?,
        _ = shutdown.cancelled() => return Ok(()),
    };

    let mut ingestor = LiveIngestor::from_config(config)?;
    ingestor.run(&mut source, shutdown).await
}

pub async fn run(config: &Config) -> Result<()> {
    let _lock = SessionLock::acquire(config.lock_file())?;
    let shutdown = install_signal_handler();

    info!(
        channels = %config.channels.join(","),
        webhook = %config.webhook_url,
        media_download = config.media_download,
        "Listening"
    );

    let exit = run_supervised(
        RestartPolicy::from_config(config),
        |attempt, token| live_session(config, attempt, token),
        shutdown,
    )
    .await;

    match exit {
        SupervisorExit::Interrupted => Ok(()),
        SupervisorExit::Fatal(err) => Err(err),
        SupervisorExit::Exhausted { last_error, .. } => Err(last_error),
    }
}
