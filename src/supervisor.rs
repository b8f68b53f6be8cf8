//! Restart loop around the live session.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Pause between a failed session and the next one
    pub cooldown: Duration,
    /// `None` restarts forever
    pub max_restarts: Option<u32>,
}

impl RestartPolicy {
    pub fn unbounded(cooldown: Duration) -> Self {
        Self {
            cooldown,
            max_restarts: None,
        }
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = Some(max_restarts);
        self
    }

    pub fn from_config(config: &Config) -> Self {
        Self::unbounded(config.restart_cooldown)
    }

    fn allows(&self, restarts: u32) -> bool {
        self.max_restarts.map_or(true, |max| restarts < max)
    }
}

/// Why the supervisor stopped.
#[derive(Debug)]
pub enum SupervisorExit {
    /// Shutdown token cancelled
    Interrupted,
    /// A session failed with an error no restart can fix
    Fatal(Error),
    /// `max_restarts` was reached; carries the last session error
    Exhausted { restarts: u32, last_error: Error },
}

/// Run `session` until `shutdown` is cancelled, restarting it after every failure.
///
/// Each session receives the token and is expected to wind down on its own
/// when it fires, so buffered work can be flushed. A session that returns
/// `Ok(())` without a shutdown is treated as a disconnect and restarted.
pub async fn run_supervised<F, Fut>(
    policy: RestartPolicy,
    mut session: F,
    shutdown: CancellationToken,
) -> SupervisorExit
where
    F: FnMut(u32, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut restarts = 0u32;

    loop {
        let result = session(restarts, shutdown.clone()).await;

        if shutdown.is_cancelled() {
            if let Err(err) = &result {
                warn!(error = %err, "Live session ended with an error during shutdown");
            }
            info!("Live session stopped");
            return SupervisorExit::Interrupted;
        }

        let err = match result {
            Ok(()) => Error::StreamClosed,
            Err(err) if err.is_fatal() => {
                error!(error = %err, "Live session failed permanently");
                return SupervisorExit::Fatal(err);
            }
            Err(err) => err,
        };

        if !policy.allows(restarts) {
            error!(restarts, error = %err, "Restart limit reached, giving up");
            return SupervisorExit::Exhausted {
                restarts,
                last_error: err,
            };
        }

        warn!(
            error = %err,
            cooldown_secs = policy.cooldown.as_secs_f64(),
            "Live session crashed, restarting"
        );

        tokio::select! {
            _ = sleep(policy.cooldown) => {}
            _ = shutdown.cancelled() => {
                info!("Shutdown requested during cooldown");
                return SupervisorExit::Interrupted;
            }
        }

        restarts += 1;
        metrics::record_session_restart();
    }
}

/// Token cancelled on SIGINT (Ctrl-C) or SIGTERM.
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Failed to install SIGTERM handler");
                    wait_for_ctrl_c().await;
                }
            }
        }

        #[cfg(not(unix))]
        wait_for_ctrl_c().await;

        trigger.cancel();
    });

    token
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, shutting down"),
        Err(err) => {
            warn!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn restarts_after_cooldown_until_limit() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let policy = RestartPolicy::unbounded(Duration::from_secs(5)).with_max_restarts(2);

        let start = tokio::time::Instant::now();
        let exit = run_supervised(
            policy,
            move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::TelegramError("disconnected".into())) }
            },
            CancellationToken::new(),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(exit, SupervisorExit::Exhausted { restarts: 2, .. }));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn clean_end_of_stream_is_restarted() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let policy = RestartPolicy::unbounded(Duration::from_secs(1)).with_max_restarts(1);

        let exit = run_supervised(
            policy,
            move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            CancellationToken::new(),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match exit {
            SupervisorExit::Exhausted { last_error, .. } => {
                assert!(matches!(last_error, Error::StreamClosed))
            }
            other => panic!("unexpected exit: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_stops_immediately() {
        let exit = run_supervised(
            RestartPolicy::unbounded(Duration::from_secs(5)),
            |_, _| async { Err(Error::Config("missing TG_API_ID".into())) },
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(exit, SupervisorExit::Fatal(Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lets_running_session_wind_down() {
        let shutdown = CancellationToken::new();
        let wound_down = Arc::new(AtomicU32::new(0));
        let flag = wound_down.clone();

        let supervised = tokio::spawn(run_supervised(
            RestartPolicy::unbounded(Duration::from_secs(5)),
            move |_, token| {
                let flag = flag.clone();
                async move {
                    token.cancelled().await;
                    flag.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(30)).await;
        shutdown.cancel();

        let exit = supervised.await.unwrap();
        assert!(matches!(exit, SupervisorExit::Interrupted));
        assert_eq!(wound_down.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_cooldown() {
        let shutdown = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let trigger = shutdown.clone();

        let exit = run_supervised(
            RestartPolicy::unbounded(Duration::from_secs(60)),
            move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                let trigger = trigger.clone();
                async move {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        trigger.cancel();
                    });
                    Err(Error::TelegramError("disconnected".into()))
                }
            },
            shutdown,
        )
        .await;

        assert!(matches!(exit, SupervisorExit::Interrupted));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unbounded_policy_always_allows() {
        let policy = RestartPolicy::unbounded(Duration::from_secs(5));
        assert!(policy.allows(u32::MAX - 1));
        assert!(!policy.with_max_restarts(0).allows(0));
    }
}
