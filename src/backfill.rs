//! Thread backfill controller
//!
//! Replays every reply to an anchor message, oldest first, through the same
//! forwarding pipeline as live mode. A linear history carries no "this is one
//! album" signal, so albums are rebuilt positionally: consecutive messages
//! sharing a group id form one batch, and any change of group id (or a
//! message without one) closes the pending batch.
//!
//! No cursor is consulted; running it twice delivers everything twice.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::Result;
use crate::message::IncomingMessage;
use crate::pipeline::Forwarder;
use crate::source::MessageSource;

/// Positional album reconstruction over an oldest-first history.
#[derive(Debug, Default)]
pub struct AlbumReconstructor {
    current_group: Option<i64>,
    pending: Vec<IncomingMessage>,
}

impl AlbumReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next message; returns the batches completed by it, in order.
    pub fn push(&mut self, message: IncomingMessage) -> Vec<Vec<IncomingMessage>> {
        let mut ready = Vec::new();

        match message.grouped_id.filter(|gid| *gid != 0) {
            Some(gid) => {
                if self.current_group.is_some_and(|current| current != gid) {
                    ready.push(std::mem::take(&mut self.pending));
                }
                self.current_group = Some(gid);
                self.pending.push(message);
            }
            None => {
                if !self.pending.is_empty() {
                    ready.push(std::mem::take(&mut self.pending));
                }
                self.current_group = None;
                ready.push(vec![message]);
            }
        }

        ready
    }

    /// Trailing batch left at the end of the history.
    pub fn finish(&mut self) -> Option<Vec<IncomingMessage>> {
        self.current_group = None;
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// Totals for one backfill run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub records: usize,
    pub delivered: usize,
}

pub struct ThreadBackfill {
    forwarder: Forwarder,
    delay: Duration,
}

impl ThreadBackfill {
    /// `delay` follows every emitted record, delivered or not.
    pub fn new(forwarder: Forwarder, delay: Duration) -> Self {
        Self { forwarder, delay }
    }

    /// Replay the thread anchored at `thread_id` in each channel in turn.
    pub async fn run<S>(
        &self,
        source: &S,
        channels: &[String],
        thread_id: i32,
    ) -> Result<BackfillReport>
    where
        S: MessageSource + ?Sized,
    {
        let mut report = BackfillReport::default();

        for channel in channels {
            let channel = channel.trim_start_matches('@');
            info!(channel, thread_id, "Scraping thread");

            let history = source.thread_history(channel, thread_id).await?;
            let mut reconstructor = AlbumReconstructor::new();

            for message in history {
                for batch in reconstructor.push(message) {
                    self.emit(source, channel, thread_id, &batch, &mut report).await;
                }
            }
            if let Some(batch) = reconstructor.finish() {
                self.emit(source, channel, thread_id, &batch, &mut report).await;
            }

            info!(channel, thread_id, records = report.records, "Done thread");
        }

        Ok(report)
    }

    async fn emit<S>(
        &self,
        source: &S,
        channel: &str,
        thread_id: i32,
        batch: &[IncomingMessage],
        report: &mut BackfillReport,
    ) where
        S: MessageSource + ?Sized,
    {
        let Some(outcome) = self
            .forwarder
            .forward_thread_group(source, channel, thread_id, batch)
            .await
        else {
            return;
        };

        report.records += 1;
        if outcome.delivered {
            report.delivered += 1;
        } else {
            warn!(channel, message_id = batch[0].id, "Backfill record not delivered");
        }

        sleep(self.delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{RetryPolicy, WebhookClient};
    use crate::media::MediaFetcher;
    use crate::source::testing::ScriptedSource;
    use chrono::Utc;
    use httpmock::prelude::*;

    fn msg(id: i32, group: Option<i64>) -> IncomingMessage {
        let m = IncomingMessage::new(id, format!("reply {}", id), Utc::now());
        match group {
            Some(gid) => m.with_group(gid),
            None => m,
        }
    }

    fn ids(batches: &[Vec<IncomingMessage>]) -> Vec<Vec<i32>> {
        batches
            .iter()
            .map(|b| b.iter().map(|m| m.id).collect())
            .collect()
    }

    fn replay(messages: Vec<IncomingMessage>) -> Vec<Vec<i32>> {
        let mut reconstructor = AlbumReconstructor::new();
        let mut batches = Vec::new();
        for message in messages {
            batches.extend(reconstructor.push(message));
        }
        batches.extend(reconstructor.finish());
        ids(&batches)
    }

    #[test]
    fn consecutive_group_members_coalesce() {
        let batches = replay(vec![
            msg(1, None),
            msg(2, Some(7)),
            msg(3, Some(7)),
            msg(4, Some(8)),
            msg(5, Some(8)),
            msg(6, None),
        ]);
        assert_eq!(batches, vec![vec![1], vec![2, 3], vec![4, 5], vec![6]]);
    }

    #[test]
    fn trailing_batch_is_flushed_on_finish() {
        let batches = replay(vec![msg(1, None), msg(2, Some(7)), msg(3, Some(7))]);
        assert_eq!(batches, vec![vec![1], vec![2, 3]]);
    }

    #[test]
    fn interleaved_groups_split_positionally() {
        // Non-contiguous members of one group end up in separate batches.
        let batches = replay(vec![msg(1, Some(7)), msg(2, Some(8)), msg(3, Some(7))]);
        assert_eq!(batches, vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn empty_history_yields_nothing() {
        assert!(replay(Vec::new()).is_empty());
    }

    #[tokio::test]
    async fn run_delivers_each_batch_with_backfill_fields() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start_async().await;
        let hook = server.mock(|when, then| {
            when.method(POST).path("/hook").is_true(|req| {
                let body = String::from_utf8_lossy(req.body().as_ref());
                body.contains("\"mode\":\"bulk_thread_export\"")
                    && body.contains("\"thread_message_id\":1")
            });
            then.status(200);
        });

        let mut source = ScriptedSource::default();
        source.threads.insert(
            "news".into(),
            vec![msg(2, None), msg(3, Some(9)), msg(4, Some(9)), msg(5, None)],
        );

        let retry = RetryPolicy::new(1, Duration::ZERO);
        let webhook =
            WebhookClient::new(server.url("/hook"), Duration::from_secs(2), retry).unwrap();
        let backfill = ThreadBackfill::new(
            Forwarder::new(webhook, MediaFetcher::new(dir.path(), 20), false),
            Duration::from_millis(1),
        );

        let report = backfill
            .run(&source, &["@news".to_string(), "empty".to_string()], 1)
            .await
            .unwrap();

        assert_eq!(report, BackfillReport { records: 3, delivered: 3 });
        hook.assert_calls(3);
    }

    #[tokio::test]
    async fn delay_follows_failed_deliveries_too() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = ScriptedSource::default();
        source.threads.insert("news".into(), vec![msg(2, None), msg(3, None)]);

        let retry = RetryPolicy::new(1, Duration::ZERO);
        let webhook =
            WebhookClient::new("http://127.0.0.1:9/hook", Duration::from_secs(1), retry).unwrap();
        let backfill = ThreadBackfill::new(
            Forwarder::new(webhook, MediaFetcher::new(dir.path(), 20), false),
            Duration::from_millis(50),
        );

        let start = std::time::Instant::now();
        let report = backfill.run(&source, &["news".to_string()], 1).await.unwrap();

        assert_eq!(report, BackfillReport { records: 2, delivered: 0 });
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
