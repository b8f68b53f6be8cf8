//! Normalize, fetch media, deliver.
//!
//! Both controllers hand their logical posts to [`Forwarder`], which decides
//! the media count and request shape and records the outcome.

use tracing::debug;

use crate::album::AlbumBatch;
use crate::config::Config;
use crate::delivery::{DeliveryOutcome, WebhookClient};
use crate::error::Result;
use crate::media::{MediaFetcher, MediaItem};
use crate::message::IncomingMessage;
use crate::metrics;
use crate::record::DeliveryRecord;
use crate::source::MessageSource;

/// Record kinds used as the metrics label.
pub const KIND_SINGLE: &str = "single";
pub const KIND_ALBUM: &str = "album";
pub const KIND_THREAD: &str = "thread";

#[derive(Debug, Clone)]
pub struct Forwarder {
    webhook: WebhookClient,
    fetcher: MediaFetcher,
    fetch_media: bool,
}

impl Forwarder {
    /// `fetch_media` is true only for download enabled with multipart sending.
    pub fn new(webhook: WebhookClient, fetcher: MediaFetcher, fetch_media: bool) -> Self {
        Self {
            webhook,
            fetcher,
            fetch_media,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            WebhookClient::from_config(config)?,
            MediaFetcher::new(config.media_dir.clone(), config.media_max_mb),
            config.fetches_media(),
        ))
    }

    pub fn fetches_media(&self) -> bool {
        self.fetch_media
    }

    /// Live message without a group id.
    pub async fn forward_single<S>(
        &self,
        source: &S,
        channel: &str,
        message: &IncomingMessage,
    ) -> DeliveryOutcome
    where
        S: MessageSource + ?Sized,
    {
        let mut record = DeliveryRecord::from_message(channel, message);

        let outcome = if self.fetch_media && message.has_media() {
            let items = self.fetcher.fetch_all(source, std::slice::from_ref(message)).await;
            self.send_fetched(&mut record, &items).await
        } else {
            record.media_count = usize::from(message.has_media());
            self.webhook.send_json(&record).await
        };

        metrics::record_forwarded(KIND_SINGLE, outcome.delivered);
        outcome
    }

    /// Flushed live album. Empty batches produce nothing.
    pub async fn forward_album<S>(&self, source: &S, batch: &AlbumBatch) -> Option<DeliveryOutcome>
    where
        S: MessageSource + ?Sized,
    {
        let first = batch.first()?;
        let mut record = DeliveryRecord::from_album(&batch.channel, first);

        let outcome = if self.fetch_media {
            let items = self.fetcher.fetch_all(source, &batch.messages).await;
            self.send_fetched(&mut record, &items).await
        } else {
            record.media_count = batch.messages.len();
            self.webhook.send_json(&record).await
        };

        metrics::record_forwarded(KIND_ALBUM, outcome.delivered);
        Some(outcome)
    }

    /// Backfill batch (an album or a singleton) from a reply thread.
    pub async fn forward_thread_group<S>(
        &self,
        source: &S,
        channel: &str,
        thread_id: i32,
        messages: &[IncomingMessage],
    ) -> Option<DeliveryOutcome>
    where
        S: MessageSource + ?Sized,
    {
        let mut record = DeliveryRecord::from_thread_group(channel, thread_id, messages)?;

        let outcome = if self.fetch_media && record.has_media {
            let items = self.fetcher.fetch_all(source, messages).await;
            self.send_fetched(&mut record, &items).await
        } else {
            record.media_count = if record.has_media { messages.len() } else { 0 };
            self.webhook.send_json(&record).await
        };

        metrics::record_forwarded(KIND_THREAD, outcome.delivered);
        Some(outcome)
    }

    async fn send_fetched(
        &self,
        record: &mut DeliveryRecord,
        items: &[MediaItem],
    ) -> DeliveryOutcome {
        record.media_count = items.len();
        debug!(
            message_id = record.message_id,
            media_count = items.len(),
            "Fetched media for record"
        );
        self.webhook.send_with_files(record, items).await
    }
}
