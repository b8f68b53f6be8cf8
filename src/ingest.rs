//! Live ingestion controller
//!
//! Consumes new-message events serially, drops anything at or below the
//! channel cursor, persists the cursor before any downstream work, then routes
//! grouped messages to the album aggregator and singletons straight to the
//! forwarding pipeline. Flushed albums come back from the sweeper over a
//! channel and are handled on the same loop.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::album::{AlbumAggregator, AlbumBatch, SWEEP_TICK};
use crate::config::Config;
use crate::cursor::CursorStore;
use crate::delivery::DeliveryOutcome;
use crate::error::Result;
use crate::metrics;
use crate::pipeline::Forwarder;
use crate::source::{ChannelMessage, MessageSource};

const ALBUM_QUEUE: usize = 64;

/// What happened to one live event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Id not newer than the stored cursor
    Duplicate,
    /// Handed to the album aggregator
    Buffered,
    Forwarded(DeliveryOutcome),
}

impl IngestOutcome {
    fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Duplicate => "duplicate",
            IngestOutcome::Buffered => "buffered",
            IngestOutcome::Forwarded(_) => "forwarded",
        }
    }
}

enum Step {
    Event(Result<Option<ChannelMessage>>),
    Album(AlbumBatch),
    Shutdown,
}

pub struct LiveIngestor {
    cursors: CursorStore,
    aggregator: AlbumAggregator,
    forwarder: Forwarder,
}

impl LiveIngestor {
    pub fn new(cursors: CursorStore, aggregator: AlbumAggregator, forwarder: Forwarder) -> Self {
        Self {
            cursors,
            aggregator,
            forwarder,
        }
    }

    /// Build from configuration, loading the cursor state once.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            CursorStore::open(config.state_backend, &config.state_file),
            AlbumAggregator::new(config.album_debounce),
            Forwarder::from_config(config)?,
        ))
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    pub fn aggregator(&self) -> &AlbumAggregator {
        &self.aggregator
    }

    /// Route one event.
    pub async fn handle<S>(&mut self, source: &S, event: ChannelMessage) -> IngestOutcome
    where
        S: MessageSource + ?Sized,
    {
        let outcome = self.route(source, event).await;
        metrics::record_event(outcome.label());
        outcome
    }

    async fn route<S>(&mut self, source: &S, event: ChannelMessage) -> IngestOutcome
    where
        S: MessageSource + ?Sized,
    {
        let ChannelMessage { channel, message } = event;
        let channel = channel.trim_start_matches('@').to_string();

        if !self.cursors.is_new(&channel, message.id) {
            debug!(
                channel = %channel,
                message_id = message.id,
                "Skipping already forwarded message"
            );
            return IngestOutcome::Duplicate;
        }

        if let Err(err) = self.cursors.advance(&channel, message.id).await {
            warn!(
                channel = %channel,
                message_id = message.id,
                error = %err,
                "Failed to persist cursor"
            );
        }

        match message.grouped_id {
            Some(group_id) if group_id != 0 => {
                self.aggregator.observe(group_id, &channel, message);
                IngestOutcome::Buffered
            }
            _ => {
                let outcome = self.forwarder.forward_single(source, &channel, &message).await;
                IngestOutcome::Forwarded(outcome)
            }
        }
    }

    async fn forward_batch<S>(&self, source: &S, batch: AlbumBatch)
    where
        S: MessageSource + ?Sized,
    {
        if let Some(outcome) = self.forwarder.forward_album(source, &batch).await {
            debug!(
                group_id = batch.group_id,
                channel = %batch.channel,
                delivered = outcome.delivered,
                attempts = outcome.attempts,
                "Album forwarded"
            );
        }
    }

    /// Run until the source ends or fails, or `shutdown` is cancelled.
    ///
    /// Albums still buffered when the loop stops are flushed before returning,
    /// whatever their age.
    pub async fn run<S>(&mut self, source: &mut S, shutdown: CancellationToken) -> Result<()>
    where
        S: MessageSource + ?Sized,
    {
        let (tx, mut rx) = mpsc::channel(ALBUM_QUEUE);
        let stop_sweeper = CancellationToken::new();
        let sweeper = self
            .aggregator
            .spawn_sweeper(SWEEP_TICK, tx, stop_sweeper.clone());
        info!(
            debounce_ms = self.aggregator.debounce().as_millis() as u64,
            "Live ingestion started"
        );

        let result = loop {
            let step = tokio::select! {
                _ = shutdown.cancelled() => Step::Shutdown,
                event = source.next_message() => Step::Event(event),
                Some(batch) = rx.recv() => Step::Album(batch),
            };

            match step {
                Step::Event(Ok(Some(event))) => {
                    self.handle(&*source, event).await;
                }
                Step::Event(Ok(None)) => {
                    info!("Update stream ended");
                    break Ok(());
                }
                Step::Event(Err(err)) => break Err(err),
                Step::Album(batch) => self.forward_batch(&*source, batch).await,
                Step::Shutdown => {
                    info!(pending_albums = self.aggregator.pending(), "Stopping live ingestion");
                    break Ok(());
                }
            }
        };

        // The sweeper finishes sending whatever it already popped, then drops
        // its sender, which closes the channel.
        stop_sweeper.cancel();
        while let Some(batch) = rx.recv().await {
            self.forward_batch(&*source, batch).await;
        }
        if let Err(err) = sweeper.await {
            warn!(error = %err, "Album sweeper task failed");
        }
        for batch in self.aggregator.drain() {
            metrics::record_album_flush(batch.messages.len());
            self.forward_batch(&*source, batch).await;
        }

        result
    }
}
