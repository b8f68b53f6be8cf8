//! Album aggregation
//!
//! Messages sharing a group id are buffered until no new member has arrived
//! for the debounce interval, then popped as one [`AlbumBatch`]. The buffer
//! map sits behind a mutex so popping a buffer and appending to it are
//! mutually exclusive; the lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::message::IncomingMessage;
use crate::metrics;

/// Fixed sweep tick.
pub const SWEEP_TICK: Duration = Duration::from_secs(1);

/// A completed album ready for normalization.
#[derive(Debug, Clone)]
pub struct AlbumBatch {
    pub group_id: i64,
    pub channel: String,
    /// Members in arrival order
    pub messages: Vec<IncomingMessage>,
}

impl AlbumBatch {
    pub fn first(&self) -> Option<&IncomingMessage> {
        self.messages.first()
    }
}

#[derive(Debug)]
struct AlbumBuffer {
    messages: Vec<IncomingMessage>,
    last_update: Instant,
}

// Group ids are unique per channel, so the channel is part of the key.
type AlbumKey = (String, i64);

/// Debouncing buffer store shared by the event handler and the sweeper.
#[derive(Debug, Clone)]
pub struct AlbumAggregator {
    buffers: Arc<Mutex<HashMap<AlbumKey, AlbumBuffer>>>,
    debounce: Duration,
}

impl AlbumAggregator {
    pub fn new(debounce: Duration) -> Self {
        Self {
            buffers: Arc::new(Mutex::new(HashMap::new())),
            debounce,
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AlbumKey, AlbumBuffer>> {
        self.buffers.lock().unwrap_or_else(|poisoned| {
            warn!("Album buffer lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Append `message` to its group's buffer, creating it if needed.
    pub fn observe(&self, group_id: i64, channel: &str, message: IncomingMessage) {
        self.observe_at(group_id, channel, message, Instant::now());
    }

    pub fn observe_at(&self, group_id: i64, channel: &str, message: IncomingMessage, now: Instant) {
        let mut buffers = self.lock();
        let buffer = buffers
            .entry((channel.to_string(), group_id))
            .or_insert_with(|| AlbumBuffer {
                messages: Vec::new(),
                last_update: now,
            });
        buffer.messages.push(message);
        buffer.last_update = now;
        debug!(group_id, channel, members = buffer.messages.len(), "Buffered album member");
    }

    /// Pop every buffer quiet for at least the debounce interval.
    pub fn take_expired(&self, now: Instant) -> Vec<AlbumBatch> {
        let debounce = self.debounce;
        self.take_where(|buffer| now.saturating_duration_since(buffer.last_update) >= debounce)
    }

    /// Pop every buffer regardless of age.
    pub fn drain(&self) -> Vec<AlbumBatch> {
        self.take_where(|_| true)
    }

    fn take_where<F>(&self, ready: F) -> Vec<AlbumBatch>
    where
        F: Fn(&AlbumBuffer) -> bool,
    {
        let mut buffers = self.lock();
        let keys: Vec<AlbumKey> = buffers
            .iter()
            .filter(|(_, buffer)| ready(buffer))
            .map(|(key, _)| key.clone())
            .collect();

        let mut batches: Vec<AlbumBatch> = keys
            .into_iter()
            .filter_map(|key| {
                let buffer = buffers.remove(&key)?;
                let (channel, group_id) = key;
                Some(AlbumBatch {
                    group_id,
                    channel,
                    messages: buffer.messages,
                })
            })
            .collect();
        drop(buffers);

        batches.sort_by_key(|batch| batch.first().map(|m| m.id).unwrap_or_default());
        batches
    }

    /// Number of albums still buffering.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Spawn the periodic sweep, sending flushed albums to `tx`.
    ///
    /// `stop` is only checked between ticks: once a sweep has popped its
    /// batches they are all sent before the task ends, and dropping `tx`
    /// closes the channel. The task also ends when the receiver is dropped.
    pub fn spawn_sweeper(
        &self,
        tick: Duration,
        tx: mpsc::Sender<AlbumBatch>,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let aggregator = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                for batch in aggregator.take_expired(Instant::now()) {
                    metrics::record_album_flush(batch.messages.len());
                    debug!(
                        group_id = batch.group_id,
                        channel = %batch.channel,
                        members = batch.messages.len(),
                        "Flushing album"
                    );
                    if tx.send(batch).await.is_err() {
                        return;
                    }
                }
            }
        })
    }
}
