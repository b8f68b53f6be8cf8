//! Upstream message source contract
//!
//! The forwarding core never talks to a chat client directly; the live and
//! backfill controllers drive anything implementing [`MessageSource`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Result;
use crate::message::IncomingMessage;

/// A new message event tagged with the channel handle it belongs to.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    /// Channel handle without a leading `@`
    pub channel: String,
    pub message: IncomingMessage,
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Next new-message event from a monitored channel, delivered serially.
    /// `Ok(None)` means the stream ended.
    async fn next_message(&mut self) -> Result<Option<ChannelMessage>>;

    /// Every message replying to `thread_id` in `channel`, oldest first.
    async fn thread_history(&self, channel: &str, thread_id: i32) -> Result<Vec<IncomingMessage>>;

    /// Download the media of `message` into `dir`, returning the written path.
    /// `Ok(None)` when the transfer produced no file.
    async fn download_media(&self, message: &IncomingMessage, dir: &Path)
        -> Result<Option<PathBuf>>;
}
