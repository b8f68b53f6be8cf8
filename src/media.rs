//! Media fetcher with a per-file size ceiling
//!
//! Every failure path degrades to [`MediaOutcome::Declined`]; nothing here
//! returns an error to the caller.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::message::IncomingMessage;
use crate::metrics;
use crate::source::MessageSource;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Metadata of one downloaded attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub file_path: PathBuf,
    pub filename: String,
    pub mimetype: Option<String>,
    pub filesize: u64,
}

/// Why no media item was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    NoMedia,
    DeclaredTooLarge,
    TransferFailed,
    NoFile,
    TooLarge,
}

impl DeclineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeclineReason::NoMedia => "no_media",
            DeclineReason::DeclaredTooLarge => "declared_too_large",
            DeclineReason::TransferFailed => "transfer_failed",
            DeclineReason::NoFile => "no_file",
            DeclineReason::TooLarge => "too_large",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaOutcome {
    Fetched(MediaItem),
    Declined(DeclineReason),
}

impl MediaOutcome {
    pub fn into_item(self) -> Option<MediaItem> {
        match self {
            MediaOutcome::Fetched(item) => Some(item),
            MediaOutcome::Declined(_) => None,
        }
    }
}

/// Downloads attachments into a directory, enforcing `max_mb`.
#[derive(Debug, Clone)]
pub struct MediaFetcher {
    dir: PathBuf,
    max_bytes: u64,
}

impl MediaFetcher {
    pub fn new<P: Into<PathBuf>>(dir: P, max_mb: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes: max_mb.saturating_mul(BYTES_PER_MB),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Fetch the media of one message.
    pub async fn fetch<S>(&self, source: &S, message: &IncomingMessage) -> MediaOutcome
    where
        S: MessageSource + ?Sized,
    {
        let outcome = self.try_fetch(source, message).await;
        if let MediaOutcome::Declined(reason) = &outcome {
            if *reason != DeclineReason::NoMedia {
                metrics::record_media_declined(reason.as_str());
            }
        }
        outcome
    }

    /// Fetch media for every message, keeping only successful items in order.
    pub async fn fetch_all<S>(&self, source: &S, messages: &[IncomingMessage]) -> Vec<MediaItem>
    where
        S: MessageSource + ?Sized,
    {
        let mut items = Vec::new();
        for message in messages {
            if let Some(item) = self.fetch(source, message).await.into_item() {
                items.push(item);
            }
        }
        items
    }

    async fn try_fetch<S>(&self, source: &S, message: &IncomingMessage) -> MediaOutcome
    where
        S: MessageSource + ?Sized,
    {
        let Some(media) = &message.media else {
            return MediaOutcome::Declined(DeclineReason::NoMedia);
        };

        if media.declared_size.is_some_and(|size| size > self.max_bytes) {
            warn!(
                message_id = message.id,
                max_bytes = self.max_bytes,
                "Media larger than ceiling, skipping"
            );
            return MediaOutcome::Declined(DeclineReason::DeclaredTooLarge);
        }

        let path = match source.download_media(message, &self.dir).await {
            Ok(Some(path)) => path,
            Ok(None) => return MediaOutcome::Declined(DeclineReason::NoFile),
            Err(err) => {
                warn!(message_id = message.id, error = %err, "Error downloading media");
                return MediaOutcome::Declined(DeclineReason::TransferFailed);
            }
        };

        let filesize = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return MediaOutcome::Declined(DeclineReason::NoFile),
        };

        if filesize > self.max_bytes {
            warn!(
                message_id = message.id,
                filesize,
                max_bytes = self.max_bytes,
                "Downloaded media larger than ceiling, removing"
            );
            if let Err(err) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), error = %err, "Failed to remove oversize media");
            }
            return MediaOutcome::Declined(DeclineReason::TooLarge);
        }

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        MediaOutcome::Fetched(MediaItem {
            file_path: path,
            filename,
            mimetype: media.mime_type.clone(),
            filesize,
        })
    }
}
