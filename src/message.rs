//! Client-agnostic view of an incoming channel message

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// One reaction on a message: emoji (or custom emoji id) and count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub emoji: String,
    pub count: i32,
}

impl Reaction {
    pub fn new(emoji: impl Into<String>, count: i32) -> Self {
        Self {
            emoji: emoji.into(),
            count,
        }
    }
}

/// Opaque client handle used by a [`crate::source::MessageSource`] to download media.
#[derive(Clone)]
pub struct MediaHandle(Arc<dyn Any + Send + Sync>);

impl MediaHandle {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MediaHandle(..)")
    }
}

/// Attached media as announced by the upstream client.
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    /// Declared size in bytes, when the client knows it
    pub declared_size: Option<u64>,
    pub mime_type: Option<String>,
    pub handle: Option<MediaHandle>,
}

/// A message as seen by the forwarding core.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: i32,
    pub text: String,
    pub date: DateTime<Utc>,
    pub author_id: Option<i64>,
    pub post_author: Option<String>,
    pub views: Option<i32>,
    pub forwards: Option<i32>,
    pub reactions: Vec<Reaction>,
    pub grouped_id: Option<i64>,
    pub media: Option<MediaInfo>,
}

impl IncomingMessage {
    /// Bare text message, mostly useful for tests and fakes.
    pub fn new(id: i32, text: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            id,
            text: text.into(),
            date,
            author_id: None,
            post_author: None,
            views: None,
            forwards: None,
            reactions: Vec::new(),
            grouped_id: None,
            media: None,
        }
    }

    pub fn with_group(mut self, grouped_id: i64) -> Self {
        self.grouped_id = Some(grouped_id);
        self
    }

    pub fn with_media(mut self, media: MediaInfo) -> Self {
        self.media = Some(media);
        self
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }
}
