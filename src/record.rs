//! Canonical delivery record sent to the webhook

use serde::Serialize;

use crate::message::{IncomingMessage, Reaction};

pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const BACKFILL_MODE: &str = "bulk_thread_export";

/// Normalized record for one logical post.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryRecord {
    #[serde(rename = "group")]
    pub channel: String,
    pub author_id: Option<i64>,
    pub content: String,
    pub date: String,
    pub message_id: i32,
    pub author: Option<String>,
    pub views: Option<i32>,
    pub reactions: String,
    pub shares: Option<i32>,
    pub media: bool,
    pub url: String,
    pub comments_list: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_message_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    pub album_group_id: Option<i64>,
    pub has_media: bool,
    pub media_count: usize,
}

impl DeliveryRecord {
    /// Record for `message` in `channel`, before media has been counted.
    pub fn from_message(channel: &str, message: &IncomingMessage) -> Self {
        let channel = channel.trim_start_matches('@');
        let has_media = message.has_media();
        Self {
            channel: channel.to_string(),
            author_id: message.author_id,
            content: sanitize_text(&message.text),
            date: message.date.format(DATE_FORMAT).to_string(),
            message_id: message.id,
            author: message.post_author.clone(),
            views: message.views,
            reactions: format_reactions(&message.reactions),
            shares: message.forwards,
            media: has_media,
            url: message_url(channel, message.id),
            comments_list: Vec::new(),
            thread_message_id: None,
            mode: None,
            album_group_id: None,
            has_media,
            media_count: 0,
        }
    }

    /// Live album record built from the first member. Always flagged as media.
    pub fn from_album(channel: &str, first: &IncomingMessage) -> Self {
        let mut record = Self::from_message(channel, first);
        record.album_group_id = first.grouped_id;
        record.set_has_media(true);
        record
    }

    /// Backfill record for a positional group, flagged from the whole batch.
    pub fn from_thread_group(
        channel: &str,
        thread_id: i32,
        messages: &[IncomingMessage],
    ) -> Option<Self> {
        let first = messages.first()?;
        let mut record = Self::from_message(channel, first);
        record.album_group_id = first.grouped_id;
        record.thread_message_id = Some(thread_id);
        record.mode = Some(BACKFILL_MODE.to_string());
        record.set_has_media(messages.iter().any(IncomingMessage::has_media));
        Some(record)
    }

    pub fn set_has_media(&mut self, has_media: bool) {
        self.media = has_media;
        self.has_media = has_media;
    }
}

/// Public post URL for a channel message.
pub fn message_url(channel: &str, message_id: i32) -> String {
    format!("https://t.me/{}/{}", channel.trim_start_matches('@'), message_id)
}

/// Strip NUL bytes, which webhook receivers and JSON stores reject.
pub fn sanitize_text(text: &str) -> String {
    text.replace('\0', "")
}

pub fn format_reaction(reaction: &Reaction) -> String {
    format!("{} {}", reaction.emoji, reaction.count)
}

/// Space-joined `emoji count` pairs.
pub fn format_reactions(reactions: &[Reaction]) -> String {
    reactions
        .iter()
        .map(format_reaction)
        .collect::<Vec<_>>()
        .join(" ")
}
