//! grammers-backed [`MessageSource`]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use grammers_client::client::UpdatesConfiguration;
use grammers_client::types::peer::Peer;
use grammers_client::types::update::Update;
use grammers_client::types::{Media, Message};
use grammers_client::PeerMap;
use grammers_session::defs::{PeerId, PeerRef};
use grammers_tl_types as tl;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::message::{IncomingMessage, MediaHandle, MediaInfo, Reaction};
use crate::session::TelegramClient;
use crate::source::{ChannelMessage, MessageSource};

const EVENT_QUEUE: usize = 256;
const MAX_NAME_CHARS: usize = 80;
const REPLIES_PAGE: i32 = 100;

static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w.\-]").expect("valid regex"));
static REPEATED_UNDERSCORES: Lazy<Regex> = Lazy::new(|| Regex::new(r"_+").expect("valid regex"));

/// Filesystem-safe version of an attachment name.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned = UNSAFE_CHARS.replace_all(name.trim(), "_");
    let collapsed = REPEATED_UNDERSCORES.replace_all(&cleaned, "_");
    collapsed
        .trim_matches(|c| c == '_' || c == '.')
        .chars()
        .take(MAX_NAME_CHARS)
        .collect()
}

fn extension_for(mime: Option<&str>) -> &'static str {
    match mime {
        Some("image/jpeg") => "jpg",
        Some("image/png") => "png",
        Some("image/webp") => "webp",
        Some("image/gif") => "gif",
        Some("video/mp4") => "mp4",
        Some("audio/ogg") => "ogg",
        Some("audio/mpeg") => "mp3",
        Some("application/pdf") => "pdf",
        _ => "bin",
    }
}

/// Local file name for a message attachment, prefixed by the message id.
pub fn attachment_filename(message_id: i32, original: Option<&str>, mime: Option<&str>) -> String {
    match original.map(sanitize_filename).filter(|n| !n.is_empty()) {
        Some(name) => format!("{}_{}", message_id, name),
        None => format!("{}.{}", message_id, extension_for(mime)),
    }
}

fn media_info(media: Media) -> MediaInfo {
    let (declared_size, mime_type) = match &media {
        Media::Photo(_) => (None, Some("image/jpeg".to_string())),
        Media::Document(doc) => (
            u64::try_from(doc.size()).ok(),
            doc.mime_type().map(str::to_string),
        ),
        _ => (None, None),
    };

    MediaInfo {
        declared_size,
        mime_type,
        handle: Some(MediaHandle::new(media)),
    }
}

fn to_reaction(count: &tl::enums::ReactionCount) -> Option<Reaction> {
    let tl::enums::ReactionCount::Count(count) = count;
    let emoji = match &count.reaction {
        tl::enums::Reaction::Emoji(r) => r.emoticon.clone(),
        tl::enums::Reaction::CustomEmoji(r) => r.document_id.to_string(),
        tl::enums::Reaction::Paid => "paid".to_string(),
        tl::enums::Reaction::Empty => return None,
    };
    Some(Reaction::new(emoji, count.count))
}

/// Reaction counts in the order Telegram lists them.
fn reactions_of(reactions: Option<&tl::enums::MessageReactions>) -> Vec<Reaction> {
    match reactions {
        Some(tl::enums::MessageReactions::Reactions(r)) => {
            r.results.iter().filter_map(to_reaction).collect()
        }
        None => Vec::new(),
    }
}

/// Convert a grammers message into the client-agnostic model.
fn to_incoming(msg: &Message) -> IncomingMessage {
    let author_id = match msg.sender() {
        Some(Peer::User(user)) => Some(user.raw.id()),
        _ => None,
    };
    let reactions = match &msg.raw {
        tl::enums::Message::Message(raw) => reactions_of(raw.reactions.as_ref()),
        _ => Vec::new(),
    };

    IncomingMessage {
        id: msg.id(),
        text: msg.text().to_string(),
        date: msg.date(),
        author_id,
        post_author: msg.post_author().map(str::to_string),
        views: msg.view_count(),
        forwards: msg.forward_count(),
        reactions,
        grouped_id: msg.grouped_id(),
        media: msg.media().map(media_info),
    }
}

/// Name of the watched channel `peer_id` belongs to.
///
/// Both directions count: posts made by the session account itself are
/// forwarded like any other.
fn channel_for(watched: &[(PeerId, String)], peer_id: PeerId) -> Option<&str> {
    watched
        .iter()
        .find(|(id, _)| *id == peer_id)
        .map(|(_, name)| name.as_str())
}

/// True once the replies walk holds everything the server reported.
fn replies_complete(fetched: usize, total: Option<usize>, oldest_id: i32) -> bool {
    total.map_or(true, |total| fetched >= total) || oldest_id <= 1
}

/// Message list, peers and server-side total from a history-style response.
fn unpack_messages(
    response: tl::enums::messages::Messages,
) -> (Vec<tl::enums::Message>, Arc<PeerMap>, Option<usize>) {
    use tl::enums::messages::Messages;

    match response {
        Messages::Messages(m) => (m.messages, PeerMap::new(m.users, m.chats), None),
        Messages::Slice(m) => (
            m.messages,
            PeerMap::new(m.users, m.chats),
            Some(m.count as usize),
        ),
        Messages::ChannelMessages(m) => (
            m.messages,
            PeerMap::new(m.users, m.chats),
            Some(m.count as usize),
        ),
        Messages::NotModified(_) => (Vec::new(), PeerMap::new(Vec::new(), Vec::new()), None),
    }
}

pub struct TelegramSource {
    client: TelegramClient,
    peers: HashMap<String, Peer>,
    events: mpsc::Receiver<Result<ChannelMessage>>,
    pump: JoinHandle<()>,
}

impl TelegramSource {
    /// Resolve the monitored channels and start reading updates for them.
    pub async fn connect(mut client: TelegramClient, channels: &[String]) -> Result<Self> {
        let mut peers = HashMap::new();
        let mut watched: Vec<(PeerId, String)> = Vec::new();

        for channel in channels {
            let name = channel.trim_start_matches('@');
            let peer = client
                .resolve_username(name)
                .await?
                .ok_or_else(|| Error::ChannelNotFound(name.to_string()))?;
            watched.push((peer.id(), name.to_string()));
            peers.insert(name.to_string(), peer);
        }

        let updates_rx = client
            .take_updates()
            .ok_or_else(|| Error::TelegramError("Updates stream already taken".into()))?;

        let (tx, events) = mpsc::channel(EVENT_QUEUE);
        let stream_client = client.client.clone();

        let pump = tokio::spawn(async move {
            let mut updates = stream_client.stream_updates(
                updates_rx,
                UpdatesConfiguration {
                    catch_up: false,
                    ..Default::default()
                },
            );

            loop {
                let event = match updates.next().await {
                    Ok(Update::NewMessage(msg)) => {
                        let Some(channel) = channel_for(&watched, msg.peer_id()) else {
                            continue;
                        };
                        Ok(ChannelMessage {
                            channel: channel.to_string(),
                            message: to_incoming(&msg),
                        })
                    }
                    Ok(_) => continue,
                    Err(err) => Err(Error::from(err)),
                };

                let failed = event.is_err();
                if tx.send(event).await.is_err() || failed {
                    break;
                }
            }
        });

        info!(channels = %channels.join(","), "Subscribed to channels");
        Ok(Self {
            client,
            peers,
            events,
            pump,
        })
    }

    async fn peer(&self, channel: &str) -> Result<Peer> {
        if let Some(peer) = self.peers.get(channel) {
            return Ok(peer.clone());
        }
        self.client
            .resolve_username(channel)
            .await?
            .ok_or_else(|| Error::ChannelNotFound(channel.to_string()))
    }
}

impl Drop for TelegramSource {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl MessageSource for TelegramSource {
    async fn next_message(&mut self) -> Result<Option<ChannelMessage>> {
        self.events.recv().await.transpose()
    }

    /// Every reply in the thread rooted at `thread_id`, oldest first.
    ///
    /// For a channel post this is the comment thread in the linked discussion
    /// group. Nested replies are included.
    async fn thread_history(&self, channel: &str, thread_id: i32) -> Result<Vec<IncomingMessage>> {
        let peer = self.peer(channel).await?;
        let input: tl::enums::InputPeer = PeerRef::from(&peer).into();
        let mut replies = Vec::new();
        let mut offset_id = 0;

        loop {
            let request = tl::functions::messages::GetReplies {
                peer: input.clone(),
                msg_id: thread_id,
                offset_id,
                offset_date: 0,
                add_offset: 0,
                limit: REPLIES_PAGE,
                max_id: 0,
                min_id: 0,
                hash: 0,
            };
            let (messages, peers, total) = unpack_messages(self.client.invoke(&request).await?);

            let page: Vec<Message> = messages
                .into_iter()
                .filter(|raw| !matches!(raw, tl::enums::Message::Empty(_)))
                .map(|raw| Message::from_raw(&self.client.client, raw, None, &peers))
                .collect();
            let Some(oldest) = page.last().map(Message::id) else {
                break;
            };

            replies.extend(page.iter().map(to_incoming));
            debug!(channel, thread_id, fetched = replies.len(), "Loaded replies page");

            if replies_complete(replies.len(), total, oldest) {
                break;
            }
            offset_id = oldest;
        }

        // Pages come newest first.
        replies.reverse();
        info!(channel, thread_id, replies = replies.len(), "Loaded thread history");
        Ok(replies)
    }

    async fn download_media(
        &self,
        message: &IncomingMessage,
        dir: &Path,
    ) -> Result<Option<PathBuf>> {
        let Some(media) = message
            .media
            .as_ref()
            .and_then(|info| info.handle.as_ref())
            .and_then(|handle| handle.downcast_ref::<Media>())
        else {
            return Ok(None);
        };

        let original = match media {
            Media::Document(doc) => Some(doc.name().to_string()),
            _ => None,
        };
        let mime = message.media.as_ref().and_then(|m| m.mime_type.as_deref());

        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(attachment_filename(message.id, original.as_deref(), mime));

        if let Err(err) = self.client.download_media(media, &path).await {
            if let Err(rm_err) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %rm_err, "Failed to remove partial download");
            }
            return Err(err.into());
        }

        Ok(Some(path))
    }
}
