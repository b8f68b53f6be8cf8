//! Telegram channel forwarder library
//!
//! This library provides tools to:
//! - Listen to monitored Telegram channels and forward new posts to a webhook
//! - Aggregate albums (messages sharing a group id) into a single record
//! - Download attached media under a per-file size ceiling
//! - Deliver records as JSON or multipart with linear-backoff retries
//! - Replay a whole reply thread through the same pipeline
//! - Track a per-channel cursor to suppress duplicate live events

pub mod album;
pub mod backfill;
pub mod config;
pub mod cursor;
pub mod delivery;
pub mod error;
pub mod ingest;
pub mod media;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod session;
pub mod source;
pub mod supervisor;
pub mod telegram;

// Re-export common types
pub use config::Config;
pub use error::{Error, Result};
pub use message::IncomingMessage;
pub use record::DeliveryRecord;
pub use session::{check_session_exists, get_client, SessionLock};
pub use source::{ChannelMessage, MessageSource};

// Commands module uses re-exported types, so it must be declared after the re-exports
pub mod commands;
