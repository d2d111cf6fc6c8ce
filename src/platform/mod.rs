pub mod discord;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A channel resolved on the message source
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: u64,
    /// Source-specific channel kind, only used for logging
    pub kind: String,
}

/// A file attached to a message
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    /// Declared MIME type, if the source reported one
    pub content_type: Option<String>,
    /// Where the raw bytes can be fetched from
    pub url: String,
}

/// A message fetched from a channel. Ids are source-assigned and increase over time.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: u64,
    pub author_id: u64,
    pub channel_id: u64,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
}

/// Read side of the chat platform the relay watches.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// Resolve a channel. `Ok(None)` means it does not exist or is not visible to us.
    async fn fetch_channel(&self, channel_id: u64) -> Result<Option<Channel>>;

    /// The newest message in the channel, if any.
    async fn most_recent_message(&self, channel: &Channel) -> Result<Option<Message>>;

    /// Download an attachment's bytes.
    async fn read_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>>;
}
