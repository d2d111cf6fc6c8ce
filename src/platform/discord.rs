use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::config::DiscordConfig;
use crate::platform::{Attachment, Channel, ChannelSource, Message};

#[derive(Debug, Deserialize)]
struct ChannelPayload {
    id: String,
    #[serde(rename = "type", default)]
    channel_type: u8,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AttachmentPayload {
    filename: String,
    #[serde(default)]
    content_type: Option<String>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    id: String,
    channel_id: String,
    author: UserPayload,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    attachments: Vec<AttachmentPayload>,
}

fn parse_snowflake(value: &str, what: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .with_context(|| format!("Invalid {} snowflake: {:?}", what, value))
}

fn channel_kind(channel_type: u8) -> &'static str {
    match channel_type {
        0 => "text",
        1 => "dm",
        2 => "voice",
        5 => "announcement",
        10..=12 => "thread",
        15 => "forum",
        _ => "other",
    }
}

impl MessagePayload {
    fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: parse_snowflake(&self.id, "message")?,
            author_id: parse_snowflake(&self.author.id, "author")?,
            channel_id: parse_snowflake(&self.channel_id, "channel")?,
            created_at: self.timestamp,
            attachments: self
                .attachments
                .into_iter()
                .map(|a| Attachment {
                    filename: a.filename,
                    content_type: a.content_type,
                    url: a.url,
                })
                .collect(),
        })
    }
}

/// Discord REST client for the handful of endpoints the relay reads
pub struct DiscordSource {
    client: reqwest::Client,
    config: DiscordConfig,
}

impl DiscordSource {
    pub fn new(config: DiscordConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build Discord HTTP client")?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        debug!("Discord GET {}", url);
        self.client
            .get(url)
            .header("Authorization", format!("Bot {}", self.config.bot_token))
            .send()
            .await
            .context("Failed to send request to Discord")
    }
}

#[async_trait]
impl ChannelSource for DiscordSource {
    async fn fetch_channel(&self, channel_id: u64) -> Result<Option<Channel>> {
        let response = self.get(&self.url(&format!("/channels/{}", channel_id))).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::FORBIDDEN {
            return Ok(None);
        }
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Discord API error ({}): {}", status, error_body);
        }

        let payload: ChannelPayload = response
            .json()
            .await
            .context("Failed to parse Discord channel")?;
        Ok(Some(Channel {
            id: parse_snowflake(&payload.id, "channel")?,
            kind: channel_kind(payload.channel_type).to_string(),
        }))
    }

    async fn most_recent_message(&self, channel: &Channel) -> Result<Option<Message>> {
        let url = self.url(&format!("/channels/{}/messages?limit=1", channel.id));
        let response = self.get(&url).await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Discord API error ({}): {}", status, error_body);
        }

        let messages: Vec<MessagePayload> = response
            .json()
            .await
            .context("Failed to parse Discord messages")?;
        messages
            .into_iter()
            .next()
            .map(MessagePayload::into_message)
            .transpose()
    }

    async fn read_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>> {
        // CDN URLs are signed; no bot token needed.
        let response = self
            .client
            .get(&attachment.url)
            .send()
            .await
            .with_context(|| format!("Failed to download attachment {}", attachment.filename))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "Attachment download failed ({}) for {}",
                status,
                attachment.filename
            );
        }

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read attachment body {}", attachment.filename))?;
        Ok(bytes.to_vec())
    }
}
