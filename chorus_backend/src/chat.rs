//! Chat-surface contract and the message types that flow through the pipeline.
//!
//! The gateway connection itself lives outside this crate. A persona only needs
//! to read recent channel history and post text back, so that is all
//! [`ChatSurface`] exposes.

use std::sync::OnceLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

const MENTION_TOKEN_PATTERN: &str = r"<@!?(\d+)>";

/// Role of a turn exchanged with the LLM backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One role-tagged message unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            author: None,
            timestamp: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            author: None,
            timestamp: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            author: None,
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub display_name: String,
    pub is_bot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub content_type: Option<String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.starts_with("image/"))
            .unwrap_or(false)
    }
}

/// Where a message lives. A missing guild means a direct message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelScope {
    pub guild_id: Option<String>,
    pub channel_id: String,
}

/// A message as seen on the chat surface, both for inbound events and history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub author: Author,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub channel: ChannelScope,
    /// Platform ids of users/bots explicitly mentioned in the message.
    #[serde(default)]
    pub mentions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn has_image(&self) -> bool {
        self.attachments.iter().any(Attachment::is_image)
    }
}

fn mention_token() -> Option<&'static Regex> {
    static TOKEN: OnceLock<Option<Regex>> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(MENTION_TOKEN_PATTERN).ok()).as_ref()
}

/// Platform ids named by `<@id>` / `<@!id>` tokens in `text`, in order.
pub fn mention_ids(text: &str) -> Vec<String> {
    let Some(token) = mention_token() else {
        return Vec::new();
    };
    token
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|id| id.as_str().to_string())
        .collect()
}

#[async_trait]
pub trait ChatSurface: Send + Sync {
    /// Up to `limit` most recent messages in the channel, oldest first.
    async fn recent_messages(&self, channel: &ChannelScope, limit: usize)
        -> Result<Vec<ChatMessage>>;

    async fn post_message(&self, channel: &ChannelScope, text: &str) -> Result<()>;
}
