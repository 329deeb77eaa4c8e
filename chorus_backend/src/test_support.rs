//! Fakes shared by the pipeline tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::chat::{Author, ChannelScope, ChatMessage, ChatSurface, ChatTurn};
use crate::config::PersonaProfile;
use crate::llm_client::CompletionBackend;

pub const GUILD: &str = "guild-1";
pub const CHANNEL: &str = "chan-1";

static CLOCK: AtomicI64 = AtomicI64::new(0);

pub fn profile(name: &str) -> PersonaProfile {
    let mut profile = PersonaProfile::new(name, "test/model");
    profile.system_prompt = format!("You are {}, a friendly regular in this server.", name);
    profile
}

pub fn channel() -> ChannelScope {
    ChannelScope {
        guild_id: Some(GUILD.to_string()),
        channel_id: CHANNEL.to_string(),
    }
}

fn message(id: &str, author: Author, content: &str) -> ChatMessage {
    let tick = CLOCK.fetch_add(1, Ordering::SeqCst);
    ChatMessage {
        id: id.to_string(),
        author,
        content: content.to_string(),
        attachments: Vec::new(),
        channel: channel(),
        mentions: Vec::new(),
        created_at: Utc::now() + Duration::milliseconds(tick),
    }
}

pub fn human_message(id: &str, name: &str, content: &str) -> ChatMessage {
    message(
        id,
        Author {
            id: format!("user-{}", name),
            display_name: name.to_string(),
            is_bot: false,
        },
        content,
    )
}

pub fn bot_message(id: &str, bot_id: &str, name: &str, content: &str) -> ChatMessage {
    message(
        id,
        Author {
            id: bot_id.to_string(),
            display_name: name.to_string(),
            is_bot: true,
        },
        content,
    )
}

type ScriptedReply = std::result::Result<Option<String>, String>;

/// Backend that replays canned completions and records every request.
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<ScriptedReply>>,
    fallback: Option<ScriptedReply>,
    requests: Mutex<Vec<Vec<ChatTurn>>>,
    call_instants: Mutex<Vec<tokio::time::Instant>>,
    calls: AtomicUsize,
    summary: String,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            call_instants: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            summary: "sam asked about chess openings".to_string(),
        }
    }

    pub fn repeating(reply: ScriptedReply) -> Self {
        let mut backend = Self::new(Vec::new());
        backend.fallback = Some(reply);
        backend
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// When each `complete_json` call arrived, on the tokio clock.
    pub fn call_instants(&self) -> Vec<tokio::time::Instant> {
        self.call_instants.lock().unwrap().clone()
    }

    pub fn request(&self, index: usize) -> Vec<ChatTurn> {
        self.requests.lock().unwrap()[index].clone()
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete_json(
        &self,
        _profile: &PersonaProfile,
        messages: &[ChatTurn],
    ) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_instants
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());
        self.requests.lock().unwrap().push(messages.to_vec());

        let next = self.replies.lock().unwrap().pop_front();
        let reply = next
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| Err("script exhausted".to_string()));
        reply.map_err(|e| anyhow::anyhow!(e))
    }

    async fn complete_text(
        &self,
        _profile: &PersonaProfile,
        _messages: &[ChatTurn],
    ) -> Result<String> {
        Ok(self.summary.clone())
    }
}

/// Surface with a fixed history that records what gets posted.
pub struct RecordingSurface {
    history: Mutex<Vec<ChatMessage>>,
    posted: Mutex<Vec<String>>,
    fail_posts: bool,
}

impl RecordingSurface {
    pub fn new(history: Vec<ChatMessage>) -> Self {
        Self {
            history: Mutex::new(history),
            posted: Mutex::new(Vec::new()),
            fail_posts: false,
        }
    }

    pub fn failing(history: Vec<ChatMessage>) -> Self {
        let mut surface = Self::new(history);
        surface.fail_posts = true;
        surface
    }

    pub fn posted(&self) -> Vec<String> {
        self.posted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatSurface for RecordingSurface {
    async fn recent_messages(
        &self,
        _channel: &ChannelScope,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let history = self.history.lock().unwrap();
        let skip = history.len().saturating_sub(limit);
        Ok(history.iter().skip(skip).cloned().collect())
    }

    async fn post_message(&self, _channel: &ChannelScope, text: &str) -> Result<()> {
        if self.fail_posts {
            anyhow::bail!("gateway unavailable");
        }
        self.posted.lock().unwrap().push(text.to_string());
        Ok(())
    }
}
