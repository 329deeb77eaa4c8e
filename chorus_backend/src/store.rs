//! Records owned by the persistence layer and the contract the pipeline uses
//! to reach them.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::chat::{ChatTurn, Role};

/// `(user, bot, guild, channel)`: one human talking to one persona in one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub user_id: String,
    pub bot_id: String,
    pub guild_id: String,
    pub channel_id: String,
}

/// `(bot, guild, channel)`: what one persona remembers about one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryKey {
    pub bot_id: String,
    pub guild_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub key: ConversationKey,
    pub turns: Vec<ChatTurn>,
    /// Bumped on every successful save; saves against an older revision are rejected.
    pub revision: i64,
}

impl Conversation {
    pub fn new(key: ConversationKey) -> Self {
        Self {
            key,
            turns: Vec::new(),
            revision: 0,
        }
    }

    /// Only user/assistant turns are durable; system turns are dropped.
    pub fn add_turn(&mut self, turn: ChatTurn) {
        if turn.role == Role::System {
            tracing::debug!("Refusing to persist a system turn into a conversation");
            return;
        }
        self.turns.push(turn);
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    pub key: MemoryKey,
    pub notes: Vec<String>,
    pub revision: i64,
}

impl Memory {
    pub fn new(key: MemoryKey) -> Self {
        Self {
            key,
            notes: Vec::new(),
            revision: 0,
        }
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        let note = note.into();
        if !note.trim().is_empty() {
            self.notes.push(note);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

/// Persistence contract for conversations, memories and bot ids.
///
/// `get_or_create_*` are idempotent upserts. `commit_turn` writes a
/// conversation and a memory together: both compare-and-swap on their
/// revision, and either both land or neither does. Revisions are bumped only
/// once the write is durable.
pub trait ScopeStore: Send + Sync {
    fn get_or_create_conversation(&self, key: &ConversationKey) -> Result<Conversation>;
    fn get_or_create_memory(&self, key: &MemoryKey) -> Result<Memory>;
    fn commit_turn(&self, conversation: &mut Conversation, memory: &mut Memory) -> Result<()>;
    fn save_bot_id(&self, name: &str, bot_id: &str) -> Result<()>;
    fn load_bot_ids(&self) -> Result<HashMap<String, String>>;
}
