use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::chat::ChatTurn;
use crate::store::{Conversation, ConversationKey, Memory, MemoryKey, ScopeStore};

pub struct ChorusDatabase {
    conn: Mutex<Connection>,
}

impl ChorusDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", path.as_ref()))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                bot_id TEXT NOT NULL,
                guild_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                messages TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                UNIQUE (user_id, bot_id, guild_id, channel_id)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id TEXT NOT NULL,
                guild_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                memories TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                UNIQUE (bot_id, guild_id, channel_id)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS bot_ids (
                name TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        Ok(())
    }
}

impl ScopeStore for ChorusDatabase {
    fn get_or_create_conversation(&self, key: &ConversationKey) -> Result<Conversation> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO conversations (user_id, bot_id, guild_id, channel_id, messages, revision, updated_at)
             VALUES (?1, ?2, ?3, ?4, '[]', 0, ?5)",
            params![
                key.user_id,
                key.bot_id,
                key.guild_id,
                key.channel_id,
                Utc::now().to_rfc3339()
            ],
        )?;

        let (raw, revision) = conn.query_row(
            "SELECT messages, revision FROM conversations
             WHERE user_id = ?1 AND bot_id = ?2 AND guild_id = ?3 AND channel_id = ?4",
            params![key.user_id, key.bot_id, key.guild_id, key.channel_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;

        let turns: Vec<ChatTurn> = serde_json::from_str(&raw)
            .with_context(|| format!("Corrupt conversation messages for {:?}", key))?;

        Ok(Conversation {
            key: key.clone(),
            turns,
            revision,
        })
    }

    fn get_or_create_memory(&self, key: &MemoryKey) -> Result<Memory> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO memories (bot_id, guild_id, channel_id, memories, revision, updated_at)
             VALUES (?1, ?2, ?3, '[]', 0, ?4)",
            params![
                key.bot_id,
                key.guild_id,
                key.channel_id,
                Utc::now().to_rfc3339()
            ],
        )?;

        let (raw, revision) = conn.query_row(
            "SELECT memories, revision FROM memories
             WHERE bot_id = ?1 AND guild_id = ?2 AND channel_id = ?3",
            params![key.bot_id, key.guild_id, key.channel_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;

        let notes: Vec<String> = serde_json::from_str(&raw)
            .with_context(|| format!("Corrupt memory notes for {:?}", key))?;

        Ok(Memory {
            key: key.clone(),
            notes,
            revision,
        })
    }

    fn commit_turn(&self, conversation: &mut Conversation, memory: &mut Memory) -> Result<()> {
        let turns = serde_json::to_string(&conversation.turns)?;
        let notes = serde_json::to_string(&memory.notes)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let key = &conversation.key;
        let changed = tx.execute(
            "UPDATE conversations SET messages = ?1, revision = revision + 1, updated_at = ?2
             WHERE user_id = ?3 AND bot_id = ?4 AND guild_id = ?5 AND channel_id = ?6 AND revision = ?7",
            params![
                turns,
                now,
                key.user_id,
                key.bot_id,
                key.guild_id,
                key.channel_id,
                conversation.revision
            ],
        )?;
        if changed == 0 {
            anyhow::bail!(
                "Stale conversation write for {:?} (revision {})",
                key,
                conversation.revision
            );
        }

        let key = &memory.key;
        let changed = tx.execute(
            "UPDATE memories SET memories = ?1, revision = revision + 1, updated_at = ?2
             WHERE bot_id = ?3 AND guild_id = ?4 AND channel_id = ?5 AND revision = ?6",
            params![
                notes,
                now,
                key.bot_id,
                key.guild_id,
                key.channel_id,
                memory.revision
            ],
        )?;
        if changed == 0 {
            anyhow::bail!(
                "Stale memory write for {:?} (revision {})",
                key,
                memory.revision
            );
        }

        tx.commit().context("Failed to commit turn")?;

        conversation.revision += 1;
        memory.revision += 1;
        Ok(())
    }

    fn save_bot_id(&self, name: &str, bot_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO bot_ids (name, bot_id, updated_at) VALUES (?1, ?2, ?3)",
            params![name, bot_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn load_bot_ids(&self) -> Result<HashMap<String, String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT name, bot_id FROM bot_ids")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Role;

    fn open_temp_db() -> (tempfile::TempDir, ChorusDatabase) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = ChorusDatabase::new(dir.path().join("chorus.db")).expect("db init");
        (dir, db)
    }

    fn conversation_key() -> ConversationKey {
        ConversationKey {
            user_id: "user-1".to_string(),
            bot_id: "bot-1".to_string(),
            guild_id: "guild-1".to_string(),
            channel_id: "chan-1".to_string(),
        }
    }

    fn memory_key() -> MemoryKey {
        MemoryKey {
            bot_id: "bot-1".to_string(),
            guild_id: "guild-1".to_string(),
            channel_id: "chan-1".to_string(),
        }
    }

    #[test]
    fn get_or_create_twice_yields_equal_empty_records() {
        let (_dir, db) = open_temp_db();

        let first = db.get_or_create_conversation(&conversation_key()).unwrap();
        let second = db.get_or_create_conversation(&conversation_key()).unwrap();
        assert_eq!(first, second);
        assert!(first.is_empty());

        let first = db.get_or_create_memory(&memory_key()).unwrap();
        let second = db.get_or_create_memory(&memory_key()).unwrap();
        assert_eq!(first, second);
        assert!(first.is_empty());
    }

    fn conversation_for(user_id: &str) -> ConversationKey {
        ConversationKey {
            user_id: user_id.to_string(),
            ..conversation_key()
        }
    }

    #[test]
    fn committed_turn_round_trips() {
        let (_dir, db) = open_temp_db();

        let mut conversation = db.get_or_create_conversation(&conversation_key()).unwrap();
        let mut memory = db.get_or_create_memory(&memory_key()).unwrap();
        conversation.add_turn(ChatTurn::user("hello"));
        conversation.add_turn(ChatTurn::assistant("hi there"));
        memory.add_note("user-1 says hello a lot");
        db.commit_turn(&mut conversation, &mut memory).unwrap();
        assert_eq!(conversation.revision, 1);
        assert_eq!(memory.revision, 1);

        let reloaded = db.get_or_create_conversation(&conversation_key()).unwrap();
        assert_eq!(reloaded.turns.len(), 2);
        assert_eq!(reloaded.turns[1].role, Role::Assistant);
        assert_eq!(reloaded.revision, 1);

        let reloaded = db.get_or_create_memory(&memory_key()).unwrap();
        assert_eq!(reloaded.notes, vec!["user-1 says hello a lot"]);
    }

    #[test]
    fn stale_conversation_commit_is_rejected() {
        let (_dir, db) = open_temp_db();

        let mut a = db.get_or_create_conversation(&conversation_key()).unwrap();
        let mut b = db.get_or_create_conversation(&conversation_key()).unwrap();
        let mut memory = db.get_or_create_memory(&memory_key()).unwrap();

        a.add_turn(ChatTurn::user("first"));
        db.commit_turn(&mut a, &mut memory).unwrap();

        b.add_turn(ChatTurn::user("second"));
        let err = db.commit_turn(&mut b, &mut memory).unwrap_err();
        assert!(err.to_string().contains("Stale conversation write"));

        let stored = db.get_or_create_conversation(&conversation_key()).unwrap();
        assert_eq!(stored.turns, vec![ChatTurn::user("first")]);
    }

    #[test]
    fn stale_memory_rolls_back_the_conversation_write() {
        let (_dir, db) = open_temp_db();

        let mut conversation = db.get_or_create_conversation(&conversation_key()).unwrap();
        let mut stale_memory = db.get_or_create_memory(&memory_key()).unwrap();

        // Another user's turn in the same channel moves the memory on
        let mut other = db.get_or_create_conversation(&conversation_for("user-2")).unwrap();
        let mut fresh_memory = db.get_or_create_memory(&memory_key()).unwrap();
        other.add_turn(ChatTurn::user("me too"));
        fresh_memory.add_note("user-2 joined");
        db.commit_turn(&mut other, &mut fresh_memory).unwrap();

        conversation.add_turn(ChatTurn::user("hello"));
        conversation.add_turn(ChatTurn::assistant("hi"));
        stale_memory.add_note("lost note");
        let err = db
            .commit_turn(&mut conversation, &mut stale_memory)
            .unwrap_err();
        assert!(err.to_string().contains("Stale memory write"));
        assert_eq!(conversation.revision, 0);
        assert_eq!(stale_memory.revision, 0);

        let stored = db.get_or_create_conversation(&conversation_key()).unwrap();
        assert!(stored.is_empty());
        assert_eq!(stored.revision, 0);
        let stored = db.get_or_create_memory(&memory_key()).unwrap();
        assert_eq!(stored.notes, vec!["user-2 joined"]);
    }

    #[test]
    fn memory_notes_accumulate_across_commits() {
        let (_dir, db) = open_temp_db();

        let mut conversation = db.get_or_create_conversation(&conversation_key()).unwrap();
        let mut memory = db.get_or_create_memory(&memory_key()).unwrap();
        memory.add_note("Ada likes puns");
        db.commit_turn(&mut conversation, &mut memory).unwrap();
        memory.add_note("Bo is new here");
        db.commit_turn(&mut conversation, &mut memory).unwrap();

        let reloaded = db.get_or_create_memory(&memory_key()).unwrap();
        assert_eq!(reloaded.notes, vec!["Ada likes puns", "Bo is new here"]);
        assert_eq!(reloaded.revision, 2);
    }

    #[test]
    fn scopes_are_isolated_by_channel() {
        let (_dir, db) = open_temp_db();

        let mut conversation = db.get_or_create_conversation(&conversation_key()).unwrap();
        let mut memory = db.get_or_create_memory(&memory_key()).unwrap();
        memory.add_note("only here");
        db.commit_turn(&mut conversation, &mut memory).unwrap();

        let mut other = memory_key();
        other.channel_id = "chan-2".to_string();
        assert!(db.get_or_create_memory(&other).unwrap().is_empty());
    }

    #[test]
    fn bot_ids_upsert_by_name() {
        let (_dir, db) = open_temp_db();

        db.save_bot_id("Ada", "100").unwrap();
        db.save_bot_id("Bo", "200").unwrap();
        db.save_bot_id("Ada", "101").unwrap();

        let ids = db.load_bot_ids().unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids.get("Ada").map(String::as_str), Some("101"));
    }
}
