//! Shared name → platform-id lookup used for mention resolution.
//!
//! One instance is created at startup and handed to every persona. Writes go
//! through to the store so ids survive restarts.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;

use crate::store::ScopeStore;

pub struct BotDirectory {
    ids: RwLock<HashMap<String, String>>,
    store: Option<Arc<dyn ScopeStore>>,
}

impl BotDirectory {
    /// Directory without persistence.
    pub fn in_memory() -> Self {
        Self {
            ids: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Directory hydrated from, and writing through to, `store`.
    pub fn load(store: Arc<dyn ScopeStore>) -> Result<Self> {
        let ids = store.load_bot_ids()?;
        tracing::info!("Loaded {} known bot id(s)", ids.len());
        Ok(Self {
            ids: RwLock::new(ids),
            store: Some(store),
        })
    }

    pub fn register(&self, name: &str, bot_id: &str) -> Result<()> {
        if let Some(store) = &self.store {
            store.save_bot_id(name, bot_id)?;
        }
        let mut ids = self
            .ids
            .write()
            .map_err(|e| anyhow::anyhow!("Bot directory lock poisoned: {}", e))?;
        ids.insert(name.to_string(), bot_id.to_string());
        tracing::debug!("Registered bot '{}' as {}", name, bot_id);
        Ok(())
    }

    pub fn id_for(&self, name: &str) -> Option<String> {
        let ids = self.ids.read().unwrap_or_else(|e| e.into_inner());
        ids.get(name).cloned()
    }

    /// Platform mention token for `name`, or the bare name when the id is unknown.
    pub fn mention_for(&self, name: &str) -> String {
        match self.id_for(name) {
            Some(id) => format!("<@{}>", id),
            None => name.to_string(),
        }
    }

    pub fn name_for_id(&self, bot_id: &str) -> Option<String> {
        let ids = self.ids.read().unwrap_or_else(|e| e.into_inner());
        ids.iter()
            .find(|(_, id)| id.as_str() == bot_id)
            .map(|(name, _)| name.clone())
    }
}
