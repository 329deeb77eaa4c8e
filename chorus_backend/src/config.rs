use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::PathBuf;

/// What the validator does when a completion is not parseable JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParseFailurePolicy {
    /// Push the bad output plus a corrective turn and ask again.
    #[default]
    Reprompt,
    /// Treat the raw text as the reply itself (`shouldRespond = true`).
    TreatAsResponse,
}

/// What happens when a reply does not address any other persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MentionPolicy {
    #[default]
    Warn,
    Require,
    Off,
}

/// What the orchestrator does when the validator gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    #[default]
    Fallback,
    Drop,
}

/// Static configuration of one bot identity.
#[derive(Clone, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub name: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub supports_images: bool,
    #[serde(default)]
    pub can_generate_images: bool,
    #[serde(default = "default_persona_prompt")]
    pub system_prompt: String,
}

impl fmt::Debug for PersonaProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersonaProfile")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "***" })
            .field("supports_images", &self.supports_images)
            .field("can_generate_images", &self.can_generate_images)
            .finish()
    }
}

impl PersonaProfile {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            api_key: String::new(),
            supports_images: false,
            can_generate_images: false,
            system_prompt: default_persona_prompt(),
        }
    }

    /// Key backend requests are paced under. Personas sharing a credential
    /// share one request slot; keyless personas are paced by name.
    pub fn pacing_key(&self) -> &str {
        if self.api_key.trim().is_empty() {
            &self.name
        } else {
            &self.api_key
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChorusConfig {
    // LLM backend (OpenAI-compatible chat completions endpoint)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Context window and retry budget
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    // Pacing
    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,

    #[serde(default)]
    pub parse_failure_policy: ParseFailurePolicy,
    #[serde(default)]
    pub mention_policy: MentionPolicy,
    #[serde(default)]
    pub exhaustion_policy: ExhaustionPolicy,
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,

    /// Channel ids the personas may speak in. Empty means any guild channel.
    #[serde(default)]
    pub allowed_channels: Vec<String>,

    /// Summarise the last N conversation turns into memory every N turns (0 = off).
    #[serde(default)]
    pub memory_summary_every: usize,

    #[serde(default)]
    pub personas: Vec<PersonaProfile>,
}

fn default_llm_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_database_path() -> String {
    "chorus.db".to_string()
}

fn default_model() -> String {
    "openai/gpt-4".to_string()
}

fn default_persona_prompt() -> String {
    "You are a helpful assistant in a group chat shared with people and other bots. \
     Read the conversation and decide whether you have something worth adding. \
     If you choose to respond, give a thoughtful and relevant answer."
        .to_string()
}

fn default_max_context_messages() -> usize {
    20
}

fn default_max_attempts() -> usize {
    crate::persona::validator::DEFAULT_MAX_ATTEMPTS
}

fn default_jitter_min_ms() -> u64 {
    3000
}

fn default_jitter_max_ms() -> u64 {
    5000
}

fn default_min_request_interval_ms() -> u64 {
    3000
}

fn default_fallback_message() -> String {
    "Sorry, I ran into a problem while putting together a reply.".to_string()
}

impl Default for ChorusConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            database_path: default_database_path(),
            max_context_messages: default_max_context_messages(),
            max_attempts: default_max_attempts(),
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
            min_request_interval_ms: default_min_request_interval_ms(),
            parse_failure_policy: ParseFailurePolicy::default(),
            mention_policy: MentionPolicy::default(),
            exhaustion_policy: ExhaustionPolicy::default(),
            fallback_message: default_fallback_message(),
            allowed_channels: Vec::new(),
            memory_summary_every: 0,
            personas: Vec::new(),
        }
    }
}

impl ChorusConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path to the config file next to the executable
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("chorus_config.toml")
    }

    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("chorus").join("chorus_config.toml"))
    }

    /// Load config from chorus_config.toml (next to executable, then the user
    /// config dir), falling back to env vars. Env overrides apply in every case.
    pub fn load() -> Self {
        let candidates = std::iter::once(Self::config_path()).chain(Self::user_config_path());

        for path in candidates {
            let Ok(contents) = fs::read_to_string(&path) else {
                continue;
            };
            match Self::from_toml_str(&contents) {
                Ok(mut config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config.apply_env();
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str::<ChorusConfig>(contents).context("Failed to parse chorus config")
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(url) = env::var("LLM_API_URL") {
            if !url.trim().is_empty() {
                self.llm_api_url = url;
            }
        }

        if let Ok(path) = env::var("CHORUS_DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        if let Ok(limit) = env::var("CHORUS_MAX_CONTEXT_MESSAGES") {
            if let Ok(limit) = limit.trim().parse() {
                self.max_context_messages = limit;
            }
        }

        if let Ok(key) = env::var("OPENROUTER_API_KEY") {
            self.fill_missing_api_keys(&key);
        }
    }

    /// Personas without their own credential share the default key.
    pub fn fill_missing_api_keys(&mut self, key: &str) {
        let key = key.trim();
        if key.is_empty() {
            return;
        }
        for persona in self.personas.iter_mut() {
            if persona.api_key.trim().is_empty() {
                persona.api_key = key.to_string();
            }
        }
    }

    pub fn persona_names(&self) -> Vec<String> {
        self.personas.iter().map(|p| p.name.clone()).collect()
    }
}
