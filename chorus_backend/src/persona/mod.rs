pub mod arbitration;
pub mod context;
pub mod validator;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::chat::{ChatMessage, ChatSurface, ChatTurn, Role};
use crate::config::{ChorusConfig, ExhaustionPolicy, MentionPolicy, ParseFailurePolicy, PersonaProfile};
use crate::directory::BotDirectory;
use crate::llm_client::CompletionBackend;
use crate::pacing::Pacing;
use crate::scope_lock::ScopeLocks;
use crate::store::{Conversation, ConversationKey, Memory, MemoryKey, ScopeStore};

use arbitration::Arbitrator;
use context::build_context;
use validator::ResponseValidator;

const SUMMARY_PROMPT: &str = "Summarize the key points from the following conversation messages. \
Focus on information that should be remembered later. Reply with a few short sentences.";

/// Per-turn knobs shared by every persona.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub max_context_messages: usize,
    pub max_attempts: usize,
    pub parse_failure_policy: ParseFailurePolicy,
    pub mention_policy: MentionPolicy,
    pub exhaustion_policy: ExhaustionPolicy,
    pub fallback_message: String,
    pub allowed_channels: Vec<String>,
    pub memory_summary_every: usize,
}

impl TurnSettings {
    pub fn from_config(config: &ChorusConfig) -> Self {
        Self {
            max_context_messages: config.max_context_messages,
            max_attempts: config.max_attempts,
            parse_failure_policy: config.parse_failure_policy,
            mention_policy: config.mention_policy,
            exhaustion_policy: config.exhaustion_policy,
            fallback_message: config.fallback_message.clone(),
            allowed_channels: config.allowed_channels.clone(),
            memory_summary_every: config.memory_summary_every,
        }
    }
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self::from_config(&ChorusConfig::default())
    }
}

/// Collaborators shared by all personas in the process.
#[derive(Clone)]
pub struct PersonaServices {
    pub store: Arc<dyn ScopeStore>,
    pub directory: Arc<BotDirectory>,
    pub backend: Arc<dyn CompletionBackend>,
    pub pacing: Arc<Pacing>,
    pub scope_locks: Arc<ScopeLocks>,
}

/// What a single inbound event led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Own message, direct message, or a channel we do not serve.
    Ignored,
    /// Pre-check said not to bother the backend.
    Skipped,
    /// The model chose not to speak.
    Declined,
    /// The reply failed the post-check.
    Suppressed,
    Posted(String),
    /// The validator gave up and the fixed fallback text was posted.
    FallbackPosted,
    /// The turn was abandoned (error, or exhaustion with the drop policy).
    Dropped,
}

pub struct Persona {
    profile: PersonaProfile,
    bot_id: String,
    persona_names: Vec<String>,
    surface: Arc<dyn ChatSurface>,
    services: PersonaServices,
    validator: ResponseValidator,
    arbitrator: Arbitrator,
    settings: TurnSettings,
}

impl Persona {
    pub fn new(
        profile: PersonaProfile,
        bot_id: impl Into<String>,
        persona_names: Vec<String>,
        surface: Arc<dyn ChatSurface>,
        services: PersonaServices,
        settings: TurnSettings,
    ) -> Self {
        let bot_id = bot_id.into();
        let validator = ResponseValidator::new(
            services.backend.clone(),
            services.pacing.clone(),
            settings.max_attempts,
            settings.parse_failure_policy,
        );
        let arbitrator = Arbitrator::new(
            &profile.name,
            &bot_id,
            settings.mention_policy,
            services.directory.clone(),
        );
        Self {
            profile,
            bot_id,
            persona_names,
            surface,
            services,
            validator,
            arbitrator,
            settings,
        }
    }

    fn other_persona_names(&self) -> Vec<String> {
        self.persona_names
            .iter()
            .filter(|name| name.as_str() != self.profile.name)
            .cloned()
            .collect()
    }

    fn in_scope(&self, event: &ChatMessage) -> bool {
        if event.author.id == self.bot_id {
            return false;
        }
        if event.channel.guild_id.is_none() {
            return false;
        }
        self.settings.allowed_channels.is_empty()
            || self
                .settings
                .allowed_channels
                .iter()
                .any(|id| id == &event.channel.channel_id)
    }

    /// Run one event through the pipeline, logging and dropping any error.
    pub async fn process_event(&self, event: &ChatMessage) -> TurnOutcome {
        match self.handle_event(event).await {
            Ok(outcome) => {
                tracing::debug!(
                    "{}: message {} -> {:?}",
                    self.profile.name,
                    event.id,
                    outcome
                );
                outcome
            }
            Err(e) => {
                tracing::error!(
                    "{}: dropped turn for message {} (guild {:?}, channel {}): {:#}",
                    self.profile.name,
                    event.id,
                    event.channel.guild_id,
                    event.channel.channel_id,
                    e
                );
                TurnOutcome::Dropped
            }
        }
    }

    pub async fn handle_event(&self, event: &ChatMessage) -> Result<TurnOutcome> {
        if !self.in_scope(event) {
            return Ok(TurnOutcome::Ignored);
        }
        let Some(guild_id) = event.channel.guild_id.as_deref() else {
            return Ok(TurnOutcome::Ignored);
        };

        if !self.arbitrator.should_attempt(event) {
            tracing::debug!(
                "{}: not attempting a reply to {} from {}",
                self.profile.name,
                event.id,
                event.author.display_name
            );
            return Ok(TurnOutcome::Skipped);
        }

        self.services.pacing.jitter().await;

        let scope_key = format!("{}:{}:{}", self.bot_id, guild_id, event.channel.channel_id);
        let _scope_guard = self.services.scope_locks.acquire(&scope_key).await;

        let store = &self.services.store;
        let mut conversation = store
            .get_or_create_conversation(&ConversationKey {
                user_id: event.author.id.clone(),
                bot_id: self.bot_id.clone(),
                guild_id: guild_id.to_string(),
                channel_id: event.channel.channel_id.clone(),
            })
            .context("Failed to load conversation")?;
        let mut memory = store
            .get_or_create_memory(&MemoryKey {
                bot_id: self.bot_id.clone(),
                guild_id: guild_id.to_string(),
                channel_id: event.channel.channel_id.clone(),
            })
            .context("Failed to load memory")?;

        let recent = self
            .surface
            .recent_messages(&event.channel, self.settings.max_context_messages)
            .await
            .context("Failed to fetch recent messages")?;

        let directory = &self.services.directory;
        let context = build_context(
            &recent,
            &self.profile.system_prompt,
            &self.persona_names,
            &self.profile.name,
            |name| directory.mention_for(name),
        );

        let validated = self
            .validator
            .obtain_valid_response(&self.profile, &context, &memory)
            .await;

        let Some(validated) = validated else {
            return self.handle_exhaustion(event).await;
        };

        if !validated.should_respond {
            tracing::info!(
                "{}: chose not to respond in {} ({})",
                self.profile.name,
                event.channel.channel_id,
                validated.reason
            );
            return Ok(TurnOutcome::Declined);
        }

        if !self
            .arbitrator
            .should_post(Some(&validated), &self.other_persona_names())
        {
            return Ok(TurnOutcome::Suppressed);
        }

        let Some(text) = validated.reply_text().map(str::to_string) else {
            return Ok(TurnOutcome::Suppressed);
        };

        self.surface
            .post_message(&event.channel, &text)
            .await
            .context("Failed to post reply")?;

        self.commit_turn(event, &text, &mut conversation, &mut memory)
            .await?;

        tracing::info!(
            "{}: replied in {} ({})",
            self.profile.name,
            event.channel.channel_id,
            validated.reason
        );
        Ok(TurnOutcome::Posted(text))
    }

    async fn handle_exhaustion(&self, event: &ChatMessage) -> Result<TurnOutcome> {
        match self.settings.exhaustion_policy {
            ExhaustionPolicy::Fallback => {
                self.surface
                    .post_message(&event.channel, &self.settings.fallback_message)
                    .await
                    .context("Failed to post fallback message")?;
                Ok(TurnOutcome::FallbackPosted)
            }
            ExhaustionPolicy::Drop => Ok(TurnOutcome::Dropped),
        }
    }

    /// Append the exchange and persist both records. Runs only after the reply
    /// is already on the chat surface.
    async fn commit_turn(
        &self,
        event: &ChatMessage,
        reply: &str,
        conversation: &mut Conversation,
        memory: &mut Memory,
    ) -> Result<()> {
        let before = conversation.len();
        conversation.add_turn(trigger_turn(event));
        conversation.add_turn(ChatTurn {
            role: Role::Assistant,
            content: reply.to_string(),
            author: Some(self.profile.name.clone()),
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
        });

        memory.add_note(reply);
        if let Some(summary) = self.maybe_summarize(conversation, before).await {
            memory.add_note(summary);
        }

        self.services
            .store
            .commit_turn(conversation, memory)
            .context("Failed to persist turn")
    }

    /// Summarise the latest window of turns whenever the conversation crosses
    /// a multiple of `memory_summary_every`.
    async fn maybe_summarize(&self, conversation: &Conversation, before: usize) -> Option<String> {
        let every = self.settings.memory_summary_every;
        if every == 0 || before / every == conversation.len() / every {
            return None;
        }

        let skip = conversation.len().saturating_sub(every);
        let mut request = vec![ChatTurn::system(SUMMARY_PROMPT)];
        request.extend(conversation.turns.iter().skip(skip).cloned());

        self.services
            .pacing
            .wait_for_request_slot(self.profile.pacing_key())
            .await;

        match self
            .services
            .backend
            .complete_text(&self.profile, &request)
            .await
        {
            Ok(summary) if !summary.trim().is_empty() => Some(summary.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("{}: memory summary failed: {}", self.profile.name, e);
                None
            }
        }
    }
}

fn trigger_turn(event: &ChatMessage) -> ChatTurn {
    let mut content = event.content.clone();
    if event.has_image() {
        content.push('\n');
        content.push_str(context::IMAGE_MARKER);
    }
    ChatTurn {
        role: if event.author.is_bot {
            Role::Assistant
        } else {
            Role::User
        },
        content,
        author: Some(event.author.display_name.clone()),
        timestamp: Some(event.created_at.timestamp_millis()),
    }
}
