use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Receiver;
use futures_util::future::join_all;

use crate::chat::{ChatMessage, ChatSurface};
use crate::config::ChorusConfig;
use crate::database::ChorusDatabase;
use crate::directory::BotDirectory;
use crate::http_client::build_http_client;
use crate::llm_client::{CompletionBackend, LlmClient};
use crate::pacing::Pacing;
use crate::persona::{Persona, PersonaServices, TurnOutcome, TurnSettings};
use crate::scope_lock::ScopeLocks;
use crate::store::ScopeStore;

struct PersonaBinding {
    bot_id: String,
    surface: Arc<dyn ChatSurface>,
}

pub struct ChorusRuntime {
    pub config: ChorusConfig,
    pub directory: Arc<BotDirectory>,
    personas: Arc<Vec<Arc<Persona>>>,
}

pub struct ChorusRuntimeBuilder {
    config: ChorusConfig,
    backend: Option<Arc<dyn CompletionBackend>>,
    store: Option<Arc<dyn ScopeStore>>,
    bindings: HashMap<String, PersonaBinding>,
}

impl ChorusRuntimeBuilder {
    pub fn new(config: ChorusConfig) -> Self {
        Self {
            config,
            backend: None,
            store: None,
            bindings: HashMap::new(),
        }
    }

    /// Use `backend` instead of the HTTP client built from `llm_api_url`.
    pub fn with_backend(mut self, backend: Arc<dyn CompletionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use `store` instead of opening `database_path`.
    pub fn with_store(mut self, store: Arc<dyn ScopeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach the chat connection the named persona speaks through.
    pub fn with_persona_surface(
        mut self,
        name: impl Into<String>,
        bot_id: impl Into<String>,
        surface: Arc<dyn ChatSurface>,
    ) -> Self {
        self.bindings.insert(
            name.into(),
            PersonaBinding {
                bot_id: bot_id.into(),
                surface,
            },
        );
        self
    }

    pub fn build(self) -> Result<ChorusRuntime> {
        let config = self.config;

        let store: Arc<dyn ScopeStore> = match self.store {
            Some(store) => store,
            None => Arc::new(
                ChorusDatabase::new(&config.database_path).with_context(|| {
                    format!("Failed to open chorus database at {}", config.database_path)
                })?,
            ),
        };

        let backend: Arc<dyn CompletionBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(LlmClient::new(
                config.llm_api_url.clone(),
                build_http_client()?,
            )),
        };

        let directory = Arc::new(BotDirectory::load(store.clone())?);
        for (name, binding) in &self.bindings {
            directory
                .register(name, &binding.bot_id)
                .with_context(|| format!("Failed to register bot id for '{}'", name))?;
        }

        let services = PersonaServices {
            store,
            directory: directory.clone(),
            backend,
            pacing: Arc::new(Pacing::from_config(&config)),
            scope_locks: Arc::new(ScopeLocks::new()),
        };
        let settings = TurnSettings::from_config(&config);
        let persona_names = config.persona_names();

        let mut personas = Vec::new();
        for profile in &config.personas {
            let Some(binding) = self.bindings.get(&profile.name) else {
                tracing::warn!(
                    "Persona '{}' has no chat connection; it will stay silent",
                    profile.name
                );
                continue;
            };
            if profile.api_key.trim().is_empty() {
                tracing::warn!("Persona '{}' has no API key configured", profile.name);
            }
            tracing::info!(
                "Persona '{}' ready (model: {}, bot id: {})",
                profile.name,
                profile.model,
                binding.bot_id
            );
            personas.push(Arc::new(Persona::new(
                profile.clone(),
                binding.bot_id.clone(),
                persona_names.clone(),
                binding.surface.clone(),
                services.clone(),
                settings.clone(),
            )));
        }

        if personas.is_empty() {
            anyhow::bail!("No personas configured with a chat connection");
        }

        Ok(ChorusRuntime {
            config,
            directory,
            personas: Arc::new(personas),
        })
    }
}

impl ChorusRuntime {
    pub fn persona_count(&self) -> usize {
        self.personas.len()
    }

    /// Offer one event to every persona concurrently.
    pub async fn dispatch(&self, event: ChatMessage) -> Vec<TurnOutcome> {
        dispatch_to(&self.personas, &event).await
    }

    /// Consume inbound events until every sender is dropped. Each event runs
    /// in its own task so a slow turn never blocks the next delivery.
    pub async fn run(&self, events: Receiver<ChatMessage>) {
        tracing::info!(
            "Chorus runtime listening with {} persona(s)",
            self.personas.len()
        );

        let mut tasks = Vec::new();
        while let Ok(event) = events.recv_async().await {
            let personas = self.personas.clone();
            tasks.push(tokio::spawn(async move {
                dispatch_to(&personas, &event).await;
            }));
            tasks.retain(|task| !task.is_finished());
        }

        for result in join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!("Event task failed: {}", e);
            }
        }
        tracing::info!("Event stream closed, runtime stopping");
    }
}

async fn dispatch_to(personas: &[Arc<Persona>], event: &ChatMessage) -> Vec<TurnOutcome> {
    join_all(personas.iter().map(|persona| persona.process_event(event))).await
}
