// Lorekeep Runtime — Runtime Handle
//
// The injected state container every entry point hangs off. No static
// globals: rate windows, capability cache, pin counters, and chat scopes
// all live here and die with the handle. Lifecycle is explicit:
// new() → init() → start() … stop().

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::{MailPort, SecretStore, StreamEvent, TaskListPort, UiSink};
use crate::engine::automation::{AutomationEngine, ProviderResolver};
use crate::engine::chat::capability::CapabilityCache;
use crate::engine::chat::pins::PinCounters;
use crate::engine::chat::{run_tool_loop, ChatLoopDeps, ChatOutcome};
use crate::engine::context::{self, KbStrategy};
use crate::engine::embedding::{EmbeddingClient, EmbeddingManager};
use crate::engine::events::EventBus;
use crate::engine::ingest::IntakeServer;
use crate::engine::mission::parsers::{register_mission_parsers, ParserRegistry};
use crate::engine::mission::MissionRunner;
use crate::engine::providers::AnyProvider;
use crate::engine::secrets::CredentialCache;
use crate::engine::store::Store;
use crate::engine::tools::{
    gmail::{gmail_read_definition, gmail_search_definition, GmailReadTool, GmailSearchTool},
    gtasks::{gtasks_create_definition, GtasksCreateTool},
    ToolContext, ToolRegistry,
};
use crate::engine::types::*;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ── Cancellation token ─────────────────────────────────────────────────────

/// Cooperative cancellation, checked at suspension points. Cloning shares
/// the flag.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn bail_if_cancelled(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ── Runtime ────────────────────────────────────────────────────────────────

pub struct Runtime {
    pub store: Arc<Store>,
    pub bus: EventBus,
    pub ui: Arc<dyn UiSink>,
    pub config: Arc<Mutex<RuntimeConfig>>,
    pub credentials: Arc<CredentialCache>,
    pub parsers: Arc<ParserRegistry>,
    pub capabilities: Arc<CapabilityCache>,
    pub pins: Arc<PinCounters>,
    pub embeddings: Arc<EmbeddingManager>,
    pub automation: Arc<AutomationEngine>,
    pub missions: Arc<MissionRunner>,
    mail: Option<Arc<dyn MailPort>>,
    tasks: Option<Arc<dyn TaskListPort>>,
    intake: Mutex<Option<Arc<IntakeServer>>>,
    /// Chat cancel scopes by sender id: a new request from the same sender
    /// aborts the prior one.
    chat_scopes: Mutex<HashMap<String, CancelToken>>,
    initialized: AtomicBool,
}

impl Runtime {
    pub fn new(
        store: Arc<Store>,
        config: RuntimeConfig,
        ui: Arc<dyn UiSink>,
        secret_store: Arc<dyn SecretStore>,
        credential_dir: std::path::PathBuf,
        mail: Option<Arc<dyn MailPort>>,
        tasks: Option<Arc<dyn TaskListPort>>,
    ) -> Arc<Self> {
        let config = Arc::new(Mutex::new(config));
        let bus = EventBus::new();
        let resolver = build_resolver(config.clone());
        let parsers = Arc::new(ParserRegistry::new());

        let automation =
            AutomationEngine::new(store.clone(), ui.clone(), resolver.clone(), mail.clone(), tasks.clone());
        let create_deadlines = config.lock().create_deadlines;
        let missions = MissionRunner::new(
            store.clone(),
            ui.clone(),
            bus.clone(),
            parsers.clone(),
            resolver,
            mail.clone(),
            tasks.clone(),
            create_deadlines,
        );

        let embeddings = Arc::new(EmbeddingManager::new(store.clone()));
        // Vector context is recomputed per query; nothing else memoizes
        // retrieval state, so the post-pass hook just records the refresh.
        embeddings.set_invalidation_hook(Arc::new(|domain_id, model| {
            info!("[runtime] Embeddings refreshed for domain {} ({})", domain_id, model);
        }));

        Arc::new(Runtime {
            embeddings,
            credentials: Arc::new(CredentialCache::new(secret_store, credential_dir)),
            capabilities: Arc::new(CapabilityCache::new()),
            pins: Arc::new(PinCounters::new()),
            chat_scopes: Mutex::new(HashMap::new()),
            intake: Mutex::new(None),
            initialized: AtomicBool::new(false),
            store,
            bus,
            ui,
            config,
            parsers,
            automation,
            missions,
            mail,
            tasks,
        })
    }

    /// Explicit initialization: register mission parsers, then seed default
    /// protocols — in that order, exactly once.
    pub fn init(&self) -> EngineResult<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        register_mission_parsers(&self.parsers);
        self.store.seed_default_protocols()?;
        info!("[runtime] Initialized");
        Ok(())
    }

    /// Start background services: the automation engine (startup jobs,
    /// cron tick, event subscription) and the ingestion server.
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(EngineError::Config("Runtime::init() must run before start()".into()));
        }
        self.automation.start(&self.bus).await?;

        let port = self.config.lock().intake_port;
        let server = Arc::new(IntakeServer::new(self.store.clone(), self.bus.clone(), port));
        if server.clone().start().await? {
            *self.intake.lock() = Some(server);
        }
        info!("[runtime] Started");
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(server) = self.intake.lock().take() {
            server.stop();
        }
        self.automation.stop();
        self.embeddings.cancel_all();
        for (_, token) in self.chat_scopes.lock().drain() {
            token.cancel();
        }
        info!("[runtime] Stopped");
    }

    /// The bearer token of the running ingestion server, if any.
    pub fn intake_token(&self) -> Option<String> {
        self.intake.lock().as_ref().map(|s| s.token().to_string())
    }

    // ── Provider & embedding wiring ────────────────────────────────────

    pub fn resolver(&self) -> ProviderResolver {
        build_resolver(self.config.clone())
    }

    pub fn embedding_client(&self) -> Option<Arc<EmbeddingClient>> {
        let config = self.config.lock();
        match (&config.embedding_base_url, &config.embedding_model) {
            (Some(url), Some(model)) if !url.is_empty() && !model.is_empty() => {
                Some(Arc::new(EmbeddingClient::new(url, model)))
            }
            _ => None,
        }
    }

    fn tool_registry(&self, domain: &Domain) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        if !domain.allow_integrations {
            return registry;
        }
        if let Some(mail) = &self.mail {
            registry.register(gmail_search_definition(), Arc::new(GmailSearchTool { mail: mail.clone() }));
            registry.register(gmail_read_definition(), Arc::new(GmailReadTool { mail: mail.clone() }));
        }
        registry.register(gtasks_create_definition(), Arc::new(GtasksCreateTool { tasks: self.tasks.clone() }));
        registry
    }

    // ── Chat ───────────────────────────────────────────────────────────

    /// One chat turn for a sender. Scoped per sender id: a newer request
    /// from the same sender cancels the one in flight (last-writer-wins).
    pub async fn run_chat_turn(
        self: &Arc<Self>,
        sender_id: &str,
        session_id: &str,
        domain_id: &str,
        user_text: &str,
    ) -> EngineResult<ChatOutcome> {
        let cancel = CancelToken::new();
        if let Some(previous) = self
            .chat_scopes
            .lock()
            .insert(sender_id.to_string(), cancel.clone())
        {
            previous.cancel();
        }

        let domain = self
            .store
            .get_domain(domain_id)?
            .ok_or_else(|| EngineError::Validation(format!("unknown domain {domain_id}")))?;
        let Some((provider, model)) = (self.resolver())(&domain) else {
            return Err(EngineError::Config("no provider configured for domain".into()));
        };

        if self.store.get_chat_session(session_id)?.is_none() {
            self.store.create_chat_session(session_id, domain_id)?;
        }
        self.store
            .append_chat_message(session_id, &ChatMessage::user(user_text))?;
        let mut messages = self.store.load_chat_messages(session_id)?;

        // Pin detection: explicit deadline/urgency talk forces KB context
        // for the next few turns.
        let lowered = user_text.to_lowercase();
        if lowered.contains("deadline") || lowered.contains("overdue") || lowered.contains("due date") {
            self.pins.arm_force_kb(domain_id, "deadline mentioned in chat");
        }

        let system_prompt = self.assemble_system_prompt(&domain, user_text).await?;
        let persisted_before = messages.len();

        let deps = ChatLoopDeps {
            provider,
            model,
            base_url: None,
            tools: self.tool_registry(&domain),
            ui: self.ui.clone(),
            capabilities: self.capabilities.clone(),
        };
        let ctx = ToolContext { domain_id: domain_id.to_string(), session_id: session_id.to_string() };

        let outcome = run_tool_loop(&deps, &mut messages, Some(&system_prompt), &ctx, &cancel).await?;

        // Persist everything the loop appended, skipping ephemeral notes.
        for message in &messages[persisted_before.min(messages.len())..] {
            if let ChatMessage::User { content } = message {
                if content.starts_with("[System note:") {
                    continue;
                }
                // Other user entries from the loop are synthetic too; the
                // real user message was persisted above.
                continue;
            }
            self.store.append_chat_message(session_id, message)?;
        }

        // Rolling summary, then pin decay — exactly once per completed turn.
        if !outcome.cancelled {
            let previous = self.store.get_conversation_summary(session_id)?;
            let summary = crate::engine::chat::summary::update_summary(previous.as_deref(), &messages);
            self.store.set_conversation_summary(session_id, &summary)?;
            self.pins.decay_turn(domain_id);
        }

        Ok(outcome)
    }

    /// Streaming completion for a no-tools turn (UI deltas come straight
    /// from the provider). Kept for callers that want live streaming.
    pub async fn stream_plain_turn(
        self: &Arc<Self>,
        sender_id: &str,
        session_id: &str,
        domain_id: &str,
        user_text: &str,
    ) -> EngineResult<String> {
        let cancel = CancelToken::new();
        if let Some(previous) = self
            .chat_scopes
            .lock()
            .insert(sender_id.to_string(), cancel.clone())
        {
            previous.cancel();
        }

        let domain = self
            .store
            .get_domain(domain_id)?
            .ok_or_else(|| EngineError::Validation(format!("unknown domain {domain_id}")))?;
        let Some((provider, model)) = (self.resolver())(&domain) else {
            return Err(EngineError::Config("no provider configured for domain".into()));
        };

        if self.store.get_chat_session(session_id)?.is_none() {
            self.store.create_chat_session(session_id, domain_id)?;
        }
        self.store
            .append_chat_message(session_id, &ChatMessage::user(user_text))?;
        let messages = self.store.load_chat_messages(session_id)?;
        let system_prompt = self.assemble_system_prompt(&domain, user_text).await?;

        let mut stream = provider
            .chat(&messages, Some(&system_prompt), &model)
            .await
            .map_err(|e| EngineError::provider(provider.name(), e.to_string()))?;

        let mut text = String::new();
        let mut cancelled = false;
        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            match stream.next().await {
                Some(Ok(StreamEvent::Text(chunk))) => {
                    text.push_str(&chunk);
                    self.ui.emit(UiEvent::ChatDelta {
                        session_id: session_id.to_string(),
                        text: chunk,
                    });
                }
                Some(Ok(StreamEvent::Done { .. })) | None => break,
                Some(Err(e)) => {
                    return Err(EngineError::provider(provider.name(), e.to_string()));
                }
            }
        }

        self.store.append_chat_message(
            session_id,
            &ChatMessage::assistant(provider.synthesize_raw(&text), text.clone()),
        )?;
        self.ui.emit(UiEvent::ChatComplete {
            session_id: session_id.to_string(),
            text: text.clone(),
            cancelled,
        });
        if !cancelled {
            self.pins.decay_turn(domain_id);
        }
        Ok(text)
    }

    /// System prompt assembly: protocols, then vector context when the
    /// domain has usable embeddings, else the string-strategy fallback
    /// (full KB while a force_kb pin is armed, digests otherwise).
    async fn assemble_system_prompt(&self, domain: &Domain, query: &str) -> EngineResult<String> {
        let mut prompt = format!("You are the assistant for the '{}' domain.\n", domain.name);
        for (name, body) in self.store.list_protocols(&domain.id)? {
            prompt.push_str(&format!("\n[protocol:{name}] {body}\n"));
        }

        let budget = self.config.lock().context_token_budget;
        let mut used_vectors = false;
        if let Some(client) = self.embedding_client() {
            let staleness = HashMap::new();
            match context::build_vector_context(
                &self.store,
                &client,
                &domain.id,
                query,
                12,
                budget,
                &staleness,
            )
            .await
            {
                Ok(Some(sections)) => {
                    prompt.push_str("\n## Knowledge base\n");
                    prompt.push_str(&context::render_sections(&sections));
                    used_vectors = true;
                }
                Ok(None) => {}
                Err(e) => warn!("[runtime] Vector context failed — falling back: {}", e),
            }
        }

        if !used_vectors {
            let (force, _reason) = self.pins.force_kb(&domain.id);
            let strategy = if force > 0 { KbStrategy::Full } else { KbStrategy::DigestOnly };
            let fallback = context::build_fallback_context(&self.store, &domain.id, strategy, budget * 4)?;
            if !fallback.is_empty() {
                prompt.push_str("\n## Knowledge base\n");
                prompt.push_str(&fallback);
            }
        }
        Ok(prompt)
    }
}

/// Resolver honoring domain overrides, falling back to the configured
/// default provider and model.
fn build_resolver(config: Arc<Mutex<RuntimeConfig>>) -> ProviderResolver {
    Arc::new(move |domain: &Domain| {
        let config = config.lock();
        let provider_id = domain
            .provider_override
            .as_deref()
            .or(config.default_provider.as_deref())?;
        let provider_config = config.providers.iter().find(|p| p.id == provider_id)?;
        let model = domain
            .model_override
            .clone()
            .or_else(|| provider_config.default_model.clone())
            .or_else(|| config.default_model.clone())?;
        Some((AnyProvider::from_config(provider_config), model))
    })
}
