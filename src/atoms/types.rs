// ── Lorekeep Atoms: Pure Data Types ────────────────────────────────────────
// All plain struct/enum definitions with no logic beyond trivial accessors.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.
//
// These types are re-exported from engine/types.rs via
//   pub use crate::atoms::types::*;
// so engine code imports one flat vocabulary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Domains ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,
    pub name: String,
    /// Root directory of this domain's knowledge base on disk.
    pub kb_root: String,
    pub provider_override: Option<String>,
    pub model_override: Option<String>,
    /// Whether automations in this domain may touch external integrations
    /// (mail drafts, task lists).
    pub allow_integrations: bool,
    pub sort_order: i64,
    pub created_at: String,
    pub updated_at: String,
}

// ── Knowledge base files & chunks ──────────────────────────────────────────

/// Tier controls which write modes a KB file accepts:
/// `structural` accepts only `patch`; the rest accept `full` or `append`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KbTier {
    Structural,
    Status,
    Intelligence,
    General,
}

impl KbTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            KbTier::Structural => "structural",
            KbTier::Status => "status",
            KbTier::Intelligence => "intelligence",
            KbTier::General => "general",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "structural" => Some(KbTier::Structural),
            "status" => Some(KbTier::Status),
            "intelligence" => Some(KbTier::Intelligence),
            "general" => Some(KbTier::General),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Full,
    Append,
    Patch,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Full => "full",
            WriteMode::Append => "append",
            WriteMode::Patch => "patch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(WriteMode::Full),
            "append" => Some(WriteMode::Append),
            "patch" => Some(WriteMode::Patch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbFile {
    pub id: String,
    pub domain_id: String,
    /// Unique within the domain.
    pub relative_path: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub last_synced_at: String,
    pub tier: KbTier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbChunk {
    pub id: String,
    pub kb_file_id: String,
    pub domain_id: String,
    /// Stable within the file; `UNIQUE(kb_file_id, chunk_key)`.
    pub chunk_key: String,
    pub content: String,
    pub content_hash: String,
    /// Hash of the whole file at the time this chunk was synced.
    pub file_content_hash: String,
    pub ordinal: i64,
    pub heading_path: String,
    pub char_count: i64,
    pub token_estimate: i64,
    pub line_start: Option<i64>,
    pub line_end: Option<i64>,
}

/// A chunk as produced by the chunker, before it has a row identity.
#[derive(Debug, Clone)]
pub struct ChunkInput {
    pub chunk_key: String,
    pub content: String,
    pub content_hash: String,
    pub ordinal: i64,
    pub heading_path: String,
    pub token_estimate: i64,
    pub line_start: Option<i64>,
    pub line_end: Option<i64>,
}

// ── Embeddings ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChunkEmbedding {
    pub id: String,
    pub chunk_id: String,
    pub model_name: String,
    pub dimensions: i64,
    /// L2-normalized vector, decoded from the little-endian f32 blob.
    pub vector: Vec<f32>,
    /// Chunk content hash snapshotted at embed time.
    pub content_hash: String,
    pub provider_fingerprint: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Running,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(JobStatus::Idle),
            "running" => Some(JobStatus::Running),
            "error" => Some(JobStatus::Error),
            _ => None,
        }
    }
}

/// One row per `(domain_id, model_name)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingJob {
    pub domain_id: String,
    pub model_name: String,
    pub status: JobStatus,
    pub total_files: i64,
    pub processed_files: i64,
    pub total_chunks: i64,
    pub embedded_chunks: i64,
    pub last_error: Option<String>,
    pub provider_fingerprint: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

// ── Automations ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Schedule,
    Event,
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Schedule => "schedule",
            TriggerKind::Event => "event",
            TriggerKind::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "schedule" => Some(TriggerKind::Schedule),
            "event" => Some(TriggerKind::Event),
            "manual" => Some(TriggerKind::Manual),
            _ => None,
        }
    }
}

/// Fixed enum of bus events an automation may subscribe to. Doubles as the
/// event-bus kind discriminant so triggers and emissions share one vocabulary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BusEventKind {
    IntakeCreated,
    KbFileChanged,
    DeadlineApproaching,
    MissionCompleted,
}

impl BusEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusEventKind::IntakeCreated => "intake_created",
            BusEventKind::KbFileChanged => "kb_file_changed",
            BusEventKind::DeadlineApproaching => "deadline_approaching",
            BusEventKind::MissionCompleted => "mission_completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "intake_created" => Some(BusEventKind::IntakeCreated),
            "kb_file_changed" => Some(BusEventKind::KbFileChanged),
            "deadline_approaching" => Some(BusEventKind::DeadlineApproaching),
            "mission_completed" => Some(BusEventKind::MissionCompleted),
            _ => None,
        }
    }
}

/// An event flowing through the in-process bus. An empty `domain_id` is a
/// wildcard: pre-classification intake has no domain yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub kind: BusEventKind,
    pub domain_id: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Notification,
    CreateGtask,
    DraftGmail,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Notification => "notification",
            ActionKind::CreateGtask => "create_gtask",
            ActionKind::DraftGmail => "draft_gmail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "notification" => Some(ActionKind::Notification),
            "create_gtask" => Some(ActionKind::CreateGtask),
            "draft_gmail" => Some(ActionKind::DraftGmail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub domain_id: String,
    pub name: String,
    pub prompt_template: String,
    pub trigger_kind: TriggerKind,
    /// Set iff trigger_kind == Schedule.
    pub trigger_cron: Option<String>,
    /// Set iff trigger_kind == Event.
    pub trigger_event: Option<BusEventKind>,
    pub action_kind: ActionKind,
    /// Opaque per-action configuration.
    pub action_config: Value,
    pub enabled: bool,
    pub failure_streak: i64,
    pub cooldown_until: Option<String>,
    pub run_count: i64,
    pub last_run_at: Option<String>,
    pub store_payloads: bool,
    /// Schedule triggers only: fire once at startup if a match was missed.
    pub catch_up_enabled: bool,
    /// deadline_approaching triggers only.
    pub deadline_window_days: Option<i64>,
    pub duplicate_skip_count: i64,
    pub last_duplicate_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "skipped" => Some(RunStatus::Skipped),
            _ => None,
        }
    }
}

/// Fixed error-code enum for automation runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorCode {
    AutomationDisabled,
    CooldownActive,
    RateLimited,
    ProviderNotConfigured,
    LlmError,
    Timeout,
    TemplateRenderError,
    ActionExecutionError,
    MissingOauthScope,
    GtasksNotConnected,
    InvalidActionConfig,
    CrashRecovery,
}

impl RunErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunErrorCode::AutomationDisabled => "automation_disabled",
            RunErrorCode::CooldownActive => "cooldown_active",
            RunErrorCode::RateLimited => "rate_limited",
            RunErrorCode::ProviderNotConfigured => "provider_not_configured",
            RunErrorCode::LlmError => "llm_error",
            RunErrorCode::Timeout => "timeout",
            RunErrorCode::TemplateRenderError => "template_render_error",
            RunErrorCode::ActionExecutionError => "action_execution_error",
            RunErrorCode::MissingOauthScope => "missing_oauth_scope",
            RunErrorCode::GtasksNotConnected => "gtasks_not_connected",
            RunErrorCode::InvalidActionConfig => "invalid_action_config",
            RunErrorCode::CrashRecovery => "crash_recovery",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "automation_disabled" => Some(Self::AutomationDisabled),
            "cooldown_active" => Some(Self::CooldownActive),
            "rate_limited" => Some(Self::RateLimited),
            "provider_not_configured" => Some(Self::ProviderNotConfigured),
            "llm_error" => Some(Self::LlmError),
            "timeout" => Some(Self::Timeout),
            "template_render_error" => Some(Self::TemplateRenderError),
            "action_execution_error" => Some(Self::ActionExecutionError),
            "missing_oauth_scope" => Some(Self::MissingOauthScope),
            "gtasks_not_connected" => Some(Self::GtasksNotConnected),
            "invalid_action_config" => Some(Self::InvalidActionConfig),
            "crash_recovery" => Some(Self::CrashRecovery),
            _ => None,
        }
    }

    /// Codes that never count toward the failure streak: the user must fix
    /// configuration or connectivity, retrying won't change the outcome.
    pub fn is_streak_exempt(&self) -> bool {
        matches!(
            self,
            RunErrorCode::MissingOauthScope
                | RunErrorCode::RateLimited
                | RunErrorCode::GtasksNotConnected
                | RunErrorCode::InvalidActionConfig
                | RunErrorCode::CrashRecovery
        )
    }

    /// Codes that escalate the backoff cooldown ladder.
    pub fn is_backoff_code(&self) -> bool {
        matches!(self, RunErrorCode::LlmError | RunErrorCode::Timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRun {
    pub id: String,
    pub automation_id: String,
    pub domain_id: String,
    pub trigger_kind: TriggerKind,
    pub trigger_event: Option<BusEventKind>,
    /// Snapshot of the trigger payload, if store_payloads is on.
    pub trigger_data: Option<Value>,
    /// Globally UNIQUE.
    pub dedupe_key: String,
    pub status: RunStatus,
    pub error_code: Option<RunErrorCode>,
    pub error_message: Option<String>,
    pub prompt_hash: Option<String>,
    pub response_hash: Option<String>,
    pub action_result: Option<Value>,
    pub action_external_id: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_ms: Option<i64>,
}

// ── Missions ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: String,
    pub name: String,
    /// Opaque definition, hashed canonically (deep-sorted keys).
    pub definition: Value,
    pub enabled: bool,
    /// Domains this mission may run against.
    pub domain_ids: Vec<String>,
    /// Parameter schema with defaults, merged into run inputs.
    pub param_schema: Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MissionRunStatus {
    Pending,
    Running,
    Gated,
    Success,
    Failed,
    Cancelled,
}

impl MissionRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionRunStatus::Pending => "pending",
            MissionRunStatus::Running => "running",
            MissionRunStatus::Gated => "gated",
            MissionRunStatus::Success => "success",
            MissionRunStatus::Failed => "failed",
            MissionRunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "gated" => Some(Self::Gated),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Digest of what the context-assembly step actually consumed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub digest_hashes: Vec<String>,
    pub health_hash: Option<String>,
    pub digest_chars: i64,
    pub health_chars: i64,
    pub overdue_external_tasks: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionRun {
    pub id: String,
    pub mission_id: String,
    pub domain_id: String,
    /// Caller-provided id used for cancel-by-request.
    pub request_id: Option<String>,
    pub inputs: Value,
    pub definition_hash: String,
    pub prompt_hash: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub context_snapshot: Option<ContextSnapshot>,
    pub status: MissionRunStatus,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Append-only artifact row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionRunOutput {
    pub id: String,
    pub run_id: String,
    /// "raw" or a parsed type tag.
    pub kind: String,
    pub content: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Pending,
    Approved,
    Rejected,
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateStatus::Pending => "pending",
            GateStatus::Approved => "approved",
            GateStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(GateStatus::Pending),
            "approved" => Some(GateStatus::Approved),
            "rejected" => Some(GateStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionRunGate {
    pub id: String,
    pub run_id: String,
    pub gate_id: String,
    pub message: String,
    pub status: GateStatus,
    pub decided_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MissionActionStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl MissionActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionActionStatus::Pending => "pending",
            MissionActionStatus::Success => "success",
            MissionActionStatus::Failed => "failed",
            MissionActionStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// A side effect queued at gate time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionRunAction {
    pub id: String,
    pub run_id: String,
    /// "create_deadline", "draft_email", …
    pub action_type: String,
    pub payload: Value,
    pub status: MissionActionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: String,
}

// ── Intake ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IntakeSourceType {
    Web,
    Gmail,
    Gtasks,
    Manual,
}

impl IntakeSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntakeSourceType::Web => "web",
            IntakeSourceType::Gmail => "gmail",
            IntakeSourceType::Gtasks => "gtasks",
            IntakeSourceType::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "web" => Some(IntakeSourceType::Web),
            "gmail" => Some(IntakeSourceType::Gmail),
            "gtasks" => Some(IntakeSourceType::Gtasks),
            "manual" => Some(IntakeSourceType::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeItem {
    pub id: String,
    pub source_type: IntakeSourceType,
    /// Unique together with source_type.
    pub external_id: String,
    pub source_url: Option<String>,
    pub title: String,
    pub content: String,
    pub extraction_mode: Option<String>,
    pub classification: Option<String>,
    pub status: String,
    pub metadata: Option<Value>,
    pub created_at: String,
}

// ── Chat transcript ────────────────────────────────────────────────────────

/// One transcript entry. The assistant's `raw_message` is the provider's
/// source-of-truth object, opaque to the loop; `derived_text` is a UI
/// projection only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_message: Option<Value>,
        derived_text: String,
    },
    Tool {
        tool_call_id: String,
        tool_name: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage::User { content: content.into() }
    }

    pub fn assistant(raw_message: Value, derived_text: impl Into<String>) -> Self {
        ChatMessage::Assistant {
            raw_message: Some(raw_message),
            derived_text: derived_text.into(),
        }
    }

    pub fn tool(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        ChatMessage::Tool {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub raw_message_json: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub domain_id: String,
    pub label: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: i64,
}

// ── Tool calling ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-Schema for the tool input. Deep-cloned before handing to
    /// adapters — adapters may mutate.
    pub input_schema: Value,
}

/// A tool invocation the model requested in a tool round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other(String),
}

/// Non-streaming tool-use completion result. `raw_message` must round-trip
/// byte-equal into the next provider call.
#[derive(Debug, Clone)]
pub struct ToolUseResponse {
    pub raw_message: Value,
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub stop_reason: StopReason,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

// ── Provider configuration ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub api_key: String,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAI,
    Ollama,
    Custom,
}

impl ProviderKind {
    pub fn default_base_url(&self) -> &str {
        match self {
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::OpenAI => "https://api.openai.com/v1",
            ProviderKind::Ollama => "http://localhost:11434",
            ProviderKind::Custom => "",
        }
    }
}

// ── UI events ──────────────────────────────────────────────────────────────

/// Events surfaced to whatever front end hosts the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UiEvent {
    /// A user-facing notification (automation action, self-disable notice).
    Notification { title: String, body: String },
    /// A text delta from a chat or mission stream.
    ChatDelta { session_id: String, text: String },
    /// The chat turn finished.
    ChatComplete { session_id: String, text: String, cancelled: bool },
    /// Mission progress: step transitions and llm_chunk events.
    MissionProgress { run_id: String, event: String, detail: String },
    /// A mission run finished.
    MissionComplete { run_id: String, status: String },
    /// Embedding/indexing progress for a domain.
    IndexProgress {
        domain_id: String,
        processed_files: i64,
        total_files: i64,
        embedded_chunks: i64,
        total_chunks: i64,
    },
}

// ── Runtime configuration ──────────────────────────────────────────────────

fn default_intake_port() -> u16 {
    4765
}

fn default_token_budget() -> usize {
    6_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub providers: Vec<ProviderConfig>,
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
    pub embedding_base_url: Option<String>,
    pub embedding_model: Option<String>,
    #[serde(default = "default_intake_port")]
    pub intake_port: u16,
    /// Token budget for vector context assembly.
    #[serde(default = "default_token_budget")]
    pub context_token_budget: usize,
    /// Mission side-effect policy: whether create_deadline actions gate.
    #[serde(default)]
    pub create_deadlines: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            providers: vec![],
            default_provider: None,
            default_model: None,
            embedding_base_url: None,
            embedding_model: None,
            intake_port: default_intake_port(),
            context_token_budget: default_token_budget(),
            create_deadlines: false,
        }
    }
}
