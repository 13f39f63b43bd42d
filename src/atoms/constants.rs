// ── Lorekeep Atoms: Constants ──────────────────────────────────────────────
// All named constants for the crate live here.
// Rationale: collecting constants in one place eliminates magic numbers,
// makes auditing easier, and keeps every layer's code self-documenting.

// ── Automation engine rate limits ──────────────────────────────────────────
// Three sliding windows checked in order: per-automation, per-domain, global.
// All counters are in-memory and reset when the engine stops.
pub(crate) const RATE_PER_AUTOMATION_MAX: usize = 1;
pub(crate) const RATE_PER_AUTOMATION_WINDOW_SECS: i64 = 60;
pub(crate) const RATE_PER_DOMAIN_MAX: usize = 10;
pub(crate) const RATE_PER_DOMAIN_WINDOW_SECS: i64 = 3_600;
pub(crate) const RATE_GLOBAL_MAX: usize = 30;
pub(crate) const RATE_GLOBAL_WINDOW_SECS: i64 = 3_600;

// ── Automation engine guards & recovery ────────────────────────────────────
/// Cooldown applied when an execution is refused by the rate limiter.
pub(crate) const RATE_LIMIT_COOLDOWN_SECS: i64 = 300;
/// Consecutive non-exempt failures before an automation self-disables.
pub(crate) const FAILURE_STREAK_DISABLE_AT: u32 = 5;
/// Backoff cooldown ladder for llm_error / timeout, indexed by attempt.
pub(crate) const BACKOFF_COOLDOWN_SECS: [i64; 4] = [60, 300, 900, 3_600];
/// Concurrent LLM calls allowed across all automation runs.
pub(crate) const AUTOMATION_LLM_PERMITS: usize = 3;
/// Ceiling on a single automation LLM call before it fails as timeout.
pub(crate) const AUTOMATION_LLM_TIMEOUT_SECS: u64 = 120;
/// Runs still `pending` older than this are failed as crash_recovery.
pub(crate) const CRASH_RECOVERY_PENDING_MINS: i64 = 10;
/// Runs still `running` older than this are failed as crash_recovery.
pub(crate) const CRASH_RECOVERY_RUNNING_MINS: i64 = 20;
/// Retention: delete runs older than this AND beyond the newest N per automation.
pub(crate) const RUN_RETENTION_DAYS: i64 = 90;
pub(crate) const RUN_RETENTION_KEEP: i64 = 200;
/// How far back catch-up searches for the last cron match.
pub(crate) const CATCH_UP_LOOKBACK_DAYS: i64 = 7;
/// Retention cleanup repeats on this interval.
pub(crate) const RETENTION_INTERVAL_HOURS: i64 = 24;

// ── Chat tool-loop bounds ──────────────────────────────────────────────────
pub(crate) const MAX_TOOL_ROUNDS: u32 = 5;
pub(crate) const MAX_TOOL_CALLS_PER_ROUND: usize = 5;
/// Tool output is byte-truncated at the last newline before this cap.
pub(crate) const TOOL_OUTPUT_CAP_BYTES: usize = 75 * 1024;
pub(crate) const TOOL_OUTPUT_TRUNCATION_SUFFIX: &str = "\n[truncated at 75KB]";
/// Cumulative transcript bytes beyond which the loop exits to a completion.
pub(crate) const TRANSCRIPT_BUDGET_BYTES: usize = 400 * 1024;
/// Base64 runs longer than this are stripped from tool output.
pub(crate) const SECRET_BASE64_MIN_LEN: usize = 200;

// ── Conversation summary ───────────────────────────────────────────────────
pub(crate) const SUMMARY_MAX_CHARS: usize = 1_600;

// ── Shared pin counters ────────────────────────────────────────────────────
/// advisory_pin and force_kb are clamped to this ceiling and decay by one
/// after each completed chat turn.
pub(crate) const PIN_MAX: u8 = 3;

// ── Embedding / indexing ───────────────────────────────────────────────────
/// Chunks shorter than this are never embedded.
pub(crate) const MIN_EMBED_CHARS: usize = 10;

// ── Ingestion server ───────────────────────────────────────────────────────
pub(crate) const INTAKE_RATE_LIMIT_MAX: usize = 30;
pub(crate) const INTAKE_RATE_LIMIT_WINDOW_SECS: u64 = 60;
/// Intake item content is capped at this size; request bodies may exceed it
/// by a small envelope allowance before being rejected outright.
pub(crate) const MAX_INTAKE_CONTENT_BYTES: usize = 256 * 1024;
pub(crate) const INTAKE_BODY_ENVELOPE_BYTES: usize = 1_024;
pub(crate) const INTAKE_BIND_RETRIES: u32 = 3;
pub(crate) const INTAKE_BIND_RETRY_DELAY_SECS: u64 = 2;
pub(crate) const INTAKE_HEADERS_TIMEOUT_SECS: u64 = 10;
pub(crate) const INTAKE_REQUEST_TIMEOUT_SECS: u64 = 30;

// ── Event bus ──────────────────────────────────────────────────────────────
/// Per-event serialized size cap; data.metadata is truncated on overflow.
pub(crate) const EVENT_SIZE_CAP_BYTES: usize = 20 * 1024;

// ── OAuth loopback ─────────────────────────────────────────────────────────
pub(crate) const OAUTH_FLOW_CEILING_SECS: u64 = 120;
pub(crate) const OAUTH_STATE_BYTES: usize = 16;
pub(crate) const OAUTH_PKCE_VERIFIER_BYTES: usize = 32;
