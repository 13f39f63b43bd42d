// ── Lorekeep Atoms: Error Types ────────────────────────────────────────────
// Single canonical error enum for the runtime, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Provider, Config…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • Unique-constraint violations surface as the dedicated `Duplicate`
//     variant so callers can branch on duplicates without inspecting SQL
//     error text.
//   • No variant carries secret material (API keys, tokens) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    /// A UNIQUE constraint rejected the write. The message names the
    /// conflicting key so callers can log it without re-querying.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// AI provider HTTP or API-level failure (non-secret detail only).
    #[error("Provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    /// Tool execution failure.
    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    /// Runtime or automation configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed input, missing required field, schema violation.
    /// Never retried automatically.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Authentication / authorization failure.
    #[error("Auth error: {0}")]
    Auth(String),

    /// OS keychain / credential store failure.
    #[error("Keyring error: {0}")]
    Keyring(String),

    /// Invalid transcript state, impossible DB state — aborts the current
    /// operation, logged prominently, the process stays up.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// The operation was cancelled by its cooperative cancel token.
    #[error("Cancelled")]
    Cancelled,

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── rusqlite conversion with duplicate detection ───────────────────────────
// SQLITE_CONSTRAINT_UNIQUE / SQLITE_CONSTRAINT_PRIMARYKEY map to Duplicate;
// everything else stays a Database error.

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(err, ref msg) = e {
            use rusqlite::ErrorCode;
            if err.code == ErrorCode::ConstraintViolation
                && matches!(err.extended_code, 1555 | 2067)
            {
                return EngineError::Duplicate(
                    msg.clone().unwrap_or_else(|| "unique constraint".into()),
                );
            }
        }
        EngineError::Database(e)
    }
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create a provider error with name and message.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider { provider: provider.into(), message: message.into() }
    }

    /// Create a tool error with name and message.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool { tool: tool.into(), message: message.into() }
    }

    /// True for the dedicated unique-violation variant.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, EngineError::Duplicate(_))
    }
}

// ── Migration bridge: String → EngineError ─────────────────────────────────
// Allows `?` on helpers that return `Result<T, String>` inside functions
// that return `EngineResult<T>`.

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All runtime operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}
