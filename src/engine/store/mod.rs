// Lorekeep Runtime — Store
// Typed CRUD over the local SQLite database via rusqlite.
// Single-writer lock domain: the connection mutex is the write lock;
// readers share it because SQLite connections are not Sync.
//
// Module layout:
//   schema      — idempotent migrations, run once at open
//   domains     — domain CRUD (deletion cascades)
//   kb          — KB files + chunk sync (insert new, update changed, delete orphans)
//   embeddings  — chunk embeddings, staleness queries, f32 blob codec, jobs
//   automations — automation CRUD + streak/cooldown/duplicate counters
//   runs        — automation run rows, dedupe insert, crash recovery, retention
//   missions    — missions, runs, outputs, gates, actions
//   intake      — intake items + dedupe-check
//   chat        — chat sessions, messages, conversation summaries
//   config      — key/value runtime config store
//   protocols   — per-domain protocol documents + default seeding

use crate::atoms::error::EngineResult;
use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

mod automations;
mod chat;
mod config;
mod domains;
pub(crate) mod embeddings;
mod intake;
mod kb;
mod missions;
mod protocols;
mod runs;
mod schema;

pub use automations::AutomationSpec;
pub use embeddings::{bytes_to_f32_vec, f32_vec_to_bytes};

/// Default database location under the user's data directory.
pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lorekeep")
        .join("lorekeep.db")
}

/// Thread-safe database wrapper.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("[store] Opening database at {:?}", path);

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();

        schema::run_migrations(&conn)?;

        Ok(Store { conn: Mutex::new(conn) })
    }

    /// In-memory store with the full schema. Used by tests.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();
        schema::run_migrations(&conn)?;
        Ok(Store { conn: Mutex::new(conn) })
    }
}

/// Current UTC timestamp in RFC 3339, the canonical stored form.
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
