// Database schema for the Lorekeep store.
// Called once at open after WAL is enabled.
// Adding a new table or column: append an idempotent CREATE TABLE IF NOT
// EXISTS or ALTER TABLE … ADD COLUMN (errors silently swallowed) at the end
// of run_migrations() — never modify existing SQL to keep upgrade paths clean.

use crate::atoms::error::EngineResult;
use rusqlite::Connection;

pub(crate) fn run_migrations(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS domains (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kb_root TEXT NOT NULL,
            provider_override TEXT,
            model_override TEXT,
            allow_integrations INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS kb_files (
            id TEXT PRIMARY KEY,
            domain_id TEXT NOT NULL,
            relative_path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            last_synced_at TEXT NOT NULL DEFAULT (datetime('now')),
            tier TEXT NOT NULL DEFAULT 'general',
            UNIQUE(domain_id, relative_path),
            FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS kb_chunks (
            id TEXT PRIMARY KEY,
            kb_file_id TEXT NOT NULL,
            domain_id TEXT NOT NULL,
            chunk_key TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            content_hash TEXT NOT NULL,
            file_content_hash TEXT NOT NULL,
            ordinal INTEGER NOT NULL DEFAULT 0,
            heading_path TEXT NOT NULL DEFAULT '',
            char_count INTEGER NOT NULL DEFAULT 0,
            token_estimate INTEGER NOT NULL DEFAULT 0,
            line_start INTEGER,
            line_end INTEGER,
            UNIQUE(kb_file_id, chunk_key),
            FOREIGN KEY (kb_file_id) REFERENCES kb_files(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_kb_chunks_domain ON kb_chunks(domain_id);

        CREATE TABLE IF NOT EXISTS chunk_embeddings (
            id TEXT PRIMARY KEY,
            chunk_id TEXT NOT NULL,
            model_name TEXT NOT NULL,
            dimensions INTEGER NOT NULL,
            vector BLOB NOT NULL,
            content_hash TEXT NOT NULL,
            provider_fingerprint TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(chunk_id, model_name),
            FOREIGN KEY (chunk_id) REFERENCES kb_chunks(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS embedding_jobs (
            domain_id TEXT NOT NULL,
            model_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'idle',
            total_files INTEGER NOT NULL DEFAULT 0,
            processed_files INTEGER NOT NULL DEFAULT 0,
            total_chunks INTEGER NOT NULL DEFAULT 0,
            embedded_chunks INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            provider_fingerprint TEXT,
            started_at TEXT,
            finished_at TEXT,
            PRIMARY KEY (domain_id, model_name)
        );

        CREATE TABLE IF NOT EXISTS automations (
            id TEXT PRIMARY KEY,
            domain_id TEXT NOT NULL,
            name TEXT NOT NULL,
            prompt_template TEXT NOT NULL DEFAULT '',
            trigger_kind TEXT NOT NULL,
            trigger_cron TEXT,
            trigger_event TEXT,
            action_kind TEXT NOT NULL,
            action_config TEXT NOT NULL DEFAULT '{}',
            enabled INTEGER NOT NULL DEFAULT 1,
            failure_streak INTEGER NOT NULL DEFAULT 0,
            cooldown_until TEXT,
            run_count INTEGER NOT NULL DEFAULT 0,
            last_run_at TEXT,
            store_payloads INTEGER NOT NULL DEFAULT 0,
            catch_up_enabled INTEGER NOT NULL DEFAULT 0,
            deadline_window_days INTEGER,
            duplicate_skip_count INTEGER NOT NULL DEFAULT 0,
            last_duplicate_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_automations_domain ON automations(domain_id);
        CREATE INDEX IF NOT EXISTS idx_automations_event
            ON automations(trigger_event) WHERE trigger_event IS NOT NULL;

        CREATE TABLE IF NOT EXISTS automation_runs (
            id TEXT PRIMARY KEY,
            automation_id TEXT NOT NULL,
            domain_id TEXT NOT NULL,
            trigger_kind TEXT NOT NULL,
            trigger_event TEXT,
            trigger_data TEXT,
            dedupe_key TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'pending',
            error_code TEXT,
            error_message TEXT,
            prompt_hash TEXT,
            response_hash TEXT,
            action_result TEXT,
            action_external_id TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            started_at TEXT,
            completed_at TEXT,
            duration_ms INTEGER,
            FOREIGN KEY (automation_id) REFERENCES automations(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_runs_automation
            ON automation_runs(automation_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_runs_status ON automation_runs(status);

        CREATE TABLE IF NOT EXISTS missions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            definition TEXT NOT NULL DEFAULT '{}',
            enabled INTEGER NOT NULL DEFAULT 1,
            domain_ids TEXT NOT NULL DEFAULT '[]',
            param_schema TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS mission_runs (
            id TEXT PRIMARY KEY,
            mission_id TEXT NOT NULL,
            domain_id TEXT NOT NULL,
            request_id TEXT,
            inputs TEXT NOT NULL DEFAULT '{}',
            definition_hash TEXT NOT NULL,
            prompt_hash TEXT,
            model TEXT,
            provider TEXT,
            context_snapshot TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            started_at TEXT,
            completed_at TEXT,
            FOREIGN KEY (mission_id) REFERENCES missions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_mission_runs_mission
            ON mission_runs(mission_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS mission_run_outputs (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (run_id) REFERENCES mission_runs(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_mission_outputs_run
            ON mission_run_outputs(run_id, created_at);

        CREATE TABLE IF NOT EXISTS mission_run_gates (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            gate_id TEXT NOT NULL,
            message TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'pending',
            decided_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (run_id) REFERENCES mission_runs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS mission_run_actions (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            action_type TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending',
            result TEXT,
            error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (run_id) REFERENCES mission_runs(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_mission_actions_run
            ON mission_run_actions(run_id, created_at);

        CREATE TABLE IF NOT EXISTS intake_items (
            id TEXT PRIMARY KEY,
            source_type TEXT NOT NULL,
            external_id TEXT NOT NULL,
            source_url TEXT,
            title TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL DEFAULT '',
            extraction_mode TEXT,
            classification TEXT,
            status TEXT NOT NULL DEFAULT 'new',
            metadata TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(source_type, external_id)
        );

        CREATE TABLE IF NOT EXISTS chat_sessions (
            id TEXT PRIMARY KEY,
            domain_id TEXT NOT NULL,
            label TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            message_count INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS chat_messages (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            raw_message_json TEXT,
            tool_call_id TEXT,
            tool_name TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (session_id) REFERENCES chat_sessions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_chat_messages_session
            ON chat_messages(session_id, created_at);

        CREATE TABLE IF NOT EXISTS conversation_summaries (
            session_id TEXT PRIMARY KEY,
            summary TEXT NOT NULL DEFAULT '',
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (session_id) REFERENCES chat_sessions(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS protocols (
            id TEXT PRIMARY KEY,
            domain_id TEXT,
            name TEXT NOT NULL,
            body TEXT NOT NULL DEFAULT '',
            builtin INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(domain_id, name)
        );

        CREATE TABLE IF NOT EXISTS runtime_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
    ",
    )?;

    Ok(())
}
