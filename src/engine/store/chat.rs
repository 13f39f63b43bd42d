use super::{now_rfc3339, Store};
use crate::atoms::error::EngineResult;
use crate::engine::types::{ChatMessage, ChatSession, StoredChatMessage};
use rusqlite::{params, OptionalExtension};

impl Store {
    // ── Chat sessions ──────────────────────────────────────────────────

    pub fn create_chat_session(&self, id: &str, domain_id: &str) -> EngineResult<ChatSession> {
        let conn = self.conn.lock();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO chat_sessions (id, domain_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![id, domain_id, now],
        )?;
        Ok(ChatSession {
            id: id.to_string(),
            domain_id: domain_id.to_string(),
            label: None,
            created_at: now.clone(),
            updated_at: now,
            message_count: 0,
        })
    }

    pub fn get_chat_session(&self, id: &str) -> EngineResult<Option<ChatSession>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                "SELECT id, domain_id, label, created_at, updated_at, message_count
                 FROM chat_sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(ChatSession {
                        id: row.get(0)?,
                        domain_id: row.get(1)?,
                        label: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                        message_count: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    // ── Messages ───────────────────────────────────────────────────────

    /// Persist one transcript entry. The assistant's raw_message is stored
    /// as serialized JSON so the provider can round-trip it later.
    pub fn append_chat_message(&self, session_id: &str, message: &ChatMessage) -> EngineResult<String> {
        let conn = self.conn.lock();
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_rfc3339();
        match message {
            ChatMessage::User { content } => {
                conn.execute(
                    "INSERT INTO chat_messages (id, session_id, role, content, created_at)
                     VALUES (?1, ?2, 'user', ?3, ?4)",
                    params![id, session_id, content, now],
                )?;
            }
            ChatMessage::Assistant { raw_message, derived_text } => {
                conn.execute(
                    "INSERT INTO chat_messages
                         (id, session_id, role, content, raw_message_json, created_at)
                     VALUES (?1, ?2, 'assistant', ?3, ?4, ?5)",
                    params![
                        id,
                        session_id,
                        derived_text,
                        raw_message.as_ref().map(|v| v.to_string()),
                        now
                    ],
                )?;
            }
            ChatMessage::Tool { tool_call_id, tool_name, content } => {
                conn.execute(
                    "INSERT INTO chat_messages
                         (id, session_id, role, content, tool_call_id, tool_name, created_at)
                     VALUES (?1, ?2, 'tool', ?3, ?4, ?5, ?6)",
                    params![id, session_id, content, tool_call_id, tool_name, now],
                )?;
            }
        }
        conn.execute(
            "UPDATE chat_sessions SET message_count = message_count + 1, updated_at = ?1
             WHERE id = ?2",
            params![now, session_id],
        )?;
        Ok(id)
    }

    pub fn load_chat_messages(&self, session_id: &str) -> EngineResult<Vec<ChatMessage>> {
        let stored = self.load_stored_chat_messages(session_id)?;
        Ok(stored
            .into_iter()
            .map(|m| match m.role.as_str() {
                "assistant" => ChatMessage::Assistant {
                    raw_message: m
                        .raw_message_json
                        .as_deref()
                        .and_then(|s| serde_json::from_str(s).ok()),
                    derived_text: m.content,
                },
                "tool" => ChatMessage::Tool {
                    tool_call_id: m.tool_call_id.unwrap_or_default(),
                    tool_name: m.tool_name.unwrap_or_default(),
                    content: m.content,
                },
                _ => ChatMessage::User { content: m.content },
            })
            .collect())
    }

    pub fn load_stored_chat_messages(&self, session_id: &str) -> EngineResult<Vec<StoredChatMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, raw_message_json, tool_call_id, tool_name,
                    created_at
             FROM chat_messages WHERE session_id = ?1 ORDER BY created_at, id",
        )?;
        let messages = stmt
            .query_map(params![session_id], |row| {
                Ok(StoredChatMessage {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    role: row.get(2)?,
                    content: row.get(3)?,
                    raw_message_json: row.get(4)?,
                    tool_call_id: row.get(5)?,
                    tool_name: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    // ── Conversation summaries ─────────────────────────────────────────

    pub fn get_conversation_summary(&self, session_id: &str) -> EngineResult<Option<String>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                "SELECT summary FROM conversation_summaries WHERE session_id = ?1",
                params![session_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(result)
    }

    pub fn set_conversation_summary(&self, session_id: &str, summary: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversation_summaries (session_id, summary, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE SET
                 summary = excluded.summary, updated_at = excluded.updated_at",
            params![session_id, summary, now_rfc3339()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.create_domain("d1", "Research", "/kb").unwrap();
        store.create_chat_session("s1", "d1").unwrap();
        store
    }

    #[test]
    fn assistant_raw_message_round_trips() {
        let store = setup();
        let raw = json!({"role": "assistant", "content": [{"type": "text", "text": "hi"}]});
        store
            .append_chat_message("s1", &ChatMessage::assistant(raw.clone(), "hi"))
            .unwrap();
        let loaded = store.load_chat_messages("s1").unwrap();
        match &loaded[0] {
            ChatMessage::Assistant { raw_message, derived_text } => {
                assert_eq!(raw_message.as_ref().unwrap(), &raw);
                assert_eq!(derived_text, "hi");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn message_order_and_count() {
        let store = setup();
        store.append_chat_message("s1", &ChatMessage::user("q")).unwrap();
        store
            .append_chat_message("s1", &ChatMessage::tool("tc1", "gmail_search", "{}"))
            .unwrap();
        let session = store.get_chat_session("s1").unwrap().unwrap();
        assert_eq!(session.message_count, 2);
        let loaded = store.load_chat_messages("s1").unwrap();
        assert!(matches!(loaded[0], ChatMessage::User { .. }));
        assert!(matches!(loaded[1], ChatMessage::Tool { .. }));
    }

    #[test]
    fn summary_upsert() {
        let store = setup();
        assert!(store.get_conversation_summary("s1").unwrap().is_none());
        store.set_conversation_summary("s1", "v1").unwrap();
        store.set_conversation_summary("s1", "v2").unwrap();
        assert_eq!(store.get_conversation_summary("s1").unwrap().unwrap(), "v2");
    }
}
