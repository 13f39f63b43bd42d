// Lorekeep Runtime — Tool-Use Capability Cache
//
// Memoizes whether a (provider, model, base_url) triple actually exercises
// tool use, so the loop can skip tool rounds on backends that never call
// tools and fall back instantly on backends that reject them.

use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCapability {
    Supported,
    NotSupported,
    /// Two consecutive tool-free end_turn responses: the backend accepts
    /// tool definitions but never uses them.
    NotObserved,
    Unknown,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CapabilityKey {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Default)]
struct Entry {
    state: Option<ToolCapability>,
    /// Consecutive end_turn responses with zero tool calls.
    tool_free_turns: u32,
}

#[derive(Default)]
pub struct CapabilityCache {
    entries: Mutex<HashMap<CapabilityKey, Entry>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CapabilityKey) -> ToolCapability {
        self.entries
            .lock()
            .get(key)
            .and_then(|e| e.state)
            .unwrap_or(ToolCapability::Unknown)
    }

    /// A ToolsNotSupported error from the adapter.
    pub fn record_not_supported(&self, key: &CapabilityKey) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_default();
        entry.state = Some(ToolCapability::NotSupported);
    }

    /// A successful tool execution. Resets the tool-free counter, including
    /// the not_observed → supported transition.
    pub fn record_tool_success(&self, key: &CapabilityKey) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_default();
        entry.state = Some(ToolCapability::Supported);
        entry.tool_free_turns = 0;
    }

    /// An end_turn response with zero tool calls. Two in a row flip the
    /// entry to not_observed.
    pub fn record_tool_free_turn(&self, key: &CapabilityKey) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_default();
        entry.tool_free_turns += 1;
        if entry.tool_free_turns >= 2 && entry.state != Some(ToolCapability::NotSupported) {
            entry.state = Some(ToolCapability::NotObserved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CapabilityKey {
        CapabilityKey {
            provider: "anthropic".into(),
            model: "claude-sonnet-4-6".into(),
            base_url: None,
        }
    }

    #[test]
    fn two_tool_free_turns_set_not_observed() {
        let cache = CapabilityCache::new();
        cache.record_tool_free_turn(&key());
        assert_eq!(cache.get(&key()), ToolCapability::Unknown);
        cache.record_tool_free_turn(&key());
        assert_eq!(cache.get(&key()), ToolCapability::NotObserved);
    }

    #[test]
    fn tool_success_resets_counters() {
        let cache = CapabilityCache::new();
        cache.record_tool_free_turn(&key());
        cache.record_tool_free_turn(&key());
        assert_eq!(cache.get(&key()), ToolCapability::NotObserved);
        cache.record_tool_success(&key());
        assert_eq!(cache.get(&key()), ToolCapability::Supported);
        // The streak restarts: one tool-free turn is not enough to flip back.
        cache.record_tool_free_turn(&key());
        assert_eq!(cache.get(&key()), ToolCapability::Supported);
        cache.record_tool_free_turn(&key());
        assert_eq!(cache.get(&key()), ToolCapability::NotObserved);
    }

    #[test]
    fn not_supported_is_sticky_against_free_turns() {
        let cache = CapabilityCache::new();
        cache.record_not_supported(&key());
        cache.record_tool_free_turn(&key());
        cache.record_tool_free_turn(&key());
        assert_eq!(cache.get(&key()), ToolCapability::NotSupported);
    }

    #[test]
    fn distinct_base_urls_are_distinct_entries() {
        let cache = CapabilityCache::new();
        let proxied = CapabilityKey {
            base_url: Some("http://localhost:8787".into()),
            ..key()
        };
        cache.record_not_supported(&proxied);
        assert_eq!(cache.get(&key()), ToolCapability::Unknown);
        assert_eq!(cache.get(&proxied), ToolCapability::NotSupported);
    }
}
