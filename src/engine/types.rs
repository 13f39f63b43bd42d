// Lorekeep Runtime — Core types
// Struct/enum definitions live in crate::atoms::types; engine code imports
// one flat vocabulary from here.

pub use crate::atoms::types::*;

// ── Utility ────────────────────────────────────────────────────────────

/// UTF-8–safe string truncation. Returns a `&str` of at most `max_bytes`
/// bytes, backing up to the previous char boundary if `max_bytes` falls
/// inside a multi-byte character.
///
/// Use this instead of `&s[..s.len().min(N)]` which panics on non-ASCII.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
