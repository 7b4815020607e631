//! PocketLLM Library
//!
//! On-device LLM inference over llama.cpp: model lifetime, streaming text
//! assembly with stop-marker handling, and cooperative cancellation.

pub mod inference;
pub mod storage;
pub mod system;

/// Safely truncate a string at a char boundary, never panics.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello", 3), "hel");
        // "é" is two bytes; never split it
        assert_eq!(truncate_str("aé", 2), "a");
        assert_eq!(truncate_str("", 0), "");
    }
}
