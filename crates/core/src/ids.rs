//! Prefixed unique id generation for runs, memos, messages, and reflections.

/// Generate a prefixed id, e.g. `run-18f3a2c4b1d-9e2a7c31`.
///
/// Nanosecond timestamp plus a non-cryptographic random suffix; unique enough
/// for in-process record ids without pulling in a uuid dependency.
pub(crate) fn new_id(prefix: &str) -> String {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    format!("{}-{:x}-{:x}", prefix, nanos, rand_u32())
}

/// Simple random number (not cryptographic).
fn rand_u32() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_and_uniqueness() {
        let a = new_id("memo");
        let b = new_id("memo");
        assert!(a.starts_with("memo-"));
        assert_ne!(a, b);
    }
}
