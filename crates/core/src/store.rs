//! # Run Store
//!
//! Keyed JSON persistence with per-entry expiry. Every key for a run shares
//! the `run:{id}` prefix so one prefix delete tears the run down, and expiry
//! is lazy: an expired entry is simply absent on read.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::Result;

/// Key for a stored run record.
pub fn run_key(run_id: &str) -> String {
    format!("run:{run_id}")
}

/// Key for a memo within a run.
pub fn memo_key(run_id: &str, memo_id: &str) -> String {
    format!("run:{run_id}:memo:{memo_id}")
}

/// Key for a reflection response within a run.
pub fn reflection_key(run_id: &str, request_id: &str) -> String {
    format!("run:{run_id}:reflection:{request_id}")
}

/// Key for the finished document of a run.
pub fn result_key(run_id: &str) -> String {
    format!("run:{run_id}:result")
}

/// Prefix covering every key a run owns.
pub fn run_prefix(run_id: &str) -> String {
    format!("run:{run_id}")
}

/// Persistence backend for run state.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Remove every entry whose key starts with `prefix`, returning the count.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory [`RunStore`] used by default and in tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry immediately instead of waiting for reads.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired(now));
        before - entries.len()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let mut entries = self.entries.lock().expect("store lock poisoned");
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("store lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        entries.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }
}
