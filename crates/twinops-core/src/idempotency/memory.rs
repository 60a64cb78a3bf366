//! In-memory idempotency store with TTL and LRU eviction.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::{IdempotencyError, IdempotencyStore};

struct Entry {
    expires_at: Instant,
    value: Value,
}

struct Inner {
    entries: HashMap<String, Entry>,
    order: VecDeque<String>,
}

/// Single-process idempotency cache.
///
/// Entries expire after the TTL and the least recently inserted entries
/// are evicted past `max_entries`.
pub struct MemoryIdempotencyStore {
    ttl: Duration,
    max_entries: usize,
    inner: Mutex<Inner>,
}

impl MemoryIdempotencyStore {
    /// Creates a store with the given TTL and capacity.
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), 1000)
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<Value>, IdempotencyError> {
        let mut inner = self.inner.lock().unwrap();
        let expired = match inner.entries.get(fingerprint) {
            Some(entry) if Instant::now() <= entry.expires_at => {
                return Ok(Some(entry.value.clone()));
            },
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(fingerprint);
        }
        Ok(None)
    }

    async fn put(&self, fingerprint: &str, result: Value) -> Result<(), IdempotencyError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.entries.contains_key(fingerprint) {
            inner.order.push_back(fingerprint.to_string());
        }
        inner.entries.insert(
            fingerprint.to_string(),
            Entry {
                expires_at: Instant::now() + self.ttl,
                value: result,
            },
        );

        while inner.entries.len() > self.max_entries {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
        Ok(())
    }
}
