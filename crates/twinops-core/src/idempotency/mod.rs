//! Idempotency stores for tool invocations.
//!
//! A caller-supplied idempotency key collapses duplicate invocations:
//! before calling the twin, the client fingerprints
//! `(tool, canonical args, simulate, key)` and looks the fingerprint up
//! here; a hit within the TTL returns the recorded result without
//! touching the asset. Results are recorded on any terminal outcome.
//!
//! Two backends: an in-memory LRU for single-process deployments, and a
//! `SQLite` file (WAL mode) that multiple workers can share.

mod memory;
mod sqlite;

pub use memory::MemoryIdempotencyStore;
pub use sqlite::SqliteIdempotencyStore;

use serde_json::{json, Value};
use thiserror::Error;

use crate::canonical::canonical_digest_hex;

/// Errors from an idempotency backend.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// Database error from the `SQLite` backend.
    #[error("idempotency storage error: {0}")]
    Storage(String),
}

/// Fingerprint of an invocation for duplicate detection.
///
/// Two calls collide only when tool name, canonical arguments, the
/// simulate flag and the caller's idempotency key all match.
#[must_use]
pub fn fingerprint(tool: &str, args: &Value, simulate: bool, key: &str) -> String {
    canonical_digest_hex(&json!({
        "tool": tool,
        "args": args,
        "simulate": simulate,
        "key": key,
    }))
}

/// A store of invocation results keyed by fingerprint.
#[async_trait::async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns the recorded result for a fingerprint, if present and
    /// unexpired.
    async fn get(&self, fingerprint: &str) -> Result<Option<Value>, IdempotencyError>;

    /// Records a terminal result for a fingerprint.
    async fn put(&self, fingerprint: &str, result: Value) -> Result<(), IdempotencyError>;
}

#[cfg(test)]
mod unit_tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_fingerprint_is_stable_across_arg_order() {
        let a = fingerprint("SetSpeed", &json!({"RPM": 1200, "unit": "rpm"}), false, "k1");
        let b = fingerprint("SetSpeed", &json!({"unit": "rpm", "RPM": 1200}), false, "k1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_distinguishes_components() {
        let base = fingerprint("SetSpeed", &json!({"RPM": 1200}), false, "k1");
        assert_ne!(
            base,
            fingerprint("SetSpeed", &json!({"RPM": 1201}), false, "k1")
        );
        assert_ne!(
            base,
            fingerprint("SetSpeed", &json!({"RPM": 1200}), true, "k1")
        );
        assert_ne!(
            base,
            fingerprint("SetSpeed", &json!({"RPM": 1200}), false, "k2")
        );
        assert_ne!(
            base,
            fingerprint("SetTemp", &json!({"RPM": 1200}), false, "k1")
        );
    }
}
