//! Verified policy cache with TTL and fail-closed semantics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ed25519_dalek::VerifyingKey;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::schema::PolicyDocument;
use super::signing::{SignatureVerifier, SignedPolicy};
use crate::canonical::canonical_digest_hex;

/// Errors surfaced to kernel queries for the current policy.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// No policy with a currently-valid signature is available.
    /// The kernel denies by default on this error.
    #[error("policy unverified: {0}")]
    Unverified(String),

    /// The cached policy exceeded the configured maximum age and could
    /// not be refreshed.
    #[error("policy stale: cached copy is {age_seconds}s old, max age {max_age_seconds}s")]
    Stale {
        /// Age of the cached policy in seconds.
        age_seconds: u64,
        /// Configured maximum age in seconds.
        max_age_seconds: u64,
    },

    /// The policy source could not be reached and no cached copy exists.
    #[error("policy fetch failed: {0}")]
    FetchFailed(String),
}

/// Supplies the raw signed envelope from wherever the policy lives
/// (shadow state or a direct submodel read).
#[async_trait::async_trait]
pub trait PolicyFetcher: Send + Sync {
    /// Fetches the current signed policy envelope.
    async fn fetch(&self) -> Result<SignedPolicy, String>;
}

#[async_trait::async_trait]
impl<F, Fut> PolicyFetcher for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<SignedPolicy, String>> + Send,
{
    async fn fetch(&self) -> Result<SignedPolicy, String> {
        self().await
    }
}

struct CachedPolicy {
    document: Arc<PolicyDocument>,
    digest: String,
    loaded_at: Instant,
}

/// Fetches, verifies and caches the signed policy document.
///
/// A verified policy is served from cache for `cache_ttl`. Signature
/// failure discards the cached copy so every later query fails closed
/// until a verifiable policy appears again. When `max_age` is set, a
/// cached copy older than it is never served.
pub struct PolicyStore {
    fetcher: Box<dyn PolicyFetcher>,
    verifier: Box<SignatureVerifier>,
    public_key: VerifyingKey,
    cache_ttl: Duration,
    max_age: Option<Duration>,
    cache: Mutex<Option<CachedPolicy>>,
}

impl PolicyStore {
    /// Creates a store over the given fetcher and trust anchor.
    #[must_use]
    pub fn new(
        fetcher: Box<dyn PolicyFetcher>,
        verifier: Box<SignatureVerifier>,
        public_key: VerifyingKey,
        cache_ttl: Duration,
        max_age: Option<Duration>,
    ) -> Self {
        Self {
            fetcher,
            verifier,
            public_key,
            cache_ttl,
            max_age,
            cache: Mutex::new(None),
        }
    }

    /// Returns the current verified policy.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Unverified`] when the signature does not
    /// verify, [`PolicyError::Stale`] when the cached copy exceeded
    /// `max_age` and refresh failed, and [`PolicyError::FetchFailed`]
    /// when no copy can be obtained at all.
    pub async fn current(&self) -> Result<Arc<PolicyDocument>, PolicyError> {
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.as_ref() {
            let age = cached.loaded_at.elapsed();
            let too_old = self.max_age.is_some_and(|max| age > max);
            if !too_old && age < self.cache_ttl {
                return Ok(Arc::clone(&cached.document));
            }
        }

        match self.refresh().await {
            Ok(fresh) => {
                let document = Arc::clone(&fresh.document);
                *cache = Some(fresh);
                Ok(document)
            },
            Err(PolicyError::Unverified(reason)) => {
                // Fail closed: an unverifiable policy invalidates whatever
                // we had, it does not fall back to it.
                warn!(reason = %reason, "discarding cached policy after verification failure");
                *cache = None;
                Err(PolicyError::Unverified(reason))
            },
            Err(fetch_err) => {
                // The source is unreachable. Serve the cached copy while it
                // is within max_age; otherwise report staleness.
                match cache.as_ref() {
                    Some(cached) => {
                        let age = cached.loaded_at.elapsed();
                        match self.max_age {
                            Some(max) if age > max => Err(PolicyError::Stale {
                                age_seconds: age.as_secs(),
                                max_age_seconds: max.as_secs(),
                            }),
                            _ => Ok(Arc::clone(&cached.document)),
                        }
                    },
                    None => Err(fetch_err),
                }
            },
        }
    }

    /// Hex digest of the most recently verified payload, for audit
    /// correlation.
    pub async fn current_digest(&self) -> Option<String> {
        self.cache.lock().await.as_ref().map(|c| c.digest.clone())
    }

    async fn refresh(&self) -> Result<CachedPolicy, PolicyError> {
        let signed = self
            .fetcher
            .fetch()
            .await
            .map_err(PolicyError::FetchFailed)?;

        signed
            .verify(&self.public_key, self.verifier.as_ref())
            .map_err(|e| PolicyError::Unverified(e.to_string()))?;

        let document: PolicyDocument = serde_json::from_value(signed.payload.clone())
            .map_err(|e| PolicyError::Unverified(format!("payload schema: {e}")))?;

        let digest = canonical_digest_hex(&signed.payload);
        info!(
            policy_digest = %digest,
            key_id = %signed.key_id,
            interlocks = document.interlocks.len(),
            "policy loaded"
        );

        Ok(CachedPolicy {
            document: Arc::new(document),
            digest,
            loaded_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod unit_tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use base64::Engine;
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::json;

    use super::*;
    use crate::canonical::to_canonical_json;
    use crate::policy::ed25519_verifier;

    fn sign(payload: serde_json::Value, key: &SigningKey) -> SignedPolicy {
        let message = to_canonical_json(&payload);
        let signature = key.sign(message.as_bytes());
        SignedPolicy {
            payload,
            signature_b64: base64::engine::general_purpose::STANDARD
                .encode(signature.to_bytes()),
            key_id: "covenant-1".to_string(),
        }
    }

    fn store_with(
        envelope: SignedPolicy,
        key: &SigningKey,
        cache_ttl: Duration,
        max_age: Option<Duration>,
    ) -> (PolicyStore, Arc<AtomicU32>) {
        let fetches = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fetches);
        let fetcher = move || {
            let envelope = envelope.clone();
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(envelope)
            }
        };
        let store = PolicyStore::new(
            Box::new(fetcher),
            ed25519_verifier(),
            key.verifying_key(),
            cache_ttl,
            max_age,
        );
        (store, fetches)
    }

    #[tokio::test]
    async fn test_verified_policy_is_cached() {
        let key = SigningKey::generate(&mut rand::thread_rng());
        let envelope = sign(json!({"operation_risk": {"StartPump": "HIGH"}}), &key);
        let (store, fetches) = store_with(envelope, &key, Duration::from_secs(300), None);

        let first = store.current().await.unwrap();
        let second = store.current().await.unwrap();

        assert_eq!(
            first.risk_for("StartPump", None),
            crate::policy::RiskLevel::High
        );
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bad_signature_fails_closed() {
        let key = SigningKey::generate(&mut rand::thread_rng());
        let mut envelope = sign(json!({"role_bindings": {}}), &key);
        envelope.payload = json!({"role_bindings": {"intruder": {"allow": ["*"]}}});
        let (store, _) = store_with(envelope, &key, Duration::from_secs(300), None);

        let err = store.current().await.unwrap_err();
        assert!(matches!(err, PolicyError::Unverified(_)));
        assert!(store.current_digest().await.is_none());
    }

    #[tokio::test]
    async fn test_verification_failure_discards_previous_policy() {
        let key = SigningKey::generate(&mut rand::thread_rng());
        let good = sign(json!({"interlocks": []}), &key);
        let mut bad = good.clone();
        bad.payload = json!({"interlocks": [{"id": "injected"}]});

        let served = Arc::new(Mutex::new(vec![bad, good]));
        let supplier = Arc::clone(&served);
        let fetcher = move || {
            let supplier = Arc::clone(&supplier);
            async move {
                let mut queue = supplier.lock().await;
                Ok::<_, String>(queue.pop().expect("envelope available"))
            }
        };
        let store = PolicyStore::new(
            Box::new(fetcher),
            ed25519_verifier(),
            key.verifying_key(),
            Duration::ZERO,
            None,
        );

        // First fetch serves the good envelope and caches it; with TTL
        // zero the second query refreshes, gets the tampered envelope,
        // and must not fall back to the cached copy.
        store.current().await.unwrap();
        let err = store.current().await.unwrap_err();
        assert!(matches!(err, PolicyError::Unverified(_)));
    }

    #[tokio::test]
    async fn test_fetch_failure_serves_cache_within_max_age() {
        let key = SigningKey::generate(&mut rand::thread_rng());
        let envelope = sign(json!({}), &key);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let fetcher = move || {
            let envelope = envelope.clone();
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(envelope)
                } else {
                    Err("connection refused".to_string())
                }
            }
        };
        let store = PolicyStore::new(
            Box::new(fetcher),
            ed25519_verifier(),
            key.verifying_key(),
            Duration::ZERO,
            Some(Duration::from_secs(3600)),
        );

        store.current().await.unwrap();
        // Refresh fails but the cached copy is well within max_age.
        store.current().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_policy_rejected_past_max_age() {
        let key = SigningKey::generate(&mut rand::thread_rng());
        let envelope = sign(json!({}), &key);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let fetcher = move || {
            let envelope = envelope.clone();
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(envelope)
                } else {
                    Err("connection refused".to_string())
                }
            }
        };
        let store = PolicyStore::new(
            Box::new(fetcher),
            ed25519_verifier(),
            key.verifying_key(),
            Duration::ZERO,
            Some(Duration::ZERO),
        );

        store.current().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = store.current().await.unwrap_err();
        assert!(matches!(err, PolicyError::Stale { .. }));
    }
}
