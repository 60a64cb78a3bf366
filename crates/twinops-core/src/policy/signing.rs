//! Detached Ed25519 verification of policy payloads.
//!
//! The signature covers the canonical JSON bytes of the payload, so the
//! same logical policy always verifies regardless of how the repository
//! serialized it. The Ed25519 implementation is injected as a plain
//! function; key management stays with the caller.

use base64::Engine;
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::canonical::to_canonical_json;

/// Size of a detached Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Errors raised while unwrapping or verifying a signed policy.
#[derive(Debug, Error)]
pub enum PolicySigningError {
    /// The submodel element did not hold a well-formed signed envelope.
    #[error("malformed signed policy envelope: {0}")]
    MalformedEnvelope(String),

    /// The signature did not verify against the configured public key.
    #[error("policy signature verification failed (key_id={key_id})")]
    BadSignature {
        /// Key id named by the envelope.
        key_id: String,
    },

    /// The envelope names a key the verifier does not know.
    #[error("unknown policy signing key: {key_id}")]
    UnknownKey {
        /// Key id named by the envelope.
        key_id: String,
    },
}

/// Signature check over canonical payload bytes.
///
/// Injected so the store never owns crypto state; the default is
/// [`ed25519_verifier`].
pub type SignatureVerifier =
    dyn Fn(&[u8], &[u8; SIGNATURE_SIZE], &VerifyingKey) -> bool + Send + Sync;

/// A policy payload with its detached signature, as stored in the
/// policy submodel element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPolicy {
    /// The policy document payload.
    pub payload: Value,

    /// Base64-encoded detached Ed25519 signature over the canonical
    /// JSON bytes of `payload`.
    pub signature_b64: String,

    /// Identifier of the signing key.
    pub key_id: String,
}

impl SignedPolicy {
    /// Parses a signed envelope from a submodel element value.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEnvelope` if the value is not an object with
    /// `payload`, `signature_b64` and `key_id` members.
    pub fn from_element_value(value: &Value) -> Result<Self, PolicySigningError> {
        serde_json::from_value(value.clone())
            .map_err(|e| PolicySigningError::MalformedEnvelope(e.to_string()))
    }

    /// Verifies the detached signature against the given public key.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEnvelope` when the signature does not decode to
    /// 64 bytes, and `BadSignature` when verification fails.
    pub fn verify(
        &self,
        key: &VerifyingKey,
        verifier: &SignatureVerifier,
    ) -> Result<(), PolicySigningError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&self.signature_b64)
            .map_err(|e| PolicySigningError::MalformedEnvelope(format!("signature: {e}")))?;

        let signature: [u8; SIGNATURE_SIZE] = raw.try_into().map_err(|raw: Vec<u8>| {
            PolicySigningError::MalformedEnvelope(format!(
                "signature must be {SIGNATURE_SIZE} bytes, got {}",
                raw.len()
            ))
        })?;

        let message = to_canonical_json(&self.payload);
        if verifier(message.as_bytes(), &signature, key) {
            Ok(())
        } else {
            Err(PolicySigningError::BadSignature {
                key_id: self.key_id.clone(),
            })
        }
    }
}

/// The default Ed25519 signature check.
#[must_use]
pub fn ed25519_verifier() -> Box<SignatureVerifier> {
    Box::new(|message, signature, key| {
        let signature = Signature::from_bytes(signature);
        key.verify_strict(message, &signature).is_ok()
    })
}
