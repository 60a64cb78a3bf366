//! HMAC request signing for service-to-service calls.
//!
//! Requests to the Operation Service carry
//! `X-TwinOps-Signature: base64(HMAC-SHA256(secret, ts \n method \n path \n body))`
//! and `X-TwinOps-Timestamp`. Receivers verify in constant time and
//! reject signatures older than the configured TTL.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "X-TwinOps-Signature";

/// Header carrying the signing timestamp (unix seconds).
pub const TIMESTAMP_HEADER: &str = "X-TwinOps-Timestamp";

fn mac_for(secret: &SecretString) -> HmacSha256 {
    // HMAC accepts keys of any length.
    HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .expect("HMAC key of any length is valid")
}

/// Builds the message covered by the signature.
#[must_use]
pub fn build_message(timestamp: &str, method: &str, path: &str, body: &[u8]) -> Vec<u8> {
    let mut message =
        Vec::with_capacity(timestamp.len() + method.len() + path.len() + body.len() + 3);
    message.extend_from_slice(timestamp.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(method.to_uppercase().as_bytes());
    message.push(b'\n');
    message.extend_from_slice(path.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(body);
    message
}

/// Signs a request, returning the base64 signature.
#[must_use]
pub fn sign(secret: &SecretString, timestamp: &str, method: &str, path: &str, body: &[u8]) -> String {
    let mut mac = mac_for(secret);
    mac.update(&build_message(timestamp, method, path, body));
    BASE64.encode(mac.finalize().into_bytes())
}

/// Verifies a signature in constant time.
///
/// `now` and `ttl_seconds` bound the signature age; a timestamp in the
/// future or older than the TTL is rejected before any MAC work.
#[must_use]
pub fn verify(
    secret: &SecretString,
    timestamp: &str,
    method: &str,
    path: &str,
    body: &[u8],
    signature_b64: &str,
    now: i64,
    ttl_seconds: i64,
) -> bool {
    let Ok(signed_at) = timestamp.parse::<i64>() else {
        return false;
    };
    if signed_at > now || now - signed_at > ttl_seconds {
        return false;
    }

    let expected = sign(secret, timestamp, method, path, body);
    expected.as_bytes().ct_eq(signature_b64.as_bytes()).into()
}
