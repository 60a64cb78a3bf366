//! Canonical JSON encoding for hashing and signatures.
//!
//! JSON serializers do not guarantee deterministic output for object
//! members - the same logical document can encode to different byte
//! strings depending on insertion order. Signatures and hash chains are
//! only verifiable when both sides agree on the exact bytes, so every
//! digest in this crate is computed over the canonical form produced
//! here: keys sorted lexicographically, compact separators, UTF-8, and
//! numbers in serde_json's narrowest round-tripping rendering.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Size of a SHA-256 digest in bytes.
pub const DIGEST_SIZE: usize = 32;

/// Serializes a JSON value to its canonical byte form.
///
/// Object members are emitted in lexicographic key order at every
/// nesting level; arrays keep their order. The output contains no
/// insignificant whitespace.
#[must_use]
pub fn to_canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Computes the SHA-256 digest of the canonical form of a JSON value.
#[must_use]
pub fn canonical_digest(value: &Value) -> [u8; DIGEST_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(to_canonical_json(value).as_bytes());
    hasher.finalize().into()
}

/// Computes the hex-encoded SHA-256 digest of the canonical form.
#[must_use]
pub fn canonical_digest_hex(value: &Value) -> String {
    hex::encode(canonical_digest(value))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Key serialization cannot fail for a String.
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        },
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        },
        scalar => {
            out.push_str(&serde_json::to_string(scalar).expect("scalar serializes"));
        },
    }
}
