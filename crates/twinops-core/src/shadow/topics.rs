//! MQTT topic encoding and decoding for shadow updates.
//!
//! Topics follow `twinops/{repo_id}/{aas_id}/{submodel_id}/{path...}`.
//! Identifiers are URNs that may contain `/`, so the repo, shell and
//! submodel segments carry base64url-without-padding encodings of the
//! raw ids; the element path rides as literal segments.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;

/// Root namespace of all shadow topics.
pub const TOPIC_ROOT: &str = "twinops";

/// A parsed shadow update topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    /// Repository the event came from.
    pub repo_id: String,

    /// Shell the submodel belongs to.
    pub aas_id: String,

    /// Submodel the updated element lives in.
    pub submodel_id: String,

    /// idShort path of the updated element.
    pub element_path: String,
}

/// Encodes an identifier for use as a topic segment.
#[must_use]
pub fn encode_id(id: &str) -> String {
    URL_SAFE_NO_PAD.encode(id.as_bytes())
}

/// Decodes a topic segment back to an identifier.
///
/// Segments that do not decode as base64url are returned verbatim, so
/// plain ids published by simple tooling still resolve.
#[must_use]
pub fn decode_id(segment: &str) -> String {
    URL_SAFE_NO_PAD
        .decode(segment.as_bytes())
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .unwrap_or_else(|| segment.to_string())
}

/// Builds the wildcard subscription covering one shell.
#[must_use]
pub fn subscription_filter(repo_id: &str, aas_id: &str) -> String {
    format!("{TOPIC_ROOT}/{}/{}/#", encode_id(repo_id), encode_id(aas_id))
}

/// Builds the topic for a single element update.
#[must_use]
pub fn element_topic(repo_id: &str, aas_id: &str, submodel_id: &str, path: &str) -> String {
    format!(
        "{TOPIC_ROOT}/{}/{}/{}/{path}",
        encode_id(repo_id),
        encode_id(aas_id),
        encode_id(submodel_id),
    )
}

/// Parses a shadow update topic.
///
/// Returns `None` for topics outside the `twinops/` namespace or with
/// too few segments to name an element.
#[must_use]
pub fn parse_topic(topic: &str) -> Option<ParsedTopic> {
    let mut parts = topic.splitn(5, '/');
    if parts.next()? != TOPIC_ROOT {
        return None;
    }
    let repo_id = decode_id(parts.next()?);
    let aas_id = decode_id(parts.next()?);
    let submodel_id = decode_id(parts.next()?);
    let element_path = parts.next()?.to_string();
    if element_path.is_empty() {
        return None;
    }

    Some(ParsedTopic {
        repo_id,
        aas_id,
        submodel_id,
        element_path,
    })
}

/// Normalizes an update payload to `(value, broker_timestamp)`.
///
/// Brokers either publish the raw element value or wrap it as
/// `{"value": ..., "ts": <epoch millis>}`.
#[must_use]
pub fn parse_payload(payload: &[u8]) -> Option<(Value, Option<i64>)> {
    let parsed: Value = serde_json::from_slice(payload).ok()?;

    if let Value::Object(map) = &parsed {
        if let Some(value) = map.get("value") {
            let ts = map.get("ts").and_then(Value::as_i64);
            return Some((value.clone(), ts));
        }
    }

    Some((parsed, None))
}
