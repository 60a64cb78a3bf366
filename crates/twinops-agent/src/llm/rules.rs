//! Rules-based tool selector.
//!
//! Parses natural-language commands into tool calls with pattern
//! tables: specific patterns for the common pump operations first, then
//! generic call/set/get shapes, with fuzzy tool-name matching against
//! whatever the catalog offered. Useful for local development without
//! API keys and for exercising the safety pipeline deterministically.

use std::collections::HashSet;

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{ChatMessage, SelectedCall, SelectorError, SelectorResponse, ToolSelector};
use crate::catalog::ToolSpec;

/// Prefixes stripped before pattern matching ("please can you ...").
const STRIP_PREFIXES: &[&str] = &[
    r"^(?:please\s+)?(?:can\s+you\s+)?(?:could\s+you\s+)?(?:would\s+you\s+)?",
    r"^(?:i\s+want\s+(?:you\s+)?to\s+)?",
    r"^(?:i\s+need\s+(?:you\s+)?to\s+)?",
    r"^(?:i'd\s+like\s+(?:you\s+)?to\s+)?",
];

type ArgBuilder = fn(&regex::Captures<'_>) -> Value;

/// A specific command pattern mapping to a known operation.
struct SpecificPattern {
    regex: Regex,
    tool: &'static str,
    args: ArgBuilder,
}

fn number_arg(name: &str) -> impl Fn(&regex::Captures<'_>) -> Value + '_ {
    move |caps| {
        let value: f64 = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or_default();
        json!({ name: value })
    }
}

fn no_args(_caps: &regex::Captures<'_>) -> Value {
    json!({})
}

fn rpm_arg(caps: &regex::Captures<'_>) -> Value {
    number_arg("RPM")(caps)
}

fn temperature_arg(caps: &regex::Captures<'_>) -> Value {
    number_arg("Temperature")(caps)
}

fn specific_patterns() -> Vec<SpecificPattern> {
    let table: &[(&'static str, &'static str, ArgBuilder)] = &[
        // Speed control
        (
            r"set\s+(?:the\s+)?(?:pump\s+)?speed\s+(?:to\s+)?(\d+(?:\.\d+)?)",
            "SetSpeed",
            rpm_arg,
        ),
        (
            r"change\s+(?:the\s+)?speed\s+(?:to\s+)?(\d+(?:\.\d+)?)",
            "SetSpeed",
            rpm_arg,
        ),
        (r"speed\s+(?:to\s+)?(\d+(?:\.\d+)?)", "SetSpeed", rpm_arg),
        // Pump control
        (
            r"(?:turn\s+on|start|activate|enable)\s+(?:the\s+)?pump",
            "StartPump",
            no_args,
        ),
        (
            r"(?:turn\s+off|stop|deactivate|disable)\s+(?:the\s+)?pump",
            "StopPump",
            no_args,
        ),
        (r"pump\s+(?:on|start)", "StartPump", no_args),
        (r"pump\s+(?:off|stop)", "StopPump", no_args),
        // Temperature control
        (
            r"set\s+(?:the\s+)?temp(?:erature)?\s+(?:to\s+)?(\d+(?:\.\d+)?)",
            "SetTemperature",
            temperature_arg,
        ),
        // Status queries
        (
            r"(?:get|show|check|display|what(?:'s|\s+is)?)\s+(?:the\s+)?(?:current\s+)?status",
            "GetStatus",
            no_args,
        ),
        (r"status\s+(?:report|check|info)", "GetStatus", no_args),
        // Temperature reading
        (
            r"(?:read|get|show|what(?:'s|\s+is)?)\s+(?:the\s+)?(?:current\s+)?temp(?:erature)?",
            "ReadTemperature",
            no_args,
        ),
        // Emergency
        (
            r"emergency\s+(?:stop|shutdown|halt)",
            "EmergencyStop",
            no_args,
        ),
        (r"e-stop|estop", "EmergencyStop", no_args),
        (r"(?:immediate(?:ly)?|urgent)\s+stop", "EmergencyStop", no_args),
    ];

    table
        .iter()
        .map(|(pattern, tool, args)| SpecificPattern {
            regex: Regex::new(pattern).expect("static pattern compiles"),
            tool: *tool,
            args: *args,
        })
        .collect()
}

/// Normalizes a user message for matching.
fn normalize(message: &str) -> String {
    let mut result = message.to_lowercase().trim().to_string();
    for prefix in STRIP_PREFIXES {
        let re = Regex::new(prefix).expect("static pattern compiles");
        result = re.replace(&result, "").into_owned();
    }
    result.trim().to_string()
}

/// Fuzzy-matches a tool name against the offered catalog.
fn fuzzy_match<'a>(wanted: &str, tools: &[&'a ToolSpec]) -> Option<&'a str> {
    // Exact, then case-insensitive.
    if let Some(tool) = tools.iter().find(|tool| tool.name == wanted) {
        return Some(tool.name.as_str());
    }
    let wanted_lower = wanted.to_lowercase();
    if let Some(tool) = tools
        .iter()
        .find(|tool| tool.name.to_lowercase() == wanted_lower)
    {
        return Some(tool.name.as_str());
    }

    // Substring in either direction.
    if let Some(tool) = tools.iter().find(|tool| {
        let name = tool.name.to_lowercase();
        name.contains(&wanted_lower) || wanted_lower.contains(&name)
    }) {
        return Some(tool.name.as_str());
    }

    // Best word overlap.
    let wanted_words = words(&wanted_lower);
    tools
        .iter()
        .map(|tool| {
            let overlap = words(&tool.name.to_lowercase())
                .intersection(&wanted_words)
                .count();
            (tool, overlap)
        })
        .filter(|(_, overlap)| *overlap > 0)
        .max_by_key(|(_, overlap)| *overlap)
        .map(|(tool, _)| tool.name.as_str())
}

fn words(text: &str) -> HashSet<String> {
    Regex::new(r"[a-z]+")
        .expect("static pattern compiles")
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Deterministic selector backed by pattern tables.
pub struct RulesSelector {
    specific: Vec<SpecificPattern>,
    generic_call: Regex,
    generic_set: Regex,
    generic_get: Regex,
}

impl Default for RulesSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl RulesSelector {
    /// Builds the selector with its static pattern tables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            specific: specific_patterns(),
            generic_call: Regex::new(r"(?:call|run|execute|invoke)\s+(\w+)")
                .expect("static pattern compiles"),
            generic_set: Regex::new(r"set\s+(\w+)\s+(?:to\s+)?(\d+(?:\.\d+)?)")
                .expect("static pattern compiles"),
            generic_get: Regex::new(r"(?:get|read|show)\s+(\w+)")
                .expect("static pattern compiles"),
        }
    }

    fn simulate_requested(message: &str) -> bool {
        let lower = message.to_lowercase();
        if lower.contains("simulate=false") || lower.contains("real") {
            return false;
        }
        lower.contains("simulate") || lower.contains("dry run") || lower.contains("test")
    }

    fn match_specific(&self, normalized: &str, tools: &[&ToolSpec]) -> Option<(String, Value)> {
        for pattern in &self.specific {
            if let Some(caps) = pattern.regex.captures(normalized) {
                if let Some(matched) = fuzzy_match(pattern.tool, tools) {
                    return Some((matched.to_string(), (pattern.args)(&caps)));
                }
            }
        }
        None
    }

    fn match_generic(&self, normalized: &str, tools: &[&ToolSpec]) -> Option<(String, Value)> {
        if let Some(caps) = self.generic_call.captures(normalized) {
            let wanted = caps.get(1)?.as_str();
            if let Some(matched) = fuzzy_match(wanted, tools) {
                return Some((matched.to_string(), json!({})));
            }
        }

        if let Some(caps) = self.generic_set.captures(normalized) {
            let property = title_case(caps.get(1)?.as_str());
            let value: f64 = caps.get(2)?.as_str().parse().ok()?;
            if let Some(matched) = fuzzy_match(&format!("Set{property}"), tools) {
                return Some((matched.to_string(), json!({ property: value })));
            }
        }

        if let Some(caps) = self.generic_get.captures(normalized) {
            let property = title_case(caps.get(1)?.as_str());
            if let Some(matched) = fuzzy_match(&format!("Read{property}"), tools) {
                return Some((matched.to_string(), json!({})));
            }
        }

        None
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[async_trait::async_trait]
impl ToolSelector for RulesSelector {
    async fn select(
        &self,
        messages: &[ChatMessage],
        tools: &[&ToolSpec],
    ) -> Result<SelectorResponse, SelectorError> {
        let Some(user_msg) = messages.iter().rev().find(|m| m.role == "user") else {
            return Ok(SelectorResponse {
                content: Some("I didn't receive a message to process.".to_string()),
                calls: Vec::new(),
            });
        };

        let normalized = normalize(&user_msg.content);
        let simulate = Self::simulate_requested(&user_msg.content);

        let matched = self
            .match_specific(&normalized, tools)
            .or_else(|| self.match_generic(&normalized, tools));

        if let Some((name, mut arguments)) = matched {
            if let Value::Object(ref mut map) = arguments {
                map.insert("simulate".to_string(), Value::Bool(simulate));
            } else {
                let mut map = Map::new();
                map.insert("simulate".to_string(), Value::Bool(simulate));
                arguments = Value::Object(map);
            }
            debug!(tool = %name, simulate, "rules selector matched");
            return Ok(SelectorResponse {
                content: None,
                calls: vec![SelectedCall { name, arguments }],
            });
        }

        let mut names: Vec<&str> = tools.iter().map(|tool| tool.name.as_str()).collect();
        names.sort_unstable();
        let available = if names.is_empty() {
            "none loaded".to_string()
        } else {
            names.join(", ")
        };
        Ok(SelectorResponse {
            content: Some(format!(
                "I couldn't understand that command. Available operations: {available}. \
                 Try commands like 'start pump', 'set speed to 1200', 'get status', or 'stop pump'."
            )),
            calls: Vec::new(),
        })
    }
}

#[cfg(test)]
mod unit_tests {
    use serde_json::json;

    use super::*;

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: String::new(),
            submodel_id: "urn:example:submodel:pump".to_string(),
            operation_path: name.to_string(),
            delegation_url: None,
            risk_hint: None,
            parameters: json!({}),
        }
    }

    async fn run(message: &str, tool_names: &[&str]) -> SelectorResponse {
        let specs: Vec<ToolSpec> = tool_names.iter().map(|name| spec(name)).collect();
        let refs: Vec<&ToolSpec> = specs.iter().collect();
        RulesSelector::new()
            .select(&[ChatMessage::user(message)], &refs)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_set_speed_extracts_rpm() {
        let response = run("Set speed to 1200 RPM", &["SetSpeed", "StartPump"]).await;
        assert_eq!(response.calls.len(), 1);
        assert_eq!(response.calls[0].name, "SetSpeed");
        assert_eq!(response.calls[0].arguments["RPM"], json!(1200.0));
    }

    #[tokio::test]
    async fn test_polite_prefix_stripped() {
        let response = run("Please can you start the pump", &["StartPump"]).await;
        assert_eq!(response.calls[0].name, "StartPump");
    }

    #[tokio::test]
    async fn test_emergency_stop() {
        let response = run("Emergency stop", &["EmergencyStop", "StopPump"]).await;
        assert_eq!(response.calls[0].name, "EmergencyStop");
    }

    #[tokio::test]
    async fn test_simulate_flag_extracted() {
        let response = run("start the pump (dry run)", &["StartPump"]).await;
        assert_eq!(response.calls[0].arguments["simulate"], json!(true));
    }

    #[tokio::test]
    async fn test_get_status() {
        let response = run("what is the status", &["GetStatus"]).await;
        assert_eq!(response.calls[0].name, "GetStatus");
        assert_eq!(response.calls[0].arguments["simulate"], json!(false));
    }

    #[tokio::test]
    async fn test_generic_invoke_pattern() {
        let response = run("invoke Calibrate", &["Calibrate"]).await;
        assert_eq!(response.calls[0].name, "Calibrate");
    }

    #[tokio::test]
    async fn test_unmatched_lists_operations() {
        let response = run("make me a sandwich", &["StartPump", "GetStatus"]).await;
        assert!(response.calls.is_empty());
        let content = response.content.unwrap();
        assert!(content.contains("GetStatus"));
        assert!(content.contains("StartPump"));
    }

    #[tokio::test]
    async fn test_tool_missing_from_catalog_not_called() {
        let response = run("set speed to 900", &["GetStatus"]).await;
        assert!(response.calls.is_empty());
    }

    #[test]
    fn test_fuzzy_match_case_insensitive() {
        let specs = [spec("SetSpeed")];
        let refs: Vec<&ToolSpec> = specs.iter().collect();
        assert_eq!(fuzzy_match("setspeed", &refs), Some("SetSpeed"));
    }
}
