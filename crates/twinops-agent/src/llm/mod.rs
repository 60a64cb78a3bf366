//! Tool selection - the seam to the language model.
//!
//! Given the user message and the narrowed tool catalog, a selector
//! returns zero or more `(tool, arguments)` calls. Provider-backed
//! clients plug in behind [`ToolSelector`]; the built-in
//! [`rules::RulesSelector`] parses commands with pattern tables so the
//! whole pipeline runs without an API key.

pub mod rules;

use serde_json::Value;

use crate::catalog::ToolSpec;

/// A chat message in the running conversation.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// `user` or `assistant`.
    pub role: String,

    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Builds a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Builds an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One call proposed by the selector.
#[derive(Debug, Clone)]
pub struct SelectedCall {
    /// Tool name from the offered catalog.
    pub name: String,

    /// Arguments for the call. A `simulate` member requests a simulated
    /// run.
    pub arguments: Value,
}

/// Selector output: free text, proposed calls, or both.
#[derive(Debug, Clone, Default)]
pub struct SelectorResponse {
    /// Assistant text, when the selector answered directly.
    pub content: Option<String>,

    /// Proposed tool calls, in execution order.
    pub calls: Vec<SelectedCall>,
}

/// Error from a selector backend.
#[derive(Debug, thiserror::Error)]
#[error("tool selection failed: {0}")]
pub struct SelectorError(pub String);

/// The pluggable tool-selection seam.
#[async_trait::async_trait]
pub trait ToolSelector: Send + Sync {
    /// Proposes tool calls for the conversation against the offered
    /// tools.
    async fn select(
        &self,
        messages: &[ChatMessage],
        tools: &[&ToolSpec],
    ) -> Result<SelectorResponse, SelectorError>;
}
