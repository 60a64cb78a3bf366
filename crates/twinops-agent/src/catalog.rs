//! Tool catalog derived from the twin's operation schemas.
//!
//! Each invocable operation becomes a [`ToolSpec`] carrying the JSON
//! schema of its arguments and a risk hint. Per request the catalog is
//! narrowed to the top-K specs most relevant to the user message before
//! it reaches the selector; ranking here is a naive token overlap
//! standing in for the capability index, which lives outside the core.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use twinops_core::policy::RiskLevel;

/// An invocable operation as surfaced to the tool selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Operation name (idShort).
    pub name: String,

    /// Operator-facing description.
    pub description: String,

    /// Submodel the operation lives in.
    pub submodel_id: String,

    /// idShort path of the operation within the submodel.
    pub operation_path: String,

    /// Delegation endpoint, when the operation is served by the
    /// Operation Service rather than invoked in place.
    #[serde(default)]
    pub delegation_url: Option<String>,

    /// Risk annotation from the schema. The policy may override it.
    #[serde(default)]
    pub risk_hint: Option<RiskLevel>,

    /// JSON schema of the arguments.
    #[serde(default)]
    pub parameters: Value,
}

/// The set of tools known for the managed shell.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolSpec>,
}

impl ToolCatalog {
    /// Builds a catalog from discovered specs.
    #[must_use]
    pub fn new(tools: Vec<ToolSpec>) -> Self {
        Self { tools }
    }

    /// Looks a tool up by exact name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    /// All known tools.
    #[must_use]
    pub fn all(&self) -> &[ToolSpec] {
        &self.tools
    }

    /// The `k` tools most relevant to a query, by token overlap over
    /// name and description. Falls back to the full catalog order for
    /// tools with no overlap so small catalogs always fill the budget.
    #[must_use]
    pub fn top_k(&self, query: &str, k: usize) -> Vec<&ToolSpec> {
        let query_tokens = tokenize(query);

        let mut scored: Vec<(usize, usize)> = self
            .tools
            .iter()
            .enumerate()
            .map(|(idx, tool)| {
                let mut haystack = tokenize(&tool.name);
                haystack.extend(tokenize(&tool.description));
                let overlap = haystack.intersection(&query_tokens).count();
                (idx, overlap)
            })
            .collect();

        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(k)
            .map(|(idx, _)| &self.tools[idx])
            .collect()
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    let mut tokens = HashSet::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            // Split camel case at lower->upper boundaries.
            if ch.is_uppercase() && current.chars().last().is_some_and(char::is_lowercase) {
                tokens.insert(std::mem::take(&mut current));
            }
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.insert(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.insert(current);
    }
    tokens
}
