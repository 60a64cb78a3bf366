//! Policy document schema.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation risk levels, ordered from least to most dangerous.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    /// Read-only or otherwise harmless operations.
    Low,

    /// Operations with limited, reversible effect.
    #[default]
    Medium,

    /// Operations that change physical process state.
    High,

    /// Operations with irreversible or hazardous effect.
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Comparison operator used in interlock predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    /// Greater than.
    #[serde(rename = ">")]
    Gt,
    /// Less than.
    #[serde(rename = "<")]
    Lt,
    /// Greater than or equal.
    #[serde(rename = ">=")]
    Ge,
    /// Less than or equal.
    #[serde(rename = "<=")]
    Le,
    /// JSON equality.
    #[serde(rename = "==")]
    Eq,
    /// JSON inequality.
    #[serde(rename = "!=")]
    Ne,
}

/// The condition under which an interlock denies an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterlockPredicate {
    /// Submodel the monitored value lives in.
    pub submodel: String,

    /// idShort path of the monitored value within the submodel.
    pub path: String,

    /// Comparison operator.
    pub op: CmpOp,

    /// Threshold the live value is compared against.
    pub value: Value,
}

impl InterlockPredicate {
    /// Evaluates the predicate against a live value.
    ///
    /// Comparisons are numeric when both sides parse as numbers, string
    /// typed otherwise. `==`/`!=` use JSON equality.
    #[must_use]
    pub fn holds(&self, current: &Value) -> bool {
        match self.op {
            CmpOp::Eq => json_eq(current, &self.value),
            CmpOp::Ne => !json_eq(current, &self.value),
            ordered => match (as_number(current), as_number(&self.value)) {
                (Some(lhs), Some(rhs)) => match ordered {
                    CmpOp::Gt => lhs > rhs,
                    CmpOp::Lt => lhs < rhs,
                    CmpOp::Ge => lhs >= rhs,
                    CmpOp::Le => lhs <= rhs,
                    CmpOp::Eq | CmpOp::Ne => unreachable!(),
                },
                _ => {
                    let (lhs, rhs) = (as_text(current), as_text(&self.value));
                    match ordered {
                        CmpOp::Gt => lhs > rhs,
                        CmpOp::Lt => lhs < rhs,
                        CmpOp::Ge => lhs >= rhs,
                        CmpOp::Le => lhs <= rhs,
                        CmpOp::Eq | CmpOp::Ne => unreachable!(),
                    }
                },
            },
        }
    }
}

/// A single interlock rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interlock {
    /// Stable identifier, surfaced in denial reasons and audit entries.
    pub id: String,

    /// Predicate that blocks the operation when it holds.
    pub deny_when: InterlockPredicate,

    /// Operator-facing message for the denial.
    #[serde(default)]
    pub message: Option<String>,
}

/// Operations a role is allowed to invoke.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleBinding {
    /// Operation names, or `"*"` for all operations.
    #[serde(default)]
    pub allow: BTreeSet<String>,
}

impl RoleBinding {
    /// Whether this binding permits the named operation.
    #[must_use]
    pub fn permits(&self, operation: &str) -> bool {
        self.allow.contains("*") || self.allow.contains(operation)
    }
}

/// The verified safety policy a kernel decision is made against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Risk level at or above which execution is forced into simulation.
    #[serde(default = "default_simulation_risk")]
    pub require_simulation_for_risk: RiskLevel,

    /// Risk level at or above which human approval is required.
    #[serde(default = "default_approval_risk")]
    pub require_approval_for_risk: RiskLevel,

    /// Role name to permitted operations.
    #[serde(default)]
    pub role_bindings: BTreeMap<String, RoleBinding>,

    /// Interlocks, evaluated in order; the first violated rule denies.
    #[serde(default)]
    pub interlocks: Vec<Interlock>,

    /// Per-operation risk overrides. Takes precedence over schema hints.
    #[serde(default)]
    pub operation_risk: BTreeMap<String, RiskLevel>,

    /// Roles permitted to resolve approval tasks. When absent, any role
    /// whose binding allows `"*"` may approve.
    #[serde(default)]
    pub approver_roles: Option<Vec<String>>,
}

const fn default_simulation_risk() -> RiskLevel {
    RiskLevel::High
}

const fn default_approval_risk() -> RiskLevel {
    RiskLevel::Critical
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            require_simulation_for_risk: default_simulation_risk(),
            require_approval_for_risk: default_approval_risk(),
            role_bindings: BTreeMap::new(),
            interlocks: Vec::new(),
            operation_risk: BTreeMap::new(),
            approver_roles: None,
        }
    }
}

impl PolicyDocument {
    /// Resolves the risk of an operation: the policy override wins over
    /// the schema hint, and the default is `MEDIUM`.
    #[must_use]
    pub fn risk_for(&self, operation: &str, schema_hint: Option<RiskLevel>) -> RiskLevel {
        self.operation_risk
            .get(operation)
            .copied()
            .or(schema_hint)
            .unwrap_or_default()
    }

    /// Whether any of the given roles may invoke the operation.
    ///
    /// An empty `role_bindings` table means RBAC is not configured and
    /// every operation is permitted.
    #[must_use]
    pub fn authorizes(&self, roles: &[String], operation: &str) -> bool {
        if self.role_bindings.is_empty() {
            return true;
        }
        roles.iter().any(|role| {
            self.role_bindings
                .get(role)
                .is_some_and(|binding| binding.permits(operation))
        })
    }

    /// Whether any of the given roles may resolve approval tasks.
    #[must_use]
    pub fn may_approve(&self, roles: &[String]) -> bool {
        match &self.approver_roles {
            Some(approvers) => roles.iter().any(|role| approvers.contains(role)),
            None => roles.iter().any(|role| {
                self.role_bindings
                    .get(role)
                    .is_some_and(|binding| binding.allow.contains("*"))
            }),
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_eq(left: &Value, right: &Value) -> bool {
    // Numeric-vs-string comparisons fall back to text so "97" == 97
    // behaves the way policy authors expect.
    if left == right {
        return true;
    }
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => (l - r).abs() < f64::EPSILON,
        _ => as_text(left) == as_text(right),
    }
}
