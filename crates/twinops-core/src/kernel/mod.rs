//! Safety Kernel - the five-layer decision pipeline.
//!
//! Every candidate tool invocation passes through the same fixed stages,
//! and the first denial terminates the pipeline:
//!
//! 1. **Authorize**: RBAC against the current verified policy,
//!    fail-closed when no verified policy is available
//! 2. **Interlocks**: state predicates evaluated against one consistent
//!    shadow view
//! 3. **Risk classification**: policy risk wins over the schema hint;
//!    simulation is forced at or above the simulation threshold
//! 4. **Approval gate**: calls at or above the approval threshold park
//!    as pending tasks before any invocation happens
//! 5. **Execute**: the twin client performs the (possibly simulated)
//!    call
//!
//! Exactly one [`Decision`] is produced per call, decisions are values
//! rather than errors, and every transition lands in the audit log.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::approval::{ApprovalStore, ApprovalTask, ResolutionHooks, ResolutionOutcome};
use crate::audit::{AuditDraft, AuditEvent, AuditLog};
use crate::canonical::canonical_digest_hex;
use crate::policy::{PolicyError, PolicyStore, RiskLevel};
use crate::shadow::ShadowTwin;

/// Stable denial codes callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyCode {
    /// No policy with a valid signature is available.
    PolicyUnverified,
    /// The cached policy exceeded its maximum age.
    PolicyStale,
    /// No requesting role is bound to the operation.
    RoleUnauthorized,
    /// A state interlock predicate held.
    InterlockTriggered,
    /// A requester tried to approve their own task.
    SelfApproval,
    /// Execution hit its deadline.
    ExecutionTimeout,
    /// Execution failed terminally.
    ExecutionFailed,
    /// The circuit to the twin is open.
    CircuitOpen,
    /// Transport to the twin failed after retries.
    TransportFailure,
    /// The call arguments were malformed.
    MalformedInput,
}

impl std::fmt::Display for DenyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PolicyUnverified => "policy_unverified",
            Self::PolicyStale => "policy_stale",
            Self::RoleUnauthorized => "role_unauthorized",
            Self::InterlockTriggered => "interlock_triggered",
            Self::SelfApproval => "self_approval",
            Self::ExecutionTimeout => "execution_timeout",
            Self::ExecutionFailed => "execution_failed",
            Self::CircuitOpen => "circuit_open",
            Self::TransportFailure => "transport_failure",
            Self::MalformedInput => "malformed_input",
        };
        f.write_str(s)
    }
}

/// A candidate tool invocation entering the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Operation name.
    pub name: String,

    /// Arguments as they will reach the twin.
    pub arguments: Value,

    /// Risk annotation from the operation schema, if any. The policy's
    /// `operation_risk` table takes precedence.
    pub schema_risk: Option<RiskLevel>,

    /// Whether the caller asked for a simulated run.
    pub requested_simulate: bool,

    /// Caller-supplied idempotency key.
    pub idempotency_key: Option<String>,
}

/// The kernel's verdict for one call. Exactly one per call.
#[derive(Debug, Clone)]
pub enum Decision {
    /// The call executed against the asset.
    Executed {
        /// Result returned by the twin.
        result: Value,
    },

    /// The call executed in simulation; the asset was not touched.
    Simulated {
        /// Result returned by the simulated run.
        result: Value,
    },

    /// The call was refused.
    Denied {
        /// Stable code.
        code: DenyCode,
        /// Human-readable reason.
        reason: String,
        /// Structured context (interlock id, error text).
        details: Option<Value>,
    },

    /// The call is parked until a human approves it.
    PendingApproval {
        /// Approval task id.
        task_id: String,
    },
}

impl Decision {
    /// Compact rendering for audit entries.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Executed { .. } => "allow_execute".to_string(),
            Self::Simulated { .. } => "allow_simulate".to_string(),
            Self::Denied { code, .. } => format!("deny:{code}"),
            Self::PendingApproval { task_id } => format!("pending_approval:{task_id}"),
        }
    }
}

/// Terminal failure of an execution attempt.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The circuit to the endpoint is open.
    #[error("circuit open: {0}")]
    CircuitOpen(String),

    /// The per-call deadline elapsed.
    #[error("execution timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Transport failed after retry exhaustion.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The twin reported a definite failure.
    #[error("operation failed: {0}")]
    Failed(String),

    /// The request was cancelled by its deadline or caller.
    #[error("cancelled")]
    Cancelled,
}

impl ExecutionError {
    fn deny_code(&self) -> DenyCode {
        match self {
            Self::CircuitOpen(_) => DenyCode::CircuitOpen,
            Self::Timeout(_) => DenyCode::ExecutionTimeout,
            Self::Transport(_) => DenyCode::TransportFailure,
            Self::Failed(_) | Self::Cancelled => DenyCode::ExecutionFailed,
        }
    }
}

/// The twin-client seam: performs the actual (or simulated) invocation.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Invokes the operation, honoring the simulate flag.
    async fn invoke(&self, call: &ToolCall, simulate: bool) -> Result<Value, ExecutionError>;
}

struct EvalOptions {
    /// Skip the approval gate (resubmission of an approved task).
    skip_approval_gate: bool,

    /// Approval task linked to this evaluation, recorded in audit.
    linked_task: Option<String>,
}

/// Actor recorded on policy lifecycle audit entries.
const POLICY_ACTOR: &str = "kernel";

/// The Safety Kernel.
pub struct SafetyKernel {
    policy: Arc<PolicyStore>,
    shadow: Arc<ShadowTwin>,
    executor: Arc<dyn ToolExecutor>,
    audit: Arc<AuditLog>,
    approvals: Arc<ApprovalStore>,
    interlock_fail_safe: bool,
    last_policy_digest: std::sync::Mutex<Option<String>>,
}

impl SafetyKernel {
    /// Wires a kernel over its collaborators and registers the
    /// resolution hooks on the approval store.
    #[must_use]
    pub fn new(
        policy: Arc<PolicyStore>,
        shadow: Arc<ShadowTwin>,
        executor: Arc<dyn ToolExecutor>,
        audit: Arc<AuditLog>,
        approvals: Arc<ApprovalStore>,
        interlock_fail_safe: bool,
    ) -> Arc<Self> {
        let kernel = Arc::new(Self {
            policy,
            shadow,
            executor,
            audit,
            approvals,
            interlock_fail_safe,
            last_policy_digest: std::sync::Mutex::new(None),
        });
        let hooks: Arc<dyn ResolutionHooks> = Arc::clone(&kernel) as Arc<dyn ResolutionHooks>;
        kernel.approvals.register_hooks(&hooks);
        kernel
    }

    /// The approval store this kernel parks gated calls in.
    #[must_use]
    pub fn approvals(&self) -> &Arc<ApprovalStore> {
        &self.approvals
    }

    /// Evaluates one call through the full pipeline.
    pub async fn evaluate(&self, call: &ToolCall, actor: &str, roles: &[String]) -> Decision {
        self.evaluate_with(
            call,
            actor,
            roles,
            &EvalOptions {
                skip_approval_gate: false,
                linked_task: None,
            },
        )
        .await
    }

    async fn evaluate_with(
        &self,
        call: &ToolCall,
        actor: &str,
        roles: &[String],
        opts: &EvalOptions,
    ) -> Decision {
        let args_digest = canonical_digest_hex(&call.arguments);

        // Layer 1a: a decision is only made against a currently-verified,
        // sufficiently fresh policy. Anything else denies by default.
        let policy = match self.policy.current().await {
            Ok(policy) => policy,
            Err(err) => {
                self.audit_policy_event(
                    AuditEvent::PolicyRejected,
                    json!({ "error": err.to_string() }),
                );
                let code = match err {
                    PolicyError::Stale { .. } => DenyCode::PolicyStale,
                    PolicyError::Unverified(_) | PolicyError::FetchFailed(_) => {
                        DenyCode::PolicyUnverified
                    },
                };
                return self.deny(call, actor, roles, &args_digest, opts, code, err.to_string());
            },
        };
        self.note_policy_digest().await;

        self.audit_entry(
            call,
            actor,
            roles,
            &args_digest,
            opts,
            AuditEvent::Proposed,
            None,
            Some(json!({
                "shadow_freshness_ms": self
                    .shadow
                    .freshness()
                    .map(|age| u64::try_from(age.as_millis()).unwrap_or(u64::MAX)),
            })),
        );

        // Layer 1b: RBAC.
        if !policy.authorizes(roles, &call.name) {
            return self.deny(
                call,
                actor,
                roles,
                &args_digest,
                opts,
                DenyCode::RoleUnauthorized,
                format!("role(s) {roles:?} not authorized for {}", call.name),
            );
        }

        // Layer 2: interlocks, evaluated against one consistent view.
        let mut interlock_warnings: Vec<Value> = Vec::new();
        let violated = {
            let view = self.shadow.read_view();
            let mut violated = None;
            for interlock in &policy.interlocks {
                let rule = &interlock.deny_when;
                match view.get(&rule.submodel, &rule.path) {
                    Some(current) => {
                        if rule.holds(current) {
                            violated = Some((
                                interlock.id.clone(),
                                interlock.message.clone().unwrap_or_else(|| {
                                    format!("interlock {} triggered", interlock.id)
                                }),
                            ));
                            break;
                        }
                    },
                    None => {
                        warn!(
                            interlock = %interlock.id,
                            submodel = %rule.submodel,
                            path = %rule.path,
                            fail_safe = self.interlock_fail_safe,
                            "interlock property missing from shadow"
                        );
                        if self.interlock_fail_safe {
                            violated = Some((
                                interlock.id.clone(),
                                format!(
                                    "interlock {} cannot be evaluated: {}/{} not in shadow",
                                    interlock.id, rule.submodel, rule.path
                                ),
                            ));
                            break;
                        }
                        interlock_warnings.push(json!({
                            "interlock": interlock.id,
                            "missing": format!("{}/{}", rule.submodel, rule.path),
                        }));
                    },
                }
            }
            violated
        };
        if let Some((id, message)) = violated {
            return self.deny_with_details(
                call,
                actor,
                roles,
                &args_digest,
                opts,
                DenyCode::InterlockTriggered,
                message,
                Some(json!({ "interlock_id": id })),
            );
        }

        let warning_details = if interlock_warnings.is_empty() {
            None
        } else {
            Some(json!({ "interlock_warnings": interlock_warnings }))
        };

        // Layer 3: risk classification and simulation forcing.
        let risk = policy.risk_for(&call.name, call.schema_risk);
        let requires_approval = risk >= policy.require_approval_for_risk;
        let forced_simulation = risk >= policy.require_simulation_for_risk;

        // Layer 4: approval gate. Gated calls park before any
        // invocation; a requested simulation is harmless and bypasses
        // the gate.
        if requires_approval && !call.requested_simulate && !opts.skip_approval_gate {
            let task_id = self.approvals.create(call.clone(), actor, roles);
            self.audit_entry(
                call,
                actor,
                roles,
                &args_digest,
                &EvalOptions {
                    skip_approval_gate: false,
                    linked_task: Some(task_id.clone()),
                },
                AuditEvent::PendingApproval,
                Some(format!("pending_approval:{task_id}")),
                Some(json!({ "risk": risk.to_string() })),
            );
            info!(tool = %call.name, %task_id, %risk, "call parked for approval");
            return Decision::PendingApproval { task_id };
        }

        // Resubmitted tasks run for real; otherwise forcing applies in
        // the band below the approval threshold.
        let simulate_effective = if opts.skip_approval_gate {
            false
        } else {
            call.requested_simulate || forced_simulation
        };

        // Layer 5: execute.
        match self.executor.invoke(call, simulate_effective).await {
            Ok(result) => {
                let result_digest = canonical_digest_hex(&result);
                let (event, decision) = if simulate_effective {
                    (AuditEvent::Simulated, Decision::Simulated { result })
                } else {
                    (AuditEvent::Executed, Decision::Executed { result })
                };
                self.audit_entry_full(
                    call,
                    actor,
                    roles,
                    &args_digest,
                    opts,
                    event,
                    Some(decision.label()),
                    Some(result_digest),
                    warning_details,
                );
                decision
            },
            Err(err) => {
                let code = err.deny_code();
                self.audit_entry(
                    call,
                    actor,
                    roles,
                    &args_digest,
                    opts,
                    AuditEvent::ExecFailed,
                    Some(format!("deny:{code}")),
                    Some(json!({ "error": err.to_string() })),
                );
                Decision::Denied {
                    code,
                    reason: err.to_string(),
                    details: None,
                }
            },
        }
    }

    /// Records a `policy_loaded` entry whenever the verified payload
    /// digest changes.
    async fn note_policy_digest(&self) {
        let Some(digest) = self.policy.current_digest().await else {
            return;
        };
        {
            let mut last = self.last_policy_digest.lock().expect("policy digest lock");
            if last.as_deref() == Some(digest.as_str()) {
                return;
            }
            *last = Some(digest.clone());
        }
        self.audit_policy_event(AuditEvent::PolicyLoaded, json!({ "policy_digest": digest }));
    }

    fn audit_policy_event(&self, event: AuditEvent, details: Value) {
        let draft = AuditDraft {
            actor: POLICY_ACTOR.to_string(),
            roles: Vec::new(),
            details: Some(details),
            ..AuditDraft::default()
        };
        if let Err(err) = self.audit.append(draft, event) {
            tracing::error!(error = %err, "audit append failed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn deny(
        &self,
        call: &ToolCall,
        actor: &str,
        roles: &[String],
        args_digest: &str,
        opts: &EvalOptions,
        code: DenyCode,
        reason: String,
    ) -> Decision {
        self.deny_with_details(call, actor, roles, args_digest, opts, code, reason, None)
    }

    #[allow(clippy::too_many_arguments)]
    fn deny_with_details(
        &self,
        call: &ToolCall,
        actor: &str,
        roles: &[String],
        args_digest: &str,
        opts: &EvalOptions,
        code: DenyCode,
        reason: String,
        details: Option<Value>,
    ) -> Decision {
        self.audit_entry(
            call,
            actor,
            roles,
            args_digest,
            opts,
            AuditEvent::Denied,
            Some(format!("deny:{code}")),
            details.clone(),
        );
        info!(tool = %call.name, %code, "call denied");
        Decision::Denied {
            code,
            reason,
            details,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn audit_entry(
        &self,
        call: &ToolCall,
        actor: &str,
        roles: &[String],
        args_digest: &str,
        opts: &EvalOptions,
        event: AuditEvent,
        decision: Option<String>,
        details: Option<Value>,
    ) {
        self.audit_entry_full(
            call, actor, roles, args_digest, opts, event, decision, None, details,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn audit_entry_full(
        &self,
        call: &ToolCall,
        actor: &str,
        roles: &[String],
        args_digest: &str,
        opts: &EvalOptions,
        event: AuditEvent,
        decision: Option<String>,
        result_digest: Option<String>,
        details: Option<Value>,
    ) {
        let draft = AuditDraft {
            actor: actor.to_string(),
            roles: roles.to_vec(),
            tool: Some(call.name.clone()),
            args_digest: Some(args_digest.to_string()),
            decision,
            result_digest,
            task_id: opts.linked_task.clone(),
            details,
        };
        if let Err(err) = self.audit.append(draft, event) {
            // An unwritable audit log must not silently pass: the error
            // is surfaced loudly even though the decision stands.
            tracing::error!(error = %err, "audit append failed");
        }
    }
}

#[async_trait::async_trait]
impl ResolutionHooks for SafetyKernel {
    async fn may_approve(&self, roles: &[String]) -> Result<bool, String> {
        match self.policy.current().await {
            Ok(policy) => Ok(policy.may_approve(roles)),
            Err(err) => Err(err.to_string()),
        }
    }

    async fn resubmit(&self, task: &ApprovalTask) -> Decision {
        let (approver, roles) = match &task.state {
            crate::approval::TaskState::Approved { by, .. } => {
                (by.clone(), task.requester_roles.clone())
            },
            _ => {
                return Decision::Denied {
                    code: DenyCode::ExecutionFailed,
                    reason: "resubmission of an unapproved task".to_string(),
                    details: None,
                };
            },
        };

        // Record the approval itself before re-entering the pipeline.
        let draft = AuditDraft {
            actor: approver,
            roles: roles.clone(),
            tool: Some(task.tool_call.name.clone()),
            args_digest: Some(canonical_digest_hex(&task.tool_call.arguments)),
            decision: Some("approved".to_string()),
            result_digest: None,
            task_id: Some(task.task_id.clone()),
            details: None,
        };
        if let Err(err) = self.audit.append(draft, AuditEvent::Approved) {
            tracing::error!(error = %err, "audit append failed");
        }

        self.evaluate_with(
            &task.tool_call,
            &task.requester_actor,
            &task.requester_roles,
            &EvalOptions {
                skip_approval_gate: true,
                linked_task: Some(task.task_id.clone()),
            },
        )
        .await
    }
}

/// Records a rejection in the audit log.
///
/// Kept beside the kernel so orchestrators do not write audit drafts by
/// hand.
pub fn audit_rejection(
    audit: &AuditLog,
    task: &ApprovalTask,
    rejector: &str,
    reason: &str,
) {
    let draft = AuditDraft {
        actor: rejector.to_string(),
        roles: Vec::new(),
        tool: Some(task.tool_call.name.clone()),
        args_digest: Some(canonical_digest_hex(&task.tool_call.arguments)),
        decision: Some("rejected".to_string()),
        result_digest: None,
        task_id: Some(task.task_id.clone()),
        details: Some(json!({ "reason": reason })),
    };
    if let Err(err) = audit.append(draft, AuditEvent::Rejected) {
        tracing::error!(error = %err, "audit append failed");
    }
}

/// Convenience: drive an approval through the store and audit the
/// outcome transitions the store itself cannot see.
pub async fn resolve_approval(
    store: &ApprovalStore,
    audit: &AuditLog,
    task_id: &str,
    approver: &str,
    roles: &[String],
    approve: bool,
    reason: &str,
) -> ResolutionOutcome {
    if approve {
        store.approve(task_id, approver, roles).await
    } else {
        let outcome = store.reject(task_id, approver, roles, reason).await;
        if let ResolutionOutcome::Rejected { task } = &outcome {
            audit_rejection(audit, task, approver, reason);
        }
        outcome
    }
}

#[cfg(test)]
mod tests;
