//! Per-request orchestration loop.
//!
//! A chat request flows: narrow the catalog to the top-K relevant tools,
//! ask the selector for calls, submit each call to the safety kernel in
//! the order the selector returned them, and assemble the reply. A
//! denial or pending approval stops dispatch of the remaining calls so a
//! multi-call plan never half-executes.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use twinops_core::approval::ResolutionOutcome;
use twinops_core::audit::{AuditDraft, AuditEvent, AuditLog};
use twinops_core::canonical::canonical_digest_hex;
use twinops_core::kernel::{resolve_approval, Decision, DenyCode, SafetyKernel, ToolCall};

use crate::catalog::ToolCatalog;
use crate::llm::{ChatMessage, SelectorError, ToolSelector};
use crate::twin::split_arguments;

/// A framed operator request, as handed over by the HTTP front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Natural-language command.
    pub message: String,

    /// Requesting actor identity.
    pub actor: String,

    /// Roles the front-end authenticated for the actor.
    #[serde(default)]
    pub roles: Vec<String>,

    /// Request-level simulation flag.
    #[serde(default)]
    pub simulate: Option<bool>,

    /// Caller-supplied idempotency key.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Outcome of one tool call within a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Tool name.
    pub tool: String,

    /// Whether the call did what was asked (simulated counts).
    pub success: bool,

    /// Whether the run was simulated.
    pub simulated: bool,

    /// `completed`, `simulated_only`, `denied`, `pending_approval`, or
    /// `failed`.
    pub status: String,

    /// Result payload, when the call produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Stable error code, when the call did not execute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Human-readable error reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Structured denial context (interlock id and similar).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// The reply envelope returned to the front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    /// Assistant text.
    pub reply: String,

    /// Per-call outcomes in dispatch order.
    pub tool_results: Vec<ToolOutcome>,

    /// Whether a call is parked awaiting approval.
    pub pending_approval: bool,

    /// Task id of the parked call, when `pending_approval`.
    pub task_id: Option<String>,
}

/// The per-request orchestration loop.
pub struct Orchestrator {
    selector: Arc<dyn ToolSelector>,
    catalog: Arc<ToolCatalog>,
    kernel: Arc<SafetyKernel>,
    audit: Arc<AuditLog>,
    top_k: usize,
    llm_slots: Semaphore,
    tool_slots: Arc<Semaphore>,
    request_deadline: Option<Duration>,
    default_roles: Vec<String>,
}

impl Orchestrator {
    /// Wires the orchestrator.
    #[must_use]
    pub fn new(
        selector: Arc<dyn ToolSelector>,
        catalog: Arc<ToolCatalog>,
        kernel: Arc<SafetyKernel>,
        audit: Arc<AuditLog>,
        top_k: usize,
        llm_concurrency: usize,
        tool_concurrency: usize,
    ) -> Self {
        Self {
            selector,
            catalog,
            kernel,
            audit,
            top_k,
            llm_slots: Semaphore::new(llm_concurrency.max(1)),
            tool_slots: Arc::new(Semaphore::new(tool_concurrency.max(1))),
            request_deadline: None,
            default_roles: Vec::new(),
        }
    }

    /// Roles assumed for requests that carry none.
    #[must_use]
    pub fn with_default_roles(mut self, roles: Vec<String>) -> Self {
        self.default_roles = roles;
        self
    }

    /// Sets a per-request deadline; in-flight calls past it are
    /// abandoned and audited as cancelled.
    #[must_use]
    pub fn with_request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = Some(deadline);
        self
    }

    /// Processes one chat request end to end.
    pub async fn process(&self, request: &ChatRequest) -> ChatReply {
        let roles: &[String] = if request.roles.is_empty() {
            &self.default_roles
        } else {
            &request.roles
        };
        info!(actor = %request.actor, ?roles, "processing chat request");

        let tools = self.catalog.top_k(&request.message, self.top_k);
        let selection = {
            let _slot = self.llm_slots.acquire().await.expect("selector semaphore");
            self.selector
                .select(&[ChatMessage::user(&request.message)], &tools)
                .await
        };

        let selection = match selection {
            Ok(selection) => selection,
            Err(SelectorError(message)) => {
                warn!(error = %message, "tool selection failed");
                return ChatReply {
                    reply: format!("I couldn't interpret that command: {message}"),
                    tool_results: Vec::new(),
                    pending_approval: false,
                    task_id: None,
                };
            },
        };

        if selection.calls.is_empty() {
            return ChatReply {
                reply: selection
                    .content
                    .unwrap_or_else(|| "No response generated.".to_string()),
                tool_results: Vec::new(),
                pending_approval: false,
                task_id: None,
            };
        }

        let deadline = self.request_deadline.map(|d| tokio::time::Instant::now() + d);
        let mut tool_results: Vec<ToolOutcome> = Vec::new();
        let mut pending_task: Option<String> = None;

        // Calls run in selector order; a non-execute outcome stops the
        // sequence so later calls never observe half-applied plans.
        for selected in &selection.calls {
            let (arguments, call_simulate) = split_arguments(&selected.arguments);
            let requested_simulate = call_simulate || request.simulate.unwrap_or(false);

            let Some(spec) = self.catalog.get(&selected.name) else {
                tool_results.push(ToolOutcome {
                    tool: selected.name.clone(),
                    success: false,
                    simulated: false,
                    status: "failed".to_string(),
                    result: None,
                    error: Some("not_found".to_string()),
                    reason: Some(format!("unknown tool: {}", selected.name)),
                    details: None,
                });
                break;
            };

            let call = ToolCall {
                name: spec.name.clone(),
                arguments,
                schema_risk: spec.risk_hint,
                requested_simulate,
                idempotency_key: request.idempotency_key.clone(),
            };

            let outcome = self
                .dispatch(&call, &request.actor, roles, deadline)
                .await;

            let stop = outcome.status != "completed" && outcome.status != "simulated_only";
            if outcome.status == "pending_approval" {
                pending_task = outcome.details.as_ref().and_then(|d| {
                    d.get("task_id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
            }
            tool_results.push(outcome);
            if stop {
                break;
            }
        }

        let reply = build_reply(selection.content.as_deref(), &tool_results);
        ChatReply {
            reply,
            pending_approval: pending_task.is_some(),
            task_id: pending_task,
            tool_results,
        }
    }

    async fn dispatch(
        &self,
        call: &ToolCall,
        actor: &str,
        roles: &[String],
        deadline: Option<tokio::time::Instant>,
    ) -> ToolOutcome {
        let _slot = self
            .tool_slots
            .acquire()
            .await
            .expect("tool semaphore");

        let evaluation = self.kernel.evaluate(call, actor, roles);
        let decision = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, evaluation).await {
                Ok(decision) => decision,
                Err(_) => {
                    // The in-flight twin call is abandoned, not rolled
                    // back; the audit records the cancellation.
                    let draft = AuditDraft {
                        actor: actor.to_string(),
                        roles: roles.to_vec(),
                        tool: Some(call.name.clone()),
                        args_digest: Some(canonical_digest_hex(&call.arguments)),
                        decision: Some("deny:execution_timeout".to_string()),
                        details: Some(serde_json::json!({"error": "cancelled"})),
                        ..AuditDraft::default()
                    };
                    if let Err(err) = self.audit.append(draft, AuditEvent::ExecFailed) {
                        tracing::error!(error = %err, "audit append failed");
                    }
                    return ToolOutcome {
                        tool: call.name.clone(),
                        success: false,
                        simulated: false,
                        status: "failed".to_string(),
                        result: None,
                        error: Some(DenyCode::ExecutionTimeout.to_string()),
                        reason: Some("request deadline exceeded".to_string()),
                        details: None,
                    };
                },
            },
            None => evaluation.await,
        };

        outcome_of(&call.name, decision)
    }

    /// Approves a pending task; the kernel re-runs the call with the
    /// gate skipped.
    pub async fn approve(
        &self,
        task_id: &str,
        approver: &str,
        roles: &[String],
    ) -> ApprovalReply {
        let outcome = resolve_approval(
            self.kernel.approvals(),
            &self.audit,
            task_id,
            approver,
            roles,
            true,
            "",
        )
        .await;
        approval_reply(task_id, outcome)
    }

    /// Rejects a pending task.
    pub async fn reject(
        &self,
        task_id: &str,
        approver: &str,
        roles: &[String],
        reason: &str,
    ) -> ApprovalReply {
        let outcome = resolve_approval(
            self.kernel.approvals(),
            &self.audit,
            task_id,
            approver,
            roles,
            false,
            reason,
        )
        .await;
        approval_reply(task_id, outcome)
    }
}

/// Reply for an approval resolution.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalReply {
    /// The resolved task.
    pub task_id: String,

    /// `approved`, `rejected`, `already_resolved`, `denied`,
    /// `not_found`, or `expired`.
    pub status: String,

    /// Outcome of the resubmitted call, when approval triggered one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolOutcome>,

    /// Stable error code when the resolution was refused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Human-readable refusal reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn approval_reply(task_id: &str, outcome: ResolutionOutcome) -> ApprovalReply {
    match outcome {
        ResolutionOutcome::Approved { task, decision } => ApprovalReply {
            task_id: task.task_id.clone(),
            status: "approved".to_string(),
            tool_result: Some(outcome_of(&task.tool_call.name, decision)),
            error: None,
            reason: None,
        },
        ResolutionOutcome::Rejected { task } => ApprovalReply {
            task_id: task.task_id,
            status: "rejected".to_string(),
            tool_result: None,
            error: None,
            reason: None,
        },
        ResolutionOutcome::AlreadyResolved { task } => ApprovalReply {
            task_id: task.task_id,
            status: "already_resolved".to_string(),
            tool_result: None,
            error: None,
            reason: None,
        },
        ResolutionOutcome::Denied { code, reason } => ApprovalReply {
            task_id: task_id.to_string(),
            status: "denied".to_string(),
            tool_result: None,
            error: Some(code.to_string()),
            reason: Some(reason),
        },
        ResolutionOutcome::NotFound => ApprovalReply {
            task_id: task_id.to_string(),
            status: "not_found".to_string(),
            tool_result: None,
            error: Some("not_found".to_string()),
            reason: None,
        },
        ResolutionOutcome::Expired => ApprovalReply {
            task_id: task_id.to_string(),
            status: "expired".to_string(),
            tool_result: None,
            error: Some("not_found".to_string()),
            reason: Some("task expired before resolution".to_string()),
        },
    }
}

/// Maps a kernel decision onto the wire outcome for one call.
fn outcome_of(tool: &str, decision: Decision) -> ToolOutcome {
    match decision {
        Decision::Executed { result } => ToolOutcome {
            tool: tool.to_string(),
            success: true,
            simulated: false,
            status: "completed".to_string(),
            result: Some(result),
            error: None,
            reason: None,
            details: None,
        },
        Decision::Simulated { result } => ToolOutcome {
            tool: tool.to_string(),
            success: true,
            simulated: true,
            status: "simulated_only".to_string(),
            result: Some(result),
            error: None,
            reason: None,
            details: None,
        },
        Decision::PendingApproval { task_id } => ToolOutcome {
            tool: tool.to_string(),
            success: true,
            simulated: false,
            status: "pending_approval".to_string(),
            result: Some(serde_json::json!({"message": "Awaiting human approval"})),
            error: None,
            reason: None,
            details: Some(serde_json::json!({"task_id": task_id})),
        },
        Decision::Denied {
            code,
            reason,
            details,
        } => {
            let execution_failure = matches!(
                code,
                DenyCode::ExecutionFailed
                    | DenyCode::ExecutionTimeout
                    | DenyCode::TransportFailure
                    | DenyCode::CircuitOpen
            );
            ToolOutcome {
                tool: tool.to_string(),
                success: false,
                simulated: false,
                status: if execution_failure { "failed" } else { "denied" }.to_string(),
                result: None,
                error: Some(code.to_string()),
                reason: Some(reason),
                details,
            }
        },
    }
}

/// Builds the operator-facing reply text from the call outcomes.
fn build_reply(selector_content: Option<&str>, results: &[ToolOutcome]) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(content) = selector_content {
        if !content.is_empty() {
            parts.push(content.to_string());
        }
    }

    for result in results {
        match result.status.as_str() {
            "simulated_only" => parts.push(format!(
                "Simulation completed for '{}'. To execute for real, re-issue the command \
                 with simulate=false.",
                result.tool
            )),
            "pending_approval" => {
                let task_id = result
                    .details
                    .as_ref()
                    .and_then(|d| d.get("task_id"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                parts.push(format!(
                    "Operation '{}' requires human approval. Task ID: {task_id}",
                    result.tool
                ));
            },
            "completed" => parts.push(format!("Executed '{}' successfully.", result.tool)),
            _ => parts.push(format!(
                "Failed to execute '{}': {}",
                result.tool,
                result
                    .reason
                    .as_deref()
                    .or(result.error.as_deref())
                    .unwrap_or("unknown error")
            )),
        }
    }

    if parts.is_empty() {
        "No response generated.".to_string()
    } else {
        parts.join(" ")
    }
}
