//! Human-in-the-loop approval tasks.
//!
//! Operations at or above the policy's approval risk threshold park here
//! as pending tasks until a human resolves them. This process instance
//! authoritatively owns approval state; the store is a plain in-memory
//! map guarded by one lock, which also serializes resolutions per task.
//!
//! Resolution hooks (the approver-role check and the kernel's resubmit
//! entry point) are injected after construction, so the store never owns
//! the kernel while the kernel owns the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::kernel::{Decision, DenyCode, ToolCall};

/// Default lifetime of a pending task before it expires.
pub const DEFAULT_APPROVAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Resolution state of an approval task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a human decision.
    Pending,

    /// Approved; the call was resubmitted to the kernel.
    Approved {
        /// Approving actor.
        by: String,
        /// Resolution time.
        at: DateTime<Utc>,
    },

    /// Rejected. Terminal.
    Rejected {
        /// Rejecting actor.
        by: String,
        /// Stated reason.
        reason: String,
        /// Resolution time.
        at: DateTime<Utc>,
    },

    /// The task outlived its TTL unresolved. Terminal.
    Expired,
}

impl TaskState {
    /// Whether the state admits no further transition.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A parked operation awaiting human approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalTask {
    /// Task identifier (`task-` + 8 hex chars).
    pub task_id: String,

    /// The call that was gated.
    pub tool_call: ToolCall,

    /// Actor whose request created the task.
    pub requester_actor: String,

    /// Roles the request carried.
    pub requester_roles: Vec<String>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Current state.
    pub state: TaskState,
}

/// Outcome of an approve/reject call.
#[derive(Debug)]
pub enum ResolutionOutcome {
    /// The task transitioned to approved and was resubmitted; carries
    /// the kernel's decision for the re-executed call.
    Approved {
        /// The resolved task.
        task: ApprovalTask,
        /// Decision from the resubmitted call.
        decision: Decision,
    },

    /// The task transitioned to rejected.
    Rejected {
        /// The resolved task.
        task: ApprovalTask,
    },

    /// The task was already terminal; carries the recorded state.
    AlreadyResolved {
        /// The task with its recorded terminal state.
        task: ApprovalTask,
    },

    /// The resolution was refused; the task stays pending.
    Denied {
        /// Denial code (`self_approval`, `role_unauthorized`, ...).
        code: DenyCode,
        /// Human-readable reason.
        reason: String,
    },

    /// No task with that id.
    NotFound,

    /// The task expired before resolution.
    Expired,
}

/// Hooks the kernel registers so resolutions can consult policy and
/// re-enter the decision pipeline without a reference cycle.
#[async_trait::async_trait]
pub trait ResolutionHooks: Send + Sync {
    /// Whether the given roles may resolve approval tasks. Errors mean
    /// the policy is unavailable and the resolution is refused.
    async fn may_approve(&self, roles: &[String]) -> Result<bool, String>;

    /// Resubmits an approved task's call through the kernel with the
    /// approval gate skipped.
    async fn resubmit(&self, task: &ApprovalTask) -> Decision;
}

/// In-memory map of approval tasks.
///
/// Mutex poisoning indicates a panic in another thread, which is
/// unrecoverable.
#[allow(clippy::missing_panics_doc)]
pub struct ApprovalStore {
    tasks: Mutex<HashMap<String, ApprovalTask>>,
    ttl: Duration,
    hooks: OnceLock<Weak<dyn ResolutionHooks>>,
}

impl ApprovalStore {
    /// Creates a store with the given task TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            ttl,
            hooks: OnceLock::new(),
        }
    }

    /// Registers the kernel's resolution hooks. Called once at wiring.
    pub fn register_hooks(&self, hooks: &Arc<dyn ResolutionHooks>) {
        let _ = self.hooks.set(Arc::downgrade(hooks));
    }

    /// Parks a call as a pending task and returns its id.
    pub fn create(
        &self,
        tool_call: ToolCall,
        requester_actor: &str,
        requester_roles: &[String],
    ) -> String {
        let task_id = format!("task-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let task = ApprovalTask {
            task_id: task_id.clone(),
            tool_call,
            requester_actor: requester_actor.to_string(),
            requester_roles: requester_roles.to_vec(),
            created_at: Utc::now(),
            state: TaskState::Pending,
        };

        info!(task_id = %task_id, tool = %task.tool_call.name, "approval task created");
        self.tasks.lock().unwrap().insert(task_id.clone(), task);
        task_id
    }

    /// Returns a task by id, applying lazy expiry.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<ApprovalTask> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(task_id)?;
        Self::expire_if_due(task, self.ttl);
        Some(task.clone())
    }

    /// Lists tasks, optionally only pending ones.
    #[must_use]
    pub fn list(&self, pending_only: bool) -> Vec<ApprovalTask> {
        let mut tasks = self.tasks.lock().unwrap();
        let mut out: Vec<ApprovalTask> = tasks
            .values_mut()
            .map(|task| {
                Self::expire_if_due(task, self.ttl);
                task.clone()
            })
            .filter(|task| !pending_only || task.state == TaskState::Pending)
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Approves a pending task and resubmits its call.
    ///
    /// Self-approval is refused, the approver must pass the registered
    /// role check, and resolving an already-terminal task is a no-op
    /// returning the recorded outcome.
    pub async fn approve(
        &self,
        task_id: &str,
        approver_actor: &str,
        approver_roles: &[String],
    ) -> ResolutionOutcome {
        let Some(hooks) = self.hooks.get().and_then(Weak::upgrade) else {
            return ResolutionOutcome::Denied {
                code: DenyCode::ExecutionFailed,
                reason: "approval resolution unavailable: kernel not wired".to_string(),
            };
        };

        // Validate and transition under the lock; the resubmission runs
        // after it is released.
        let task = {
            let mut tasks = self.tasks.lock().unwrap();
            let Some(task) = tasks.get_mut(task_id) else {
                return ResolutionOutcome::NotFound;
            };
            Self::expire_if_due(task, self.ttl);

            match &task.state {
                TaskState::Expired => return ResolutionOutcome::Expired,
                state if state.is_terminal() => {
                    return ResolutionOutcome::AlreadyResolved { task: task.clone() };
                },
                TaskState::Pending => {},
                _ => unreachable!(),
            }

            if task.requester_actor == approver_actor {
                warn!(task_id, approver = approver_actor, "self-approval refused");
                return ResolutionOutcome::Denied {
                    code: DenyCode::SelfApproval,
                    reason: format!("requester {approver_actor} may not approve their own task"),
                };
            }

            task.clone()
        };

        match hooks.may_approve(approver_roles).await {
            Ok(true) => {},
            Ok(false) => {
                return ResolutionOutcome::Denied {
                    code: DenyCode::RoleUnauthorized,
                    reason: format!("role(s) {approver_roles:?} not permitted to approve"),
                };
            },
            Err(reason) => {
                return ResolutionOutcome::Denied {
                    code: DenyCode::PolicyUnverified,
                    reason,
                };
            },
        }

        let approved = {
            let mut tasks = self.tasks.lock().unwrap();
            let Some(task) = tasks.get_mut(task_id) else {
                return ResolutionOutcome::NotFound;
            };
            // Re-check: another resolver may have won the race while the
            // role check was in flight.
            if task.state.is_terminal() {
                return ResolutionOutcome::AlreadyResolved { task: task.clone() };
            }
            task.state = TaskState::Approved {
                by: approver_actor.to_string(),
                at: Utc::now(),
            };
            task.clone()
        };

        info!(task_id, approver = approver_actor, "task approved, resubmitting");
        let decision = hooks.resubmit(&approved).await;
        ResolutionOutcome::Approved {
            task: approved,
            decision,
        }
    }

    /// Rejects a pending task.
    pub async fn reject(
        &self,
        task_id: &str,
        approver_actor: &str,
        approver_roles: &[String],
        reason: &str,
    ) -> ResolutionOutcome {
        let Some(hooks) = self.hooks.get().and_then(Weak::upgrade) else {
            return ResolutionOutcome::Denied {
                code: DenyCode::ExecutionFailed,
                reason: "approval resolution unavailable: kernel not wired".to_string(),
            };
        };

        match hooks.may_approve(approver_roles).await {
            Ok(true) => {},
            Ok(false) => {
                return ResolutionOutcome::Denied {
                    code: DenyCode::RoleUnauthorized,
                    reason: format!("role(s) {approver_roles:?} not permitted to reject"),
                };
            },
            Err(reason) => {
                return ResolutionOutcome::Denied {
                    code: DenyCode::PolicyUnverified,
                    reason,
                };
            },
        }

        let mut tasks = self.tasks.lock().unwrap();
        let Some(task) = tasks.get_mut(task_id) else {
            return ResolutionOutcome::NotFound;
        };
        Self::expire_if_due(task, self.ttl);

        match &task.state {
            TaskState::Expired => ResolutionOutcome::Expired,
            state if state.is_terminal() => {
                ResolutionOutcome::AlreadyResolved { task: task.clone() }
            },
            TaskState::Pending => {
                task.state = TaskState::Rejected {
                    by: approver_actor.to_string(),
                    reason: reason.to_string(),
                    at: Utc::now(),
                };
                info!(task_id, rejector = approver_actor, "task rejected");
                ResolutionOutcome::Rejected { task: task.clone() }
            },
            _ => unreachable!(),
        }
    }

    fn expire_if_due(task: &mut ApprovalTask, ttl: Duration) {
        if task.state == TaskState::Pending {
            let age = Utc::now().signed_duration_since(task.created_at);
            if age.to_std().is_ok_and(|age| age > ttl) {
                warn!(task_id = %task.task_id, "approval task expired");
                task.state = TaskState::Expired;
            }
        }
    }
}

impl Default for ApprovalStore {
    fn default() -> Self {
        Self::new(DEFAULT_APPROVAL_TTL)
    }
}
