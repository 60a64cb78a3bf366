//! Kernel pipeline tests over stubbed collaborators.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{json, Value};
use tempfile::TempDir;

use super::*;
use crate::approval::ApprovalStore;
use crate::audit::AuditLog;
use crate::canonical::to_canonical_json;
use crate::policy::{ed25519_verifier, PolicyStore, SignedPolicy};
use crate::shadow::ShadowTwin;

/// Records invocations; fails when primed to.
struct StubExecutor {
    invocations: Mutex<Vec<(String, bool)>>,
    failure: Mutex<Option<ExecutionError>>,
}

impl StubExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            invocations: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        })
    }

    fn prime_failure(&self, err: ExecutionError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    fn invocations(&self) -> Vec<(String, bool)> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ToolExecutor for StubExecutor {
    async fn invoke(&self, call: &ToolCall, simulate: bool) -> Result<Value, ExecutionError> {
        self.invocations
            .lock()
            .unwrap()
            .push((call.name.clone(), simulate));
        if let Some(err) = self.failure.lock().unwrap().take() {
            return Err(err);
        }
        Ok(json!({"status": "COMPLETED", "simulated": simulate}))
    }
}

struct Harness {
    kernel: Arc<SafetyKernel>,
    executor: Arc<StubExecutor>,
    shadow: Arc<ShadowTwin>,
    audit_path: std::path::PathBuf,
    _dir: TempDir,
}

fn sample_policy() -> Value {
    json!({
        "require_simulation_for_risk": "HIGH",
        "require_approval_for_risk": "CRITICAL",
        "role_bindings": {
            "operator": {"allow": ["SetSpeed", "StartPump", "StopPump", "GetStatus"]},
            "maintenance": {"allow": ["EmergencyStop", "StartPump"]},
            "viewer": {"allow": ["GetStatus"]},
            "supervisor": {"allow": ["*"]}
        },
        "interlocks": [
            {
                "id": "temp-high",
                "deny_when": {
                    "submodel": "urn:example:submodel:pump",
                    "path": "CurrentTemperature",
                    "op": ">",
                    "value": 95
                },
                "message": "Temperature too high to operate"
            }
        ],
        "operation_risk": {
            "StartPump": "HIGH",
            "SetSpeed": "MEDIUM",
            "EmergencyStop": "CRITICAL",
            "GetStatus": "LOW"
        }
    })
}

fn harness(policy_payload: Value, tamper_signature: bool, fail_safe: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let audit = Arc::new(AuditLog::open(&audit_path).unwrap());

    let key = SigningKey::generate(&mut rand::thread_rng());
    let message = to_canonical_json(&policy_payload);
    let signature = key.sign(message.as_bytes());
    let mut envelope = SignedPolicy {
        payload: policy_payload,
        signature_b64: base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()),
        key_id: "covenant-1".to_string(),
    };
    if tamper_signature {
        envelope.payload = json!({"role_bindings": {"intruder": {"allow": ["*"]}}});
    }

    let fetcher = move || {
        let envelope = envelope.clone();
        async move { Ok::<_, String>(envelope) }
    };
    let policy = Arc::new(PolicyStore::new(
        Box::new(fetcher),
        ed25519_verifier(),
        key.verifying_key(),
        Duration::from_secs(300),
        None,
    ));

    let shadow = Arc::new(ShadowTwin::new());
    let mut snapshot = HashMap::new();
    snapshot.insert(
        "urn:example:submodel:pump".to_string(),
        HashMap::from([
            ("CurrentTemperature".to_string(), json!(42.0)),
            ("PumpState".to_string(), json!("Stopped")),
        ]),
    );
    shadow.apply_snapshot(snapshot);

    let executor = StubExecutor::new();
    let approvals = Arc::new(ApprovalStore::new(Duration::from_secs(3600)));

    let kernel = SafetyKernel::new(
        policy,
        Arc::clone(&shadow),
        Arc::clone(&executor) as Arc<dyn ToolExecutor>,
        audit,
        approvals,
        fail_safe,
    );

    Harness {
        kernel,
        executor,
        shadow,
        audit_path,
        _dir: dir,
    }
}

fn call(name: &str, simulate: bool) -> ToolCall {
    ToolCall {
        name: name.to_string(),
        arguments: json!({"RPM": 1200}),
        schema_risk: None,
        requested_simulate: simulate,
        idempotency_key: None,
    }
}

fn roles(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

fn audit_events(path: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| {
            let value: Value = serde_json::from_str(line).unwrap();
            value["event"].as_str().unwrap().to_string()
        })
        .collect()
}

#[tokio::test]
async fn test_deny_by_default_without_verified_policy() {
    let h = harness(sample_policy(), true, true);

    let decision = h
        .kernel
        .evaluate(&call("GetStatus", false), "alice", &roles(&["supervisor"]))
        .await;

    match decision {
        Decision::Denied { code, .. } => assert_eq!(code, DenyCode::PolicyUnverified),
        other => panic!("expected denial, got {other:?}"),
    }
    assert!(h.executor.invocations().is_empty());
    assert_eq!(
        audit_events(&h.audit_path),
        vec!["policy_rejected", "denied"]
    );
}

#[tokio::test]
async fn test_rbac_denies_unbound_role() {
    let h = harness(sample_policy(), false, true);

    let decision = h
        .kernel
        .evaluate(&call("SetSpeed", false), "alice", &roles(&["viewer"]))
        .await;

    match decision {
        Decision::Denied { code, reason, .. } => {
            assert_eq!(code, DenyCode::RoleUnauthorized);
            assert!(reason.contains("SetSpeed"));
        },
        other => panic!("expected denial, got {other:?}"),
    }
    assert!(h.executor.invocations().is_empty());
    assert_eq!(
        audit_events(&h.audit_path),
        vec!["policy_loaded", "proposed", "denied"]
    );
}

#[tokio::test]
async fn test_rbac_wildcard_role_passes() {
    let h = harness(sample_policy(), false, true);

    let decision = h
        .kernel
        .evaluate(&call("SetSpeed", false), "alice", &roles(&["supervisor"]))
        .await;

    assert!(matches!(decision, Decision::Executed { .. }));
}

#[tokio::test]
async fn test_interlock_denies_when_predicate_holds() {
    let h = harness(sample_policy(), false, true);
    h.shadow
        .apply_update("urn:example:submodel:pump", "CurrentTemperature", json!(97.0));

    let decision = h
        .kernel
        .evaluate(&call("StartPump", false), "alice", &roles(&["operator"]))
        .await;

    match decision {
        Decision::Denied { code, reason, .. } => {
            assert_eq!(code, DenyCode::InterlockTriggered);
            assert!(reason.contains("Temperature"));
        },
        other => panic!("expected denial, got {other:?}"),
    }
    assert!(h.executor.invocations().is_empty());
}

#[tokio::test]
async fn test_high_risk_forces_simulation() {
    let h = harness(sample_policy(), false, true);

    let decision = h
        .kernel
        .evaluate(&call("StartPump", false), "alice", &roles(&["operator"]))
        .await;

    match decision {
        Decision::Simulated { result } => {
            assert_eq!(result["simulated"], json!(true));
        },
        other => panic!("expected simulated, got {other:?}"),
    }
    assert_eq!(h.executor.invocations(), vec![("StartPump".to_string(), true)]);
    assert_eq!(
        audit_events(&h.audit_path),
        vec!["policy_loaded", "proposed", "simulated"]
    );
}

#[tokio::test]
async fn test_medium_risk_executes_directly() {
    let h = harness(sample_policy(), false, true);

    let decision = h
        .kernel
        .evaluate(&call("SetSpeed", false), "alice", &roles(&["operator"]))
        .await;

    assert!(matches!(decision, Decision::Executed { .. }));
    assert_eq!(h.executor.invocations(), vec![("SetSpeed".to_string(), false)]);
}

#[tokio::test]
async fn test_critical_parks_for_approval_without_invocation() {
    let h = harness(sample_policy(), false, true);

    let decision = h
        .kernel
        .evaluate(
            &call("EmergencyStop", false),
            "alice",
            &roles(&["maintenance"]),
        )
        .await;

    let task_id = match decision {
        Decision::PendingApproval { task_id } => task_id,
        other => panic!("expected pending approval, got {other:?}"),
    };

    assert!(h.executor.invocations().is_empty());
    assert_eq!(
        audit_events(&h.audit_path),
        vec!["policy_loaded", "proposed", "pending_approval"]
    );

    // A different actor with approval rights resolves the task; exactly
    // one real execution follows, linked to the task.
    let outcome = h
        .kernel
        .approvals()
        .approve(&task_id, "supervisor", &roles(&["supervisor"]))
        .await;

    match outcome {
        crate::approval::ResolutionOutcome::Approved { decision, .. } => {
            assert!(matches!(decision, Decision::Executed { .. }));
        },
        other => panic!("expected approved outcome, got {other:?}"),
    }
    assert_eq!(
        h.executor.invocations(),
        vec![("EmergencyStop".to_string(), false)]
    );
    let events = audit_events(&h.audit_path);
    assert_eq!(
        events,
        vec![
            "policy_loaded",
            "proposed",
            "pending_approval",
            "approved",
            "proposed",
            "executed"
        ]
    );
}

#[tokio::test]
async fn test_requested_simulation_bypasses_approval_gate() {
    let h = harness(sample_policy(), false, true);

    let decision = h
        .kernel
        .evaluate(
            &call("EmergencyStop", true),
            "alice",
            &roles(&["maintenance"]),
        )
        .await;

    assert!(matches!(decision, Decision::Simulated { .. }));
    assert_eq!(
        h.executor.invocations(),
        vec![("EmergencyStop".to_string(), true)]
    );
}

#[tokio::test]
async fn test_self_approval_leaves_task_pending() {
    let h = harness(sample_policy(), false, true);

    let Decision::PendingApproval { task_id } = h
        .kernel
        .evaluate(
            &call("EmergencyStop", false),
            "alice",
            &roles(&["maintenance"]),
        )
        .await
    else {
        panic!("expected pending approval");
    };

    let outcome = h
        .kernel
        .approvals()
        .approve(&task_id, "alice", &roles(&["supervisor"]))
        .await;

    assert!(matches!(
        outcome,
        crate::approval::ResolutionOutcome::Denied {
            code: DenyCode::SelfApproval,
            ..
        }
    ));
    assert!(h.executor.invocations().is_empty());
}

#[tokio::test]
async fn test_unauthorized_approver_refused() {
    let h = harness(sample_policy(), false, true);

    let Decision::PendingApproval { task_id } = h
        .kernel
        .evaluate(
            &call("EmergencyStop", false),
            "alice",
            &roles(&["maintenance"]),
        )
        .await
    else {
        panic!("expected pending approval");
    };

    let outcome = h
        .kernel
        .approvals()
        .approve(&task_id, "bob", &roles(&["operator"]))
        .await;

    assert!(matches!(
        outcome,
        crate::approval::ResolutionOutcome::Denied {
            code: DenyCode::RoleUnauthorized,
            ..
        }
    ));
}

#[tokio::test]
async fn test_execution_failure_audits_exec_failed() {
    let h = harness(sample_policy(), false, true);
    h.executor
        .prime_failure(ExecutionError::Transport("connection reset".to_string()));

    let decision = h
        .kernel
        .evaluate(&call("SetSpeed", false), "alice", &roles(&["operator"]))
        .await;

    match decision {
        Decision::Denied { code, .. } => assert_eq!(code, DenyCode::TransportFailure),
        other => panic!("expected denial, got {other:?}"),
    }
    assert_eq!(
        audit_events(&h.audit_path),
        vec!["policy_loaded", "proposed", "exec_failed"]
    );
}

#[tokio::test]
async fn test_missing_interlock_path_fail_safe_denies() {
    let policy = json!({
        "role_bindings": {"operator": {"allow": ["*"]}},
        "interlocks": [{
            "id": "ghost",
            "deny_when": {
                "submodel": "urn:example:submodel:pump",
                "path": "NoSuchProperty",
                "op": ">",
                "value": 1
            }
        }]
    });
    let h = harness(policy, false, true);

    let decision = h
        .kernel
        .evaluate(&call("GetStatus", false), "alice", &roles(&["operator"]))
        .await;

    match decision {
        Decision::Denied { code, reason, .. } => {
            assert_eq!(code, DenyCode::InterlockTriggered);
            assert!(reason.contains("cannot be evaluated"));
        },
        other => panic!("expected denial, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_interlock_path_fail_open_continues() {
    let policy = json!({
        "role_bindings": {"operator": {"allow": ["*"]}},
        "interlocks": [{
            "id": "ghost",
            "deny_when": {
                "submodel": "urn:example:submodel:pump",
                "path": "NoSuchProperty",
                "op": ">",
                "value": 1
            }
        }]
    });
    let h = harness(policy, false, false);

    let decision = h
        .kernel
        .evaluate(&call("GetStatus", false), "alice", &roles(&["operator"]))
        .await;

    assert!(matches!(decision, Decision::Executed { .. }));
}

#[tokio::test]
async fn test_audit_chain_verifies_after_full_flow() {
    let h = harness(sample_policy(), false, true);

    h.kernel
        .evaluate(&call("SetSpeed", false), "alice", &roles(&["viewer"]))
        .await;
    h.kernel
        .evaluate(&call("StartPump", false), "alice", &roles(&["operator"]))
        .await;

    let verification = AuditLog::verify(&h.audit_path).unwrap();
    assert!(verification.ok);
    assert!(verification.entries >= 3);
}
