//! End-to-end scenarios against an in-process stub AAS repository.
//!
//! Each test wires the full component graph (audit log, policy store,
//! shadow, twin client, kernel, orchestrator) the way the binary does,
//! with HTTP served by a small axum stub standing in for the repository.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{json, Value};
use tempfile::TempDir;
use twinops_core::approval::ApprovalStore;
use twinops_core::audit::AuditLog;
use twinops_core::canonical::to_canonical_json;
use twinops_core::idempotency::MemoryIdempotencyStore;
use twinops_core::kernel::{SafetyKernel, ToolExecutor};
use twinops_core::policy::{ed25519_verifier, PolicyStore, SignedPolicy};
use twinops_core::shadow::{topics, ShadowTwin};

use twinops_agent::catalog::{ToolCatalog, ToolSpec};
use twinops_agent::config::Settings;
use twinops_agent::llm::rules::RulesSelector;
use twinops_agent::llm::ToolSelector;
use twinops_agent::orchestrator::{ChatRequest, Orchestrator};
use twinops_agent::twin::{CatalogExecutor, TwinClient, TwinClientConfig};

const PUMP_SM: &str = "urn:example:submodel:pump";
const POLICY_SM: &str = "urn:example:submodel:policy";

/// Mutable state of the stub repository.
struct StubState {
    /// `(submodel, path) -> value`.
    elements: Mutex<HashMap<(String, String), Value>>,

    /// Recorded invocations `(operation, simulate)`.
    invocations: Mutex<Vec<(String, bool)>>,
}

impl StubState {
    fn set_element(&self, submodel: &str, path: &str, value: Value) {
        self.elements
            .lock()
            .unwrap()
            .insert((submodel.to_string(), path.to_string()), value);
    }

    fn invocations(&self) -> Vec<(String, bool)> {
        self.invocations.lock().unwrap().clone()
    }

    fn element(&self, submodel: &str, path: &str) -> Option<Value> {
        self.elements
            .lock()
            .unwrap()
            .get(&(submodel.to_string(), path.to_string()))
            .cloned()
    }
}

async fn element_route(
    State(stub): State<Arc<StubState>>,
    Path((sm_encoded, rest)): Path<(String, String)>,
) -> impl IntoResponse {
    let submodel = topics::decode_id(&sm_encoded);

    if let Some(path) = rest.strip_suffix("/$value") {
        return match stub.element(&submodel, path) {
            Some(value) => (StatusCode::OK, Json(value)).into_response(),
            None => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": {"code": "not_found", "message": path}})),
            )
                .into_response(),
        };
    }

    StatusCode::NOT_FOUND.into_response()
}

async fn invoke_route(
    State(stub): State<Arc<StubState>>,
    Path((sm_encoded, rest)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let submodel = topics::decode_id(&sm_encoded);
    let Some(operation) = rest.strip_suffix("/$invoke") else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let simulate = body
        .pointer("/clientContext/simulate")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    stub.invocations
        .lock()
        .unwrap()
        .push((operation.to_string(), simulate));

    if !simulate && operation == "EmergencyStop" {
        stub.set_element(&submodel, "PumpState", json!("Emergency Stop"));
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "COMPLETED",
            "operation": operation,
            "simulated": simulate,
            "outputArguments": [],
        })),
    )
        .into_response()
}

async fn submodel_route(
    State(stub): State<Arc<StubState>>,
    Path(sm_encoded): Path<String>,
) -> impl IntoResponse {
    let submodel = topics::decode_id(&sm_encoded);
    let elements: Vec<Value> = stub
        .elements
        .lock()
        .unwrap()
        .iter()
        .filter(|((sm, _), _)| *sm == submodel)
        .map(|((_, path), value)| {
            json!({"idShort": path, "modelType": "Property", "value": value})
        })
        .collect();

    Json(json!({"id": submodel, "submodelElements": elements}))
}

async fn submodel_refs_route(State(_stub): State<Arc<StubState>>) -> impl IntoResponse {
    Json(json!({
        "result": [
            {"keys": [{"type": "Submodel", "value": PUMP_SM}]},
            {"keys": [{"type": "Submodel", "value": POLICY_SM}]},
        ]
    }))
}

async fn spawn_stub(stub: Arc<StubState>) -> SocketAddr {
    let app = Router::new()
        .route("/shells/:aas/submodel-refs", get(submodel_refs_route))
        .route("/submodels/:sm", get(submodel_route))
        .route(
            "/submodels/:sm/submodel-elements/*rest",
            get(element_route).post(invoke_route),
        )
        .with_state(stub);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
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
        "approver_roles": ["maintenance", "supervisor"],
        "interlocks": [
            {
                "id": "temp-high",
                "deny_when": {
                    "submodel": PUMP_SM,
                    "path": "CurrentTemperature",
                    "op": ">",
                    "value": 95
                },
                "message": "Temperature too high to operate"
            }
        ],
        "operation_risk": {
            "SetSpeed": "MEDIUM",
            "StartPump": "HIGH",
            "StopPump": "MEDIUM",
            "EmergencyStop": "CRITICAL",
            "GetStatus": "LOW"
        }
    })
}

fn tool(name: &str, description: &str) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        submodel_id: PUMP_SM.to_string(),
        operation_path: name.to_string(),
        delegation_url: None,
        risk_hint: None,
        parameters: json!({"type": "object"}),
    }
}

struct Scenario {
    orchestrator: Arc<Orchestrator>,
    stub: Arc<StubState>,
    audit_path: std::path::PathBuf,
    _dir: TempDir,
}

async fn scenario() -> Scenario {
    scenario_with(sample_policy(), 42.0).await
}

async fn scenario_with(policy_payload: Value, temperature: f64) -> Scenario {
    let stub = Arc::new(StubState {
        elements: Mutex::new(HashMap::new()),
        invocations: Mutex::new(Vec::new()),
    });
    stub.set_element(PUMP_SM, "CurrentTemperature", json!(temperature));
    stub.set_element(PUMP_SM, "PumpState", json!("Stopped"));

    // Sign the policy and publish it as the CovenantTwin element.
    let key = SigningKey::generate(&mut rand::thread_rng());
    let message = to_canonical_json(&policy_payload);
    let signature = key.sign(message.as_bytes());
    let envelope = SignedPolicy {
        payload: policy_payload,
        signature_b64: base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()),
        key_id: "covenant-1".to_string(),
    };
    stub.set_element(
        POLICY_SM,
        "SignedPolicy",
        serde_json::to_value(&envelope).unwrap(),
    );

    let addr = spawn_stub(Arc::clone(&stub)).await;
    let settings = Settings {
        twin_base_url: format!("http://{addr}"),
        tool_retry_max_attempts: 1,
        ..Settings::default()
    };

    let dir = TempDir::new().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let audit = Arc::new(AuditLog::open(&audit_path).unwrap());

    let idempotency = Arc::new(MemoryIdempotencyStore::new(Duration::from_secs(300), 100));
    let client = Arc::new(
        TwinClient::new(TwinClientConfig::from_settings(&settings), idempotency).unwrap(),
    );

    let policy = {
        let client = Arc::clone(&client);
        let fetcher = move || {
            let client = Arc::clone(&client);
            async move {
                client
                    .fetch_signed_policy(POLICY_SM, "SignedPolicy")
                    .await
            }
        };
        Arc::new(PolicyStore::new(
            Box::new(fetcher),
            ed25519_verifier(),
            key.verifying_key(),
            Duration::from_secs(300),
            None,
        ))
    };

    let shadow = Arc::new(ShadowTwin::new());
    let snapshot = client
        .snapshot(&[PUMP_SM.to_string(), POLICY_SM.to_string()])
        .await;
    shadow.apply_snapshot(snapshot);

    let catalog = Arc::new(ToolCatalog::new(vec![
        tool("SetSpeed", "Set the pump speed in RPM"),
        tool("StartPump", "Start the pump"),
        tool("StopPump", "Stop the pump"),
        tool("EmergencyStop", "Emergency stop the pump"),
        tool("GetStatus", "Read the current status report"),
    ]));

    let approvals = Arc::new(ApprovalStore::new(Duration::from_secs(3600)));
    let executor: Arc<dyn ToolExecutor> =
        Arc::new(CatalogExecutor::new(Arc::clone(&client), Arc::clone(&catalog)));
    let kernel = SafetyKernel::new(
        policy,
        shadow,
        executor,
        Arc::clone(&audit),
        approvals,
        true,
    );

    let selector: Arc<dyn ToolSelector> = Arc::new(RulesSelector::new());
    let orchestrator = Arc::new(Orchestrator::new(
        selector,
        catalog,
        kernel,
        audit,
        12,
        4,
        4,
    ));

    Scenario {
        orchestrator,
        stub,
        audit_path,
        _dir: dir,
    }
}

fn chat(message: &str, roles: &[&str]) -> ChatRequest {
    ChatRequest {
        message: message.to_string(),
        actor: "alice".to_string(),
        roles: roles.iter().map(|r| (*r).to_string()).collect(),
        simulate: None,
        idempotency_key: None,
    }
}

fn audit_entries(path: &std::path::Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn events_of(entries: &[Value], event: &str) -> usize {
    entries
        .iter()
        .filter(|entry| entry["event"] == event)
        .count()
}

// S1: a viewer asking for a speed change is denied by RBAC.
#[tokio::test]
async fn s1_rbac_deny() {
    let s = scenario().await;

    let reply = s
        .orchestrator
        .process(&chat("Set speed to 1200 RPM", &["viewer"]))
        .await;

    assert!(!reply.pending_approval);
    assert!(reply.task_id.is_none());
    assert_eq!(reply.tool_results.len(), 1);
    let result = &reply.tool_results[0];
    assert_eq!(result.tool, "SetSpeed");
    assert!(!result.success);
    assert_eq!(result.status, "denied");
    assert_eq!(result.error.as_deref(), Some("role_unauthorized"));

    assert!(s.stub.invocations().is_empty());
    let entries = audit_entries(&s.audit_path);
    assert_eq!(events_of(&entries, "denied"), 1);
}

// S2: HIGH risk forces a simulated run; the asset is never touched for
// real.
#[tokio::test]
async fn s2_high_risk_forces_simulation() {
    let s = scenario().await;

    let reply = s
        .orchestrator
        .process(&chat("Start the pump", &["operator"]))
        .await;

    assert_eq!(reply.tool_results.len(), 1);
    let result = &reply.tool_results[0];
    assert_eq!(result.tool, "StartPump");
    assert!(result.success);
    assert!(result.simulated);
    assert_eq!(result.status, "simulated_only");

    assert_eq!(
        s.stub.invocations(),
        vec![("StartPump".to_string(), true)],
        "only a simulated invocation may reach the twin"
    );
    let entries = audit_entries(&s.audit_path);
    assert_eq!(events_of(&entries, "simulated"), 1);
    assert_eq!(events_of(&entries, "executed"), 0);
}

// S3: CRITICAL requires approval; approval by another actor executes
// exactly once and flips the pump state.
#[tokio::test]
async fn s3_critical_requires_approval() {
    let s = scenario().await;

    let reply = s
        .orchestrator
        .process(&chat("Emergency stop", &["maintenance"]))
        .await;

    assert!(reply.pending_approval);
    let task_id = reply.task_id.clone().expect("task id");
    assert!(s.stub.invocations().is_empty(), "no AAS call before approval");
    let entries = audit_entries(&s.audit_path);
    assert_eq!(events_of(&entries, "pending_approval"), 1);

    let resolution = s
        .orchestrator
        .approve(&task_id, "supervisor", &["maintenance".to_string()])
        .await;

    assert_eq!(resolution.status, "approved");
    let tool_result = resolution.tool_result.expect("resubmitted result");
    assert_eq!(tool_result.status, "completed");

    assert_eq!(
        s.stub.invocations(),
        vec![("EmergencyStop".to_string(), false)]
    );
    assert_eq!(
        s.stub.element(PUMP_SM, "PumpState"),
        Some(json!("Emergency Stop"))
    );
    let entries = audit_entries(&s.audit_path);
    assert_eq!(events_of(&entries, "executed"), 1);
    assert_eq!(events_of(&entries, "approved"), 1);
    // The executed entry is linked to the approval task.
    let executed = entries
        .iter()
        .find(|entry| entry["event"] == "executed")
        .unwrap();
    assert_eq!(executed["task_id"], json!(task_id));
}

// S4: a hot temperature trips the interlock before any invocation.
#[tokio::test]
async fn s4_interlock_denies() {
    let s = scenario_with(sample_policy(), 97.0).await;

    let reply = s
        .orchestrator
        .process(&chat("Start the pump", &["operator"]))
        .await;

    let result = &reply.tool_results[0];
    assert!(!result.success);
    assert_eq!(result.status, "denied");
    assert_eq!(result.error.as_deref(), Some("interlock_triggered"));
    assert_eq!(
        result.details.as_ref().and_then(|d| d.get("interlock_id")),
        Some(&json!("temp-high"))
    );

    assert!(s.stub.invocations().is_empty());
    let entries = audit_entries(&s.audit_path);
    assert_eq!(events_of(&entries, "denied"), 1);
}

// S5: flipping one character of a recorded entry breaks verification at
// exactly that sequence number.
#[tokio::test]
async fn s5_tamper_detection() {
    let s = scenario().await;

    s.orchestrator
        .process(&chat("Start the pump", &["operator"]))
        .await;

    let entries = audit_entries(&s.audit_path);
    let simulated_seq = entries
        .iter()
        .find(|entry| entry["event"] == "simulated")
        .and_then(|entry| entry["seq"].as_u64())
        .expect("simulated entry");

    let content = std::fs::read_to_string(&s.audit_path).unwrap();
    let tampered: String = content
        .lines()
        .map(|line| {
            let entry: Value = serde_json::from_str(line).unwrap();
            if entry["seq"].as_u64() == Some(simulated_seq) {
                line.replacen("StartPump", "StartPumq", 1)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n";
    std::fs::write(&s.audit_path, tampered).unwrap();

    let verification = AuditLog::verify(&s.audit_path).unwrap();
    assert!(!verification.ok);
    assert_eq!(verification.first_break_seq, Some(simulated_seq));
}

// S6: the same idempotency key collapses duplicate invocations; both
// replies carry the same result.
#[tokio::test]
async fn s6_idempotency() {
    let s = scenario().await;

    let mut request = chat("Get status", &["operator"]);
    request.idempotency_key = Some("abc".to_string());

    let first = s.orchestrator.process(&request).await;
    let second = s.orchestrator.process(&request).await;

    assert_eq!(
        s.stub.invocations().len(),
        1,
        "second call must replay the recorded result"
    );
    assert_eq!(
        first.tool_results[0].result, second.tool_results[0].result,
        "replayed result must match"
    );
    assert!(first.tool_results[0].success && second.tool_results[0].success);
}

// Circuit breaker: once the twin is unreachable past the threshold,
// calls fail fast with circuit_open.
#[tokio::test]
async fn circuit_opens_after_repeated_transport_failures() {
    // A client pointed at a dead endpoint with a tight breaker.
    let dead_settings = Settings {
        twin_base_url: "http://127.0.0.1:1".to_string(),
        twin_client_failure_threshold: 2,
        tool_retry_max_attempts: 1,
        http_timeout: Duration::from_millis(200),
        ..Settings::default()
    };
    let idempotency = Arc::new(MemoryIdempotencyStore::new(Duration::from_secs(1), 10));
    let client =
        TwinClient::new(TwinClientConfig::from_settings(&dead_settings), idempotency).unwrap();

    let spec = tool("GetStatus", "Read the current status report");
    let call = twinops_core::kernel::ToolCall {
        name: "GetStatus".to_string(),
        arguments: json!({}),
        schema_risk: None,
        requested_simulate: false,
        idempotency_key: None,
    };

    // Two transport failures open the circuit.
    for _ in 0..2 {
        let err = client.invoke(&spec, &call, false).await.unwrap_err();
        assert!(matches!(
            err,
            twinops_core::kernel::ExecutionError::Transport(_)
        ));
    }

    let started = std::time::Instant::now();
    let err = client.invoke(&spec, &call, false).await.unwrap_err();
    assert!(matches!(
        err,
        twinops_core::kernel::ExecutionError::CircuitOpen(_)
    ));
    assert!(
        started.elapsed() < Duration::from_millis(100),
        "open circuit must fail fast"
    );
}
