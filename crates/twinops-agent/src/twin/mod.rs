//! HTTP client for the AAS repository and the Operation Service.
//!
//! All twin traffic funnels through here: submodel element reads and
//! writes, direct operation invocation, and delegated jobs with
//! submit-then-poll. Every invocation is wrapped with the resilience
//! stack - per-endpoint circuit breaker, bounded concurrency, transient
//! retries with jittered backoff, a per-call deadline, and the
//! idempotency cache that collapses duplicate invocations.

pub mod mqtt;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::SecretString;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use twinops_core::breaker::{BreakerConfig, BreakerError, CircuitBreaker};
use twinops_core::hmac_auth;
use twinops_core::idempotency::{fingerprint, IdempotencyStore};
use twinops_core::kernel::{ExecutionError, ToolCall, ToolExecutor};
use twinops_core::policy::SignedPolicy;
use twinops_core::retry::BackoffConfig;
use twinops_core::shadow::topics::encode_id;

use crate::catalog::{ToolCatalog, ToolSpec};
use crate::config::Settings;

/// Argument keys that never reach the twin.
const CONTROL_KEYS: &[&str] = &["simulate", "safety_reasoning"];

/// Job states that end polling.
const TERMINAL_JOB_STATES: &[&str] = &["COMPLETED", "FAILED", "CANCELLED"];

/// Twin client configuration distilled from [`Settings`].
#[derive(Debug, Clone)]
pub struct TwinClientConfig {
    /// AAS repository base URL.
    pub aas_base: String,

    /// Submodel repository base URL.
    pub submodel_base: String,

    /// HTTP timeout per request.
    pub http_timeout: Duration,

    /// Per-call execution deadline.
    pub execution_timeout: Duration,

    /// Transient-failure retry attempts.
    pub retry_max_attempts: u32,

    /// Retry backoff.
    pub retry_backoff: BackoffConfig,

    /// Delegated-job polling backoff.
    pub poll_backoff: BackoffConfig,

    /// Delegated-job overall deadline.
    pub job_timeout: Duration,

    /// Breaker tuning.
    pub breaker: BreakerConfig,

    /// Max concurrent requests.
    pub max_concurrency: usize,

    /// Operation Service HMAC secret, when signing is enabled.
    pub hmac_secret: Option<SecretString>,

    /// Extra trusted CA certificate (PEM path) for twin HTTPS.
    pub tls_ca_cert: Option<String>,

    /// Disable TLS verification. Not for production.
    pub tls_insecure: bool,
}

impl TwinClientConfig {
    /// Builds the client configuration from settings.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            aas_base: settings.twin_base_url.trim_end_matches('/').to_string(),
            submodel_base: settings.submodel_base().trim_end_matches('/').to_string(),
            http_timeout: settings.http_timeout,
            execution_timeout: settings.tool_execution_timeout,
            retry_max_attempts: settings.tool_retry_max_attempts,
            retry_backoff: BackoffConfig {
                base_delay: settings.tool_retry_base_delay,
                max_delay: settings.tool_retry_max_delay,
                multiplier: 2.0,
                jitter: settings.tool_retry_jitter,
            },
            poll_backoff: BackoffConfig::for_polling(
                settings.job_poll_max_interval,
                settings.job_poll_jitter,
            ),
            job_timeout: settings.job_timeout,
            breaker: BreakerConfig {
                failure_threshold: settings.twin_client_failure_threshold,
                recovery_timeout: settings.twin_client_recovery_timeout,
                half_open_max_calls: settings.twin_client_half_open_max_calls,
            },
            max_concurrency: settings.twin_client_max_concurrency,
            hmac_secret: settings
                .opservice_hmac_secret
                .clone()
                .map(SecretString::new),
            tls_ca_cert: settings.twin_tls_ca_cert.clone(),
            tls_insecure: settings.twin_tls_insecure,
        }
    }
}

/// HTTP client for twin operations.
pub struct TwinClient {
    http: reqwest::Client,
    config: TwinClientConfig,
    idempotency: Arc<dyn IdempotencyStore>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    semaphore: Semaphore,
}

impl TwinClient {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        config: TwinClientConfig,
        idempotency: Arc<dyn IdempotencyStore>,
    ) -> Result<Self, ExecutionError> {
        let mut builder = reqwest::Client::builder().timeout(config.http_timeout);
        if let Some(ca_path) = &config.tls_ca_cert {
            let pem = std::fs::read(ca_path)
                .map_err(|e| ExecutionError::Transport(format!("CA cert {ca_path}: {e}")))?;
            let certificate = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ExecutionError::Transport(format!("CA cert {ca_path}: {e}")))?;
            builder = builder.add_root_certificate(certificate);
        }
        if config.tls_insecure {
            warn!("TLS verification disabled for twin client");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;

        let max_concurrency = config.max_concurrency.max(1);
        Ok(Self {
            http,
            config,
            idempotency,
            breakers: Mutex::new(HashMap::new()),
            semaphore: Semaphore::new(max_concurrency),
        })
    }

    fn breaker_for(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("breaker map lock");
        Arc::clone(breakers.entry(endpoint.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(endpoint, self.config.breaker.clone()))
        }))
    }

    fn element_value_url(&self, submodel_id: &str, path: &str) -> String {
        format!(
            "{}/submodels/{}/submodel-elements/{path}/$value",
            self.config.submodel_base,
            encode_id(submodel_id),
        )
    }

    /// Reads a submodel element value.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the repository is unreachable and
    /// a failure when the element does not exist.
    pub async fn read_element_value(
        &self,
        submodel_id: &str,
        path: &str,
    ) -> Result<Value, ExecutionError> {
        let url = self.element_value_url(submodel_id, path);
        self.guarded_json(&self.config.submodel_base.clone(), || {
            self.http.get(&url).send()
        })
        .await
    }

    /// Writes a submodel element value.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the repository is unreachable.
    pub async fn write_element_value(
        &self,
        submodel_id: &str,
        path: &str,
        value: &Value,
    ) -> Result<(), ExecutionError> {
        let url = self.element_value_url(submodel_id, path);
        self.guarded_json(&self.config.submodel_base.clone(), || {
            self.http.put(&url).json(value).send()
        })
        .await
        .map(|_| ())
    }

    /// Fetches a full submodel and flattens its element values to
    /// `path -> value`, for shadow seeding.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the repository is unreachable.
    pub async fn snapshot_submodel(
        &self,
        submodel_id: &str,
    ) -> Result<HashMap<String, Value>, ExecutionError> {
        let url = format!(
            "{}/submodels/{}",
            self.config.submodel_base,
            encode_id(submodel_id)
        );
        let submodel = self
            .guarded_json(&self.config.submodel_base.clone(), || {
                self.http.get(&url).send()
            })
            .await?;

        let mut values = HashMap::new();
        if let Some(elements) = submodel.get("submodelElements").and_then(Value::as_array) {
            flatten_elements(elements, "", &mut values);
        }
        Ok(values)
    }

    /// Seeds a full shadow snapshot for the given submodels. Submodels
    /// that fail to fetch are skipped with a warning so one broken
    /// reference does not block startup.
    pub async fn snapshot(
        &self,
        submodel_ids: &[String],
    ) -> HashMap<String, HashMap<String, Value>> {
        let mut snapshot = HashMap::new();
        for submodel_id in submodel_ids {
            match self.snapshot_submodel(submodel_id).await {
                Ok(values) => {
                    snapshot.insert(submodel_id.clone(), values);
                },
                Err(err) => {
                    warn!(submodel = %submodel_id, error = %err, "snapshot fetch failed");
                },
            }
        }
        snapshot
    }

    /// Lists the submodel ids referenced by a shell.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the repository is unreachable.
    pub async fn list_submodel_refs(&self, aas_id: &str) -> Result<Vec<String>, ExecutionError> {
        let url = format!("{}/shells/{}/submodel-refs", self.config.aas_base, encode_id(aas_id));
        let refs = self
            .guarded_json(&self.config.aas_base.clone(), || self.http.get(&url).send())
            .await?;

        // Paged repositories wrap the list in `result`.
        let items = refs
            .get("result")
            .and_then(Value::as_array)
            .or_else(|| refs.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(items
            .iter()
            .filter_map(|reference| {
                reference
                    .get("keys")
                    .and_then(Value::as_array)
                    .and_then(|keys| keys.first())
                    .and_then(|key| key.get("value"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect())
    }

    /// Discovers invocable operations across submodels and builds their
    /// tool specs. Risk and delegation annotations come from element
    /// qualifiers (`RiskLevel`, `DelegationUrl`).
    pub async fn discover_tools(&self, submodel_ids: &[String]) -> Vec<ToolSpec> {
        let mut tools = Vec::new();
        for submodel_id in submodel_ids {
            let url = format!(
                "{}/submodels/{}",
                self.config.submodel_base,
                encode_id(submodel_id)
            );
            let submodel = match self
                .guarded_json(&self.config.submodel_base.clone(), || {
                    self.http.get(&url).send()
                })
                .await
            {
                Ok(submodel) => submodel,
                Err(err) => {
                    warn!(submodel = %submodel_id, error = %err, "tool discovery fetch failed");
                    continue;
                },
            };

            if let Some(elements) = submodel.get("submodelElements").and_then(Value::as_array) {
                collect_operations(elements, submodel_id, "", &mut tools);
            }
        }
        debug!(count = tools.len(), "tool discovery complete");
        tools
    }

    /// Reads the signed policy envelope from its submodel element.
    ///
    /// # Errors
    ///
    /// Returns an error string suitable for the policy store's fetcher
    /// seam.
    pub async fn fetch_signed_policy(
        &self,
        submodel_id: &str,
        element_path: &str,
    ) -> Result<SignedPolicy, String> {
        let value = self
            .read_element_value(submodel_id, element_path)
            .await
            .map_err(|e| e.to_string())?;

        // Repositories store the envelope either as a JSON object or as
        // a JSON string property.
        let envelope = match &value {
            Value::String(text) => {
                serde_json::from_str(text).map_err(|e| format!("policy element: {e}"))?
            },
            other => other.clone(),
        };
        SignedPolicy::from_element_value(&envelope).map_err(|e| e.to_string())
    }

    /// Invokes an operation, honoring idempotency, the circuit breaker,
    /// retries, and the per-call deadline.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`ExecutionError`] after resilience layers
    /// are exhausted.
    pub async fn invoke(
        &self,
        spec: &ToolSpec,
        call: &ToolCall,
        simulate: bool,
    ) -> Result<Value, ExecutionError> {
        let key = call.idempotency_key.clone().unwrap_or_default();
        let print = fingerprint(&call.name, &call.arguments, simulate, &key);

        if let Ok(Some(record)) = self.idempotency.get(&print).await {
            debug!(tool = %call.name, "idempotency hit");
            return replay(record);
        }

        let outcome = tokio::time::timeout(
            self.config.execution_timeout,
            self.invoke_once(spec, call, simulate),
        )
        .await
        .unwrap_or(Err(ExecutionError::Timeout(self.config.execution_timeout)));

        // Terminal results (success or definite failure) are recorded;
        // transient conditions are not, so a retry after circuit
        // recovery can still reach the twin.
        match &outcome {
            Ok(result) => {
                let record = json!({"ok": true, "value": result});
                if let Err(err) = self.idempotency.put(&print, record).await {
                    warn!(error = %err, "idempotency record failed");
                }
            },
            Err(ExecutionError::Failed(message)) => {
                let record = json!({"ok": false, "error": message});
                if let Err(err) = self.idempotency.put(&print, record).await {
                    warn!(error = %err, "idempotency record failed");
                }
            },
            Err(_) => {},
        }

        outcome
    }

    async fn invoke_once(
        &self,
        spec: &ToolSpec,
        call: &ToolCall,
        simulate: bool,
    ) -> Result<Value, ExecutionError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ExecutionError::Cancelled)?;

        let input_arguments = build_input_arguments(&call.arguments);

        match &spec.delegation_url {
            Some(delegation_url) => {
                self.invoke_delegated(delegation_url, input_arguments, simulate)
                    .await
            },
            None => {
                self.invoke_direct(spec, input_arguments, simulate).await
            },
        }
    }

    async fn invoke_direct(
        &self,
        spec: &ToolSpec,
        input_arguments: Vec<Value>,
        simulate: bool,
    ) -> Result<Value, ExecutionError> {
        let url = format!(
            "{}/submodels/{}/submodel-elements/{}/$invoke",
            self.config.submodel_base,
            encode_id(&spec.submodel_id),
            spec.operation_path,
        );
        let body = json!({
            "inputArguments": input_arguments,
            "clientContext": {"simulate": simulate},
        });

        self.guarded_json(&self.config.submodel_base.clone(), || {
            self.http.post(&url).json(&body).send()
        })
        .await
    }

    async fn invoke_delegated(
        &self,
        delegation_url: &str,
        input_arguments: Vec<Value>,
        simulate: bool,
    ) -> Result<Value, ExecutionError> {
        let endpoint = endpoint_of(delegation_url);
        let body = json!({
            "inputArguments": input_arguments,
            "clientContext": {"simulate": simulate},
        });
        let body_bytes = body.to_string();

        let submitted = self
            .guarded_json(&endpoint, || {
                let mut request = self
                    .http
                    .post(delegation_url)
                    .header("Content-Type", "application/json")
                    .body(body_bytes.clone());
                if let Some(secret) = &self.config.hmac_secret {
                    let ts = chrono::Utc::now().timestamp().to_string();
                    let path = url_path(delegation_url);
                    let signature =
                        hmac_auth::sign(secret, &ts, "POST", &path, body_bytes.as_bytes());
                    request = request
                        .header(hmac_auth::SIGNATURE_HEADER, signature)
                        .header(hmac_auth::TIMESTAMP_HEADER, ts);
                }
                request.send()
            })
            .await?;

        let Some(job_id) = submitted
            .get("job_id")
            .or_else(|| submitted.get("jobId"))
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            // No job reference means the service answered synchronously.
            return Ok(submitted);
        };

        self.poll_job(&endpoint, &job_id).await
    }

    async fn poll_job(
        &self,
        endpoint: &str,
        job_id: &str,
    ) -> Result<Value, ExecutionError> {
        // Jobs hang off the service origin regardless of which
        // operation endpoint created them.
        let url = format!("{endpoint}/jobs/{job_id}");

        let deadline = tokio::time::Instant::now() + self.config.job_timeout;
        let mut attempt: u32 = 1;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(ExecutionError::Timeout(self.config.job_timeout));
            }

            match self
                .guarded_json(endpoint, || {
                    let mut request = self.http.get(&url);
                    if let Some(secret) = &self.config.hmac_secret {
                        let ts = chrono::Utc::now().timestamp().to_string();
                        let path = url_path(&url);
                        let signature = hmac_auth::sign(secret, &ts, "GET", &path, b"");
                        request = request
                            .header(hmac_auth::SIGNATURE_HEADER, signature)
                            .header(hmac_auth::TIMESTAMP_HEADER, ts);
                    }
                    request.send()
                })
                .await
            {
                Ok(job) => {
                    let status = job.get("status").and_then(Value::as_str).unwrap_or("");
                    if TERMINAL_JOB_STATES.contains(&status) {
                        if status == "COMPLETED" {
                            return Ok(job);
                        }
                        return Err(ExecutionError::Failed(format!(
                            "job {job_id} ended {status}"
                        )));
                    }
                },
                Err(ExecutionError::CircuitOpen(reason)) => {
                    return Err(ExecutionError::CircuitOpen(reason));
                },
                Err(err) => {
                    // Transient poll errors just stretch the polling
                    // loop until the deadline.
                    debug!(job = job_id, error = %err, "job poll failed");
                },
            }

            tokio::time::sleep(self.config.poll_backoff.jittered_delay(attempt)).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Sends a request through the breaker with transient retries and
    /// returns the parsed JSON body.
    async fn guarded_json<F, Fut>(
        &self,
        endpoint: &str,
        send: F,
    ) -> Result<Value, ExecutionError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let breaker = self.breaker_for(endpoint);
        let mut attempt: u32 = 1;

        loop {
            match breaker.acquire() {
                Ok(()) => {},
                Err(BreakerError::CircuitOpen { .. } | BreakerError::ProbeLimit { .. }) => {
                    return Err(ExecutionError::CircuitOpen(endpoint.to_string()));
                },
            }

            let attempt_result = match send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        match response.json::<Value>().await {
                            Ok(value) => Ok(value),
                            Err(e) => Err((true, ExecutionError::Transport(e.to_string()))),
                        }
                    } else if status.is_server_error() {
                        Err((
                            true,
                            ExecutionError::Transport(format!("{endpoint}: HTTP {status}")),
                        ))
                    } else {
                        let text = response.text().await.unwrap_or_default();
                        Err((
                            false,
                            ExecutionError::Failed(format!("HTTP {status}: {text}")),
                        ))
                    }
                },
                Err(e) => Err((true, ExecutionError::Transport(e.to_string()))),
            };

            match attempt_result {
                Ok(value) => {
                    breaker.record_success();
                    return Ok(value);
                },
                Err((retryable, err)) => {
                    if retryable {
                        breaker.record_failure();
                    } else {
                        // A definite 4xx is the twin answering, not the
                        // endpoint failing.
                        breaker.record_success();
                    }

                    if !retryable || attempt >= self.config.retry_max_attempts {
                        return Err(err);
                    }
                    let delay = self.config.retry_backoff.jittered_delay(attempt);
                    debug!(endpoint, attempt, ?delay, error = %err, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
            }
        }
    }
}

/// Replays a recorded idempotency entry.
fn replay(record: Value) -> Result<Value, ExecutionError> {
    if record.get("ok").and_then(Value::as_bool) == Some(true) {
        Ok(record.get("value").cloned().unwrap_or(Value::Null))
    } else {
        let message = record
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("recorded failure")
            .to_string();
        Err(ExecutionError::Failed(message))
    }
}

/// Builds AAS `inputArguments` from a JSON argument object, dropping
/// control keys.
fn build_input_arguments(arguments: &Value) -> Vec<Value> {
    let Value::Object(map) = arguments else {
        return Vec::new();
    };
    map.iter()
        .filter(|(key, _)| !CONTROL_KEYS.contains(&key.as_str()))
        .map(|(key, value)| json!({"idShort": key, "value": value}))
        .collect()
}

/// Recursively flattens submodel elements to `path -> value`.
fn flatten_elements(elements: &[Value], prefix: &str, out: &mut HashMap<String, Value>) {
    for element in elements {
        let Some(id_short) = element.get("idShort").and_then(Value::as_str) else {
            continue;
        };
        let path = if prefix.is_empty() {
            id_short.to_string()
        } else {
            format!("{prefix}/{id_short}")
        };

        let model_type = element.get("modelType").and_then(Value::as_str).unwrap_or("");
        match (model_type, element.get("value")) {
            ("SubmodelElementCollection", Some(Value::Array(nested))) => {
                flatten_elements(nested, &path, out);
            },
            ("Operation", _) => {},
            (_, Some(value)) => {
                out.insert(path, value.clone());
            },
            _ => {},
        }
    }
}

/// Recursively collects Operation elements as tool specs.
fn collect_operations(
    elements: &[Value],
    submodel_id: &str,
    prefix: &str,
    out: &mut Vec<ToolSpec>,
) {
    for element in elements {
        let Some(id_short) = element.get("idShort").and_then(Value::as_str) else {
            continue;
        };
        let path = if prefix.is_empty() {
            id_short.to_string()
        } else {
            format!("{prefix}/{id_short}")
        };

        match element.get("modelType").and_then(Value::as_str) {
            Some("Operation") => {
                let description = element
                    .get("description")
                    .and_then(Value::as_array)
                    .and_then(|texts| texts.first())
                    .and_then(|text| text.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or(id_short)
                    .to_string();

                let risk_hint = qualifier(element, "RiskLevel")
                    .and_then(|level| serde_json::from_value(json!(level)).ok());
                let delegation_url = qualifier(element, "DelegationUrl");

                out.push(ToolSpec {
                    name: id_short.to_string(),
                    description,
                    submodel_id: submodel_id.to_string(),
                    operation_path: path,
                    delegation_url,
                    risk_hint,
                    parameters: operation_parameters(element),
                });
            },
            Some("SubmodelElementCollection") => {
                if let Some(Value::Array(nested)) = element.get("value") {
                    collect_operations(nested, submodel_id, &path, out);
                }
            },
            _ => {},
        }
    }
}

/// Reads a qualifier value by type.
fn qualifier(element: &Value, qualifier_type: &str) -> Option<String> {
    element
        .get("qualifiers")
        .and_then(Value::as_array)?
        .iter()
        .find(|qualifier| {
            qualifier.get("type").and_then(Value::as_str) == Some(qualifier_type)
        })?
        .get("value")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Derives a JSON schema for the operation's input variables.
fn operation_parameters(element: &Value) -> Value {
    let mut properties = Map::new();
    if let Some(inputs) = element.get("inputVariables").and_then(Value::as_array) {
        for input in inputs {
            if let Some(name) = input
                .get("value")
                .and_then(|v| v.get("idShort"))
                .and_then(Value::as_str)
            {
                properties.insert(name.to_string(), json!({"type": "string"}));
            }
        }
    }
    json!({"type": "object", "properties": properties})
}

fn endpoint_of(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => {
            let mut endpoint = format!(
                "{}://{}",
                parsed.scheme(),
                parsed.host_str().unwrap_or_default()
            );
            if let Some(port) = parsed.port() {
                endpoint.push_str(&format!(":{port}"));
            }
            endpoint
        },
        Err(_) => url.to_string(),
    }
}

fn url_path(url: &str) -> String {
    reqwest::Url::parse(url)
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

/// Resolves kernel tool calls to catalog specs and drives the client.
pub struct CatalogExecutor {
    client: Arc<TwinClient>,
    catalog: Arc<ToolCatalog>,
}

impl CatalogExecutor {
    /// Builds the executor seam the kernel invokes through.
    #[must_use]
    pub fn new(client: Arc<TwinClient>, catalog: Arc<ToolCatalog>) -> Self {
        Self { client, catalog }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for CatalogExecutor {
    async fn invoke(&self, call: &ToolCall, simulate: bool) -> Result<Value, ExecutionError> {
        let Some(spec) = self.catalog.get(&call.name) else {
            return Err(ExecutionError::Failed(format!(
                "unknown tool: {}",
                call.name
            )));
        };
        self.client.invoke(spec, call, simulate).await
    }
}

/// Strips control keys from raw selector arguments and pulls out the
/// simulate flag.
#[must_use]
pub fn split_arguments(raw: &Value) -> (Value, bool) {
    let simulate = raw
        .get("simulate")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let cleaned = match raw {
        Value::Object(map) => {
            let kept: Map<String, Value> = map
                .iter()
                .filter(|(key, _)| !CONTROL_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Value::Object(kept)
        },
        other => other.clone(),
    };

    (cleaned, simulate)
}
