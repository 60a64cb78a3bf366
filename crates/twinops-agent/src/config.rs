//! Agent configuration from `TWINOPS_`-prefixed environment variables.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TWINOPS_";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable did not parse as its expected type.
    #[error("invalid value for {var}: {message}")]
    Invalid {
        /// Variable name (with prefix).
        var: String,
        /// Parse failure description.
        message: String,
    },
}

/// Idempotency backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyBackend {
    /// In-process LRU cache.
    Memory,
    /// Shared `SQLite` file.
    Sqlite,
}

/// Application settings.
///
/// Every field has a default suitable for local development against the
/// sandbox twin; production deployments override via environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL of the AAS repository.
    pub twin_base_url: String,

    /// Base URL of the Submodel repository, when split from the AAS
    /// repository.
    pub submodel_base_url: Option<String>,

    /// AAS the agent manages.
    pub aas_id: String,

    /// Repository id used in MQTT topic scoping.
    pub repo_id: String,

    /// MQTT broker host.
    pub mqtt_broker_host: String,

    /// MQTT broker port.
    pub mqtt_broker_port: u16,

    /// MQTT client identifier.
    pub mqtt_client_id: String,

    /// Optional MQTT credentials.
    pub mqtt_username: Option<String>,

    /// Optional MQTT credentials.
    pub mqtt_password: Option<String>,

    /// Submodel holding the signed policy.
    pub policy_submodel_id: String,

    /// idShort path of the signed-policy element.
    pub policy_element_path: String,

    /// Hex-encoded Ed25519 public key that policies must verify
    /// against.
    pub policy_public_key: Option<String>,

    /// Seconds a verified policy is served from cache.
    pub policy_cache_ttl: Duration,

    /// Hard upper bound on policy age; stale past this denies.
    pub policy_max_age: Option<Duration>,

    /// Deny when an interlock property is missing from the shadow.
    pub interlock_fail_safe: bool,

    /// Path of the audit log file.
    pub audit_log_path: String,

    /// Lifetime of a pending approval task.
    pub approval_ttl: Duration,

    /// Default roles when a request carries none.
    pub default_roles: Vec<String>,

    /// HTTP timeout for twin requests.
    pub http_timeout: Duration,

    /// Extra CA certificate (PEM path) trusted for twin HTTPS.
    pub twin_tls_ca_cert: Option<String>,

    /// Disable TLS verification for the twin client. Not for
    /// production.
    pub twin_tls_insecure: bool,

    /// Circuit breaker: consecutive failures before opening.
    pub twin_client_failure_threshold: u32,

    /// Circuit breaker: open duration before half-open probing.
    pub twin_client_recovery_timeout: Duration,

    /// Circuit breaker: probe budget in half-open.
    pub twin_client_half_open_max_calls: u32,

    /// Max concurrent twin HTTP requests.
    pub twin_client_max_concurrency: usize,

    /// Max concurrent tool executions per request.
    pub tool_concurrency_limit: usize,

    /// Max concurrent selector invocations.
    pub llm_concurrency_limit: usize,

    /// Per-call execution deadline.
    pub tool_execution_timeout: Duration,

    /// Retry attempts for transient twin failures.
    pub tool_retry_max_attempts: u32,

    /// Base delay of the retry backoff.
    pub tool_retry_base_delay: Duration,

    /// Cap of the retry backoff.
    pub tool_retry_max_delay: Duration,

    /// Jitter ratio of the retry backoff.
    pub tool_retry_jitter: f64,

    /// Idempotency entry TTL.
    pub tool_idempotency_ttl: Duration,

    /// Idempotency cache capacity (memory backend).
    pub tool_idempotency_max_entries: usize,

    /// Idempotency backend.
    pub tool_idempotency_storage: IdempotencyBackend,

    /// `SQLite` path for the shared idempotency store.
    pub tool_idempotency_sqlite_path: String,

    /// Delegated-job poll cap.
    pub job_poll_max_interval: Duration,

    /// Delegated-job poll jitter ratio.
    pub job_poll_jitter: f64,

    /// Delegated-job overall deadline.
    pub job_timeout: Duration,

    /// Shared secret for Operation Service HMAC signing.
    pub opservice_hmac_secret: Option<String>,

    /// Max accepted HMAC signature age.
    pub opservice_hmac_ttl: Duration,

    /// Tools surfaced to the selector per request.
    pub capability_top_k: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            twin_base_url: "http://localhost:8081".to_string(),
            submodel_base_url: None,
            aas_id: "urn:example:aas:pump-001".to_string(),
            repo_id: "default".to_string(),
            mqtt_broker_host: "localhost".to_string(),
            mqtt_broker_port: 1883,
            mqtt_client_id: "twinops-agent".to_string(),
            mqtt_username: None,
            mqtt_password: None,
            policy_submodel_id: "urn:example:submodel:policy".to_string(),
            policy_element_path: "SignedPolicy".to_string(),
            policy_public_key: None,
            policy_cache_ttl: Duration::from_secs(300),
            policy_max_age: None,
            interlock_fail_safe: true,
            audit_log_path: "audit_logs/audit.jsonl".to_string(),
            approval_ttl: Duration::from_secs(24 * 60 * 60),
            default_roles: vec!["viewer".to_string()],
            http_timeout: Duration::from_secs(30),
            twin_tls_ca_cert: None,
            twin_tls_insecure: false,
            twin_client_failure_threshold: 5,
            twin_client_recovery_timeout: Duration::from_secs(30),
            twin_client_half_open_max_calls: 3,
            twin_client_max_concurrency: 16,
            tool_concurrency_limit: 4,
            llm_concurrency_limit: 4,
            tool_execution_timeout: Duration::from_secs(60),
            tool_retry_max_attempts: 1,
            tool_retry_base_delay: Duration::from_millis(500),
            tool_retry_max_delay: Duration::from_secs(5),
            tool_retry_jitter: 0.2,
            tool_idempotency_ttl: Duration::from_secs(300),
            tool_idempotency_max_entries: 1000,
            tool_idempotency_storage: IdempotencyBackend::Memory,
            tool_idempotency_sqlite_path: "data/idempotency.sqlite".to_string(),
            job_poll_max_interval: Duration::from_secs(5),
            job_poll_jitter: 0.1,
            job_timeout: Duration::from_secs(300),
            opservice_hmac_secret: None,
            opservice_hmac_ttl: Duration::from_secs(300),
            capability_top_k: 12,
        }
    }
}

impl Settings {
    /// Loads settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error when a set variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut s = Self::default();

        read_string(&mut s.twin_base_url, "TWIN_BASE_URL");
        read_opt_string(&mut s.submodel_base_url, "SUBMODEL_BASE_URL");
        read_string(&mut s.aas_id, "AAS_ID");
        read_string(&mut s.repo_id, "REPO_ID");
        read_string(&mut s.mqtt_broker_host, "MQTT_BROKER_HOST");
        read_parsed(&mut s.mqtt_broker_port, "MQTT_BROKER_PORT")?;
        read_string(&mut s.mqtt_client_id, "MQTT_CLIENT_ID");
        read_opt_string(&mut s.mqtt_username, "MQTT_USERNAME");
        read_opt_string(&mut s.mqtt_password, "MQTT_PASSWORD");
        read_string(&mut s.policy_submodel_id, "POLICY_SUBMODEL_ID");
        read_string(&mut s.policy_element_path, "POLICY_ELEMENT_PATH");
        read_opt_string(&mut s.policy_public_key, "POLICY_PUBLIC_KEY");
        read_secs(&mut s.policy_cache_ttl, "POLICY_CACHE_TTL_SECONDS")?;
        read_opt_secs(&mut s.policy_max_age, "POLICY_MAX_AGE_SECONDS")?;
        read_parsed(&mut s.interlock_fail_safe, "INTERLOCK_FAIL_SAFE")?;
        read_string(&mut s.audit_log_path, "AUDIT_LOG_PATH");
        read_secs(&mut s.approval_ttl, "APPROVAL_TTL_SECONDS")?;
        read_roles(&mut s.default_roles, "DEFAULT_ROLES");
        read_secs(&mut s.http_timeout, "HTTP_TIMEOUT")?;
        read_opt_string(&mut s.twin_tls_ca_cert, "TWIN_TLS_CA_CERT");
        read_parsed(&mut s.twin_tls_insecure, "TWIN_TLS_INSECURE")?;
        read_parsed(
            &mut s.twin_client_failure_threshold,
            "TWIN_CLIENT_FAILURE_THRESHOLD",
        )?;
        read_secs(
            &mut s.twin_client_recovery_timeout,
            "TWIN_CLIENT_RECOVERY_TIMEOUT",
        )?;
        read_parsed(
            &mut s.twin_client_half_open_max_calls,
            "TWIN_CLIENT_HALF_OPEN_MAX_CALLS",
        )?;
        read_parsed(
            &mut s.twin_client_max_concurrency,
            "TWIN_CLIENT_MAX_CONCURRENCY",
        )?;
        read_parsed(&mut s.tool_concurrency_limit, "TOOL_CONCURRENCY_LIMIT")?;
        read_parsed(&mut s.llm_concurrency_limit, "LLM_CONCURRENCY_LIMIT")?;
        read_secs(&mut s.tool_execution_timeout, "TOOL_EXECUTION_TIMEOUT")?;
        read_parsed(&mut s.tool_retry_max_attempts, "TOOL_RETRY_MAX_ATTEMPTS")?;
        read_float_secs(&mut s.tool_retry_base_delay, "TOOL_RETRY_BASE_DELAY")?;
        read_float_secs(&mut s.tool_retry_max_delay, "TOOL_RETRY_MAX_DELAY")?;
        read_parsed(&mut s.tool_retry_jitter, "TOOL_RETRY_JITTER")?;
        read_secs(&mut s.tool_idempotency_ttl, "TOOL_IDEMPOTENCY_TTL_SECONDS")?;
        read_parsed(
            &mut s.tool_idempotency_max_entries,
            "TOOL_IDEMPOTENCY_MAX_ENTRIES",
        )?;
        read_backend(&mut s.tool_idempotency_storage, "TOOL_IDEMPOTENCY_STORAGE")?;
        read_string(
            &mut s.tool_idempotency_sqlite_path,
            "TOOL_IDEMPOTENCY_SQLITE_PATH",
        );
        read_float_secs(&mut s.job_poll_max_interval, "JOB_POLL_MAX_INTERVAL")?;
        read_parsed(&mut s.job_poll_jitter, "JOB_POLL_JITTER")?;
        read_secs(&mut s.job_timeout, "JOB_TIMEOUT")?;
        read_opt_string(&mut s.opservice_hmac_secret, "OPSERVICE_HMAC_SECRET");
        read_secs(&mut s.opservice_hmac_ttl, "OPSERVICE_HMAC_TTL_SECONDS")?;
        read_parsed(&mut s.capability_top_k, "CAPABILITY_TOP_K")?;

        Ok(s)
    }

    /// Effective base URL for submodel requests.
    #[must_use]
    pub fn submodel_base(&self) -> &str {
        self.submodel_base_url
            .as_deref()
            .unwrap_or(&self.twin_base_url)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|v| !v.is_empty())
}

fn read_string(target: &mut String, name: &str) {
    if let Some(value) = env_var(name) {
        *target = value;
    }
}

fn read_opt_string(target: &mut Option<String>, name: &str) {
    if let Some(value) = env_var(name) {
        *target = Some(value);
    }
}

fn read_roles(target: &mut Vec<String>, name: &str) {
    if let Some(value) = env_var(name) {
        *target = split_roles(&value);
    }
}

fn split_roles(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|role| role.trim().to_string())
        .filter(|role| !role.is_empty())
        .collect()
}

fn read_parsed<T: std::str::FromStr>(target: &mut T, name: &str) -> Result<(), ConfigError>
where
    T::Err: std::fmt::Display,
{
    if let Some(value) = env_var(name) {
        *target = value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: format!("{ENV_PREFIX}{name}"),
            message: e.to_string(),
        })?;
    }
    Ok(())
}

fn read_secs(target: &mut Duration, name: &str) -> Result<(), ConfigError> {
    let mut seconds = target.as_secs();
    read_parsed(&mut seconds, name)?;
    *target = Duration::from_secs(seconds);
    Ok(())
}

fn read_float_secs(target: &mut Duration, name: &str) -> Result<(), ConfigError> {
    let mut seconds = target.as_secs_f64();
    read_parsed(&mut seconds, name)?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(ConfigError::Invalid {
            var: format!("{ENV_PREFIX}{name}"),
            message: "must be a non-negative number of seconds".to_string(),
        });
    }
    *target = Duration::from_secs_f64(seconds);
    Ok(())
}

fn read_opt_secs(target: &mut Option<Duration>, name: &str) -> Result<(), ConfigError> {
    if let Some(value) = env_var(name) {
        let seconds: u64 = value.parse().map_err(|e: std::num::ParseIntError| {
            ConfigError::Invalid {
                var: format!("{ENV_PREFIX}{name}"),
                message: e.to_string(),
            }
        })?;
        *target = Some(Duration::from_secs(seconds));
    }
    Ok(())
}

fn read_backend(target: &mut IdempotencyBackend, name: &str) -> Result<(), ConfigError> {
    if let Some(value) = env_var(name) {
        *target = match value.as_str() {
            "memory" => IdempotencyBackend::Memory,
            "sqlite" => IdempotencyBackend::Sqlite,
            other => {
                return Err(ConfigError::Invalid {
                    var: format!("{ENV_PREFIX}{name}"),
                    message: format!("unknown backend '{other}' (memory|sqlite)"),
                });
            },
        };
    }
    Ok(())
}
