//! Wire-facing error codes and the agent error envelope.
//!
//! Callers branch on `error.code`, so the codes here are stable strings;
//! messages are for humans.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use twinops_core::kernel::DenyCode;

/// Stable error codes surfaced in reply envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Request body was not valid JSON.
    InvalidJson,
    /// A required field was absent.
    MissingField,
    /// The named entity does not exist.
    NotFound,
    /// The caller is not authenticated.
    Unauthorized,
    /// The caller is authenticated but not permitted.
    Forbidden,
    /// The operation failed downstream.
    OperationFailed,
    /// No verified policy is available.
    PolicyUnverified,
    /// The circuit to the twin is open.
    CircuitOpen,
    /// A safety interlock blocked the operation.
    InterlockTriggered,
}

/// The `{error: {code, message, details}}` envelope returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Error body.
    pub error: ErrorBody,
}

/// Error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable code.
    pub code: ErrorCode,

    /// Human-readable message.
    pub message: String,

    /// Optional structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorEnvelope {
    /// Builds an envelope.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code,
                message: message.into(),
                details: None,
            },
        }
    }

    /// Attaches structured details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.error.details = Some(details);
        self
    }
}

/// Maps a kernel denial code onto the wire code callers branch on.
#[must_use]
pub fn wire_code(code: DenyCode) -> ErrorCode {
    match code {
        DenyCode::PolicyUnverified | DenyCode::PolicyStale => ErrorCode::PolicyUnverified,
        DenyCode::RoleUnauthorized | DenyCode::SelfApproval => ErrorCode::Forbidden,
        DenyCode::InterlockTriggered => ErrorCode::InterlockTriggered,
        DenyCode::CircuitOpen => ErrorCode::CircuitOpen,
        DenyCode::ExecutionTimeout
        | DenyCode::ExecutionFailed
        | DenyCode::TransportFailure => ErrorCode::OperationFailed,
        DenyCode::MalformedInput => ErrorCode::InvalidJson,
    }
}
