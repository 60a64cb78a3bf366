//! # twinops-core
//!
//! Core library for TwinOps - a safety kernel mediating natural-language
//! commands to an industrial digital twin (Asset Administration Shell).
//!
//! This crate provides the decision machinery that sits between a language
//! model and the physical asset: every candidate tool invocation passes
//! through a five-layer pipeline (authorize, interlock, simulation forcing,
//! approval gate, execute) and every decision is recorded in a hash-chained
//! audit log.
//!
//! ## Features
//!
//! - **Safety Kernel**: state-dependent authorization with fail-closed
//!   policy handling
//! - **Signed Policies**: Ed25519-verified policy documents with TTL caching
//! - **Shadow Twin**: in-memory projection of submodel state for interlock
//!   evaluation
//! - **Audit Chain**: append-only, tamper-evident JSON-lines log
//! - **Resilience**: circuit breaker, retry backoff, and idempotency stores
//!   for the twin client
//!
//! ## Example
//!
//! ```rust,no_run
//! use twinops_core::audit::AuditLog;
//! use twinops_core::shadow::ShadowTwin;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let audit = AuditLog::open("/var/lib/twinops/audit.jsonl")?;
//! let shadow = ShadowTwin::new();
//! shadow.apply_update("urn:example:submodel:pump", "CurrentTemperature", 42.0.into());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod approval;
pub mod audit;
pub mod breaker;
pub mod canonical;
pub mod hmac_auth;
pub mod idempotency;
pub mod kernel;
pub mod policy;
pub mod retry;
pub mod shadow;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::approval::{ApprovalStore, ApprovalTask, TaskState};
    pub use crate::audit::{AuditEvent, AuditLog};
    pub use crate::kernel::{Decision, DenyCode, SafetyKernel, ToolCall};
    pub use crate::policy::{PolicyDocument, PolicyStore, RiskLevel};
    pub use crate::shadow::ShadowTwin;
}

pub use kernel::{Decision, SafetyKernel, ToolCall};
pub use policy::{PolicyDocument, RiskLevel};
pub use shadow::ShadowTwin;
