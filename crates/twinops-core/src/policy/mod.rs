//! Signed safety policies ("CovenantTwin").
//!
//! The policy document carried by the twin governs every kernel decision:
//! role bindings, state interlocks, and the risk thresholds that force
//! simulation or human approval. Policies are only trusted when their
//! detached Ed25519 signature verifies against the public key supplied at
//! startup; an unverifiable or stale policy fails closed and the kernel
//! denies by default.
//!
//! # Security Properties
//!
//! - **Deny-by-default**: no verified policy means no execution
//! - **Fail-closed**: a verification failure discards the cached policy
//! - **Deterministic**: signatures cover the canonical JSON of the payload

mod schema;
mod signing;
mod store;

pub use schema::{
    CmpOp, Interlock, InterlockPredicate, PolicyDocument, RiskLevel, RoleBinding,
};
pub use signing::{
    ed25519_verifier, PolicySigningError, SignatureVerifier, SignedPolicy, SIGNATURE_SIZE,
};
pub use store::{PolicyError, PolicyFetcher, PolicyStore};
