//! twinops-agent - orchestration and I/O edges for the TwinOps safety
//! kernel.
//!
//! The agent turns a framed chat request (`{message, actor, roles}`)
//! into tool invocations: the tool selector proposes calls, every call
//! passes through the safety kernel in `twinops-core`, and the twin
//! client performs the invocations that survive it. MQTT keeps the
//! shadow twin live; the audit log records everything.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod twin;

pub use catalog::{ToolCatalog, ToolSpec};
pub use config::Settings;
pub use orchestrator::{ChatReply, ChatRequest, Orchestrator};
pub use twin::TwinClient;
