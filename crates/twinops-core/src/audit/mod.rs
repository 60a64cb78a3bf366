//! Tamper-evident audit log.
//!
//! Every kernel decision and execution outcome is appended as one line of
//! canonical JSON to an append-only file. Entries are hash-chained:
//! `hash = SHA-256(prev_hash || canonical_json(entry_without_hash))`, with
//! the first entry chaining from 64 hex zeros. Any mutation of a recorded
//! line breaks verification from that sequence number onward.
//!
//! Durability is non-negotiable: every append is fsynced before the call
//! returns. One writer owns the file handle; verifiers open their own
//! read handle.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::canonical::to_canonical_json;

/// Hash of the (nonexistent) entry before the first one.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Errors that can occur during audit log operations.
#[derive(Debug, Error)]
pub enum AuditError {
    /// I/O error on the log file.
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An existing log line could not be parsed while recovering the tip.
    #[error("unparseable audit entry at line {line}")]
    Corrupt {
        /// 1-based line number of the bad entry.
        line: u64,
    },

    /// Entry serialization failed.
    #[error("audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    /// A tool call entered the kernel.
    Proposed,
    /// The kernel denied the call.
    Denied,
    /// The call executed in simulation.
    Simulated,
    /// The call is waiting for human approval.
    PendingApproval,
    /// An approval task was approved.
    Approved,
    /// An approval task was rejected.
    Rejected,
    /// The call executed against the asset.
    Executed,
    /// Execution failed after the kernel allowed it.
    ExecFailed,
    /// A policy was fetched and verified.
    PolicyLoaded,
    /// A policy failed verification.
    PolicyRejected,
}

/// Entry fields supplied by the caller; the log assigns the rest.
#[derive(Debug, Clone, Default)]
pub struct AuditDraft {
    /// Requesting actor.
    pub actor: String,

    /// Requesting roles.
    pub roles: Vec<String>,

    /// Operation name, when the entry concerns one.
    pub tool: Option<String>,

    /// Digest of the canonical arguments. Raw arguments never land in
    /// the log.
    pub args_digest: Option<String>,

    /// Compact rendering of the decision (`deny:role_unauthorized`,
    /// `allow_simulate`, ...).
    pub decision: Option<String>,

    /// Digest of the canonical result, for executed/simulated entries.
    pub result_digest: Option<String>,

    /// Linked approval task, on entries caused by a resolution.
    pub task_id: Option<String>,

    /// Free-form context (interlock warnings, shadow freshness, error
    /// text).
    pub details: Option<Value>,
}

/// A recorded, chained audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotone sequence number, starting at 1.
    pub seq: u64,

    /// Unix epoch milliseconds.
    pub ts: i64,

    /// Requesting actor.
    pub actor: String,

    /// Requesting roles.
    pub roles: Vec<String>,

    /// Event type.
    pub event: AuditEvent,

    #[serde(skip_serializing_if = "Option::is_none")]
    /// Operation name.
    pub tool: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    /// Digest of the canonical arguments.
    pub args_digest: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    /// Compact decision rendering.
    pub decision: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    /// Digest of the canonical result.
    pub result_digest: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    /// Linked approval task.
    pub task_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    /// Free-form context.
    pub details: Option<Value>,

    /// Hash of the previous entry (hex), or [`GENESIS_HASH`].
    pub prev_hash: String,

    /// Hash of this entry (hex).
    pub hash: String,
}

/// Outcome of a chain verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    /// Whether the whole chain verified.
    pub ok: bool,

    /// Sequence number of the first broken entry, when `ok` is false.
    pub first_break_seq: Option<u64>,

    /// Number of entries examined.
    pub entries: u64,
}

struct WriterState {
    file: File,
    prev_hash: String,
    next_seq: u64,
}

/// Append-only, hash-chained audit log.
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<WriterState>,
}

impl AuditLog {
    /// Opens or creates the log at `path`, recovering the chain tip from
    /// any existing entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or an existing
    /// entry cannot be parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (prev_hash, next_seq) = Self::recover_tip(&path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(WriterState {
                file,
                prev_hash,
                next_seq,
            }),
        })
    }

    /// Path of the underlying log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn recover_tip(path: &Path) -> Result<(String, u64), AuditError> {
        if !path.exists() {
            return Ok((GENESIS_HASH.to_string(), 1));
        }

        let reader = BufReader::new(File::open(path)?);
        let mut prev_hash = GENESIS_HASH.to_string();
        let mut next_seq = 1u64;
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry =
                serde_json::from_str(&line).map_err(|_| AuditError::Corrupt {
                    line: idx as u64 + 1,
                })?;
            prev_hash = entry.hash;
            next_seq = entry.seq + 1;
        }
        Ok((prev_hash, next_seq))
    }

    /// Appends one entry, chaining and fsyncing before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be serialized or written.
    pub fn append(&self, draft: AuditDraft, event: AuditEvent) -> Result<AuditEntry, AuditError> {
        let mut writer = self.writer.lock().unwrap();

        let mut entry = AuditEntry {
            seq: writer.next_seq,
            ts: chrono::Utc::now().timestamp_millis(),
            actor: draft.actor,
            roles: draft.roles,
            event,
            tool: draft.tool,
            args_digest: draft.args_digest,
            decision: draft.decision,
            result_digest: draft.result_digest,
            task_id: draft.task_id,
            details: draft.details,
            prev_hash: writer.prev_hash.clone(),
            hash: String::new(),
        };
        entry.hash = entry_hash(&entry)?;

        let value = serde_json::to_value(&entry)?;
        let mut line = to_canonical_json(&value);
        line.push('\n');

        writer.file.write_all(line.as_bytes())?;
        writer.file.sync_all()?;

        writer.prev_hash = entry.hash.clone();
        writer.next_seq += 1;

        debug!(seq = entry.seq, event = ?entry.event, "audit entry appended");
        Ok(entry)
    }

    /// Verifies the chain in the file at `path`.
    ///
    /// Reads sequentially, recomputing each hash and checking the link
    /// to the previous entry; reports the first broken sequence number.
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures; unparseable or mismatched
    /// entries are reported through the returned verification result.
    pub fn verify(path: impl AsRef<Path>) -> Result<ChainVerification, AuditError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(ChainVerification {
                ok: true,
                first_break_seq: None,
                entries: 0,
            });
        }

        let reader = BufReader::new(File::open(path)?);
        let mut prev_hash = GENESIS_HASH.to_string();
        let mut entries = 0u64;

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries += 1;
            let line_no = idx as u64 + 1;

            let Ok(entry) = serde_json::from_str::<AuditEntry>(&line) else {
                return Ok(broken_at(line_no, entries));
            };

            if entry.prev_hash != prev_hash {
                return Ok(broken_at(entry.seq, entries));
            }

            let Ok(expected) = entry_hash(&entry) else {
                return Ok(broken_at(entry.seq, entries));
            };
            if expected != entry.hash {
                return Ok(broken_at(entry.seq, entries));
            }

            prev_hash = entry.hash;
        }

        Ok(ChainVerification {
            ok: true,
            first_break_seq: None,
            entries,
        })
    }
}

fn broken_at(seq: u64, entries: u64) -> ChainVerification {
    ChainVerification {
        ok: false,
        first_break_seq: Some(seq),
        entries,
    }
}

/// `SHA-256(prev_hash || canonical_json(entry_without_hash))`, hex.
fn entry_hash(entry: &AuditEntry) -> Result<String, AuditError> {
    let mut value = serde_json::to_value(entry)?;
    if let Value::Object(ref mut map) = value {
        map.remove("hash");
    }

    let mut hasher = Sha256::new();
    hasher.update(entry.prev_hash.as_bytes());
    hasher.update(to_canonical_json(&value).as_bytes());
    Ok(hex::encode(hasher.finalize()))
}
