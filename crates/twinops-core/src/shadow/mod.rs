//! Shadow Twin - local projection of submodel state.
//!
//! The shadow holds the last known value of every submodel element the
//! agent has seen, seeded by an HTTP snapshot at startup and kept live by
//! MQTT deliveries. Interlock evaluation reads from here instead of the
//! repository so a kernel decision never blocks on the network.
//!
//! Writes are stamped with a process-local monotonic counter. Interlock
//! evaluation takes a read view that holds the reader lock for the
//! duration of one decision, so all paths consulted by that decision
//! observe the same state.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

pub mod topics;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

/// Where a shadow entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// Seeded by an HTTP snapshot.
    Snapshot,

    /// Delivered over MQTT.
    Mqtt,
}

/// A single tracked submodel element value.
#[derive(Debug, Clone)]
pub struct ShadowValue {
    /// Last known value.
    pub value: Value,

    /// Process-local monotonic write stamp.
    pub last_updated: u64,

    /// Origin of the value.
    pub source: ValueSource,

    /// Broker-assigned timestamp, when the delivery carried one.
    pub broker_ts: Option<i64>,
}

#[derive(Default)]
struct ShadowState {
    submodels: HashMap<String, HashMap<String, ShadowValue>>,
    last_refresh: Option<Instant>,
}

/// In-memory projection of submodel values.
///
/// Entries are created by snapshot or MQTT delivery and never deleted;
/// a reconnect reseeds the whole map atomically.
pub struct ShadowTwin {
    state: RwLock<ShadowState>,
    clock: AtomicU64,
}

impl Default for ShadowTwin {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowTwin {
    /// Creates an empty shadow.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ShadowState::default()),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Replaces the full state from an HTTP snapshot.
    ///
    /// All entries are swapped in atomically and stamped, so a reader
    /// never observes a half-applied snapshot.
    pub fn apply_snapshot(&self, snapshot: HashMap<String, HashMap<String, Value>>) {
        let mut fresh: HashMap<String, HashMap<String, ShadowValue>> = HashMap::new();
        for (submodel, paths) in snapshot {
            let entries = fresh.entry(submodel).or_default();
            for (path, value) in paths {
                entries.insert(
                    path,
                    ShadowValue {
                        value,
                        last_updated: self.tick(),
                        source: ValueSource::Snapshot,
                        broker_ts: None,
                    },
                );
            }
        }

        let mut state = self.state.write().unwrap();
        state.submodels = fresh;
        state.last_refresh = Some(Instant::now());
        debug!(submodels = state.submodels.len(), "shadow snapshot applied");
    }

    /// Applies a single MQTT update without a broker timestamp.
    pub fn apply_update(&self, submodel: &str, path: &str, value: Value) {
        self.apply_timestamped_update(submodel, path, value, None);
    }

    /// Applies a single MQTT update.
    ///
    /// When the delivery carries a broker timestamp and the stored entry
    /// has a newer one, the update is dropped as out of order.
    pub fn apply_timestamped_update(
        &self,
        submodel: &str,
        path: &str,
        value: Value,
        broker_ts: Option<i64>,
    ) {
        let mut state = self.state.write().unwrap();
        let entries = state.submodels.entry(submodel.to_string()).or_default();

        if let (Some(incoming), Some(existing)) = (
            broker_ts,
            entries.get(path).and_then(|entry| entry.broker_ts),
        ) {
            if incoming < existing {
                debug!(
                    submodel,
                    path, incoming, existing, "dropping out-of-order shadow update"
                );
                return;
            }
        }

        entries.insert(
            path.to_string(),
            ShadowValue {
                value,
                last_updated: self.tick(),
                source: ValueSource::Mqtt,
                broker_ts,
            },
        );
        state.last_refresh = Some(Instant::now());
    }

    /// Reads a single value.
    #[must_use]
    pub fn get(&self, submodel: &str, path: &str) -> Option<ShadowValue> {
        let state = self.state.read().unwrap();
        state.submodels.get(submodel)?.get(path).cloned()
    }

    /// Takes a consistent read view for the duration of one decision.
    ///
    /// Updates block until the view is dropped, so every path an
    /// interlock pass reads comes from the same state.
    #[must_use]
    pub fn read_view(&self) -> ShadowView<'_> {
        ShadowView {
            guard: self.state.read().unwrap(),
        }
    }

    /// Time since the last snapshot or update, if any.
    #[must_use]
    pub fn freshness(&self) -> Option<Duration> {
        let state = self.state.read().unwrap();
        state.last_refresh.map(|at| at.elapsed())
    }

    /// Number of tracked submodels.
    #[must_use]
    pub fn submodel_count(&self) -> usize {
        self.state.read().unwrap().submodels.len()
    }
}

/// A read-locked view over the shadow state.
pub struct ShadowView<'a> {
    guard: RwLockReadGuard<'a, ShadowState>,
}

impl ShadowView<'_> {
    /// Reads a value from the locked view.
    #[must_use]
    pub fn get(&self, submodel: &str, path: &str) -> Option<&Value> {
        self.guard
            .submodels
            .get(submodel)?
            .get(path)
            .map(|entry| &entry.value)
    }
}
