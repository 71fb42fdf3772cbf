use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::Serialize;

// ---------------------------------------------------------------------------
// RuntimeCounters
// ---------------------------------------------------------------------------

/// Process-wide named counters.
///
/// Thread-safe via interior mutability: an `RwLock` guards registration of
/// new counter names, the values themselves are atomics. Counter names are
/// free-form; the foreman services use the constants below so the status
/// endpoint reads a stable vocabulary.
#[derive(Debug, Default)]
pub struct RuntimeCounters {
    counters: RwLock<BTreeMap<String, AtomicU64>>,
}

/// Counter names used across the workspace.
pub mod names {
    pub const EVENTS_APPENDED: &str = "events_appended";
    pub const EVENT_LINES_CORRUPT: &str = "event_lines_corrupt";
    pub const EVENT_FILES_ARCHIVED: &str = "event_files_archived";
    pub const JOBS_CREATED: &str = "jobs_created";
    pub const JOBS_PULLED: &str = "jobs_pulled";
    pub const JOBS_PUSHED: &str = "jobs_pushed";
    pub const LEASES_REAPED: &str = "leases_reaped";
    pub const DUPLICATE_PUSHES: &str = "duplicate_pushes";
    pub const BACKEND_CALLS: &str = "backend_calls";
    pub const BACKEND_TIMEOUTS: &str = "backend_timeouts";
    pub const REWRITES: &str = "rewrites";
    pub const ESCALATIONS: &str = "escalations";
    pub const DEGRADED_PARSES: &str = "degraded_parses";
}

impl RuntimeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment `name` by one, registering it on first use.
    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    /// Add `delta` to `name`, registering it on first use.
    pub fn add(&self, name: &str, delta: u64) {
        {
            let counters = self.counters.read().expect("counters lock poisoned");
            if let Some(counter) = counters.get(name) {
                counter.fetch_add(delta, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write().expect("counters lock poisoned");
        counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value of `name`, zero if never incremented.
    pub fn get(&self, name: &str) -> u64 {
        let counters = self.counters.read().expect("counters lock poisoned");
        counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Snapshot every counter for the status endpoint.
    pub fn snapshot(&self) -> CountersSnapshot {
        let counters = self.counters.read().expect("counters lock poisoned");
        CountersSnapshot {
            counters: counters
                .iter()
                .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub counters: BTreeMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
