//! Sliding-window failure counting per node.
//!
//! A node whose recent failure density crosses the threshold is suspended
//! and excluded from dispatch until explicitly cleared. This catches a
//! machine that keeps accepting work and failing it (bad driver, full disk)
//! before it burns through every chunk's retry budget.

use std::collections::HashMap;
use std::sync::Mutex;

/// Failures within the window before a node is suspended.
pub const SUSPEND_THRESHOLD: u32 = 5;

/// Window over which failures accumulate.
pub const SUSPEND_WINDOW_MS: i64 = 300_000;

#[derive(Debug, Clone, Default)]
pub struct FailureRecord {
    pub failure_count: u32,
    pub first_failure_ms: i64,
    pub last_failure_ms: i64,
    pub suspended: bool,
}

#[derive(Debug, Default)]
pub struct FailureTracker {
    records: Mutex<HashMap<String, FailureRecord>>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure. Returns true when this report pushed the node
    /// into suspension.
    pub fn record_failure(&self, node_id: &str, now_ms: i64) -> bool {
        let mut records = self.lock();
        let record = records.entry(node_id.to_string()).or_default();

        // Stale window: restart the count from this failure.
        if record.first_failure_ms > 0 && now_ms - record.first_failure_ms > SUSPEND_WINDOW_MS {
            record.failure_count = 0;
            record.first_failure_ms = now_ms;
        }
        if record.failure_count == 0 {
            record.first_failure_ms = now_ms;
        }

        record.failure_count += 1;
        record.last_failure_ms = now_ms;

        let newly_suspended = !record.suspended && record.failure_count >= SUSPEND_THRESHOLD;
        if newly_suspended {
            record.suspended = true;
        }
        newly_suspended
    }

    pub fn is_suspended(&self, node_id: &str) -> bool {
        self.lock()
            .get(node_id)
            .map(|r| r.suspended)
            .unwrap_or(false)
    }

    pub fn clear(&self, node_id: &str) {
        self.lock().remove(node_id);
    }

    pub fn clear_all(&self) {
        self.lock().clear();
    }

    pub fn suspended(&self) -> Vec<(String, FailureRecord)> {
        self.lock()
            .iter()
            .filter(|(_, r)| r.suspended)
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, FailureRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
