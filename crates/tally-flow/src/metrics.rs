//! Metrics for the consolidation protocol.
//!
//! Recorded through the `metrics` facade. The library installs no exporter;
//! a binary wires one up (for example `metrics-exporter-prometheus`).
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tally_task_transitions_total` | Counter | `event`, `outcome` | Per-tenant state machine transitions |
//! | `tally_duplicate_deliveries_total` | Counter | `stage` | Redelivered tasks recognized as duplicates |
//! | `tally_state_conflicts_total` | Counter | - | Run-document write conflicts that were retried |
//! | `tally_tasks_enqueued_total` | Counter | `kind`, `result` | Task enqueue attempts |
//! | `tally_shard_allocations_total` | Counter | `result` | Shard lookups and reallocations |
//! | `tally_task_reports_total` | Counter | `status` | Reports sent to the task reporter |
//! | `tally_task_duration_seconds` | Histogram | `kind`, `result` | Task handling time |

use std::time::Duration;

use metrics::{counter, histogram};

/// Metric names.
pub mod names {
    /// Counter: per-tenant state machine transitions.
    pub const TASK_TRANSITIONS_TOTAL: &str = "tally_task_transitions_total";
    /// Counter: duplicate deliveries by stage.
    pub const DUPLICATE_DELIVERIES_TOTAL: &str = "tally_duplicate_deliveries_total";
    /// Counter: retried run-document write conflicts.
    pub const STATE_CONFLICTS_TOTAL: &str = "tally_state_conflicts_total";
    /// Counter: task enqueue attempts.
    pub const TASKS_ENQUEUED_TOTAL: &str = "tally_tasks_enqueued_total";
    /// Counter: shard allocations.
    pub const SHARD_ALLOCATIONS_TOTAL: &str = "tally_shard_allocations_total";
    /// Counter: task reports.
    pub const TASK_REPORTS_TOTAL: &str = "tally_task_reports_total";
    /// Histogram: task handling duration in seconds.
    pub const TASK_DURATION_SECONDS: &str = "tally_task_duration_seconds";
}

/// Label keys.
pub mod labels {
    /// State machine event (create, start, fail, ...).
    pub const EVENT: &str = "event";
    /// Transition outcome (applied, duplicate, exhausted, already_copied).
    pub const OUTCOME: &str = "outcome";
    /// Protocol stage (append, join, aggregate, ...).
    pub const STAGE: &str = "stage";
    /// Task kind.
    pub const KIND: &str = "kind";
    /// Result (ok, error, current, reallocated).
    pub const RESULT: &str = "result";
    /// Reported status.
    pub const STATUS: &str = "status";
}

/// Records consolidation metrics. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationMetrics {
    _private: (),
}

impl ConsolidationMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a state machine transition.
    pub fn record_task_transition(&self, event: &str, outcome: &str) {
        counter!(
            names::TASK_TRANSITIONS_TOTAL,
            labels::EVENT => event.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records a duplicate delivery detected at `stage`.
    pub fn record_duplicate(&self, stage: &str) {
        counter!(
            names::DUPLICATE_DELIVERIES_TOTAL,
            labels::STAGE => stage.to_string(),
        )
        .increment(1);
    }

    /// Records a run-document write conflict.
    pub fn record_state_conflict(&self) {
        counter!(names::STATE_CONFLICTS_TOTAL).increment(1);
    }

    /// Records an enqueue attempt.
    pub fn record_enqueue(&self, kind: &str, result: &str) {
        counter!(
            names::TASKS_ENQUEUED_TOTAL,
            labels::KIND => kind.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a shard lookup (`current`) or reallocation (`reallocated`).
    pub fn record_shard_allocation(&self, result: &str) {
        counter!(
            names::SHARD_ALLOCATIONS_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a task report.
    pub fn record_report(&self, status: &str) {
        counter!(
            names::TASK_REPORTS_TOTAL,
            labels::STATUS => status.to_string(),
        )
        .increment(1);
    }

    /// Records how long a task took to handle.
    pub fn observe_task_duration(&self, kind: &str, result: &str, duration: Duration) {
        histogram!(
            names::TASK_DURATION_SECONDS,
            labels::KIND => kind.to_string(),
            labels::RESULT => result.to_string(),
        )
        .record(duration.as_secs_f64());
    }
}
