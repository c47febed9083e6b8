//! Per-tenant task lifecycle.
//!
//! ```text
//!   NotStarted ──Create──► Created ──Start──► Running ──Complete──► Processed
//!       ▲                    │  │                │ ▲
//!       └─────Rollback───────┘  │               Fail│Start
//!                               │                ▼ │
//!                               └───Start───► Failed ──Fail (tries exhausted)──► Processed
//! ```
//!
//! Transitions are pure: [`decide`] maps `(record, event)` to a [`Decision`]
//! without touching storage. The lifecycle layer runs them inside a state
//! store transaction, so two concurrent callers can never act on the same
//! stale record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of one tenant's task within a run.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Enumerated but no task has been dispatched.
    #[default]
    NotStarted,
    /// An append task has been enqueued.
    Created,
    /// An append task is executing.
    Running,
    /// The last attempt failed and a redelivery is expected.
    Failed,
    /// Terminal: the tenant's rows are in a shard, or it gave up.
    Processed,
}

impl TaskState {
    /// Returns true for the terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed)
    }

    /// Returns the state name as used in logs and metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Created => "created",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Processed => "processed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// One tenant's task record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantTask {
    /// Current state.
    pub state: TaskState,
    /// Failures recorded so far.
    #[serde(default)]
    pub retry_count: u32,
    /// True once the tenant's rows are durably in a shard.
    #[serde(default)]
    pub data_copied: bool,
    /// The most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the record last changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// An event applied to a tenant's task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// An append task is about to be enqueued.
    Create,
    /// An append task started executing.
    Start,
    /// The append attempt failed.
    Fail {
        /// Failure description.
        error: String,
    },
    /// The rows were appended to a shard.
    Complete,
    /// The enqueue failed; forget the attempt.
    Rollback,
    /// The task could not be enqueued at all; give up on the tenant.
    Abandon {
        /// Failure description.
        error: String,
    },
}

impl TaskEvent {
    /// Returns the event name as used in logs and metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Fail { .. } => "fail",
            Self::Complete => "complete",
            Self::Rollback => "rollback",
            Self::Abandon { .. } => "abandon",
        }
    }
}

/// Outcome of applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The transition was applied.
    Applied,
    /// The event is a redundant delivery; nothing changed.
    Duplicate,
    /// A failure exhausted the tenant's tries; it is now terminal.
    Exhausted,
    /// `Complete` on a record that is already terminal; nothing changed.
    AlreadyCopied,
}

impl Outcome {
    /// Returns true if the record was mutated.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        matches!(self, Self::Applied | Self::Exhausted)
    }

    /// Returns the outcome name as used in logs and metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::Exhausted => "exhausted",
            Self::AlreadyCopied => "already_copied",
        }
    }
}

/// What a transition does to the record and to the run counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// The outcome.
    pub outcome: Outcome,
    /// The new record, when the outcome writes.
    pub next: Option<TenantTask>,
    /// True if the tenant becomes terminal in this transition.
    pub terminal: bool,
}

impl Decision {
    fn unchanged(outcome: Outcome) -> Self {
        Self {
            outcome,
            next: None,
            terminal: false,
        }
    }

    fn write(outcome: Outcome, next: TenantTask, terminal: bool) -> Self {
        Self {
            outcome,
            next: Some(next),
            terminal,
        }
    }
}

/// Decides the effect of `event` on `current`.
///
/// `max_tries` is the number of failures after which a tenant is force-marked
/// [`TaskState::Processed`]. A value of 0 is treated as 1.
#[must_use]
pub fn decide(current: &TenantTask, event: &TaskEvent, max_tries: u32) -> Decision {
    use TaskState::{Created, Failed, NotStarted, Processed, Running};

    let max_tries = max_tries.max(1);
    let mut next = TenantTask {
        updated_at: Some(Utc::now()),
        ..current.clone()
    };

    match (event, current.state) {
        (TaskEvent::Create, NotStarted) => {
            next.state = Created;
            Decision::write(Outcome::Applied, next, false)
        }
        (TaskEvent::Create, _) => Decision::unchanged(Outcome::Duplicate),

        (TaskEvent::Start, NotStarted | Created | Failed) => {
            next.state = Running;
            Decision::write(Outcome::Applied, next, false)
        }
        (TaskEvent::Start, Running | Processed) => Decision::unchanged(Outcome::Duplicate),

        (TaskEvent::Fail { .. }, Processed) => Decision::unchanged(Outcome::Duplicate),
        (TaskEvent::Fail { error }, _) => {
            next.retry_count = current.retry_count.saturating_add(1);
            next.last_error = Some(error.clone());
            if next.retry_count >= max_tries {
                next.state = Processed;
                Decision::write(Outcome::Exhausted, next, true)
            } else {
                next.state = Failed;
                Decision::write(Outcome::Applied, next, false)
            }
        }

        (TaskEvent::Complete, Processed) => Decision::unchanged(Outcome::AlreadyCopied),
        (TaskEvent::Complete, _) => {
            next.state = Processed;
            next.data_copied = true;
            Decision::write(Outcome::Applied, next, true)
        }

        (TaskEvent::Rollback, Created) => {
            next.state = NotStarted;
            Decision::write(Outcome::Applied, next, false)
        }
        (TaskEvent::Rollback, _) => Decision::unchanged(Outcome::Duplicate),

        (TaskEvent::Abandon { error }, NotStarted | Created) => {
            next.state = Processed;
            next.last_error = Some(error.clone());
            Decision::write(Outcome::Exhausted, next, true)
        }
        (TaskEvent::Abandon { .. }, _) => Decision::unchanged(Outcome::Duplicate),
    }
}
