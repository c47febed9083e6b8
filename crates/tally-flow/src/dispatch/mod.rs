//! Task dispatch abstraction.
//!
//! This module provides:
//!
//! - [`ConsolidationTask`]: the four task kinds of the protocol
//! - [`TaskEnvelope`]: serializable payload delivered to a worker
//! - [`TaskQueue`]: trait for enqueueing envelopes with an optional delay
//! - [`memory::InMemoryTaskQueue`]: in-memory queue for tests
//!
//! Queues deliver at least once. Nothing here deduplicates; the run document
//! fences duplicate deliveries.

pub mod memory;

#[cfg(feature = "gcp")]
pub mod cloud_tasks;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{TaskId, TenantId};

use crate::error::Result;
use crate::run::{ConsolidationScope, RunKey};

/// A unit of consolidation work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsolidationTask {
    /// Copy one tenant's billing rows into the run's current shard.
    Append {
        /// Run the append belongs to.
        run_key: RunKey,
        /// Tenant to copy.
        tenant: TenantId,
        /// Partitions to copy.
        scope: ConsolidationScope,
    },
    /// Prepare the destination and enqueue one join per pending shard.
    DispatchJoins {
        /// Run whose shards to join.
        run_key: RunKey,
    },
    /// Merge one shard into the final table.
    Join {
        /// Run the shard belongs to.
        run_key: RunKey,
        /// Shard index.
        shard: u32,
    },
    /// Rebuild the aggregated table from the final table.
    Aggregate {
        /// Run that finished.
        run_key: RunKey,
    },
}

impl ConsolidationTask {
    /// Returns the run the task belongs to.
    #[must_use]
    pub const fn run_key(&self) -> &RunKey {
        match self {
            Self::Append { run_key, .. }
            | Self::DispatchJoins { run_key }
            | Self::Join { run_key, .. }
            | Self::Aggregate { run_key } => run_key,
        }
    }

    /// Returns the task kind label, also used as the delivery path suffix.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Append { .. } => "append",
            Self::DispatchJoins { .. } => "joins",
            Self::Join { .. } => "join",
            Self::Aggregate { .. } => "aggregate",
        }
    }
}

/// Envelope for a task to be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    /// Unique task identifier.
    pub task_id: TaskId,
    /// The work to do.
    pub task: ConsolidationTask,
    /// When the task was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// Wraps a task in a fresh envelope.
    #[must_use]
    pub fn new(task: ConsolidationTask) -> Self {
        Self {
            task_id: TaskId::generate(),
            task,
            enqueued_at: Utc::now(),
        }
    }
}

/// Result of enqueuing a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Task was enqueued successfully.
    Enqueued {
        /// Queue-specific message ID.
        message_id: String,
    },
    /// Queue is at capacity.
    QueueFull,
}

impl EnqueueResult {
    /// Returns true if the task was successfully enqueued.
    #[must_use]
    pub const fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }

    /// Returns the message ID if enqueued.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Enqueued { message_id } => Some(message_id),
            Self::QueueFull => None,
        }
    }
}

/// Options for task enqueueing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Delay before the task becomes visible to workers.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delay before task becomes visible.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Task queue abstraction.
///
/// A queue delivers each envelope at least once, after the optional delay,
/// and redelivers it when the handler fails.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueues a task for execution.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Dispatch`] if the queue rejected the request.
    async fn enqueue(&self, envelope: TaskEnvelope, options: EnqueueOptions) -> Result<EnqueueResult>;

    /// Returns the approximate number of tasks in the queue.
    async fn queue_depth(&self) -> Result<usize>;

    /// Returns the queue's name or identifier.
    fn queue_name(&self) -> &str;
}
