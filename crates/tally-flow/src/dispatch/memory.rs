//! In-memory task queue for tests.
//!
//! Tasks are held in FIFO order and handed out with [`InMemoryTaskQueue::take`]
//! or [`InMemoryTaskQueue::drain`]; the test harness plays the role of the
//! delivery loop. Delays are recorded but not honoured.
//!
//! The queue never deduplicates. A harness simulates at-least-once delivery
//! by executing an envelope more than once.

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use ulid::Ulid;

use super::{EnqueueOptions, EnqueueResult, TaskEnvelope, TaskQueue};
use crate::error::{Error, Result};

/// Entry in the in-memory queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Message ID.
    pub message_id: String,
    /// Task envelope.
    pub envelope: TaskEnvelope,
    /// Options used when enqueuing.
    pub options: EnqueueOptions,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<QueueEntry>,
    failures_left: u32,
    enqueued_total: u64,
}

/// In-memory task queue.
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    name: String,
    state: RwLock<QueueState>,
    max_capacity: Option<usize>,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new("default")
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("task queue lock poisoned")
}

impl InMemoryTaskQueue {
    /// Creates a new in-memory task queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(QueueState::default()),
            max_capacity: None,
        }
    }

    /// Creates a queue with a maximum capacity.
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, max_capacity: usize) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(QueueState::default()),
            max_capacity: Some(max_capacity),
        }
    }

    /// Makes the next `count` enqueue calls fail with a dispatch error.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_next(&self, count: u32) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.failures_left = count;
        Ok(())
    }

    /// Takes the next task from the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn take(&self) -> Result<Option<QueueEntry>> {
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(state.queue.pop_front())
    }

    /// Peeks at the next task without removing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn peek(&self) -> Result<Option<QueueEntry>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.queue.front().cloned())
    }

    /// Removes and returns every queued task.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn drain(&self) -> Result<Vec<QueueEntry>> {
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(state.queue.drain(..).collect())
    }

    /// Returns how many tasks were ever accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn enqueued_total(&self) -> Result<u64> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.enqueued_total)
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, envelope: TaskEnvelope, options: EnqueueOptions) -> Result<EnqueueResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(Error::dispatch(format!(
                "queue {} rejected {} task",
                self.name,
                envelope.task.kind()
            )));
        }

        if let Some(max) = self.max_capacity {
            if state.queue.len() >= max {
                return Ok(EnqueueResult::QueueFull);
            }
        }

        let message_id = Ulid::new().to_string();
        state.queue.push_back(QueueEntry {
            message_id: message_id.clone(),
            envelope,
            options,
        });
        state.enqueued_total += 1;
        drop(state);

        Ok(EnqueueResult::Enqueued { message_id })
    }

    async fn queue_depth(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.queue.len())
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}
