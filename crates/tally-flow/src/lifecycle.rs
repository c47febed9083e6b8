//! Transactional per-tenant transitions.
//!
//! [`TaskStateMachine`] runs the pure transitions of [`crate::task`] inside a
//! state store transaction and applies their effect on the run counters in
//! the same write. The caller gets back the post-transaction counters, so the
//! fan-in decision never depends on a separate read.

use tally_core::TenantId;

use crate::error::{Error, Result};
use crate::metrics::ConsolidationMetrics;
use crate::run::{Counters, RunDocument, RunKey};
use crate::store::{Rmw, StateStore};
use crate::task::{Outcome, TaskEvent, TenantTask, decide};

/// Result of a transactional transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// What happened.
    pub outcome: Outcome,
    /// The tenant's record after the transaction.
    pub record: TenantTask,
    /// Run counters after the transaction.
    pub counters: Counters,
    /// True only for the single transaction that opened the fan-in gate.
    pub opened_fan_in: bool,
}

/// The per-tenant lifecycle over a [`StateStore`].
#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    store: StateStore,
    max_tries: u32,
    metrics: ConsolidationMetrics,
}

impl TaskStateMachine {
    /// Creates a state machine with the given failure ceiling.
    #[must_use]
    pub fn new(store: StateStore, max_tries: u32) -> Self {
        Self {
            store,
            max_tries,
            metrics: ConsolidationMetrics::new(),
        }
    }

    /// Marks a tenant's append task as enqueued. Duplicate if any attempt exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the run or tenant is unknown, or on store failure.
    pub async fn begin_created(&self, key: &RunKey, tenant: &TenantId) -> Result<Transition> {
        self.apply(key, tenant, TaskEvent::Create).await
    }

    /// Marks a tenant's append task as running. Duplicate if running or processed.
    ///
    /// # Errors
    ///
    /// Returns an error if the run or tenant is unknown, or on store failure.
    pub async fn begin_running(&self, key: &RunKey, tenant: &TenantId) -> Result<Transition> {
        self.apply(key, tenant, TaskEvent::Start).await
    }

    /// Records a failed attempt; exhausts the tenant at the failure ceiling.
    ///
    /// # Errors
    ///
    /// Returns an error if the run or tenant is unknown, or on store failure.
    pub async fn fail(
        &self,
        key: &RunKey,
        tenant: &TenantId,
        error: impl Into<String>,
    ) -> Result<Transition> {
        self.apply(
            key,
            tenant,
            TaskEvent::Fail {
                error: error.into(),
            },
        )
        .await
    }

    /// Records that the tenant's rows are in a shard.
    ///
    /// A second call reports [`Outcome::AlreadyCopied`] and leaves the
    /// counters alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the run or tenant is unknown, or on store failure.
    pub async fn complete(&self, key: &RunKey, tenant: &TenantId) -> Result<Transition> {
        self.apply(key, tenant, TaskEvent::Complete).await
    }

    /// Forgets an attempt whose task could not be enqueued.
    ///
    /// # Errors
    ///
    /// Returns an error if the run or tenant is unknown, or on store failure.
    pub async fn rollback(&self, key: &RunKey, tenant: &TenantId) -> Result<Transition> {
        self.apply(key, tenant, TaskEvent::Rollback).await
    }

    /// Gives up on a tenant that could not be dispatched.
    ///
    /// # Errors
    ///
    /// Returns an error if the run or tenant is unknown, or on store failure.
    pub async fn abandon(
        &self,
        key: &RunKey,
        tenant: &TenantId,
        error: impl Into<String>,
    ) -> Result<Transition> {
        self.apply(
            key,
            tenant,
            TaskEvent::Abandon {
                error: error.into(),
            },
        )
        .await
    }

    async fn apply(&self, key: &RunKey, tenant: &TenantId, event: TaskEvent) -> Result<Transition> {
        let max_tries = self.max_tries;
        let writes = |doc: &RunDocument| {
            doc.task(tenant)
                .is_some_and(|task| decide(task, &event, max_tries).next.is_some())
        };

        let result = self
            .store
            .read_modify_write(key, writes, |doc| {
                let current = doc.tasks.get(tenant).cloned().unwrap_or_default();
                let decision = decide(&current, &event, max_tries);
                let mut opened_fan_in = false;
                if let Some(next) = decision.next {
                    doc.tasks.insert(tenant.clone(), next);
                }
                if decision.terminal {
                    doc.still_running = doc.still_running.saturating_sub(1);
                    doc.processed = doc.processed.saturating_add(1);
                    if doc.still_running == 0 && !doc.fan_in_opened {
                        doc.fan_in_opened = true;
                        opened_fan_in = true;
                    }
                }
                (decision.outcome, opened_fan_in)
            })
            .await?;

        let transition = match result {
            Rmw::Committed {
                value: (outcome, opened_fan_in),
                document,
            } => Transition {
                outcome,
                record: document.tasks.get(tenant).cloned().unwrap_or_default(),
                counters: document.counters(),
                opened_fan_in,
            },
            Rmw::Skipped { document } => {
                let Some(record) = document.task(tenant).cloned() else {
                    return Err(Error::UnknownTenant {
                        run_key: key.to_string(),
                        tenant: tenant.clone(),
                    });
                };
                Transition {
                    outcome: decide(&record, &event, max_tries).outcome,
                    record,
                    counters: document.counters(),
                    opened_fan_in: false,
                }
            }
        };

        self.metrics
            .record_task_transition(event.as_label(), transition.outcome.as_label());
        tracing::debug!(
            tenant = %tenant,
            event = event.as_label(),
            outcome = transition.outcome.as_label(),
            state = %transition.record.state,
            still_running = transition.counters.still_running,
            "task transition"
        );
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tally_core::{MemoryBackend, RunId};

    use crate::config::StateStoreConfig;
    use crate::run::ConsolidationScope;
    use crate::task::TaskState;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    async fn machine(tenants: &[&str], max_tries: u32) -> (TaskStateMachine, StateStore, RunKey) {
        let store = StateStore::new(
            Arc::new(MemoryBackend::new()),
            StateStoreConfig {
                max_attempts: 20,
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(2),
            },
        );
        let doc = RunDocument::reseller_wide(
            RunId::generate(),
            ConsolidationScope::incremental(),
            tenants.iter().map(|t| tenant(t)),
        );
        store.create_run(&doc).await.unwrap();
        (
            TaskStateMachine::new(store.clone(), max_tries),
            store,
            doc.run_key,
        )
    }

    #[tokio::test]
    async fn complete_twice_decrements_once() {
        let (sm, store, key) = machine(&["t"], 3).await;
        sm.begin_running(&key, &tenant("t")).await.unwrap();

        let first = sm.complete(&key, &tenant("t")).await.unwrap();
        assert_eq!(first.outcome, Outcome::Applied);
        assert_eq!(first.counters.still_running, 0);
        assert!(first.opened_fan_in);

        let second = sm.complete(&key, &tenant("t")).await.unwrap();
        assert_eq!(second.outcome, Outcome::AlreadyCopied);
        assert_eq!(second.counters.still_running, 0);
        assert!(!second.opened_fan_in);

        let doc = store.load_required(&key).await.unwrap();
        assert_eq!(doc.still_running, 0);
        assert_eq!(doc.processed, 1);
    }

    #[tokio::test]
    async fn running_twice_is_fenced_and_unchanged() {
        let (sm, store, key) = machine(&["t"], 3).await;
        sm.begin_running(&key, &tenant("t")).await.unwrap();
        let before = store.load_required(&key).await.unwrap();

        let dup = sm.begin_running(&key, &tenant("t")).await.unwrap();
        assert_eq!(dup.outcome, Outcome::Duplicate);
        assert_eq!(dup.record.state, TaskState::Running);

        let after = store.load_required(&key).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn three_failures_promote_and_decrement_once() {
        let (sm, store, key) = machine(&["t"], 3).await;
        let mut seen = Vec::new();
        for attempt in 0..3 {
            sm.begin_running(&key, &tenant("t")).await.unwrap();
            let t = sm
                .fail(&key, &tenant("t"), format!("attempt {attempt}"))
                .await
                .unwrap();
            seen.push((t.record.state, t.counters.still_running));
        }
        assert_eq!(
            seen,
            vec![
                (TaskState::Failed, 1),
                (TaskState::Failed, 1),
                (TaskState::Processed, 0),
            ]
        );
        let doc = store.load_required(&key).await.unwrap();
        assert_eq!(doc.processed, 1);
        assert!(doc.fan_in_opened);
        assert_eq!(
            doc.task(&tenant("t")).unwrap().last_error.as_deref(),
            Some("attempt 2")
        );
    }

    #[tokio::test]
    async fn gate_opens_on_last_terminal_tenant_only() {
        let (sm, _, key) = machine(&["a", "b"], 1).await;
        let a = sm.complete(&key, &tenant("a")).await.unwrap();
        assert!(!a.opened_fan_in);
        let b = sm.fail(&key, &tenant("b"), "boom").await.unwrap();
        assert_eq!(b.outcome, Outcome::Exhausted);
        assert!(b.opened_fan_in);
        let late = sm.fail(&key, &tenant("b"), "late").await.unwrap();
        assert_eq!(late.outcome, Outcome::Duplicate);
        assert!(!late.opened_fan_in);
    }

    #[tokio::test]
    async fn rollback_makes_the_next_create_fresh() {
        let (sm, _, key) = machine(&["t"], 3).await;
        assert_eq!(
            sm.begin_created(&key, &tenant("t")).await.unwrap().outcome,
            Outcome::Applied
        );
        assert_eq!(
            sm.begin_created(&key, &tenant("t")).await.unwrap().outcome,
            Outcome::Duplicate
        );
        sm.rollback(&key, &tenant("t")).await.unwrap();
        assert_eq!(
            sm.begin_created(&key, &tenant("t")).await.unwrap().outcome,
            Outcome::Applied
        );
    }

    #[tokio::test]
    async fn unknown_tenant_is_rejected() {
        let (sm, _, key) = machine(&["t"], 3).await;
        let err = sm.begin_running(&key, &tenant("stranger")).await.unwrap_err();
        assert!(matches!(err, Error::UnknownTenant { .. }));
    }
}
