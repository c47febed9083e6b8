//! End-to-end consolidation runs over the in-memory collaborators.
//!
//! The harness plays the queue: it delivers tasks in FIFO order and
//! redelivers a task whose handler failed.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use tally_core::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
use tally_flow::bulk::BulkErrorKind;
use tally_flow::bulk::memory::BillingRow;
use tally_flow::config::{ConsolidatorConfig, StateStoreConfig};
use tally_flow::coordinator::{Handled, StartRequest};
use tally_flow::error::Error;
use tally_flow::reporter::{Stage, TaskStatus};
use tally_flow::run::{ConsolidationScope, RunKey, RunStatus};
use tally_flow::task::TaskState;

use support::{AGGREGATED, FINAL, Harness, day, fast_config, kinds, tenant};

#[tokio::test]
async fn first_run_reloads_every_partition() {
    let h = Harness::new(&["a", "b", "c"]);
    h.seed_standard();

    let summary = h.coordinator.start(StartRequest::default()).await.unwrap();
    assert!(summary.scope.all_partitions, "missing final table forces a full reload");
    assert_eq!(summary.tenants, 3);
    assert_eq!(summary.enqueued, 3);

    let delivered = h.drive().await;
    assert_eq!(
        kinds(&delivered),
        vec!["append", "append", "append", "joins", "join", "aggregate"]
    );
    assert!(delivered.iter().all(|(_, handled)| *handled == Handled::Completed));

    assert_eq!(h.bulk.total_cost(FINAL).unwrap(), 1160);
    assert_eq!(h.bulk.total_cost(AGGREGATED).unwrap(), 1160);
    assert_eq!(h.bulk.rows(AGGREGATED).unwrap().unwrap().len(), 5);

    let status = h.coordinator.status(&summary.run_key).await.unwrap();
    assert!(status.fan_in_opened);
    assert!(status.finalized);
    assert_eq!(status.shard_index, 1);
    assert!(status.pending_shards.is_empty());
    assert_eq!(status.counters.still_running, 0);
    assert_eq!(status.counters.processed, 3);
    assert!(status.not_copied.is_empty());

    // Full reloads keep their shard tables.
    assert_eq!(h.shard_tables().len(), 1);
    assert_eq!(h.reporter.count(Stage::Append, TaskStatus::Success), 3);
}

#[tokio::test]
async fn incremental_run_replaces_only_the_current_partition() {
    let h = Harness::new(&["a", "b", "c"]);
    h.seed_standard();
    h.bulk
        .create_table(
            FINAL,
            vec![
                BillingRow::new(tenant("a"), day(9), 100),
                BillingRow::new(tenant("a"), day(10), 999),
                BillingRow::new(tenant("b"), day(10), 888),
            ],
        )
        .unwrap();

    let summary = h.coordinator.start(StartRequest::default()).await.unwrap();
    assert_eq!(summary.scope, ConsolidationScope::incremental());

    h.drive().await;

    assert_eq!(h.bulk.total_cost(FINAL).unwrap(), 160);
    assert_eq!(h.bulk.total_cost(AGGREGATED).unwrap(), 160);
    assert_eq!(h.bulk.rows(AGGREGATED).unwrap().unwrap().len(), 4);
    assert!(h.shard_tables().is_empty(), "incremental runs drop their shards");
}

#[tokio::test]
async fn replayed_deliveries_are_fenced() {
    let h = Harness::new(&["a", "b", "c"]);
    h.seed_standard();
    h.coordinator.start(StartRequest::default()).await.unwrap();
    let delivered = h.drive().await;

    for (entry, _) in &delivered {
        if entry.envelope.task.kind() == "aggregate" {
            continue;
        }
        let handled = h.coordinator.execute(&entry.envelope).await.unwrap();
        assert!(
            matches!(handled, Handled::Duplicate { .. }),
            "{} replay was not fenced: {handled:?}",
            entry.envelope.task.kind()
        );
    }

    assert!(h.queue.take().unwrap().is_none(), "replays enqueue nothing");
    assert_eq!(h.bulk.total_cost(FINAL).unwrap(), 1160);
    for id in ["a", "b", "c"] {
        assert_eq!(h.bulk.append_count(&tenant(id)).unwrap(), 1);
    }
    assert_eq!(
        h.reporter
            .count(Stage::Append, TaskStatus::NonAlertingTermination),
        3
    );
    assert_eq!(
        h.reporter.count(Stage::Join, TaskStatus::NonAlertingTermination),
        1
    );
    assert_eq!(
        h.reporter
            .count(Stage::DispatchJoins, TaskStatus::NonAlertingTermination),
        1
    );
}

#[tokio::test]
async fn failing_tenant_is_given_up_after_max_tries() {
    let h = Harness::with_config(&["a", "b", "c"], fast_config().with_max_tries(3));
    h.seed_standard();
    h.bulk
        .fail_appends(&tenant("b"), BulkErrorKind::Transient, 10)
        .unwrap();

    let summary = h.coordinator.start(StartRequest::default()).await.unwrap();
    let delivered = h.drive().await;

    assert!(delivered.iter().any(|(entry, handled)| {
        matches!(handled, Handled::Exhausted { .. })
            && entry.envelope.task.kind() == "append"
    }));
    assert_eq!(h.reporter.count(Stage::Append, TaskStatus::Failed), 3);
    assert_eq!(h.bulk.append_count(&tenant("b")).unwrap(), 0);

    let status = h.coordinator.status(&summary.run_key).await.unwrap();
    assert_eq!(status.not_copied, vec![tenant("b")]);
    assert_eq!(status.counters.processed, 3);
    assert!(status.finalized);

    // The run converges without b's rows.
    assert_eq!(h.bulk.total_cost(FINAL).unwrap(), 1140);
}

#[tokio::test]
async fn unwritable_shard_moves_later_appends_to_a_new_shard() {
    let h = Harness::new(&["a", "b", "c"]);
    h.seed_standard();
    h.bulk
        .fail_appends(&tenant("a"), BulkErrorKind::ShardUnwritable, 1)
        .unwrap();

    let summary = h.coordinator.start(StartRequest::default()).await.unwrap();
    let delivered = h.drive().await;

    let status = h.coordinator.status(&summary.run_key).await.unwrap();
    assert_eq!(status.shard_index, 2);
    assert!(status.pending_shards.is_empty());
    assert!(status.finalized);

    assert_eq!(kinds(&delivered).iter().filter(|k| **k == "join").count(), 2);
    // Shard 1 was never written, so only shard 2 exists.
    assert_eq!(h.shard_tables().len(), 1);
    assert!(h.shard_tables()[0].ends_with("_2"));
    assert_eq!(h.bulk.total_cost(FINAL).unwrap(), 1160);
}

#[tokio::test]
async fn joins_are_staggered() {
    let h = Harness::with_config(
        &["a", "b", "c"],
        fast_config().with_join_stagger(Duration::from_secs(60)),
    );
    h.seed_standard();
    h.bulk
        .fail_appends(&tenant("a"), BulkErrorKind::ShardUnwritable, 1)
        .unwrap();

    h.coordinator.start(StartRequest::default()).await.unwrap();
    let delivered = h.drive().await;

    let delays: Vec<_> = delivered
        .iter()
        .filter(|(entry, _)| entry.envelope.task.kind() == "join")
        .map(|(entry, _)| entry.options.delay)
        .collect();
    assert_eq!(delays, vec![None, Some(Duration::from_secs(60))]);
}

#[tokio::test]
async fn failed_enqueue_is_retried_in_a_second_pass() {
    let h = Harness::new(&["a", "b", "c"]);
    h.seed_standard();
    h.queue.fail_next(1).unwrap();

    let summary = h.coordinator.start(StartRequest::default()).await.unwrap();
    assert_eq!(summary.enqueued, 3);
    assert!(summary.abandoned.is_empty());

    h.drive().await;
    assert_eq!(h.bulk.total_cost(FINAL).unwrap(), 1160);
}

#[tokio::test]
async fn twice_failed_enqueue_abandons_the_tenant() {
    let h = Harness::new(&["a"]);
    h.seed_standard();
    h.queue.fail_next(2).unwrap();

    let summary = h.coordinator.start(StartRequest::default()).await.unwrap();
    assert_eq!(summary.enqueued, 0);
    assert_eq!(summary.abandoned, vec![tenant("a")]);
    assert_eq!(h.reporter.count(Stage::Start, TaskStatus::Failed), 1);

    // The abandon opened the gate; with no shard the run finalizes directly.
    let delivered = h.drive().await;
    assert_eq!(kinds(&delivered), vec!["joins", "aggregate"]);
    assert!(delivered.iter().all(|(_, handled)| *handled == Handled::Completed));

    let status = h.coordinator.status(&summary.run_key).await.unwrap();
    assert!(status.finalized);
    assert_eq!(status.shard_index, 0);
    assert_eq!(status.not_copied, vec![tenant("a")]);
}

#[tokio::test]
async fn start_validates_the_request() {
    let h = Harness::new(&[]);
    let err = h.coordinator.start(StartRequest::default()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest { .. }), "{err:?}");

    let h = Harness::with_config(&["a"], fast_config().excluding(tenant("a")));
    let err = h.coordinator.start(StartRequest::default()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest { .. }), "{err:?}");

    let h = Harness::new(&["a"]);
    let request = StartRequest {
        tenant: None,
        scope: ConsolidationScope {
            num_partitions: 2,
            ..ConsolidationScope::incremental()
        },
    };
    let err = h.coordinator.start(request).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest { .. }), "{err:?}");
}

#[tokio::test]
async fn single_tenant_reload_replaces_only_that_tenant() {
    let h = Harness::new(&["a", "b", "c"]);
    h.seed_standard();
    let previous = vec![
        BillingRow::new(tenant("a"), day(9), 100),
        BillingRow::new(tenant("a"), day(10), 10),
        BillingRow::new(tenant("b"), day(10), 20),
        BillingRow::new(tenant("c"), day(10), 30),
    ];
    h.bulk.create_table(FINAL, previous.clone()).unwrap();
    h.bulk.create_table(AGGREGATED, previous).unwrap();
    // a's usage for the day was revised upwards.
    h.bulk.seed(&tenant("a"), &[(day(10), 5)]).unwrap();

    let manual = StartRequest {
        tenant: Some(tenant("a")),
        scope: ConsolidationScope::from_date(day(10), 1),
    };
    let summary = h.coordinator.start(manual).await.unwrap();
    assert_eq!(summary.run_key, RunKey::Tenant(tenant("a")));
    let delivered = h.drive().await;
    assert_eq!(kinds(&delivered), vec!["append", "joins", "join"]);
    assert_eq!(h.bulk.total_cost(FINAL).unwrap(), 165);
    assert_eq!(h.shard_tables().len(), 1, "manual reloads keep their shard");

    // Reloading again reuses the shard name; the stale shard must not leak in.
    let incremental = StartRequest {
        tenant: Some(tenant("a")),
        scope: ConsolidationScope::incremental(),
    };
    h.coordinator.start(incremental).await.unwrap();
    let delivered = h.drive().await;
    assert_eq!(kinds(&delivered), vec!["append", "joins", "join", "aggregate"]);
    assert_eq!(h.bulk.total_cost(FINAL).unwrap(), 165);
    assert_eq!(h.bulk.total_cost(AGGREGATED).unwrap(), 165);
    assert!(h.shard_tables().is_empty());
}

#[tokio::test]
async fn operator_entry_points() {
    let h = Harness::new(&["a", "b"]);
    h.seed_standard();
    let summary = h.coordinator.start(StartRequest::default()).await.unwrap();

    let early = h.coordinator.redispatch_joins(&summary.run_key).await.unwrap();
    assert!(matches!(early, Handled::NotReady { .. }), "{early:?}");
    let early = h.coordinator.rerun_aggregate(&summary.run_key).await.unwrap();
    assert!(matches!(early, Handled::NotReady { .. }), "{early:?}");

    h.drive().await;
    let total = h.bulk.total_cost(AGGREGATED).unwrap();

    let again = h.coordinator.rerun_aggregate(&summary.run_key).await.unwrap();
    assert_eq!(again, Handled::Completed);
    assert_eq!(h.bulk.total_cost(AGGREGATED).unwrap(), total);

    let again = h.coordinator.redispatch_joins(&summary.run_key).await.unwrap();
    assert!(matches!(again, Handled::Duplicate { .. }), "{again:?}");

    let unknown = RunKey::Tenant(tenant("zzz"));
    let err = h.coordinator.status(&unknown).await.unwrap_err();
    assert!(matches!(err, Error::RunNotFound { .. }), "{err:?}");
}

/// Backend that refuses to persist any run document at or past a shard index.
///
/// Every refusal looks like a lost race, so the store gives up with a
/// transaction conflict. A ceiling of zero lets everything through.
#[derive(Default)]
struct ShardCeiling {
    inner: MemoryBackend,
    ceiling: AtomicU64,
}

impl ShardCeiling {
    fn set(&self, ceiling: u64) {
        self.ceiling.store(ceiling, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for ShardCeiling {
    async fn get(&self, path: &str) -> tally_core::Result<Option<(Bytes, String)>> {
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> tally_core::Result<WriteResult> {
        let ceiling = self.ceiling.load(Ordering::SeqCst);
        let shard = serde_json::from_slice::<serde_json::Value>(&data)
            .ok()
            .and_then(|doc| doc["shardIndex"].as_u64())
            .unwrap_or(0);
        if ceiling > 0 && shard >= ceiling {
            return Ok(WriteResult::PreconditionFailed {
                current_version: "0".into(),
            });
        }
        self.inner.put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> tally_core::Result<()> {
        self.inner.delete(path).await
    }

    async fn head(&self, path: &str) -> tally_core::Result<Option<ObjectMeta>> {
        self.inner.head(path).await
    }
}

fn few_attempts() -> ConsolidatorConfig {
    fast_config().with_state_store(StateStoreConfig {
        max_attempts: 3,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(2),
    })
}

fn in_state(status: &RunStatus, state: TaskState) -> u32 {
    status.tasks_by_state.get(&state).copied().unwrap_or(0)
}

#[tokio::test]
async fn failed_shard_allocation_leaves_the_tenant_retryable() {
    let storage = Arc::new(ShardCeiling::default());
    let h = Harness::with_storage(&["a"], few_attempts(), storage.clone());
    h.seed_standard();
    let summary = h.coordinator.start(StartRequest::default()).await.unwrap();

    storage.set(1);
    let append = h.queue.take().unwrap().unwrap();
    let err = h.coordinator.execute(&append.envelope).await.unwrap_err();
    assert!(matches!(err, Error::TransactionConflict { .. }), "{err:?}");
    assert!(err.is_retryable());

    let status = h.coordinator.status(&summary.run_key).await.unwrap();
    assert_eq!(in_state(&status, TaskState::Running), 0);
    assert_eq!(in_state(&status, TaskState::Failed), 1);
    assert_eq!(status.shard_index, 0);

    storage.set(0);
    let again = h.coordinator.execute(&append.envelope).await.unwrap();
    assert_eq!(again, Handled::Completed);

    let delivered = h.drive().await;
    assert_eq!(kinds(&delivered), vec!["joins", "join", "aggregate"]);
    assert_eq!(h.bulk.total_cost(FINAL).unwrap(), 110);
    assert_eq!(h.bulk.append_count(&tenant("a")).unwrap(), 1);
}

#[tokio::test]
async fn failed_shard_allocation_on_the_last_try_opens_the_gate() {
    let storage = Arc::new(ShardCeiling::default());
    let h = Harness::with_storage(&["a"], few_attempts().with_max_tries(1), storage.clone());
    h.seed_standard();
    let summary = h.coordinator.start(StartRequest::default()).await.unwrap();

    storage.set(1);
    let append = h.queue.take().unwrap().unwrap();
    let handled = h.coordinator.execute(&append.envelope).await.unwrap();
    assert!(matches!(handled, Handled::Exhausted { .. }), "{handled:?}");

    let delivered = h.drive().await;
    assert_eq!(kinds(&delivered), vec!["joins", "aggregate"]);

    let status = h.coordinator.status(&summary.run_key).await.unwrap();
    assert!(status.finalized);
    assert_eq!(status.not_copied, vec![tenant("a")]);
    assert_eq!(in_state(&status, TaskState::Processed), 1);
}

#[tokio::test]
async fn failed_reallocation_still_records_the_failure() {
    let storage = Arc::new(ShardCeiling::default());
    let h = Harness::with_storage(&["a"], few_attempts(), storage.clone());
    h.seed_standard();
    h.bulk
        .fail_appends(&tenant("a"), BulkErrorKind::ShardUnwritable, 1)
        .unwrap();
    let summary = h.coordinator.start(StartRequest::default()).await.unwrap();

    storage.set(2);
    let append = h.queue.take().unwrap().unwrap();
    let err = h.coordinator.execute(&append.envelope).await.unwrap_err();
    assert!(matches!(err, Error::Bulk(_)), "{err:?}");

    let status = h.coordinator.status(&summary.run_key).await.unwrap();
    assert_eq!(in_state(&status, TaskState::Failed), 1);
    assert_eq!(status.shard_index, 1);

    // The redelivery stays on the shard it could not leave.
    storage.set(0);
    let again = h.coordinator.execute(&append.envelope).await.unwrap();
    assert_eq!(again, Handled::Completed);
    h.drive().await;

    let status = h.coordinator.status(&summary.run_key).await.unwrap();
    assert!(status.finalized);
    assert_eq!(status.shard_index, 1);
    assert_eq!(h.bulk.total_cost(FINAL).unwrap(), 110);
}

#[tokio::test]
async fn lost_fan_in_enqueue_is_resumed_by_the_redelivered_append() {
    let h = Harness::new(&["a"]);
    h.seed_standard();
    let summary = h.coordinator.start(StartRequest::default()).await.unwrap();

    // The append commits the gate, then fails to enqueue dispatch-joins.
    h.queue.fail_next(1).unwrap();
    let append = h.queue.take().unwrap().unwrap();
    let err = h.coordinator.execute(&append.envelope).await.unwrap_err();
    assert!(matches!(err, Error::Dispatch { .. }), "{err:?}");

    let status = h.coordinator.status(&summary.run_key).await.unwrap();
    assert!(status.fan_in_opened);
    assert!(!status.fan_in_dispatched);

    let again = h.coordinator.execute(&append.envelope).await.unwrap();
    assert_eq!(again, Handled::Completed);

    let delivered = h.drive().await;
    assert_eq!(kinds(&delivered), vec!["joins", "join", "aggregate"]);
    assert!(delivered.iter().all(|(_, handled)| *handled == Handled::Completed));
    assert_eq!(h.bulk.total_cost(AGGREGATED).unwrap(), 110);

    let status = h.coordinator.status(&summary.run_key).await.unwrap();
    assert!(status.fan_in_dispatched);
    assert!(status.aggregation_dispatched);

    // Once dispatched, a further replay is only a duplicate.
    let replay = h.coordinator.execute(&append.envelope).await.unwrap();
    assert!(matches!(replay, Handled::Duplicate { .. }), "{replay:?}");
    assert!(h.queue.take().unwrap().is_none());
}

#[tokio::test]
async fn lost_aggregate_enqueue_is_resumed_by_the_redelivered_join() {
    let h = Harness::new(&["a"]);
    h.seed_standard();
    let summary = h.coordinator.start(StartRequest::default()).await.unwrap();

    for _ in 0..2 {
        let entry = h.queue.take().unwrap().unwrap();
        let handled = h.coordinator.execute(&entry.envelope).await.unwrap();
        assert_eq!(handled, Handled::Completed);
    }

    // The join finalizes the run, then fails to enqueue the aggregate.
    h.queue.fail_next(1).unwrap();
    let join = h.queue.take().unwrap().unwrap();
    assert_eq!(join.envelope.task.kind(), "join");
    let err = h.coordinator.execute(&join.envelope).await.unwrap_err();
    assert!(err.is_retryable(), "{err:?}");

    let status = h.coordinator.status(&summary.run_key).await.unwrap();
    assert!(status.finalized);
    assert!(!status.aggregation_dispatched);

    let again = h.coordinator.execute(&join.envelope).await.unwrap();
    assert_eq!(again, Handled::Completed);

    let delivered = h.drive().await;
    assert_eq!(kinds(&delivered), vec!["aggregate"]);
    assert_eq!(h.bulk.total_cost(AGGREGATED).unwrap(), 110);
    assert_eq!(h.bulk.merge_count(&h.shard_tables()[0]).unwrap(), 1);

    let status = h.coordinator.status(&summary.run_key).await.unwrap();
    assert!(status.aggregation_dispatched);
}

#[tokio::test]
async fn lost_aggregate_enqueue_of_an_empty_run_is_resumed_by_dispatch_joins() {
    let h = Harness::with_config(&["a"], fast_config().with_max_tries(1));
    h.bulk
        .fail_appends(&tenant("a"), BulkErrorKind::Transient, 1)
        .unwrap();
    let summary = h.coordinator.start(StartRequest::default()).await.unwrap();

    let append = h.queue.take().unwrap().unwrap();
    let handled = h.coordinator.execute(&append.envelope).await.unwrap();
    assert!(matches!(handled, Handled::Exhausted { .. }), "{handled:?}");

    h.queue.fail_next(1).unwrap();
    let joins = h.queue.take().unwrap().unwrap();
    let err = h.coordinator.execute(&joins.envelope).await.unwrap_err();
    assert!(err.is_retryable(), "{err:?}");

    let again = h.coordinator.execute(&joins.envelope).await.unwrap();
    assert_eq!(again, Handled::Completed);
    assert_eq!(kinds(&h.drive().await), vec!["aggregate"]);

    let status = h.coordinator.status(&summary.run_key).await.unwrap();
    assert!(status.finalized);
    assert!(status.aggregation_dispatched);
}
