//! Shared harness for coordinator integration tests.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use tally_core::{MemoryBackend, StorageBackend, TenantId};
use tally_flow::bulk::memory::InMemoryBulkStore;
use tally_flow::config::{ConsolidatorConfig, StateStoreConfig};
use tally_flow::coordinator::{Coordinator, Handled};
use tally_flow::dispatch::memory::{InMemoryTaskQueue, QueueEntry};
use tally_flow::reporter::InMemoryTaskReporter;
use tally_flow::tenants::StaticTenantDirectory;

pub const FINAL: &str = "csp_billing_full";
pub const AGGREGATED: &str = "csp_billing";
pub const SHARD_PREFIX: &str = "tmp_csp_billing";

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

pub fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

pub fn fast_config() -> ConsolidatorConfig {
    ConsolidatorConfig::default().with_state_store(StateStoreConfig {
        max_attempts: 20,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
    })
}

pub struct Harness {
    pub coordinator: Arc<Coordinator>,
    pub queue: Arc<InMemoryTaskQueue>,
    pub bulk: Arc<InMemoryBulkStore>,
    pub reporter: Arc<InMemoryTaskReporter>,
}

impl Harness {
    pub fn new(tenants: &[&str]) -> Self {
        Self::with_config(tenants, fast_config())
    }

    pub fn with_config(tenants: &[&str], config: ConsolidatorConfig) -> Self {
        Self::with_storage(tenants, config, Arc::new(MemoryBackend::new()))
    }

    pub fn with_storage(
        tenants: &[&str],
        config: ConsolidatorConfig,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        let queue = Arc::new(InMemoryTaskQueue::new("consolidation"));
        let bulk = Arc::new(InMemoryBulkStore::new(day(10)));
        let reporter = Arc::new(InMemoryTaskReporter::new());
        let directory = StaticTenantDirectory::new(tenants.iter().map(|t| tenant(t)));
        let coordinator = Arc::new(Coordinator::new(
            config,
            storage,
            queue.clone(),
            bulk.clone(),
            reporter.clone(),
            Arc::new(directory),
        ));
        Self {
            coordinator,
            queue,
            bulk,
            reporter,
        }
    }

    /// Delivers queued tasks in FIFO order until the queue is empty.
    ///
    /// A failed delivery is redelivered immediately, as the queue would.
    pub async fn drive(&self) -> Vec<(QueueEntry, Handled)> {
        let mut delivered = Vec::new();
        while let Some(entry) = self.queue.take().unwrap() {
            let mut attempts = 0;
            loop {
                attempts += 1;
                match self.coordinator.execute(&entry.envelope).await {
                    Ok(handled) => {
                        delivered.push((entry.clone(), handled));
                        break;
                    }
                    Err(e) => {
                        assert!(e.is_retryable(), "non-retryable failure: {e}");
                        assert!(attempts < 10, "task never succeeded: {e}");
                    }
                }
            }
        }
        delivered
    }

    /// Seeds the three standard tenants.
    ///
    /// Every tenant has 10-30 on the current partition; `a` and `c` also
    /// have history (100 and 1000).
    pub fn seed_standard(&self) {
        self.bulk
            .seed(&tenant("a"), &[(day(9), 100), (day(10), 10)])
            .unwrap();
        self.bulk.seed(&tenant("b"), &[(day(10), 20)]).unwrap();
        self.bulk
            .seed(&tenant("c"), &[(day(8), 1000), (day(10), 30)])
            .unwrap();
    }

    pub fn shard_tables(&self) -> Vec<String> {
        self.bulk
            .table_names()
            .unwrap()
            .into_iter()
            .filter(|name| name.starts_with(SHARD_PREFIX))
            .collect()
    }
}

pub fn kinds(delivered: &[(QueueEntry, Handled)]) -> Vec<&'static str> {
    delivered.iter().map(|(e, _)| e.envelope.task.kind()).collect()
}
