//! The consolidation coordinator.
//!
//! A run moves through three phases:
//!
//! 1. **Fan-out.** [`Coordinator::start`] creates the run document and
//!    enqueues one append task per tenant.
//! 2. **Append.** Each append task copies one tenant's rows into the run's
//!    current shard and records a terminal state. The transaction that drives
//!    `still_running` to zero opens the fan-in gate and enqueues a single
//!    dispatch-joins task.
//! 3. **Fan-in.** The dispatch-joins task prepares the final table and
//!    enqueues one staggered join per shard. The join that merges the last
//!    shard finalizes the run: it enqueues the aggregate task and drops the
//!    shard tables.
//!
//! Every task may be delivered more than once. Duplicates are fenced by the
//! run document and reported as non-alerting terminations.

mod append;
mod join;

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use tally_core::{RunId, StorageBackend, TaskId, TenantId, consolidation_span};

use crate::bulk::BulkStore;
use crate::config::ConsolidatorConfig;
use crate::dispatch::{ConsolidationTask, EnqueueOptions, EnqueueResult, TaskEnvelope, TaskQueue};
use crate::error::{Error, Result};
use crate::lifecycle::TaskStateMachine;
use crate::metrics::ConsolidationMetrics;
use crate::reporter::{Stage, TaskReport, TaskReporter, TaskStatus};
use crate::run::{ConsolidationScope, RunDocument, RunKey, RunStatus};
use crate::shard::{ShardAllocator, ShardAssignment};
use crate::store::StateStore;
use crate::tenants::{TenantDirectory, filter_tenants};

/// Request to start a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Reload a single tenant instead of every eligible tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<TenantId>,
    /// Partitions to reload.
    #[serde(default)]
    pub scope: ConsolidationScope,
}

/// What a started run did during fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSummary {
    /// Key of the new run document.
    pub run_key: RunKey,
    /// Scope actually used (may differ from the request).
    pub scope: ConsolidationScope,
    /// Tenants in the run.
    pub tenants: u32,
    /// Append tasks enqueued.
    pub enqueued: u32,
    /// Tenants whose record already existed.
    pub skipped: u32,
    /// Tenants given up on after two failed enqueues.
    pub abandoned: Vec<TenantId>,
}

/// Outcome of handling one delivered task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Handled {
    /// The task did its work.
    Completed,
    /// The task was a duplicate delivery and did nothing.
    Duplicate {
        /// Why the task was fenced.
        reason: String,
    },
    /// The run is not in a state where the task applies.
    NotReady {
        /// What the run is waiting for.
        reason: String,
    },
    /// The tenant failed for the last time and was given up on.
    Exhausted {
        /// The last error.
        error: String,
    },
}

impl Handled {
    fn duplicate(reason: impl Into<String>) -> Self {
        Self::Duplicate {
            reason: reason.into(),
        }
    }

    fn not_ready(reason: impl Into<String>) -> Self {
        Self::NotReady {
            reason: reason.into(),
        }
    }

    const fn as_label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Duplicate { .. } => "duplicate",
            Self::NotReady { .. } => "not_ready",
            Self::Exhausted { .. } => "exhausted",
        }
    }
}

/// Drives consolidation runs over pluggable collaborators.
pub struct Coordinator {
    config: ConsolidatorConfig,
    store: StateStore,
    machine: TaskStateMachine,
    allocator: ShardAllocator,
    slots: ShardAssignment,
    queue: Arc<dyn TaskQueue>,
    bulk: Arc<dyn BulkStore>,
    reporter: Arc<dyn TaskReporter>,
    tenants: Arc<dyn TenantDirectory>,
    metrics: ConsolidationMetrics,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("queue", &self.queue.queue_name())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        config: ConsolidatorConfig,
        storage: Arc<dyn StorageBackend>,
        queue: Arc<dyn TaskQueue>,
        bulk: Arc<dyn BulkStore>,
        reporter: Arc<dyn TaskReporter>,
        tenants: Arc<dyn TenantDirectory>,
    ) -> Self {
        let store = StateStore::new(storage, config.state_store);
        Self {
            machine: TaskStateMachine::new(store.clone(), config.max_tries),
            allocator: ShardAllocator::new(store.clone(), config.shard_table_prefix.clone()),
            slots: ShardAssignment::new(store.clone()),
            store,
            config,
            queue,
            bulk,
            reporter,
            tenants,
            metrics: ConsolidationMetrics::new(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ConsolidatorConfig {
        &self.config
    }

    /// Starts a reseller-wide run, or a single-tenant reload if the request
    /// names a tenant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for an invalid scope or an empty
    /// tenant list, and store, bulk or queue errors that prevent the run
    /// from starting.
    pub async fn start(&self, request: StartRequest) -> Result<StartSummary> {
        request.scope.validate()?;
        match request.tenant {
            None => {
                self.start_reseller_wide(request.scope)
                    .instrument(consolidation_span("start", "-", None))
                    .await
            }
            Some(tenant) => {
                let span = consolidation_span("start", "-", Some(tenant.as_str()));
                self.start_single_tenant(tenant, request.scope)
                    .instrument(span)
                    .await
            }
        }
    }

    async fn start_reseller_wide(&self, mut scope: ConsolidationScope) -> Result<StartSummary> {
        let tenants = filter_tenants(
            self.tenants.eligible_tenants().await?,
            &self.config.excluded_tenants,
        );
        if tenants.is_empty() {
            return Err(Error::invalid_request("no eligible tenants"));
        }

        if !scope.all_partitions && !self.bulk.exists(&self.config.final_table).await? {
            tracing::info!(
                table = %self.config.final_table,
                "final table missing, reloading all partitions"
            );
            scope.all_partitions = true;
        }

        let document = RunDocument::reseller_wide(RunId::generate(), scope, tenants.clone());
        if !self.store.create_run(&document).await? {
            return Err(Error::invalid_request(format!(
                "run {} already exists",
                document.run_key
            )));
        }
        tracing::info!(
            run_key = %document.run_key,
            tenants = tenants.len(),
            all_partitions = scope.all_partitions,
            "run created"
        );

        self.fan_out(&document.run_key, scope, tenants).await
    }

    async fn start_single_tenant(
        &self,
        tenant: TenantId,
        scope: ConsolidationScope,
    ) -> Result<StartSummary> {
        let key = RunKey::Tenant(tenant.clone());

        // Shard names repeat across reloads of the same tenant.
        if let Some(previous) = self.store.load(&key).await? {
            for index in 1..=previous.shard_index {
                self.bulk
                    .delete_table(&self.allocator.table(&key, index))
                    .await?;
            }
        }

        let document = RunDocument::single_tenant(tenant.clone(), scope);
        self.store.replace_run(&document).await?;

        let window = scope.window();
        self.bulk
            .delete_rows(&self.config.final_table, window, Some(&tenant))
            .await?;
        self.bulk
            .delete_rows(&self.config.aggregated_table, window, Some(&tenant))
            .await?;
        tracing::info!(run_key = %key, "single-tenant reload created");

        self.fan_out(&key, scope, vec![tenant]).await
    }

    /// Handles one delivered task.
    ///
    /// Duplicate deliveries return `Ok`; errors mean the queue should
    /// redeliver (see [`Error::is_retryable`]).
    ///
    /// # Errors
    ///
    /// Returns store, bulk and queue errors that the handler could not absorb.
    pub async fn execute(&self, envelope: &TaskEnvelope) -> Result<Handled> {
        let started = Instant::now();
        let task = &envelope.task;
        let run_key = task.run_key().to_string();
        let tenant = match task {
            ConsolidationTask::Append { tenant, .. } => Some(tenant.clone()),
            _ => None,
        };
        let span = consolidation_span(task.kind(), &run_key, tenant.as_ref().map(TenantId::as_str));

        let (stage, result) = async {
            match task {
                ConsolidationTask::Append {
                    run_key,
                    tenant,
                    scope,
                } => (Stage::Append, self.append(run_key, tenant, *scope).await),
                ConsolidationTask::DispatchJoins { run_key } => {
                    (Stage::DispatchJoins, self.dispatch_joins(run_key).await)
                }
                ConsolidationTask::Join { run_key, shard } => (
                    Stage::Join,
                    self.join(run_key, *shard, envelope.task_id).await,
                ),
                ConsolidationTask::Aggregate { run_key } => {
                    (Stage::Aggregate, self.aggregate(run_key).await)
                }
            }
        }
        .instrument(span)
        .await;

        let mut report = match &result {
            Ok(Handled::Completed) => TaskReport::new(
                Some(envelope.task_id),
                task.run_key().clone(),
                stage,
                TaskStatus::Success,
            ),
            Ok(Handled::Duplicate { reason } | Handled::NotReady { reason }) => TaskReport::new(
                Some(envelope.task_id),
                task.run_key().clone(),
                stage,
                TaskStatus::NonAlertingTermination,
            )
            .with_error(reason.clone()),
            Ok(Handled::Exhausted { error }) => TaskReport::new(
                Some(envelope.task_id),
                task.run_key().clone(),
                stage,
                TaskStatus::Failed,
            )
            .with_error(error.clone()),
            Err(e) => TaskReport::new(
                Some(envelope.task_id),
                task.run_key().clone(),
                stage,
                TaskStatus::Failed,
            )
            .with_error(e.to_string()),
        };
        if let Some(tenant) = tenant {
            report = report.with_tenant(tenant);
        }
        if let Ok(Handled::Duplicate { .. }) = &result {
            self.metrics.record_duplicate(stage.as_label());
        }
        self.report(report).await;

        let label = result.as_ref().map_or("error", Handled::as_label);
        self.metrics
            .observe_task_duration(task.kind(), label, started.elapsed());
        result
    }

    /// Re-enqueues joins for every shard not yet merged.
    ///
    /// Does nothing until the fan-in gate is open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] for an unknown run, and store, bulk or
    /// queue errors.
    pub async fn redispatch_joins(&self, key: &RunKey) -> Result<Handled> {
        let envelope = TaskEnvelope::new(ConsolidationTask::DispatchJoins {
            run_key: key.clone(),
        });
        self.execute(&envelope).await
    }

    /// Re-runs the aggregation of a finalized run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] for an unknown run, and bulk errors.
    pub async fn rerun_aggregate(&self, key: &RunKey) -> Result<Handled> {
        let envelope = TaskEnvelope::new(ConsolidationTask::Aggregate {
            run_key: key.clone(),
        });
        self.execute(&envelope).await
    }

    /// Returns a snapshot of a run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] for an unknown run.
    pub async fn status(&self, key: &RunKey) -> Result<RunStatus> {
        Ok(self.store.load_required(key).await?.status())
    }

    async fn enqueue(&self, task: ConsolidationTask, options: EnqueueOptions) -> Result<TaskId> {
        let kind = task.kind();
        let envelope = TaskEnvelope::new(task);
        let task_id = envelope.task_id;
        match self.queue.enqueue(envelope, options).await {
            Ok(EnqueueResult::Enqueued { .. }) => {
                self.metrics.record_enqueue(kind, "ok");
                Ok(task_id)
            }
            Ok(EnqueueResult::QueueFull) => {
                self.metrics.record_enqueue(kind, "queue_full");
                Err(Error::dispatch(format!(
                    "queue {} is full",
                    self.queue.queue_name()
                )))
            }
            Err(e) => {
                self.metrics.record_enqueue(kind, "error");
                Err(e)
            }
        }
    }

    async fn report(&self, report: TaskReport) {
        self.metrics.record_report(report.status.as_label());
        self.reporter.report(report).await;
    }
}
