//! Fan-out and the per-tenant append.

use tally_core::TenantId;

use super::{Coordinator, Handled, StartSummary};
use crate::dispatch::{ConsolidationTask, EnqueueOptions};
use crate::error::{Error, Result};
use crate::reporter::{Stage, TaskReport, TaskStatus};
use crate::run::{ConsolidationScope, RunKey};
use crate::task::Outcome;

enum Launch {
    Enqueued,
    Duplicate,
    Failed(String),
}

impl Coordinator {
    /// Enqueues one append per tenant, in two passes.
    ///
    /// A tenant whose enqueue fails is rolled back and retried once after
    /// every other tenant had its chance. A second failure abandons it, so
    /// the run can still converge.
    pub(super) async fn fan_out(
        &self,
        key: &RunKey,
        scope: ConsolidationScope,
        tenants: Vec<TenantId>,
    ) -> Result<StartSummary> {
        let mut summary = StartSummary {
            run_key: key.clone(),
            scope,
            tenants: u32::try_from(tenants.len()).unwrap_or(u32::MAX),
            enqueued: 0,
            skipped: 0,
            abandoned: Vec::new(),
        };

        let mut retry = Vec::new();
        for tenant in tenants {
            match self.launch(key, &tenant, scope).await? {
                Launch::Enqueued => summary.enqueued += 1,
                Launch::Duplicate => summary.skipped += 1,
                Launch::Failed(error) => {
                    tracing::warn!(tenant = %tenant, error = %error, "append enqueue failed, will retry");
                    retry.push(tenant);
                }
            }
        }

        for tenant in retry {
            match self.launch(key, &tenant, scope).await? {
                Launch::Enqueued => summary.enqueued += 1,
                Launch::Duplicate => summary.skipped += 1,
                Launch::Failed(error) => {
                    let abandoned = self.machine.abandon(key, &tenant, error.clone()).await?;
                    tracing::error!(
                        tenant = %tenant,
                        error = %error,
                        still_running = abandoned.counters.still_running,
                        "append enqueue failed twice, tenant abandoned"
                    );
                    self.report(
                        TaskReport::new(None, key.clone(), Stage::Start, TaskStatus::Failed)
                            .with_tenant(tenant.clone())
                            .with_error(error),
                    )
                    .await;
                    summary.abandoned.push(tenant);
                    if abandoned.opened_fan_in {
                        self.open_fan_in(key).await?;
                    }
                }
            }
        }

        tracing::info!(
            enqueued = summary.enqueued,
            skipped = summary.skipped,
            abandoned = summary.abandoned.len(),
            "fan-out finished"
        );
        Ok(summary)
    }

    async fn launch(
        &self,
        key: &RunKey,
        tenant: &TenantId,
        scope: ConsolidationScope,
    ) -> Result<Launch> {
        let created = self.machine.begin_created(key, tenant).await?;
        if created.outcome == Outcome::Duplicate {
            self.metrics.record_duplicate(Stage::Start.as_label());
            tracing::info!(
                tenant = %tenant,
                state = %created.record.state,
                "append launched twice, skipping"
            );
            return Ok(Launch::Duplicate);
        }

        let task = ConsolidationTask::Append {
            run_key: key.clone(),
            tenant: tenant.clone(),
            scope,
        };
        match self.enqueue(task, EnqueueOptions::new()).await {
            Ok(_) => Ok(Launch::Enqueued),
            Err(e) => {
                self.machine.rollback(key, tenant).await?;
                Ok(Launch::Failed(e.to_string()))
            }
        }
    }

    /// Copies one tenant's rows into the run's current shard.
    pub(super) async fn append(
        &self,
        key: &RunKey,
        tenant: &TenantId,
        scope: ConsolidationScope,
    ) -> Result<Handled> {
        let started = self.machine.begin_running(key, tenant).await?;
        if started.outcome == Outcome::Duplicate {
            if started.record.state.is_terminal() && self.resume_fan_in(key).await? {
                return Ok(Handled::Completed);
            }
            return Ok(Handled::duplicate(format!(
                "tenant is already {}",
                started.record.state
            )));
        }

        // Running is committed, so every exit below records an outcome.
        let lease = match self.allocator.current_or_next(key, None).await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(error = %e, "shard lookup failed");
                return match self.record_failure(key, tenant, &e.to_string()).await? {
                    Outcome::Exhausted => Ok(Handled::Exhausted {
                        error: e.to_string(),
                    }),
                    _ => Err(e),
                };
            }
        };
        self.metrics.record_shard_allocation("current");

        match self.bulk.append(tenant, &lease.table, scope.window()).await {
            Ok(rows) => {
                let done = self.machine.complete(key, tenant).await?;
                tracing::info!(
                    shard = lease.index,
                    rows,
                    still_running = done.counters.still_running,
                    "tenant appended"
                );
                if done.opened_fan_in {
                    self.open_fan_in(key).await?;
                }
                if done.outcome == Outcome::AlreadyCopied {
                    if self.resume_fan_in(key).await? {
                        return Ok(Handled::Completed);
                    }
                    return Ok(Handled::duplicate("tenant data already copied"));
                }
                Ok(Handled::Completed)
            }
            Err(e) => {
                if e.is_shard_unwritable() {
                    match self.allocator.current_or_next(key, Some(lease.index)).await {
                        Ok(next) => {
                            self.metrics.record_shard_allocation("reallocated");
                            tracing::warn!(
                                from = lease.index,
                                to = next.index,
                                "shard unwritable, later appends use a new shard"
                            );
                        }
                        Err(realloc) => tracing::error!(
                            shard = lease.index,
                            error = %realloc,
                            "shard unwritable and reallocation failed"
                        ),
                    }
                }

                match self.record_failure(key, tenant, &e.to_string()).await? {
                    Outcome::Exhausted => Ok(Handled::Exhausted {
                        error: e.to_string(),
                    }),
                    Outcome::Duplicate => {
                        if self.resume_fan_in(key).await? {
                            return Ok(Handled::Completed);
                        }
                        Ok(Handled::duplicate("tenant already processed"))
                    }
                    Outcome::Applied | Outcome::AlreadyCopied => Err(Error::Bulk(e)),
                }
            }
        }
    }

    /// Records a failed attempt, opening the gate if it exhausted the tenant.
    async fn record_failure(&self, key: &RunKey, tenant: &TenantId, error: &str) -> Result<Outcome> {
        let failed = self.machine.fail(key, tenant, error).await?;
        if failed.opened_fan_in {
            self.open_fan_in(key).await?;
        }
        match failed.outcome {
            Outcome::Exhausted => tracing::error!(
                retry_count = failed.record.retry_count,
                error,
                "append failed for the last time, tenant given up"
            ),
            Outcome::Duplicate => {}
            Outcome::Applied | Outcome::AlreadyCopied => tracing::warn!(
                retry_count = failed.record.retry_count,
                error,
                "append failed, awaiting redelivery"
            ),
        }
        Ok(failed.outcome)
    }
}
