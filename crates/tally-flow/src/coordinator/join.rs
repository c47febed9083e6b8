//! Fan-in: destination preparation, shard joins, finalize and aggregation.

use tally_core::TaskId;

use super::{Coordinator, Handled};
use crate::bulk::WriteDisposition;
use crate::dispatch::{ConsolidationTask, EnqueueOptions};
use crate::error::{Error, Result};
use crate::run::{DateWindow, RunDocument, RunKey, RunMode};
use crate::shard::SlotClaim;

impl Coordinator {
    /// Enqueues the single dispatch-joins task of a run whose gate just opened.
    pub(super) async fn open_fan_in(&self, key: &RunKey) -> Result<()> {
        tracing::info!(run_key = %key, "fan-in gate opened");
        self.enqueue(
            ConsolidationTask::DispatchJoins {
                run_key: key.clone(),
            },
            EnqueueOptions::new(),
        )
        .await?;
        self.store
            .read_modify_write(
                key,
                |doc| !doc.fan_in_dispatched,
                |doc| doc.fan_in_dispatched = true,
            )
            .await?;
        Ok(())
    }

    /// Re-enqueues dispatch-joins when the gate opened but its enqueue was lost.
    ///
    /// Called from fenced redeliveries: the delivery that opened the gate
    /// failed after committing it, and its retry is the only one left.
    pub(super) async fn resume_fan_in(&self, key: &RunKey) -> Result<bool> {
        let document = self.store.load_required(key).await?;
        if !document.fan_in_opened || document.fan_in_dispatched || document.finalized {
            return Ok(false);
        }
        tracing::warn!(run_key = %key, "fan-in gate open but never dispatched, resuming");
        self.open_fan_in(key).await?;
        Ok(true)
    }

    /// Prepares the final table and enqueues a staggered join per pending shard.
    pub(super) async fn dispatch_joins(&self, key: &RunKey) -> Result<Handled> {
        let mut document = self.store.load_required(key).await?;
        if !document.fan_in_opened {
            return Ok(Handled::not_ready(format!(
                "{} tenants still running",
                document.still_running
            )));
        }

        let not_copied = document.status().not_copied;
        if !not_copied.is_empty() {
            tracing::warn!(tenants = ?not_copied, "tenants whose data was not copied");
        }

        if document.finalized {
            return self.finalized_duplicate(key).await;
        }

        if document.shard_index == 0 {
            if !self.slots.claim_empty_finalize(key).await? {
                return self.finalized_duplicate(key).await;
            }
            tracing::info!("no shard was written, finalizing directly");
            self.finalize(key).await?;
            return Ok(Handled::Completed);
        }

        if !document.destination_prepared {
            self.prepare_destination(&document).await?;
            document = self.store.load_required(key).await?;
        }

        let pending = document.pending_shards();
        let mut failed = Vec::new();
        for (position, shard) in (0u32..).zip(pending.iter().copied()) {
            let delay = self.config.join_stagger.saturating_mul(position);
            let options = if delay.is_zero() {
                EnqueueOptions::new()
            } else {
                EnqueueOptions::new().with_delay(delay)
            };
            let task = ConsolidationTask::Join {
                run_key: key.clone(),
                shard,
            };
            if let Err(e) = self.enqueue(task, options).await {
                tracing::warn!(shard, error = %e, "join enqueue failed");
                failed.push(shard);
            }
        }

        if !failed.is_empty() {
            return Err(Error::dispatch(format!(
                "failed to enqueue joins for shards {failed:?}"
            )));
        }
        tracing::info!(shards = ?pending, "joins dispatched");
        Ok(Handled::Completed)
    }

    /// Clears the partitions a reseller-wide run replaces, then records that it did.
    async fn prepare_destination(&self, document: &RunDocument) -> Result<()> {
        let table = &self.config.final_table;
        let scope = document.scope;
        if document.mode() == RunMode::ResellerWide && self.bulk.exists(table).await? {
            if scope.all_partitions && scope.from_date.is_none() {
                self.bulk.delete_table(table).await?;
                tracing::info!(table = %table, "dropped final table for full reload");
            } else {
                // Joins append, so the partitions they replace are cleared once, here.
                let removed = self.bulk.delete_rows(table, scope.window(), None).await?;
                tracing::info!(table = %table, removed, "cleared reloaded partitions");
            }
        }

        self.store
            .read_modify_write(
                &document.run_key,
                |doc| !doc.destination_prepared,
                |doc| doc.destination_prepared = true,
            )
            .await?;
        Ok(())
    }

    /// Merges one shard into the final table.
    pub(super) async fn join(&self, key: &RunKey, shard: u32, task_id: TaskId) -> Result<Handled> {
        let document = self.store.load_required(key).await?;
        if !document.destination_prepared {
            return Ok(Handled::not_ready("destination not prepared"));
        }

        let owner = task_id.to_string();
        if self.slots.mark_in_progress(key, shard, &owner).await? == SlotClaim::Duplicate {
            if self.resume_finalize(key).await? {
                return Ok(Handled::Completed);
            }
            return Ok(Handled::duplicate(format!(
                "shard {shard} already merged or merging"
            )));
        }

        let table = self.allocator.table(key, shard);
        if let Err(e) = self.merge_shard(&table).await {
            match self.slots.release(key, shard, &owner).await {
                Ok(_) => tracing::warn!(shard, error = %e, "merge failed, shard released"),
                Err(release) => tracing::error!(
                    shard,
                    error = %e,
                    release_error = %release,
                    "merge failed and the shard could not be released"
                ),
            }
            return Err(e);
        }

        let progress = self.slots.mark_done(key, shard).await?;
        tracing::info!(shard, still_to_copy = progress.still_to_copy, "shard merged");
        if progress.finalize {
            self.finalize(key).await?;
        }
        Ok(Handled::Completed)
    }

    async fn merge_shard(&self, table: &str) -> Result<()> {
        // An allocated shard whose only append failed was never created.
        if !self.bulk.exists(table).await? {
            tracing::info!(table = %table, "shard table missing, nothing to merge");
            return Ok(());
        }
        let rows = self.bulk.merge(table, &self.config.final_table).await?;
        tracing::debug!(table = %table, rows, "shard merge finished");
        Ok(())
    }

    /// Runs once per run, after the last shard merged.
    async fn finalize(&self, key: &RunKey) -> Result<()> {
        let document = self.store.load_required(key).await?;
        let scope = document.scope;

        if scope.from_date.is_none() {
            self.enqueue(
                ConsolidationTask::Aggregate {
                    run_key: key.clone(),
                },
                EnqueueOptions::new(),
            )
            .await?;
        }

        if scope.is_manual() {
            tracing::info!("manual reload, shard tables kept");
        } else {
            for shard in document.done_shards() {
                let table = self.allocator.table(key, shard);
                if let Err(e) = self.bulk.delete_table(&table).await {
                    tracing::warn!(table = %table, error = %e, "failed to drop shard table");
                }
            }
        }
        self.store
            .read_modify_write(
                key,
                |doc| !doc.aggregation_dispatched,
                |doc| doc.aggregation_dispatched = true,
            )
            .await?;
        tracing::info!(run_key = %key, "run finalized");
        Ok(())
    }

    /// Finishes a finalize whose aggregate enqueue was lost.
    pub(super) async fn resume_finalize(&self, key: &RunKey) -> Result<bool> {
        let document = self.store.load_required(key).await?;
        if !document.finalized || document.aggregation_dispatched {
            return Ok(false);
        }
        tracing::warn!(run_key = %key, "run finalized but never aggregated, resuming");
        self.finalize(key).await?;
        Ok(true)
    }

    async fn finalized_duplicate(&self, key: &RunKey) -> Result<Handled> {
        if self.resume_finalize(key).await? {
            return Ok(Handled::Completed);
        }
        Ok(Handled::duplicate("run already finalized"))
    }

    /// Rebuilds the aggregated table from the final table.
    pub(super) async fn aggregate(&self, key: &RunKey) -> Result<Handled> {
        let document = self.store.load_required(key).await?;
        if !document.finalized {
            return Ok(Handled::not_ready("run not finalized"));
        }

        let source = &self.config.final_table;
        let destination = &self.config.aggregated_table;
        if !self.bulk.exists(source).await? {
            tracing::warn!(table = %source, "final table missing, nothing to aggregate");
            return Ok(Handled::Completed);
        }
        let rows = match &document.run_key {
            RunKey::Run(_) => {
                self.bulk
                    .aggregate(
                        source,
                        destination,
                        WriteDisposition::Truncate,
                        DateWindow::All,
                        None,
                    )
                    .await?
            }
            RunKey::Tenant(tenant) => {
                let window = document.scope.window();
                self.bulk
                    .delete_rows(destination, window, Some(tenant))
                    .await?;
                self.bulk
                    .aggregate(
                        source,
                        destination,
                        WriteDisposition::Append,
                        window,
                        Some(tenant),
                    )
                    .await?
            }
        };
        tracing::info!(table = %destination, rows, "aggregation finished");
        Ok(Handled::Completed)
    }
}
