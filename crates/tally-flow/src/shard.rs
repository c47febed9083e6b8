//! Shard allocation and shard-slot bookkeeping.
//!
//! Appends land in the run's *current* shard. The allocator only moves on to
//! a new shard when a caller reports that the current one became unwritable,
//! which keeps the number of shards, and therefore join tasks, small.
//!
//! Each shard has a slot in the run document that fences its join: a join
//! claims the slot, merges, and marks it done. The join that marks the last
//! slot done is the one that finalizes the run.

use chrono::Utc;

use crate::error::{Error, Result};
use crate::run::{RunDocument, RunKey, ShardSlot};
use crate::store::{Rmw, StateStore};

/// Returns the physical table name of a shard.
///
/// Distinct suffixes (run IDs or tenant IDs) or distinct indices always give
/// distinct names.
#[must_use]
pub fn shard_name(prefix: &str, suffix: &str, index: u32) -> String {
    format!("{prefix}_{suffix}_{index}")
}

/// A shard a caller may append into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLease {
    /// Shard index (1-based).
    pub index: u32,
    /// Physical table name.
    pub table: String,
}

/// Hands out shard indices.
#[derive(Debug, Clone)]
pub struct ShardAllocator {
    store: StateStore,
    prefix: String,
}

impl ShardAllocator {
    /// Creates an allocator naming tables with `prefix`.
    #[must_use]
    pub fn new(store: StateStore, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Returns the table name of shard `index` of the run.
    #[must_use]
    pub fn table(&self, key: &RunKey, index: u32) -> String {
        shard_name(&self.prefix, &key.table_suffix(), index)
    }

    /// Returns the shard to write into.
    ///
    /// - `hint == None`: the current shard (shard 1 is allocated lazily).
    /// - `hint == Some(current)`: the caller found the current shard
    ///   unwritable; a new shard is allocated.
    /// - any other hint is stale: another caller already moved on, so the
    ///   current shard is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is missing or the store fails.
    pub async fn current_or_next(&self, key: &RunKey, hint: Option<u32>) -> Result<ShardLease> {
        let result = self
            .store
            .read_modify_write(
                key,
                |doc| doc.shard_index == 0 || hint == Some(doc.shard_index),
                |doc| {
                    doc.shard_index += 1;
                    doc.shard_index
                },
            )
            .await?;

        let index = match result {
            Rmw::Committed { value, .. } => {
                tracing::info!(run_key = %key, shard = value, "allocated shard");
                value
            }
            Rmw::Skipped { document } => document.shard_index,
        };
        Ok(ShardLease {
            index,
            table: self.table(key, index),
        })
    }
}

/// Result of claiming a shard slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotClaim {
    /// The caller owns the merge.
    Claimed,
    /// The shard is already merged or being merged.
    Duplicate,
}

/// Progress after marking a shard merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeProgress {
    /// Shards still to merge.
    pub still_to_copy: u32,
    /// True only for the call that merged the last shard.
    pub finalize: bool,
}

/// Shard-slot transitions.
#[derive(Debug, Clone)]
pub struct ShardAssignment {
    store: StateStore,
}

impl ShardAssignment {
    /// Creates the slot bookkeeping over `store`.
    #[must_use]
    pub const fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Claims the slot of shard `index` for `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the shard was never allocated.
    pub async fn mark_in_progress(
        &self,
        key: &RunKey,
        index: u32,
        owner: &str,
    ) -> Result<SlotClaim> {
        let result = self
            .store
            .read_modify_write(
                key,
                |doc| allocated(doc, index) && !doc.shard_assignment.contains_key(&index),
                |doc| {
                    doc.shard_assignment.insert(
                        index,
                        ShardSlot::Merging {
                            owner: owner.to_string(),
                            since: Utc::now(),
                        },
                    );
                },
            )
            .await?;

        match result {
            Rmw::Committed { .. } => Ok(SlotClaim::Claimed),
            Rmw::Skipped { document } if !allocated(&document, index) => {
                Err(Error::invalid_request(format!(
                    "shard {index} was never allocated (highest is {})",
                    document.shard_index
                )))
            }
            Rmw::Skipped { .. } => Ok(SlotClaim::Duplicate),
        }
    }

    /// Releases a claim after a failed merge so a redelivery can retry.
    ///
    /// Only the owner's claim is released. Returns true if a claim was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is missing or the store fails.
    pub async fn release(&self, key: &RunKey, index: u32, owner: &str) -> Result<bool> {
        let result = self
            .store
            .read_modify_write(
                key,
                |doc| {
                    matches!(
                        doc.shard_assignment.get(&index),
                        Some(ShardSlot::Merging { owner: current, .. }) if current == owner
                    )
                },
                |doc| {
                    doc.shard_assignment.remove(&index);
                },
            )
            .await?;
        Ok(result.is_committed())
    }

    /// Marks shard `index` merged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the shard was never allocated.
    pub async fn mark_done(&self, key: &RunKey, index: u32) -> Result<MergeProgress> {
        let result = self
            .store
            .read_modify_write(
                key,
                |doc| {
                    allocated(doc, index)
                        && doc.shard_assignment.get(&index) != Some(&ShardSlot::Done)
                },
                |doc| {
                    doc.shard_assignment.insert(index, ShardSlot::Done);
                    let still_to_copy = doc.still_to_copy();
                    let finalize = still_to_copy == 0 && !doc.finalized;
                    if finalize {
                        doc.finalized = true;
                    }
                    MergeProgress {
                        still_to_copy,
                        finalize,
                    }
                },
            )
            .await?;

        match result {
            Rmw::Committed { value, .. } => Ok(value),
            Rmw::Skipped { document } if !allocated(&document, index) => Err(
                Error::invalid_request(format!("shard {index} was never allocated")),
            ),
            Rmw::Skipped { document } => Ok(MergeProgress {
                still_to_copy: document.still_to_copy(),
                finalize: false,
            }),
        }
    }

    /// Claims the finalize step of a run that allocated no shards.
    ///
    /// Returns true for exactly one caller, and only once the gate is open.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is missing or the store fails.
    pub async fn claim_empty_finalize(&self, key: &RunKey) -> Result<bool> {
        let result = self
            .store
            .read_modify_write(
                key,
                |doc| doc.fan_in_opened && doc.shard_index == 0 && !doc.finalized,
                |doc| doc.finalized = true,
            )
            .await?;
        Ok(result.is_committed())
    }
}

const fn allocated(doc: &RunDocument, index: u32) -> bool {
    index >= 1 && index <= doc.shard_index
}
