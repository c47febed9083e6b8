//! Bulk data engine abstraction.
//!
//! The consolidation protocol never touches billing rows itself. It asks a
//! [`BulkStore`] to copy a tenant's rows into a shard table, to merge shard
//! tables into the final table, and to aggregate the final table. Tables are
//! named; the engine decides what a table physically is.
//!
//! Appends are idempotent at the row level only because every append of a
//! run writes a disjoint set of rows (one tenant, one window) and each tenant
//! is appended at most once per run.

pub mod memory;

use async_trait::async_trait;
use tally_core::TenantId;

use crate::run::DateWindow;

/// Result alias for bulk operations.
pub type BulkResult<T> = std::result::Result<T, BulkError>;

/// Class of a bulk engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkErrorKind {
    /// The engine is temporarily unavailable; retry the same operation.
    Transient,
    /// The target table cannot accept more writes; retry into a new shard.
    ShardUnwritable,
    /// A table the operation needs does not exist.
    NotFound,
}

impl BulkErrorKind {
    /// Returns a stable label for logs and metrics.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::ShardUnwritable => "shard_unwritable",
            Self::NotFound => "not_found",
        }
    }
}

/// A failed bulk operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("bulk operation on {table} failed ({}): {message}", .kind.as_label())]
pub struct BulkError {
    /// Failure class.
    pub kind: BulkErrorKind,
    /// Table the operation targeted.
    pub table: String,
    /// Engine message.
    pub message: String,
}

impl BulkError {
    /// Creates a bulk error.
    #[must_use]
    pub fn new(kind: BulkErrorKind, table: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            table: table.into(),
            message: message.into(),
        }
    }

    /// Returns true if redelivering the task may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            BulkErrorKind::Transient | BulkErrorKind::ShardUnwritable
        )
    }

    /// Returns true if the caller should move to a new shard.
    #[must_use]
    pub const fn is_shard_unwritable(&self) -> bool {
        matches!(self.kind, BulkErrorKind::ShardUnwritable)
    }
}

/// How an aggregation writes its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    /// Replace the destination's contents.
    Truncate,
    /// Add to the destination.
    Append,
}

/// Executes table-level operations for the consolidation protocol.
#[async_trait]
pub trait BulkStore: Send + Sync {
    /// Copies `tenant`'s billing rows inside `window` into `table`, creating
    /// it if needed. Returns the number of rows written.
    async fn append(&self, tenant: &TenantId, table: &str, window: DateWindow) -> BulkResult<u64>;

    /// Appends every row of `source` to `destination`, creating it if needed.
    /// Returns the number of rows merged.
    async fn merge(&self, source: &str, destination: &str) -> BulkResult<u64>;

    /// Drops a table. Dropping a missing table succeeds.
    async fn delete_table(&self, table: &str) -> BulkResult<()>;

    /// Returns true if the table exists.
    async fn exists(&self, table: &str) -> BulkResult<bool>;

    /// Deletes the rows of `table` inside `window`, optionally restricted to
    /// one tenant. Deleting from a missing table succeeds.
    async fn delete_rows(
        &self,
        table: &str,
        window: DateWindow,
        tenant: Option<&TenantId>,
    ) -> BulkResult<u64>;

    /// Writes per-tenant, per-day totals of the `source` rows inside
    /// `window` (optionally one tenant's) into `destination`.
    async fn aggregate(
        &self,
        source: &str,
        destination: &str,
        disposition: WriteDisposition,
        window: DateWindow,
        tenant: Option<&TenantId>,
    ) -> BulkResult<u64>;
}
