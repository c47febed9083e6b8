//! # tally-flow
//!
//! Fan-out/fan-in coordination that consolidates per-tenant billing data
//! into one reseller-wide table.
//!
//! A run enumerates tenants, appends each tenant's rows into a small number
//! of shard tables in parallel, then merges the shards into the final table
//! and rebuilds the aggregated table. Tasks are delivered at least once by
//! an external queue; a single JSON run document, mutated only through
//! optimistic read-modify-write transactions, fences every duplicate.
//!
//! ## Core Concepts
//!
//! - **Run document** ([`run::RunDocument`]): counters, per-tenant records,
//!   shard slots and one-way phase flags for one run
//! - **State store** ([`store::StateStore`]): the only way to mutate a run
//! - **Task state machine** ([`task`], [`lifecycle`]): per-tenant transitions
//! - **Shards** ([`shard`]): the table each append writes into, and the slot
//!   that fences each shard's merge
//! - **Coordinator** ([`coordinator::Coordinator`]): the protocol itself
//!
//! ## Guarantees
//!
//! - The fan-in gate opens exactly once per run
//! - Each tenant's rows are appended at most once per run
//! - Each shard is merged at most once, and the run finalizes exactly once
//! - A tenant that keeps failing is given up on so the run still converges
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tally_core::{MemoryBackend, TenantId};
//! use tally_flow::bulk::memory::InMemoryBulkStore;
//! use tally_flow::config::ConsolidatorConfig;
//! use tally_flow::coordinator::{Coordinator, StartRequest};
//! use tally_flow::dispatch::memory::InMemoryTaskQueue;
//! use tally_flow::reporter::TracingTaskReporter;
//! use tally_flow::tenants::StaticTenantDirectory;
//!
//! # async fn example() -> tally_flow::error::Result<()> {
//! let queue = Arc::new(InMemoryTaskQueue::new("consolidation"));
//! let coordinator = Coordinator::new(
//!     ConsolidatorConfig::from_env()?,
//!     Arc::new(MemoryBackend::new()),
//!     queue.clone(),
//!     Arc::new(InMemoryBulkStore::default()),
//!     Arc::new(TracingTaskReporter),
//!     Arc::new(StaticTenantDirectory::new([TenantId::new("acme")?])),
//! );
//!
//! coordinator.start(StartRequest::default()).await?;
//! while let Some(entry) = queue.take()? {
//!     coordinator.execute(&entry.envelope).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod bulk;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod reporter;
pub mod run;
pub mod shard;
pub mod store;
pub mod task;
pub mod tenants;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bulk::{BulkError, BulkErrorKind, BulkStore, WriteDisposition};
    pub use crate::config::{ConsolidatorConfig, StateStoreConfig};
    pub use crate::coordinator::{Coordinator, Handled, StartRequest, StartSummary};
    pub use crate::dispatch::{ConsolidationTask, EnqueueOptions, TaskEnvelope, TaskQueue};
    pub use crate::error::{Error, Result};
    pub use crate::reporter::{Stage, TaskReport, TaskReporter, TaskStatus};
    pub use crate::run::{ConsolidationScope, DateWindow, RunDocument, RunKey, RunMode, RunStatus};
    pub use crate::task::{Outcome, TaskState, TenantTask};
    pub use crate::tenants::{StaticTenantDirectory, TenantDirectory};
}

pub use coordinator::Coordinator;
pub use error::{Error, Result};
