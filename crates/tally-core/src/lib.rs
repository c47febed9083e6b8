//! # tally-core
//!
//! Shared primitives for the tally billing consolidation service.
//!
//! This crate provides the foundational types and traits used by the
//! coordination layer:
//!
//! - **Identifiers**: Strongly-typed run, task and tenant IDs
//! - **Storage**: Conditional-write object storage contract (the basis of every
//!   optimistic-concurrency transaction in `tally-flow`)
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialisation and span helpers
//!
//! ## Example
//!
//! ```rust
//! use tally_core::prelude::*;
//!
//! let tenant = TenantId::new("billing-account-01").unwrap();
//! let run = RunId::generate();
//! assert_eq!(tenant.table_suffix(), "billing_account_01");
//! assert_eq!(run.table_suffix(), run.to_string().to_lowercase());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
#[cfg(feature = "gcp")]
pub mod gcs;
pub mod id;
pub mod observability;
pub mod storage;
pub mod tenant;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use tally_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{RunId, TaskId};
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
    pub use crate::tenant::TenantId;
}

pub use error::{Error, Result};
pub use id::{RunId, TaskId};
pub use observability::{LogFormat, consolidation_span, init_logging};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
pub use tenant::TenantId;
