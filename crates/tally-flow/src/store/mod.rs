//! Transactional run-document store.
//!
//! The store exposes one mutation primitive, [`StateStore::read_modify_write`]:
//! read the document and its version, evaluate a predicate, apply a mutator,
//! and write back with a `MatchesVersion` precondition. A lost race re-reads
//! and re-applies, with exponential backoff and jitter, up to a fixed attempt
//! ceiling. Beyond the ceiling the conflict surfaces as
//! [`Error::TransactionConflict`].
//!
//! No other concurrency control exists in the system.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;

use tally_core::{StorageBackend, WritePrecondition, WriteResult};

use crate::config::StateStoreConfig;
use crate::error::{Error, Result};
use crate::metrics::ConsolidationMetrics;
use crate::run::{RunDocument, RunKey};

/// Result of a read-modify-write transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rmw<T> {
    /// The predicate held; the mutation was written.
    Committed {
        /// Value returned by the mutator.
        value: T,
        /// The document as written.
        document: RunDocument,
    },
    /// The predicate did not hold; nothing was written.
    Skipped {
        /// The document as read.
        document: RunDocument,
    },
}

impl<T> Rmw<T> {
    /// Returns the document after the transaction.
    #[must_use]
    pub const fn document(&self) -> &RunDocument {
        match self {
            Self::Committed { document, .. } | Self::Skipped { document } => document,
        }
    }

    /// Returns true if the mutation was written.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Run-document store over a conditional-write storage backend.
#[derive(Clone)]
pub struct StateStore {
    storage: Arc<dyn StorageBackend>,
    config: StateStoreConfig,
    metrics: ConsolidationMetrics,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StateStore {
    /// Creates a store over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, config: StateStoreConfig) -> Self {
        Self {
            storage,
            config,
            metrics: ConsolidationMetrics::new(),
        }
    }

    /// Returns the retry policy.
    #[must_use]
    pub const fn config(&self) -> &StateStoreConfig {
        &self.config
    }

    /// Creates a run document; returns false if one already exists.
    ///
    /// # Errors
    ///
    /// Returns an error on storage or serialization failure.
    pub async fn create_run(&self, document: &RunDocument) -> Result<bool> {
        let path = document.run_key.document_path();
        let result = self
            .storage
            .put(&path, encode(document)?, WritePrecondition::DoesNotExist)
            .await?;
        Ok(result.is_success())
    }

    /// Writes a run document unconditionally, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error on storage or serialization failure.
    pub async fn replace_run(&self, document: &RunDocument) -> Result<()> {
        let path = document.run_key.document_path();
        self.storage
            .put(&path, encode(document)?, WritePrecondition::None)
            .await?;
        Ok(())
    }

    /// Loads a run document.
    ///
    /// # Errors
    ///
    /// Returns an error on storage or deserialization failure.
    pub async fn load(&self, key: &RunKey) -> Result<Option<RunDocument>> {
        let path = key.document_path();
        match self.storage.get(&path).await? {
            None => Ok(None),
            Some((data, _)) => Ok(Some(decode(&path, &data)?)),
        }
    }

    /// Loads a run document that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] if the document is missing.
    pub async fn load_required(&self, key: &RunKey) -> Result<RunDocument> {
        self.load(key).await?.ok_or_else(|| Error::RunNotFound {
            run_key: key.to_string(),
        })
    }

    /// Deletes a run document. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn delete(&self, key: &RunKey) -> Result<()> {
        self.storage.delete(&key.document_path()).await?;
        Ok(())
    }

    /// Applies `mutator` to the document if `predicate` holds.
    ///
    /// Both closures may run several times: once per attempt, always against
    /// the freshest version of the document. They must not have side effects
    /// beyond the document they are given.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] if the document is missing, and
    /// [`Error::TransactionConflict`] once the attempt ceiling is exceeded.
    pub async fn read_modify_write<T, P, M>(
        &self,
        key: &RunKey,
        predicate: P,
        mut mutator: M,
    ) -> Result<Rmw<T>>
    where
        P: Fn(&RunDocument) -> bool + Send,
        M: FnMut(&mut RunDocument) -> T + Send,
        T: Send,
    {
        let path = key.document_path();
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.backoff_base;
        let mut attempts = 0;

        loop {
            attempts += 1;

            let Some((data, version)) = self.storage.get(&path).await? else {
                return Err(Error::RunNotFound {
                    run_key: key.to_string(),
                });
            };
            let mut document = decode(&path, &data)?;

            if !predicate(&document) {
                return Ok(Rmw::Skipped { document });
            }

            let value = mutator(&mut document);
            document.updated_at = Utc::now();

            match self
                .storage
                .put(
                    &path,
                    encode(&document)?,
                    WritePrecondition::MatchesVersion(version),
                )
                .await?
            {
                WriteResult::Success { .. } => return Ok(Rmw::Committed { value, document }),
                WriteResult::PreconditionFailed { current_version } => {
                    self.metrics.record_state_conflict();
                    if attempts >= max_attempts {
                        tracing::error!(
                            key = %path,
                            attempts,
                            "state store transaction exhausted retries"
                        );
                        return Err(Error::TransactionConflict {
                            key: path,
                            attempts,
                        });
                    }
                    tracing::debug!(
                        key = %path,
                        attempts,
                        current_version = %current_version,
                        "write conflict, retrying"
                    );

                    let jitter = Duration::from_millis(rand_jitter());
                    tokio::time::sleep(backoff.min(self.config.backoff_max) + jitter).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }
}

fn encode(document: &RunDocument) -> Result<Bytes> {
    serde_json::to_vec(document)
        .map(Bytes::from)
        .map_err(|e| Error::serialization(format!("encode run document: {e}")))
}

fn decode(path: &str, data: &[u8]) -> Result<RunDocument> {
    serde_json::from_slice(data)
        .map_err(|e| Error::serialization(format!("decode run document {path}: {e}")))
}

/// Generates random jitter for backoff (0-10ms).
fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 10
}
