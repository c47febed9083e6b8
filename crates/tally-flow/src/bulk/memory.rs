//! In-memory bulk engine for tests and local runs.
//!
//! Tables are vectors of [`BillingRow`]s. Source billing data is seeded per
//! tenant. Failures can be injected per tenant (appends) or per table (every
//! other operation) to exercise retry, reallocation and abandonment paths.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tally_core::TenantId;

use super::{BulkError, BulkErrorKind, BulkResult, BulkStore, WriteDisposition};
use crate::run::DateWindow;

/// One billing line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingRow {
    /// Owning tenant.
    pub tenant: TenantId,
    /// Usage day (the partition).
    pub date: NaiveDate,
    /// Cost in micro-units.
    pub cost_micros: i64,
}

impl BillingRow {
    /// Creates a row.
    #[must_use]
    pub const fn new(tenant: TenantId, date: NaiveDate, cost_micros: i64) -> Self {
        Self {
            tenant,
            date,
            cost_micros,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct InjectedFailure {
    kind: BulkErrorKind,
    remaining: u32,
}

#[derive(Debug, Default)]
struct EngineState {
    sources: HashMap<TenantId, Vec<BillingRow>>,
    tables: BTreeMap<String, Vec<BillingRow>>,
    append_failures: HashMap<TenantId, InjectedFailure>,
    table_failures: HashMap<String, InjectedFailure>,
    appends: HashMap<TenantId, u32>,
    merges: HashMap<String, u32>,
}

impl EngineState {
    fn take_failure<K: Hash + Eq>(
        failures: &mut HashMap<K, InjectedFailure>,
        key: &K,
    ) -> Option<BulkErrorKind> {
        let failure = failures.get_mut(key)?;
        if failure.remaining == 0 {
            return None;
        }
        failure.remaining -= 1;
        Some(failure.kind)
    }

    fn check_table(&mut self, table: &str) -> BulkResult<()> {
        match Self::take_failure(&mut self.table_failures, &table.to_string()) {
            Some(kind) => Err(BulkError::new(kind, table, "injected failure")),
            None => Ok(()),
        }
    }
}

/// In-memory [`BulkStore`].
#[derive(Debug)]
pub struct InMemoryBulkStore {
    current_partition: NaiveDate,
    state: RwLock<EngineState>,
}

impl Default for InMemoryBulkStore {
    fn default() -> Self {
        Self::new(Utc::now().date_naive())
    }
}

fn poison_err<T>(_: PoisonError<T>) -> BulkError {
    BulkError::new(BulkErrorKind::Transient, "*", "bulk engine lock poisoned")
}

impl InMemoryBulkStore {
    /// Creates an empty engine whose incremental partition is `current_partition`.
    #[must_use]
    pub fn new(current_partition: NaiveDate) -> Self {
        Self {
            current_partition,
            state: RwLock::new(EngineState::default()),
        }
    }

    /// Adds source billing rows for a tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn seed(&self, tenant: &TenantId, rows: &[(NaiveDate, i64)]) -> BulkResult<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.sources.entry(tenant.clone()).or_default().extend(
            rows.iter()
                .map(|&(date, cost)| BillingRow::new(tenant.clone(), date, cost)),
        );
        Ok(())
    }

    /// Creates (or replaces) a table with the given rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn create_table(&self, table: &str, rows: Vec<BillingRow>) -> BulkResult<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.tables.insert(table.to_string(), rows);
        Ok(())
    }

    /// Makes the next `times` appends of `tenant` fail with `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn fail_appends(&self, tenant: &TenantId, kind: BulkErrorKind, times: u32) -> BulkResult<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.append_failures.insert(
            tenant.clone(),
            InjectedFailure {
                kind,
                remaining: times,
            },
        );
        Ok(())
    }

    /// Makes the next `times` operations touching `table` fail with `kind`.
    ///
    /// Appends match on the target table, merges on the source table.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn fail_table(&self, table: &str, kind: BulkErrorKind, times: u32) -> BulkResult<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.table_failures.insert(
            table.to_string(),
            InjectedFailure {
                kind,
                remaining: times,
            },
        );
        Ok(())
    }

    /// Returns a copy of a table's rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn rows(&self, table: &str) -> BulkResult<Option<Vec<BillingRow>>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.tables.get(table).cloned())
    }

    /// Returns the names of every table, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn table_names(&self) -> BulkResult<Vec<String>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.tables.keys().cloned().collect())
    }

    /// Returns the sum of `cost_micros` over a table (0 if missing).
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn total_cost(&self, table: &str) -> BulkResult<i64> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .tables
            .get(table)
            .map_or(0, |rows| rows.iter().map(|r| r.cost_micros).sum()))
    }

    /// Returns how many appends of `tenant` succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn append_count(&self, tenant: &TenantId) -> BulkResult<u32> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.appends.get(tenant).copied().unwrap_or(0))
    }

    /// Returns how many merges out of `source` succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn merge_count(&self, source: &str) -> BulkResult<u32> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.merges.get(source).copied().unwrap_or(0))
    }
}

#[async_trait]
impl BulkStore for InMemoryBulkStore {
    async fn append(&self, tenant: &TenantId, table: &str, window: DateWindow) -> BulkResult<u64> {
        let mut state = self.state.write().map_err(poison_err)?;
        if let Some(kind) = EngineState::take_failure(&mut state.append_failures, tenant) {
            return Err(BulkError::new(kind, table, format!("injected failure for {tenant}")));
        }
        state.check_table(table)?;

        let current = self.current_partition;
        let rows: Vec<BillingRow> = state
            .sources
            .get(tenant)
            .map(|rows| {
                rows.iter()
                    .filter(|r| window.contains(r.date, current))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let count = rows.len() as u64;
        state.tables.entry(table.to_string()).or_default().extend(rows);
        *state.appends.entry(tenant.clone()).or_default() += 1;
        Ok(count)
    }

    async fn merge(&self, source: &str, destination: &str) -> BulkResult<u64> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_table(source)?;
        let rows = state
            .tables
            .get(source)
            .cloned()
            .ok_or_else(|| BulkError::new(BulkErrorKind::NotFound, source, "no such table"))?;
        let count = rows.len() as u64;
        state
            .tables
            .entry(destination.to_string())
            .or_default()
            .extend(rows);
        *state.merges.entry(source.to_string()).or_default() += 1;
        Ok(count)
    }

    async fn delete_table(&self, table: &str) -> BulkResult<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_table(table)?;
        state.tables.remove(table);
        Ok(())
    }

    async fn exists(&self, table: &str) -> BulkResult<bool> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.tables.contains_key(table))
    }

    async fn delete_rows(
        &self,
        table: &str,
        window: DateWindow,
        tenant: Option<&TenantId>,
    ) -> BulkResult<u64> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_table(table)?;
        let current = self.current_partition;
        let Some(rows) = state.tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| {
            !(window.contains(r.date, current) && tenant.map_or(true, |t| &r.tenant == t))
        });
        Ok((before - rows.len()) as u64)
    }

    async fn aggregate(
        &self,
        source: &str,
        destination: &str,
        disposition: WriteDisposition,
        window: DateWindow,
        tenant: Option<&TenantId>,
    ) -> BulkResult<u64> {
        let current = self.current_partition;
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_table(destination)?;
        let rows = state
            .tables
            .get(source)
            .ok_or_else(|| BulkError::new(BulkErrorKind::NotFound, source, "no such table"))?;

        let mut totals: BTreeMap<(TenantId, NaiveDate), i64> = BTreeMap::new();
        for row in rows
            .iter()
            .filter(|r| window.contains(r.date, current))
            .filter(|r| tenant.map_or(true, |t| &r.tenant == t))
        {
            *totals.entry((row.tenant.clone(), row.date)).or_default() += row.cost_micros;
        }
        let aggregated: Vec<BillingRow> = totals
            .into_iter()
            .map(|((tenant, date), cost)| BillingRow::new(tenant, date, cost))
            .collect();
        let count = aggregated.len() as u64;

        let target = state.tables.entry(destination.to_string()).or_default();
        if disposition == WriteDisposition::Truncate {
            target.clear();
        }
        target.extend(aggregated);
        Ok(count)
    }
}
