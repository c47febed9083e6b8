//! The run document: one per consolidation invocation.
//!
//! A run document holds everything the protocol coordinates on: the fan-in
//! counters, the per-tenant task records, and the shard bookkeeping. It is only
//! ever mutated inside a [`StateStore`](crate::store::StateStore) transaction.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{RunId, TenantId};

use crate::error::{Error, Result};
use crate::task::{TaskState, TenantTask};

/// How a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Every eligible tenant is consolidated; shards are namespaced by run ID.
    ResellerWide,
    /// One tenant is reloaded; shards are namespaced by the tenant ID.
    SingleTenant,
}

/// Key of a run document.
///
/// Reseller-wide runs are keyed by their run ID. Single-tenant reloads are
/// keyed by the tenant, so a second reload of the same tenant replaces the
/// first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RunKey {
    /// A reseller-wide run.
    Run(RunId),
    /// A single-tenant reload.
    Tenant(TenantId),
}

impl RunKey {
    /// Returns the storage path of the run document.
    #[must_use]
    pub fn document_path(&self) -> String {
        match self {
            Self::Run(id) => format!("runs/{id}.json"),
            Self::Tenant(tenant) => format!("tenants/{tenant}.json"),
        }
    }

    /// Returns the suffix that namespaces this run's shard tables.
    #[must_use]
    pub fn table_suffix(&self) -> String {
        match self {
            Self::Run(id) => id.table_suffix(),
            Self::Tenant(tenant) => tenant.table_suffix(),
        }
    }

    /// Returns the mode implied by the key.
    #[must_use]
    pub const fn mode(&self) -> RunMode {
        match self {
            Self::Run(_) => RunMode::ResellerWide,
            Self::Tenant(_) => RunMode::SingleTenant,
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(id) => write!(f, "run:{id}"),
            Self::Tenant(tenant) => write!(f, "tenant:{tenant}"),
        }
    }
}

impl FromStr for RunKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some(("run", id)) => Ok(Self::Run(id.parse()?)),
            Some(("tenant", id)) => Ok(Self::Tenant(id.parse()?)),
            _ => Err(Error::invalid_request(format!(
                "run key must be 'run:<id>' or 'tenant:<id>', got '{s}'"
            ))),
        }
    }
}

impl TryFrom<String> for RunKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RunKey> for String {
    fn from(value: RunKey) -> Self {
        value.to_string()
    }
}

/// The date range a run touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateWindow {
    /// Every partition.
    All,
    /// Partitions on or after the date.
    Since(NaiveDate),
    /// Exactly one partition.
    On(NaiveDate),
    /// `days` partitions starting at `start`.
    Between {
        /// First partition.
        start: NaiveDate,
        /// Number of partitions.
        days: u32,
    },
    /// The engine's current (incremental) partition.
    Current,
}

impl DateWindow {
    /// Returns true if `date` falls inside the window.
    ///
    /// `current` is the engine's current partition, used by [`DateWindow::Current`].
    #[must_use]
    pub fn contains(&self, date: NaiveDate, current: NaiveDate) -> bool {
        match *self {
            Self::All => true,
            Self::Since(start) => date >= start,
            Self::On(day) => date == day,
            Self::Between { start, days } => {
                date >= start && date < start + Duration::days(i64::from(days))
            }
            Self::Current => date == current,
        }
    }

    /// Renders the window as a partition filter on `column`.
    #[must_use]
    pub fn filter_expression(&self, column: &str) -> String {
        match self {
            Self::All => "TRUE".to_string(),
            Self::Since(start) => format!("DATE({column}) >= '{start}'"),
            Self::On(day) => format!("DATE({column}) = '{day}'"),
            Self::Between { start, days } => format!(
                "DATE({column}) >= '{start}' AND DATE({column}) < DATE_ADD('{start}', INTERVAL {days} DAY)"
            ),
            Self::Current => format!("DATE({column}) = CURRENT_DATE()"),
        }
    }
}

/// Which partitions a run reloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationScope {
    /// Reload every partition.
    #[serde(default)]
    pub all_partitions: bool,
    /// Reload from this date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_date: Option<NaiveDate>,
    /// Number of partitions from `from_date` (0 = open ended).
    #[serde(default)]
    pub num_partitions: u32,
}

impl ConsolidationScope {
    /// The daily incremental scope.
    #[must_use]
    pub const fn incremental() -> Self {
        Self {
            all_partitions: false,
            from_date: None,
            num_partitions: 0,
        }
    }

    /// A full reload of every partition.
    #[must_use]
    pub const fn full_reload() -> Self {
        Self {
            all_partitions: true,
            from_date: None,
            num_partitions: 0,
        }
    }

    /// A reload starting at `date`.
    #[must_use]
    pub const fn from_date(date: NaiveDate, num_partitions: u32) -> Self {
        Self {
            all_partitions: false,
            from_date: Some(date),
            num_partitions,
        }
    }

    /// Checks that the scope is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns an error if `num_partitions` is set without a `from_date`.
    pub fn validate(&self) -> Result<()> {
        if self.num_partitions > 0 && self.from_date.is_none() {
            return Err(Error::invalid_request(
                "numPartitions requires fromDate".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the date window the scope covers. `all_partitions` wins.
    #[must_use]
    pub fn window(&self) -> DateWindow {
        if self.all_partitions {
            return DateWindow::All;
        }
        match (self.from_date, self.num_partitions) {
            (Some(date), 0) => DateWindow::Since(date),
            (Some(date), 1) => DateWindow::On(date),
            (Some(start), days) => DateWindow::Between { start, days },
            (None, _) => DateWindow::Current,
        }
    }

    /// Returns true for operator-initiated reloads.
    ///
    /// Shard tables of manual reloads are kept after the merge.
    #[must_use]
    pub const fn is_manual(&self) -> bool {
        self.all_partitions || self.from_date.is_some()
    }
}

/// State of one shard slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ShardSlot {
    /// A join task is merging the shard.
    Merging {
        /// Identity of the join task that claimed the slot.
        owner: String,
        /// When the slot was claimed.
        since: DateTime<Utc>,
    },
    /// The shard has been merged into the final table.
    Done,
}

/// Post-transaction fan-in counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    /// Tenants not yet terminal.
    pub still_running: u32,
    /// Tenants that reached a terminal state.
    pub processed: u32,
}

/// The persisted run document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDocument {
    /// Document key.
    pub run_key: RunKey,
    /// Unique ID of this invocation.
    pub run_id: RunId,
    /// Scope of the reload.
    pub scope: ConsolidationScope,
    /// Tenants not yet terminal.
    pub still_running: u32,
    /// Tenants that reached a terminal state.
    pub processed: u32,
    /// Highest shard index allocated so far (0 = none).
    pub shard_index: u32,
    /// Per-tenant task records.
    #[serde(default)]
    pub tasks: BTreeMap<TenantId, TenantTask>,
    /// Shard index to slot state.
    #[serde(default)]
    pub shard_assignment: BTreeMap<u32, ShardSlot>,
    /// Set once, by the transaction that drives `still_running` to zero.
    #[serde(default)]
    pub fan_in_opened: bool,
    /// Set once the dispatch-joins task has been enqueued.
    #[serde(default)]
    pub fan_in_dispatched: bool,
    /// Set once the final table has been prepared for the merge.
    #[serde(default)]
    pub destination_prepared: bool,
    /// Set once, by the join that merges the last shard.
    #[serde(default)]
    pub finalized: bool,
    /// Set once finalize has enqueued the aggregate task (or needed none).
    #[serde(default)]
    pub aggregation_dispatched: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl RunDocument {
    /// Creates the document for a reseller-wide run over `tenants`.
    ///
    /// Every tenant starts in [`TaskState::NotStarted`].
    #[must_use]
    pub fn reseller_wide(
        run_id: RunId,
        scope: ConsolidationScope,
        tenants: impl IntoIterator<Item = TenantId>,
    ) -> Self {
        let tasks: BTreeMap<_, _> = tenants
            .into_iter()
            .map(|tenant| (tenant, TenantTask::default()))
            .collect();
        Self::with_tasks(RunKey::Run(run_id), run_id, scope, tasks)
    }

    /// Creates the document for a single-tenant reload.
    #[must_use]
    pub fn single_tenant(tenant: TenantId, scope: ConsolidationScope) -> Self {
        let mut tasks = BTreeMap::new();
        tasks.insert(tenant.clone(), TenantTask::default());
        Self::with_tasks(RunKey::Tenant(tenant), RunId::generate(), scope, tasks)
    }

    fn with_tasks(
        run_key: RunKey,
        run_id: RunId,
        scope: ConsolidationScope,
        tasks: BTreeMap<TenantId, TenantTask>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_key,
            run_id,
            scope,
            still_running: u32::try_from(tasks.len()).unwrap_or(u32::MAX),
            processed: 0,
            shard_index: 0,
            tasks,
            shard_assignment: BTreeMap::new(),
            fan_in_opened: false,
            fan_in_dispatched: false,
            destination_prepared: false,
            finalized: false,
            aggregation_dispatched: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the run mode.
    #[must_use]
    pub const fn mode(&self) -> RunMode {
        self.run_key.mode()
    }

    /// Returns the current counters.
    #[must_use]
    pub const fn counters(&self) -> Counters {
        Counters {
            still_running: self.still_running,
            processed: self.processed,
        }
    }

    /// Returns the tenant's record, if the tenant is part of the run.
    #[must_use]
    pub fn task(&self, tenant: &TenantId) -> Option<&TenantTask> {
        self.tasks.get(tenant)
    }

    /// Shard indices not yet merged, in ascending order.
    #[must_use]
    pub fn pending_shards(&self) -> Vec<u32> {
        (1..=self.shard_index)
            .filter(|idx| self.shard_assignment.get(idx) != Some(&ShardSlot::Done))
            .collect()
    }

    /// Shard indices already merged, in ascending order.
    #[must_use]
    pub fn done_shards(&self) -> Vec<u32> {
        self.shard_assignment
            .iter()
            .filter(|(_, slot)| **slot == ShardSlot::Done)
            .map(|(idx, _)| *idx)
            .collect()
    }

    /// Number of allocated shards not yet merged.
    #[must_use]
    pub fn still_to_copy(&self) -> u32 {
        let done = u32::try_from(self.done_shards().len()).unwrap_or(u32::MAX);
        self.shard_index.saturating_sub(done)
    }

    /// Returns an operator-facing snapshot.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        let mut by_state: BTreeMap<TaskState, u32> = BTreeMap::new();
        for task in self.tasks.values() {
            *by_state.entry(task.state).or_default() += 1;
        }
        RunStatus {
            run_key: self.run_key.clone(),
            run_id: self.run_id,
            mode: self.mode(),
            scope: self.scope,
            counters: self.counters(),
            tasks_by_state: by_state,
            not_copied: self
                .tasks
                .iter()
                .filter(|(_, task)| task.state == TaskState::Processed && !task.data_copied)
                .map(|(tenant, _)| tenant.clone())
                .collect(),
            shard_index: self.shard_index,
            pending_shards: self.pending_shards(),
            fan_in_opened: self.fan_in_opened,
            fan_in_dispatched: self.fan_in_dispatched,
            destination_prepared: self.destination_prepared,
            finalized: self.finalized,
            aggregation_dispatched: self.aggregation_dispatched,
        }
    }
}

/// Operator-facing summary of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    /// Document key.
    pub run_key: RunKey,
    /// Run ID.
    pub run_id: RunId,
    /// Run mode.
    pub mode: RunMode,
    /// Reload scope.
    pub scope: ConsolidationScope,
    /// Fan-in counters.
    pub counters: Counters,
    /// Tenant count per state.
    pub tasks_by_state: BTreeMap<TaskState, u32>,
    /// Terminal tenants whose rows never reached a shard.
    pub not_copied: Vec<TenantId>,
    /// Highest allocated shard index.
    pub shard_index: u32,
    /// Shards not yet merged.
    pub pending_shards: Vec<u32>,
    /// Whether the fan-in gate has opened.
    pub fan_in_opened: bool,
    /// Whether the dispatch-joins task was enqueued.
    pub fan_in_dispatched: bool,
    /// Whether the final table was prepared.
    pub destination_prepared: bool,
    /// Whether the finalize step fired.
    pub finalized: bool,
    /// Whether finalize enqueued its aggregate task.
    pub aggregation_dispatched: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn run_key_roundtrips() {
        let run = RunKey::Run(RunId::generate());
        assert_eq!(run.to_string().parse::<RunKey>().unwrap(), run);

        let single = RunKey::Tenant(tenant("ab-cd"));
        assert_eq!(single.to_string(), "tenant:ab-cd");
        assert_eq!("tenant:ab-cd".parse::<RunKey>().unwrap(), single);

        assert!("bogus".parse::<RunKey>().is_err());
        assert!("run:not-a-ulid".parse::<RunKey>().is_err());
    }

    #[test]
    fn run_key_paths_and_suffixes() {
        let single = RunKey::Tenant(tenant("ab-cd"));
        assert_eq!(single.document_path(), "tenants/ab-cd.json");
        assert_eq!(single.table_suffix(), "ab_cd");
        assert_eq!(single.mode(), RunMode::SingleTenant);

        let id = RunId::generate();
        let run = RunKey::Run(id);
        assert_eq!(run.document_path(), format!("runs/{id}.json"));
        assert_eq!(run.table_suffix(), id.table_suffix());
    }

    #[test]
    fn scope_windows() {
        assert_eq!(ConsolidationScope::full_reload().window(), DateWindow::All);
        assert_eq!(
            ConsolidationScope::incremental().window(),
            DateWindow::Current
        );
        let d = date("2024-03-01");
        assert_eq!(
            ConsolidationScope::from_date(d, 0).window(),
            DateWindow::Since(d)
        );
        assert_eq!(
            ConsolidationScope::from_date(d, 1).window(),
            DateWindow::On(d)
        );
        assert_eq!(
            ConsolidationScope::from_date(d, 3).window(),
            DateWindow::Between { start: d, days: 3 }
        );
    }

    #[test]
    fn between_window_is_half_open() {
        let window = DateWindow::Between {
            start: date("2024-03-01"),
            days: 3,
        };
        let today = date("2024-06-01");
        assert!(window.contains(date("2024-03-01"), today));
        assert!(window.contains(date("2024-03-03"), today));
        assert!(!window.contains(date("2024-03-04"), today));
        assert!(!window.contains(date("2024-02-29"), today));
    }

    #[test]
    fn filter_expression_matches_window() {
        let window = DateWindow::Between {
            start: date("2019-01-01"),
            days: 3,
        };
        assert_eq!(
            window.filter_expression("export_time"),
            "DATE(export_time) >= '2019-01-01' AND DATE(export_time) < DATE_ADD('2019-01-01', INTERVAL 3 DAY)"
        );
    }

    #[test]
    fn scope_validation() {
        let bad = ConsolidationScope {
            num_partitions: 2,
            ..ConsolidationScope::incremental()
        };
        assert!(bad.validate().is_err());
        assert!(ConsolidationScope::incremental().validate().is_ok());
        assert!(!ConsolidationScope::incremental().is_manual());
        assert!(ConsolidationScope::full_reload().is_manual());
    }

    #[test]
    fn new_reseller_document_counts_tenants() {
        let doc = RunDocument::reseller_wide(
            RunId::generate(),
            ConsolidationScope::incremental(),
            [tenant("a"), tenant("b"), tenant("c")],
        );
        assert_eq!(doc.still_running, 3);
        assert_eq!(doc.processed, 0);
        assert_eq!(doc.shard_index, 0);
        assert!(
            doc.tasks
                .values()
                .all(|task| task.state == TaskState::NotStarted)
        );
    }

    #[test]
    fn shard_progress_helpers() {
        let mut doc = RunDocument::single_tenant(tenant("a"), ConsolidationScope::incremental());
        doc.shard_index = 3;
        doc.shard_assignment.insert(2, ShardSlot::Done);
        doc.shard_assignment.insert(
            3,
            ShardSlot::Merging {
                owner: "t1".into(),
                since: Utc::now(),
            },
        );
        assert_eq!(doc.pending_shards(), vec![1, 3]);
        assert_eq!(doc.done_shards(), vec![2]);
        assert_eq!(doc.still_to_copy(), 2);
    }

    #[test]
    fn document_serializes_with_integer_shard_keys() {
        let mut doc = RunDocument::reseller_wide(
            RunId::generate(),
            ConsolidationScope::full_reload(),
            [tenant("a")],
        );
        doc.shard_index = 1;
        doc.shard_assignment.insert(1, ShardSlot::Done);
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"stillRunning\":1"));
        let back: RunDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }
}
