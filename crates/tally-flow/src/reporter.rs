//! Task outcome reporting.
//!
//! Every handled task produces one [`TaskReport`]. Duplicate deliveries are
//! reported as [`TaskStatus::NonAlertingTermination`]: they are expected
//! under at-least-once delivery and must never page anyone.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;

use tally_core::{TaskId, TenantId};

use crate::run::RunKey;

/// Protocol stage a report comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Run initialization and append fan-out.
    Start,
    /// Per-tenant append.
    Append,
    /// Destination preparation and join fan-out.
    DispatchJoins,
    /// Per-shard merge.
    Join,
    /// Final aggregation.
    Aggregate,
}

impl Stage {
    /// Returns a stable label.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Append => "append",
            Self::DispatchJoins => "dispatch_joins",
            Self::Join => "join",
            Self::Aggregate => "aggregate",
        }
    }
}

/// Reported outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The task did its work.
    Success,
    /// The task failed; alerting applies.
    Failed,
    /// The task stopped without doing work, and that is expected.
    NonAlertingTermination,
}

impl TaskStatus {
    /// Returns a stable label.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::NonAlertingTermination => "non_alerting_termination",
        }
    }
}

/// One task outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    /// Delivered task, if the report comes from a task.
    pub task_id: Option<TaskId>,
    /// Run the task belongs to.
    pub run_key: RunKey,
    /// Tenant, for per-tenant stages.
    pub tenant: Option<TenantId>,
    /// Stage.
    pub stage: Stage,
    /// Outcome.
    pub status: TaskStatus,
    /// Error text for failures and terminations.
    pub error: Option<String>,
}

impl TaskReport {
    /// Creates a report without tenant or error.
    #[must_use]
    pub const fn new(
        task_id: Option<TaskId>,
        run_key: RunKey,
        stage: Stage,
        status: TaskStatus,
    ) -> Self {
        Self {
            task_id,
            run_key,
            tenant: None,
            stage,
            status,
            error: None,
        }
    }

    /// Sets the tenant.
    #[must_use]
    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    /// Sets the error text.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Sink for task reports. Reporting never fails the task.
#[async_trait]
pub trait TaskReporter: Send + Sync {
    /// Records a report.
    async fn report(&self, report: TaskReport);
}

/// Reporter that emits structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTaskReporter;

#[async_trait]
impl TaskReporter for TracingTaskReporter {
    async fn report(&self, report: TaskReport) {
        let task_id = report.task_id.map(|id| id.to_string()).unwrap_or_default();
        let tenant = report.tenant.as_ref().map_or("", TenantId::as_str);
        let error = report.error.as_deref().unwrap_or("");
        match report.status {
            TaskStatus::Success => tracing::info!(
                task_id = %task_id,
                run_key = %report.run_key,
                tenant,
                stage = report.stage.as_label(),
                "task succeeded"
            ),
            TaskStatus::NonAlertingTermination => tracing::info!(
                task_id = %task_id,
                run_key = %report.run_key,
                tenant,
                stage = report.stage.as_label(),
                reason = error,
                "task terminated"
            ),
            TaskStatus::Failed => tracing::error!(
                task_id = %task_id,
                run_key = %report.run_key,
                tenant,
                stage = report.stage.as_label(),
                error,
                "task failed"
            ),
        }
    }
}

/// Reporter that keeps reports in memory for inspection.
#[derive(Debug, Default)]
pub struct InMemoryTaskReporter {
    reports: Mutex<Vec<TaskReport>>,
}

impl InMemoryTaskReporter {
    /// Creates an empty reporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every report so far.
    #[must_use]
    pub fn reports(&self) -> Vec<TaskReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Counts reports of a stage with a status.
    #[must_use]
    pub fn count(&self, stage: Stage, status: TaskStatus) -> usize {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.stage == stage && r.status == status)
            .count()
    }
}

#[async_trait]
impl TaskReporter for InMemoryTaskReporter {
    async fn report(&self, report: TaskReport) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report);
    }
}
