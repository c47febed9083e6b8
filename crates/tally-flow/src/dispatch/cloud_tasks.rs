//! Google Cloud Tasks queue.
//!
//! Each envelope becomes one HTTP-target task that POSTs the envelope JSON to
//! `{service_url}{path_prefix}/{kind}`. Cloud Tasks retries the request until
//! the handler answers 2xx, which gives the protocol its at-least-once
//! delivery. Tasks are unnamed: Cloud Tasks does no deduplication for us.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use gcp_auth::TokenProvider;
use serde::{Deserialize, Serialize};

use super::{EnqueueOptions, EnqueueResult, TaskEnvelope, TaskQueue};
use crate::error::{Error, Result};

const CLOUD_TASKS_API: &str = "https://cloudtasks.googleapis.com/v2";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Configuration for [`CloudTasksQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudTasksConfig {
    /// GCP project ID.
    pub project_id: String,
    /// Cloud Tasks location (e.g., "us-central1").
    pub location: String,
    /// Queue name.
    pub queue_name: String,
    /// Base URL of the service that handles tasks.
    pub service_url: String,
    /// Route prefix of the task handlers (e.g. `/tasks/consolidate`).
    pub path_prefix: String,
    /// Service account used to mint OIDC tokens for the handler.
    pub service_account_email: Option<String>,
    /// Maximum time the handler has to respond.
    pub dispatch_deadline: Duration,
}

impl CloudTasksConfig {
    /// Creates a config with the default six-hour dispatch deadline.
    #[must_use]
    pub fn new(
        project_id: impl Into<String>,
        location: impl Into<String>,
        queue_name: impl Into<String>,
        service_url: impl Into<String>,
        path_prefix: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            location: location.into(),
            queue_name: queue_name.into(),
            service_url: service_url.into(),
            path_prefix: path_prefix.into(),
            service_account_email: None,
            dispatch_deadline: Duration::from_secs(6 * 60 * 60),
        }
    }

    /// Sets the service account for OIDC authentication.
    #[must_use]
    pub fn with_service_account(mut self, email: impl Into<String>) -> Self {
        self.service_account_email = Some(email.into());
        self
    }

    /// Sets the dispatch deadline.
    #[must_use]
    pub const fn with_dispatch_deadline(mut self, deadline: Duration) -> Self {
        self.dispatch_deadline = deadline;
        self
    }

    /// Returns the full queue path for the Cloud Tasks API.
    #[must_use]
    pub fn queue_path(&self) -> String {
        format!(
            "projects/{}/locations/{}/queues/{}",
            self.project_id, self.location, self.queue_name
        )
    }

    /// Returns the handler URL for a task envelope.
    #[must_use]
    pub fn target_url(&self, envelope: &TaskEnvelope) -> String {
        format!(
            "{}{}/{}",
            self.service_url.trim_end_matches('/'),
            self.path_prefix,
            envelope.task.kind()
        )
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("project_id", &self.project_id),
            ("location", &self.location),
            ("queue_name", &self.queue_name),
            ("service_url", &self.service_url),
        ] {
            if value.is_empty() {
                return Err(Error::configuration(format!("{name} cannot be empty")));
            }
        }
        if self.dispatch_deadline.is_zero() {
            return Err(Error::configuration(
                "dispatch_deadline must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest {
    task: CloudTask,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CloudTask {
    http_request: HttpRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    schedule_time: Option<String>,
    dispatch_deadline: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpRequest {
    url: String,
    http_method: &'static str,
    headers: std::collections::HashMap<String, String>,
    body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    oidc_token: Option<OidcToken>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OidcToken {
    service_account_email: String,
    audience: String,
}

#[derive(Debug, Deserialize)]
struct CloudTasksErrorResponse {
    error: CloudTasksError,
}

#[derive(Debug, Deserialize)]
struct CloudTasksError {
    message: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct CloudTasksSuccessResponse {
    name: String,
}

/// [`TaskQueue`] backed by Google Cloud Tasks.
pub struct CloudTasksQueue {
    config: CloudTasksConfig,
    token_provider: Arc<dyn TokenProvider>,
    client: reqwest::Client,
}

impl std::fmt::Debug for CloudTasksQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudTasksQueue")
            .field("config", &self.config)
            .field("token_provider", &"<TokenProvider>")
            .finish_non_exhaustive()
    }
}

impl CloudTasksQueue {
    /// Creates a queue client using ambient GCP credentials.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the config is incomplete or no
    /// credentials can be found.
    pub async fn new(config: CloudTasksConfig) -> Result<Self> {
        config.validate()?;

        let token_provider = gcp_auth::provider()
            .await
            .map_err(|e| Error::configuration(format!("failed to initialize GCP auth: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            config,
            token_provider,
            client,
        })
    }

    fn build_request(&self, envelope: &TaskEnvelope, options: &EnqueueOptions) -> Result<CreateTaskRequest> {
        let url = self.config.target_url(envelope);
        let body = serde_json::to_vec(envelope)
            .map_err(|e| Error::serialization(format!("encode task envelope: {e}")))?;

        let oidc_token = self
            .config
            .service_account_email
            .as_ref()
            .map(|email| OidcToken {
                service_account_email: email.clone(),
                audience: self.config.service_url.clone(),
            });

        let mut headers = std::collections::HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        Ok(CreateTaskRequest {
            task: CloudTask {
                http_request: HttpRequest {
                    url,
                    http_method: "POST",
                    headers,
                    body: base64::engine::general_purpose::STANDARD.encode(body),
                    oidc_token,
                },
                schedule_time: options.delay.map(format_schedule_time),
                dispatch_deadline: format_duration(self.config.dispatch_deadline),
            },
        })
    }
}

#[async_trait]
impl TaskQueue for CloudTasksQueue {
    async fn enqueue(&self, envelope: TaskEnvelope, options: EnqueueOptions) -> Result<EnqueueResult> {
        let request = self.build_request(&envelope, &options)?;

        let token = self
            .token_provider
            .token(&[CLOUD_PLATFORM_SCOPE])
            .await
            .map_err(|e| Error::dispatch(format!("failed to get GCP access token: {e}")))?;

        let api_url = format!("{CLOUD_TASKS_API}/{}/tasks", self.config.queue_path());
        let response = self
            .client
            .post(&api_url)
            .bearer_auth(token.as_str())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::dispatch(format!("Cloud Tasks API request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let success: CloudTasksSuccessResponse = response
                .json()
                .await
                .map_err(|e| Error::dispatch(format!("failed to parse success response: {e}")))?;
            tracing::debug!(
                task_id = %envelope.task_id,
                kind = envelope.task.kind(),
                name = %success.name,
                "enqueued cloud task"
            );
            return Ok(EnqueueResult::Enqueued {
                message_id: success.name,
            });
        }
        if status.as_u16() == 429 {
            return Ok(EnqueueResult::QueueFull);
        }

        let error_body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        match serde_json::from_str::<CloudTasksErrorResponse>(&error_body) {
            Ok(parsed) => Err(Error::dispatch(format!(
                "Cloud Tasks API error: {} ({})",
                parsed.error.message, parsed.error.status
            ))),
            Err(_) => Err(Error::dispatch(format!(
                "Cloud Tasks API error: {status} - {error_body}"
            ))),
        }
    }

    async fn queue_depth(&self) -> Result<usize> {
        // Listing tasks is paginated and expensive; depth comes from Cloud Monitoring.
        Ok(0)
    }

    fn queue_name(&self) -> &str {
        &self.config.queue_name
    }
}

/// Formats a duration as a protobuf JSON duration string.
fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let nanos = duration.subsec_nanos();
    if nanos == 0 {
        return format!("{secs}s");
    }

    let mut fractional = format!("{nanos:09}");
    while fractional.ends_with('0') {
        fractional.pop();
    }
    format!("{secs}.{fractional}s")
}

/// Formats `now + delay` as an RFC 3339 timestamp.
fn format_schedule_time(delay: Duration) -> String {
    let scheduled = chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
    scheduled.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}
