//! Google Cloud Storage backend.
//!
//! Implements [`StorageBackend`] over the GCS JSON API. Object generations are
//! the version tokens, and conditional writes use `ifGenerationMatch`
//! (`0` meaning "object must not exist").
//!
//! This module is only compiled when the `gcp` feature is enabled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use gcp_auth::TokenProvider;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const API_BASE: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";
const GENERATION_HEADER: &str = "x-goog-generation";

/// Object metadata as returned by the JSON API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsObject {
    generation: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
}

/// GCS-backed coordination document store.
pub struct GcsBackend {
    bucket: String,
    prefix: String,
    token_provider: Arc<dyn TokenProvider>,
    client: reqwest::Client,
}

impl std::fmt::Debug for GcsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsBackend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("token_provider", &"<TokenProvider>")
            .finish_non_exhaustive()
    }
}

impl GcsBackend {
    /// Creates a backend rooted at `gs://{bucket}/{prefix}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket is empty or GCP credentials cannot be
    /// discovered.
    pub async fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Result<Self> {
        let bucket = bucket.into();
        if bucket.is_empty() {
            return Err(Error::InvalidInput("bucket cannot be empty".into()));
        }
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }

        let token_provider = gcp_auth::provider()
            .await
            .map_err(|e| Error::storage(format!("failed to initialize GCP auth: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::storage_with_source("failed to create HTTP client", e))?;

        Ok(Self {
            bucket,
            prefix,
            token_provider,
            client,
        })
    }

    fn object_name(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{API_BASE}/b/{}/o/{}",
            self.bucket,
            encode_component(&self.object_name(path))
        )
    }

    async fn access_token(&self) -> Result<String> {
        let token = self
            .token_provider
            .token(&[STORAGE_SCOPE])
            .await
            .map_err(|e| Error::storage(format!("failed to get GCP access token: {e}")))?;
        Ok(token.as_str().to_string())
    }
}

/// Percent-encodes an object name for use as a single URL path segment.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

async fn error_body(response: reqwest::Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string())
}

#[async_trait]
impl StorageBackend for GcsBackend {
    async fn get(&self, path: &str) -> Result<Option<(Bytes, String)>> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(format!("{}?alt=media", self.object_url(path)))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| Error::storage_with_source(format!("GET {path} failed"), e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let generation = response
                    .headers()
                    .get(GENERATION_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .ok_or_else(|| Error::storage(format!("GET {path}: missing generation")))?;
                let data = response
                    .bytes()
                    .await
                    .map_err(|e| Error::storage_with_source(format!("GET {path} body"), e))?;
                Ok(Some((data, generation)))
            }
            status => Err(Error::storage(format!(
                "GET {path}: {status} - {}",
                error_body(response).await
            ))),
        }
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let token = self.access_token().await?;
        let mut url = format!(
            "{UPLOAD_BASE}/b/{}/o?uploadType=media&name={}",
            self.bucket,
            encode_component(&self.object_name(path))
        );
        match &precondition {
            WritePrecondition::DoesNotExist => url.push_str("&ifGenerationMatch=0"),
            WritePrecondition::MatchesVersion(version) => {
                url.push_str(&format!("&ifGenerationMatch={version}"));
            }
            WritePrecondition::None => {}
        }

        let response = self
            .client
            .post(url)
            .bearer_auth(&token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(data)
            .send()
            .await
            .map_err(|e| Error::storage_with_source(format!("PUT {path} failed"), e))?;

        match response.status() {
            StatusCode::PRECONDITION_FAILED => {
                let current_version = self
                    .head(path)
                    .await?
                    .map_or_else(|| "0".to_string(), |meta| meta.version);
                Ok(WriteResult::PreconditionFailed { current_version })
            }
            status if status.is_success() => {
                let object: GcsObject = response
                    .json()
                    .await
                    .map_err(|e| Error::Serialization {
                        message: format!("PUT {path} response: {e}"),
                    })?;
                Ok(WriteResult::Success {
                    version: object.generation,
                })
            }
            status => Err(Error::storage(format!(
                "PUT {path}: {status} - {}",
                error_body(response).await
            ))),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .client
            .delete(self.object_url(path))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| Error::storage_with_source(format!("DELETE {path} failed"), e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(Error::storage(format!(
                "DELETE {path}: {status} - {}",
                error_body(response).await
            ))),
        }
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.object_url(path))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| Error::storage_with_source(format!("HEAD {path} failed"), e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let object: GcsObject = response
                    .json()
                    .await
                    .map_err(|e| Error::Serialization {
                        message: format!("HEAD {path} response: {e}"),
                    })?;
                Ok(Some(ObjectMeta {
                    path: path.to_string(),
                    size: object
                        .size
                        .as_deref()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0),
                    version: object.generation,
                    last_modified: object.updated,
                }))
            }
            status => Err(Error::storage(format!(
                "HEAD {path}: {status} - {}",
                error_body(response).await
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_are_encoded_as_one_segment() {
        assert_eq!(encode_component("runs/01H.json"), "runs%2F01H.json");
        assert_eq!(encode_component("a b"), "a%20b");
        assert_eq!(encode_component("plain-name_1.json"), "plain-name_1.json");
    }

    #[test]
    fn metadata_parses_string_generation() {
        let object: GcsObject = serde_json::from_str(
            r#"{"generation":"1712345678901234","size":"42","updated":"2024-04-05T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(object.generation, "1712345678901234");
        assert_eq!(object.size.as_deref(), Some("42"));
        assert!(object.updated.is_some());
    }
}
