//! OpenStack Swift client
//!
//! Async client over reqwest using token auth (`X-Auth-Token`).

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use std::time::Duration;
use tracing::debug;

use super::ObjectStore;
use crate::error::{Result, SloError};

const AUTH_HEADER: &str = "X-Auth-Token";

/// Configuration for the Swift client
#[derive(Debug, Clone)]
pub struct SwiftConfig {
    /// Account storage URL, e.g. `https://swift.example.com/v1/AUTH_abc`
    pub storage_url: String,
    /// Auth token for the account
    pub auth_token: String,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Whole-request timeout in seconds; `None` lets a stalled upload hold
    /// its worker slot indefinitely
    pub request_timeout_secs: Option<u64>,
}

impl Default for SwiftConfig {
    fn default() -> Self {
        Self {
            storage_url: "http://localhost:8080/v1/AUTH_test".into(),
            auth_token: String::new(),
            connect_timeout_secs: 10,
            request_timeout_secs: None,
        }
    }
}

/// Swift storage client using reqwest
pub struct SwiftClient {
    client: Client,
    config: SwiftConfig,
}

impl SwiftClient {
    /// Create a new Swift client
    pub fn new(config: SwiftConfig) -> Result<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build().map_err(|e| SloError::StorageError {
            message: format!("Failed to create HTTP client: {}", e),
        })?;

        Url::parse(&config.storage_url).map_err(|e| SloError::InvalidConfig {
            reason: format!("Invalid storage URL {}: {}", config.storage_url, e),
        })?;

        Ok(Self { client, config })
    }

    /// Build URL for a container or an object inside it
    fn url(&self, container: &str, path: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&self.config.storage_url).map_err(|e| SloError::InvalidConfig {
            reason: format!("Invalid storage URL {}: {}", self.config.storage_url, e),
        })?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| SloError::InvalidConfig {
                reason: format!("Storage URL cannot be a base: {}", self.config.storage_url),
            })?;
            segments.pop_if_empty().push(container);
            if let Some(path) = path {
                segments.extend(path.split('/'));
            }
        }
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        request
            .header(AUTH_HEADER, &self.config.auth_token)
            .send()
            .await
            .map_err(|e| SloError::StorageError {
                message: format!("{} failed: {}", what, e),
            })
    }

    /// Validate the storage URL and token against the account
    pub async fn head_account(&self) -> Result<()> {
        let resp = self
            .send(self.client.head(&self.config.storage_url), "Head account")
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SloError::AuthFailed {
                reason: format!("storage rejected the auth token (status {})", resp.status()),
            }),
            s => Err(SloError::StorageError {
                message: format!("Head account failed: status {}", s),
            }),
        }
    }

    /// Check if a container exists
    pub async fn container_exists(&self, container: &str) -> Result<bool> {
        let url = self.url(container, None)?;
        let resp = self
            .send(self.client.head(url), &format!("Head container {}", container))
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SloError::AuthFailed {
                reason: format!(
                    "access to container {} denied (status {})",
                    container,
                    resp.status()
                ),
            }),
            s => Err(SloError::StorageError {
                message: format!("Head container {} failed: status {}", container, s),
            }),
        }
    }

    /// Get storage URL
    pub fn storage_url(&self) -> &str {
        &self.config.storage_url
    }
}

fn response_etag(resp: &Response) -> String {
    resp.headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .trim_matches('"')
        .to_string()
}

#[async_trait]
impl ObjectStore for SwiftClient {
    async fn create_container(&self, container: &str) -> Result<()> {
        let url = self.url(container, None)?;
        let resp = self
            .send(self.client.put(url), &format!("Create container {}", container))
            .await?;

        if !resp.status().is_success() {
            return Err(SloError::StorageError {
                message: format!("Create container {} failed: status {}", container, resp.status()),
            });
        }

        debug!("Container {} ready", container);
        Ok(())
    }

    async fn put_object(
        &self,
        container: &str,
        path: &str,
        data: Bytes,
        etag: &str,
    ) -> Result<String> {
        let url = self.url(container, Some(path))?;
        let mut request = self.client.put(url).body(data);
        if !etag.is_empty() {
            request = request.header("ETag", etag);
        }
        let resp = self
            .send(request, &format!("Put object {}/{}", container, path))
            .await?;

        if resp.status() == StatusCode::UNPROCESSABLE_ENTITY {
            return Err(SloError::ChecksumMismatch {
                path: format!("{}/{}", container, path),
                expected: etag.to_string(),
                actual: "rejected by storage".into(),
            });
        }

        if !resp.status().is_success() {
            return Err(SloError::StorageError {
                message: format!(
                    "Put object {}/{} failed: status {}",
                    container,
                    path,
                    resp.status()
                ),
            });
        }

        let etag = response_etag(&resp);
        debug!("Put {}/{} complete, etag={}", container, path, etag);
        Ok(etag)
    }

    async fn put_manifest(&self, container: &str, path: &str, manifest: Bytes) -> Result<String> {
        let url = self.url(container, Some(path))?;
        let resp = self
            .send(
                self.client
                    .put(url)
                    .query(&[("multipart-manifest", "put")])
                    .header("Content-Type", "application/json")
                    .body(manifest),
                &format!("Put manifest {}/{}", container, path),
            )
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SloError::StorageError {
                message: format!(
                    "Put manifest {}/{} failed: status {} {}",
                    container,
                    path,
                    status,
                    body.trim()
                ),
            });
        }

        let etag = response_etag(&resp);
        debug!("Manifest {}/{} committed, etag={}", container, path, etag);
        Ok(etag)
    }
}
