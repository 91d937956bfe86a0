//! Coordinator client for workers
//!
//! reqwest wrapper over the coordinator HTTP protocol. Status codes are
//! mapped back onto [`AnalyzerError`] so callers can tell a stale report
//! (409) from a forgotten registration (404).

use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

use crate::coordinator::aggregator::MetricsPartial;
use crate::coordinator::planner::ChunkId;
use crate::error::{AnalyzerError, Result};
use crate::protocol::{
    CompleteRequest, FailedRequest, HealthReport, RegisterRequest, WorkAssignment,
};

/// Configuration for coordinator client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Coordinator base URL
    pub coordinator_url: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Request timeout
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            coordinator_url: "http://127.0.0.1:8080".into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Coordinator client bound to one worker id
pub struct CoordinatorClient {
    client: Client,
    config: ClientConfig,
    worker_id: String,
}

impl CoordinatorClient {
    pub fn new(config: ClientConfig, worker_id: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| AnalyzerError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            config,
            worker_id: worker_id.into(),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.coordinator_url.trim_end_matches('/'), path)
    }

    /// Register under `url`, the address of this worker's status endpoint
    pub async fn register(&self, url: &str) -> Result<()> {
        let endpoint = self.url("/register");
        let body = RegisterRequest {
            worker_id: self.worker_id.clone(),
            url: url.to_string(),
        };
        let resp = self.send(self.client.post(&endpoint).json(&body), &endpoint).await?;
        self.check(resp, &endpoint, None).await?;
        debug!("Registered {} at {}", self.worker_id, url);
        Ok(())
    }

    /// Register, retrying transport failures with exponential backoff
    pub async fn register_with_retry(&self, url: &str, retries: u32) -> Result<()> {
        let mut last_error = None;

        for attempt in 0..retries.max(1) {
            match self.register(url).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(
                        "Registration attempt {}/{} failed: {}",
                        attempt + 1,
                        retries,
                        e
                    );
                    last_error = Some(e);
                    let delay = Duration::from_millis(200 * 2u64.pow(attempt.min(5)));
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| AnalyzerError::ConnectionFailed {
            endpoint: self.url("/register"),
            reason: "no registration attempt made".into(),
        }))
    }

    /// Report liveness; `healthy = false` asks to stop receiving work
    pub async fn heartbeat(&self, healthy: bool) -> Result<()> {
        let endpoint = self.url("/health");
        let body = HealthReport {
            worker_id: self.worker_id.clone(),
            healthy,
        };
        let resp = self.send(self.client.post(&endpoint).json(&body), &endpoint).await?;
        self.check(resp, &endpoint, None).await?;
        Ok(())
    }

    /// Ask for a chunk, `None` on 204
    pub async fn poll_work(&self) -> Result<Option<WorkAssignment>> {
        let endpoint = self.url("/work");
        let request = self
            .client
            .get(&endpoint)
            .query(&[("worker_id", self.worker_id.as_str())]);
        let resp = self.send(request, &endpoint).await?;

        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let resp = self.check(resp, &endpoint, None).await?;
        let assignment = resp
            .json::<WorkAssignment>()
            .await
            .map_err(|e| AnalyzerError::InvalidMessage {
                reason: format!("Bad work assignment from {}: {}", endpoint, e),
            })?;
        Ok(Some(assignment))
    }

    /// Report chunk metrics
    pub async fn complete(&self, chunk_id: ChunkId, metrics: &MetricsPartial) -> Result<()> {
        let endpoint = self.url("/complete");
        let body = CompleteRequest {
            chunk_id,
            worker_id: self.worker_id.clone(),
            metrics: *metrics,
        };
        let resp = self.send(self.client.post(&endpoint).json(&body), &endpoint).await?;
        self.check(resp, &endpoint, Some(chunk_id)).await?;
        Ok(())
    }

    /// Report a processing failure
    pub async fn fail(&self, chunk_id: ChunkId, reason: &str) -> Result<()> {
        let endpoint = self.url("/failed");
        let body = FailedRequest {
            chunk_id,
            worker_id: self.worker_id.clone(),
            reason: reason.to_string(),
        };
        let resp = self.send(self.client.post(&endpoint).json(&body), &endpoint).await?;
        self.check(resp, &endpoint, Some(chunk_id)).await?;
        Ok(())
    }

    async fn send(&self, request: reqwest::RequestBuilder, endpoint: &str) -> Result<Response> {
        request
            .send()
            .await
            .map_err(|e| AnalyzerError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })
    }

    async fn check(&self, resp: Response, endpoint: &str, chunk_id: Option<ChunkId>) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        match (status, chunk_id) {
            (StatusCode::NOT_FOUND, _) => Err(AnalyzerError::UnknownWorker {
                worker_id: self.worker_id.clone(),
            }),
            (StatusCode::CONFLICT, Some(chunk_id)) => Err(AnalyzerError::StaleAssignment {
                chunk_id,
                worker_id: self.worker_id.clone(),
            }),
            (StatusCode::BAD_REQUEST, _) => {
                let reason = resp.text().await.unwrap_or_default();
                Err(AnalyzerError::InvalidMessage { reason })
            }
            _ => Err(AnalyzerError::UnexpectedResponse {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}
