//! Result aggregation
//!
//! Merges per-chunk metrics into running totals.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

use super::planner::ChunkId;
use crate::error::{AnalyzerError, Result};

/// Metrics produced by processing one chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsPartial {
    /// Requests seen in the chunk
    pub total_requests: u64,
    /// Requests that ended in an error, never more than `total_requests`
    pub error_count: u64,
    /// Sum of response times over all requests
    pub sum_response_time: f64,
}

impl MetricsPartial {
    /// Reject partials that would corrupt the aggregate
    pub fn validate(&self) -> Result<()> {
        if self.error_count > self.total_requests {
            return Err(AnalyzerError::InvalidInput {
                reason: format!(
                    "error_count {} exceeds total_requests {}",
                    self.error_count, self.total_requests
                ),
            });
        }
        if !self.sum_response_time.is_finite() || self.sum_response_time < 0.0 {
            return Err(AnalyzerError::InvalidInput {
                reason: format!("invalid sum_response_time {}", self.sum_response_time),
            });
        }
        Ok(())
    }
}

/// Aggregate view over all completed chunks
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub total_chunks: u64,
    pub completed_chunks: u64,
    pub total_requests: u64,
    pub error_count: u64,
    /// Mean response time per request, 0 when no requests were seen
    pub avg_response_time: f64,
    /// Share of requests that errored, 0 when no requests were seen
    pub error_rate: f64,
}

#[derive(Default)]
struct RunningTotals {
    aggregated: HashSet<ChunkId>,
    total_requests: u64,
    error_count: u64,
    sum_response_time: f64,
}

/// Running totals across chunks
pub struct ResultAggregator {
    total_chunks: u64,
    totals: Mutex<RunningTotals>,
}

impl ResultAggregator {
    /// Create an aggregator expecting `total_chunks` partials
    pub fn new(total_chunks: u64) -> Self {
        Self {
            total_chunks,
            totals: Mutex::new(RunningTotals::default()),
        }
    }

    /// Merge the metrics of one chunk. Each chunk is counted once.
    pub fn add(&self, chunk_id: ChunkId, metrics: &MetricsPartial) -> Result<()> {
        metrics.validate()?;

        let mut totals = self.totals.lock();
        if totals.aggregated.contains(&chunk_id) {
            warn!("Ignoring duplicate metrics for chunk {}", chunk_id);
            return Err(AnalyzerError::DuplicateChunk { chunk_id });
        }

        let total_requests = totals.total_requests.checked_add(metrics.total_requests);
        let error_count = totals.error_count.checked_add(metrics.error_count);
        let sum_response_time = totals.sum_response_time + metrics.sum_response_time;
        let (Some(total_requests), Some(error_count)) = (total_requests, error_count) else {
            return Err(AnalyzerError::InvalidInput {
                reason: format!("metrics of chunk {} overflow the request totals", chunk_id),
            });
        };
        if !sum_response_time.is_finite() {
            return Err(AnalyzerError::InvalidInput {
                reason: format!("metrics of chunk {} overflow the response time sum", chunk_id),
            });
        }

        totals.aggregated.insert(chunk_id);
        totals.total_requests = total_requests;
        totals.error_count = error_count;
        totals.sum_response_time = sum_response_time;

        debug!(
            "Aggregated chunk {} ({} requests, {} errors)",
            chunk_id, metrics.total_requests, metrics.error_count
        );
        Ok(())
    }

    /// Whether a chunk's metrics are already part of the totals
    pub fn contains(&self, chunk_id: ChunkId) -> bool {
        self.totals.lock().aggregated.contains(&chunk_id)
    }

    /// Compute the aggregate from the current sums
    pub fn snapshot(&self) -> AggregateResult {
        let totals = self.totals.lock();

        let (avg_response_time, error_rate) = if totals.total_requests == 0 {
            (0.0, 0.0)
        } else {
            let requests = totals.total_requests as f64;
            (
                totals.sum_response_time / requests,
                totals.error_count as f64 / requests,
            )
        };

        AggregateResult {
            total_chunks: self.total_chunks,
            completed_chunks: totals.aggregated.len() as u64,
            total_requests: totals.total_requests,
            error_count: totals.error_count,
            avg_response_time,
            error_rate,
        }
    }
}
