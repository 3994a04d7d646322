//! Prometheus metrics for auctions, bidder jobs and cache writes.
//!
//! Metrics live in one process-wide registry. The server installs it with a
//! name prefix at startup; tests and library callers that never do get an
//! unprefixed default.

use std::sync::OnceLock;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use prometheus::{Encoder as _, Histogram, HistogramVec, IntCounterVec};
use prometheus_metric_storage::{MetricStorage, StorageRegistry};

use crate::auction::types::{AdapterStatus, JobResult};
use crate::error::BidExchangeError;

static REGISTRY: OnceLock<StorageRegistry> = OnceLock::new();

/// Installs the global registry, prefixing every metric name with `prefix`.
///
/// Only the first call takes effect.
///
/// # Errors
///
/// Returns [`BidExchangeError::Configuration`] if `prefix` is not a valid
/// metric name.
pub fn setup_registry(prefix: Option<String>) -> Result<(), Report<BidExchangeError>> {
    let registry = prometheus::Registry::new_custom(prefix, None).map_err(|e| {
        Report::new(BidExchangeError::Configuration {
            message: "Invalid metrics registry settings".to_string(),
        })
        .attach(e.to_string())
    })?;

    if REGISTRY.set(StorageRegistry::new(registry)).is_err() {
        log::debug!("Metrics registry already installed");
    }
    Ok(())
}

/// The global metric storage, created on first use.
#[must_use]
pub fn storage_registry() -> &'static StorageRegistry {
    REGISTRY.get_or_init(StorageRegistry::default)
}

/// Renders every registered metric in the Prometheus text format.
///
/// # Errors
///
/// Returns [`BidExchangeError::Serialization`] if encoding fails.
pub fn encode() -> Result<String, Report<BidExchangeError>> {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&storage_registry().registry().gather(), &mut buffer)
        .map_err(|e| {
            Report::new(BidExchangeError::Serialization {
                message: "Failed to encode metrics".to_string(),
            })
            .attach(e.to_string())
        })?;

    String::from_utf8(buffer).change_context(BidExchangeError::Serialization {
        message: "Metrics output is not UTF-8".to_string(),
    })
}

#[derive(MetricStorage)]
pub struct Metrics {
    /// Auction requests by outcome.
    #[metric(labels("result"))]
    auction_requests: IntCounterVec,

    /// Time to answer an auction request, in seconds.
    #[metric(buckets(0.01, 0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0))]
    auction_request_seconds: Histogram,

    /// Bidder jobs by final status.
    #[metric(labels("bidder", "status"))]
    adapter_requests: IntCounterVec,

    /// Bidder job latency, in seconds.
    #[metric(
        labels("bidder"),
        buckets(0.005, 0.01, 0.025, 0.05, 0.1, 0.2, 0.3, 0.5, 0.75, 1.0, 2.0)
    )]
    adapter_request_seconds: HistogramVec,

    /// Bids returned per bidder before aggregation.
    #[metric(labels("bidder"))]
    adapter_bids: IntCounterVec,

    /// Creative cache writes by result.
    #[metric(labels("result"))]
    cache_writes: IntCounterVec,
}

impl Metrics {
    /// The metrics instance in the global registry.
    ///
    /// Registration only fails on a name clash; that is logged and recording
    /// is skipped.
    #[must_use]
    pub fn get() -> Option<&'static Self> {
        Self::instance(storage_registry())
            .inspect_err(|e| log::error!("Failed to register metrics: {}", e))
            .ok()
    }

    /// Records the outcome of one bidder job.
    pub fn adapter_finished(&self, result: &JobResult) {
        self.adapter_status(&result.bidder, result.status);
        self.adapter_request_seconds
            .with_label_values(&[result.bidder.as_str()])
            .observe(Duration::from_millis(result.elapsed_ms).as_secs_f64());
        self.adapter_bids
            .with_label_values(&[result.bidder.as_str()])
            .inc_by(result.bids.len() as u64);
    }

    /// Counts a bidder status without a latency sample, for bidders that never dispatched.
    pub fn adapter_status(&self, bidder: &str, status: AdapterStatus) {
        self.adapter_requests
            .with_label_values(&[bidder, status.as_str()])
            .inc();
    }

    pub fn auction_finished(&self, result: &str, elapsed: Duration) {
        self.auction_requests.with_label_values(&[result]).inc();
        self.auction_request_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn cache_write(&self, result: &str) {
        self.cache_writes.with_label_values(&[result]).inc();
    }

    #[cfg(test)]
    pub(crate) fn adapter_count(&self, bidder: &str, status: AdapterStatus) -> u64 {
        self.adapter_requests
            .with_label_values(&[bidder, status.as_str()])
            .get()
    }

    #[cfg(test)]
    pub(crate) fn adapter_samples(&self, bidder: &str) -> u64 {
        self.adapter_request_seconds
            .with_label_values(&[bidder])
            .get_sample_count()
    }

    #[cfg(test)]
    pub(crate) fn adapter_bid_count(&self, bidder: &str) -> u64 {
        self.adapter_bids.with_label_values(&[bidder]).get()
    }

    #[cfg(test)]
    pub(crate) fn auction_count(&self, result: &str) -> u64 {
        self.auction_requests.with_label_values(&[result]).get()
    }

    #[cfg(test)]
    pub(crate) fn cache_write_count(&self, result: &str) -> u64 {
        self.cache_writes.with_label_values(&[result]).get()
    }
}
