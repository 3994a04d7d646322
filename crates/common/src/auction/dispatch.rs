//! Concurrent bidder dispatch under a shared deadline.
//!
//! Each [`BidderJob`] runs on its own task: build requests, call the partner,
//! parse. Results come back over a channel in completion order. When the
//! deadline passes, jobs that have not reported are recorded as
//! [`AdapterStatus::Timeout`] and the channel is dropped, so anything they
//! send later is discarded. A panic inside a job is caught at the task
//! boundary and reported as [`AdapterStatus::Panic`] for that bidder only.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt as _;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::adapters::{Adapter, AdapterError, AdapterErrorKind, AdapterRegistry};
use crate::http_client::HttpClient;
use crate::metrics::Metrics;

use super::types::{AdapterStatus, BidderJob, JobResult, TypedBid};

/// Fans bidder jobs out to their adapters.
#[derive(Clone)]
pub struct AdapterDispatcher {
    registry: Arc<AdapterRegistry>,
    client: Arc<dyn HttpClient>,
}

impl AdapterDispatcher {
    #[must_use]
    pub fn new(registry: Arc<AdapterRegistry>, client: Arc<dyn HttpClient>) -> Self {
        Self { registry, client }
    }

    /// Runs every job concurrently and collects results until `deadline`.
    ///
    /// Returns exactly one [`JobResult`] per job: completed jobs in arrival
    /// order, followed by timed-out jobs in submission order. Jobs for
    /// bidders with no adapter are reported as [`AdapterStatus::BadInput`].
    pub async fn dispatch(&self, jobs: Vec<BidderJob>, deadline: Instant) -> Vec<JobResult> {
        let started = Instant::now();
        let mut results = Vec::with_capacity(jobs.len());
        let mut outstanding: Vec<String> = Vec::with_capacity(jobs.len());
        let (sender, mut receiver) = mpsc::channel::<JobResult>(jobs.len().max(1));

        for job in jobs {
            let Some(adapter) = self.registry.get(&job.bidder) else {
                log::warn!("No adapter registered for bidder '{}'", job.bidder);
                results.push(JobResult {
                    bidder: job.bidder.clone(),
                    status: AdapterStatus::BadInput,
                    currency: String::new(),
                    bids: Vec::new(),
                    errors: vec!["Unsupported bidder".to_string()],
                    elapsed_ms: 0,
                });
                continue;
            };

            outstanding.push(job.bidder.clone());
            let client = Arc::clone(&self.client);
            let sender = sender.clone();

            tokio::spawn(async move {
                let bidder = job.bidder.clone();
                let job_started = Instant::now();
                let outcome = AssertUnwindSafe(run_job(adapter, client, job, deadline))
                    .catch_unwind()
                    .await;

                let result = outcome.unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    log::error!("Bidder '{}' panicked: {}", bidder, message);
                    JobResult::panicked(
                        bidder.clone(),
                        format!("Bidder panicked: {message}"),
                        elapsed_ms(job_started),
                    )
                });

                if sender.send(result).await.is_err() {
                    log::debug!("Discarding late result from '{}'", bidder);
                }
            });
        }
        drop(sender);

        while !outstanding.is_empty() {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some(result)) => {
                    log::info!(
                        "Bidder '{}' finished: {:?}, {} bids in {}ms",
                        result.bidder,
                        result.status,
                        result.bids.len(),
                        result.elapsed_ms
                    );
                    outstanding.retain(|bidder| bidder != &result.bidder);
                    results.push(result);
                }
                Ok(None) => break,
                Err(_) => {
                    log::warn!(
                        "Auction deadline reached with {} bidders outstanding",
                        outstanding.len()
                    );
                    break;
                }
            }
        }

        let waited = elapsed_ms(started);
        for bidder in outstanding {
            log::warn!("Bidder '{}' timed out after {}ms", bidder, waited);
            results.push(JobResult::timed_out(bidder, waited));
        }

        if let Some(metrics) = Metrics::get() {
            for result in &results {
                metrics.adapter_finished(result);
            }
        }

        results
    }
}

async fn run_job(
    adapter: Arc<dyn Adapter>,
    client: Arc<dyn HttpClient>,
    job: BidderJob,
    deadline: Instant,
) -> JobResult {
    let started = Instant::now();
    let (requests, mut errors) = adapter.build_requests(&job);

    let calls = requests.into_iter().map(|request| {
        let client = Arc::clone(&client);
        async move {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = client.send(request.clone(), remaining).await;
            (request, outcome)
        }
    });

    let mut bids: Vec<TypedBid> = Vec::new();
    let mut currency = String::new();

    for (request, outcome) in join_all(calls).await {
        match outcome {
            Ok(response) => {
                let (parsed, parse_errors) = adapter.parse_response(&request, &response);
                errors.extend(parse_errors);
                if let Some(parsed) = parsed {
                    if currency.is_empty() {
                        currency = parsed.currency;
                    }
                    bids.extend(parsed.bids);
                }
            }
            Err(report) => {
                let error = if Instant::now() >= deadline {
                    AdapterError::timeout("Timed out")
                } else {
                    AdapterError::bad_server_response(format!("{report:?}"))
                };
                errors.push(error);
            }
        }
    }

    let status = if !bids.is_empty() {
        AdapterStatus::Ok
    } else {
        errors
            .first()
            .map_or(AdapterStatus::NoBid, |error| error.kind.status())
    };

    JobResult {
        bidder: job.bidder,
        status,
        currency,
        bids,
        errors: errors.iter().map(ToString::to_string).collect(),
        elapsed_ms: elapsed_ms(started),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        AdapterErrorKind::Unknown.to_string()
    }
}
