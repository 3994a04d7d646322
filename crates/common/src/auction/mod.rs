//! Per-request auction pipeline.
//!
//! A request is parsed and split into one job per bidder, the jobs run
//! concurrently under a shared deadline, and the results are merged, cached
//! and annotated with ad-server targeting:
//!
//! - [`request`]: parsing and partitioning into [`types::BidderJob`]s
//! - [`dispatch`]: concurrent adapter calls with timeout and panic isolation
//! - [`aggregate`]: merge and size reconciliation
//! - [`targeting`] and [`price_granularity`]: ranking and `hb_*` keys
//! - [`endpoints`]: the HTTP handler tying it together

pub mod aggregate;
pub mod dispatch;
pub mod endpoints;
pub mod price_granularity;
pub mod request;
pub mod targeting;
pub mod types;

pub use aggregate::ResponseAggregator;
pub use dispatch::AdapterDispatcher;
pub use targeting::Targeter;
pub use types::{AuctionRequest, AuctionResponse, BidderJob, JobResult};
