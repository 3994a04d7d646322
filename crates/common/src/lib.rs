//! Bid exchange core.
//!
//! Runs header-bidding auctions across configured bidder adapters, manages
//! usersync state and consent, and talks to the creative cache. Handlers
//! work on `http` crate types so any server can host them.
//!
//! # Modules
//!
//! - [`adapters`]: Bidder adapter contract, registry and the OpenRTB adapter
//! - [`auction`]: Request parsing, dispatch, aggregation and targeting
//! - [`cache`]: Creative cache client
//! - [`constants`]: Cookie names, macros and targeting keys
//! - [`cookies`]: Cookie parsing and `Set-Cookie` building
//! - [`error`]: Error types and HTTP error responses
//! - [`events`]: Event URLs, VAST impression injection and `/vtrack`
//! - [`exchange`]: Services shared across requests
//! - [`http_client`]: Outbound HTTP seam
//! - [`metrics`]: Prometheus metrics for auctions, bidders and the cache
//! - [`openrtb`]: OpenRTB 2.x wire types
//! - [`privacy`]: Consent gating and TCF v2 parsing
//! - [`settings`]: Configuration loading and validation
//! - [`usersync`]: Sync pixels, the `uids` cookie and sync endpoints

pub mod adapters;
pub mod auction;
pub mod cache;
pub mod constants;
pub mod cookies;
pub mod error;
pub mod events;
pub mod exchange;
pub mod http_client;
pub mod http_util;
pub mod metrics;
pub mod openrtb;
pub mod privacy;
pub mod settings;
pub mod usersync;
