//! Error types for the bid exchange.
//!
//! Every fallible operation in this crate returns
//! `Result<T, error_stack::Report<BidExchangeError>>`. Handlers convert the
//! report into an HTTP response through [`IntoHttpResponse`].

use core::error::Error;

use derive_more::Display;
use error_stack::Report;
use http::header;
use http::{Response, StatusCode};

/// Errors surfaced by the bid exchange.
#[derive(Debug, Display)]
pub enum BidExchangeError {
    /// Settings could not be loaded or failed validation.
    #[display("Configuration error: {message}")]
    Configuration { message: String },

    /// The inbound request was structurally invalid.
    #[display("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// The request named an account that is not configured.
    #[display("Unknown account id: {account_id}")]
    UnknownAccount { account_id: String },

    /// The request named a bidder with no registered adapter.
    #[display("Unsupported bidder: {bidder}")]
    UnsupportedBidder { bidder: String },

    /// The browser has opted out of syncing.
    #[display("User has opted out")]
    OptedOut,

    /// Consent does not allow the host to write cookies.
    #[display("Consent does not permit cookie sync")]
    ConsentDenied,

    /// The creative cache rejected or failed the write batch.
    #[display("Prebid cache failed: {message}")]
    Cache { message: String },

    /// A usersync template failed to register or render.
    #[display("Template error: {message}")]
    Template { message: String },

    /// Outbound HTTP transport failure.
    #[display("HTTP error: {message}")]
    Http { message: String },

    /// JSON encoding or decoding failed.
    #[display("Serialization error: {message}")]
    Serialization { message: String },
}

impl Error for BidExchangeError {}

/// Maps an error to the HTTP status and message shown to the caller.
pub trait IntoHttpResponse {
    /// HTTP status code for this error.
    fn status_code(&self) -> StatusCode;

    /// Message safe to return to the caller.
    fn user_message(&self) -> String;
}

impl IntoHttpResponse for BidExchangeError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. }
            | Self::UnknownAccount { .. }
            | Self::UnsupportedBidder { .. } => StatusCode::BAD_REQUEST,
            Self::OptedOut => StatusCode::UNAUTHORIZED,
            Self::ConsentDenied => StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS,
            Self::Http { .. } => StatusCode::BAD_GATEWAY,
            Self::Configuration { .. }
            | Self::Cache { .. }
            | Self::Template { .. }
            | Self::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn user_message(&self) -> String {
        match self {
            // Configuration details stay in the logs.
            Self::Configuration { .. } => "Server configuration error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Converts a report into a plain-text error response.
#[must_use]
pub fn to_error_response(report: &Report<BidExchangeError>) -> Response<String> {
    let error = report.current_context();
    log::error!("Request failed: {:?}", report);

    let mut response = Response::new(format!("{}\n", error.user_message()));
    *response.status_mut() = error.status_code();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
