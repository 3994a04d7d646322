use error_stack::{Report, ResultExt};
use http::{header, HeaderValue, Response, StatusCode, Uri};
use serde::Serialize;
use url::form_urlencoded;

use crate::error::BidExchangeError;

/// First value of query parameter `name`, percent-decoded.
#[must_use]
pub fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Serializes `body` into a JSON response with `status`.
///
/// # Errors
///
/// Returns [`BidExchangeError::Serialization`] if `body` cannot be encoded.
pub fn json_response<T: Serialize>(
    status: StatusCode,
    body: &T,
) -> Result<Response<String>, Report<BidExchangeError>> {
    let json = serde_json::to_string(body).change_context(BidExchangeError::Serialization {
        message: "Failed to serialize response".to_string(),
    })?;

    let mut response = Response::new(json);
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Ok(response)
}
