//! Request routing onto the exchange handlers.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use http::{header, HeaderValue, Method, StatusCode};

use bid_exchange_common::auction::endpoints::handle_auction;
use bid_exchange_common::constants::HEADER_X_REQUEST_ID;
use bid_exchange_common::error::to_error_response;
use bid_exchange_common::events::vtrack::handle_vtrack;
use bid_exchange_common::exchange::Exchange;
use bid_exchange_common::metrics;
use bid_exchange_common::usersync::endpoints::{handle_cookie_sync, handle_setuid};

pub fn router(exchange: Arc<Exchange>) -> Router {
    Router::new().fallback(handle).with_state(exchange)
}

async fn handle(State(exchange): State<Arc<Exchange>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let limit = exchange.settings.host.max_request_size;

    let body = match axum::body::to_bytes(body, limit).await {
        Ok(body) => body,
        Err(e) => {
            log::warn!("Rejecting request body for {}: {}", parts.uri.path(), e);
            let mut response = Response::new(Body::from(format!(
                "Request size exceeds max size of {limit} bytes\n"
            )));
            *response.status_mut() = StatusCode::PAYLOAD_TOO_LARGE;
            return response;
        }
    };

    route_request(&exchange, http::Request::from_parts(parts, body))
        .await
        .map(Body::from)
}

/// Dispatches on method and path; errors become plain-text responses.
async fn route_request(exchange: &Exchange, req: http::Request<Bytes>) -> http::Response<String> {
    let method = req.method();
    let path = req.uri().path();

    if let Some(request_id) = req
        .headers()
        .get(HEADER_X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
    {
        log::info!("{} {} (request id {})", method, path, request_id);
    } else {
        log::info!("{} {}", method, path);
    }

    let result = match (method, path) {
        (&Method::POST, "/auction") => handle_auction(exchange, &req).await,
        (&Method::POST, "/cookie_sync") => handle_cookie_sync(
            &exchange.settings,
            &exchange.usersync,
            &exchange.privacy,
            &req,
        ),
        (&Method::GET, "/setuid") => handle_setuid(&exchange.settings, &exchange.privacy, &req),
        (&Method::POST, "/vtrack") => {
            handle_vtrack(&exchange.settings, exchange.cache.as_ref(), &req).await
        }
        (&Method::GET, "/status") => Ok(text_response(StatusCode::OK, "ok")),
        (&Method::GET, "/metrics") => metrics::encode().map(|body| {
            let mut response = text_response(StatusCode::OK, &body);
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }),
        _ => {
            log::debug!("No route for {} {}", method, path);
            Ok(text_response(StatusCode::NOT_FOUND, "Not Found"))
        }
    };

    result.unwrap_or_else(|e| to_error_response(&e))
}

fn text_response(status: StatusCode, body: &str) -> http::Response<String> {
    let mut response = http::Response::new(body.to_string());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
