//! Axum router construction.
//!
//! S3 distinguishes operations by verb, path shape and query flags, and a
//! GET on an object path can even turn into a listing once the filesystem
//! has been probed. Every request therefore goes to one fallback handler
//! that hands it to the [`Dispatcher`]; no path is reserved by the router.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
    Router,
};
use tower_http::trace::TraceLayer;

use crate::dispatch::Dispatcher;
use crate::errors::generate_request_id;
use crate::metrics::metrics_middleware;
use crate::AppState;

/// Build the axum [`Router`] serving the S3 API.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(handle_request)
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        // The verifier enforces its own limit while buffering.
        .layer(DefaultBodyLimit::disable())
}

async fn handle_request(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    Dispatcher::new(&state.config, state.storage.as_ref())
        .dispatch(req)
        .await
}

// -- Common headers middleware -----------------------------------------------

/// Adds the standard S3 response headers to every response:
/// - `x-amz-request-id`: 16-character uppercase hex string
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `dirstore`
async fn common_headers_middleware(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Error responses carry the id already rendered into their body.
    if !headers.contains_key("x-amz-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-amz-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("dirstore"));

    response
}
