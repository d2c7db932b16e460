//! Prometheus metrics for dirstore.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants and provides the HTTP RED middleware. The
//! exporter serves its own listener so the S3 path namespace stays free of
//! reserved routes.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Instant;

use axum::http::Request;
use axum::response::Response;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "dirstore_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "dirstore_http_request_duration_seconds";

/// Total S3 operations (counter). Labels: operation, status.
pub const S3_OPERATIONS_TOTAL: &str = "dirstore_s3_operations_total";

/// Requests rejected by the SigV4 verifier (counter). Labels: reason.
pub const AUTH_FAILURES_TOTAL: &str = "dirstore_auth_failures_total";

/// Total bytes received in request bodies (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "dirstore_bytes_received_total";

// -- Global recorder installation ---------------------------------------------

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the global Prometheus recorder.
///
/// With `listen` set the exporter also serves the text exposition format on
/// that address. Calling this more than once is a no-op.
pub fn init_metrics(listen: Option<SocketAddr>) -> anyhow::Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }
    match listen {
        Some(addr) => PrometheusBuilder::new().with_http_listener(addr).install()?,
        None => {
            PrometheusBuilder::new().install_recorder()?;
        }
    }
    let _ = INSTALLED.set(());
    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(S3_OPERATIONS_TOTAL, "Total S3 operations by type");
    describe_counter!(AUTH_FAILURES_TOTAL, "Requests rejected during signature verification");
    describe_counter!(BYTES_RECEIVED_TOTAL, "Total bytes received (request bodies)");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path, "status" => status)
        .increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

/// Count one dispatched S3 operation and its outcome (`ok` or an error code).
pub fn record_operation(operation: &'static str, status: &'static str) {
    counter!(S3_OPERATIONS_TOTAL, "operation" => operation, "status" => status).increment(1);
}

pub fn record_auth_failure(reason: &'static str) {
    counter!(AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

pub fn record_bytes_received(len: usize) {
    counter!(BYTES_RECEIVED_TOTAL).increment(len as u64);
}

// -- Path normalization -------------------------------------------------------

/// Collapse a request path to a route template so bucket and key names do
/// not become label values.
fn normalize_path(path: &str) -> &'static str {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.trim_end_matches('/').find('/') {
        None => "/{bucket}",
        Some(_) => "/{bucket}/{key}",
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_root() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn test_normalize_path_bucket() {
        assert_eq!(normalize_path("/my-bucket"), "/{bucket}");
        assert_eq!(normalize_path("/my-bucket/"), "/{bucket}");
    }

    #[test]
    fn test_normalize_path_object() {
        assert_eq!(normalize_path("/my-bucket/key"), "/{bucket}/{key}");
        assert_eq!(
            normalize_path("/my-bucket/path/to/object.txt"),
            "/{bucket}/{key}"
        );
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics(None).unwrap();
        init_metrics(None).unwrap();
    }
}
