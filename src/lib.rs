//! dirstore -- an S3-compatible REST server over a directory tree.
//!
//! Top-level directories of the mount are buckets, files below them are
//! objects and sub-directories are key prefixes. Every request is signed
//! with AWS Signature Version 4 against a single configured key pair.

use std::sync::Arc;

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod request;
pub mod server;
pub mod storage;
pub mod xml;

use crate::config::Config;
use crate::storage::backend::StorageBackend;

/// Shared application state passed to the request handler via
/// `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Filesystem backend holding the buckets.
    pub storage: Arc<dyn StorageBackend>,
}
