//! Operation dispatch.
//!
//! Every request takes the same path: route admission (verb and path shape
//! only), signature verification, resolution against the mount, an
//! optional filesystem probe, operation selection, execution. Nothing
//! touches the filesystem before the signature has been checked.

use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, warn};

use crate::auth::{AuthError, BufferedBody, SigV4Verifier};
use crate::config::Config;
use crate::errors::S3Error;
use crate::handlers::{bucket, multipart, object};
use crate::metrics;
use crate::request::{PathShape, QueryParams, ResolveError, ResolvedRequest, Resolver, SubResource};
use crate::storage::backend::{EntryKind, StorageBackend};
use crate::xml::Owner;

// -- Route admission ----------------------------------------------------------

/// What a request may do, decided before authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    ListBuckets,
    Resource(Action),
}

/// Verb-level action on a bucket or object path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Get,
    Put,
    Delete,
    Head,
    InitiateUpload,
    BatchDelete,
}

impl Route {
    /// Admit a request from its verb, path shape and query flags. Anything
    /// not admitted is `MethodNotAllowed`.
    pub fn admit(method: &Method, raw_path: &str, query: &QueryParams) -> Result<Route, S3Error> {
        let shape = PathShape::of(raw_path);
        let action = match (method, shape) {
            (&Method::GET, PathShape::Service) => return Ok(Route::ListBuckets),
            (_, PathShape::Service) => return Err(S3Error::MethodNotAllowed),
            (&Method::GET, _) => Action::Get,
            (&Method::PUT, _) => Action::Put,
            (&Method::DELETE, _) => Action::Delete,
            (&Method::HEAD, _) => Action::Head,
            (&Method::POST, _) => match SubResource::of(query) {
                SubResource::Uploads => Action::InitiateUpload,
                SubResource::Delete => Action::BatchDelete,
                _ => return Err(S3Error::MethodNotAllowed),
            },
            _ => return Err(S3Error::MethodNotAllowed),
        };
        Ok(Route::Resource(action))
    }
}

// -- Operation selection ------------------------------------------------------

/// The S3 operation a request performs, with the resources it acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    ListBuckets,
    GetBucketVersioning(ResolvedRequest),
    ListObjects {
        target: ResolvedRequest,
        prefix: String,
        delimiter: Option<String>,
    },
    ListObjectVersions(ResolvedRequest),
    GetObject(ResolvedRequest),
    CreateBucket(ResolvedRequest),
    CopyObject {
        target: ResolvedRequest,
        source: ResolvedRequest,
    },
    PutObject(ResolvedRequest),
    CreateMultipartUpload(ResolvedRequest),
    BatchDeleteObjects(ResolvedRequest),
    DeleteBucket(ResolvedRequest),
    DeleteObject(ResolvedRequest),
    HeadBucket(ResolvedRequest),
    HeadObject(ResolvedRequest),
}

impl Operation {
    /// Pick the operation for an admitted action.
    ///
    /// `probe` is what the object path currently is on disk; it only
    /// matters for object-level `GET`.
    pub fn select(
        action: Action,
        target: ResolvedRequest,
        copy_source: Option<ResolvedRequest>,
        probe: Option<EntryKind>,
    ) -> Operation {
        let bucket_level = target.is_bucket_level();
        match action {
            Action::Get => {
                if target.sub_resource == SubResource::Versioning && bucket_level {
                    Operation::GetBucketVersioning(target)
                } else if target.sub_resource == SubResource::Versions
                    && !target.listing_key().is_empty()
                {
                    Operation::ListObjectVersions(target)
                } else if bucket_level {
                    let prefix = match target.sub_resource {
                        SubResource::PrefixListing => target.prefix.clone().unwrap_or_default(),
                        _ => String::new(),
                    };
                    let delimiter = target.delimiter.clone();
                    Operation::ListObjects {
                        target,
                        prefix,
                        delimiter,
                    }
                } else if probe == Some(EntryKind::Directory) {
                    let prefix = format!("{}/", target.key.trim_end_matches('/'));
                    Operation::ListObjects {
                        target,
                        prefix,
                        delimiter: Some("/".to_string()),
                    }
                } else {
                    Operation::GetObject(target)
                }
            }
            Action::Put if bucket_level => Operation::CreateBucket(target),
            Action::Put => match copy_source {
                Some(source) => Operation::CopyObject { target, source },
                None => Operation::PutObject(target),
            },
            Action::InitiateUpload => Operation::CreateMultipartUpload(target),
            Action::BatchDelete => Operation::BatchDeleteObjects(target),
            Action::Delete if bucket_level => Operation::DeleteBucket(target),
            Action::Delete => Operation::DeleteObject(target),
            Action::Head if bucket_level => Operation::HeadBucket(target),
            Action::Head => Operation::HeadObject(target),
        }
    }

    /// S3 operation name, used for logging and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::ListBuckets => "ListBuckets",
            Operation::GetBucketVersioning(_) => "GetBucketVersioning",
            Operation::ListObjects { .. } => "ListObjects",
            Operation::ListObjectVersions(_) => "ListObjectVersions",
            Operation::GetObject(_) => "GetObject",
            Operation::CreateBucket(_) => "CreateBucket",
            Operation::CopyObject { .. } => "CopyObject",
            Operation::PutObject(_) => "PutObject",
            Operation::CreateMultipartUpload(_) => "CreateMultipartUpload",
            Operation::BatchDeleteObjects(_) => "DeleteObjects",
            Operation::DeleteBucket(_) => "DeleteBucket",
            Operation::DeleteObject(_) => "DeleteObject",
            Operation::HeadBucket(_) => "HeadBucket",
            Operation::HeadObject(_) => "HeadObject",
        }
    }
}

// -- Dispatcher ---------------------------------------------------------------

fn auth_rejection(err: AuthError) -> S3Error {
    metrics::record_auth_failure(err.reason());
    match err {
        AuthError::BodyTooLarge { limit } => {
            warn!(limit, "request body too large");
            S3Error::EntityTooLarge
        }
        AuthError::BodyRead(msg) => {
            S3Error::InternalError(anyhow::anyhow!("failed to read request body: {msg}"))
        }
        other => {
            warn!(reason = other.reason(), error = %other, "authentication failed");
            S3Error::UnauthorizedAccess
        }
    }
}

fn resolve_rejection(err: ResolveError, raw_path: &str) -> S3Error {
    match err {
        err @ ResolveError::MissingBucket => {
            S3Error::InternalError(anyhow::anyhow!("unresolvable path {raw_path:?}: {err}"))
        }
        other => S3Error::InvalidArgument {
            message: other.to_string(),
            resource: raw_path.to_string(),
        },
    }
}

/// Runs one request through admission, authentication, resolution and the
/// selected handler.
pub struct Dispatcher<'a> {
    config: &'a Config,
    storage: &'a dyn StorageBackend,
    verifier: SigV4Verifier<'a>,
    resolver: Resolver<'a>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(config: &'a Config, storage: &'a dyn StorageBackend) -> Self {
        Self {
            config,
            storage,
            verifier: SigV4Verifier::new(config),
            resolver: Resolver::new(&config.storage),
        }
    }

    fn owner(&self) -> Owner<'a> {
        Owner {
            id: &self.config.auth.access_key,
            display_name: &self.config.auth.access_key,
        }
    }

    /// Handle a request end to end. Failures become S3 XML error responses.
    pub async fn dispatch(&self, request: Request<Body>) -> Response {
        let (operation, body) = match self.prepare(request).await {
            Ok(prepared) => prepared,
            Err(err) => return Self::reject("Unknown", err),
        };

        let name = operation.name();
        match self.execute(operation, body).await {
            Ok(response) => {
                metrics::record_operation(name, "ok");
                response
            }
            Err(err) => Self::reject(name, err),
        }
    }

    fn reject(operation: &'static str, err: S3Error) -> Response {
        metrics::record_operation(operation, err.code());
        match &err {
            S3Error::InternalError(cause) => {
                error!(operation, error = %format!("{cause:#}"), "internal error")
            }
            other => debug!(operation, code = other.code(), "request failed"),
        }
        err.into_response()
    }

    /// Admission, verification, resolution and selection.
    async fn prepare(&self, request: Request<Body>) -> Result<(Operation, BufferedBody), S3Error> {
        let (parts, body) = request.into_parts();
        let raw_path = parts.uri.path();
        let query = QueryParams::parse(parts.uri.query());

        let route = Route::admit(&parts.method, raw_path, &query)?;
        let body = self
            .verifier
            .verify(&parts, body)
            .await
            .map_err(auth_rejection)?;
        metrics::record_bytes_received(body.len());

        let action = match route {
            Route::ListBuckets => return Ok((Operation::ListBuckets, body)),
            Route::Resource(action) => action,
        };

        let target = self
            .resolver
            .resolve(raw_path, &query)
            .map_err(|e| resolve_rejection(e, raw_path))?;

        let copy_source = match parts.headers.get("x-amz-copy-source") {
            Some(value) if action == Action::Put && !target.is_bucket_level() => {
                let header = value.to_str().map_err(|_| S3Error::InvalidArgument {
                    message: "x-amz-copy-source is not valid ASCII.".to_string(),
                    resource: target.key.clone(),
                })?;
                let source = self
                    .resolver
                    .resolve_copy_source(header)
                    .map_err(|e| resolve_rejection(e, header))?;
                Some(source)
            }
            _ => None,
        };

        let probe = if action == Action::Get && !target.is_bucket_level() {
            self.storage
                .stat(&target.storage_path)
                .await?
                .map(|meta| meta.kind)
        } else {
            None
        };

        let operation = Operation::select(action, target, copy_source, probe);
        debug!(method = %parts.method, path = raw_path, operation = operation.name(), "dispatching");
        Ok((operation, body))
    }

    async fn execute(&self, operation: Operation, body: BufferedBody) -> Result<Response, S3Error> {
        let storage = self.storage;
        match operation {
            Operation::ListBuckets => bucket::list_buckets(storage, &self.owner()).await,
            Operation::GetBucketVersioning(req) => bucket::get_bucket_versioning(storage, &req).await,
            Operation::ListObjects {
                target,
                prefix,
                delimiter,
            } => object::list_objects(storage, &target, &prefix, delimiter.as_deref()).await,
            Operation::ListObjectVersions(req) => {
                object::list_object_versions(storage, &req, &self.owner()).await
            }
            Operation::GetObject(req) => object::get_object(storage, &req).await,
            Operation::CreateBucket(req) => bucket::create_bucket(storage, &req).await,
            Operation::CopyObject { target, source } => {
                object::copy_object(storage, &target, &source).await
            }
            Operation::PutObject(req) => object::put_object(storage, &req, body).await,
            Operation::CreateMultipartUpload(req) => {
                multipart::create_multipart_upload(storage, &req).await
            }
            Operation::BatchDeleteObjects(req) => {
                object::delete_objects(storage, &self.resolver, &req, &body.bytes()).await
            }
            Operation::DeleteBucket(req) => bucket::delete_bucket(storage, &req).await,
            Operation::DeleteObject(req) => object::delete_object(storage, &req).await,
            Operation::HeadBucket(req) => bucket::head_bucket(storage, &req).await,
            Operation::HeadObject(req) => object::head_object(storage, &req).await,
        }
    }
}
