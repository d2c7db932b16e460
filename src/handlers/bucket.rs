//! Bucket-level S3 API handlers.

use std::net::Ipv4Addr;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use garde::Validate;
use tracing::info;

use super::{iso8601, require_bucket};
use crate::errors::S3Error;
use crate::request::ResolvedRequest;
use crate::storage::backend::{StorageBackend, StorageError};
use crate::xml::{self, BucketEntry, Owner};

// -- Bucket name validation ---------------------------------------------------

/// Bucket names: 3-63 lowercase alphanumeric characters, dots and hyphens,
/// starting and ending with a letter or digit.
#[derive(Debug, garde::Validate)]
struct BucketNameInput {
    #[garde(length(min = 3, max = 63), pattern(r"^[a-z0-9][a-z0-9.\-]*[a-z0-9]$"))]
    bucket_name: String,
}

/// Validate that a bucket name conforms to S3 naming rules. Names formatted
/// as an IPv4 address are rejected too.
pub fn validate_bucket_name(name: &str) -> Result<(), S3Error> {
    let input = BucketNameInput {
        bucket_name: name.to_string(),
    };
    if input.validate().is_err() || name.parse::<Ipv4Addr>().is_ok() {
        return Err(S3Error::InvalidBucketName {
            name: name.to_string(),
        });
    }
    Ok(())
}

// -- Handlers -----------------------------------------------------------------

/// `GET /` -- every bucket directory under the mount.
pub async fn list_buckets(
    storage: &dyn StorageBackend,
    owner: &Owner<'_>,
) -> Result<Response, S3Error> {
    let buckets: Vec<BucketEntry> = storage
        .list_buckets()
        .await?
        .into_iter()
        .map(|entry| BucketEntry {
            creation_date: iso8601(entry.meta.modified),
            name: entry.name,
        })
        .collect();
    Ok(xml::xml_ok(xml::render_list_buckets_result(owner, &buckets)))
}

/// `GET /bucket?versioning`
pub async fn get_bucket_versioning(
    storage: &dyn StorageBackend,
    req: &ResolvedRequest,
) -> Result<Response, S3Error> {
    require_bucket(storage, req).await?;
    Ok(xml::xml_ok(xml::render_versioning_configuration()))
}

/// `PUT /bucket`
pub async fn create_bucket(
    storage: &dyn StorageBackend,
    req: &ResolvedRequest,
) -> Result<Response, S3Error> {
    validate_bucket_name(&req.bucket)?;

    match storage.create_bucket(&req.storage_path).await {
        Ok(()) => {}
        Err(StorageError::AlreadyExists(_)) => {
            return Err(S3Error::BucketAlreadyExists {
                bucket: req.bucket.clone(),
            })
        }
        Err(err) => return Err(err.into()),
    }

    info!(bucket = %req.bucket, "bucket created");
    Ok((
        StatusCode::OK,
        [("location", format!("/{}", req.bucket))],
    )
        .into_response())
}

/// `DELETE /bucket` -- only empty buckets are removed.
pub async fn delete_bucket(
    storage: &dyn StorageBackend,
    req: &ResolvedRequest,
) -> Result<Response, S3Error> {
    require_bucket(storage, req).await?;

    match storage.delete_bucket(&req.storage_path).await {
        Ok(()) => {
            info!(bucket = %req.bucket, "bucket deleted");
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        Err(StorageError::NotEmpty(_)) => Err(S3Error::BucketNotEmpty {
            bucket: req.bucket.clone(),
        }),
        Err(StorageError::NotFound(_)) => Err(S3Error::NoSuchBucket {
            bucket: req.bucket.clone(),
        }),
        Err(err) => Err(err.into()),
    }
}

/// `HEAD /bucket`
pub async fn head_bucket(
    storage: &dyn StorageBackend,
    req: &ResolvedRequest,
) -> Result<Response, S3Error> {
    require_bucket(storage, req).await?;
    Ok(StatusCode::OK.into_response())
}
