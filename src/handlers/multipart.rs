//! Multipart upload handlers.
//!
//! Only initiation is served: each upload gets a staging area under the
//! metadata directory keyed by a fresh upload id.

use axum::response::Response;
use tracing::info;

use super::require_bucket;
use crate::errors::S3Error;
use crate::request::ResolvedRequest;
use crate::storage::backend::StorageBackend;
use crate::xml;

/// `POST /bucket?uploads` or `POST /bucket/key?uploads`
pub async fn create_multipart_upload(
    storage: &dyn StorageBackend,
    req: &ResolvedRequest,
) -> Result<Response, S3Error> {
    require_bucket(storage, req).await?;

    if req.key.ends_with('/') {
        return Err(S3Error::InvalidArgument {
            message: "A multipart upload key must name a file.".to_string(),
            resource: req.key.clone(),
        });
    }

    let upload_id = storage.create_upload(&req.key).await?;
    info!(bucket = %req.bucket, key = %req.key, upload_id = %upload_id, "multipart upload initiated");

    Ok(xml::xml_ok(xml::render_initiate_multipart_upload_result(
        &req.bucket,
        &req.key,
        &upload_id,
    )))
}
