//! Object-level S3 API handlers.

use std::path::{Path, PathBuf};

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::{debug, warn};

use super::{iso8601, object_entry, placeholder_etag, require_bucket};
use crate::auth::BufferedBody;
use crate::errors::S3Error;
use crate::request::{ResolvedRequest, Resolver};
use crate::storage::backend::{EntryMeta, StorageBackend, StorageError};
use crate::xml::{self, DeleteErrorEntry, ListObjectsPage, ObjectEntry, Owner};

const MAX_KEYS: usize = 1000;

// -- Listing ------------------------------------------------------------------

/// Files (and empty folders) plus collapsed sub-directories under a prefix.
#[derive(Debug, Default)]
struct Listing {
    contents: Vec<ObjectEntry>,
    common_prefixes: Vec<String>,
}

/// Walk the bucket for keys starting with `prefix`.
///
/// Only the directory holding the prefix's last `/` and below is read. With
/// `delimited` the walk stops after one level and sub-directories become
/// common prefixes; otherwise it recurses and reports empty directories as
/// zero-byte `key/` entries.
async fn collect_listing(
    storage: &dyn StorageBackend,
    bucket_path: &Path,
    prefix: &str,
    delimited: bool,
) -> Result<Listing, S3Error> {
    let base_key = prefix.rfind('/').map_or("", |i| &prefix[..=i]);
    let mut base_dir = bucket_path.to_path_buf();
    for segment in base_key.split('/').filter(|s| !s.is_empty()) {
        base_dir.push(segment);
    }

    let mut listing = Listing::default();
    let base_meta = match storage.stat(&base_dir).await? {
        Some(meta) if meta.is_dir() => meta,
        _ => return Ok(listing),
    };

    let mut pending: Vec<(PathBuf, String, EntryMeta)> =
        vec![(base_dir, base_key.to_string(), base_meta)];
    while let Some((dir, dir_key, dir_meta)) = pending.pop() {
        let entries = match storage.read_dir(&dir).await {
            Ok(entries) => entries,
            // Removed while walking.
            Err(StorageError::NotFound(_)) => continue,
            Err(err) => return Err(err.into()),
        };

        if entries.is_empty() && !dir_key.is_empty() && dir_key.starts_with(prefix) {
            listing.contents.push(object_entry(dir_key.clone(), &dir_meta));
            continue;
        }

        for entry in entries {
            let key = format!("{dir_key}{}", entry.name);
            if entry.meta.is_dir() {
                let child_key = format!("{key}/");
                if !child_key.starts_with(prefix) {
                    continue;
                }
                if delimited {
                    listing.common_prefixes.push(child_key);
                } else {
                    pending.push((dir.join(&entry.name), child_key, entry.meta));
                }
            } else if key.starts_with(prefix) {
                listing.contents.push(object_entry(key, &entry.meta));
            }
        }
    }

    listing.contents.sort_by(|a, b| a.key.cmp(&b.key));
    listing.common_prefixes.sort();
    Ok(listing)
}

/// `GET /bucket` or `GET /bucket/dir` -- list keys under a prefix.
///
/// Only `/` is honored as a delimiter.
pub async fn list_objects(
    storage: &dyn StorageBackend,
    req: &ResolvedRequest,
    prefix: &str,
    delimiter: Option<&str>,
) -> Result<Response, S3Error> {
    require_bucket(storage, req).await?;

    let delimiter = delimiter.filter(|d| *d == "/");
    let listing =
        collect_listing(storage, &req.bucket_path(), prefix, delimiter.is_some()).await?;
    debug!(
        bucket = %req.bucket,
        prefix,
        keys = listing.contents.len(),
        prefixes = listing.common_prefixes.len(),
        "listed objects"
    );

    let page = ListObjectsPage {
        bucket: &req.bucket,
        prefix,
        delimiter,
        max_keys: MAX_KEYS,
        contents: &listing.contents,
        common_prefixes: &listing.common_prefixes,
    };
    Ok(xml::xml_ok(xml::render_list_objects_result(&page)))
}

/// `GET /bucket/key?versions` or `GET /bucket?versions&prefix=...` -- every
/// file is reported as its own single version.
pub async fn list_object_versions(
    storage: &dyn StorageBackend,
    req: &ResolvedRequest,
    owner: &Owner<'_>,
) -> Result<Response, S3Error> {
    require_bucket(storage, req).await?;

    let prefix = req.listing_key();
    let listing = collect_listing(storage, &req.bucket_path(), prefix, false).await?;
    let versions: Vec<ObjectEntry> = listing
        .contents
        .into_iter()
        .filter(|entry| !entry.key.ends_with('/'))
        .collect();

    Ok(xml::xml_ok(xml::render_list_versions_result(
        &req.bucket,
        prefix,
        owner,
        &versions,
    )))
}

// -- Reads --------------------------------------------------------------------

fn object_headers(response: &mut Response, meta: &EntryMeta) {
    let hdrs = response.headers_mut();
    hdrs.insert(
        "content-type",
        HeaderValue::from_static("application/octet-stream"),
    );
    hdrs.insert("content-length", HeaderValue::from(meta.size));
    if let Ok(val) = HeaderValue::from_str(&httpdate::fmt_http_date(meta.modified)) {
        hdrs.insert("last-modified", val);
    }
    if let Ok(val) = HeaderValue::from_str(&placeholder_etag(meta)) {
        hdrs.insert("etag", val);
    }
}

fn no_such_key(req: &ResolvedRequest) -> S3Error {
    S3Error::NoSuchKey {
        key: req.key.clone(),
    }
}

/// `GET /bucket/key`
pub async fn get_object(
    storage: &dyn StorageBackend,
    req: &ResolvedRequest,
) -> Result<Response, S3Error> {
    let meta = match storage.stat(&req.storage_path).await? {
        Some(meta) if meta.is_file() => meta,
        _ => return Err(no_such_key(req)),
    };
    let data = match storage.read_object(&req.storage_path).await {
        Ok(data) => data,
        Err(StorageError::NotFound(_)) => return Err(no_such_key(req)),
        Err(err) => return Err(err.into()),
    };

    let meta = EntryMeta {
        size: data.len() as u64,
        ..meta
    };
    let mut response = (StatusCode::OK, data).into_response();
    object_headers(&mut response, &meta);
    Ok(response)
}

/// `HEAD /bucket/key` -- a directory answers only when addressed as a
/// folder (`key/`).
pub async fn head_object(
    storage: &dyn StorageBackend,
    req: &ResolvedRequest,
) -> Result<Response, S3Error> {
    let meta = match storage.stat(&req.storage_path).await? {
        Some(meta) if meta.is_file() => meta,
        Some(meta) if meta.is_dir() && req.key.ends_with('/') => EntryMeta { size: 0, ..meta },
        _ => return Err(no_such_key(req)),
    };
    let mut response = StatusCode::OK.into_response();
    object_headers(&mut response, &meta);
    Ok(response)
}

// -- Writes -------------------------------------------------------------------

fn etag_response(etag: &str) -> Result<Response, S3Error> {
    let value = HeaderValue::from_str(etag)
        .map_err(|e| S3Error::InternalError(anyhow::anyhow!("invalid etag header: {e}")))?;
    let mut response = StatusCode::OK.into_response();
    response.headers_mut().insert("etag", value);
    Ok(response)
}

/// `PUT /bucket/key`
pub async fn put_object(
    storage: &dyn StorageBackend,
    req: &ResolvedRequest,
    body: BufferedBody,
) -> Result<Response, S3Error> {
    require_bucket(storage, req).await?;

    if req.key.ends_with('/') {
        storage.create_prefix(&req.storage_path).await?;
        debug!(bucket = %req.bucket, key = %req.key, "folder created");
        return etag_response(&crate::storage::local::md5_etag(b""));
    }

    if let Some(meta) = storage.stat(&req.storage_path).await? {
        if meta.is_dir() {
            return Err(S3Error::InvalidArgument {
                message: "The key names an existing prefix.".to_string(),
                resource: req.key.clone(),
            });
        }
    }

    let data: Bytes = body.bytes();
    let size = data.len();
    let etag = storage.write_object(&req.storage_path, data).await?;
    debug!(bucket = %req.bucket, key = %req.key, size, "object written");
    etag_response(&etag)
}

/// `PUT /bucket/key` with `x-amz-copy-source`.
pub async fn copy_object(
    storage: &dyn StorageBackend,
    target: &ResolvedRequest,
    source: &ResolvedRequest,
) -> Result<Response, S3Error> {
    require_bucket(storage, target).await?;

    match storage.stat(&source.storage_path).await? {
        Some(meta) if meta.is_file() => {}
        _ => return Err(no_such_key(source)),
    }
    let (etag, meta) = match storage
        .copy_object(&source.storage_path, &target.storage_path)
        .await
    {
        Ok(copied) => copied,
        Err(StorageError::NotFound(_)) => return Err(no_such_key(source)),
        Err(err) => return Err(err.into()),
    };

    debug!(
        from = %format!("{}/{}", source.bucket, source.key),
        to = %format!("{}/{}", target.bucket, target.key),
        "object copied"
    );
    Ok(xml::xml_ok(xml::render_copy_object_result(
        &etag,
        &iso8601(meta.modified),
    )))
}

// -- Deletes ------------------------------------------------------------------

/// `DELETE /bucket/key` -- removes a file or a whole folder, then prunes
/// parents left empty.
pub async fn delete_object(
    storage: &dyn StorageBackend,
    req: &ResolvedRequest,
) -> Result<Response, S3Error> {
    match storage.remove(&req.storage_path, &req.bucket_path()).await {
        Ok(()) => {
            debug!(bucket = %req.bucket, key = %req.key, "object deleted");
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        Err(StorageError::NotFound(_)) => Err(no_such_key(req)),
        Err(err) => Err(err.into()),
    }
}

/// `POST /bucket?delete` -- batch delete. Keys are relative to the bucket;
/// each key reports its own outcome.
pub async fn delete_objects(
    storage: &dyn StorageBackend,
    resolver: &Resolver<'_>,
    req: &ResolvedRequest,
    body: &[u8],
) -> Result<Response, S3Error> {
    require_bucket(storage, req).await?;

    let request = xml::parse_delete_request(body).map_err(|err| {
        debug!(error = %err, "rejected delete request body");
        S3Error::MalformedXML
    })?;

    let mut deleted: Vec<String> = Vec::new();
    let mut errors: Vec<DeleteErrorEntry> = Vec::new();
    for object in request.objects {
        let target = match resolver.resolve_key(&req.bucket, &object.key) {
            Ok(target) => target,
            Err(err) => {
                errors.push(DeleteErrorEntry {
                    key: object.key,
                    code: "InvalidArgument",
                    message: err.to_string(),
                });
                continue;
            }
        };
        match storage.remove(&target.storage_path, &target.bucket_path()).await {
            Ok(()) => deleted.push(object.key),
            Err(StorageError::NotFound(_)) => errors.push(DeleteErrorEntry {
                key: object.key,
                code: "NoSuchKey",
                message: "The specified key does not exist.".to_string(),
            }),
            Err(err) => {
                warn!(bucket = %req.bucket, key = %object.key, error = %err, "batch delete failed for key");
                errors.push(DeleteErrorEntry {
                    key: object.key,
                    code: "InternalError",
                    message: "We encountered an internal error, please try again.".to_string(),
                });
            }
        }
    }

    Ok(xml::xml_ok(xml::render_delete_result(
        &deleted,
        &errors,
        request.quiet,
    )))
}
