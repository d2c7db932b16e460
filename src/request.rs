//! Request resolution: turning a URL path and query string into the
//! bucket, key, storage path and sub-resource an operation works on.
//!
//! Resolution is pure. It never touches the filesystem, and resolving the
//! same path and query twice yields equal values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use thiserror::Error;

use crate::config::StorageConfig;

// ── Query parameters ────────────────────────────────────────────────

/// Decoded query parameters. Later duplicates win; flags such as
/// `?uploads` map to an empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    params: BTreeMap<String, String>,
}

impl QueryParams {
    pub fn parse(raw: Option<&str>) -> Self {
        let mut params = BTreeMap::new();
        for part in raw.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (name, value) = part.split_once('=').unwrap_or((part, ""));
            params.insert(form_decode(name), form_decode(value));
        }
        Self { params }
    }

    pub fn has(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Value of `name` unless it is absent or empty.
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.is_empty())
    }
}

fn form_decode(s: &str) -> String {
    percent_decode_str(&s.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

// ── Resolved request ────────────────────────────────────────────────

/// Which S3 sub-resource the query string selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubResource {
    None,
    Versioning,
    Versions,
    Uploads,
    Delete,
    /// A bucket-level listing narrowed by `prefix`.
    PrefixListing,
}

impl SubResource {
    /// Flags are checked in a fixed order; the first present one wins.
    /// `uploads` and `delete` come first since they decide what a `POST`
    /// does.
    pub fn of(query: &QueryParams) -> Self {
        if query.has("uploads") {
            SubResource::Uploads
        } else if query.has("delete") {
            SubResource::Delete
        } else if query.has("versioning") {
            SubResource::Versioning
        } else if query.has("versions") {
            SubResource::Versions
        } else if query.non_empty("prefix").is_some() {
            SubResource::PrefixListing
        } else {
            SubResource::None
        }
    }
}

/// A request resolved against the mount root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRequest {
    pub bucket: String,
    /// Decoded key, `/` separators preserved. Empty for bucket-level requests.
    pub key: String,
    /// `mount/bucket[/key]`.
    pub storage_path: PathBuf,
    pub sub_resource: SubResource,
    /// `prefix` query parameter, if non-empty.
    pub prefix: Option<String>,
    /// `delimiter` query parameter, if non-empty.
    pub delimiter: Option<String>,
}

impl ResolvedRequest {
    pub fn is_bucket_level(&self) -> bool {
        self.key.is_empty()
    }

    /// Directory of the bucket itself.
    pub fn bucket_path(&self) -> PathBuf {
        self.storage_path
            .ancestors()
            .nth(key_depth(&self.key))
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.storage_path.clone())
    }

    /// Key used by listing operations: the object key, or the `prefix`
    /// parameter for bucket-level requests.
    pub fn listing_key(&self) -> &str {
        if self.key.is_empty() {
            self.prefix.as_deref().unwrap_or("")
        } else {
            &self.key
        }
    }
}

/// Number of path components a key adds below the bucket directory.
fn key_depth(key: &str) -> usize {
    key.split('/').filter(|s| !s.is_empty()).count()
}

/// Why a path could not be resolved.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("bucket missing from request path")]
    MissingBucket,

    #[error("copy source must name both a bucket and a key")]
    MissingKey,

    #[error("path is not valid UTF-8 once decoded")]
    InvalidEncoding,

    #[error("path segment {0:?} is not allowed")]
    ForbiddenSegment(String),

    #[error("key {0:?} names no object")]
    EmptyKeyPath(String),

    #[error("bucket name {0:?} is reserved")]
    ReservedBucket(String),
}

// ── Resolver ────────────────────────────────────────────────────────

/// Maps request paths onto the mount root.
pub struct Resolver<'a> {
    mount: &'a Path,
    metadata_dir: &'a str,
}

impl<'a> Resolver<'a> {
    pub fn new(config: &'a StorageConfig) -> Self {
        Self {
            mount: &config.mount,
            metadata_dir: &config.metadata_dir,
        }
    }

    /// Resolve a raw (still percent-encoded) URL path and its query.
    ///
    /// The root path is not resolvable; `GET /` is handled before this.
    pub fn resolve(
        &self,
        raw_path: &str,
        query: &QueryParams,
    ) -> Result<ResolvedRequest, ResolveError> {
        let (bucket, key) = split_path(raw_path)?;
        self.build(bucket, key, query)
    }

    /// Resolve an `X-Amz-Copy-Source` header (`[/]bucket/key[?versionId=...]`,
    /// URL-encoded).
    ///
    /// The whole value is decoded before the optional leading `/` is
    /// stripped, so `%2Fbucket%2Fkey` names the same object as `/bucket/key`.
    pub fn resolve_copy_source(&self, header: &str) -> Result<ResolvedRequest, ResolveError> {
        let without_version = header.split_once('?').map_or(header, |(path, _)| path);
        let decoded = percent_decode_str(without_version)
            .decode_utf8()
            .map_err(|_| ResolveError::InvalidEncoding)?;
        let trimmed = decoded.strip_prefix('/').unwrap_or(decoded.as_ref());
        match trimmed.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                self.build(bucket.to_string(), key.to_string(), &QueryParams::default())
            }
            _ => Err(ResolveError::MissingKey),
        }
    }

    /// Resolve an already-decoded key inside `bucket`, as found in a batch
    /// delete body.
    pub fn resolve_key(&self, bucket: &str, key: &str) -> Result<ResolvedRequest, ResolveError> {
        if key.is_empty() {
            return Err(ResolveError::MissingKey);
        }
        self.build(bucket.to_string(), key.to_string(), &QueryParams::default())
    }

    fn build(
        &self,
        bucket: String,
        key: String,
        query: &QueryParams,
    ) -> Result<ResolvedRequest, ResolveError> {
        if bucket == self.metadata_dir {
            return Err(ResolveError::ReservedBucket(bucket));
        }
        for segment in std::iter::once(bucket.as_str()).chain(key.split('/')) {
            if segment == "." || segment == ".." || segment.contains('\0') {
                return Err(ResolveError::ForbiddenSegment(segment.to_string()));
            }
        }
        // A key of only separators would address the bucket directory.
        if !key.is_empty() && key_depth(&key) == 0 {
            return Err(ResolveError::EmptyKeyPath(key));
        }

        let mut storage_path = self.mount.join(&bucket);
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            storage_path.push(segment);
        }

        Ok(ResolvedRequest {
            bucket,
            key,
            storage_path,
            sub_resource: SubResource::of(query),
            prefix: query.non_empty("prefix").map(str::to_string),
            delimiter: query.non_empty("delimiter").map(str::to_string),
        })
    }
}

/// Whether a raw path addresses the service, a bucket or an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathShape {
    Service,
    Bucket,
    Object,
}

impl PathShape {
    /// Classify a raw path without resolving it. Paths the resolver would
    /// reject count as object paths and fail there.
    pub fn of(raw_path: &str) -> Self {
        if raw_path.is_empty() || raw_path == "/" {
            return PathShape::Service;
        }
        match split_path(raw_path) {
            Ok((_, key)) if key.is_empty() => PathShape::Bucket,
            _ => PathShape::Object,
        }
    }
}

/// Strip the leading `/`, decode once, then split into bucket and key.
fn split_path(raw_path: &str) -> Result<(String, String), ResolveError> {
    let trimmed = raw_path.strip_prefix('/').unwrap_or(raw_path);
    if trimmed.is_empty() {
        return Err(ResolveError::MissingBucket);
    }
    let decoded = percent_decode_str(trimmed)
        .decode_utf8()
        .map_err(|_| ResolveError::InvalidEncoding)?;
    let (bucket, key) = decoded.split_once('/').unwrap_or((decoded.as_ref(), ""));
    if bucket.is_empty() {
        return Err(ResolveError::MissingBucket);
    }
    Ok((bucket.to_string(), key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> StorageConfig {
        StorageConfig {
            mount: PathBuf::from("/srv/mount"),
            metadata_dir: ".dirstore".to_string(),
        }
    }

    fn resolve(path: &str, query: &str) -> Result<ResolvedRequest, ResolveError> {
        let config = storage();
        Resolver::new(&config).resolve(path, &QueryParams::parse(Some(query)))
    }

    #[test]
    fn test_query_params_decode() {
        let q = QueryParams::parse(Some("prefix=a+b%2Fc&uploads&max-keys=10"));
        assert_eq!(q.get("prefix"), Some("a b/c"));
        assert!(q.has("uploads"));
        assert_eq!(q.get("uploads"), Some(""));
        assert_eq!(q.non_empty("uploads"), None);
        assert_eq!(q.get("max-keys"), Some("10"));
        assert!(QueryParams::parse(None).get("prefix").is_none());
    }

    #[test]
    fn test_resolve_bucket() {
        let r = resolve("/photos", "").unwrap();
        assert_eq!(r.bucket, "photos");
        assert_eq!(r.key, "");
        assert!(r.is_bucket_level());
        assert_eq!(r.storage_path, PathBuf::from("/srv/mount/photos"));
        assert_eq!(r.sub_resource, SubResource::None);
    }

    #[test]
    fn test_resolve_object_keeps_separators() {
        let r = resolve("/photos/2024/jan/beach%20day.jpg", "").unwrap();
        assert_eq!(r.bucket, "photos");
        assert_eq!(r.key, "2024/jan/beach day.jpg");
        assert_eq!(
            r.storage_path,
            PathBuf::from("/srv/mount/photos/2024/jan/beach day.jpg")
        );
        assert_eq!(r.bucket_path(), PathBuf::from("/srv/mount/photos"));
    }

    #[test]
    fn test_resolve_trailing_slash_key() {
        let r = resolve("/photos/albums/", "").unwrap();
        assert_eq!(r.key, "albums/");
        assert_eq!(r.storage_path, PathBuf::from("/srv/mount/photos/albums"));
        assert_eq!(r.bucket_path(), PathBuf::from("/srv/mount/photos"));
    }

    #[test]
    fn test_resolve_bucket_with_trailing_slash_is_bucket_level() {
        let r = resolve("/photos/", "").unwrap();
        assert!(r.is_bucket_level());
    }

    #[test]
    fn test_resolve_root_is_missing_bucket() {
        assert_eq!(resolve("/", ""), Err(ResolveError::MissingBucket));
        assert_eq!(resolve("", ""), Err(ResolveError::MissingBucket));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        assert!(matches!(
            resolve("/photos/../../etc/passwd", ""),
            Err(ResolveError::ForbiddenSegment(_))
        ));
        assert!(matches!(
            resolve("/photos/%2E%2E/secret", ""),
            Err(ResolveError::ForbiddenSegment(_))
        ));
        assert!(matches!(resolve("/../x", ""), Err(ResolveError::ForbiddenSegment(_))));
    }

    #[test]
    fn test_resolve_double_slash_stays_inside_bucket() {
        let r = resolve("/photos//etc/passwd", "").unwrap();
        assert_eq!(r.key, "/etc/passwd");
        assert_eq!(r.storage_path, PathBuf::from("/srv/mount/photos/etc/passwd"));
    }

    #[test]
    fn test_resolve_rejects_separator_only_key() {
        assert_eq!(
            resolve("/photos//", ""),
            Err(ResolveError::EmptyKeyPath("/".into()))
        );
        assert_eq!(
            resolve("/photos///", ""),
            Err(ResolveError::EmptyKeyPath("//".into()))
        );
        let config = storage();
        assert_eq!(
            Resolver::new(&config).resolve_key("photos", "/"),
            Err(ResolveError::EmptyKeyPath("/".into()))
        );
    }

    #[test]
    fn test_resolve_rejects_metadata_bucket() {
        assert_eq!(
            resolve("/.dirstore/uploads", ""),
            Err(ResolveError::ReservedBucket(".dirstore".into()))
        );
    }

    #[test]
    fn test_resolve_invalid_utf8() {
        assert_eq!(resolve("/photos/%FF", ""), Err(ResolveError::InvalidEncoding));
    }

    #[test]
    fn test_sub_resource_detection_order() {
        assert_eq!(resolve("/b", "versioning").unwrap().sub_resource, SubResource::Versioning);
        assert_eq!(
            resolve("/b", "versions&versioning").unwrap().sub_resource,
            SubResource::Versioning
        );
        assert_eq!(resolve("/b/k", "uploads").unwrap().sub_resource, SubResource::Uploads);
        assert_eq!(resolve("/b", "delete").unwrap().sub_resource, SubResource::Delete);
        assert_eq!(resolve("/b", "delete&uploads").unwrap().sub_resource, SubResource::Uploads);
        assert_eq!(
            resolve("/b", "versioning&delete").unwrap().sub_resource,
            SubResource::Delete
        );
        assert_eq!(
            resolve("/b", "prefix=docs%2F").unwrap().sub_resource,
            SubResource::PrefixListing
        );
        assert_eq!(resolve("/b", "prefix=").unwrap().sub_resource, SubResource::None);
    }

    #[test]
    fn test_prefix_becomes_listing_key() {
        let r = resolve("/b", "prefix=docs%2Freadme&delimiter=%2F").unwrap();
        assert_eq!(r.listing_key(), "docs/readme");
        assert_eq!(r.delimiter.as_deref(), Some("/"));
        let r = resolve("/b/k", "prefix=ignored").unwrap();
        assert_eq!(r.listing_key(), "k");
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let first = resolve("/b/a%2Fb/c.txt", "versions&prefix=x").unwrap();
        let second = resolve("/b/a%2Fb/c.txt", "versions&prefix=x").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_copy_source() {
        let config = storage();
        let resolver = Resolver::new(&config);
        let r = resolver.resolve_copy_source("%2Fsrc%2Fold.txt").unwrap();
        assert_eq!((r.bucket.as_str(), r.key.as_str()), ("src", "old.txt"));
        assert_eq!(r.storage_path, PathBuf::from("/srv/mount/src/old.txt"));

        let r = resolver.resolve_copy_source("src/dir/old.txt?versionId=null").unwrap();
        assert_eq!(r.key, "dir/old.txt");

        let r = resolver.resolve_copy_source("/src/a%20b.txt").unwrap();
        assert_eq!((r.bucket.as_str(), r.key.as_str()), ("src", "a b.txt"));

        assert_eq!(
            resolver.resolve_copy_source("/src"),
            Err(ResolveError::MissingKey)
        );
        assert_eq!(
            resolver.resolve_copy_source("%2F%2Fold.txt"),
            Err(ResolveError::MissingKey)
        );
        assert_eq!(
            resolver.resolve_copy_source("%2Fsrc%2F%2F"),
            Err(ResolveError::EmptyKeyPath("/".into()))
        );
    }

    #[test]
    fn test_path_shape() {
        assert_eq!(PathShape::of("/"), PathShape::Service);
        assert_eq!(PathShape::of("/b"), PathShape::Bucket);
        assert_eq!(PathShape::of("/b/"), PathShape::Bucket);
        assert_eq!(PathShape::of("/b/k"), PathShape::Object);
        assert_eq!(PathShape::of("/b/%FF"), PathShape::Object);
    }
}
