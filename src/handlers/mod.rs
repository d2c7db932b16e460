//! S3 operation handlers.
//!
//! Handlers receive the storage backend and an already resolved request;
//! admission, authentication and operation selection happen in
//! [`crate::dispatch`].

pub mod bucket;
pub mod multipart;
pub mod object;

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

use crate::errors::S3Error;
use crate::request::ResolvedRequest;
use crate::storage::backend::{EntryMeta, StorageBackend};
use crate::xml::ObjectEntry;

/// Fail with `NoSuchBucket` unless the request's bucket directory exists.
pub(crate) async fn require_bucket(
    storage: &dyn StorageBackend,
    req: &ResolvedRequest,
) -> Result<(), S3Error> {
    match storage.stat(&req.bucket_path()).await? {
        Some(meta) if meta.is_dir() => Ok(()),
        _ => Err(S3Error::NoSuchBucket {
            bucket: req.bucket.clone(),
        }),
    }
}

/// ISO-8601 timestamp with millisecond precision, as used in XML bodies.
pub(crate) fn iso8601(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

/// ETag for entries whose content has not been hashed: derived from the
/// modification time and size so it changes whenever either does.
pub(crate) fn placeholder_etag(meta: &EntryMeta) -> String {
    let secs = meta
        .modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("\"{secs:x}-{:x}\"", meta.size)
}

pub(crate) fn object_entry(key: String, meta: &EntryMeta) -> ObjectEntry {
    ObjectEntry {
        key,
        last_modified: iso8601(meta.modified),
        etag: placeholder_etag(meta),
        size: if meta.is_dir() { 0 } else { meta.size },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::storage::backend::EntryKind;

    fn meta(kind: EntryKind, size: u64, secs: u64) -> EntryMeta {
        EntryMeta {
            kind,
            size,
            modified: UNIX_EPOCH + Duration::from_millis(secs * 1000 + 250),
        }
    }

    #[test]
    fn test_iso8601_has_millis() {
        let t = UNIX_EPOCH + Duration::from_millis(1_369_353_600_123);
        assert_eq!(iso8601(t), "2013-05-24T00:00:00.123Z");
    }

    #[test]
    fn test_placeholder_etag_tracks_size_and_mtime() {
        let a = placeholder_etag(&meta(EntryKind::File, 10, 100));
        assert_eq!(a, "\"64-a\"");
        assert_ne!(a, placeholder_etag(&meta(EntryKind::File, 11, 100)));
        assert_ne!(a, placeholder_etag(&meta(EntryKind::File, 10, 101)));
    }

    #[test]
    fn test_directory_entries_have_zero_size() {
        let entry = object_entry("docs/".into(), &meta(EntryKind::Directory, 4096, 1));
        assert_eq!(entry.size, 0);
        assert_eq!(entry.key, "docs/");
    }
}
