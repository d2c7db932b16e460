//! Abstract storage backend trait.
//!
//! Operations address entries by the paths the resolver computed under the
//! mount root. Buckets are directories, objects are files, and a directory
//! below a bucket is a key prefix.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;

/// Boxed future returned by every [`StorageBackend`] method.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Failures a storage operation can report.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no such file or directory: {0}")]
    NotFound(PathBuf),

    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("directory not empty: {0}")]
    NotEmpty(PathBuf),

    #[error("path escapes the storage root: {0}")]
    OutsideRoot(PathBuf),

    #[error("refusing to remove the containing directory: {0}")]
    RemoveRoot(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What a path currently is on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Size and timestamps of one filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub kind: EntryKind,
    pub size: u64,
    pub modified: SystemTime,
}

impl EntryMeta {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// A named child of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub meta: EntryMeta,
}

/// Async filesystem contract used by the operation handlers.
pub trait StorageBackend: Send + Sync + 'static {
    /// Metadata for `path`, `None` if nothing is there.
    fn stat(&self, path: &Path) -> StorageFuture<'_, Option<EntryMeta>>;

    /// Top-level directories of the mount, sorted by name. Internal
    /// directories are excluded.
    fn list_buckets(&self) -> StorageFuture<'_, Vec<DirEntry>>;

    /// Children of a directory, sorted by name.
    fn read_dir(&self, path: &Path) -> StorageFuture<'_, Vec<DirEntry>>;

    /// Create a bucket directory. Fails with `AlreadyExists` if anything is
    /// already at `path`.
    fn create_bucket(&self, path: &Path) -> StorageFuture<'_, ()>;

    /// Remove an empty bucket directory. A non-empty one is left untouched
    /// and reported as `NotEmpty`.
    fn delete_bucket(&self, path: &Path) -> StorageFuture<'_, ()>;

    /// Full contents of a file.
    fn read_object(&self, path: &Path) -> StorageFuture<'_, Bytes>;

    /// Atomically replace the file at `path` with `data`, creating parent
    /// directories. Returns the quoted MD5 ETag.
    fn write_object(&self, path: &Path, data: Bytes) -> StorageFuture<'_, String>;

    /// Create a directory and its parents (a "folder" key).
    fn create_prefix(&self, path: &Path) -> StorageFuture<'_, ()>;

    /// Copy the file at `src` to `dst`, returning the new ETag and metadata.
    fn copy_object(&self, src: &Path, dst: &Path) -> StorageFuture<'_, (String, EntryMeta)>;

    /// Remove a file or a whole directory tree, then remove parent
    /// directories that became empty, stopping at `stop_at`.
    fn remove(&self, path: &Path, stop_at: &Path) -> StorageFuture<'_, ()>;

    /// Start a multipart upload for `key`: allocate a never-used upload id
    /// and its staging area. Returns the id.
    fn create_upload(&self, key: &str) -> StorageFuture<'_, String>;
}
