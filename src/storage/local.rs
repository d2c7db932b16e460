//! Local filesystem storage backend.
//!
//! The mount root holds one directory per bucket. A reserved metadata
//! directory inside it holds temp files for atomic writes and multipart
//! staging areas; it is never reported as a bucket.
//!
//! All object writes go through a temp file: write, fsync, rename.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use md5::{Digest, Md5};
use tokio::io::AsyncWriteExt;

use super::backend::{DirEntry, EntryKind, EntryMeta, StorageBackend, StorageError, StorageFuture};

/// Attempts at finding an unused upload id before giving up.
const UPLOAD_ID_ATTEMPTS: usize = 8;

/// Serves buckets from directories under a mount root.
pub struct LocalBackend {
    root: PathBuf,
    metadata_dir: String,
}

impl LocalBackend {
    /// Create a `LocalBackend` rooted at `root`.
    ///
    /// The root and the metadata directory (with its `tmp` and `uploads`
    /// children) are created if they do not exist.
    pub fn new(root: impl Into<PathBuf>, metadata_dir: &str) -> anyhow::Result<Self> {
        let root = root.into();
        let backend = Self {
            root,
            metadata_dir: metadata_dir.to_string(),
        };
        std::fs::create_dir_all(backend.tmp_dir())?;
        std::fs::create_dir_all(backend.uploads_dir())?;
        Ok(backend)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join(&self.metadata_dir).join("tmp")
    }

    fn uploads_dir(&self) -> PathBuf {
        self.root.join(&self.metadata_dir).join("uploads")
    }

    /// Staging directory of an upload.
    pub fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.uploads_dir().join(upload_id)
    }

    /// Refuse paths outside the root or containing `..`.
    fn guard(&self, path: &Path) -> Result<PathBuf, StorageError> {
        let escapes = path
            .components()
            .any(|c| matches!(c, Component::ParentDir));
        if escapes || !path.starts_with(&self.root) {
            return Err(StorageError::OutsideRoot(path.to_path_buf()));
        }
        Ok(path.to_path_buf())
    }

    fn temp_path(&self) -> PathBuf {
        self.tmp_dir().join(format!("tmp-{}", uuid::Uuid::new_v4()))
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.temp_path();
        let written = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp_path, path).await
        }
        .await;
        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Ok(())
    }
}

fn entry_meta(meta: &std::fs::Metadata) -> EntryMeta {
    EntryMeta {
        kind: if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        },
        size: if meta.is_dir() { 0 } else { meta.len() },
        modified: meta.modified().unwrap_or(UNIX_EPOCH),
    }
}

fn not_found(err: std::io::Error, path: &Path) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(path.to_path_buf())
    } else {
        StorageError::Io(err)
    }
}

/// Quoted hex MD5, the S3 ETag of a single-part object.
pub fn md5_etag(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(data)))
}

async fn read_dir_sorted(path: &Path) -> Result<Vec<DirEntry>, StorageError> {
    let mut reader = tokio::fs::read_dir(path)
        .await
        .map_err(|e| not_found(e, path))?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        // Follows symlinks; a dangling link is skipped.
        let Ok(meta) = tokio::fs::metadata(entry.path()).await else {
            continue;
        };
        entries.push(DirEntry {
            name,
            meta: entry_meta(&meta),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

impl StorageBackend for LocalBackend {
    fn stat(&self, path: &Path) -> StorageFuture<'_, Option<EntryMeta>> {
        let path = path.to_path_buf();
        Box::pin(async move {
            let path = self.guard(&path)?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) => Ok(Some(entry_meta(&meta))),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
                // A file used as a directory component.
                Err(err) if err.kind() == ErrorKind::NotADirectory => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn list_buckets(&self) -> StorageFuture<'_, Vec<DirEntry>> {
        Box::pin(async move {
            let entries = read_dir_sorted(&self.root).await?;
            Ok(entries
                .into_iter()
                .filter(|e| e.meta.is_dir() && e.name != self.metadata_dir)
                .collect())
        })
    }

    fn read_dir(&self, path: &Path) -> StorageFuture<'_, Vec<DirEntry>> {
        let path = path.to_path_buf();
        Box::pin(async move {
            let path = self.guard(&path)?;
            read_dir_sorted(&path).await
        })
    }

    fn create_bucket(&self, path: &Path) -> StorageFuture<'_, ()> {
        let path = path.to_path_buf();
        Box::pin(async move {
            let path = self.guard(&path)?;
            tokio::fs::create_dir(&path).await.map_err(|err| {
                if err.kind() == ErrorKind::AlreadyExists {
                    StorageError::AlreadyExists(path.clone())
                } else {
                    StorageError::Io(err)
                }
            })
        })
    }

    fn delete_bucket(&self, path: &Path) -> StorageFuture<'_, ()> {
        let path = path.to_path_buf();
        Box::pin(async move {
            let path = self.guard(&path)?;
            let mut reader = tokio::fs::read_dir(&path)
                .await
                .map_err(|e| not_found(e, &path))?;
            if reader.next_entry().await?.is_some() {
                return Err(StorageError::NotEmpty(path));
            }
            tokio::fs::remove_dir(&path)
                .await
                .map_err(|e| not_found(e, &path))
        })
    }

    fn read_object(&self, path: &Path) -> StorageFuture<'_, Bytes> {
        let path = path.to_path_buf();
        Box::pin(async move {
            let path = self.guard(&path)?;
            let data = tokio::fs::read(&path)
                .await
                .map_err(|e| not_found(e, &path))?;
            Ok(Bytes::from(data))
        })
    }

    fn write_object(&self, path: &Path, data: Bytes) -> StorageFuture<'_, String> {
        let path = path.to_path_buf();
        Box::pin(async move {
            let path = self.guard(&path)?;
            self.write_atomic(&path, &data).await?;
            Ok(md5_etag(&data))
        })
    }

    fn create_prefix(&self, path: &Path) -> StorageFuture<'_, ()> {
        let path = path.to_path_buf();
        Box::pin(async move {
            let path = self.guard(&path)?;
            tokio::fs::create_dir_all(&path).await?;
            Ok(())
        })
    }

    fn copy_object(&self, src: &Path, dst: &Path) -> StorageFuture<'_, (String, EntryMeta)> {
        let src = src.to_path_buf();
        let dst = dst.to_path_buf();
        Box::pin(async move {
            let data = self.read_object(&src).await?;
            let etag = self.write_object(&dst, data).await?;
            let meta = tokio::fs::metadata(&dst).await?;
            Ok((etag, entry_meta(&meta)))
        })
    }

    fn remove(&self, path: &Path, stop_at: &Path) -> StorageFuture<'_, ()> {
        let path = path.to_path_buf();
        let stop_at = stop_at.to_path_buf();
        Box::pin(async move {
            let path = self.guard(&path)?;
            if path == stop_at {
                return Err(StorageError::RemoveRoot(path));
            }
            let meta = tokio::fs::symlink_metadata(&path)
                .await
                .map_err(|e| not_found(e, &path))?;
            if meta.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }

            // Prune parents emptied by the removal; the first non-empty one
            // ends the walk.
            let mut current = path.parent();
            while let Some(dir) = current {
                if dir == stop_at.as_path() || !dir.starts_with(&stop_at) {
                    break;
                }
                if tokio::fs::remove_dir(dir).await.is_err() {
                    break;
                }
                current = dir.parent();
            }
            Ok(())
        })
    }

    fn create_upload(&self, key: &str) -> StorageFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            for _ in 0..UPLOAD_ID_ATTEMPTS {
                let upload_id = uuid::Uuid::new_v4().to_string();
                let staging = self.upload_dir(&upload_id);
                match tokio::fs::create_dir(&staging).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                    Err(err) => return Err(err.into()),
                }

                // A bucket-level upload has no key to stage.
                if key.split('/').all(str::is_empty) {
                    return Ok(upload_id);
                }
                let mut file_path = staging;
                for segment in key.split('/').filter(|s| !s.is_empty()) {
                    file_path.push(segment);
                }
                let file_path = self.guard(&file_path)?;
                if let Some(parent) = file_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::File::create(&file_path).await?;
                return Ok(upload_id);
            }
            Err(StorageError::AlreadyExists(self.uploads_dir()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let backend = LocalBackend::new(dir.path(), ".dirstore").expect("failed to create backend");
        (dir, backend)
    }

    #[tokio::test]
    async fn test_new_creates_metadata_dirs() {
        let (dir, _backend) = test_backend();
        assert!(dir.path().join(".dirstore/tmp").is_dir());
        assert!(dir.path().join(".dirstore/uploads").is_dir());
    }

    #[tokio::test]
    async fn test_write_and_read_roundtrip() {
        let (dir, backend) = test_backend();
        let bucket = dir.path().join("test-bucket");
        backend.create_bucket(&bucket).await.unwrap();

        let data = Bytes::from("hello world");
        let etag = backend
            .write_object(&bucket.join("key.txt"), data.clone())
            .await
            .unwrap();
        assert_eq!(etag, "\"5eb63bbbe01eeed093cb22bb8f5acdc3\"");

        let read = backend.read_object(&bucket.join("key.txt")).await.unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_write_empty_object() {
        let (dir, backend) = test_backend();
        let etag = backend
            .write_object(&dir.path().join("b/empty.txt"), Bytes::new())
            .await
            .unwrap();
        assert_eq!(etag, "\"d41d8cd98f00b204e9800998ecf8427e\"");
    }

    #[tokio::test]
    async fn test_write_creates_parents_and_overwrites() {
        let (dir, backend) = test_backend();
        let path = dir.path().join("b/a/b/c/deep.txt");
        backend.write_object(&path, Bytes::from("one")).await.unwrap();
        backend.write_object(&path, Bytes::from("two")).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        // Temp files do not survive a successful write.
        let leftovers = std::fs::read_dir(dir.path().join(".dirstore/tmp")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_stat() {
        let (dir, backend) = test_backend();
        let path = dir.path().join("b/file.txt");
        assert_eq!(backend.stat(&path).await.unwrap(), None);
        backend.write_object(&path, Bytes::from("12345")).await.unwrap();

        let meta = backend.stat(&path).await.unwrap().unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.size, 5);
        assert!(backend.stat(&dir.path().join("b")).await.unwrap().unwrap().is_dir());
        // A file used as a directory is simply missing.
        assert_eq!(backend.stat(&path.join("child")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_guard_rejects_escape() {
        let (dir, backend) = test_backend();
        let outside = dir.path().join("b/../../etc/passwd");
        assert!(matches!(
            backend.stat(&outside).await,
            Err(StorageError::OutsideRoot(_))
        ));
        assert!(matches!(
            backend.read_object(Path::new("/etc/passwd")).await,
            Err(StorageError::OutsideRoot(_))
        ));
    }

    #[tokio::test]
    async fn test_list_buckets_skips_metadata_and_files() {
        let (dir, backend) = test_backend();
        backend.create_bucket(&dir.path().join("zeta")).await.unwrap();
        backend.create_bucket(&dir.path().join("alpha")).await.unwrap();
        std::fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        let names: Vec<String> = backend
            .list_buckets()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_create_bucket_twice() {
        let (dir, backend) = test_backend();
        let bucket = dir.path().join("b");
        backend.create_bucket(&bucket).await.unwrap();
        assert!(matches!(
            backend.create_bucket(&bucket).await,
            Err(StorageError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_bucket_not_empty_is_untouched() {
        let (dir, backend) = test_backend();
        let bucket = dir.path().join("b");
        backend
            .write_object(&bucket.join("keep.txt"), Bytes::from("x"))
            .await
            .unwrap();

        assert!(matches!(
            backend.delete_bucket(&bucket).await,
            Err(StorageError::NotEmpty(_))
        ));
        assert_eq!(std::fs::read(bucket.join("keep.txt")).unwrap(), b"x");

        backend.remove(&bucket.join("keep.txt"), &bucket).await.unwrap();
        backend.delete_bucket(&bucket).await.unwrap();
        assert!(!bucket.exists());
        assert!(matches!(
            backend.delete_bucket(&bucket).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_dir_sorted() {
        let (dir, backend) = test_backend();
        let bucket = dir.path().join("b");
        for name in ["c.txt", "a.txt", "b/inner.txt"] {
            backend
                .write_object(&bucket.join(name), Bytes::from("x"))
                .await
                .unwrap();
        }
        let entries = backend.read_dir(&bucket).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b", "c.txt"]);
        assert!(entries[1].meta.is_dir());
    }

    #[tokio::test]
    async fn test_copy_object() {
        let (dir, backend) = test_backend();
        let src = dir.path().join("src/old.txt");
        let dst = dir.path().join("dst/new/copy.txt");
        backend.write_object(&src, Bytes::from("payload")).await.unwrap();

        let (etag, meta) = backend.copy_object(&src, &dst).await.unwrap();
        assert_eq!(etag, md5_etag(b"payload"));
        assert_eq!(meta.size, 7);
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload");
        assert!(src.exists());

        assert!(matches!(
            backend.copy_object(&dir.path().join("src/missing"), &dst).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_prunes_empty_parents() {
        let (dir, backend) = test_backend();
        let bucket = dir.path().join("b");
        let deep = bucket.join("x/y/z.txt");
        let sibling = bucket.join("x/keep.txt");
        backend.write_object(&deep, Bytes::from("1")).await.unwrap();
        backend.write_object(&sibling, Bytes::from("2")).await.unwrap();

        backend.remove(&deep, &bucket).await.unwrap();
        assert!(!bucket.join("x/y").exists());
        assert!(sibling.exists());

        backend.remove(&sibling, &bucket).await.unwrap();
        assert!(!bucket.join("x").exists());
        assert!(bucket.is_dir());
    }

    #[tokio::test]
    async fn test_remove_directory_tree() {
        let (dir, backend) = test_backend();
        let bucket = dir.path().join("b");
        backend
            .write_object(&bucket.join("tree/a/b.txt"), Bytes::from("1"))
            .await
            .unwrap();
        backend.remove(&bucket.join("tree"), &bucket).await.unwrap();
        assert!(!bucket.join("tree").exists());
        assert!(matches!(
            backend.remove(&bucket.join("tree"), &bucket).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_refuses_stop_directory() {
        let (dir, backend) = test_backend();
        let bucket = dir.path().join("b");
        backend
            .write_object(&bucket.join("sub/a.txt"), Bytes::from("1"))
            .await
            .unwrap();
        assert!(matches!(
            backend.remove(&bucket, &bucket).await,
            Err(StorageError::RemoveRoot(_))
        ));
        assert!(bucket.join("sub/a.txt").is_file());
    }

    #[tokio::test]
    async fn test_create_upload_ids_are_fresh() {
        let (_dir, backend) = test_backend();
        let first = backend.create_upload("videos/big.mp4").await.unwrap();
        let second = backend.create_upload("videos/big.mp4").await.unwrap();
        assert_ne!(first, second);

        let staged = backend.upload_dir(&first).join("videos/big.mp4");
        assert!(staged.is_file());
        assert_eq!(std::fs::metadata(&staged).unwrap().len(), 0);
    }
}
