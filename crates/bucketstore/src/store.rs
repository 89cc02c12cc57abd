//! DiskStore: the bucketed storage engine on a local filesystem.
//!
//! Layout:
//! ```text
//! {root_volume}/
//! ├── photos/                  # bucket root tree (unmanaged deposits)
//! │   ├── incoming/...
//! │   └── managed/             # managed tree
//! │       └── 2024/cover.jpg
//! └── reports/
//!     └── managed/
//! ```
//!
//! Every operation takes evidence minted by [`DiskStore::exists`] or
//! [`DiskStore::path_exists`]. Filesystem syscalls run on tokio's blocking pool.
//!
//! Consistency: a promotion reports an empty digest and refreshes the cache in
//! the background. Until that finishes, `get_digest` on the destination may
//! compute the digest itself or join the background computation; readers
//! never observe a partially moved file because the move is a single rename.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::archive::{Archiver, ByteStream, TarArchiver};
use crate::attributes::FileAttributes;
use crate::cache::DigestCache;
use crate::config::StorageConfig;
use crate::digest::Digest;
use crate::error::{Rejection, StorageError, Verdict};
use crate::evidence::{self, AbsentPath, BucketExistence, ExistingBucket, ExistingPath, PathExistence};
use crate::ingest::{self, IngestSettings};
use crate::layout::{self, Layout};
use crate::promote::{NoopHook, PromotionHook, Promoter};

/// Retrieved content: file bytes with the file name, or a directory archive
/// without one.
pub struct Retrieved {
    pub stream: ByteStream,
    pub filename: Option<String>,
}

impl fmt::Debug for Retrieved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrieved")
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}

/// Operations of a bucket storage backend.
///
/// This allows for alternative implementations (e.g. in-memory for testing,
/// or a remote store behind the same evidence discipline).
#[async_trait]
pub trait BucketStorage: Send + Sync {
    /// Bucket existence evidence.
    async fn exists(&self, bucket: &str) -> Result<BucketExistence, StorageError>;

    /// Path existence evidence inside the bucket's managed tree.
    async fn path_exists(&self, bucket: &ExistingBucket, relative: &str) -> Result<PathExistence, StorageError>;

    /// Stream `source` into a path that did not exist.
    async fn create_file(&self, target: &AbsentPath, source: ByteStream) -> Result<FileAttributes, StorageError>;

    /// Promote a root-tree path into the managed tree.
    async fn move_file(
        &self,
        bucket: &ExistingBucket,
        source: &str,
        destination: &str,
    ) -> Result<Verdict<FileAttributes>, StorageError>;

    /// Stream a stored file, or an archive of a stored directory.
    async fn get_file(&self, target: &ExistingPath) -> Result<Verdict<Retrieved>, StorageError>;

    /// Digest of a stored path, served from the digest cache.
    async fn get_digest(&self, target: &ExistingPath) -> Result<Digest, StorageError>;
}

/// Filesystem-backed bucket store.
#[derive(Clone)]
pub struct DiskStore {
    config: StorageConfig,
    layout: Layout,
    cache: Arc<DigestCache>,
    archiver: Arc<dyn Archiver>,
    hook: Arc<dyn PromotionHook>,
}

impl fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DiskStore {
    /// Create a DiskStore with the given configuration.
    ///
    /// A relative root volume is anchored at the current directory, and the
    /// root volume is created if missing. Buckets are never created here.
    pub fn new(mut config: StorageConfig) -> Result<Self, StorageError> {
        config.validate()?;

        if config.root_volume.is_relative() {
            config.root_volume = std::env::current_dir()?.join(&config.root_volume);
        }
        std::fs::create_dir_all(&config.root_volume)
            .map_err(|e| StorageError::internal("failed to create root volume", e))?;

        let layout = Layout::new(&config.root_volume, &config.protected_directory);
        let cache = Arc::new(DigestCache::new(config.digest_algorithm, config.read_chunk_size));
        let archiver: Arc<dyn Archiver> = Arc::new(TarArchiver::new(config.read_chunk_size));

        Ok(Self {
            config,
            layout,
            cache,
            archiver,
            hook: Arc::new(NoopHook),
        })
    }

    /// Create a DiskStore over a specific root volume with default settings.
    pub fn at_root(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::new(StorageConfig::with_root_volume(path))
    }

    /// Replace the directory packaging collaborator.
    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = archiver;
        self
    }

    /// Install a promotion hook.
    pub fn with_hook(mut self, hook: Arc<dyn PromotionHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn cache(&self) -> &Arc<DigestCache> {
        &self.cache
    }

    fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            algorithm: self.config.digest_algorithm,
            channel_capacity: self.config.channel_capacity,
        }
    }

    /// Witness re-check shared by the path-taking operations.
    fn confined(&self, target: &ExistingPath) -> Result<(), StorageError> {
        evidence::ensure_issued_by(target.bucket(), &self.layout)?;
        let managed = self.layout.base_path(target.bucket().name(), true);
        if layout::is_within(target.absolute(), &managed) {
            Ok(())
        } else {
            warn!(bucket = target.bucket().name(), path = target.relative(), "path escapes the managed tree");
            Err(StorageError::PathInvalid {
                path: target.absolute().to_path_buf(),
                base: managed,
            })
        }
    }
}

#[async_trait]
impl BucketStorage for DiskStore {
    async fn exists(&self, bucket: &str) -> Result<BucketExistence, StorageError> {
        let layout = self.layout.clone();
        let bucket = bucket.to_string();
        Ok(tokio::task::spawn_blocking(move || evidence::check_bucket(&layout, &bucket)).await?)
    }

    async fn path_exists(&self, bucket: &ExistingBucket, relative: &str) -> Result<PathExistence, StorageError> {
        evidence::ensure_issued_by(bucket, &self.layout)?;
        let layout = self.layout.clone();
        let bucket = bucket.clone();
        let relative = relative.to_string();
        Ok(tokio::task::spawn_blocking(move || evidence::check_path(&layout, &bucket, &relative)).await?)
    }

    async fn create_file(&self, target: &AbsentPath, source: ByteStream) -> Result<FileAttributes, StorageError> {
        evidence::ensure_issued_by(target.bucket(), &self.layout)?;
        ingest::create_file(&self.layout, self.ingest_settings(), target, source).await
    }

    async fn move_file(
        &self,
        bucket: &ExistingBucket,
        source: &str,
        destination: &str,
    ) -> Result<Verdict<FileAttributes>, StorageError> {
        evidence::ensure_issued_by(bucket, &self.layout)?;
        let promoter = Promoter {
            layout: &self.layout,
            hook: self.hook.as_ref(),
            cache: &self.cache,
            algorithm: self.config.digest_algorithm,
        };
        promoter.move_file(bucket, source, destination).await
    }

    async fn get_file(&self, target: &ExistingPath) -> Result<Verdict<Retrieved>, StorageError> {
        self.confined(target)?;
        let path = target.absolute().to_path_buf();
        let not_found = || -> Result<Verdict<Retrieved>, StorageError> {
            Ok(Err(Rejection::not_found(target.bucket().name(), target.relative())))
        };

        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return not_found(),
            Err(e) => return Err(e.into()),
        };

        if meta.is_file() {
            let file = tokio::fs::File::open(&path).await?;
            let filename = path.file_name().map(|n| n.to_string_lossy().into_owned());
            Ok(Ok(Retrieved {
                stream: ReaderStream::with_capacity(file, self.config.read_chunk_size).boxed(),
                filename,
            }))
        } else if meta.is_dir() {
            Ok(Ok(Retrieved {
                stream: self.archiver.archive(path),
                filename: None,
            }))
        } else {
            not_found()
        }
    }

    async fn get_digest(&self, target: &ExistingPath) -> Result<Digest, StorageError> {
        self.confined(target)?;
        self.cache.get(target.absolute()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{stream, TryStreamExt};
    use tempfile::TempDir;

    async fn store_with_bucket(name: &str) -> anyhow::Result<(TempDir, DiskStore, ExistingBucket)> {
        let temp = TempDir::new()?;
        std::fs::create_dir_all(temp.path().join(name).join("managed"))?;
        let store = DiskStore::at_root(temp.path())?;
        match store.exists(name).await? {
            BucketExistence::Exists(bucket) => Ok((temp, store, bucket)),
            BucketExistence::DoesNotExist => anyhow::bail!("bucket {name} missing"),
        }
    }

    fn bytes_of(data: &'static [u8]) -> ByteStream {
        stream::iter(vec![Ok(Bytes::from_static(data))]).boxed()
    }

    #[tokio::test]
    async fn test_new_rejects_bad_protected_directory() {
        let config = StorageConfig::with_root_volume("/tmp/unused").protected_directory("a/b");
        assert!(matches!(DiskStore::new(config), Err(StorageError::Config(_))));
    }

    #[tokio::test]
    async fn test_create_then_get_file() -> anyhow::Result<()> {
        let (_temp, store, bucket) = store_with_bucket("docs").await?;

        let PathExistence::DoesNotExist(absent) = store.path_exists(&bucket, "a/b.txt").await? else {
            anyhow::bail!("path should be absent");
        };
        store.create_file(&absent, bytes_of(b"content")).await?;

        let PathExistence::Exists(existing) = store.path_exists(&bucket, "a/b.txt").await? else {
            anyhow::bail!("path should exist");
        };
        let retrieved = store.get_file(&existing).await?.expect("file should be retrievable");
        assert_eq!(retrieved.filename.as_deref(), Some("b.txt"));

        let chunks: Vec<Bytes> = retrieved.stream.try_collect().await?;
        assert_eq!(chunks.concat(), b"content");
        Ok(())
    }

    #[tokio::test]
    async fn test_get_directory_has_no_filename() -> anyhow::Result<()> {
        let (temp, store, bucket) = store_with_bucket("docs").await?;
        std::fs::create_dir_all(temp.path().join("docs/managed/folder"))?;
        std::fs::write(temp.path().join("docs/managed/folder/x.txt"), b"x")?;

        let PathExistence::Exists(existing) = store.path_exists(&bucket, "folder").await? else {
            anyhow::bail!("folder should exist");
        };
        let retrieved = store.get_file(&existing).await?.expect("directory should be retrievable");
        assert!(retrieved.filename.is_none());

        let chunks: Vec<Bytes> = retrieved.stream.try_collect().await?;
        assert!(!chunks.concat().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_vanished_path_is_not_found() -> anyhow::Result<()> {
        let (temp, store, bucket) = store_with_bucket("docs").await?;
        std::fs::write(temp.path().join("docs/managed/brief.txt"), b"x")?;

        let PathExistence::Exists(existing) = store.path_exists(&bucket, "brief.txt").await? else {
            anyhow::bail!("brief.txt should exist");
        };
        std::fs::remove_file(temp.path().join("docs/managed/brief.txt"))?;

        let verdict = store.get_file(&existing).await?;
        assert!(matches!(verdict, Err(Rejection::PathNotFound { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_witness_from_other_store_is_refused() -> anyhow::Result<()> {
        let (_temp_a, _store_a, bucket_a) = store_with_bucket("docs").await?;
        let (_temp_b, store_b, _bucket_b) = store_with_bucket("docs").await?;

        let result = store_b.path_exists(&bucket_a, "x").await;
        assert!(matches!(result, Err(StorageError::PreconditionViolated { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_get_digest_uses_cache() -> anyhow::Result<()> {
        let (temp, store, bucket) = store_with_bucket("docs").await?;
        std::fs::write(temp.path().join("docs/managed/d.txt"), b"digest me")?;

        let PathExistence::Exists(existing) = store.path_exists(&bucket, "d.txt").await? else {
            anyhow::bail!("d.txt should exist");
        };
        let first = store.get_digest(&existing).await?;
        let second = store.get_digest(&existing).await?;
        assert_eq!(first, second);
        assert_eq!(store.cache().computations(), 1);
        Ok(())
    }
}
