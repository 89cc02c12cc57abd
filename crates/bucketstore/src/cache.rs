//! Digest cache keyed by absolute path.
//!
//! Each key holds one slot: a pending computation shared by every waiter, a
//! settled digest stamped with the file metadata it was computed from, or a
//! failure left behind by a background recompute. Slots carry a generation so
//! an older computation can never overwrite a newer one.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::digest::{digest_path, Digest, DigestAlgorithm};
use crate::error::StorageError;

/// Metadata snapshot a cached digest is valid for. A directory's snapshot
/// covers every entry below it, not just the directory inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    len: u64,
    modified: Option<SystemTime>,
    tree: Option<[u8; 32]>,
}

impl Stamp {
    /// Blocking. Symlinks are refused so a digest never describes a target
    /// outside the tree the path was checked against.
    fn read(path: &Path) -> io::Result<Self> {
        let meta = std::fs::symlink_metadata(path)?;
        if meta.file_type().is_symlink() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to digest symbolic link {}", path.display()),
            ));
        }
        let tree = if meta.is_dir() {
            Some(tree_fingerprint(path)?)
        } else {
            None
        };
        Ok(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
            tree,
        })
    }
}

/// Relative path, length and mtime of every entry below `dir`, in walk order.
fn tree_fingerprint(dir: &Path) -> io::Result<[u8; 32]> {
    let mut hasher = blake3::Hasher::new();
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let meta = entry.metadata().map_err(io::Error::from)?;
        let relative = entry.path().strip_prefix(dir).map_err(io::Error::other)?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .unwrap_or_default();

        hasher.update(relative.as_os_str().as_encoded_bytes());
        hasher.update(&[0]);
        hasher.update(&meta.len().to_le_bytes());
        hasher.update(&mtime.as_nanos().to_le_bytes());
    }
    Ok(*hasher.finalize().as_bytes())
}

type Computed = Result<(Digest, Stamp), StorageError>;
type SharedComputation = Shared<BoxFuture<'static, Computed>>;

enum Slot {
    Pending {
        generation: u64,
        computation: SharedComputation,
    },
    Ready {
        generation: u64,
        digest: Digest,
        stamp: Stamp,
    },
    Failed {
        generation: u64,
        error: StorageError,
    },
}

impl Slot {
    fn generation(&self) -> u64 {
        match self {
            Slot::Pending { generation, .. }
            | Slot::Ready { generation, .. }
            | Slot::Failed { generation, .. } => *generation,
        }
    }
}

/// What `get` decided to do while holding the entry lock.
enum Lookup {
    Hit(Digest),
    Join(u64, SharedComputation),
}

/// Memoized digests with single-flight computation per path.
pub struct DigestCache {
    entries: DashMap<PathBuf, Slot>,
    generation: AtomicU64,
    computations: AtomicU64,
    algorithm: DigestAlgorithm,
    chunk_size: usize,
}

impl DigestCache {
    pub fn new(algorithm: DigestAlgorithm, chunk_size: usize) -> Self {
        Self {
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
            computations: AtomicU64::new(0),
            algorithm,
            chunk_size,
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Digest of `path`, computed at most once per change of the file.
    ///
    /// Callers racing on the same path await the same computation. A failure
    /// recorded by a background recompute is returned once and then evicted,
    /// and so is the slot of a path that no longer exists.
    pub async fn get(&self, path: &Path) -> Result<Digest, StorageError> {
        if let Some((_, Slot::Failed { error, .. })) = self
            .entries
            .remove_if(path, |_, slot| matches!(slot, Slot::Failed { .. }))
        {
            return Err(error);
        }

        let owned = path.to_path_buf();
        let current = match tokio::task::spawn_blocking(move || Stamp::read(&owned)).await? {
            Ok(stamp) => stamp,
            Err(e) => {
                if e.kind() == io::ErrorKind::NotFound {
                    self.entries.remove(path);
                }
                return Err(e.into());
            }
        };

        let lookup = match self.entries.entry(path.to_path_buf()) {
            Entry::Occupied(mut occupied) => {
                let reuse = match occupied.get() {
                    Slot::Ready { digest, stamp, .. } if *stamp == current => {
                        Some(Lookup::Hit(digest.clone()))
                    }
                    Slot::Pending {
                        generation,
                        computation,
                    } => Some(Lookup::Join(*generation, computation.clone())),
                    _ => None,
                };
                match reuse {
                    Some(lookup) => lookup,
                    None => {
                        debug!(path = %path.display(), "cached digest is stale");
                        let (generation, computation) = self.start(path.to_path_buf(), self.algorithm);
                        occupied.insert(Slot::Pending {
                            generation,
                            computation: computation.clone(),
                        });
                        Lookup::Join(generation, computation)
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let (generation, computation) = self.start(path.to_path_buf(), self.algorithm);
                vacant.insert(Slot::Pending {
                    generation,
                    computation: computation.clone(),
                });
                Lookup::Join(generation, computation)
            }
        };

        match lookup {
            Lookup::Hit(digest) => Ok(digest),
            Lookup::Join(generation, computation) => {
                let result = computation.await;
                self.settle(path, generation, &result, false);
                result.map(|(digest, _)| digest)
            }
        }
    }

    /// Recompute the digest of `path` in the background and store it.
    ///
    /// Returns immediately. The new computation supersedes whatever the slot
    /// held; `get` calls issued meanwhile join it.
    pub fn async_compute_put(self: &Arc<Self>, path: PathBuf, algorithm: DigestAlgorithm) -> JoinHandle<()> {
        let (generation, computation) = self.start(path.clone(), algorithm);
        self.entries.insert(
            path.clone(),
            Slot::Pending {
                generation,
                computation: computation.clone(),
            },
        );

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let result = computation.await;
            match &result {
                Ok((digest, _)) => debug!(path = %path.display(), %digest, "background digest stored"),
                Err(e) => warn!(path = %path.display(), error = %e, "background digest failed"),
            }
            cache.settle(&path, generation, &result, true);
        })
    }

    /// Forget whatever is cached for `path`.
    pub fn invalidate(&self, path: &Path) {
        self.entries.remove(path);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of digest computations started since creation.
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    fn start(&self, path: PathBuf, algorithm: DigestAlgorithm) -> (u64, SharedComputation) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.computations.fetch_add(1, Ordering::Relaxed);
        let chunk_size = self.chunk_size;

        let computation: BoxFuture<'static, Computed> = Box::pin(async move {
            match tokio::task::spawn_blocking(move || compute(&path, algorithm, chunk_size)).await {
                Ok(result) => result,
                Err(e) => Err(e.into()),
            }
        });
        (generation, computation.shared())
    }

    fn settle(&self, path: &Path, generation: u64, result: &Computed, remember_failure: bool) {
        let mut forget = false;
        if let Some(mut slot) = self.entries.get_mut(path) {
            if slot.generation() != generation {
                return;
            }
            match result {
                Ok((digest, stamp)) => {
                    *slot = Slot::Ready {
                        generation,
                        digest: digest.clone(),
                        stamp: *stamp,
                    };
                }
                Err(error) if remember_failure => {
                    *slot = Slot::Failed {
                        generation,
                        error: error.clone(),
                    };
                }
                Err(_) => forget = true,
            }
        }
        if forget {
            self.entries
                .remove_if(path, |_, slot| slot.generation() == generation);
        }
    }
}

fn compute(path: &Path, algorithm: DigestAlgorithm, chunk_size: usize) -> Computed {
    let stamp = Stamp::read(path)?;
    let digest = digest_path(path, algorithm, chunk_size)?;
    Ok((digest, stamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache() -> Arc<DigestCache> {
        Arc::new(DigestCache::new(DigestAlgorithm::Sha256, 4096))
    }

    #[tokio::test]
    async fn test_get_computes_once_and_memoizes() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let file = temp.path().join("a.txt");
        std::fs::write(&file, b"hello")?;

        let cache = cache();
        let first = cache.get(&file).await?;
        let second = cache.get(&file).await?;

        assert_eq!(first, DigestAlgorithm::Sha256.digest_bytes(b"hello"));
        assert_eq!(first, second);
        assert_eq!(cache.computations(), 1);
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_changed_file_is_recomputed() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let file = temp.path().join("a.txt");
        std::fs::write(&file, b"hello")?;

        let cache = cache();
        cache.get(&file).await?;

        std::fs::write(&file, b"hello, again")?;
        let digest = cache.get(&file).await?;
        assert_eq!(digest, DigestAlgorithm::Sha256.digest_bytes(b"hello, again"));
        assert_eq!(cache.computations(), 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gets_share_one_computation() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let file = temp.path().join("big.bin");
        std::fs::write(&file, vec![7u8; 4 * 1024 * 1024])?;

        let cache = cache();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let file = file.clone();
            handles.push(tokio::spawn(async move { cache.get(&file).await }));
        }

        let mut digests = Vec::new();
        for handle in handles {
            digests.push(handle.await??);
        }

        assert!(digests.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.computations(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_async_compute_put_fills_entry() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let file = temp.path().join("moved.txt");
        std::fs::write(&file, b"moved content")?;

        let cache = cache();
        cache
            .async_compute_put(file.clone(), DigestAlgorithm::Blake3)
            .await?;

        let digest = cache.get(&file).await?;
        assert_eq!(digest, DigestAlgorithm::Blake3.digest_bytes(b"moved content"));
        assert_eq!(cache.computations(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_async_compute_put_supersedes_stale_entry() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let file = temp.path().join("doc.txt");
        std::fs::write(&file, b"old")?;

        let cache = cache();
        let old = cache.get(&file).await?;

        std::fs::write(&file, b"new")?;
        cache
            .async_compute_put(file.clone(), DigestAlgorithm::Sha256)
            .await?;

        let new = cache.get(&file).await?;
        assert_ne!(old, new);
        assert_eq!(new, DigestAlgorithm::Sha256.digest_bytes(b"new"));
        Ok(())
    }

    #[tokio::test]
    async fn test_background_failure_is_reported_once() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let file = temp.path().join("not-there-yet.txt");

        let cache = cache();
        cache
            .async_compute_put(file.clone(), DigestAlgorithm::Sha256)
            .await?;

        assert!(matches!(cache.get(&file).await, Err(StorageError::Internal(_))));

        std::fs::write(&file, b"arrived")?;
        let digest = cache.get(&file).await?;
        assert_eq!(digest, DigestAlgorithm::Sha256.digest_bytes(b"arrived"));
        Ok(())
    }

    #[tokio::test]
    async fn test_directory_digest_follows_nested_edits() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let album = temp.path().join("album");
        std::fs::create_dir_all(album.join("disc1"))?;
        std::fs::write(album.join("disc1/t.flac"), b"aaaa")?;

        let cache = cache();
        let before = cache.get(&album).await?;

        std::fs::write(album.join("disc1/t.flac"), b"bbbbbb")?;
        let after_edit = cache.get(&album).await?;
        assert_ne!(before, after_edit);
        assert_eq!(after_edit, digest_path(&album, DigestAlgorithm::Sha256, 4096)?);

        std::fs::write(album.join("disc1/n.flac"), b"new track")?;
        let after_add = cache.get(&album).await?;
        assert_ne!(after_edit, after_add);
        assert_eq!(after_add, digest_path(&album, DigestAlgorithm::Sha256, 4096)?);

        let again = cache.get(&album).await?;
        assert_eq!(again, after_add);
        assert_eq!(cache.computations(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_vanished_path_is_evicted() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let file = temp.path().join("short-lived.txt");
        std::fs::write(&file, b"here")?;

        let cache = cache();
        cache.get(&file).await?;
        assert_eq!(cache.len(), 1);

        std::fs::remove_file(&file)?;
        assert!(cache.get(&file).await.is_err());
        assert!(cache.is_empty());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_is_not_digested() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let target = temp.path().join("target.txt");
        std::fs::write(&target, b"outside")?;
        let link = temp.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link)?;

        let cache = cache();
        assert!(matches!(cache.get(&link).await, Err(StorageError::Internal(_))));
        assert_eq!(cache.computations(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let file = temp.path().join("a.txt");
        std::fs::write(&file, b"data")?;

        let cache = cache();
        cache.get(&file).await?;
        cache.invalidate(&file);
        assert!(cache.is_empty());

        cache.get(&file).await?;
        assert_eq!(cache.computations(), 2);
        Ok(())
    }
}
