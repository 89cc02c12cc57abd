//! Promotion: moving a deposit from a bucket's root tree into its managed tree.
//!
//! The root tree is writable by untrusted parties, the managed tree is only
//! populated from here and by ingestion. A source is screened before anything
//! on disk changes, and the move itself is a single `rename`.
//!
//! Checks, first failure wins:
//!
//! 1. source missing                                    -> `PathNotFound`
//! 2. source outside the root tree or inside the managed tree,
//!    including through a symlinked parent directory    -> `PathNotFound`
//! 3. destination outside the managed tree              -> `PathInvalid` (fault)
//! 4. destination exists                                -> `PathAlreadyExists`
//! 5. source is a symlink or a multiply linked file     -> `PathContainsLinks`
//! 6. any symlink or multiply linked file below a source directory
//!                                                      -> `PathContainsLinks`

use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::attributes::FileAttributes;
use crate::cache::DigestCache;
use crate::digest::{Digest, DigestAlgorithm};
use crate::error::{Rejection, StorageError, Verdict};
use crate::evidence::ExistingBucket;
use crate::layout::{self, Layout};

/// Extension point around the rename, e.g. for ownership or permission
/// normalization. The engine itself changes neither.
#[async_trait]
pub trait PromotionHook: Send + Sync {
    /// Runs after screening, before the rename. An error aborts the move.
    async fn before_promote(&self, _source: &Path, _destination: &Path) -> Result<(), StorageError> {
        Ok(())
    }

    /// Runs after the rename. An error is reported, the move stays done.
    async fn after_promote(&self, _destination: &Path) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Hook that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

#[async_trait]
impl PromotionHook for NoopHook {}

/// Everything the move needs besides its arguments.
pub(crate) struct Promoter<'a> {
    pub layout: &'a Layout,
    pub hook: &'a dyn PromotionHook,
    pub cache: &'a Arc<DigestCache>,
    pub algorithm: DigestAlgorithm,
}

#[derive(Debug)]
enum Screening {
    Rejected(Rejection),
    Promotable {
        source: PathBuf,
        destination: PathBuf,
        bytes: u64,
    },
}

#[derive(Debug, PartialEq, Eq)]
enum TreeScan {
    ContainsLinks(PathBuf),
    Clean { bytes: u64 },
}

impl Promoter<'_> {
    pub(crate) async fn move_file(
        &self,
        bucket: &ExistingBucket,
        source_relative: &str,
        destination_relative: &str,
    ) -> Result<Verdict<FileAttributes>, StorageError> {
        let layout = self.layout.clone();
        let name = bucket.name().to_string();
        let (src, dst) = (source_relative.to_string(), destination_relative.to_string());
        let screening =
            tokio::task::spawn_blocking(move || screen(&layout, &name, &src, &dst)).await??;

        let (source, destination, bytes) = match screening {
            Screening::Rejected(rejection) => {
                debug!(
                    bucket = bucket.name(),
                    source = source_relative,
                    destination = destination_relative,
                    reason = rejection.kind(),
                    "promotion rejected"
                );
                return Ok(Err(rejection));
            }
            Screening::Promotable {
                source,
                destination,
                bytes,
            } => (source, destination, bytes),
        };

        self.hook.before_promote(&source, &destination).await?;

        let managed = self.layout.base_path(bucket.name(), true);
        let (from, to) = (source.clone(), destination.clone());
        let committed =
            tokio::task::spawn_blocking(move || commit(&from, &to, &managed)).await??;
        if !committed {
            return Ok(Err(Rejection::already_exists(bucket.name(), destination_relative)));
        }

        let _ = self.cache.async_compute_put(destination.clone(), self.algorithm);

        info!(
            bucket = bucket.name(),
            source = source_relative,
            destination = destination_relative,
            bytes,
            "promoted into managed tree"
        );

        if let Err(e) = self.hook.after_promote(&destination).await {
            error!(destination = %destination.display(), error = %e, "post-promotion hook failed");
            return Err(e);
        }

        Ok(Ok(FileAttributes::new(&destination, bytes, Digest::empty())))
    }
}

/// Blocking. Runs every check that precedes the rename; touches nothing.
fn screen(
    layout: &Layout,
    bucket: &str,
    source_relative: &str,
    destination_relative: &str,
) -> Result<Screening, StorageError> {
    let root_tree = layout.base_path(bucket, false);
    let managed = layout.base_path(bucket, true);
    let source = layout::resolve(&root_tree, source_relative);
    let destination = layout::resolve(&managed, destination_relative);

    let not_found = || Ok(Screening::Rejected(Rejection::not_found(bucket, source_relative)));

    // Lexical confinement before any stat.
    if !layout::is_strictly_within(&source, &root_tree) || layout::is_within(&source, &managed) {
        return not_found();
    }

    let source_meta = match fs::symlink_metadata(&source) {
        Ok(meta) => meta,
        Err(e) if is_unreachable(&e) => return not_found(),
        Err(e) => return Err(e.into()),
    };

    if !parent_confined(&source, &root_tree, &managed)? {
        return not_found();
    }

    if !layout::is_strictly_within(&destination, &managed) {
        warn!(
            bucket,
            destination = destination_relative,
            "promotion destination escapes the managed tree"
        );
        return Err(StorageError::PathInvalid {
            path: destination,
            base: managed,
        });
    }

    match fs::symlink_metadata(&destination) {
        Ok(_) => {
            return Ok(Screening::Rejected(Rejection::already_exists(
                bucket,
                destination_relative,
            )))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let contains_links = || {
        Ok(Screening::Rejected(Rejection::contains_links(
            bucket,
            source_relative,
        )))
    };

    if source_meta.file_type().is_symlink()
        || (source_meta.is_file() && link_count(&source_meta) > 1)
    {
        return contains_links();
    }

    let bytes = if source_meta.is_dir() {
        match scan_tree(&source)? {
            TreeScan::ContainsLinks(offender) => {
                debug!(offender = %offender.display(), "link found below promotion source");
                return contains_links();
            }
            TreeScan::Clean { bytes } => bytes,
        }
    } else {
        source_meta.len()
    };

    Ok(Screening::Promotable {
        source,
        destination,
        bytes,
    })
}

/// Stat failures that mean the caller cannot see the source at all.
fn is_unreachable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory | io::ErrorKind::PermissionDenied
    )
}

/// The real parent directory of `source` lies inside the root tree and outside
/// the managed tree, after resolving any symlinked ancestors.
fn parent_confined(source: &Path, root_tree: &Path, managed: &Path) -> io::Result<bool> {
    let Some(parent) = source.parent() else {
        return Ok(false);
    };
    let parent = fs::canonicalize(parent)?;
    let root_tree = fs::canonicalize(root_tree)?;
    let managed = fs::canonicalize(managed)?;
    Ok(parent.starts_with(&root_tree) && !parent.starts_with(&managed))
}

/// Walks lazily and stops at the first symlink or multiply linked file.
/// Sums regular file sizes on the way.
fn scan_tree(dir: &Path) -> io::Result<TreeScan> {
    let mut bytes = 0u64;
    for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            return Ok(TreeScan::ContainsLinks(entry.into_path()));
        }
        if file_type.is_file() {
            let meta = entry.metadata()?;
            if link_count(&meta) > 1 {
                return Ok(TreeScan::ContainsLinks(entry.into_path()));
            }
            bytes += meta.len();
        }
    }
    Ok(TreeScan::Clean { bytes })
}

/// Blocking. Creates the destination's parents and renames. Returns `false`
/// when the destination appeared after screening.
fn commit(source: &Path, destination: &Path, managed: &Path) -> Result<bool, StorageError> {
    let Some(parent) = destination.parent() else {
        return Err(StorageError::PathInvalid {
            path: destination.to_path_buf(),
            base: managed.to_path_buf(),
        });
    };
    fs::create_dir_all(parent)?;

    if !fs::canonicalize(parent)?.starts_with(fs::canonicalize(managed)?) {
        warn!(destination = %destination.display(), "destination parent resolves outside the managed tree");
        return Err(StorageError::PathInvalid {
            path: destination.to_path_buf(),
            base: managed.to_path_buf(),
        });
    }

    // rename(2) replaces an existing file, so look once more right before it.
    if fs::symlink_metadata(destination).is_ok() {
        return Ok(false);
    }

    fs::rename(source, destination)
        .map_err(|e| StorageError::internal("atomic rename failed", e))?;
    Ok(true)
}

#[cfg(unix)]
fn link_count(meta: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.nlink()
}

#[cfg(not(unix))]
fn link_count(_meta: &Metadata) -> u64 {
    1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn setup() -> anyhow::Result<(TempDir, Layout)> {
        let temp = TempDir::new()?;
        fs::create_dir_all(temp.path().join("inbox/managed"))?;
        fs::create_dir_all(temp.path().join("inbox/incoming"))?;
        let layout = Layout::new(temp.path(), "managed");
        Ok((temp, layout))
    }

    fn rejection(screening: Screening) -> Rejection {
        match screening {
            Screening::Rejected(r) => r,
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_file_is_promotable() -> anyhow::Result<()> {
        let (temp, layout) = setup()?;
        fs::write(temp.path().join("inbox/incoming/a.txt"), b"12345")?;

        match screen(&layout, "inbox", "incoming/a.txt", "docs/a.txt")? {
            Screening::Promotable { bytes, destination, .. } => {
                assert_eq!(bytes, 5);
                assert!(destination.ends_with("inbox/managed/docs/a.txt"));
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_missing_source_is_not_found() -> anyhow::Result<()> {
        let (_temp, layout) = setup()?;
        let r = rejection(screen(&layout, "inbox", "incoming/nope.txt", "x.txt")?);
        assert_eq!(r.kind(), "PathNotFound");
        Ok(())
    }

    #[test]
    fn test_source_inside_managed_tree_is_not_found() -> anyhow::Result<()> {
        let (temp, layout) = setup()?;
        fs::write(temp.path().join("inbox/managed/already.txt"), b"x")?;
        let r = rejection(screen(&layout, "inbox", "managed/already.txt", "again.txt")?);
        assert_eq!(r.kind(), "PathNotFound");
        Ok(())
    }

    #[test]
    fn test_source_outside_root_tree_is_not_found() -> anyhow::Result<()> {
        let (temp, layout) = setup()?;
        fs::create_dir_all(temp.path().join("other"))?;
        fs::write(temp.path().join("other/secret.txt"), b"x")?;
        let r = rejection(screen(&layout, "inbox", "../other/secret.txt", "stolen.txt")?);
        assert_eq!(r.kind(), "PathNotFound");
        Ok(())
    }

    #[test]
    fn test_source_below_a_regular_file_is_not_found() -> anyhow::Result<()> {
        let (temp, layout) = setup()?;
        fs::write(temp.path().join("inbox/incoming/file.txt"), b"x")?;
        let r = rejection(screen(&layout, "inbox", "incoming/file.txt/ghost", "ghost")?);
        assert_eq!(r.kind(), "PathNotFound");
        Ok(())
    }

    #[test]
    fn test_escaping_source_is_not_found_without_stat() -> anyhow::Result<()> {
        let (temp, layout) = setup()?;
        fs::write(temp.path().join("plain.txt"), b"x")?;
        for source in ["../../plain.txt/ghost", "../../no/such/dir/x", "../plain.txt"] {
            let r = rejection(screen(&layout, "inbox", source, "x.txt")?);
            assert_eq!(r.kind(), "PathNotFound", "{source}");
        }
        Ok(())
    }

    #[test]
    fn test_source_under_symlinked_parent_is_not_found() -> anyhow::Result<()> {
        let (temp, layout) = setup()?;
        fs::create_dir_all(temp.path().join("other"))?;
        fs::write(temp.path().join("other/secret.txt"), b"x")?;
        symlink(temp.path().join("other"), temp.path().join("inbox/incoming/door"))?;

        let r = rejection(screen(&layout, "inbox", "incoming/door/secret.txt", "s.txt")?);
        assert_eq!(r.kind(), "PathNotFound");
        Ok(())
    }

    #[test]
    fn test_escaping_destination_is_path_invalid() -> anyhow::Result<()> {
        let (temp, layout) = setup()?;
        fs::write(temp.path().join("inbox/incoming/a.txt"), b"x")?;
        let result = screen(&layout, "inbox", "incoming/a.txt", "../incoming/b.txt");
        assert!(matches!(result, Err(StorageError::PathInvalid { .. })));
        Ok(())
    }

    #[test]
    fn test_existing_destination_is_rejected() -> anyhow::Result<()> {
        let (temp, layout) = setup()?;
        fs::write(temp.path().join("inbox/incoming/a.txt"), b"x")?;
        fs::write(temp.path().join("inbox/managed/a.txt"), b"y")?;
        let r = rejection(screen(&layout, "inbox", "incoming/a.txt", "a.txt")?);
        assert_eq!(r.kind(), "PathAlreadyExists");
        Ok(())
    }

    #[test]
    fn test_symlink_source_contains_links() -> anyhow::Result<()> {
        let (temp, layout) = setup()?;
        fs::write(temp.path().join("inbox/incoming/real.txt"), b"x")?;
        symlink(
            temp.path().join("inbox/incoming/real.txt"),
            temp.path().join("inbox/incoming/link.txt"),
        )?;
        let r = rejection(screen(&layout, "inbox", "incoming/link.txt", "link.txt")?);
        assert_eq!(r.kind(), "PathContainsLinks");
        Ok(())
    }

    #[test]
    fn test_hard_linked_source_contains_links() -> anyhow::Result<()> {
        let (temp, layout) = setup()?;
        fs::write(temp.path().join("inbox/incoming/one.txt"), b"x")?;
        fs::hard_link(
            temp.path().join("inbox/incoming/one.txt"),
            temp.path().join("inbox/incoming/two.txt"),
        )?;
        let r = rejection(screen(&layout, "inbox", "incoming/one.txt", "one.txt")?);
        assert_eq!(r.kind(), "PathContainsLinks");
        Ok(())
    }

    #[test]
    fn test_scan_stops_at_nested_symlink() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let dir = temp.path().join("tree");
        fs::create_dir_all(dir.join("a/b/c"))?;
        fs::write(dir.join("a/file.txt"), b"1234")?;
        symlink("/etc/passwd", dir.join("a/b/c/passwd"))?;

        match scan_tree(&dir)? {
            TreeScan::ContainsLinks(offender) => assert!(offender.ends_with("a/b/c/passwd")),
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_scan_detects_nested_hard_link() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let dir = temp.path().join("tree");
        fs::create_dir_all(dir.join("deep"))?;
        fs::write(temp.path().join("outside.txt"), b"shared")?;
        fs::hard_link(temp.path().join("outside.txt"), dir.join("deep/alias.txt"))?;

        assert!(matches!(scan_tree(&dir)?, TreeScan::ContainsLinks(_)));
        Ok(())
    }

    #[test]
    fn test_scan_sums_regular_files() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let dir = temp.path().join("tree");
        fs::create_dir_all(dir.join("x/y"))?;
        fs::write(dir.join("a.bin"), vec![0u8; 100])?;
        fs::write(dir.join("x/y/b.bin"), vec![0u8; 23])?;

        assert_eq!(scan_tree(&dir)?, TreeScan::Clean { bytes: 123 });
        Ok(())
    }

    #[test]
    fn test_commit_refuses_late_destination() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let managed = temp.path().join("managed");
        fs::create_dir_all(&managed)?;
        fs::write(temp.path().join("src.txt"), b"src")?;
        fs::write(managed.join("dst.txt"), b"dst")?;

        assert!(!commit(&temp.path().join("src.txt"), &managed.join("dst.txt"), &managed)?);
        assert_eq!(fs::read(managed.join("dst.txt"))?, b"dst");
        assert!(temp.path().join("src.txt").exists());
        Ok(())
    }
}
