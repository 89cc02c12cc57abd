//! Path resolution for buckets.
//!
//! Layout:
//! ```text
//! {root_volume}/
//! └── {bucket}/                    # root tree: unmanaged deposit area
//!     ├── incoming/...             # whatever untrusted writers drop here
//!     └── {protected_directory}/   # managed tree: promoted or ingested files
//! ```
//!
//! Every path is normalized lexically before it is compared, and containment
//! is checked component by component, never as a string prefix.

use std::path::{Component, Path, PathBuf};

/// Collapse `.` and `..` without touching the filesystem.
///
/// `..` never climbs above the root of an absolute path.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = match out.components().next_back() {
                    Some(Component::Normal(_)) => out.pop(),
                    _ => false,
                };
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Join a caller-supplied relative path onto `base`.
///
/// Root and prefix components of `relative` are dropped, so `"/a/b"` lands at
/// `base/a/b` instead of replacing `base`.
pub fn resolve(base: &Path, relative: &str) -> PathBuf {
    let mut joined = base.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::RootDir | Component::Prefix(_) => {}
            other => joined.push(other.as_os_str()),
        }
    }
    normalize(&joined)
}

/// `path` equals `base` or sits below it.
pub fn is_within(path: &Path, base: &Path) -> bool {
    path.starts_with(base)
}

/// `path` sits strictly below `base`.
pub fn is_strictly_within(path: &Path, base: &Path) -> bool {
    path != base && path.starts_with(base)
}

/// Resolves bucket names and relative paths against a root volume.
#[derive(Debug, Clone)]
pub struct Layout {
    root_volume: PathBuf,
    protected_directory: String,
}

impl Layout {
    pub fn new(root_volume: &Path, protected_directory: &str) -> Self {
        Self {
            root_volume: normalize(root_volume),
            protected_directory: protected_directory.to_string(),
        }
    }

    pub fn root_volume(&self) -> &Path {
        &self.root_volume
    }

    pub fn protected_directory(&self) -> &str {
        &self.protected_directory
    }

    /// `{root}/{bucket}` or `{root}/{bucket}/{protected}`, normalized.
    pub fn base_path(&self, bucket: &str, protected: bool) -> PathBuf {
        let mut path = self.root_volume.join(bucket);
        if protected {
            path.push(&self.protected_directory);
        }
        normalize(&path)
    }

    /// `relative` resolved against the bucket's root or managed tree.
    pub fn file_path(&self, bucket: &str, relative: &str, protected: bool) -> PathBuf {
        resolve(&self.base_path(bucket, protected), relative)
    }

    /// The managed tree of `bucket` sits exactly two levels below the root.
    ///
    /// Bucket names with separators or traversal sequences fail this.
    pub fn is_well_formed_bucket(&self, bucket: &str) -> bool {
        let mut components = Path::new(bucket).components();
        if !matches!((components.next(), components.next()), (Some(Component::Normal(_)), None)) {
            return false;
        }
        let managed = self.base_path(bucket, true);
        managed.parent().and_then(Path::parent) == Some(self.root_volume.as_path())
    }
}
