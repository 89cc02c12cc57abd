//! Existence evidence.
//!
//! Mutating and reading operations do not take bare bucket names: they take a
//! witness minted here, so "check before act" is enforced by the type system.
//! Witnesses are snapshots, not locks. The filesystem may change between the
//! check and the operation that consumes the witness.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::layout::{self, Layout};

/// Proof that a bucket's managed tree existed when checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingBucket {
    name: String,
    root_volume: PathBuf,
}

impl ExistingBucket {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn issued_for(&self) -> &Path {
        &self.root_volume
    }
}

/// Proof that a path inside a bucket's managed tree existed when checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingPath {
    bucket: ExistingBucket,
    relative: String,
    absolute: PathBuf,
}

impl ExistingPath {
    pub fn bucket(&self) -> &ExistingBucket {
        &self.bucket
    }

    pub fn relative(&self) -> &str {
        &self.relative
    }

    pub fn absolute(&self) -> &Path {
        &self.absolute
    }
}

/// Proof that a path did not exist (or was not visible) when checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsentPath {
    bucket: ExistingBucket,
    relative: String,
}

impl AbsentPath {
    pub fn bucket(&self) -> &ExistingBucket {
        &self.bucket
    }

    pub fn relative(&self) -> &str {
        &self.relative
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketExistence {
    Exists(ExistingBucket),
    DoesNotExist,
}

impl BucketExistence {
    pub fn exists(&self) -> bool {
        matches!(self, BucketExistence::Exists(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathExistence {
    Exists(ExistingPath),
    DoesNotExist(AbsentPath),
}

impl PathExistence {
    pub fn exists(&self) -> bool {
        matches!(self, PathExistence::Exists(_))
    }
}

/// Blocking. Exists iff the managed tree is a readable directory exactly two
/// levels below the root volume.
pub(crate) fn check_bucket(layout: &Layout, bucket: &str) -> BucketExistence {
    if !layout.is_well_formed_bucket(bucket) {
        return BucketExistence::DoesNotExist;
    }
    let managed = layout.base_path(bucket, true);
    let readable_dir = fs::metadata(&managed).map(|m| m.is_dir()).unwrap_or(false)
        && fs::read_dir(&managed).is_ok();

    if readable_dir {
        BucketExistence::Exists(ExistingBucket {
            name: bucket.to_string(),
            root_volume: layout.root_volume().to_path_buf(),
        })
    } else {
        BucketExistence::DoesNotExist
    }
}

/// Blocking. Exists iff the resolved path exists, is readable, and stays
/// inside the managed tree without passing through a symlink.
pub(crate) fn check_path(layout: &Layout, bucket: &ExistingBucket, relative: &str) -> PathExistence {
    let managed = layout.base_path(bucket.name(), true);
    let absolute = layout::resolve(&managed, relative);

    let visible = layout::is_within(&absolute, &managed)
        && !traverses_link(&managed, &absolute)
        && is_readable(&absolute);
    if visible {
        PathExistence::Exists(ExistingPath {
            bucket: bucket.clone(),
            relative: relative.to_string(),
            absolute,
        })
    } else {
        PathExistence::DoesNotExist(AbsentPath {
            bucket: bucket.clone(),
            relative: relative.to_string(),
        })
    }
}

/// True when `absolute` or any directory between it and `managed` is a symlink.
fn traverses_link(managed: &Path, absolute: &Path) -> bool {
    let Ok(relative) = absolute.strip_prefix(managed) else {
        return true;
    };
    let mut current = managed.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
    false
}

fn is_readable(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => fs::read_dir(path).is_ok(),
        Ok(_) => fs::File::open(path).is_ok(),
        Err(_) => false,
    }
}

/// Fails fast when a witness from another store is presented.
pub(crate) fn ensure_issued_by(bucket: &ExistingBucket, layout: &Layout) -> Result<(), StorageError> {
    if bucket.issued_for() == layout.root_volume() {
        Ok(())
    } else {
        Err(StorageError::PreconditionViolated {
            issued_for: bucket.issued_for().to_path_buf(),
            store_root: layout.root_volume().to_path_buf(),
        })
    }
}
