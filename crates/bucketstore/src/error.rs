//! Outcome types.
//!
//! Two channels that never mix: a [`Rejection`] is an expected business
//! outcome the caller branches on, a [`StorageError`] is a fault that fails the
//! operation. Operations that can reject return `Result<Verdict<T>, StorageError>`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Expected, recoverable outcomes keyed by bucket and relative path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("path not found: {path} in bucket {bucket}")]
    PathNotFound { bucket: String, path: String },

    #[error("path already exists: {path} in bucket {bucket}")]
    PathAlreadyExists { bucket: String, path: String },

    #[error("path contains symbolic or hard links: {path} in bucket {bucket}")]
    PathContainsLinks { bucket: String, path: String },
}

impl Rejection {
    pub fn not_found(bucket: &str, path: &str) -> Self {
        Rejection::PathNotFound {
            bucket: bucket.to_string(),
            path: path.to_string(),
        }
    }

    pub fn already_exists(bucket: &str, path: &str) -> Self {
        Rejection::PathAlreadyExists {
            bucket: bucket.to_string(),
            path: path.to_string(),
        }
    }

    pub fn contains_links(bucket: &str, path: &str) -> Self {
        Rejection::PathContainsLinks {
            bucket: bucket.to_string(),
            path: path.to_string(),
        }
    }

    /// Discriminator used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Rejection::PathNotFound { .. } => "PathNotFound",
            Rejection::PathAlreadyExists { .. } => "PathAlreadyExists",
            Rejection::PathContainsLinks { .. } => "PathContainsLinks",
        }
    }
}

/// Business result of an operation that passed without faults.
pub type Verdict<T> = Result<T, Rejection>;

/// Faults. `Clone` so a single computation result can be handed to every
/// waiter of a shared digest computation.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The resolved path escaped the tree it must stay in.
    #[error("path {path} resolves outside of {base}")]
    PathInvalid { path: PathBuf, base: PathBuf },

    #[error("internal storage error: {0}")]
    Internal(String),

    /// A witness minted by a store with a different root volume was presented.
    #[error("precondition evidence was issued for {issued_for}, not {store_root}")]
    PreconditionViolated {
        issued_for: PathBuf,
        store_root: PathBuf,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StorageError {
    pub fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        StorageError::Internal(format!("{context}: {err}"))
    }

    /// Discriminator used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::PathInvalid { .. } => "PathInvalid",
            _ => "InternalError",
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Internal(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageError::internal("blocking task failed", err)
    }
}
