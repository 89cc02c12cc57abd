//! Bucketed file storage on a single node.
//!
//! Every bucket is a directory under the root volume. Clients drop files into
//! the bucket's root tree; the store owns the managed tree below it, which is
//! where uploads land and where promotions move root-tree content to.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use bucketstore::{BucketExistence, BucketStorage, DiskStore, PathExistence};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let store = DiskStore::at_root("/data")?;
//!
//! let BucketExistence::Exists(bucket) = store.exists("nexus").await? else {
//!     anyhow::bail!("no such bucket");
//! };
//!
//! // Promote an unmanaged deposit into the managed tree
//! match store.move_file(&bucket, "incoming/report.csv", "reports/2024/report.csv").await? {
//!     Ok(attrs) => println!("moved to {}", attrs.location),
//!     Err(rejection) => println!("refused: {rejection}"),
//! }
//!
//! // The digest is computed in the background after a move
//! if let PathExistence::Exists(path) = store.path_exists(&bucket, "reports/2024/report.csv").await? {
//!     println!("digest: {}", store.get_digest(&path).await?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `BUCKETSTORE_ROOT_VOLUME`: Directory holding the buckets (default: `~/.bucketstore/data`)
//! - `BUCKETSTORE_PROTECTED_DIR`: Managed tree name inside each bucket (default: `managed`)
//! - `BUCKETSTORE_DIGEST_ALGORITHM`: `SHA-256` (default), `SHA-512` or `BLAKE3`

pub mod archive;
pub mod attributes;
pub mod cache;
pub mod config;
pub mod digest;
pub mod error;
pub mod evidence;
mod ingest;
pub mod layout;
pub mod payload;
pub mod promote;
pub mod store;

// Re-exports for convenience
pub use archive::{Archiver, ByteStream, TarArchiver};
pub use attributes::FileAttributes;
pub use cache::DigestCache;
pub use config::StorageConfig;
pub use digest::{Digest, DigestAlgorithm};
pub use error::{Rejection, StorageError, Verdict};
pub use evidence::{AbsentPath, BucketExistence, ExistingBucket, ExistingPath, PathExistence};
pub use payload::{ErrorKind, ErrorPayload, RemoteError};
pub use promote::{NoopHook, PromotionHook};
pub use store::{BucketStorage, DiskStore, Retrieved};
