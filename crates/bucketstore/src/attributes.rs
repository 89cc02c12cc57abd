//! Attributes reported for stored files.

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::digest::Digest;

/// What ingestion and promotion report about the file they produced.
///
/// After a promotion `digest` is `Digest::empty()` until the background
/// recompute has stored the real value in the digest cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    /// `file://` URI of the stored path.
    pub location: String,

    /// Size in bytes (summed over regular files for directories).
    pub bytes: u64,

    pub digest: Digest,
}

impl FileAttributes {
    pub fn new(path: &Path, bytes: u64, digest: Digest) -> Self {
        Self {
            location: file_uri(path),
            bytes,
            digest,
        }
    }
}

/// `file://` URI for an absolute path.
pub fn file_uri(path: &Path) -> String {
    Url::from_file_path(path)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| format!("file://{}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DigestAlgorithm;

    #[test]
    fn test_location_is_file_uri() {
        let attrs = FileAttributes::new(
            Path::new("/data/nexus/nexus/a/b/c.txt"),
            5,
            DigestAlgorithm::Sha256.digest_bytes(b"hello"),
        );
        assert_eq!(attrs.location, "file:///data/nexus/nexus/a/b/c.txt");
        assert_eq!(attrs.bytes, 5);
    }

    #[test]
    fn test_location_escapes_spaces() {
        assert_eq!(
            file_uri(Path::new("/data/my bucket/managed/x")),
            "file:///data/my%20bucket/managed/x"
        );
    }

    #[test]
    fn test_serde_roundtrip() {
        let attrs = FileAttributes::new(Path::new("/data/b/m/x"), 0, Digest::empty());
        let json = serde_json::to_string(&attrs).unwrap();
        let restored: FileAttributes = serde_json::from_str(&json).unwrap();
        assert_eq!(attrs, restored);
    }
}
