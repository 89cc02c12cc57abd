//! Content digests: the algorithm registry, the incremental accumulator, and
//! the `Digest` value handed back to callers.
//!
//! The algorithm is picked by name from configuration. Values are lowercase hex.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use thiserror::Error;
use walkdir::WalkDir;

/// A computed content digest.
///
/// `Digest::empty()` is a valid placeholder meaning "not yet computed"; it is
/// what a freshly promoted file reports until the background hash lands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    pub algorithm: String,
    pub value: String,
}

impl Digest {
    pub fn new(algorithm: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            value: value.into(),
        }
    }

    /// The "not yet computed" placeholder.
    pub fn empty() -> Self {
        Self::new("", "")
    }

    pub fn is_empty(&self) -> bool {
        self.algorithm.is_empty() && self.value.is_empty()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "<pending>")
        } else {
            write!(f, "{}:{}", self.algorithm, self.value)
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported digest algorithm: {0}")]
pub struct UnknownAlgorithm(pub String);

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Sha512,
    Blake3,
}

impl DigestAlgorithm {
    /// Canonical name, as reported in `Digest::algorithm`.
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha512 => "SHA-512",
            DigestAlgorithm::Blake3 => "BLAKE3",
        }
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            DigestAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            DigestAlgorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
            DigestAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// One-shot digest of an in-memory buffer.
    pub fn digest_bytes(&self, data: &[u8]) -> Digest {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finish()
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match folded.as_str() {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            "blake3" => Ok(DigestAlgorithm::Blake3),
            _ => Err(UnknownAlgorithm(s.to_string())),
        }
    }
}

impl TryFrom<String> for DigestAlgorithm {
    type Error = UnknownAlgorithm;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DigestAlgorithm> for String {
    fn from(algorithm: DigestAlgorithm) -> Self {
        algorithm.name().to_string()
    }
}

/// Incremental digest accumulator.
pub enum Hasher {
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        match self {
            Hasher::Sha256(_) => DigestAlgorithm::Sha256,
            Hasher::Sha512(_) => DigestAlgorithm::Sha512,
            Hasher::Blake3(_) => DigestAlgorithm::Blake3,
        }
    }

    pub fn finish(self) -> Digest {
        let algorithm = self.algorithm();
        let value = match self {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
            Hasher::Blake3(h) => h.finalize().to_hex().to_string(),
        };
        Digest::new(algorithm.name(), value)
    }
}

/// Digest a file or a directory tree from disk. Blocking.
///
/// Directories are digested as the name-ordered walk of their regular files:
/// each contributes its path relative to `path`, a NUL byte, then its bytes.
pub fn digest_path(path: &Path, algorithm: DigestAlgorithm, chunk_size: usize) -> io::Result<Digest> {
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; chunk_size.max(1)];

    let meta = std::fs::metadata(path)?;
    if meta.is_dir() {
        for entry in WalkDir::new(path).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(path)
                .map_err(|e| io::Error::other(e.to_string()))?;
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update(&[0]);
            feed(&mut hasher, entry.path(), &mut buf)?;
        }
    } else {
        feed(&mut hasher, path, &mut buf)?;
    }

    Ok(hasher.finish())
}

fn feed(hasher: &mut Hasher, path: &Path, buf: &mut [u8]) -> io::Result<()> {
    let mut file = File::open(path)?;
    loop {
        let n = file.read(buf)?;
        if n == 0 {
            return Ok(());
        }
        hasher.update(&buf[..n]);
    }
}
