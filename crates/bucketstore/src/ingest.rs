//! Streaming ingestion: one inbound byte stream, two sinks.
//!
//! The producer forwards every chunk to the digest accumulator and to the file
//! writer over bounded channels. The call resolves once both sinks are done and
//! fails as soon as either fails, so the reported size and digest always
//! describe exactly the bytes that reached the file.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::attributes::FileAttributes;
use crate::digest::{Digest, Hasher};
use crate::error::StorageError;
use crate::evidence::AbsentPath;
use crate::layout::{self, Layout};

/// Knobs the pipeline needs from the store configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IngestSettings {
    pub algorithm: crate::digest::DigestAlgorithm,
    pub channel_capacity: usize,
}

enum IngestError {
    /// The writer received a zero-length chunk before any data.
    /// `data_followed` is set when the producer had already forwarded bytes.
    EmptyChunk { data_followed: bool },
    Storage(StorageError),
}

impl From<StorageError> for IngestError {
    fn from(err: StorageError) -> Self {
        IngestError::Storage(err)
    }
}

impl From<io::Error> for IngestError {
    fn from(err: io::Error) -> Self {
        IngestError::Storage(err.into())
    }
}

/// Write `source` to the not-yet-existing path and digest it on the way.
pub(crate) async fn create_file<S>(
    layout: &Layout,
    settings: IngestSettings,
    target: &AbsentPath,
    mut source: S,
) -> Result<FileAttributes, StorageError>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin + Send,
{
    let bucket = target.bucket().name();
    let managed = layout.base_path(bucket, true);
    let destination = layout::resolve(&managed, target.relative());

    if !layout::is_strictly_within(&destination, &managed) {
        warn!(bucket, path = target.relative(), "ingestion target escapes the managed tree");
        return Err(StorageError::PathInvalid {
            path: destination,
            base: managed,
        });
    }

    let first_attempt = write_once(&destination, &mut source, settings).await;
    let attributes = match first_attempt {
        Err(IngestError::EmptyChunk { data_followed }) => {
            if data_followed || !drain_is_empty(&mut source).await? {
                return Err(StorageError::internal(
                    "upload stream",
                    "empty chunk followed by data",
                ));
            }
            debug!(bucket, path = target.relative(), "retrying zero-length upload with an empty source");
            let mut empty = stream::empty::<io::Result<Bytes>>();
            match write_once(&destination, &mut empty, settings).await {
                Ok(attributes) => attributes,
                Err(IngestError::EmptyChunk { .. }) => {
                    return Err(StorageError::internal("upload stream", "empty chunk"))
                }
                Err(IngestError::Storage(e)) => return Err(e),
            }
        }
        Err(IngestError::Storage(e)) => return Err(e),
        Ok(attributes) => attributes,
    };

    info!(
        bucket,
        path = target.relative(),
        bytes = attributes.bytes,
        digest = %attributes.digest,
        "file ingested"
    );
    Ok(attributes)
}

/// One attempt. Removes the destination again if it fails after creating it.
async fn write_once<S>(
    destination: &Path,
    source: &mut S,
    settings: IngestSettings,
) -> Result<FileAttributes, IngestError>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin + Send,
{
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)
        .await?;

    match fan_out(source, file, settings).await {
        Ok((bytes, digest)) => Ok(FileAttributes::new(destination, bytes, digest)),
        Err(e) => {
            remove_partial(destination.to_path_buf()).await;
            Err(e)
        }
    }
}

async fn fan_out<S>(
    source: &mut S,
    file: tokio::fs::File,
    settings: IngestSettings,
) -> Result<(u64, Digest), IngestError>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin + Send,
{
    let (digest_tx, mut digest_rx) = mpsc::channel::<Bytes>(settings.channel_capacity);
    let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(settings.channel_capacity);
    let forwarded = AtomicU64::new(0);
    let forwarded_bytes = &forwarded;

    let produce = async move {
        while let Some(chunk) = source.next().await {
            let chunk = chunk.map_err(|e| StorageError::internal("upload stream failed", e))?;
            forwarded_bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            let (to_digest, to_writer) =
                tokio::join!(digest_tx.send(chunk.clone()), write_tx.send(chunk));
            // A closed channel means that sink gave up; its own error wins.
            if to_digest.is_err() || to_writer.is_err() {
                break;
            }
        }
        Ok::<(), IngestError>(())
    };

    let mut hasher: Hasher = settings.algorithm.hasher();
    let digest_sink = async move {
        while let Some(chunk) = digest_rx.recv().await {
            hasher.update(&chunk);
        }
        Ok::<Digest, IngestError>(hasher.finish())
    };

    let write_sink = async move {
        let mut writer = BufWriter::new(file);
        let mut written = 0u64;
        while let Some(chunk) = write_rx.recv().await {
            if chunk.is_empty() {
                if written == 0 {
                    return Err(IngestError::EmptyChunk {
                        data_followed: false,
                    });
                }
                continue;
            }
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        Ok::<u64, IngestError>(written)
    };

    match tokio::try_join!(produce, digest_sink, write_sink) {
        Ok(((), digest, written)) => Ok((written, digest)),
        Err(IngestError::EmptyChunk { .. }) => Err(IngestError::EmptyChunk {
            data_followed: forwarded.load(Ordering::Relaxed) > 0,
        }),
        Err(e) => Err(e),
    }
}

/// After an empty-chunk rejection: true when nothing but empty chunks remain.
async fn drain_is_empty<S>(source: &mut S) -> Result<bool, StorageError>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    while let Some(chunk) = source.next().await {
        match chunk {
            Ok(chunk) if chunk.is_empty() => continue,
            Ok(_) => return Ok(false),
            Err(e) => return Err(StorageError::internal("upload stream failed", e)),
        }
    }
    Ok(true)
}

async fn remove_partial(path: PathBuf) {
    if let Err(e) = tokio::fs::remove_file(&path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove partial upload");
        }
    }
}
