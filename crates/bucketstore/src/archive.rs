//! Directory packaging for retrieval.
//!
//! Directories are served as a single byte stream produced by an [`Archiver`].
//! The default produces a tar stream on the blocking pool and hands it over
//! chunk by chunk, so the archive is never held in memory as a whole.

use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

/// A boxed stream of byte chunks, as handed to the transport layer.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Packages a directory tree into one byte stream.
pub trait Archiver: Send + Sync {
    fn archive(&self, dir: PathBuf) -> ByteStream;
}

/// Streams directories as tar archives. Symlinks are stored as links.
#[derive(Debug, Clone)]
pub struct TarArchiver {
    chunk_size: usize,
    queue_depth: usize,
}

impl TarArchiver {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(512),
            queue_depth: 8,
        }
    }
}

impl Default for TarArchiver {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl Archiver for TarArchiver {
    fn archive(&self, dir: PathBuf) -> ByteStream {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let chunk_size = self.chunk_size;

        tokio::task::spawn_blocking(move || {
            let sink = ChannelWriter { tx: tx.clone() };
            let mut builder = tar::Builder::new(BufWriter::with_capacity(chunk_size, sink));
            builder.follow_symlinks(false);

            let result = builder
                .append_dir_all(".", &dir)
                .and_then(|()| builder.into_inner())
                .and_then(|mut buffered| buffered.flush());

            if let Err(e) = result {
                warn!(dir = %dir.display(), error = %e, "failed to archive directory");
                // Only fails when the reader is gone already.
                let _ = tx.blocking_send(Err(e));
            }
        });

        ReceiverStream::new(rx).boxed()
    }
}

/// Blocking `Write` half that forwards every buffer into the stream channel.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive reader dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    async fn collect(stream: ByteStream) -> io::Result<Vec<u8>> {
        let chunks: Vec<Bytes> = stream.try_collect().await?;
        Ok(chunks.concat())
    }

    #[tokio::test]
    async fn test_tar_contains_every_file() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let dir = temp.path().join("album");
        std::fs::create_dir_all(dir.join("disc1"))?;
        std::fs::write(dir.join("disc1/track01.flac"), b"track one")?;
        std::fs::write(dir.join("cover.jpg"), vec![1u8; 200_000])?;

        let bytes = collect(TarArchiver::new(4096).archive(dir)).await?;

        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut names = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            names.push(entry.path()?.to_string_lossy().into_owned());
        }
        assert!(names.iter().any(|n| n.ends_with("disc1/track01.flac")));
        assert!(names.iter().any(|n| n.ends_with("cover.jpg")));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_directory_surfaces_error() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let result = collect(TarArchiver::default().archive(temp.path().join("gone"))).await;
        assert!(result.is_err());
        Ok(())
    }
}
