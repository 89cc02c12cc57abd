//! bucketstore - command line access to a bucket store
//!
//! Subcommands:
//! - `bucketstore exists <bucket>` - Check whether a bucket exists
//! - `bucketstore put <bucket> <path>` - Upload stdin (or `--input`) into the managed tree
//! - `bucketstore promote <bucket> <source> <dest>` - Move a root-tree path into the managed tree
//! - `bucketstore get <bucket> <path>` - Download a file, or a directory as tar
//! - `bucketstore digest <bucket> <path>` - Print the digest of a managed path

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bucketstore::{
    BucketExistence, BucketStorage, DiskStore, ErrorPayload, ExistingBucket, PathExistence, Rejection,
    StorageConfig,
};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

#[derive(Parser)]
#[command(name = "bucketstore")]
#[command(about = "Bucketed file storage with guarded promotion")]
#[command(version)]
struct Cli {
    /// TOML config file with a [storage] table (defaults to environment)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a bucket exists
    Exists { bucket: String },

    /// Upload a file into the bucket's managed tree
    Put {
        bucket: String,

        /// Destination, relative to the managed tree
        path: String,

        /// Read from this file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Promote a root-tree path into the managed tree
    Promote {
        bucket: String,

        /// Source, relative to the bucket root
        source: String,

        /// Destination, relative to the managed tree
        dest: String,
    },

    /// Download a file, or a directory as a tar stream
    Get {
        bucket: String,
        path: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the digest of a managed path
    Digest {
        bucket: String,
        path: String,

        /// Seconds to wait for the path to appear
        #[arg(short, long, default_value = "0")]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bucketstore=debug".into()),
        )
        .init();

    let config = match &cli.config {
        Some(path) => StorageConfig::from_file(path)?,
        None => StorageConfig::from_env()?,
    };
    debug!(root = %config.root_volume.display(), "opening store");
    let store = DiskStore::new(config).context("failed to open store")?;

    let outcome = match cli.command {
        Commands::Exists { bucket } => {
            let exists = store.exists(&bucket).await?.exists();
            println!("{}", serde_json::json!({ "bucket": bucket, "exists": exists }));
            Ok(())
        }
        Commands::Put { bucket, path, input } => put(&store, &bucket, &path, input).await?,
        Commands::Promote { bucket, source, dest } => {
            let bucket = require_bucket(&store, &bucket).await?;
            store
                .move_file(&bucket, &source, &dest)
                .await?
                .map(|attrs| print_json(&attrs))
        }
        Commands::Get { bucket, path, output } => get(&store, &bucket, &path, output).await?,
        Commands::Digest { bucket, path, wait } => {
            let bucket = require_bucket(&store, &bucket).await?;
            let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
            loop {
                match store.path_exists(&bucket, &path).await? {
                    PathExistence::Exists(existing) => {
                        println!("{}", store.get_digest(&existing).await?);
                        break Ok(());
                    }
                    PathExistence::DoesNotExist(_) if tokio::time::Instant::now() < deadline => {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    PathExistence::DoesNotExist(_) => break Err(Rejection::not_found(bucket.name(), &path)),
                }
            }
        }
    };

    if let Err(rejection) = outcome {
        println!("{}", ErrorPayload::from(&rejection).to_json());
        std::process::exit(1);
    }
    Ok(())
}

async fn require_bucket(store: &DiskStore, name: &str) -> Result<ExistingBucket> {
    match store.exists(name).await? {
        BucketExistence::Exists(bucket) => Ok(bucket),
        BucketExistence::DoesNotExist => bail!("bucket {name} does not exist"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("failed to render output: {e}"),
    }
}

async fn put(
    store: &DiskStore,
    bucket: &str,
    path: &str,
    input: Option<PathBuf>,
) -> Result<Result<(), Rejection>> {
    let bucket = require_bucket(store, bucket).await?;
    let target = match store.path_exists(&bucket, path).await? {
        PathExistence::Exists(_) => return Ok(Err(Rejection::already_exists(bucket.name(), path))),
        PathExistence::DoesNotExist(absent) => absent,
    };

    let chunk_size = store.config().read_chunk_size;
    let source = match input {
        Some(file) => {
            let file = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("failed to open {}", file.display()))?;
            ReaderStream::with_capacity(file, chunk_size).boxed()
        }
        None => ReaderStream::with_capacity(tokio::io::stdin(), chunk_size).boxed(),
    };

    let attrs = store.create_file(&target, source).await?;
    print_json(&attrs);
    Ok(Ok(()))
}

async fn get(
    store: &DiskStore,
    bucket: &str,
    path: &str,
    output: Option<PathBuf>,
) -> Result<Result<(), Rejection>> {
    let bucket = require_bucket(store, bucket).await?;
    let existing = match store.path_exists(&bucket, path).await? {
        PathExistence::Exists(existing) => existing,
        PathExistence::DoesNotExist(_) => return Ok(Err(Rejection::not_found(bucket.name(), path))),
    };

    let mut retrieved = match store.get_file(&existing).await? {
        Ok(retrieved) => retrieved,
        Err(rejection) => return Ok(Err(rejection)),
    };

    let mut sink: Box<dyn AsyncWrite + Unpin + Send> = match &output {
        Some(file) => Box::new(
            tokio::fs::File::create(file)
                .await
                .with_context(|| format!("failed to create {}", file.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let mut written = 0u64;
    while let Some(chunk) = retrieved.stream.next().await {
        let chunk = chunk.context("read failed")?;
        sink.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    sink.flush().await?;

    debug!(bytes = written, filename = ?retrieved.filename, "download complete");
    Ok(Ok(()))
}
