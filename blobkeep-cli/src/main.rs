/*!
Blobkeep CLI - host process for the blobkeep backup service.

Manages one canonical object (`filename + suffix`) in a bucket: take a
timestamped backup of it, stream its content, replace it, or delete it.
*/

use anyhow::Context as _;
use blobkeep_core::config::LocalOptions;
use blobkeep_core::observability::init_observability;
use blobkeep_core::{BackupService, Context, Storage, StorageConfig, StorageOption};
use blobkeep_retry::{with_backoff, RetryPolicy};
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "blobkeep")]
#[command(about = "Back up, read and replace an object on blob storage")]
#[command(version)]
struct Cli {
    /// JSON configuration file; flags below override its values
    #[arg(short, long, global = true, env = "BLOBKEEP_CONFIG")]
    config: Option<PathBuf>,

    /// Storage backend (s3, local)
    #[arg(long, global = true)]
    storage_type: Option<String>,

    /// Bucket name (a directory under --base-path for the local backend)
    #[arg(short, long, global = true)]
    bucket: Option<String>,

    /// Base name of the managed object
    #[arg(short, long, global = true)]
    filename: Option<String>,

    /// Suffix appended to the object name, e.g. ".snap"
    #[arg(short, long, global = true)]
    suffix: Option<String>,

    /// Compression algorithm (gob, gzip, lz4, zstd); an empty value disables compression
    #[arg(long, global = true)]
    compress: Option<String>,

    /// Compression level for the chosen algorithm
    #[arg(long, global = true, allow_hyphen_values = true)]
    level: Option<i32>,

    /// Custom S3 endpoint (MinIO, LocalStack, ...)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// S3 region
    #[arg(long, global = true)]
    region: Option<String>,

    /// Root directory of the local backend
    #[arg(long, global = true)]
    base_path: Option<PathBuf>,

    /// Deadline for the whole command, in seconds
    #[arg(long, global = true, default_value_t = 300)]
    timeout: u64,

    /// Attempts for backup and delete when the failure is transient
    #[arg(long, global = true, default_value_t = 3)]
    retries: usize,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy the object to a new timestamped key and print that key
    Backup,
    /// Delete the object
    Delete {
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// Write the (decompressed) object content to stdout
    Cat,
    /// Replace the object with the content of FILE
    Put {
        /// File to upload
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_observability(cli.json_logs)?;

    let base = load_config(cli.config.as_deref())?;
    let options = storage_options(&cli, &base);

    let ctx = Context::with_timeout(Duration::from_secs(cli.timeout));
    let service = BackupService::with_options(&ctx, base, options)
        .await
        .context("failed to initialize backup service")?;
    let policy = RetryPolicy::cloud_storage(cli.retries);

    match cli.command {
        Commands::Backup => backup(&service, &ctx, policy).await?,
        Commands::Delete { force } => delete(&service, &ctx, policy, force).await?,
        Commands::Cat => cat(&service, &ctx).await?,
        Commands::Put { file } => put(&service, &ctx, &file).await?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<StorageConfig, anyhow::Error> {
    let config = match path {
        Some(path) => StorageConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => StorageConfig::default(),
    };
    Ok(config.bind())
}

/// Translate flags into options layered over the loaded configuration.
fn storage_options(cli: &Cli, base: &StorageConfig) -> Vec<StorageOption> {
    let mut options = Vec::new();

    if let Some(storage_type) = &cli.storage_type {
        options.push(StorageOption::StorageType(storage_type.clone()));
    }
    if let Some(bucket) = &cli.bucket {
        options.push(StorageOption::BucketName(bucket.clone()));
    }
    if let Some(filename) = &cli.filename {
        options.push(StorageOption::Filename(filename.clone()));
    }
    if let Some(suffix) = &cli.suffix {
        options.push(StorageOption::Suffix(suffix.clone()));
    }
    if let Some(algorithm) = &cli.compress {
        options.push(StorageOption::CompressAlgorithm(algorithm.clone()));
    }
    if let Some(level) = cli.level {
        options.push(StorageOption::CompressionLevel(level));
    }
    if cli.endpoint.is_some() || cli.region.is_some() {
        let mut s3 = base.backend.s3.clone();
        if let Some(endpoint) = &cli.endpoint {
            s3.endpoint = Some(endpoint.clone());
            s3.force_path_style = true;
        }
        if let Some(region) = &cli.region {
            s3.region = Some(region.clone());
        }
        options.push(StorageOption::S3(s3));
    }
    if let Some(base_path) = &cli.base_path {
        options.push(StorageOption::Local(LocalOptions {
            base_path: base_path.clone(),
        }));
    }

    options
}

async fn backup(
    service: &BackupService,
    ctx: &Context,
    policy: RetryPolicy,
) -> Result<(), anyhow::Error> {
    let snapshot = with_backoff("backup", policy, |_| service.backup(ctx))
        .await
        .inspect_err(|e| error!(key = %service.canonical_key(), error = %e, "Backup failed"))?;

    info!(
        bucket = %service.bucket_name(),
        key = %service.canonical_key(),
        snapshot = %snapshot,
        "Backup created"
    );
    println!("{snapshot}");
    Ok(())
}

async fn delete(
    service: &BackupService,
    ctx: &Context,
    policy: RetryPolicy,
    force: bool,
) -> Result<(), anyhow::Error> {
    if !force {
        print!(
            "Are you sure you want to delete '{}/{}'? (y/N): ",
            service.bucket_name(),
            service.canonical_key()
        );
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().to_lowercase().starts_with('y') {
            println!("Deletion cancelled");
            return Ok(());
        }
    }

    with_backoff("delete", policy, |_| service.delete(ctx))
        .await
        .inspect_err(|e| error!(key = %service.canonical_key(), error = %e, "Delete failed"))?;

    println!("✓ Deleted {}/{}", service.bucket_name(), service.canonical_key());
    Ok(())
}

async fn cat(service: &BackupService, ctx: &Context) -> Result<(), anyhow::Error> {
    let mut reader = service.reader(ctx).await?;

    let written = tokio::task::spawn_blocking(move || {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let written = io::copy(&mut reader, &mut out)?;
        out.flush()?;
        Ok::<_, io::Error>(written)
    })
    .await??;

    info!(key = %service.canonical_key(), bytes = written, "Object streamed to stdout");
    Ok(())
}

async fn put(service: &BackupService, ctx: &Context, file: &Path) -> Result<(), anyhow::Error> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    service.write(ctx, &data).await?;

    println!(
        "✓ Uploaded {} bytes to {}/{}",
        data.len(),
        service.bucket_name(),
        service.canonical_key()
    );
    Ok(())
}
