/*!
The backup service: one bucket plus an optional compressor behind the
[`Storage`] contract.

The service manages a single canonical object, `filename + suffix`. Reading
returns its (decompressed) content, deleting removes it, and backing up
duplicates it server-side under `filename_<unix nanos>suffix`. The stored
bytes are never re-encoded by a backup, so snapshots keep whatever
compression the canonical object was written with.
*/

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info};

use crate::compression::{new_compressor, BoxReader, Compressor};
use crate::config::{StorageConfig, StorageOption};
use crate::context::Context;
#[cfg(feature = "metrics")]
use crate::observability::MetricsTimer;
use crate::storage::{new_bucket, Bucket};
use crate::{BackupError, Result};

/// Backup, delete and read access to one canonical object.
///
/// Operations are independent of each other; callers that need ordering
/// (for example "backup before delete") must sequence the calls. Nothing is
/// retried here.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Snapshot the canonical object and return the new snapshot's key.
    async fn backup(&self, ctx: &Context) -> Result<String>;

    /// Remove the canonical object.
    async fn delete(&self, ctx: &Context) -> Result<()>;

    /// Open the canonical object, decompressing it if a compressor is configured.
    ///
    /// The returned reader streams from the backend with blocking I/O: read
    /// it off the async executor (`spawn_blocking`). Dropping it releases
    /// the underlying stream.
    async fn reader(&self, ctx: &Context) -> Result<BoxReader>;
}

/// [`Storage`] implementation over a [`Bucket`]
///
/// # Example
/// ```rust,no_run
/// use blobkeep_core::{BackupService, Context, Storage, StorageConfig, StorageOption};
///
/// # async fn demo() -> blobkeep_core::Result<()> {
/// let ctx = Context::background();
/// let service = BackupService::with_options(
///     &ctx,
///     StorageConfig::default(),
///     [
///         StorageOption::BucketName("team-backups".into()),
///         StorageOption::Filename("index".into()),
///         StorageOption::Suffix(".snap".into()),
///         StorageOption::CompressAlgorithm("gzip".into()),
///     ],
/// )
/// .await?;
///
/// let snapshot = service.backup(&ctx).await?;
/// println!("created {snapshot}");
/// # Ok(())
/// # }
/// ```
pub struct BackupService {
    config: StorageConfig,
    canonical_key: String,
    compressor: Option<Box<dyn Compressor>>,
    bucket: Box<dyn Bucket>,
}

impl BackupService {
    /// Build a service from a complete configuration.
    pub async fn new(ctx: &Context, config: StorageConfig) -> Result<Self> {
        Self::with_options(ctx, config, Vec::new()).await
    }

    /// Build a service from `defaults` with `options` applied in order.
    ///
    /// After the options, the configuration is validated, then the
    /// compressor is created, then the bucket is opened. The first failing
    /// step aborts construction, so a configuration with both an unknown
    /// algorithm and an unknown storage type reports the algorithm.
    pub async fn with_options<I>(ctx: &Context, defaults: StorageConfig, options: I) -> Result<Self>
    where
        I: IntoIterator<Item = StorageOption>,
    {
        let mut config = defaults;
        for option in options {
            debug!(option = option.name(), "Applying storage option");
            option.apply(&mut config)?;
        }
        config.validate()?;

        let compressor = new_compressor(&config.compress_algorithm, config.compression_level)?;
        let bucket = new_bucket(
            ctx,
            &config.storage_type,
            &config.bucket_name,
            &config.backend,
        )
        .await?;

        let service = Self::from_parts(config, compressor, bucket);
        info!(
            storage_type = %service.config.storage_type,
            bucket = %service.config.bucket_name,
            key = %service.canonical_key,
            compressor = service.compressor_name().unwrap_or("none"),
            "Initialized backup service"
        );
        Ok(service)
    }

    /// Assemble a service from an already opened bucket.
    pub fn from_parts(
        config: StorageConfig,
        compressor: Option<Box<dyn Compressor>>,
        bucket: Box<dyn Bucket>,
    ) -> Self {
        Self {
            canonical_key: config.canonical_key(),
            config,
            compressor,
            bucket,
        }
    }

    pub fn canonical_key(&self) -> &str {
        &self.canonical_key
    }

    pub fn compressor_name(&self) -> Option<&'static str> {
        self.compressor.as_ref().map(|c| c.algorithm_name())
    }

    pub fn bucket_name(&self) -> &str {
        self.bucket.name()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Replace the canonical object with `data`, compressed if a compressor is configured.
    pub async fn write(&self, ctx: &Context, data: &[u8]) -> Result<()> {
        instrumented("write", async {
            let payload = match &self.compressor {
                Some(compressor) => compressor.compress(data)?,
                None => data.to_vec(),
            };
            info!(
                bucket = %self.config.bucket_name,
                key = %self.canonical_key,
                size = data.len(),
                stored_size = payload.len(),
                "Writing canonical object"
            );
            self.bucket
                .writer(ctx, &self.canonical_key, Bytes::from(payload))
                .await
        })
        .await
    }

    fn next_snapshot_key(&self) -> Result<String> {
        let nanos = Utc::now().timestamp_nanos_opt().ok_or_else(|| {
            BackupError::validation("system clock is outside the nanosecond timestamp range")
        })?;
        Ok(self.config.snapshot_key(nanos))
    }
}

#[async_trait]
impl Storage for BackupService {
    async fn backup(&self, ctx: &Context) -> Result<String> {
        instrumented("backup", async {
            let copier = self.bucket.copier(ctx).await?;
            let snapshot_key = self.next_snapshot_key()?;

            info!(
                bucket = %self.config.bucket_name,
                key = %self.canonical_key,
                snapshot = %snapshot_key,
                "Creating backup"
            );
            copier.copy(&self.canonical_key, &snapshot_key).await?;
            Ok::<_, BackupError>(snapshot_key)
        })
        .await
    }

    async fn delete(&self, ctx: &Context) -> Result<()> {
        instrumented("delete", async {
            let deleter = self.bucket.deleter(ctx).await?;
            info!(
                bucket = %self.config.bucket_name,
                key = %self.canonical_key,
                "Deleting canonical object"
            );
            deleter.delete(&self.canonical_key).await
        })
        .await
    }

    async fn reader(&self, ctx: &Context) -> Result<BoxReader> {
        instrumented("reader", async {
            debug!(
                bucket = %self.config.bucket_name,
                key = %self.canonical_key,
                "Opening canonical object"
            );
            let raw = self.bucket.reader(ctx, &self.canonical_key).await?;
            match &self.compressor {
                Some(compressor) => compressor.reader(raw),
                None => Ok(raw),
            }
        })
        .await
    }
}

impl fmt::Debug for BackupService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupService")
            .field("storage_type", &self.config.storage_type)
            .field("bucket", &self.config.bucket_name)
            .field("key", &self.canonical_key)
            .field("compressor", &self.compressor)
            .finish_non_exhaustive()
    }
}

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
async fn instrumented<T, F>(operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    #[cfg(feature = "metrics")]
    let timer = MetricsTimer::new(operation);

    let result = fut.await;

    #[cfg(feature = "metrics")]
    timer.finish_for(&result);

    result
}
