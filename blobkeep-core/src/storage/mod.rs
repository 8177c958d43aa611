/*!
Bucket backends for the backup service.

A [`Bucket`] is one remote container of objects addressed by key. Reads go
through [`Bucket::reader`]; deletes and server-side copies go through
capability objects ([`Deleter`], [`Copier`]) that are acquired per operation
and stay bound to the [`Context`] they were acquired under.

Which backend is used is decided once by [`new_bucket`], which also
establishes the backend session so that credential or endpoint problems
surface at construction.
*/

pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::compression::BoxReader;
use crate::config::{BackendOptions, StorageType};
use crate::context::Context;
use crate::Result;

pub use local::LocalBucket;
#[cfg(feature = "s3")]
pub use s3::S3Bucket;

/// Object storage bucket
///
/// Implementations share their backend session across concurrent calls and
/// hold no per-operation state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Open a stream over an existing object.
    ///
    /// Fails with [`BackupError::NotFound`](crate::BackupError::NotFound) when
    /// `key` does not exist.
    async fn reader(&self, ctx: &Context, key: &str) -> Result<BoxReader>;

    /// Store `data` under `key`, replacing any previous object atomically.
    async fn writer(&self, ctx: &Context, key: &str, data: Bytes) -> Result<()>;

    /// Acquire the delete capability.
    async fn deleter(&self, ctx: &Context) -> Result<Box<dyn Deleter>>;

    /// Acquire the server-side copy capability.
    async fn copier(&self, ctx: &Context) -> Result<Box<dyn Copier>>;

    fn name(&self) -> &str;
}

/// Removes objects from the bucket it was acquired from.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Deleter: Send + Sync {
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Duplicates objects inside the bucket without moving bytes through the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Copier: Send + Sync {
    /// Fails with `NotFound` when `src` does not exist.
    async fn copy(&self, src: &str, dst: &str) -> Result<()>;
}

/// Select a backend by name and open `bucket_name` on it.
pub async fn new_bucket(
    ctx: &Context,
    storage_type: &str,
    bucket_name: &str,
    options: &BackendOptions,
) -> Result<Box<dyn Bucket>> {
    let storage_type: StorageType = storage_type.parse()?;
    info!(storage_type = %storage_type, bucket = %bucket_name, "Opening bucket");

    match storage_type {
        StorageType::S3 => open_s3(ctx, bucket_name, options).await,
        StorageType::Local => {
            let bucket = LocalBucket::open(ctx, bucket_name, &options.local).await?;
            Ok(Box::new(bucket))
        }
    }
}

#[cfg(feature = "s3")]
async fn open_s3(
    ctx: &Context,
    bucket_name: &str,
    options: &BackendOptions,
) -> Result<Box<dyn Bucket>> {
    let bucket = S3Bucket::connect(ctx, bucket_name, &options.s3).await?;
    Ok(Box::new(bucket))
}

#[cfg(not(feature = "s3"))]
async fn open_s3(
    _ctx: &Context,
    _bucket_name: &str,
    _options: &BackendOptions,
) -> Result<Box<dyn Bucket>> {
    Err(crate::BackupError::session("s3 support not enabled"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalOptions;
    use crate::BackupError;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_unknown_storage_type_is_rejected() {
        let ctx = Context::background();
        let result = new_bucket(&ctx, "ftp", "backups", &BackendOptions::default()).await;
        match result {
            Err(BackupError::InvalidStorageType(name)) => assert_eq!(name, "ftp"),
            Err(other) => panic!("expected invalid storage type, got {other:?}"),
            Ok(_) => panic!("expected invalid storage type"),
        }
    }

    #[tokio::test]
    async fn test_local_storage_type_opens_directory_bucket() {
        let temp_dir = TempDir::new().unwrap();
        let options = BackendOptions {
            local: LocalOptions {
                base_path: temp_dir.path().to_path_buf(),
            },
            ..Default::default()
        };

        let bucket = new_bucket(&Context::background(), "file", "backups", &options)
            .await
            .unwrap();
        assert_eq!(bucket.name(), "backups");
        assert!(temp_dir.path().join("backups").is_dir());
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_construction() {
        let temp_dir = TempDir::new().unwrap();
        let options = BackendOptions {
            local: LocalOptions {
                base_path: temp_dir.path().to_path_buf(),
            },
            ..Default::default()
        };
        let ctx = Context::background();
        ctx.cancel();

        let result = new_bucket(&ctx, "local", "backups", &options).await;
        assert!(matches!(result, Err(BackupError::Cancelled)));
    }
}
