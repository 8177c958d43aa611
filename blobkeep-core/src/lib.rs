/*!
# Blobkeep Core

Backup and restore of a single named object in remote blob storage, with
optional transparent compression.

This crate provides:

- Pluggable compression (`gob`, `gzip`, `lz4`, `zstd`, or none), selected by name
- Pluggable bucket backends (S3 and S3-compatible stores, local filesystem)
- A [`BackupService`] that composes one bucket and at most one compressor
  behind the [`Storage`] contract: `backup`, `delete`, `reader`
- Cancellation and deadlines for every network-bound operation through [`Context`]

## Architecture

The service owns naming and sequencing only:
- The canonical object lives at `filename + suffix`
- `backup` asks the bucket for a server-side copy to `filename_<unix nanos>suffix`
- `reader` wraps the bucket stream in the compressor's decompressing reader
- Retrying is left to the caller (see the `blobkeep-retry` crate)

## Usage

```rust,no_run
use std::io::Read;
use blobkeep_core::{BackupService, Context, Storage, StorageConfig};

# async fn demo() -> blobkeep_core::Result<()> {
let config = StorageConfig::from_json_str(r#"{
    "storage_type": "local",
    "bucket_name": "backups",
    "filename": "index",
    "suffix": ".snap",
    "compress_algorithm": "zstd",
    "backend": { "local": { "base_path": "/var/lib/blobkeep" } }
}"#)?;

let ctx = Context::with_timeout(std::time::Duration::from_secs(30));
let service = BackupService::new(&ctx, config).await?;

service.write(&ctx, b"index contents").await?;
let snapshot = service.backup(&ctx).await?;

let mut restored = Vec::new();
service.reader(&ctx).await?.read_to_end(&mut restored)?;
# Ok(())
# }
```
*/

pub mod compression;
pub mod config;
pub mod context;
pub mod error;
pub mod observability;
pub mod service;
pub mod storage;
pub mod workgroup;

pub use compression::{new_compressor, BoxReader, Compressor};
pub use config::{CompressAlgorithm, StorageConfig, StorageOption, StorageType};
pub use context::Context;
pub use error::{BackupError, Result};
pub use service::{BackupService, Storage};
pub use storage::{new_bucket, Bucket, Copier, Deleter};
pub use workgroup::WorkerGroup;
