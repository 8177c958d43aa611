/*!
Local filesystem bucket implementation.
*/

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::NamedTempFile;
use tracing::{debug, error, info};

use super::{Bucket, Copier, Deleter};
use crate::compression::BoxReader;
use crate::config::LocalOptions;
use crate::context::Context;
use crate::{BackupError, Result};

/// Directory-backed bucket
///
/// The bucket is the directory `base_path/bucket_name`; each object is a file
/// whose path relative to that directory is its key. Keys may contain `/` to
/// create nested directories.
///
/// Writes and copies land in a temporary file next to the destination and
/// are renamed into place, so readers never observe a partial object. The
/// context is checked between chunks and right before the rename; a
/// cancelled write or copy leaves nothing behind.
/// Deleting a key that does not exist fails with
/// [`BackupError::NotFound`].
///
/// # Example
/// ```rust,no_run
/// use blobkeep_core::config::LocalOptions;
/// use blobkeep_core::storage::{Bucket, LocalBucket};
/// use blobkeep_core::Context;
///
/// # async fn demo() -> blobkeep_core::Result<()> {
/// let ctx = Context::background();
/// let options = LocalOptions { base_path: "/var/lib/blobkeep".into() };
/// let bucket = LocalBucket::open(&ctx, "backups", &options).await?;
/// bucket.writer(&ctx, "index.snap", bytes::Bytes::from_static(b"data")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalBucket {
    name: String,
    root: PathBuf,
}

impl LocalBucket {
    /// Open (creating if needed) the bucket directory.
    pub async fn open(ctx: &Context, bucket_name: &str, options: &LocalOptions) -> Result<Self> {
        let root = options.base_path.join(bucket_name);

        ctx.run(async {
            tokio::fs::create_dir_all(&root).await.map_err(|e| {
                BackupError::session(format!(
                    "Failed to create bucket directory {}: {}",
                    root.display(),
                    e
                ))
            })
        })
        .await?;

        info!(bucket = %bucket_name, root = %root.display(), "Initialized local bucket");

        Ok(Self {
            name: bucket_name.to_string(),
            root,
        })
    }

    /// Directory holding this bucket's objects.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path inside the bucket directory
    fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(BackupError::validation(format!(
                "Invalid object key '{key}' for local bucket"
            )));
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_root(&self, capability: &'static str, ctx: &Context) -> Result<()> {
        ctx.err()
            .map_err(|e| BackupError::capability(capability, e.to_string()))?;
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(BackupError::capability(
                capability,
                format!("{} is not a directory", self.root.display()),
            )),
            Err(e) => Err(BackupError::capability(
                capability,
                format!("bucket directory {} unavailable: {}", self.root.display(), e),
            )),
        }
    }
}

#[async_trait]
impl Bucket for LocalBucket {
    async fn reader(&self, ctx: &Context, key: &str) -> Result<BoxReader> {
        let path = self.resolve_path(key)?;
        debug!(bucket = %self.name, key = %key, "Opening local object");

        let file = ctx
            .run(async {
                tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| map_io_error("open", e, key))
            })
            .await?;

        Ok(Box::new(file.into_std().await))
    }

    async fn writer(&self, ctx: &Context, key: &str, data: Bytes) -> Result<()> {
        let path = self.resolve_path(key)?;
        info!(bucket = %self.name, key = %key, size = data.len(), "Writing local object");

        ctx.err()?;
        let owned_key = key.to_string();
        let task_ctx = ctx.clone();
        let result = tokio::task::spawn_blocking(move || {
            write_atomic(&path, &data, &owned_key, || task_ctx.err())
        })
        .await
        .map_err(|e| BackupError::storage(format!("Local write task failed: {e}")))
        .and_then(|result| result);

        if let Err(e) = &result {
            error!(bucket = %self.name, key = %key, error = %e, "Failed to write local object");
        }
        result
    }

    async fn deleter(&self, ctx: &Context) -> Result<Box<dyn Deleter>> {
        self.ensure_root("delete", ctx).await?;
        Ok(Box::new(LocalDeleter {
            ctx: ctx.clone(),
            bucket: self.clone(),
        }))
    }

    async fn copier(&self, ctx: &Context) -> Result<Box<dyn Copier>> {
        self.ensure_root("copy", ctx).await?;
        Ok(Box::new(LocalCopier {
            ctx: ctx.clone(),
            bucket: self.clone(),
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct LocalDeleter {
    ctx: Context,
    bucket: LocalBucket,
}

#[async_trait]
impl Deleter for LocalDeleter {
    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.bucket.resolve_path(key)?;
        info!(bucket = %self.bucket.name, key = %key, "Deleting local object");

        self.ctx
            .run(async {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| map_io_error("delete", e, key))
            })
            .await
    }
}

struct LocalCopier {
    ctx: Context,
    bucket: LocalBucket,
}

#[async_trait]
impl Copier for LocalCopier {
    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let src_path = self.bucket.resolve_path(src)?;
        let dst_path = self.bucket.resolve_path(dst)?;
        info!(bucket = %self.bucket.name, src = %src, dst = %dst, "Copying local object");

        self.ctx.err()?;
        let src_key = src.to_string();
        let ctx = self.ctx.clone();
        tokio::task::spawn_blocking(move || {
            copy_atomic(&src_path, &dst_path, &src_key, || ctx.err())
        })
        .await
        .map_err(|e| BackupError::storage(format!("Local copy task failed: {e}")))?
    }
}

/// Chunk size between cancellation checks in blocking writes and copies.
const CHUNK_SIZE: usize = 1024 * 1024;

fn write_atomic<C>(path: &Path, data: &[u8], key: &str, check: C) -> Result<()>
where
    C: Fn() -> Result<()>,
{
    let io_err = |e: io::Error| map_io_error("write", e, key);

    let mut staged = stage_next_to(path).map_err(io_err)?;
    for chunk in data.chunks(CHUNK_SIZE) {
        check()?;
        staged.write_all(chunk).map_err(io_err)?;
    }
    staged.as_file().sync_all().map_err(io_err)?;
    check()?;
    staged.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

fn copy_atomic<C>(src: &Path, dst: &Path, src_key: &str, check: C) -> Result<()>
where
    C: Fn() -> Result<()>,
{
    let mut source = File::open(src).map_err(|e| map_io_error("copy", e, src_key))?;

    let mut staged = stage_next_to(dst)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        check()?;
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        staged.write_all(&buf[..n])?;
    }
    staged.as_file().sync_all()?;
    // Last chance to back out; after the rename the snapshot is visible.
    check()?;
    staged.persist(dst).map_err(|e| BackupError::Io(e.error))?;
    Ok(())
}

/// Temporary file in the destination's directory, creating the directory if needed.
fn stage_next_to(path: &Path) -> io::Result<NamedTempFile> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        )
    })?;
    std::fs::create_dir_all(parent)?;
    NamedTempFile::new_in(parent)
}

fn map_io_error(op: &str, error: io::Error, key: &str) -> BackupError {
    match error.kind() {
        io::ErrorKind::NotFound => BackupError::not_found(key),
        _ => BackupError::storage(format!("Local {op} failed for '{key}': {error}")),
    }
}
