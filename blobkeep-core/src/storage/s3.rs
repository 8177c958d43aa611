/*!
Amazon S3 bucket implementation.

Works against AWS and S3-compatible stores (MinIO, LocalStack, Ceph) through
the official AWS SDK.
*/

use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::create_multipart_upload::builders::CreateMultipartUploadFluentBuilder;
use aws_sdk_s3::operation::head_object::HeadObjectOutput;
use aws_sdk_s3::operation::upload_part_copy::builders::UploadPartCopyFluentBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::{self, Read};
use std::time::Duration;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, error, info, warn};

use super::{Bucket, Copier, Deleter};
use crate::compression::BoxReader;
use crate::config::S3Options;
use crate::context::Context;
use crate::workgroup::WorkerGroup;
use crate::{BackupError, Result};

/// S3 refuses multipart uploads with more parts than this.
const MAX_PARTS: u64 = 10_000;

/// Budget for aborting a failed multipart copy, independent of the caller's context.
const ABORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Amazon S3 bucket
///
/// # Authentication
/// Explicit credentials in [`S3Options`] take precedence; otherwise the
/// standard AWS credential provider chain is used:
/// 1. Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_SESSION_TOKEN)
/// 2. AWS credentials file (~/.aws/credentials)
/// 3. IAM roles for EC2 instances
/// 4. ECS task roles
///
/// # Semantics
/// - `reader` streams the response body. The returned reader does blocking
///   reads bridged onto the runtime, so consume it from a blocking thread.
///   Dropping it drops the HTTP body and frees the connection, and reads
///   fail once the context is cancelled or past its deadline.
/// - Deleting a key that does not exist succeeds, as it does in S3 itself.
/// - Copies stay server-side and are pinned to the source ETag seen at the
///   start, so a concurrent overwrite fails the copy instead of mixing
///   versions. Objects above `max_part_size` are copied with a multipart
///   upload that carries the source's content headers and user metadata;
///   its parts run concurrently and a failed copy is aborted so no partial
///   object becomes visible.
#[derive(Debug, Clone)]
pub struct S3Bucket {
    client: S3Client,
    bucket: String,
    max_part_size: u64,
    concurrency: usize,
}

impl S3Bucket {
    /// Build a client from `options` and verify the bucket is reachable.
    ///
    /// # Errors
    /// Returns [`BackupError::Session`] if the bucket cannot be reached with
    /// the resolved credentials and endpoint, and [`BackupError::Validation`]
    /// for an empty bucket name.
    pub async fn connect(ctx: &Context, bucket: &str, options: &S3Options) -> Result<Self> {
        if bucket.is_empty() {
            return Err(BackupError::validation("S3 bucket name must not be empty"));
        }

        let sdk_config = ctx
            .run(async { Ok::<_, BackupError>(load_sdk_config(options).await) })
            .await?;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(options.force_path_style)
            .build();
        let s3_bucket = Self::with_client(S3Client::from_conf(s3_config), bucket, options);

        ctx.run(async {
            s3_bucket
                .client
                .head_bucket()
                .bucket(bucket)
                .send()
                .await
                .map_err(|e| {
                    let mapped = map_s3_error("head_bucket", e, "");
                    BackupError::session(format!("Cannot access S3 bucket '{bucket}': {mapped}"))
                })
        })
        .await?;

        info!(
            bucket = %bucket,
            endpoint = ?options.endpoint,
            region = ?sdk_config.region(),
            "Initialized S3 bucket"
        );
        Ok(s3_bucket)
    }

    /// Wrap an existing client without contacting the service.
    pub fn with_client(client: S3Client, bucket: &str, options: &S3Options) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            max_part_size: options.max_part_size,
            concurrency: options.concurrency.max(1),
        }
    }

    fn copy_source(&self, key: &str) -> String {
        format!("{}/{}", self.bucket, urlencoding::encode(key))
    }

    async fn get_object(&self, key: &str) -> Result<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_s3_error("get_object", e, key))?;
        Ok(output.body)
    }

    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_s3_error("put_object", e, key))?;
        Ok(())
    }

    async fn head_source(&self, key: &str) -> Result<SourceObject> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_s3_error("head_object", e, key))?;
        Ok(SourceObject::from_head(&head))
    }

    async fn copy_object(&self, src: &str, dst: &str, source: &SourceObject) -> Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(self.copy_source(src))
            .set_copy_source_if_match(source.e_tag.clone())
            .key(dst)
            .send()
            .await
            .map_err(|e| map_s3_error("copy_object", e, src))?;
        Ok(())
    }

    fn create_upload_request(
        &self,
        dst: &str,
        source: &SourceObject,
    ) -> CreateMultipartUploadFluentBuilder {
        self.client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(dst)
            .set_content_type(source.content_type.clone())
            .set_content_encoding(source.content_encoding.clone())
            .set_content_disposition(source.content_disposition.clone())
            .set_content_language(source.content_language.clone())
            .set_cache_control(source.cache_control.clone())
            .set_metadata(source.metadata.clone())
    }

    async fn multipart_copy(
        &self,
        ctx: &Context,
        src: &str,
        dst: &str,
        source: &SourceObject,
    ) -> Result<()> {
        let upload = self
            .create_upload_request(dst, source)
            .send()
            .await
            .map_err(|e| map_s3_error("create_multipart_upload", e, dst))?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| BackupError::storage("S3 create_multipart_upload returned no upload id"))?
            .to_string();

        let parts = match self.copy_parts(ctx, src, dst, &upload_id, source).await {
            Ok(parts) => parts,
            Err(e) => {
                self.abort_multipart(dst, &upload_id).await;
                return Err(e);
            }
        };

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        let result = ctx
            .run(async {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(dst)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| map_s3_error("complete_multipart_upload", e, dst))
            })
            .await;

        if let Err(e) = result {
            self.abort_multipart(dst, &upload_id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn copy_parts(
        &self,
        ctx: &Context,
        src: &str,
        dst: &str,
        upload_id: &str,
        source: &SourceObject,
    ) -> Result<Vec<CompletedPart>> {
        let size = source.size;
        let part_size = part_size_for(size, self.max_part_size);
        let part_copy = PartCopy {
            bucket: self.bucket.clone(),
            key: dst.to_string(),
            upload_id: upload_id.to_string(),
            copy_source: self.copy_source(src),
            e_tag: source.e_tag.clone(),
        };
        let mut group = WorkerGroup::new(ctx, self.concurrency);

        debug!(
            bucket = %self.bucket,
            src = %src,
            dst = %dst,
            size,
            part_size,
            e_tag = ?source.e_tag,
            "Starting multipart copy"
        );

        let mut start = 0u64;
        let mut part_number = 1i32;
        while start < size {
            let end = (start + part_size).min(size) - 1;

            let request = part_copy.request(&self.client, part_number, start, end);
            let src_key = src.to_string();
            group.spawn(async move {
                let output = request
                    .send()
                    .await
                    .map_err(|e| map_s3_error("upload_part_copy", e, &src_key))?;

                let e_tag = output
                    .copy_part_result()
                    .and_then(|result| result.e_tag())
                    .map(str::to_string);
                Ok(CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(e_tag)
                    .build())
            });

            start = end + 1;
            part_number += 1;
        }

        group.wait().await
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        let ctx = Context::with_timeout(ABORT_TIMEOUT);
        let result = ctx
            .run(async {
                self.client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await
                    .map_err(|e| map_s3_error("abort_multipart_upload", e, key))
            })
            .await;

        if let Err(e) = result {
            warn!(
                bucket = %self.bucket,
                key = %key,
                upload_id = %upload_id,
                error = %e,
                "Failed to abort multipart copy, the upload must be cleaned up by a lifecycle rule"
            );
        }
    }
}

#[async_trait]
impl Bucket for S3Bucket {
    async fn reader(&self, ctx: &Context, key: &str) -> Result<BoxReader> {
        info!(bucket = %self.bucket, key = %key, "Opening object stream from S3");

        match ctx.run(self.get_object(key)).await {
            Ok(body) => {
                debug!(
                    bucket = %self.bucket,
                    key = %key,
                    size = ?body.size_hint().1,
                    "Streaming object from S3"
                );
                Ok(stream_reader(ctx, body))
            }
            Err(e) => {
                error!(bucket = %self.bucket, key = %key, error = %e, "Failed to open object stream from S3");
                Err(e)
            }
        }
    }

    async fn writer(&self, ctx: &Context, key: &str, data: Bytes) -> Result<()> {
        info!(bucket = %self.bucket, key = %key, size = data.len(), "Saving object to S3");

        let size = data.len();
        match ctx.run(self.put_object(key, data)).await {
            Ok(()) => {
                debug!(bucket = %self.bucket, key = %key, size, "Successfully saved object to S3");
                Ok(())
            }
            Err(e) => {
                error!(bucket = %self.bucket, key = %key, error = %e, "Failed to save object to S3");
                Err(e)
            }
        }
    }

    async fn deleter(&self, ctx: &Context) -> Result<Box<dyn Deleter>> {
        ctx.err()
            .map_err(|e| BackupError::capability("delete", e.to_string()))?;
        Ok(Box::new(S3Deleter {
            ctx: ctx.clone(),
            bucket: self.clone(),
        }))
    }

    async fn copier(&self, ctx: &Context) -> Result<Box<dyn Copier>> {
        ctx.err()
            .map_err(|e| BackupError::capability("copy", e.to_string()))?;
        Ok(Box::new(S3Copier {
            ctx: ctx.clone(),
            bucket: self.clone(),
        }))
    }

    fn name(&self) -> &str {
        &self.bucket
    }
}

struct S3Deleter {
    ctx: Context,
    bucket: S3Bucket,
}

#[async_trait]
impl Deleter for S3Deleter {
    async fn delete(&self, key: &str) -> Result<()> {
        let bucket = &self.bucket;
        info!(bucket = %bucket.bucket, key = %key, "Deleting object from S3");

        let result = self
            .ctx
            .run(async {
                bucket
                    .client
                    .delete_object()
                    .bucket(&bucket.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| map_s3_error("delete_object", e, key))
            })
            .await;

        match result {
            Ok(_) => {
                debug!(bucket = %bucket.bucket, key = %key, "Successfully deleted object from S3");
                Ok(())
            }
            Err(e) => {
                error!(bucket = %bucket.bucket, key = %key, error = %e, "Failed to delete object from S3");
                Err(e)
            }
        }
    }
}

struct S3Copier {
    ctx: Context,
    bucket: S3Bucket,
}

#[async_trait]
impl Copier for S3Copier {
    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let bucket = &self.bucket;
        info!(bucket = %bucket.bucket, src = %src, dst = %dst, "Copying object in S3");

        let result = self
            .ctx
            .run(async {
                let source = bucket.head_source(src).await?;
                if source.size <= bucket.max_part_size {
                    bucket.copy_object(src, dst, &source).await
                } else {
                    bucket.multipart_copy(&self.ctx, src, dst, &source).await
                }
            })
            .await;

        if let Err(e) = &result {
            error!(
                bucket = %bucket.bucket,
                src = %src,
                dst = %dst,
                error = %e,
                "Failed to copy object in S3"
            );
        }
        result
    }
}

/// What a copy needs to know about its source, captured by one HEAD request.
#[derive(Debug, Clone, Default, PartialEq)]
struct SourceObject {
    size: u64,
    e_tag: Option<String>,
    content_type: Option<String>,
    content_encoding: Option<String>,
    content_disposition: Option<String>,
    content_language: Option<String>,
    cache_control: Option<String>,
    metadata: Option<HashMap<String, String>>,
}

impl SourceObject {
    fn from_head(head: &HeadObjectOutput) -> Self {
        Self {
            size: head.content_length().unwrap_or(0).max(0) as u64,
            e_tag: head.e_tag().map(str::to_string),
            content_type: head.content_type().map(str::to_string),
            content_encoding: head.content_encoding().map(str::to_string),
            content_disposition: head.content_disposition().map(str::to_string),
            content_language: head.content_language().map(str::to_string),
            cache_control: head.cache_control().map(str::to_string),
            metadata: head.metadata().cloned(),
        }
    }
}

/// Shared parameters of every `UploadPartCopy` in one multipart copy.
#[derive(Debug, Clone)]
struct PartCopy {
    bucket: String,
    key: String,
    upload_id: String,
    copy_source: String,
    e_tag: Option<String>,
}

impl PartCopy {
    fn request(
        &self,
        client: &S3Client,
        part_number: i32,
        start: u64,
        end: u64,
    ) -> UploadPartCopyFluentBuilder {
        client
            .upload_part_copy()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .copy_source(&self.copy_source)
            .copy_source_range(format!("bytes={start}-{end}"))
            .set_copy_source_if_match(self.e_tag.clone())
    }
}

/// Blocking view of a response body, bound to the context that opened it.
fn stream_reader(ctx: &Context, body: ByteStream) -> BoxReader {
    Box::new(ContextReader {
        ctx: ctx.clone(),
        inner: SyncIoBridge::new(Box::pin(body.into_async_read())),
    })
}

struct ContextReader<R> {
    ctx: Context,
    inner: R,
}

impl<R: Read> Read for ContextReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ctx.err().map_err(io::Error::other)?;
        self.inner.read(buf)
    }
}

async fn load_sdk_config(options: &S3Options) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());

    if let Some(region) = non_empty(&options.region) {
        loader = loader.region(Region::new(region.to_string()));
    }
    if let Some(endpoint) = non_empty(&options.endpoint) {
        loader = loader.endpoint_url(endpoint);
    }
    if let (Some(access_key), Some(secret_key)) = (
        non_empty(&options.access_key),
        non_empty(&options.secret_access_key),
    ) {
        loader = loader.credentials_provider(Credentials::new(
            access_key,
            secret_key,
            non_empty(&options.session_token).map(str::to_string),
            None,
            "blobkeep",
        ));
    }

    loader.load().await
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Part size that respects both the configured maximum and S3's part count limit.
fn part_size_for(size: u64, max_part_size: u64) -> u64 {
    let max_part_size = max_part_size.max(1);
    max_part_size.max(size.div_ceil(MAX_PARTS))
}

/// Map AWS SDK errors to BackupError with appropriate context
///
/// Failures worth retrying become [`BackupError::Unavailable`]; everything
/// else is a permanent [`BackupError::Storage`] or [`BackupError::NotFound`].
fn map_s3_error<E>(op: &str, error: SdkError<E>, key: &str) -> BackupError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match &error {
        SdkError::DispatchFailure(dispatch_err) => BackupError::unavailable(format!(
            "S3 {op} request failed to dispatch: {dispatch_err:?}"
        )),
        SdkError::TimeoutError(_) => {
            BackupError::unavailable(format!("S3 {op} request timed out (key: {key})"))
        }
        SdkError::ResponseError(response_err) => {
            BackupError::unavailable(format!("S3 {op} response error: {response_err:?}"))
        }
        SdkError::ServiceError(service_err) => {
            let raw = service_err.raw().status().as_u16();
            let err = service_err.err();
            map_service_error(op, err.code(), err.message(), raw, key)
        }
        _ => BackupError::storage(format!("S3 {op} error: {error}")),
    }
}

fn map_service_error(
    op: &str,
    code: Option<&str>,
    message: Option<&str>,
    status: u16,
    key: &str,
) -> BackupError {
    let retryable_status = status >= 500 || status == 429;
    match code {
        Some("NoSuchKey") | Some("NotFound") => BackupError::not_found(key),
        Some("NoSuchBucket") => BackupError::storage("S3 bucket not found"),
        Some("AccessDenied") | Some("Forbidden") => BackupError::storage(
            "Access denied to S3 (check credentials and permissions)",
        ),
        Some("InvalidBucketName") => BackupError::storage("Invalid S3 bucket name"),
        // The source was overwritten while it was being copied.
        Some("PreconditionFailed") => BackupError::unavailable(format!(
            "S3 {op}: source '{key}' changed during copy"
        )),
        Some(code @ ("SlowDown" | "InternalError" | "ServiceUnavailable" | "RequestTimeout")) => {
            BackupError::unavailable(format!(
                "S3 service error ({}): {}",
                code,
                message.unwrap_or("Unknown error")
            ))
        }
        Some(code) if retryable_status => BackupError::unavailable(format!(
            "S3 service error ({}): {}",
            code,
            message.unwrap_or("Unknown error")
        )),
        Some(code) => BackupError::storage(format!(
            "S3 service error ({}): {}",
            code,
            message.unwrap_or("Unknown error")
        )),
        // HEAD responses carry no body, so only the status is known.
        None if status == 404 && !key.is_empty() => BackupError::not_found(key),
        None if status == 412 => BackupError::unavailable(format!(
            "S3 {op}: source '{key}' changed during copy"
        )),
        None if retryable_status => {
            BackupError::unavailable(format!("S3 {op} service error (HTTP {status})"))
        }
        None => BackupError::storage(format!("S3 {op} service error (HTTP {status})")),
    }
}
