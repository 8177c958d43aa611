/*!
LocalStack integration tests for the S3 bucket backend.

These tests use LocalStack to simulate AWS S3 without requiring real AWS credentials.
LocalStack should be running on localhost:4566 for these tests to work.

To run LocalStack:
```bash
docker run --rm -p 4566:4566 localstack/localstack
```

Then run tests with:
```bash
RUN_LOCALSTACK_TESTS=1 cargo test -p blobkeep-core --test localstack_integration
```
*/

#![cfg(feature = "s3")]

use blobkeep_core::config::{S3Options, MIN_S3_PART_SIZE};
use blobkeep_core::{BackupError, BackupService, Context, Storage, StorageConfig};
use std::io::Read;
use std::time::Duration;

const ENDPOINT: &str = "http://localhost:4566";

/// Check if LocalStack is available and skip test if not
fn check_localstack_available() -> bool {
    std::env::var("RUN_LOCALSTACK_TESTS").unwrap_or_default() == "1"
}

fn localstack_options() -> S3Options {
    S3Options {
        endpoint: Some(ENDPOINT.to_string()),
        region: Some("us-east-1".to_string()),
        access_key: Some("test".to_string()),
        secret_access_key: Some("test".to_string()),
        force_path_style: true,
        ..Default::default()
    }
}

fn localstack_config(bucket: &str, compress_algorithm: &str) -> StorageConfig {
    let mut config = StorageConfig {
        storage_type: "s3".into(),
        bucket_name: bucket.into(),
        filename: "index".into(),
        suffix: ".snap".into(),
        compress_algorithm: compress_algorithm.into(),
        ..Default::default()
    };
    config.backend.s3 = localstack_options();
    config
}

async fn create_bucket(bucket: &str) -> aws_sdk_s3::Client {
    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .endpoint_url(ENDPOINT)
        .region(aws_sdk_s3::config::Region::new("us-east-1"))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            "test", "test", None, None, "localstack",
        ))
        .load()
        .await;
    let client = aws_sdk_s3::Client::from_conf(
        aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build(),
    );
    // Already-exists errors are fine on reruns.
    let _ = client.create_bucket().bucket(bucket).send().await;
    client
}

async fn read_all(service: &BackupService, ctx: &Context) -> blobkeep_core::Result<Vec<u8>> {
    let mut reader = service.reader(ctx).await?;
    tokio::task::spawn_blocking(move || {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok::<_, BackupError>(data)
    })
    .await
    .expect("reader task panicked")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_localstack_backup_lifecycle() {
    if !check_localstack_available() {
        println!("Skipping LocalStack test - set RUN_LOCALSTACK_TESTS=1 and run LocalStack");
        return;
    }

    let bucket = "blobkeep-lifecycle";
    create_bucket(bucket).await;

    let ctx = Context::with_timeout(Duration::from_secs(60));
    let service = BackupService::new(&ctx, localstack_config(bucket, "gzip"))
        .await
        .unwrap();

    service.write(&ctx, b"localstack payload").await.unwrap();
    let first = service.backup(&ctx).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    let second = service.backup(&ctx).await.unwrap();
    assert_ne!(first, second);

    assert_eq!(read_all(&service, &ctx).await.unwrap(), b"localstack payload");

    service.delete(&ctx).await.unwrap();
    assert!(read_all(&service, &ctx).await.unwrap_err().is_not_found());

    // Absent keys delete cleanly on S3.
    service.delete(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_localstack_backup_of_missing_object() {
    if !check_localstack_available() {
        println!("Skipping LocalStack test - set RUN_LOCALSTACK_TESTS=1 and run LocalStack");
        return;
    }

    let bucket = "blobkeep-missing";
    create_bucket(bucket).await;

    let ctx = Context::with_timeout(Duration::from_secs(30));
    let service = BackupService::new(&ctx, localstack_config(bucket, ""))
        .await
        .unwrap();

    match service.backup(&ctx).await {
        Err(BackupError::NotFound { key }) => assert_eq!(key, "index.snap"),
        other => panic!("expected not found, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_localstack_multipart_copy() {
    if !check_localstack_available() {
        println!("Skipping LocalStack test - set RUN_LOCALSTACK_TESTS=1 and run LocalStack");
        return;
    }

    let bucket = "blobkeep-multipart";
    let client = create_bucket(bucket).await;

    let mut config = localstack_config(bucket, "");
    config.backend.s3.max_part_size = MIN_S3_PART_SIZE;
    config.backend.s3.concurrency = 2;

    let ctx = Context::with_timeout(Duration::from_secs(120));
    let service = BackupService::new(&ctx, config).await.unwrap();

    let payload: Vec<u8> = (0..(MIN_S3_PART_SIZE as usize * 2 + 1024))
        .map(|i| (i % 251) as u8)
        .collect();
    client
        .put_object()
        .bucket(bucket)
        .key("index.snap")
        .content_type("application/x-snapshot")
        .metadata("node", "node-1")
        .body(payload.clone().into())
        .send()
        .await
        .unwrap();

    let snapshot = service.backup(&ctx).await.unwrap();
    assert!(snapshot.starts_with("index_"));
    assert_eq!(read_all(&service, &ctx).await.unwrap(), payload);

    let head = client
        .head_object()
        .bucket(bucket)
        .key(&snapshot)
        .send()
        .await
        .unwrap();
    assert_eq!(head.content_length(), Some(payload.len() as i64));
    assert_eq!(head.content_type(), Some("application/x-snapshot"));
    assert_eq!(
        head.metadata().and_then(|m| m.get("node")).map(String::as_str),
        Some("node-1")
    );
}

#[tokio::test]
async fn test_localstack_missing_bucket_fails_construction() {
    if !check_localstack_available() {
        println!("Skipping LocalStack test - set RUN_LOCALSTACK_TESTS=1 and run LocalStack");
        return;
    }

    let ctx = Context::with_timeout(Duration::from_secs(30));
    let err = BackupService::new(&ctx, localstack_config("blobkeep-does-not-exist", ""))
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::Session(_)), "got {err}");
}
