/*!
End-to-end tests for the backup service over the local filesystem backend.
*/

use blobkeep_core::config::{BackendOptions, LocalOptions};
use blobkeep_core::{
    BackupError, BackupService, CompressAlgorithm, Context, Storage, StorageConfig, StorageOption,
};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn local_config(base: &Path) -> StorageConfig {
    StorageConfig {
        storage_type: "local".into(),
        bucket_name: "backups".into(),
        filename: "index".into(),
        suffix: ".snap".into(),
        backend: BackendOptions {
            local: LocalOptions {
                base_path: base.to_path_buf(),
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

fn bucket_dir(base: &Path) -> std::path::PathBuf {
    base.join("backups")
}

async fn read_canonical(service: &BackupService, ctx: &Context) -> blobkeep_core::Result<Vec<u8>> {
    let mut reader = service.reader(ctx).await?;
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    Ok(data)
}

fn snapshot_files(base: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(bucket_dir(base))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("index_"))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_backup_read_delete_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    let ctx = Context::background();
    let service = BackupService::new(&ctx, local_config(temp_dir.path()))
        .await
        .unwrap();
    assert_eq!(service.canonical_key(), "index.snap");
    assert_eq!(service.bucket_name(), "backups");
    assert_eq!(service.compressor_name(), None);

    let payload = b"canonical index bytes".to_vec();
    std::fs::write(bucket_dir(temp_dir.path()).join("index.snap"), &payload).unwrap();

    // Backup lands next to the canonical object with identical bytes.
    let snapshot = service.backup(&ctx).await.unwrap();
    let digits = snapshot
        .strip_prefix("index_")
        .and_then(|rest| rest.strip_suffix(".snap"))
        .unwrap();
    assert!(digits.parse::<i64>().unwrap() > 0);
    assert_eq!(
        std::fs::read(bucket_dir(temp_dir.path()).join(&snapshot)).unwrap(),
        payload
    );

    assert_eq!(read_canonical(&service, &ctx).await.unwrap(), payload);

    service.delete(&ctx).await.unwrap();
    assert!(!bucket_dir(temp_dir.path()).join("index.snap").exists());
    assert!(bucket_dir(temp_dir.path()).join(&snapshot).exists());

    let err = read_canonical(&service, &ctx).await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");
}

#[tokio::test]
async fn test_two_backups_produce_distinct_keys() {
    let temp_dir = TempDir::new().unwrap();
    let ctx = Context::background();
    let service = BackupService::new(&ctx, local_config(temp_dir.path()))
        .await
        .unwrap();
    service.write(&ctx, b"v1").await.unwrap();

    let first = service.backup(&ctx).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    let second = service.backup(&ctx).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(snapshot_files(temp_dir.path()), {
        let mut expected = vec![first, second];
        expected.sort();
        expected
    });
    assert_eq!(read_canonical(&service, &ctx).await.unwrap(), b"v1");
}

#[tokio::test]
async fn test_reader_on_missing_canonical_returns_no_stream() {
    let temp_dir = TempDir::new().unwrap();
    let ctx = Context::background();
    let service = BackupService::new(&ctx, local_config(temp_dir.path()))
        .await
        .unwrap();

    match service.reader(&ctx).await {
        Err(BackupError::NotFound { key }) => assert_eq!(key, "index.snap"),
        Err(other) => panic!("expected not found, got {other}"),
        Ok(_) => panic!("expected no stream"),
    }
}

#[tokio::test]
async fn test_backup_without_canonical_fails_and_creates_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let ctx = Context::background();
    let service = BackupService::new(&ctx, local_config(temp_dir.path()))
        .await
        .unwrap();

    let err = service.backup(&ctx).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(snapshot_files(temp_dir.path()).is_empty());
}

#[tokio::test]
async fn test_delete_of_missing_canonical_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let ctx = Context::background();
    let service = BackupService::new(&ctx, local_config(temp_dir.path()))
        .await
        .unwrap();

    assert!(service.delete(&ctx).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_gzip_canonical_is_decompressed_on_read() {
    let temp_dir = TempDir::new().unwrap();
    let ctx = Context::background();
    let original = b"gzip encoded canonical object ".repeat(100);

    // Seed with bytes produced outside the service.
    let encoded = blobkeep_core::new_compressor("gzip", Some(6))
        .unwrap()
        .unwrap()
        .compress(&original)
        .unwrap();
    std::fs::create_dir_all(bucket_dir(temp_dir.path())).unwrap();
    std::fs::write(bucket_dir(temp_dir.path()).join("index.snap"), &encoded).unwrap();

    let service = BackupService::with_options(
        &ctx,
        local_config(temp_dir.path()),
        [
            StorageOption::CompressAlgorithm("gzip".into()),
            StorageOption::CompressionLevel(6),
        ],
    )
    .await
    .unwrap();

    assert_eq!(read_canonical(&service, &ctx).await.unwrap(), original);

    // Snapshots keep the stored (compressed) bytes untouched.
    let snapshot = service.backup(&ctx).await.unwrap();
    assert_eq!(
        std::fs::read(bucket_dir(temp_dir.path()).join(snapshot)).unwrap(),
        encoded
    );
}

#[tokio::test]
async fn test_write_then_read_for_every_algorithm() {
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 97) as u8).collect();
    for algorithm in [
        CompressAlgorithm::Gob,
        CompressAlgorithm::Gzip,
        CompressAlgorithm::Lz4,
        CompressAlgorithm::Zstd,
    ] {
        let temp_dir = TempDir::new().unwrap();
        let ctx = Context::background();
        let service = BackupService::with_options(
            &ctx,
            local_config(temp_dir.path()),
            [StorageOption::CompressAlgorithm(algorithm.to_string())],
        )
        .await
        .unwrap();
        assert_eq!(service.compressor_name(), Some(algorithm.as_str()));

        service.write(&ctx, &payload).await.unwrap();
        assert_eq!(
            read_canonical(&service, &ctx).await.unwrap(),
            payload,
            "{algorithm}"
        );
    }
}

#[tokio::test]
async fn test_invalid_storage_type_regardless_of_other_options() {
    let temp_dir = TempDir::new().unwrap();
    for storage_type in ["ftp", "gcs", "", "s4"] {
        let config = StorageConfig {
            storage_type: storage_type.into(),
            ..local_config(temp_dir.path())
        };
        let err = BackupService::new(&Context::background(), config)
            .await
            .unwrap_err();
        assert!(
            matches!(err, BackupError::InvalidStorageType(_)),
            "{storage_type:?} gave {err}"
        );
    }
}

#[tokio::test]
async fn test_unknown_algorithm_names_the_value() {
    let temp_dir = TempDir::new().unwrap();
    let err = BackupService::with_options(
        &Context::background(),
        local_config(temp_dir.path()),
        [StorageOption::CompressAlgorithm("brotli".into())],
    )
    .await
    .unwrap_err();
    assert_eq!(err.to_string(), "compressor not found: brotli");
}

#[tokio::test]
async fn test_invalid_level_fails_construction() {
    let temp_dir = TempDir::new().unwrap();
    let err = BackupService::with_options(
        &Context::background(),
        local_config(temp_dir.path()),
        [
            StorageOption::CompressAlgorithm("gzip".into()),
            StorageOption::CompressionLevel(42),
        ],
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        BackupError::InvalidCompressionLevel { level: 42, .. }
    ));
}

#[tokio::test]
async fn test_concurrent_readers_share_one_service() {
    let temp_dir = TempDir::new().unwrap();
    let ctx = Context::background();
    let service = Arc::new(
        BackupService::with_options(
            &ctx,
            local_config(temp_dir.path()),
            [StorageOption::CompressAlgorithm("zstd".into())],
        )
        .await
        .unwrap(),
    );
    service.write(&ctx, b"shared payload").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = Arc::clone(&service);
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            read_canonical(&service, &ctx).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), b"shared payload");
    }
}

#[tokio::test]
async fn test_cancelled_context_stops_operations() {
    let temp_dir = TempDir::new().unwrap();
    let ctx = Context::background();
    let service = BackupService::new(&ctx, local_config(temp_dir.path()))
        .await
        .unwrap();
    service.write(&ctx, b"keep me").await.unwrap();

    let cancelled = ctx.child();
    cancelled.cancel();

    assert!(matches!(
        service.delete(&cancelled).await,
        Err(BackupError::Capability { .. })
    ));
    assert!(matches!(
        read_canonical(&service, &cancelled).await,
        Err(BackupError::Cancelled)
    ));
    assert_eq!(read_canonical(&service, &ctx).await.unwrap(), b"keep me");
}

#[tokio::test]
async fn test_backup_past_deadline_reports_what_happened() {
    let temp_dir = TempDir::new().unwrap();
    let ctx = Context::background();
    let service = BackupService::new(&ctx, local_config(temp_dir.path()))
        .await
        .unwrap();
    service
        .write(&ctx, &vec![0x5a; 128 * 1024 * 1024])
        .await
        .unwrap();

    let tight = Context::with_timeout(Duration::from_millis(5));
    let result = service.backup(&tight).await;

    // Give any straggling work time to land before inspecting the bucket.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snapshots = snapshot_files(temp_dir.path());
    match result {
        Ok(snapshot) => assert_eq!(snapshots, vec![snapshot]),
        Err(e) => {
            assert!(e.is_cancelled() || matches!(e, BackupError::Capability { .. }), "{e}");
            assert!(snapshots.is_empty(), "failed backup left {snapshots:?}");
        }
    }
    let leftovers: Vec<_> = std::fs::read_dir(bucket_dir(temp_dir.path()))
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .filter(|name| !name.to_string_lossy().starts_with("index"))
        .collect();
    assert!(leftovers.is_empty(), "staging files left behind: {leftovers:?}");
}

#[tokio::test]
async fn test_config_file_drives_construction() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("blobkeep.json");
    let json = serde_json::json!({
        "storage_type": "file",
        "bucket_name": "from-file",
        "filename": "state",
        "suffix": ".db",
        "compress_algorithm": "lz4",
        "backend": { "local": { "base_path": temp_dir.path() } }
    });
    std::fs::write(&config_path, json.to_string()).unwrap();

    let config = StorageConfig::from_json_file(&config_path).unwrap();
    let ctx = Context::background();
    let service = BackupService::new(&ctx, config).await.unwrap();

    assert_eq!(service.canonical_key(), "state.db");
    service.write(&ctx, b"db bytes").await.unwrap();
    assert!(temp_dir.path().join("from-file/state.db").is_file());
}
