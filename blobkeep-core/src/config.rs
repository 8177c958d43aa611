//! Configuration module for backend and codec selection
//!
//! This module provides the configuration consumed once when a
//! [`BackupService`](crate::BackupService) is built: which storage backend to
//! talk to, which bucket and object name to manage, and which compression
//! algorithm the stored object uses. Backend and algorithm are kept as raw
//! strings here and resolved into [`StorageType`] / [`CompressAlgorithm`] at
//! construction time, so an unknown value fails construction with a precise
//! error rather than failing at load time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{BackupError, Result};

/// Largest object S3 will duplicate with a single `CopyObject` call.
pub const DEFAULT_S3_MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Smallest part S3 accepts in a multipart upload (except the last one).
pub const MIN_S3_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Enumeration of supported storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Amazon S3 or any S3-compatible object store
    S3,
    /// Directory tree on a local or mounted filesystem
    Local,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::S3 => "s3",
            StorageType::Local => "local",
        }
    }
}

impl FromStr for StorageType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(StorageType::S3),
            "local" | "file" => Ok(StorageType::Local),
            _ => Err(BackupError::InvalidStorageType(s.to_string())),
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enumeration of supported compression algorithms.
///
/// "No compression" is not a variant: it is expressed by an empty
/// algorithm string in [`StorageConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressAlgorithm {
    /// Length-framed serialization of byte chunks, no entropy coding
    Gob,
    Gzip,
    Lz4,
    Zstd,
}

impl CompressAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressAlgorithm::Gob => "gob",
            CompressAlgorithm::Gzip => "gzip",
            CompressAlgorithm::Lz4 => "lz4",
            CompressAlgorithm::Zstd => "zstd",
        }
    }
}

impl FromStr for CompressAlgorithm {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gob" => Ok(CompressAlgorithm::Gob),
            "gzip" => Ok(CompressAlgorithm::Gzip),
            "lz4" => Ok(CompressAlgorithm::Lz4),
            "zstd" => Ok(CompressAlgorithm::Zstd),
            _ => Err(BackupError::CompressorNotFound(s.to_string())),
        }
    }
}

impl fmt::Display for CompressAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection settings for the S3 backend.
///
/// Unset fields fall back to the standard AWS provider chain
/// (environment, shared config files, instance/task roles).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Options {
    /// Custom endpoint for S3-compatible stores (MinIO, LocalStack, ...)
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    /// Address buckets as `endpoint/bucket` instead of `bucket.endpoint`
    pub force_path_style: bool,
    /// Objects larger than this are copied part by part
    pub max_part_size: u64,
    /// Maximum number of concurrent part copies
    pub concurrency: usize,
}

impl Default for S3Options {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: None,
            access_key: None,
            secret_access_key: None,
            session_token: None,
            force_path_style: false,
            max_part_size: DEFAULT_S3_MAX_PART_SIZE,
            concurrency: num_cpus::get().max(1),
        }
    }
}

/// Settings for the local filesystem backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalOptions {
    /// Directory under which each bucket is a subdirectory
    pub base_path: PathBuf,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
        }
    }
}

/// Backend-specific options; only the section matching the storage type is read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendOptions {
    pub s3: S3Options,
    pub local: LocalOptions,
}

/// Configuration structure for the backup service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend identifier, resolved through [`StorageType::from_str`]
    pub storage_type: String,
    pub bucket_name: String,
    /// Base name of the managed object
    pub filename: String,
    /// Appended to the object name, usually an extension such as `.snap`
    pub suffix: String,
    /// Algorithm identifier; empty means the object is stored uncompressed
    pub compress_algorithm: String,
    /// Codec level; `None` picks the codec's default
    pub compression_level: Option<i32>,
    pub backend: BackendOptions,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::S3.as_str().to_string(),
            bucket_name: String::new(),
            filename: String::new(),
            suffix: String::new(),
            compress_algorithm: String::new(),
            compression_level: None,
            backend: BackendOptions::default(),
        }
    }
}

impl StorageConfig {
    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BackupError::validation(format!(
                "Failed to read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json_str(&raw)
    }

    /// Replace `_NAME_` placeholders with the value of environment variable `NAME`.
    pub fn bind(mut self) -> Self {
        self.storage_type = actual_value(&self.storage_type);
        self.bucket_name = actual_value(&self.bucket_name);
        self.filename = actual_value(&self.filename);
        self.suffix = actual_value(&self.suffix);
        self.compress_algorithm = actual_value(&self.compress_algorithm);

        let s3 = &mut self.backend.s3;
        for field in [
            &mut s3.endpoint,
            &mut s3.region,
            &mut s3.access_key,
            &mut s3.secret_access_key,
            &mut s3.session_token,
        ] {
            if let Some(value) = field.as_deref() {
                *field = Some(actual_value(value));
            }
        }

        let base_path = self.backend.local.base_path.to_string_lossy().into_owned();
        self.backend.local.base_path = PathBuf::from(actual_value(&base_path));
        self
    }

    /// Check the fields that are needed regardless of backend or codec.
    pub fn validate(&self) -> Result<()> {
        if self.filename.is_empty() {
            return Err(BackupError::validation("filename must not be empty"));
        }
        if !self.bucket_name.is_empty() {
            validate_bucket_name(&self.bucket_name).map_err(BackupError::validation)?;
        }
        Ok(())
    }

    /// Key of the current object: `filename + suffix`.
    pub fn canonical_key(&self) -> String {
        format!("{}{}", self.filename, self.suffix)
    }

    /// Key of a snapshot taken at `unix_nanos`: `filename + "_" + unix_nanos + suffix`.
    pub fn snapshot_key(&self, unix_nanos: i64) -> String {
        format!("{}_{}{}", self.filename, unix_nanos, self.suffix)
    }
}

/// One ordered mutation layered onto a [`StorageConfig`].
#[derive(Debug, Clone)]
pub enum StorageOption {
    StorageType(String),
    BucketName(String),
    Filename(String),
    Suffix(String),
    /// An empty value switches compression off
    CompressAlgorithm(String),
    CompressionLevel(i32),
    S3(S3Options),
    Local(LocalOptions),
}

impl StorageOption {
    pub fn name(&self) -> &'static str {
        match self {
            StorageOption::StorageType(_) => "storage_type",
            StorageOption::BucketName(_) => "bucket_name",
            StorageOption::Filename(_) => "filename",
            StorageOption::Suffix(_) => "suffix",
            StorageOption::CompressAlgorithm(_) => "compress_algorithm",
            StorageOption::CompressionLevel(_) => "compression_level",
            StorageOption::S3(_) => "s3",
            StorageOption::Local(_) => "local",
        }
    }

    /// Apply this option; empty string values leave the current value untouched.
    pub fn apply(self, config: &mut StorageConfig) -> Result<()> {
        let name = self.name();
        match self {
            StorageOption::StorageType(value) => set_if_present(&mut config.storage_type, value),
            StorageOption::BucketName(value) => {
                if !value.is_empty() {
                    validate_bucket_name(&value)
                        .map_err(|reason| BackupError::option_failed(name, reason))?;
                    config.bucket_name = value;
                }
            }
            StorageOption::Filename(value) => set_if_present(&mut config.filename, value),
            StorageOption::Suffix(value) => set_if_present(&mut config.suffix, value),
            StorageOption::CompressAlgorithm(value) => config.compress_algorithm = value,
            StorageOption::CompressionLevel(level) => config.compression_level = Some(level),
            StorageOption::S3(opts) => {
                if opts.concurrency == 0 {
                    return Err(BackupError::option_failed(name, "concurrency must be at least 1"));
                }
                if opts.max_part_size < MIN_S3_PART_SIZE {
                    return Err(BackupError::option_failed(
                        name,
                        format!(
                            "max_part_size {} is below the {} byte minimum",
                            opts.max_part_size, MIN_S3_PART_SIZE
                        ),
                    ));
                }
                config.backend.s3 = opts;
            }
            StorageOption::Local(opts) => {
                if opts.base_path.as_os_str().is_empty() {
                    return Err(BackupError::option_failed(name, "base_path must not be empty"));
                }
                config.backend.local = opts;
            }
        }
        Ok(())
    }
}

fn set_if_present(field: &mut String, value: String) {
    if !value.is_empty() {
        *field = value;
    }
}

/// Resolve a `_NAME_` placeholder from the environment; other values pass through.
pub fn actual_value(value: &str) -> String {
    match value.strip_prefix('_').and_then(|v| v.strip_suffix('_')) {
        Some(name) if !name.is_empty() => std::env::var(name).unwrap_or_default(),
        _ => value.to_string(),
    }
}

/// Object-storage bucket naming rules (S3 flavour).
fn validate_bucket_name(name: &str) -> std::result::Result<(), String> {
    if !(3..=63).contains(&name.len()) {
        return Err(format!(
            "bucket name '{name}' must be between 3 and 63 characters"
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
    {
        return Err(format!(
            "bucket name '{name}' may only contain lowercase letters, digits, '.' and '-'"
        ));
    }
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    if !name.starts_with(alnum) || !name.ends_with(alnum) {
        return Err(format!(
            "bucket name '{name}' must start and end with a letter or digit"
        ));
    }
    if name.contains("..") {
        return Err(format!("bucket name '{name}' must not contain '..'"));
    }
    Ok(())
}
