//! Storage backend contract.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use omnistore_common::{BucketName, ByteRange, Result};

use crate::config::StorageType;
use crate::store::ByteStream;

/// Default number of entries returned by `list_files`.
pub const DEFAULT_LIST_LIMIT: usize = 1000;

/// Result of a paginated file listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileListing {
    /// `(key, size in bytes)` in backend order.
    pub files: Vec<(String, u64)>,
    /// Token to resume the listing; `None` when exhausted.
    pub next: Option<String>,
}

/// Diagnostic view of a backend. Never carries credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Introspection {
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// Currently selected bucket.
    pub bucket_name: Option<String>,
    /// Root directory of the local filesystem backend.
    pub directory: Option<PathBuf>,
}

impl Introspection {
    /// Look up a single field by its serialized name.
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "type" => Some(self.storage_type.to_string()),
            "bucketName" | "bucket_name" => self.bucket_name.clone(),
            "directory" => self
                .directory
                .as_ref()
                .map(|d| d.to_string_lossy().into_owned()),
            _ => None,
        }
    }
}

/// Operations every storage backend supports.
///
/// File operations target the selected bucket. Bucket names and keys are
/// slugified before use, so callers may pass human-readable names.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Get the backend type.
    fn storage_type(&self) -> StorageType;

    /// Authorize against the backend.
    ///
    /// Idempotent; repeat calls return `true` without contacting the backend.
    async fn init(&self) -> Result<bool>;

    /// Connectivity check.
    ///
    /// # Errors
    /// - `NotInitialized` if `init` never completed
    /// - `Backend` if the service cannot be reached
    async fn test(&self) -> Result<String>;

    /// Create a bucket unless one with the normalized name exists.
    async fn create_bucket(&self, name: &str) -> Result<()>;

    /// Select the bucket file operations target, creating it if needed.
    ///
    /// `None` clears the selection. On failure the previous selection stays.
    async fn select_bucket(&self, name: Option<&str>) -> Result<()>;

    /// Currently selected bucket.
    async fn selected_bucket(&self) -> Option<BucketName>;

    /// List bucket names in backend order.
    async fn list_buckets(&self) -> Result<Vec<String>>;

    /// Delete every file in the named or selected bucket.
    async fn clear_bucket(&self, name: Option<&str>) -> Result<()>;

    /// Clear and remove the named or selected bucket.
    async fn delete_bucket(&self, name: Option<&str>) -> Result<()>;

    /// Store a local file under `target`.
    async fn add_file_from_path(&self, source: &Path, target: &str) -> Result<()>;

    /// Store an in-memory buffer under `target`.
    async fn add_file_from_buffer(&self, buffer: Bytes, target: &str) -> Result<()>;

    /// Store a byte stream under `target`.
    async fn add_file_from_readable(&self, stream: ByteStream, target: &str) -> Result<()>;

    /// Remove a file; removing an absent file succeeds.
    async fn remove_file(&self, key: &str) -> Result<()>;

    /// List up to `limit` files, resuming from `continuation` when given.
    async fn list_files_page(&self, limit: usize, continuation: Option<&str>)
        -> Result<FileListing>;

    /// List up to `limit` files from the start of the bucket.
    async fn list_files(&self, limit: usize) -> Result<Vec<(String, u64)>> {
        Ok(self.list_files_page(limit, None).await?.files)
    }

    /// Size of a file in bytes.
    async fn size_of(&self, key: &str) -> Result<u64>;

    /// Stream a file, optionally limited to an inclusive byte range.
    ///
    /// # Errors
    /// - `ObjectNotFound` if the file does not exist; checked before streaming
    async fn get_file_as_readable(&self, key: &str, range: Option<ByteRange>)
        -> Result<ByteStream>;

    /// Diagnostic snapshot of internal fields.
    async fn introspect(&self) -> Introspection;
}
