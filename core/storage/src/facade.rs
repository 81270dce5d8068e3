//! Single caller-facing entry point.

use bytes::Bytes;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use omnistore_common::{BucketName, ByteRange, Error, Result};

use crate::backend::{FileListing, Introspection, StorageBackend, DEFAULT_LIST_LIMIT};
use crate::config::{ConfigInput, ConfigParser, StorageType};
use crate::registry::{create_default_registry, BackendRegistry};
use crate::store::ByteStream;

/// Storage facade.
///
/// Owns exactly one backend, chosen once from the config's type tag, and
/// forwards every operation to it unchanged.
///
/// # Example
/// ```no_run
/// # async fn demo() -> omnistore_common::Result<()> {
/// use omnistore_storage::Storage;
///
/// let storage = Storage::new("local:///tmp/omnistore?bucketName=photos")?;
/// storage.init().await?;
/// storage.add_file_from_path("./image1.jpg".as_ref(), "2024/image1.jpg").await?;
/// # Ok(())
/// # }
/// ```
pub struct Storage {
    backend: Arc<dyn StorageBackend>,
}

impl Storage {
    /// Build a storage from a descriptor, a structured config or JSON.
    ///
    /// # Errors
    /// - The config is malformed or names an unknown type
    /// - The backend rejects the config
    pub fn new(input: impl Into<ConfigInput>) -> Result<Self> {
        Self::with_registry(input, &create_default_registry())
    }

    /// Build a storage using a custom registry.
    pub fn with_registry(input: impl Into<ConfigInput>, registry: &BackendRegistry) -> Result<Self> {
        let config = ConfigParser::parse_any(input)?;
        debug!(storage_type = %config.storage_type(), "creating storage");
        Ok(Self {
            backend: registry.resolve(config)?,
        })
    }

    /// Wrap an already constructed backend.
    pub fn from_backend(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Get the active backend.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Get the backend type.
    pub fn storage_type(&self) -> StorageType {
        self.backend.storage_type()
    }

    /// Authorize against the backend; repeat calls are no-ops.
    pub async fn init(&self) -> Result<bool> {
        self.backend.init().await
    }

    /// Check connectivity; requires `init`.
    pub async fn test(&self) -> Result<String> {
        self.backend.test().await
    }

    /// Create a bucket unless it already exists.
    pub async fn create_bucket(&self, name: &str) -> Result<()> {
        self.backend.create_bucket(name).await
    }

    /// Select the bucket file operations target; `None` clears it.
    pub async fn select_bucket(&self, name: Option<&str>) -> Result<()> {
        self.backend.select_bucket(name).await
    }

    /// Get the selected bucket.
    pub async fn selected_bucket(&self) -> Option<BucketName> {
        self.backend.selected_bucket().await
    }

    /// List bucket names in backend order.
    pub async fn list_buckets(&self) -> Result<Vec<String>> {
        self.backend.list_buckets().await
    }

    /// Delete every file in the named or selected bucket.
    pub async fn clear_bucket(&self, name: Option<&str>) -> Result<()> {
        self.backend.clear_bucket(name).await
    }

    /// Clear and remove the named or selected bucket.
    pub async fn delete_bucket(&self, name: Option<&str>) -> Result<()> {
        self.backend.delete_bucket(name).await
    }

    /// Upload a local file to `target` in the selected bucket.
    pub async fn add_file_from_path(&self, source: &Path, target: &str) -> Result<()> {
        self.backend.add_file_from_path(source, target).await
    }

    /// Upload a buffer to `target` in the selected bucket.
    pub async fn add_file_from_buffer(&self, buffer: Bytes, target: &str) -> Result<()> {
        self.backend.add_file_from_buffer(buffer, target).await
    }

    /// Upload a byte stream to `target` in the selected bucket.
    pub async fn add_file_from_readable(&self, stream: ByteStream, target: &str) -> Result<()> {
        self.backend.add_file_from_readable(stream, target).await
    }

    /// Remove a file; absent files are ignored.
    pub async fn remove_file(&self, key: &str) -> Result<()> {
        self.backend.remove_file(key).await
    }

    /// List up to `limit` files (default 1000) from the start of the bucket.
    pub async fn list_files(&self, limit: Option<usize>) -> Result<Vec<(String, u64)>> {
        self.backend
            .list_files(limit.unwrap_or(DEFAULT_LIST_LIMIT))
            .await
    }

    /// List up to `limit` files, resuming from `continuation` when given.
    pub async fn list_files_page(
        &self,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<FileListing> {
        self.backend.list_files_page(limit, continuation).await
    }

    /// Get the size of a file in bytes.
    pub async fn size_of(&self, key: &str) -> Result<u64> {
        self.backend.size_of(key).await
    }

    /// Stream a file, optionally limited to an inclusive byte range.
    pub async fn get_file_as_readable(
        &self,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream> {
        self.backend.get_file_as_readable(key, range).await
    }

    /// Diagnostic view of the backend; never contains credentials.
    ///
    /// Without a key the whole view is returned as a JSON object; with a key
    /// only that field (`type`, `bucketName` or `directory`), `null` if unset.
    ///
    /// # Errors
    /// - `key` names no diagnostic field
    pub async fn introspect(&self, key: Option<&str>) -> Result<Value> {
        let view: Introspection = self.backend.introspect().await;
        match key {
            None => serde_json::to_value(&view)
                .map_err(|e| Error::Backend(format!("Failed to serialize introspection: {}", e))),
            Some(key @ ("type" | "bucketName" | "bucket_name" | "directory")) => {
                Ok(view.get(key).map_or(Value::Null, Value::String))
            }
            Some(other) => Err(Error::Validation(format!(
                "Unknown introspection field \"{}\"",
                other
            ))),
        }
    }
}
