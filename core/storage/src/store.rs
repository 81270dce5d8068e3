//! Vendor capability contract.
//!
//! An [`ObjectStore`] is the thin, vendor-specific layer that talks to one
//! storage service. It knows nothing about selected buckets, caching or
//! idempotence; [`crate::ManagedBackend`] adds those on top of any store.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use omnistore_common::{BucketName, ByteRange, Error, Result};

/// Byte stream type for upload/download operations.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Wrap an async reader as a [`ByteStream`].
///
/// Read failures surface as [`Error::Transfer`]. The reader is dropped, and any
/// handle it owns released, when the stream ends or is dropped.
pub fn reader_stream<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Send + 'static,
{
    let stream = ReaderStream::new(reader)
        .map(|chunk| chunk.map_err(|e| Error::Transfer(format!("Failed to read source: {}", e))));
    Box::pin(stream)
}

/// Build the HTTP client used by the remote stores.
pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("OmniStore/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Backend(format!("Failed to create HTTP client: {}", e)))
}

/// Data handed to [`ObjectStore::put_object`].
pub struct ObjectBody {
    /// Content, streamed end-to-end.
    pub stream: ByteStream,
    /// Total length when known up front.
    pub length: Option<u64>,
}

impl ObjectBody {
    /// Body backed by an in-memory buffer.
    pub fn from_bytes(data: Bytes) -> Self {
        let length = Some(data.len() as u64);
        Self {
            stream: Box::pin(stream::once(async move { Ok(data) })),
            length,
        }
    }

    /// Body backed by a stream of unknown or known length.
    pub fn from_stream(stream: ByteStream, length: Option<u64>) -> Self {
        Self { stream, length }
    }

    /// Drain the body into memory.
    ///
    /// Only for services that require the full length before the first byte.
    pub async fn collect(mut self) -> Result<Bytes> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.stream.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

/// Metadata of a bucket as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketInfo {
    /// Normalized bucket name.
    pub name: String,
    /// Provider-specific identifier.
    pub id: Option<String>,
    /// Region, location or storage class.
    pub region: Option<String>,
    /// Revision counter where the provider keeps one.
    pub revision: Option<u64>,
    /// Creation time.
    pub created: Option<DateTime<Utc>>,
}

impl BucketInfo {
    /// Bucket known only by name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            region: None,
            revision: None,
            created: None,
        }
    }
}

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Key within the bucket.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Content hash (MD5, SHA1 or ETag, whatever the provider exposes).
    pub content_hash: Option<String>,
    /// MIME type.
    pub content_type: Option<String>,
    /// Upload or last modification time.
    pub uploaded: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Object known only by key and size.
    pub fn sized(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            content_hash: None,
            content_type: None,
            uploaded: None,
        }
    }
}

/// One page of an object listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectPage {
    pub objects: Vec<ObjectMeta>,
    /// Token for the next page; `None` when the listing is exhausted.
    pub next: Option<String>,
}

/// Storage capabilities a vendor must provide.
///
/// All operations are async. Implementations map their own transport and API
/// failures onto [`Error`]:
/// - a bucket the caller already owns → [`Error::AlreadyExists`]
/// - a missing bucket → [`Error::BucketNotFound`]
/// - a missing object → [`Error::ObjectNotFound`]
/// - everything else → [`Error::Backend`] with the original message
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get the store name (e.g., "local", "s3", "b2").
    fn name(&self) -> &str;

    /// Root directory, for stores backed by the local filesystem.
    fn directory(&self) -> Option<&Path> {
        None
    }

    /// One-time authorization handshake.
    async fn authorize(&self) -> Result<()>;

    /// Lightweight connectivity check.
    async fn check_connection(&self) -> Result<()>;

    /// List buckets in backend order.
    async fn list_buckets(&self) -> Result<Vec<BucketInfo>>;

    /// Check if a bucket exists.
    async fn bucket_exists(&self, bucket: &BucketName) -> Result<bool>;

    /// Create a bucket.
    async fn create_bucket(&self, bucket: &BucketName) -> Result<BucketInfo>;

    /// Delete an empty bucket.
    async fn delete_bucket(&self, bucket: &BucketName) -> Result<()>;

    /// List up to `max` objects, resuming after `continuation` when given.
    async fn list_objects(
        &self,
        bucket: &BucketName,
        continuation: Option<&str>,
        max: usize,
    ) -> Result<ObjectPage>;

    /// Get metadata for an object.
    async fn head_object(&self, bucket: &BucketName, key: &str) -> Result<ObjectMeta>;

    /// Store an object, replacing any previous content under `key`.
    async fn put_object(&self, bucket: &BucketName, key: &str, body: ObjectBody)
        -> Result<ObjectMeta>;

    /// Stream an object, optionally limited to `range`.
    async fn get_object(
        &self,
        bucket: &BucketName,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream>;

    /// Delete an object.
    async fn delete_object(&self, bucket: &BucketName, key: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_body_from_bytes_collects() {
        let body = ObjectBody::from_bytes(Bytes::from_static(b"hello"));
        assert_eq!(body.length, Some(5));
        assert_eq!(body.collect().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_reader_stream_yields_content() {
        let data: &'static [u8] = b"streamed content";
        let mut stream = reader_stream(data);
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, data);
    }

    #[test]
    fn test_object_meta_serialization() {
        let meta = ObjectMeta {
            key: "subdir/a.jpg".to_string(),
            size: 32201,
            content_hash: Some("abc123".to_string()),
            content_type: Some("image/jpeg".to_string()),
            uploaded: Some(Utc::now()),
        };

        let json = serde_json::to_string(&meta).unwrap();
        let deserialized: ObjectMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.key, meta.key);
        assert_eq!(deserialized.size, meta.size);
    }
}
