//! Shared backend behavior on top of any [`ObjectStore`].
//!
//! `ManagedBackend` owns the selected-bucket pointer, the bucket cache and
//! the idempotence rules, so a vendor store only has to provide raw
//! capabilities.
//!
//! # Ordering
//! - Precondition failures (no bucket selected, unusable name or key, missing
//!   source file) are reported before any remote call, including the
//!   implicit `init`.
//! - The state lock is never held across a remote call. Concurrent calls on
//!   the same bucket are not serialized.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use omnistore_common::{BucketName, ByteRange, Error, ObjectKey, Result};

use crate::backend::{FileListing, Introspection, StorageBackend};
use crate::config::StorageType;
use crate::state::BackendState;
use crate::store::{reader_stream, BucketInfo, ByteStream, ObjectBody, ObjectStore};

/// Largest page requested from a store in one call.
pub const MAX_PAGE_SIZE: usize = 1000;

/// A [`StorageBackend`] driving one [`ObjectStore`].
pub struct ManagedBackend<S: ObjectStore> {
    store: S,
    storage_type: StorageType,
    state: RwLock<BackendState>,
}

impl<S: ObjectStore> ManagedBackend<S> {
    /// Create a backend around `store`.
    ///
    /// `bucket` is selected right away but not created; the first file
    /// operation creates it if needed.
    ///
    /// # Errors
    /// - `bucket` is not a usable bucket name
    pub fn new(store: S, storage_type: StorageType, bucket: Option<&str>) -> Result<Self> {
        let selected = bucket.map(BucketName::new).transpose()?;
        Ok(Self {
            store,
            storage_type,
            state: RwLock::new(BackendState::with_selection(selected)),
        })
    }

    /// Get the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Snapshot of the current state.
    pub async fn state(&self) -> BackendState {
        self.state.read().await.clone()
    }

    async fn require_selected(&self) -> Result<BucketName> {
        self.state
            .read()
            .await
            .selected
            .clone()
            .ok_or(Error::NoBucketSelected)
    }

    async fn resolve_bucket(&self, name: Option<&str>) -> Result<BucketName> {
        match name {
            Some(name) => BucketName::new(name),
            None => self.require_selected().await,
        }
    }

    async fn ensure_init(&self) -> Result<()> {
        self.init().await.map(|_| ())
    }

    /// Create `bucket` unless the backend already has it.
    ///
    /// With `trust_cache` a cached entry skips the remote check. Uploads pass
    /// `false`, so a bucket deleted elsewhere is created again.
    async fn ensure_bucket(&self, bucket: &BucketName, trust_cache: bool) -> Result<()> {
        if trust_cache && self.state.read().await.cache.has_bucket(bucket.as_str()) {
            debug!(bucket = %bucket, "bucket known from cache");
            return Ok(());
        }

        if self.store.bucket_exists(bucket).await? {
            debug!(bucket = %bucket, "bucket exists on backend");
            self.state
                .write()
                .await
                .cache
                .record_bucket(BucketInfo::named(bucket.as_str()));
            return Ok(());
        }

        let info = match self.store.create_bucket(bucket).await {
            Ok(info) => {
                info!("Created bucket {}", bucket);
                info
            }
            Err(Error::AlreadyExists(msg)) => {
                debug!(bucket = %bucket, "bucket already owned: {}", msg);
                BucketInfo::named(bucket.as_str())
            }
            Err(e) => return Err(e),
        };

        self.state.write().await.cache.record_bucket(info);
        Ok(())
    }

    /// Collect every key of `bucket`, following continuation tokens.
    async fn all_keys(&self, bucket: &BucketName) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = self
                .store
                .list_objects(bucket, token.as_deref(), MAX_PAGE_SIZE)
                .await?;
            keys.extend(page.objects.into_iter().map(|o| o.key));

            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        Ok(keys)
    }

    async fn clear_normalized(&self, bucket: &BucketName) -> Result<()> {
        let keys = self.all_keys(bucket).await?;
        let count = keys.len();

        for key in keys {
            match self.store.delete_object(bucket, &key).await {
                Ok(()) | Err(Error::ObjectNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        self.state.write().await.cache.clear_files(bucket);
        info!("Cleared {} files from bucket {}", count, bucket);
        Ok(())
    }

    /// Shared tail of the three `add_file_from_*` operations.
    async fn store_body(&self, bucket: BucketName, key: ObjectKey, body: ObjectBody) -> Result<()> {
        self.ensure_init().await?;
        self.ensure_bucket(&bucket, false).await?;

        let key = key.to_string();
        let meta = self.store.put_object(&bucket, &key, body).await?;
        debug!(bucket = %bucket, key = %key, size = meta.size, "stored file");

        self.state
            .write()
            .await
            .cache
            .record_file(&bucket, &meta.key, meta.size);
        Ok(())
    }
}

#[async_trait]
impl<S: ObjectStore> StorageBackend for ManagedBackend<S> {
    fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    async fn init(&self) -> Result<bool> {
        if self.state.read().await.initialized {
            return Ok(true);
        }

        self.store.authorize().await?;

        let selected = self.state.read().await.selected.clone();
        let known = match &selected {
            Some(bucket) => self.store.bucket_exists(bucket).await?,
            None => false,
        };

        let mut state = self.state.write().await;
        if let (Some(bucket), true) = (selected, known) {
            state.cache.record_bucket(BucketInfo::named(bucket.as_str()));
        }
        state.initialized = true;
        info!("Initialized {} storage", self.store.name());
        Ok(true)
    }

    async fn test(&self) -> Result<String> {
        if !self.state.read().await.initialized {
            return Err(Error::NotInitialized);
        }
        self.store.check_connection().await?;
        Ok("ok".to_string())
    }

    async fn create_bucket(&self, name: &str) -> Result<()> {
        let bucket = BucketName::new(name)?;
        self.ensure_init().await?;
        self.ensure_bucket(&bucket, true).await
    }

    async fn select_bucket(&self, name: Option<&str>) -> Result<()> {
        let Some(name) = name else {
            let mut state = self.state.write().await;
            state.selected = None;
            state.continuation = None;
            return Ok(());
        };

        let bucket = BucketName::new(name)?;
        self.ensure_init().await?;
        self.ensure_bucket(&bucket, true).await?;

        let mut state = self.state.write().await;
        if state.selected.as_ref() != Some(&bucket) {
            state.continuation = None;
        }
        state.selected = Some(bucket);
        Ok(())
    }

    async fn selected_bucket(&self) -> Option<BucketName> {
        self.state.read().await.selected.clone()
    }

    async fn list_buckets(&self) -> Result<Vec<String>> {
        self.ensure_init().await?;
        let listing = self.store.list_buckets().await?;
        let names = listing.iter().map(|b| b.name.clone()).collect();
        self.state.write().await.cache.merge_bucket_listing(&listing);
        Ok(names)
    }

    async fn clear_bucket(&self, name: Option<&str>) -> Result<()> {
        let bucket = self.resolve_bucket(name).await?;
        self.ensure_init().await?;
        self.clear_normalized(&bucket).await
    }

    async fn delete_bucket(&self, name: Option<&str>) -> Result<()> {
        let bucket = self.resolve_bucket(name).await?;
        self.ensure_init().await?;

        if self.store.bucket_exists(&bucket).await? {
            self.clear_normalized(&bucket).await?;
            match self.store.delete_bucket(&bucket).await {
                Ok(()) => info!("Deleted bucket {}", bucket),
                Err(Error::BucketNotFound(_)) => debug!(bucket = %bucket, "bucket already gone"),
                Err(e) => return Err(e),
            }
        } else {
            debug!(bucket = %bucket, "bucket does not exist; nothing to delete");
        }

        let mut state = self.state.write().await;
        state.cache.evict_bucket(bucket.as_str());
        state.unselect(&bucket);
        Ok(())
    }

    async fn add_file_from_path(&self, source: &Path, target: &str) -> Result<()> {
        let bucket = self.require_selected().await?;
        let key = ObjectKey::parse(target)?;

        let metadata = fs::metadata(source).await.map_err(|e| {
            Error::Transfer(format!("Cannot read {}: {}", source.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(Error::Transfer(format!(
                "{} is not a regular file",
                source.display()
            )));
        }
        let file = fs::File::open(source).await.map_err(|e| {
            Error::Transfer(format!("Cannot open {}: {}", source.display(), e))
        })?;

        let body = ObjectBody::from_stream(reader_stream(file), Some(metadata.len()));
        self.store_body(bucket, key, body).await
    }

    async fn add_file_from_buffer(&self, buffer: Bytes, target: &str) -> Result<()> {
        let bucket = self.require_selected().await?;
        let key = ObjectKey::parse(target)?;
        self.store_body(bucket, key, ObjectBody::from_bytes(buffer))
            .await
    }

    async fn add_file_from_readable(&self, stream: ByteStream, target: &str) -> Result<()> {
        let bucket = self.require_selected().await?;
        let key = ObjectKey::parse(target)?;
        self.store_body(bucket, key, ObjectBody::from_stream(stream, None))
            .await
    }

    async fn remove_file(&self, key: &str) -> Result<()> {
        let bucket = self.require_selected().await?;
        let key = ObjectKey::parse(key)?.to_string();
        self.ensure_init().await?;

        match self.store.delete_object(&bucket, &key).await {
            Ok(()) => debug!(bucket = %bucket, key = %key, "removed file"),
            Err(Error::ObjectNotFound { .. }) => {
                debug!(bucket = %bucket, key = %key, "file already absent")
            }
            Err(e) => return Err(e),
        }

        self.state.write().await.cache.evict_file(&bucket, &key);
        Ok(())
    }

    async fn list_files_page(
        &self,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<FileListing> {
        let bucket = self.require_selected().await?;
        self.ensure_init().await?;

        let mut objects = Vec::new();
        let mut token = continuation.map(String::from);

        while objects.len() < limit {
            let max = (limit - objects.len()).min(MAX_PAGE_SIZE);
            let page = self
                .store
                .list_objects(&bucket, token.as_deref(), max)
                .await?;
            objects.extend(page.objects.into_iter().take(max));
            token = page.next;
            if token.is_none() {
                break;
            }
        }

        let mut state = self.state.write().await;
        if continuation.is_none() {
            state.cache.replace_files(&bucket, &objects);
        } else {
            state.cache.extend_files(&bucket, &objects);
        }
        state.continuation = token.clone();
        drop(state);

        debug!(bucket = %bucket, count = objects.len(), "listed files");
        Ok(FileListing {
            files: objects.into_iter().map(|o| (o.key, o.size)).collect(),
            next: token,
        })
    }

    async fn size_of(&self, key: &str) -> Result<u64> {
        let bucket = self.require_selected().await?;
        let key = ObjectKey::parse(key)?.to_string();
        self.ensure_init().await?;

        let meta = self.store.head_object(&bucket, &key).await?;
        self.state
            .write()
            .await
            .cache
            .record_file(&bucket, &meta.key, meta.size);
        Ok(meta.size)
    }

    async fn get_file_as_readable(
        &self,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream> {
        let bucket = self.require_selected().await?;
        let key = ObjectKey::parse(key)?.to_string();
        self.ensure_init().await?;

        self.store.head_object(&bucket, &key).await?;
        self.store.get_object(&bucket, &key, range).await
    }

    async fn introspect(&self) -> Introspection {
        Introspection {
            storage_type: self.storage_type,
            bucket_name: self.selected_bucket().await.map(|b| b.to_string()),
            directory: self.store.directory().map(Path::to_path_buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use futures::{stream, StreamExt};

    fn backend(bucket: Option<&str>) -> ManagedBackend<MemoryStore> {
        ManagedBackend::new(MemoryStore::new(), StorageType::Memory, bucket).unwrap()
    }

    async fn read_all(mut stream: ByteStream) -> Vec<u8> {
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk.unwrap());
        }
        data
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let backend = backend(None);
        assert!(backend.init().await.unwrap());
        let calls = backend.store().call_count();
        assert!(backend.init().await.unwrap());
        assert_eq!(backend.store().call_count(), calls);
    }

    #[tokio::test]
    async fn test_test_requires_init() {
        let backend = backend(None);
        assert!(matches!(backend.test().await, Err(Error::NotInitialized)));
        backend.init().await.unwrap();
        assert_eq!(backend.test().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_create_bucket_twice() {
        let backend = backend(None);
        backend.create_bucket("Holiday Photos").await.unwrap();
        let calls = backend.store().call_count();
        backend.create_bucket("holiday photos").await.unwrap();

        assert_eq!(backend.store().call_count(), calls);
        assert_eq!(backend.list_buckets().await.unwrap(), vec!["holiday-photos"]);
    }

    #[tokio::test]
    async fn test_create_bucket_already_owned_is_success() {
        let store = MemoryStore::new().with_hidden_bucket("shared");
        let backend = ManagedBackend::new(store, StorageType::Memory, None).unwrap();
        backend.create_bucket("shared").await.unwrap();
        assert!(backend.state().await.cache.has_bucket("shared"));
    }

    #[tokio::test]
    async fn test_select_bucket_failure_keeps_previous() {
        let store = MemoryStore::new().with_rejected_bucket("over-quota");
        let backend = ManagedBackend::new(store, StorageType::Memory, None).unwrap();

        backend.select_bucket(Some("first")).await.unwrap();
        let err = backend.select_bucket(Some("over-quota")).await.unwrap_err();

        assert!(matches!(err, Error::Backend(_)));
        assert_eq!(backend.selected_bucket().await.unwrap().as_str(), "first");
    }

    #[tokio::test]
    async fn test_select_none_clears() {
        let backend = backend(Some("photos"));
        backend.select_bucket(None).await.unwrap();
        assert!(backend.selected_bucket().await.is_none());
    }

    #[tokio::test]
    async fn test_file_ops_without_bucket_make_no_calls() {
        let backend = backend(None);

        let err = backend
            .add_file_from_path(Path::new("./missing.jpg"), "a.jpg")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoBucketSelected));
        assert!(matches!(
            backend.list_files(10).await,
            Err(Error::NoBucketSelected)
        ));
        assert!(matches!(
            backend.add_file_from_buffer(Bytes::from_static(b"x"), "a").await,
            Err(Error::NoBucketSelected)
        ));
        assert!(matches!(
            backend.size_of("a").await,
            Err(Error::NoBucketSelected)
        ));
        assert!(matches!(
            backend.clear_bucket(None).await,
            Err(Error::NoBucketSelected)
        ));

        assert_eq!(backend.store().call_count(), 0);
    }

    #[tokio::test]
    async fn test_buffer_round_trip() {
        let backend = backend(Some("photos"));
        let data = Bytes::from((0u8..=255).collect::<Vec<u8>>());

        backend
            .add_file_from_buffer(data.clone(), "raw/bytes.bin")
            .await
            .unwrap();
        let stream = backend
            .get_file_as_readable("raw/bytes.bin", None)
            .await
            .unwrap();

        assert_eq!(read_all(stream).await, data.to_vec());
    }

    #[tokio::test]
    async fn test_range_read() {
        let backend = backend(Some("photos"));
        backend
            .add_file_from_buffer(Bytes::from_static(b"0123456789"), "digits.txt")
            .await
            .unwrap();

        let range = ByteRange::new(2, Some(5)).unwrap();
        let stream = backend
            .get_file_as_readable("digits.txt", Some(range))
            .await
            .unwrap();
        assert_eq!(read_all(stream).await, b"2345");
    }

    #[tokio::test]
    async fn test_readable_creates_bucket() {
        let backend = backend(Some("Fresh Bucket"));
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];

        backend
            .add_file_from_readable(Box::pin(stream::iter(chunks)), "greeting.txt")
            .await
            .unwrap();

        assert_eq!(backend.list_buckets().await.unwrap(), vec!["fresh-bucket"]);
        assert_eq!(backend.size_of("greeting.txt").await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_upload_recreates_bucket_deleted_behind_cache() {
        let backend = backend(Some("photos"));
        backend
            .add_file_from_buffer(Bytes::from_static(b"one"), "one.txt")
            .await
            .unwrap();
        assert!(backend.state().await.cache.has_bucket("photos"));

        let bucket = BucketName::new("photos").unwrap();
        backend.store().delete_object(&bucket, "one.txt").await.unwrap();
        backend.store().delete_bucket(&bucket).await.unwrap();

        backend
            .add_file_from_buffer(Bytes::from_static(b"two"), "two.txt")
            .await
            .unwrap();
        assert_eq!(
            backend.list_files(10).await.unwrap(),
            vec![("two.txt".to_string(), 3)]
        );
    }

    #[tokio::test]
    async fn test_failed_stream_is_transfer_error() {
        let backend = backend(Some("photos"));
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(Error::Transfer("source went away".to_string())),
        ];

        let err = backend
            .add_file_from_readable(Box::pin(stream::iter(chunks)), "broken.bin")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transfer(_)));
    }

    #[tokio::test]
    async fn test_missing_source_is_rejected_transfer() {
        let backend = backend(Some("photos"));
        backend.create_bucket("photos").await.unwrap();
        let err = backend
            .add_file_from_path(Path::new("./does/not/exist.jpg"), "exist.jpg")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transfer(_)));
        assert!(backend.list_files(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_file_idempotent() {
        let backend = backend(Some("photos"));
        backend
            .add_file_from_buffer(Bytes::from_static(b"abc"), "a.jpg")
            .await
            .unwrap();

        backend.remove_file("a.jpg").await.unwrap();
        backend.remove_file("a.jpg").await.unwrap();
        assert!(backend.list_files(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listing_after_removal() {
        let backend = backend(Some("photos"));
        backend
            .add_file_from_buffer(Bytes::from_static(b"aaaa"), "a.jpg")
            .await
            .unwrap();
        backend
            .add_file_from_buffer(Bytes::from_static(b"bb"), "subdir/b.jpg")
            .await
            .unwrap();

        assert_eq!(
            backend.list_files(1000).await.unwrap(),
            vec![("a.jpg".to_string(), 4), ("subdir/b.jpg".to_string(), 2)]
        );

        backend.remove_file("subdir/b.jpg").await.unwrap();
        assert_eq!(
            backend.list_files(1000).await.unwrap(),
            vec![("a.jpg".to_string(), 4)]
        );
    }

    #[tokio::test]
    async fn test_key_is_slugified() {
        let backend = backend(Some("photos"));
        backend
            .add_file_from_buffer(Bytes::from_static(b"img"), "My Folder/Ünïcode name.jpg")
            .await
            .unwrap();

        let files = backend.list_files(10).await.unwrap();
        assert_eq!(files, vec![("my-folder/unicode-name.jpg".to_string(), 3)]);
        assert_eq!(backend.size_of("My Folder/Ünïcode name.jpg").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_list_files_pagination() {
        let backend = backend(Some("photos"));
        for i in 0..5 {
            backend
                .add_file_from_buffer(Bytes::from(vec![0u8; i + 1]), &format!("file{}.bin", i))
                .await
                .unwrap();
        }

        let first = backend.list_files_page(2, None).await.unwrap();
        assert_eq!(first.files.len(), 2);
        assert!(first.next.is_some());
        assert_eq!(backend.state().await.continuation, first.next);

        let rest = backend
            .list_files_page(10, first.next.as_deref())
            .await
            .unwrap();
        assert_eq!(rest.files.len(), 3);
        assert!(rest.next.is_none());

        let restarted = backend.list_files(2).await.unwrap();
        assert_eq!(restarted, first.files);
    }

    #[tokio::test]
    async fn test_size_of_missing_file() {
        let backend = backend(Some("photos"));
        backend.create_bucket("photos").await.unwrap();
        assert!(matches!(
            backend.size_of("nope.jpg").await,
            Err(Error::ObjectNotFound { .. })
        ));
        assert!(matches!(
            backend.get_file_as_readable("nope.jpg", None).await,
            Err(Error::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_clear_bucket_tolerates_empty() {
        let backend = backend(Some("photos"));
        backend.create_bucket("photos").await.unwrap();
        backend.clear_bucket(None).await.unwrap();

        backend
            .add_file_from_buffer(Bytes::from_static(b"x"), "a.jpg")
            .await
            .unwrap();
        backend.clear_bucket(Some("photos")).await.unwrap();
        assert!(backend.list_files(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_selected_bucket_resets_selection() {
        let backend = backend(Some("photos"));
        backend
            .add_file_from_buffer(Bytes::from_static(b"x"), "a.jpg")
            .await
            .unwrap();

        backend.delete_bucket(None).await.unwrap();

        assert!(backend.selected_bucket().await.is_none());
        assert!(!backend.state().await.cache.has_bucket("photos"));
        assert!(backend.list_buckets().await.unwrap().is_empty());

        backend.delete_bucket(Some("photos")).await.unwrap();
    }

    #[tokio::test]
    async fn test_introspect() {
        let backend = backend(Some("Local Bucket"));
        let view = backend.introspect().await;
        assert_eq!(view.storage_type, StorageType::Memory);
        assert_eq!(view.bucket_name.as_deref(), Some("local-bucket"));
        assert_eq!(view.directory, None);
    }
}
