//! Local filesystem object store.
//!
//! Every bucket is a sub-directory of the root; object keys map onto nested
//! directories below it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use omnistore_common::{BucketName, ByteRange, Error, Result};

use crate::store::{
    reader_stream, BucketInfo, ByteStream, ObjectBody, ObjectMeta, ObjectPage, ObjectStore,
};

/// Directory below the root that holds in-flight uploads.
///
/// Bucket names never start with `.`, so it cannot collide with a bucket.
const STAGING_DIR: &str = ".staging";

fn io_error(context: impl std::fmt::Display, e: std::io::Error) -> Error {
    Error::Backend(format!("{}: {}", context, e))
}

fn modified_at(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

/// Local filesystem object store.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a store rooted at `root`.
    ///
    /// The directory is created on `authorize` if it does not exist.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn bucket_path(&self, bucket: &BucketName) -> PathBuf {
        self.root.join(bucket.as_str())
    }

    fn object_path(&self, bucket: &BucketName, key: &str) -> PathBuf {
        let mut path = self.bucket_path(bucket);
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }

    async fn require_bucket(&self, bucket: &BucketName) -> Result<PathBuf> {
        let path = self.bucket_path(bucket);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(path),
            Ok(_) => Err(Error::BucketNotFound(bucket.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::BucketNotFound(bucket.to_string()))
            }
            Err(e) => Err(io_error(path.display(), e)),
        }
    }

    /// Recursively collect every file below `dir` as `(key, metadata)`.
    async fn walk(dir: &Path) -> Result<Vec<(String, std::fs::Metadata)>> {
        let mut files = Vec::new();
        let mut pending = vec![(dir.to_path_buf(), String::new())];

        while let Some((path, prefix)) = pending.pop() {
            let mut entries = fs::read_dir(&path)
                .await
                .map_err(|e| io_error(path.display(), e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error(path.display(), e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", prefix, name)
                };
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| io_error(entry.path().display(), e))?;

                if meta.is_dir() {
                    pending.push((entry.path(), key));
                } else if meta.is_file() {
                    files.push((key, meta));
                }
            }
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    /// Remove empty directories between `path` and the bucket root.
    async fn prune_empty_parents(&self, bucket_root: &Path, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == bucket_root || !dir.starts_with(bucket_root) {
                break;
            }
            // Fails on non-empty directories, which ends the walk.
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            debug!(dir = %dir.display(), "pruned empty directory");
            current = dir.parent();
        }
    }

    async fn write_body(path: &Path, mut body: ObjectBody) -> Result<u64> {
        let mut file = fs::File::create(path)
            .await
            .map_err(|e| io_error(path.display(), e))?;
        let mut written = 0u64;

        while let Some(chunk) = body.stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::Transfer(format!("Failed to write {}: {}", path.display(), e)))?;
            written += chunk.len() as u64;
        }

        file.flush()
            .await
            .map_err(|e| Error::Transfer(format!("Failed to write {}: {}", path.display(), e)))?;
        Ok(written)
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    fn directory(&self) -> Option<&Path> {
        Some(&self.root)
    }

    async fn authorize(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error(self.root.display(), e))
    }

    async fn check_connection(&self) -> Result<()> {
        let meta = fs::metadata(&self.root)
            .await
            .map_err(|e| io_error(self.root.display(), e))?;
        if !meta.is_dir() {
            return Err(Error::Backend(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error(self.root.display(), e))?;
        let mut buckets = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(self.root.display(), e))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| io_error(entry.path().display(), e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if meta.is_dir() && !name.starts_with('.') {
                buckets.push(BucketInfo {
                    created: modified_at(&meta),
                    ..BucketInfo::named(name)
                });
            }
        }

        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn bucket_exists(&self, bucket: &BucketName) -> Result<bool> {
        match self.require_bucket(bucket).await {
            Ok(_) => Ok(true),
            Err(Error::BucketNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_bucket(&self, bucket: &BucketName) -> Result<BucketInfo> {
        if self.bucket_exists(bucket).await? {
            return Err(Error::AlreadyExists(bucket.to_string()));
        }
        let path = self.bucket_path(bucket);
        fs::create_dir_all(&path)
            .await
            .map_err(|e| io_error(path.display(), e))?;

        Ok(BucketInfo {
            created: Some(Utc::now()),
            ..BucketInfo::named(bucket.as_str())
        })
    }

    async fn delete_bucket(&self, bucket: &BucketName) -> Result<()> {
        let path = self.require_bucket(bucket).await?;
        fs::remove_dir(&path)
            .await
            .map_err(|e| io_error(path.display(), e))
    }

    async fn list_objects(
        &self,
        bucket: &BucketName,
        continuation: Option<&str>,
        max: usize,
    ) -> Result<ObjectPage> {
        let path = self.require_bucket(bucket).await?;
        let files = Self::walk(&path).await?;

        let mut remaining = files
            .into_iter()
            .filter(|(key, _)| continuation.map_or(true, |after| key.as_str() > after));
        let objects: Vec<ObjectMeta> = remaining
            .by_ref()
            .take(max)
            .map(|(key, meta)| ObjectMeta {
                uploaded: modified_at(&meta),
                ..ObjectMeta::sized(key, meta.len())
            })
            .collect();

        let next = match (remaining.next(), objects.last()) {
            (Some(_), Some(last)) => Some(last.key.clone()),
            _ => None,
        };

        Ok(ObjectPage { objects, next })
    }

    async fn head_object(&self, bucket: &BucketName, key: &str) -> Result<ObjectMeta> {
        let path = self.object_path(bucket, key);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(ObjectMeta {
                uploaded: modified_at(&meta),
                ..ObjectMeta::sized(key, meta.len())
            }),
            Ok(_) => Err(Error::object_not_found(bucket.as_str(), key)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::object_not_found(bucket.as_str(), key))
            }
            Err(e) => Err(io_error(path.display(), e)),
        }
    }

    async fn put_object(
        &self,
        bucket: &BucketName,
        key: &str,
        body: ObjectBody,
    ) -> Result<ObjectMeta> {
        self.require_bucket(bucket).await?;
        let path = self.object_path(bucket, key);
        let parent = path
            .parent()
            .ok_or_else(|| Error::Validation(format!("Invalid key \"{}\"", key)))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent.display(), e))?;

        let staging = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging)
            .await
            .map_err(|e| io_error(staging.display(), e))?;

        let partial = staging.join(Uuid::new_v4().to_string());
        let size = match Self::write_body(&partial, body).await {
            Ok(size) => size,
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        fs::rename(&partial, &path)
            .await
            .map_err(|e| io_error(path.display(), e))?;

        Ok(ObjectMeta {
            uploaded: Some(Utc::now()),
            ..ObjectMeta::sized(key, size)
        })
    }

    async fn get_object(
        &self,
        bucket: &BucketName,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream> {
        let meta = self.head_object(bucket, key).await?;
        let path = self.object_path(bucket, key);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| io_error(path.display(), e))?;

        let Some(range) = range else {
            return Ok(reader_stream(file));
        };

        let len = range.len_within(meta.size);
        if len > 0 {
            file.seek(SeekFrom::Start(range.start))
                .await
                .map_err(|e| io_error(path.display(), e))?;
        }
        Ok(reader_stream(file.take(len)))
    }

    async fn delete_object(&self, bucket: &BucketName, key: &str) -> Result<()> {
        let bucket_root = self.bucket_path(bucket);
        let path = self.object_path(bucket, key);

        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(Error::object_not_found(bucket.as_str(), key)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::object_not_found(bucket.as_str(), key))
            }
            Err(e) => return Err(io_error(path.display(), e)),
        }

        fs::remove_file(&path)
            .await
            .map_err(|e| io_error(path.display(), e))?;
        self.prune_empty_parents(&bucket_root, &path).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn bucket(name: &str) -> BucketName {
        BucketName::new(name).unwrap()
    }

    async fn store() -> (TempDir, LocalStore) {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path().join("data"));
        store.authorize().await.unwrap();
        (temp, store)
    }

    async fn read_all(mut stream: ByteStream) -> Vec<u8> {
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk.unwrap());
        }
        data
    }

    #[tokio::test]
    async fn test_authorize_creates_root() {
        let (temp, store) = store().await;
        assert!(temp.path().join("data").is_dir());
        store.check_connection().await.unwrap();
        assert_eq!(store.directory(), Some(temp.path().join("data").as_path()));
    }

    #[tokio::test]
    async fn test_bucket_lifecycle() {
        let (_temp, store) = store().await;
        let b = bucket("photos");

        assert!(!store.bucket_exists(&b).await.unwrap());
        store.create_bucket(&b).await.unwrap();
        assert!(matches!(
            store.create_bucket(&b).await,
            Err(Error::AlreadyExists(_))
        ));

        let names: Vec<String> = store
            .list_buckets()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["photos"]);

        store.delete_bucket(&b).await.unwrap();
        assert!(matches!(
            store.delete_bucket(&b).await,
            Err(Error::BucketNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_put_and_read_nested() {
        let (temp, store) = store().await;
        let b = bucket("photos");
        store.create_bucket(&b).await.unwrap();

        let meta = store
            .put_object(
                &b,
                "2024/summer/beach.jpg",
                ObjectBody::from_bytes(Bytes::from_static(b"sand and sea")),
            )
            .await
            .unwrap();
        assert_eq!(meta.size, 12);
        assert!(temp
            .path()
            .join("data/photos/2024/summer/beach.jpg")
            .is_file());

        let stream = store
            .get_object(&b, "2024/summer/beach.jpg", ByteRange::new(9, Some(11)).ok())
            .await
            .unwrap();
        assert_eq!(read_all(stream).await, b"sea");
    }

    #[tokio::test]
    async fn test_put_into_missing_bucket() {
        let (_temp, store) = store().await;
        let err = store
            .put_object(
                &bucket("nowhere"),
                "a.txt",
                ObjectBody::from_bytes(Bytes::from_static(b"x")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BucketNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_objects_sorted_and_paged() {
        let (_temp, store) = store().await;
        let b = bucket("photos");
        store.create_bucket(&b).await.unwrap();
        for key in ["b.jpg", "a.jpg", "sub/c.jpg"] {
            store
                .put_object(&b, key, ObjectBody::from_bytes(Bytes::from_static(b"12")))
                .await
                .unwrap();
        }

        let page = store.list_objects(&b, None, 2).await.unwrap();
        let keys: Vec<&str> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a.jpg", "b.jpg"]);
        assert_eq!(page.next.as_deref(), Some("b.jpg"));

        let rest = store
            .list_objects(&b, page.next.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(rest.objects.len(), 1);
        assert_eq!(rest.objects[0].key, "sub/c.jpg");
        assert_eq!(rest.objects[0].size, 2);
        assert!(rest.next.is_none());
    }

    #[tokio::test]
    async fn test_delete_prunes_empty_directories() {
        let (temp, store) = store().await;
        let b = bucket("photos");
        store.create_bucket(&b).await.unwrap();
        store
            .put_object(&b, "x/y/z.txt", ObjectBody::from_bytes(Bytes::from_static(b"z")))
            .await
            .unwrap();

        store.delete_object(&b, "x/y/z.txt").await.unwrap();

        assert!(!temp.path().join("data/photos/x").exists());
        assert!(temp.path().join("data/photos").is_dir());
        assert!(matches!(
            store.delete_object(&b, "x/y/z.txt").await,
            Err(Error::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_dot_prefixed_keys_are_listed() {
        let (_temp, store) = store().await;
        let b = bucket("photos");
        store.create_bucket(&b).await.unwrap();
        store
            .put_object(
                &b,
                ".omnistore-partial-notes.txt",
                ObjectBody::from_bytes(Bytes::from_static(b"abc")),
            )
            .await
            .unwrap();

        let page = store.list_objects(&b, None, 10).await.unwrap();
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].key, ".omnistore-partial-notes.txt");
        assert_eq!(page.objects[0].size, 3);

        let names: Vec<String> = store
            .list_buckets()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["photos"]);
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_nothing_behind() {
        let (_temp, store) = store().await;
        let b = bucket("photos");
        store.create_bucket(&b).await.unwrap();

        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"part")),
            Err(Error::Transfer("interrupted".to_string())),
        ];
        let body = ObjectBody::from_stream(Box::pin(futures::stream::iter(chunks)), None);
        assert!(store.put_object(&b, "a.bin", body).await.is_err());

        let page = store.list_objects(&b, None, 10).await.unwrap();
        assert!(page.objects.is_empty());
    }
}
