//! In-memory object store for testing.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream;
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use omnistore_common::{BucketName, ByteRange, Error, Result};

use crate::store::{BucketInfo, ByteStream, ObjectBody, ObjectMeta, ObjectPage, ObjectStore};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    meta: ObjectMeta,
}

/// In-memory object store.
///
/// All data is lost on drop. Every capability call bumps a counter so tests
/// can assert that a precondition failure never reached the store.
#[derive(Default)]
pub struct MemoryStore {
    buckets: RwLock<BTreeMap<String, BTreeMap<String, StoredObject>>>,
    /// Buckets that exist but are invisible to `bucket_exists`.
    hidden: HashSet<String>,
    /// Buckets whose creation always fails.
    rejected: HashSet<String>,
    calls: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make creation of `bucket` fail with a backend error.
    pub fn with_rejected_bucket(mut self, bucket: &str) -> Self {
        self.rejected.insert(bucket.to_string());
        self
    }

    /// Simulate a bucket owned by the caller that existence checks miss.
    pub fn with_hidden_bucket(mut self, bucket: &str) -> Self {
        self.hidden.insert(bucket.to_string());
        self
    }

    /// Number of capability calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn missing_bucket(bucket: &BucketName) -> Error {
        Error::BucketNotFound(bucket.to_string())
    }
}

fn slice(data: &Bytes, range: Option<ByteRange>) -> Bytes {
    let Some(range) = range else {
        return data.clone();
    };
    let size = data.len() as u64;
    let len = range.len_within(size);
    if len == 0 {
        return Bytes::new();
    }
    let start = range.start as usize;
    data.slice(start..start + len as usize)
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn authorize(&self) -> Result<()> {
        self.record_call();
        Ok(())
    }

    async fn check_connection(&self) -> Result<()> {
        self.record_call();
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        self.record_call();
        let buckets = self.buckets.read().await;
        Ok(buckets.keys().map(BucketInfo::named).collect())
    }

    async fn bucket_exists(&self, bucket: &BucketName) -> Result<bool> {
        self.record_call();
        if self.hidden.contains(bucket.as_str()) {
            return Ok(false);
        }
        Ok(self.buckets.read().await.contains_key(bucket.as_str()))
    }

    async fn create_bucket(&self, bucket: &BucketName) -> Result<BucketInfo> {
        self.record_call();
        if self.rejected.contains(bucket.as_str()) {
            return Err(Error::Backend(format!(
                "Bucket {} cannot be created: quota exceeded",
                bucket
            )));
        }

        let mut buckets = self.buckets.write().await;
        if buckets.contains_key(bucket.as_str()) || self.hidden.contains(bucket.as_str()) {
            buckets.entry(bucket.to_string()).or_default();
            return Err(Error::AlreadyExists(bucket.to_string()));
        }
        buckets.insert(bucket.to_string(), BTreeMap::new());

        Ok(BucketInfo {
            created: Some(Utc::now()),
            ..BucketInfo::named(bucket.as_str())
        })
    }

    async fn delete_bucket(&self, bucket: &BucketName) -> Result<()> {
        self.record_call();
        let mut buckets = self.buckets.write().await;
        match buckets.get(bucket.as_str()) {
            None => Err(Self::missing_bucket(bucket)),
            Some(objects) if !objects.is_empty() => Err(Error::Backend(format!(
                "Bucket {} is not empty",
                bucket
            ))),
            Some(_) => {
                buckets.remove(bucket.as_str());
                Ok(())
            }
        }
    }

    async fn list_objects(
        &self,
        bucket: &BucketName,
        continuation: Option<&str>,
        max: usize,
    ) -> Result<ObjectPage> {
        self.record_call();
        let buckets = self.buckets.read().await;
        let objects = buckets
            .get(bucket.as_str())
            .ok_or_else(|| Self::missing_bucket(bucket))?;

        let lower = match continuation {
            Some(after) => Bound::Excluded(after.to_string()),
            None => Bound::Unbounded,
        };
        let mut remaining = objects.range((lower, Bound::Unbounded));
        let page: Vec<ObjectMeta> = remaining
            .by_ref()
            .take(max)
            .map(|(_, o)| o.meta.clone())
            .collect();

        let next = match (remaining.next(), page.last()) {
            (Some(_), Some(last)) => Some(last.key.clone()),
            _ => None,
        };

        Ok(ObjectPage {
            objects: page,
            next,
        })
    }

    async fn head_object(&self, bucket: &BucketName, key: &str) -> Result<ObjectMeta> {
        self.record_call();
        let buckets = self.buckets.read().await;
        buckets
            .get(bucket.as_str())
            .and_then(|objects| objects.get(key))
            .map(|o| o.meta.clone())
            .ok_or_else(|| Error::object_not_found(bucket.as_str(), key))
    }

    async fn put_object(
        &self,
        bucket: &BucketName,
        key: &str,
        body: ObjectBody,
    ) -> Result<ObjectMeta> {
        self.record_call();
        let data = body.collect().await?;

        let meta = ObjectMeta {
            uploaded: Some(Utc::now()),
            ..ObjectMeta::sized(key, data.len() as u64)
        };

        let mut buckets = self.buckets.write().await;
        let objects = buckets
            .get_mut(bucket.as_str())
            .ok_or_else(|| Self::missing_bucket(bucket))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                meta: meta.clone(),
            },
        );

        Ok(meta)
    }

    async fn get_object(
        &self,
        bucket: &BucketName,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream> {
        self.record_call();
        let buckets = self.buckets.read().await;
        let object = buckets
            .get(bucket.as_str())
            .and_then(|objects| objects.get(key))
            .ok_or_else(|| Error::object_not_found(bucket.as_str(), key))?;

        let data = slice(&object.data, range);
        Ok(Box::pin(stream::once(async move { Ok(data) })))
    }

    async fn delete_object(&self, bucket: &BucketName, key: &str) -> Result<()> {
        self.record_call();
        let mut buckets = self.buckets.write().await;
        buckets
            .get_mut(bucket.as_str())
            .and_then(|objects| objects.remove(key))
            .map(|_| ())
            .ok_or_else(|| Error::object_not_found(bucket.as_str(), key))
    }
}
