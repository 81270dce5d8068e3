//! Backblaze B2 object store.

use async_trait::async_trait;
use chrono::DateTime;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use omnistore_common::{BucketName, ByteRange, Error, Result};

use super::client::{B2Bucket, B2Client, B2File};
use crate::config::B2Config;
use crate::store::{
    http_client, BucketInfo, ByteStream, ObjectBody, ObjectMeta, ObjectPage, ObjectStore,
};

impl From<B2Bucket> for BucketInfo {
    fn from(bucket: B2Bucket) -> Self {
        BucketInfo {
            name: bucket.bucket_name,
            id: Some(bucket.bucket_id),
            region: bucket.bucket_type,
            revision: bucket.revision,
            created: None,
        }
    }
}

impl From<B2File> for ObjectMeta {
    fn from(file: B2File) -> Self {
        ObjectMeta {
            uploaded: file.upload_timestamp.and_then(DateTime::from_timestamp_millis),
            key: file.file_name,
            size: file.content_length,
            content_hash: file.content_sha1,
            content_type: file.content_type,
        }
    }
}

/// Backblaze B2 object store.
///
/// Most B2 calls address buckets by id; ids are resolved by name once and
/// remembered.
pub struct B2Store {
    client: B2Client,
    bucket_ids: RwLock<HashMap<String, String>>,
}

impl B2Store {
    /// Create a store from a validated config.
    pub fn new(config: &B2Config) -> Result<Self> {
        Ok(Self {
            client: B2Client::new(
                http_client()?,
                config.application_key_id.clone(),
                config.application_key.clone(),
            ),
            bucket_ids: RwLock::new(HashMap::new()),
        })
    }

    async fn remember(&self, bucket: &B2Bucket) {
        self.bucket_ids
            .write()
            .await
            .insert(bucket.bucket_name.clone(), bucket.bucket_id.clone());
    }

    /// Resolve a bucket id, `None` if the account has no such bucket.
    async fn bucket_id(&self, bucket: &BucketName) -> Result<Option<String>> {
        if let Some(id) = self.bucket_ids.read().await.get(bucket.as_str()) {
            return Ok(Some(id.clone()));
        }

        let found = self
            .client
            .list_buckets(Some(bucket.as_str()))
            .await?
            .into_iter()
            .find(|b| b.bucket_name == bucket.as_str());

        match found {
            Some(b) => {
                self.remember(&b).await;
                Ok(Some(b.bucket_id))
            }
            None => Ok(None),
        }
    }

    async fn require_id(&self, bucket: &BucketName) -> Result<String> {
        self.bucket_id(bucket)
            .await?
            .ok_or_else(|| Error::BucketNotFound(bucket.to_string()))
    }
}

#[async_trait]
impl ObjectStore for B2Store {
    fn name(&self) -> &str {
        "b2"
    }

    async fn authorize(&self) -> Result<()> {
        self.client.authorize().await
    }

    async fn check_connection(&self) -> Result<()> {
        self.client.list_buckets(None).await?;
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        let buckets = self.client.list_buckets(None).await?;

        let mut ids = self.bucket_ids.write().await;
        ids.clear();
        ids.extend(
            buckets
                .iter()
                .map(|b| (b.bucket_name.clone(), b.bucket_id.clone())),
        );
        drop(ids);

        Ok(buckets.into_iter().map(BucketInfo::from).collect())
    }

    async fn bucket_exists(&self, bucket: &BucketName) -> Result<bool> {
        Ok(self.bucket_id(bucket).await?.is_some())
    }

    async fn create_bucket(&self, bucket: &BucketName) -> Result<BucketInfo> {
        match self.client.create_bucket(bucket.as_str()).await {
            Ok(created) => {
                self.remember(&created).await;
                Ok(created.into())
            }
            // Bucket names are global; only our own bucket counts as existing
            Err(Error::AlreadyExists(msg)) => match self.bucket_id(bucket).await? {
                Some(_) => Err(Error::AlreadyExists(msg)),
                None => Err(Error::Backend(format!(
                    "Bucket name {} is taken by another account",
                    bucket
                ))),
            },
            Err(e) => Err(e),
        }
    }

    async fn delete_bucket(&self, bucket: &BucketName) -> Result<()> {
        let id = self.require_id(bucket).await?;
        self.client.delete_bucket(&id, bucket.as_str()).await?;
        self.bucket_ids.write().await.remove(bucket.as_str());
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &BucketName,
        continuation: Option<&str>,
        max: usize,
    ) -> Result<ObjectPage> {
        let id = self.require_id(bucket).await?;
        let page = self.client.list_file_names(&id, continuation, max).await?;

        Ok(ObjectPage {
            objects: page
                .files
                .into_iter()
                .filter(B2File::is_upload)
                .map(ObjectMeta::from)
                .collect(),
            next: page.next_file_name,
        })
    }

    async fn head_object(&self, bucket: &BucketName, key: &str) -> Result<ObjectMeta> {
        let id = self.require_id(bucket).await?;
        let page = self.client.list_file_names(&id, Some(key), 1).await?;

        page.files
            .into_iter()
            .find(|f| f.file_name == key && f.is_upload())
            .map(ObjectMeta::from)
            .ok_or_else(|| Error::object_not_found(bucket.as_str(), key))
    }

    async fn put_object(
        &self,
        bucket: &BucketName,
        key: &str,
        body: ObjectBody,
    ) -> Result<ObjectMeta> {
        let id = self.require_id(bucket).await?;

        let file = match body.length {
            Some(length) => self.client.upload(&id, key, body.stream, length).await?,
            None => {
                debug!(key = %key, "buffering upload of unknown length");
                let data = body.collect().await?;
                self.client.upload_bytes(&id, key, data).await?
            }
        };

        Ok(file.into())
    }

    async fn get_object(
        &self,
        bucket: &BucketName,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream> {
        self.client.download(bucket.as_str(), key, range).await
    }

    async fn delete_object(&self, bucket: &BucketName, key: &str) -> Result<()> {
        let id = self.require_id(bucket).await?;
        let versions = self.client.list_versions(&id, key).await?;
        if versions.is_empty() {
            return Err(Error::object_not_found(bucket.as_str(), key));
        }

        for version in &versions {
            self.client.delete_file_version(version).await?;
        }
        debug!(key = %key, versions = versions.len(), "deleted file versions");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnistore_common::Secret;

    #[test]
    fn test_file_conversion() {
        let file = B2File {
            file_id: "4_z1".to_string(),
            file_name: "subdir/a.jpg".to_string(),
            content_length: 32201,
            content_sha1: Some("sha".to_string()),
            content_type: Some("image/jpeg".to_string()),
            upload_timestamp: Some(1_700_000_000_000),
            action: Some("upload".to_string()),
        };

        let meta = ObjectMeta::from(file);
        assert_eq!(meta.key, "subdir/a.jpg");
        assert_eq!(meta.size, 32201);
        assert_eq!(meta.uploaded.map(|d| d.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn test_bucket_conversion() {
        let info = BucketInfo::from(B2Bucket {
            bucket_id: "e73ede9c".to_string(),
            bucket_name: "photos".to_string(),
            bucket_type: Some("allPrivate".to_string()),
            revision: Some(2),
        });

        assert_eq!(info.name, "photos");
        assert_eq!(info.id.as_deref(), Some("e73ede9c"));
        assert_eq!(info.revision, Some(2));
    }

    #[tokio::test]
    async fn test_calls_before_authorize_fail() {
        let store = B2Store::new(&B2Config {
            application_key_id: "id".to_string(),
            application_key: Secret::new("key"),
            bucket_name: None,
        })
        .unwrap();

        assert!(matches!(
            store.bucket_exists(&BucketName::new("photos").unwrap()).await,
            Err(Error::NotInitialized)
        ));
    }
}
