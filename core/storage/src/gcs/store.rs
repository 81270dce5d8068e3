//! Google Cloud Storage object store.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

use omnistore_common::{BucketName, ByteRange, Error, Result};

use super::auth::{ServiceAccountKey, TokenManager};
use super::client::GcsClient;
use crate::config::GcsConfig;
use crate::store::{
    http_client, BucketInfo, ByteStream, ObjectBody, ObjectMeta, ObjectPage, ObjectStore,
};

/// Google Cloud Storage object store.
///
/// The key file is read on `authorize`; nothing touches the network before.
pub struct GcsStore {
    config: GcsConfig,
    http: Client,
    client: OnceCell<GcsClient>,
}

impl GcsStore {
    /// Create a store from a validated config.
    pub fn new(config: GcsConfig) -> Result<Self> {
        Ok(Self {
            config,
            http: http_client()?,
            client: OnceCell::new(),
        })
    }

    fn client(&self) -> Result<&GcsClient> {
        self.client.get().ok_or(Error::NotInitialized)
    }

    async fn connect(&self) -> Result<GcsClient> {
        let key = ServiceAccountKey::load(&self.config.key_filename).await?;
        let tokens = Arc::new(TokenManager::new(key, self.http.clone()));

        // Fail fast on bad credentials
        tokens.get_access_token().await?;

        Ok(GcsClient::new(
            self.http.clone(),
            self.config.project_id.clone(),
            tokens,
        ))
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    fn name(&self) -> &str {
        "gcs"
    }

    async fn authorize(&self) -> Result<()> {
        self.client.get_or_try_init(|| self.connect()).await?;
        Ok(())
    }

    async fn check_connection(&self) -> Result<()> {
        self.client()?.list_buckets(None).await?;
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        let client = self.client()?;
        let mut buckets = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = client.list_buckets(token.as_deref()).await?;
            buckets.extend(page.items.into_iter().map(BucketInfo::from));
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        Ok(buckets)
    }

    async fn bucket_exists(&self, bucket: &BucketName) -> Result<bool> {
        Ok(self.client()?.get_bucket(bucket.as_str()).await?.is_some())
    }

    async fn create_bucket(&self, bucket: &BucketName) -> Result<BucketInfo> {
        let created = self.client()?.insert_bucket(bucket.as_str()).await?;
        debug!(bucket = %bucket, project = %self.config.project_id, "created GCS bucket");
        Ok(created.into())
    }

    async fn delete_bucket(&self, bucket: &BucketName) -> Result<()> {
        self.client()?.delete_bucket(bucket.as_str()).await
    }

    async fn list_objects(
        &self,
        bucket: &BucketName,
        continuation: Option<&str>,
        max: usize,
    ) -> Result<ObjectPage> {
        let page = self
            .client()?
            .list_objects(bucket.as_str(), continuation, max)
            .await?;

        Ok(ObjectPage {
            objects: page.items.into_iter().map(ObjectMeta::from).collect(),
            next: page.next_page_token,
        })
    }

    async fn head_object(&self, bucket: &BucketName, key: &str) -> Result<ObjectMeta> {
        let object = self.client()?.get_object(bucket.as_str(), key).await?;
        Ok(object.into())
    }

    async fn put_object(
        &self,
        bucket: &BucketName,
        key: &str,
        body: ObjectBody,
    ) -> Result<ObjectMeta> {
        let object = self
            .client()?
            .upload(bucket.as_str(), key, body.stream, body.length)
            .await?;
        Ok(object.into())
    }

    async fn get_object(
        &self,
        bucket: &BucketName,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream> {
        self.client()?.download(bucket.as_str(), key, range).await
    }

    async fn delete_object(&self, bucket: &BucketName, key: &str) -> Result<()> {
        self.client()?.delete_object(bucket.as_str(), key).await
    }
}
