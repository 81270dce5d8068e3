//! Google Cloud Storage JSON API client.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{header, Body, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use omnistore_common::{ByteRange, Error, Result};

use super::auth::TokenManager;
use crate::store::{BucketInfo, ByteStream, ObjectMeta};

/// JSON API base URL.
const STORAGE_API_BASE: &str = "https://storage.googleapis.com/storage/v1";
/// Media upload base URL.
const STORAGE_UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";

/// Bucket resource from the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsBucket {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// Int64 values arrive as strings.
    #[serde(default)]
    pub metageneration: Option<String>,
    #[serde(default)]
    pub time_created: Option<DateTime<Utc>>,
}

impl From<GcsBucket> for BucketInfo {
    fn from(bucket: GcsBucket) -> Self {
        BucketInfo {
            revision: bucket.metageneration.and_then(|m| m.parse().ok()),
            created: bucket.time_created,
            id: bucket.id,
            region: bucket.location,
            name: bucket.name,
        }
    }
}

/// Object resource from the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsObject {
    pub name: String,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub md5_hash: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
}

impl GcsObject {
    /// Get size as u64.
    pub fn size_bytes(&self) -> u64 {
        self.size.as_ref().and_then(|s| s.parse().ok()).unwrap_or(0)
    }
}

impl From<GcsObject> for ObjectMeta {
    fn from(object: GcsObject) -> Self {
        ObjectMeta {
            size: object.size_bytes(),
            key: object.name,
            content_hash: object.md5_hash,
            content_type: object.content_type,
            uploaded: object.updated,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

fn encode_segment(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

/// Google Cloud Storage API client.
pub struct GcsClient {
    http: Client,
    project_id: String,
    token_manager: Arc<TokenManager>,
}

impl GcsClient {
    /// Create a new client.
    pub fn new(http: Client, project_id: String, token_manager: Arc<TokenManager>) -> Self {
        Self {
            http,
            project_id,
            token_manager,
        }
    }

    /// Get authorization header.
    async fn auth_header(&self) -> Result<String> {
        let token = self.token_manager.get_access_token().await?;
        Ok(format!("Bearer {}", token))
    }

    fn bucket_url(bucket: &str) -> String {
        format!("{}/b/{}", STORAGE_API_BASE, encode_segment(bucket))
    }

    fn object_url(bucket: &str, key: &str) -> String {
        format!("{}/o/{}", Self::bucket_url(bucket), encode_segment(key))
    }

    /// List one page of buckets in the project.
    pub async fn list_buckets(&self, page_token: Option<&str>) -> Result<ListResponse<GcsBucket>> {
        let url = format!("{}/b", STORAGE_API_BASE);
        let auth = self.auth_header().await?;

        let mut request = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("project", self.project_id.as_str())]);
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Failed to list buckets: {}", e)))?;

        let response = check(response, || Error::BucketNotFound(self.project_id.clone())).await?;
        parse(response).await
    }

    /// Get bucket metadata; `None` if the bucket does not exist.
    pub async fn get_bucket(&self, bucket: &str) -> Result<Option<GcsBucket>> {
        let auth = self.auth_header().await?;

        let response = self
            .http
            .get(Self::bucket_url(bucket))
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Failed to get bucket: {}", e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response, || Error::BucketNotFound(bucket.to_string())).await?;
        parse(response).await.map(Some)
    }

    /// Create a bucket in the project.
    pub async fn insert_bucket(&self, bucket: &str) -> Result<GcsBucket> {
        let url = format!("{}/b", STORAGE_API_BASE);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("project", self.project_id.as_str())])
            .json(&serde_json::json!({ "name": bucket }))
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Failed to create bucket: {}", e)))?;

        let response = check(response, || Error::BucketNotFound(bucket.to_string())).await?;
        parse(response).await
    }

    /// Delete an empty bucket.
    pub async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        let auth = self.auth_header().await?;

        let response = self
            .http
            .delete(Self::bucket_url(bucket))
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Failed to delete bucket: {}", e)))?;

        check(response, || Error::BucketNotFound(bucket.to_string())).await?;
        Ok(())
    }

    /// List one page of objects.
    pub async fn list_objects(
        &self,
        bucket: &str,
        page_token: Option<&str>,
        max_results: usize,
    ) -> Result<ListResponse<GcsObject>> {
        let auth = self.auth_header().await?;
        let max_results = max_results.to_string();

        let mut request = self
            .http
            .get(format!("{}/o", Self::bucket_url(bucket)))
            .header(header::AUTHORIZATION, auth)
            .query(&[("maxResults", max_results.as_str())]);
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Failed to list objects: {}", e)))?;

        let response = check(response, || Error::BucketNotFound(bucket.to_string())).await?;
        parse(response).await
    }

    /// Get object metadata.
    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<GcsObject> {
        let auth = self.auth_header().await?;

        let response = self
            .http
            .get(Self::object_url(bucket, key))
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Failed to get object: {}", e)))?;

        let response = check(response, || Error::object_not_found(bucket, key)).await?;
        parse(response).await
    }

    /// Upload an object with a simple media upload, streaming the body.
    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        stream: ByteStream,
        length: Option<u64>,
    ) -> Result<GcsObject> {
        let url = format!("{}/b/{}/o", STORAGE_UPLOAD_BASE, encode_segment(bucket));
        let auth = self.auth_header().await?;

        let mut request = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, auth)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .query(&[("uploadType", "media"), ("name", key)]);
        if let Some(length) = length {
            request = request.header(header::CONTENT_LENGTH, length);
        }

        let response = request
            .body(Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|e| Error::Transfer(format!("Failed to upload {}: {}", key, e)))?;

        let response = check(response, || Error::BucketNotFound(bucket.to_string())).await?;
        parse(response).await
    }

    /// Download object content as a stream.
    pub async fn download(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream> {
        let auth = self.auth_header().await?;

        let mut request = self
            .http
            .get(Self::object_url(bucket, key))
            .header(header::AUTHORIZATION, auth)
            .query(&[("alt", "media")]);
        if let Some(range) = range {
            request = request.header(header::RANGE, range.to_header());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Failed to start download: {}", e)))?;

        // A range starting past the end of the object yields no bytes
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Box::pin(futures::stream::empty()));
        }
        let response = check(response, || Error::object_not_found(bucket, key)).await?;

        let stream = response
            .bytes_stream()
            .map(|result| result.map_err(|e| Error::Transfer(format!("Stream read error: {}", e))));

        Ok(Box::pin(stream))
    }

    /// Delete an object.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let auth = self.auth_header().await?;

        let response = self
            .http
            .delete(Self::object_url(bucket, key))
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Failed to delete object: {}", e)))?;

        check(response, || Error::object_not_found(bucket, key)).await?;
        Ok(())
    }
}

/// Map non-success statuses onto the error taxonomy.
async fn check(response: Response, not_found: impl FnOnce() -> Error) -> Result<Response> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => not_found(),
        // "You already own this bucket. Please select another name."
        StatusCode::CONFLICT if body.contains("already own") => Error::AlreadyExists(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Backend(format!("Access denied: {} - {}", status, body))
        }
        _ => Error::Backend(format!("API error: {} - {}", status, body)),
    })
}

async fn parse<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| Error::Backend(format!("Failed to parse response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_encodes_key() {
        assert_eq!(
            GcsClient::object_url("photos", "subdir/a b.jpg"),
            "https://storage.googleapis.com/storage/v1/b/photos/o/subdir%2Fa%20b%2Ejpg"
        );
    }

    #[test]
    fn test_object_conversion() {
        let object: GcsObject = serde_json::from_str(
            r#"{"name": "subdir/a.jpg", "size": "32201", "md5Hash": "abc==", "contentType": "image/jpeg"}"#,
        )
        .unwrap();
        let meta = ObjectMeta::from(object);

        assert_eq!(meta.key, "subdir/a.jpg");
        assert_eq!(meta.size, 32201);
        assert_eq!(meta.content_hash.as_deref(), Some("abc=="));
    }

    #[test]
    fn test_bucket_conversion() {
        let bucket: GcsBucket = serde_json::from_str(
            r#"{"name": "photos", "id": "photos", "location": "EU", "metageneration": "3"}"#,
        )
        .unwrap();
        let info = BucketInfo::from(bucket);

        assert_eq!(info.name, "photos");
        assert_eq!(info.region.as_deref(), Some("EU"));
        assert_eq!(info.revision, Some(3));
    }

    #[test]
    fn test_empty_listing() {
        let listing: ListResponse<GcsObject> = serde_json::from_str(r#"{"kind": "storage#objects"}"#).unwrap();
        assert!(listing.items.is_empty());
        assert!(listing.next_page_token.is_none());
    }
}
