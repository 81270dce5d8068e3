//! Amazon S3 object store, also used for S3-compatible services.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use s3::request::ResponseDataStream;
use s3::BucketConfiguration;
use tokio_util::io::StreamReader;
use tracing::debug;

use omnistore_common::{BucketName, ByteRange, Error, Result};

use crate::config::S3Config;
use crate::store::{BucketInfo, ByteStream, ObjectBody, ObjectMeta, ObjectPage, ObjectStore};

const HTTP_NOT_FOUND: u16 = 404;
const HTTP_CONFLICT: u16 = 409;
const HTTP_RANGE_NOT_SATISFIABLE: u16 = 416;

fn is_success(code: u16) -> bool {
    (200..300).contains(&code)
}

/// Map a rust-s3 failure onto the error taxonomy.
fn map_s3_error(context: &str, e: S3Error, not_found: impl FnOnce() -> Error) -> Error {
    match e {
        S3Error::HttpFailWithBody(HTTP_NOT_FOUND, _) => not_found(),
        S3Error::HttpFailWithBody(code, body) => status_error(context, code, &body, not_found),
        S3Error::Io(e) => Error::Transfer(format!("{}: {}", context, e)),
        other => Error::Backend(format!("{}: {}", context, other)),
    }
}

fn status_error(context: &str, code: u16, body: &str, not_found: impl FnOnce() -> Error) -> Error {
    match code {
        HTTP_NOT_FOUND => not_found(),
        HTTP_CONFLICT if body.contains("BucketAlreadyOwnedByYou") => {
            Error::AlreadyExists(body.to_string())
        }
        _ => Error::Backend(format!("{}: HTTP {} - {}", context, code, body)),
    }
}

/// Turn a streamed GET response into a [`ByteStream`].
fn body_stream(response: ResponseDataStream, not_found: impl FnOnce() -> Error) -> Result<ByteStream> {
    if !is_success(response.status_code) {
        return Err(status_error(
            "Failed to download object",
            response.status_code,
            "",
            not_found,
        ));
    }

    let stream = response
        .bytes
        .map(|chunk| chunk.map_err(|e| Error::Transfer(format!("Stream read error: {}", e))));
    Ok(Box::pin(stream))
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Amazon S3 object store.
pub struct S3Store {
    region: Region,
    credentials: Credentials,
    path_style: bool,
}

impl S3Store {
    /// Create a store from a validated config.
    ///
    /// A custom endpoint switches to path-style addressing.
    ///
    /// # Errors
    /// - The region or credentials are rejected by the client library
    pub fn new(config: &S3Config) -> Result<Self> {
        let region = match &config.endpoint {
            Some(endpoint) => Region::Custom {
                region: config.region().to_string(),
                endpoint: endpoint.clone(),
            },
            None => config
                .region()
                .parse()
                .map_err(|e| Error::Validation(format!("Invalid region \"{}\": {}", config.region(), e)))?,
        };

        let credentials = Credentials::new(
            Some(&config.access_key_id),
            Some(config.secret_access_key.expose()),
            None,
            None,
            None,
        )
        .map_err(|e| Error::Validation(format!("Invalid S3 credentials: {}", e)))?;

        Ok(Self {
            region,
            credentials,
            path_style: config.endpoint.is_some(),
        })
    }

    fn bucket(&self, bucket: &BucketName) -> Result<Box<Bucket>> {
        let handle = Bucket::new(bucket.as_str(), self.region.clone(), self.credentials.clone())
            .map_err(|e| Error::Backend(format!("Invalid bucket {}: {}", bucket, e)))?;
        Ok(if self.path_style {
            handle.with_path_style()
        } else {
            handle
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn name(&self) -> &str {
        "s3"
    }

    async fn authorize(&self) -> Result<()> {
        // Requests are signed individually; there is no session to open.
        debug!(region = %self.region, "S3 credentials ready");
        Ok(())
    }

    async fn check_connection(&self) -> Result<()> {
        Bucket::list_buckets(self.region.clone(), self.credentials.clone())
            .await
            .map_err(|e| map_s3_error("Failed to list buckets", e, || {
                Error::Backend("Service endpoint not found".to_string())
            }))?;
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        let response = Bucket::list_buckets(self.region.clone(), self.credentials.clone())
            .await
            .map_err(|e| map_s3_error("Failed to list buckets", e, || {
                Error::Backend("Service endpoint not found".to_string())
            }))?;

        Ok(response
            .bucket_names()
            .map(|name| BucketInfo {
                region: Some(self.region.to_string()),
                ..BucketInfo::named(name)
            })
            .collect())
    }

    async fn bucket_exists(&self, bucket: &BucketName) -> Result<bool> {
        self.bucket(bucket)?
            .exists()
            .await
            .map_err(|e| map_s3_error("Failed to check bucket", e, || {
                Error::BucketNotFound(bucket.to_string())
            }))
    }

    async fn create_bucket(&self, bucket: &BucketName) -> Result<BucketInfo> {
        let config = BucketConfiguration::default();
        let response = if self.path_style {
            Bucket::create_with_path_style(
                bucket.as_str(),
                self.region.clone(),
                self.credentials.clone(),
                config,
            )
            .await
        } else {
            Bucket::create(
                bucket.as_str(),
                self.region.clone(),
                self.credentials.clone(),
                config,
            )
            .await
        }
        .map_err(|e| map_s3_error("Failed to create bucket", e, || {
            Error::Backend(format!("Cannot create bucket {}", bucket))
        }))?;

        if !response.success() {
            return Err(status_error(
                "Failed to create bucket",
                response.response_code,
                &response.response_text,
                || Error::Backend(format!("Cannot create bucket {}", bucket)),
            ));
        }

        Ok(BucketInfo {
            region: Some(self.region.to_string()),
            created: Some(Utc::now()),
            ..BucketInfo::named(bucket.as_str())
        })
    }

    async fn delete_bucket(&self, bucket: &BucketName) -> Result<()> {
        let not_found = || Error::BucketNotFound(bucket.to_string());
        let code = self
            .bucket(bucket)?
            .delete()
            .await
            .map_err(|e| map_s3_error("Failed to delete bucket", e, not_found))?;

        if !is_success(code) {
            return Err(status_error("Failed to delete bucket", code, "", not_found));
        }
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &BucketName,
        continuation: Option<&str>,
        max: usize,
    ) -> Result<ObjectPage> {
        let not_found = || Error::BucketNotFound(bucket.to_string());
        let (result, code) = self
            .bucket(bucket)?
            .list_page(
                String::new(),
                None,
                continuation.map(String::from),
                None,
                Some(max),
            )
            .await
            .map_err(|e| map_s3_error("Failed to list objects", e, not_found))?;

        if !is_success(code) {
            return Err(status_error("Failed to list objects", code, "", not_found));
        }

        let objects = result
            .contents
            .into_iter()
            .map(|object| ObjectMeta {
                content_hash: object.e_tag,
                uploaded: parse_http_date(&object.last_modified),
                ..ObjectMeta::sized(object.key, object.size)
            })
            .collect();

        Ok(ObjectPage {
            objects,
            next: result.next_continuation_token,
        })
    }

    async fn head_object(&self, bucket: &BucketName, key: &str) -> Result<ObjectMeta> {
        let not_found = || Error::object_not_found(bucket.as_str(), key);
        let (head, code) = self
            .bucket(bucket)?
            .head_object(key)
            .await
            .map_err(|e| map_s3_error("Failed to stat object", e, not_found))?;

        if !is_success(code) {
            return Err(status_error("Failed to stat object", code, "", not_found));
        }

        let size = head.content_length.unwrap_or(0).max(0) as u64;
        Ok(ObjectMeta {
            content_hash: head.e_tag,
            content_type: head.content_type,
            uploaded: head.last_modified.as_deref().and_then(parse_http_date),
            ..ObjectMeta::sized(key, size)
        })
    }

    async fn put_object(
        &self,
        bucket: &BucketName,
        key: &str,
        body: ObjectBody,
    ) -> Result<ObjectMeta> {
        let not_found = || Error::BucketNotFound(bucket.to_string());
        let mut reader = StreamReader::new(
            body.stream
                .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))),
        );

        let response = self
            .bucket(bucket)?
            .put_object_stream(&mut reader, key)
            .await
            .map_err(|e| map_s3_error("Failed to upload object", e, not_found))?;

        if !is_success(response.status_code()) {
            return Err(status_error(
                "Failed to upload object",
                response.status_code(),
                "",
                not_found,
            ));
        }

        Ok(ObjectMeta {
            uploaded: Some(Utc::now()),
            ..ObjectMeta::sized(key, response.uploaded_bytes() as u64)
        })
    }

    async fn get_object(
        &self,
        bucket: &BucketName,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream> {
        let not_found = || Error::object_not_found(bucket.as_str(), key);
        let handle = self.bucket(bucket)?;

        let Some(range) = range else {
            let response = handle
                .get_object_stream(key)
                .await
                .map_err(|e| map_s3_error("Failed to download object", e, not_found))?;
            return body_stream(response, not_found);
        };

        // rust-s3 has no streaming variant of the ranged GET
        let response = handle
            .get_object_range(key, range.start, range.end)
            .await
            .map_err(|e| map_s3_error("Failed to download object", e, not_found))?;

        let code = response.status_code();
        if code == HTTP_RANGE_NOT_SATISFIABLE {
            return Ok(Box::pin(stream::empty()));
        }
        if !is_success(code) {
            return Err(status_error("Failed to download object", code, "", not_found));
        }

        let data: Bytes = response.bytes().clone();
        Ok(Box::pin(stream::once(async move { Ok(data) })))
    }

    async fn delete_object(&self, bucket: &BucketName, key: &str) -> Result<()> {
        let not_found = || Error::object_not_found(bucket.as_str(), key);
        let response = self
            .bucket(bucket)?
            .delete_object(key)
            .await
            .map_err(|e| map_s3_error("Failed to delete object", e, not_found))?;

        let code = response.status_code();
        if !is_success(code) {
            return Err(status_error("Failed to delete object", code, "", not_found));
        }
        Ok(())
    }
}
