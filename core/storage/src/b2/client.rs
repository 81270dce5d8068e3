//! Backblaze B2 native API client.

use bytes::Bytes;
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::{header, Body, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::info;

use omnistore_common::{ByteRange, Error, Result, Secret};

use crate::store::ByteStream;

/// Account authorization endpoint.
const B2_AUTHORIZE_URL: &str = "https://api.backblazeb2.com/b2api/v2/b2_authorize_account";
/// API version prefix for all other calls.
const B2_API_PATH: &str = "b2api/v2";

/// Largest page `b2_list_file_names` accepts.
pub const MAX_FILE_COUNT: usize = 10_000;

/// Characters escaped in `X-Bz-File-Name` and download URLs; `/` stays literal.
const FILE_NAME_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'?')
    .add(b'<')
    .add(b'>')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Encode a file name for headers and URLs.
pub fn encode_file_name(name: &str) -> String {
    utf8_percent_encode(name, FILE_NAME_ESCAPES).to_string()
}

/// Session returned by `b2_authorize_account`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub account_id: String,
    pub authorization_token: Secret,
    pub api_url: String,
    pub download_url: String,
}

/// Bucket resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct B2Bucket {
    pub bucket_id: String,
    pub bucket_name: String,
    #[serde(default)]
    pub bucket_type: Option<String>,
    #[serde(default)]
    pub revision: Option<u64>,
}

/// File version resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct B2File {
    pub file_id: String,
    pub file_name: String,
    #[serde(default)]
    pub content_length: u64,
    #[serde(default)]
    pub content_sha1: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub upload_timestamp: Option<i64>,
    /// "upload", "hide", "start" or "folder".
    #[serde(default)]
    pub action: Option<String>,
}

impl B2File {
    /// Whether this entry is a regular uploaded file.
    pub fn is_upload(&self) -> bool {
        self.action.as_deref().map_or(true, |a| a == "upload")
    }
}

#[derive(Debug, Deserialize)]
struct BucketList {
    buckets: Vec<B2Bucket>,
}

/// Page of `b2_list_file_names` or `b2_list_file_versions`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    pub files: Vec<B2File>,
    #[serde(default)]
    pub next_file_name: Option<String>,
    /// Only set by `b2_list_file_versions`.
    #[serde(default)]
    pub next_file_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadUrl {
    upload_url: String,
    authorization_token: Secret,
}

/// Error body every B2 call returns on failure.
#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Backblaze B2 API client.
pub struct B2Client {
    http: Client,
    key_id: String,
    key: Secret,
    session: RwLock<Option<Session>>,
}

impl B2Client {
    /// Create a client; nothing is sent until `authorize`.
    pub fn new(http: Client, key_id: String, key: Secret) -> Self {
        Self {
            http,
            key_id,
            key,
            session: RwLock::new(None),
        }
    }

    /// Run `b2_authorize_account` and keep the session.
    pub async fn authorize(&self) -> Result<()> {
        let response = self
            .http
            .get(B2_AUTHORIZE_URL)
            .basic_auth(&self.key_id, Some(self.key.expose()))
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Failed to authorize account: {}", e)))?;

        let session: Session = parse(
            check(response, || Error::Backend("Authorization endpoint not found".to_string()))
                .await?,
        )
        .await?;

        info!("Authorized B2 account {}", session.account_id);
        *self.session.write().await = Some(session);
        Ok(())
    }

    async fn session(&self) -> Result<Session> {
        self.session
            .read()
            .await
            .clone()
            .ok_or(Error::NotInitialized)
    }

    /// POST a JSON body to an API operation.
    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        body: serde_json::Value,
        not_found: impl FnOnce() -> Error,
    ) -> Result<T> {
        let session = self.session().await?;
        let url = format!("{}/{}/{}", session.api_url, B2_API_PATH, operation);

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, session.authorization_token.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("{} failed: {}", operation, e)))?;

        parse(check(response, not_found).await?).await
    }

    /// List buckets of the account, optionally filtered by name.
    pub async fn list_buckets(&self, name: Option<&str>) -> Result<Vec<B2Bucket>> {
        let session = self.session().await?;
        let mut body = json!({ "accountId": session.account_id });
        if let Some(name) = name {
            body["bucketName"] = json!(name);
        }

        let list: BucketList = self
            .call("b2_list_buckets", body, || {
                Error::Backend("Account not found".to_string())
            })
            .await?;
        Ok(list.buckets)
    }

    /// Create a private bucket.
    pub async fn create_bucket(&self, name: &str) -> Result<B2Bucket> {
        let session = self.session().await?;
        self.call(
            "b2_create_bucket",
            json!({
                "accountId": session.account_id,
                "bucketName": name,
                "bucketType": "allPrivate",
            }),
            || Error::Backend("Account not found".to_string()),
        )
        .await
    }

    /// Delete an empty bucket.
    pub async fn delete_bucket(&self, bucket_id: &str, name: &str) -> Result<()> {
        let session = self.session().await?;
        let _: B2Bucket = self
            .call(
                "b2_delete_bucket",
                json!({ "accountId": session.account_id, "bucketId": bucket_id }),
                || Error::BucketNotFound(name.to_string()),
            )
            .await?;
        Ok(())
    }

    /// List file names starting at `start` (inclusive).
    pub async fn list_file_names(
        &self,
        bucket_id: &str,
        start: Option<&str>,
        max: usize,
    ) -> Result<FileList> {
        let mut body = json!({
            "bucketId": bucket_id,
            "maxFileCount": max.clamp(1, MAX_FILE_COUNT),
        });
        if let Some(start) = start {
            body["startFileName"] = json!(start);
        }

        self.call("b2_list_file_names", body, || {
            Error::BucketNotFound(bucket_id.to_string())
        })
        .await
    }

    /// List every version of `name`.
    pub async fn list_versions(&self, bucket_id: &str, name: &str) -> Result<Vec<B2File>> {
        let mut versions = Vec::new();
        let mut start_id: Option<String> = None;

        loop {
            let mut body = json!({
                "bucketId": bucket_id,
                "startFileName": name,
                "maxFileCount": 100,
            });
            if let Some(id) = &start_id {
                body["startFileId"] = json!(id);
            }

            let page: FileList = self
                .call("b2_list_file_versions", body, || {
                    Error::BucketNotFound(bucket_id.to_string())
                })
                .await?;

            let exhausted = page.files.iter().any(|f| f.file_name != name);
            versions.extend(page.files.into_iter().filter(|f| f.file_name == name));

            match (page.next_file_name, page.next_file_id) {
                (Some(next), Some(id)) if !exhausted && next == name => start_id = Some(id),
                _ => break,
            }
        }

        Ok(versions)
    }

    /// Delete one file version.
    pub async fn delete_file_version(&self, file: &B2File) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "b2_delete_file_version",
                json!({ "fileName": file.file_name, "fileId": file.file_id }),
                || Error::object_not_found("", file.file_name.as_str()),
            )
            .await?;
        Ok(())
    }

    /// Upload a file; B2 requires the length before the first byte.
    pub async fn upload(
        &self,
        bucket_id: &str,
        name: &str,
        stream: ByteStream,
        length: u64,
    ) -> Result<B2File> {
        let target: UploadUrl = self
            .call("b2_get_upload_url", json!({ "bucketId": bucket_id }), || {
                Error::BucketNotFound(bucket_id.to_string())
            })
            .await?;

        let response = self
            .http
            .post(&target.upload_url)
            .header(header::AUTHORIZATION, target.authorization_token.expose())
            .header("X-Bz-File-Name", encode_file_name(name))
            .header(header::CONTENT_TYPE, "b2/x-auto")
            .header(header::CONTENT_LENGTH, length)
            .header("X-Bz-Content-Sha1", "do_not_verify")
            .body(Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|e| Error::Transfer(format!("Failed to upload {}: {}", name, e)))?;

        parse(check(response, || Error::BucketNotFound(bucket_id.to_string())).await?).await
    }

    /// Upload an in-memory buffer.
    pub async fn upload_bytes(&self, bucket_id: &str, name: &str, data: Bytes) -> Result<B2File> {
        let length = data.len() as u64;
        let stream: ByteStream = Box::pin(futures::stream::once(async move { Ok(data) }));
        self.upload(bucket_id, name, stream, length).await
    }

    /// Download a file by bucket and file name.
    pub async fn download(
        &self,
        bucket: &str,
        name: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream> {
        let session = self.session().await?;
        let url = format!(
            "{}/file/{}/{}",
            session.download_url,
            bucket,
            encode_file_name(name)
        );

        let mut request = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, session.authorization_token.expose());
        if let Some(range) = range {
            request = request.header(header::RANGE, range.to_header());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Failed to start download: {}", e)))?;

        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Box::pin(futures::stream::empty()));
        }
        let response = check(response, || Error::object_not_found(bucket, name)).await?;

        let stream = response
            .bytes_stream()
            .map(|result| result.map_err(|e| Error::Transfer(format!("Stream read error: {}", e))));
        Ok(Box::pin(stream))
    }
}

/// Map B2 error bodies onto the error taxonomy.
async fn check(response: Response, not_found: impl FnOnce() -> Error) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let raw = response.text().await.unwrap_or_default();
    let api: ApiError = serde_json::from_str(&raw).unwrap_or(ApiError {
        code: String::new(),
        message: raw,
    });

    Err(match (status, api.code.as_str()) {
        (StatusCode::NOT_FOUND, _) | (_, "not_found") | (_, "no_such_file") => not_found(),
        (_, "bad_bucket_id") => not_found(),
        (_, "duplicate_bucket_name") => Error::AlreadyExists(api.message),
        (StatusCode::UNAUTHORIZED, code) => {
            Error::Backend(format!("Unauthorized ({}): {}", code, api.message))
        }
        (_, code) => Error::Backend(format!("B2 error {} ({}): {}", status, code, api.message)),
    })
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| Error::Backend(format!("Failed to parse response: {}", e)))
}
