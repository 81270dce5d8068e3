//! Service account authentication and token management for Google Cloud Storage.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::info;

use omnistore_common::{Error, Result, Secret};

/// Default OAuth2 token endpoint.
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Scope granting bucket and object management.
const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.full_control";

/// Grant type of the JWT bearer flow.
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime requested for each assertion.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URL.to_string()
}

/// Service account key file, as downloaded from the cloud console.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: Secret,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl ServiceAccountKey {
    /// Read and parse a key file.
    ///
    /// # Errors
    /// - The file cannot be read
    /// - The file is not a service account key
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Validation(format!(
                "Cannot read key file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&raw)
    }

    /// Parse a key from its JSON form.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::Validation(format!("Invalid service account key: {}", e)))
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Access token with expiration tracking.
#[derive(Debug, Clone)]
pub struct Tokens {
    pub access_token: Secret,
    pub expires_at: DateTime<Utc>,
}

impl Tokens {
    /// Check if the access token is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        // Less than 5 minutes left counts as expired
        self.expires_at < Utc::now() + Duration::minutes(5)
    }
}

/// Sign a JWT assertion for the token endpoint.
pub fn sign_assertion(key: &ServiceAccountKey, now: DateTime<Utc>) -> Result<String> {
    let claims = Claims {
        iss: &key.client_email,
        scope: STORAGE_SCOPE,
        aud: &key.token_uri,
        iat: now.timestamp(),
        exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
    };

    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.expose().as_bytes())
        .map_err(|e| Error::Validation(format!("Invalid service account private key: {}", e)))?;

    encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
        .map_err(|e| Error::Backend(format!("Failed to sign token request: {}", e)))
}

/// Token manager that exchanges fresh assertions when the token expires.
pub struct TokenManager {
    key: ServiceAccountKey,
    http: Client,
    tokens: RwLock<Option<Tokens>>,
}

impl TokenManager {
    /// Create a token manager; no token is fetched until first use.
    pub fn new(key: ServiceAccountKey, http: Client) -> Self {
        Self {
            key,
            http,
            tokens: RwLock::new(None),
        }
    }

    /// Get the service account key.
    pub fn key(&self) -> &ServiceAccountKey {
        &self.key
    }

    /// Get a valid access token, exchanging a new assertion if necessary.
    ///
    /// # Errors
    /// - Token exchange failed
    pub async fn get_access_token(&self) -> Result<String> {
        {
            let tokens = self.tokens.read().await;
            if let Some(tokens) = tokens.as_ref().filter(|t| !t.is_expired()) {
                return Ok(tokens.access_token.expose().to_string());
            }
        }

        let mut tokens = self.tokens.write().await;

        // Another task may have refreshed while we waited
        if let Some(current) = tokens.as_ref().filter(|t| !t.is_expired()) {
            return Ok(current.access_token.expose().to_string());
        }

        info!("Requesting access token for {}", self.key.client_email);
        let fresh = self.fetch_token().await?;
        let access_token = fresh.access_token.expose().to_string();
        *tokens = Some(fresh);

        Ok(access_token)
    }

    async fn fetch_token(&self) -> Result<Tokens> {
        let now = Utc::now();
        let assertion = sign_assertion(&self.key, now)?;

        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Backend(format!(
                "Token exchange failed: {} - {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Backend(format!("Failed to parse token response: {}", e)))?;

        Ok(Tokens {
            access_token: Secret::new(token.access_token),
            expires_at: now + Duration::seconds(token.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_expiration() {
        let expired = Tokens {
            access_token: Secret::new("test"),
            expires_at: Utc::now() - Duration::hours(1),
        };
        assert!(expired.is_expired());

        let valid = Tokens {
            access_token: Secret::new("test"),
            expires_at: Utc::now() + Duration::hours(1),
        };
        assert!(!valid.is_expired());
    }

    #[test]
    fn test_tokens_near_expiration() {
        let tokens = Tokens {
            access_token: Secret::new("test"),
            expires_at: Utc::now() + Duration::minutes(4),
        };
        assert!(tokens.is_expired());
    }

    #[test]
    fn test_key_parsing_defaults_token_uri() {
        let key = ServiceAccountKey::from_json(
            r#"{"client_email": "svc@project.iam.gserviceaccount.com", "private_key": "pem"}"#,
        )
        .unwrap();

        assert_eq!(key.token_uri, GOOGLE_TOKEN_URL);
        assert_eq!(key.project_id, None);
        assert!(!format!("{:?}", key).contains("pem"));
    }

    #[test]
    fn test_key_parsing_rejects_garbage() {
        assert!(matches!(
            ServiceAccountKey::from_json("{}"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_sign_rejects_invalid_pem() {
        let key = ServiceAccountKey::from_json(
            r#"{"client_email": "svc@p.iam.gserviceaccount.com", "private_key": "not a key"}"#,
        )
        .unwrap();
        assert!(matches!(
            sign_assertion(&key, Utc::now()),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_load_missing_key_file() {
        let err = ServiceAccountKey::load(Path::new("/nonexistent/key.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
