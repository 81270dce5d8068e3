//! Errors-as-data envelope for API layers.
//!
//! A presentation layer branches on the presence of `error` instead of
//! catching faults that crossed the wire.

use serde::{Deserialize, Serialize};

use omnistore_common::{Error, Result};

/// Error payload of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Stable tag, see [`Error::kind`].
    pub kind: String,
    pub message: String,
}

impl From<&Error> for ApiError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Response wrapper: `{"data": ...}` on success, `{"error": {...}}` on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiResponse<T> {
    Data(T),
    Error(ApiError),
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        ApiResponse::Data(data)
    }

    pub fn failure(err: &Error) -> Self {
        ApiResponse::Error(err.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ApiResponse::Error(_))
    }

    /// Get the payload of a successful call.
    pub fn data(&self) -> Option<&T> {
        match self {
            ApiResponse::Data(data) => Some(data),
            ApiResponse::Error(_) => None,
        }
    }

    /// Get the error of a failed call.
    pub fn error(&self) -> Option<&ApiError> {
        match self {
            ApiResponse::Data(_) => None,
            ApiResponse::Error(err) => Some(err),
        }
    }
}

impl<T> From<Result<T>> for ApiResponse<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => ApiResponse::success(data),
            Err(err) => ApiResponse::failure(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_shape() {
        let response = ApiResponse::from(Ok(vec!["photos".to_string()]));
        assert!(!response.is_error());
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "data": ["photos"] })
        );
    }

    #[test]
    fn test_error_shape() {
        let response: ApiResponse<()> = Err(Error::NoBucketSelected).into();
        assert!(response.is_error());
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "error": {
                    "kind": "no_bucket_selected",
                    "message": "No bucket selected; select a bucket first"
                }
            })
        );
    }

    #[test]
    fn test_unit_success_round_trip() {
        let response: ApiResponse<()> = Ok(()).into();
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#"{"data":null}"#);
        let parsed: ApiResponse<()> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, response);
    }
}
