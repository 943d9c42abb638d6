use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorCode::Unauthorized,
            403 => ErrorCode::Forbidden,
            404 => ErrorCode::NotFound,
            400 | 409 | 422 => ErrorCode::Validation,
            429 => ErrorCode::RateLimited,
            _ => ErrorCode::Internal,
        }
    }
}

/// Error body returned by the REST collaborator, normalized from the
/// handful of shapes the gateway produces (`{message}`, `{error}`, plain text).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?} ({status}): {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub status: u16,
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::from_status(status),
            status,
            message: message.into(),
        }
    }

    pub fn from_body(status: u16, body: &str) -> Self {
        let trimmed = body.trim();
        let message = match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => ["message", "error", "detail"]
                .iter()
                .find_map(|key| match map.get(*key) {
                    Some(Value::String(text)) if !text.is_empty() => Some(text.clone()),
                    Some(Value::Object(inner)) => inner
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    _ => None,
                })
                .unwrap_or_else(|| trimmed.to_string()),
            Ok(Value::String(text)) => text,
            _ => trimmed.to_string(),
        };
        let message = if message.is_empty() {
            format!("request failed with status {status}")
        } else {
            message
        };
        Self::new(status, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_message_field_from_json_body() {
        let err = ApiError::from_body(400, r#"{"code":400,"status":"BAD_REQUEST","message":"content must not be blank"}"#);
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(err.message, "content must not be blank");
    }

    #[test]
    fn falls_back_to_error_field_then_raw_text() {
        let err = ApiError::from_body(500, r#"{"error":"boom"}"#);
        assert_eq!(err.message, "boom");

        let err = ApiError::from_body(502, "Bad Gateway");
        assert_eq!(err.message, "Bad Gateway");
        assert_eq!(err.code, ErrorCode::Internal);

        let err = ApiError::from_body(401, "");
        assert_eq!(err.code, ErrorCode::Unauthorized);
        assert_eq!(err.message, "request failed with status 401");
    }
}
