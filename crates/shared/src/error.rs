use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Conflict,
    RateLimited,
    Internal,
}

/// Error body returned by the message store when it rejects a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Rejections a retry of the same request could plausibly get past.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, ErrorCode::RateLimited | ErrorCode::Internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_snake_case_error_body() {
        let err: ApiError =
            serde_json::from_str(r#"{"code":"rate_limited","message":"slow down"}"#)
                .expect("decode");
        assert_eq!(err.code, ErrorCode::RateLimited);
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "RateLimited: slow down");
    }

    #[test]
    fn forbidden_is_not_transient() {
        assert!(!ApiError::new(ErrorCode::Forbidden, "not a participant").is_transient());
    }
}
