//! Canonical error shape returned to clients regardless of provider dialect.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};

/// `{"message", "type", "param", "code"}` as OpenAI clients expect it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// An error with the HTTP status it should surface as.
///
/// `local` is set for errors raised by the gateway itself (translation,
/// ledger, configuration); only non-local errors are attributed to a channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} (status {}, type {})", .body.message, .status, .body.error_type)]
pub struct RelayError {
    pub body: ErrorBody,
    pub status: u16,
    pub local: bool,
}

impl RelayError {
    pub fn new(status: u16, error_type: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            body: ErrorBody {
                message: message.into(),
                error_type: error_type.to_string(),
                param: None,
                code: Some(code.to_string()),
            },
            status,
            local: false,
        }
    }

    /// Gateway-side failure wrapped in the canonical shape.
    pub fn local(err: impl std::fmt::Display, code: &str, status: u16) -> Self {
        let mut e = Self::new(status, "relay_error", code, err.to_string());
        e.local = true;
        e
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        let mut e = Self::new(400, "invalid_request_error", "invalid_request", message);
        e.local = true;
        e
    }

    /// Network failure or timeout talking to the upstream.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::new(502, "upstream_error", "do_request_failed", err.to_string())
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.body.param = Some(param.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.body.message
    }

    pub fn error_type(&self) -> &str {
        &self.body.error_type
    }

    pub fn code(&self) -> Option<&str> {
        self.body.code.as_deref()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.body })
    }
}

impl ResponseError for RelayError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_openai_error_envelope() {
        let err = RelayError::new(429, "rate_limit_error", "rate_limited", "slow down")
            .with_param("429");
        let v = err.to_json();
        assert_eq!(v["error"]["message"], "slow down");
        assert_eq!(v["error"]["type"], "rate_limit_error");
        assert_eq!(v["error"]["param"], "429");
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn local_errors_are_flagged() {
        let err = RelayError::local("bad json", "convert_request_failed", 400);
        assert!(err.local);
        assert!(!RelayError::transport("connection reset").local);
    }
}
