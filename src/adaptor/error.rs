//! Upstream error envelope parsing.
//!
//! Providers disagree on error shapes. Parsing is an ordered list of typed
//! parsers (the adaptor's own parser always runs first), then a generic
//! field sniffer, then a status-keyed default message.

use crate::error::RelayError;
use serde::Deserialize;
use serde_json::Value;

/// `{"type":"error","error":{"type","message"}}`
#[derive(Debug, Deserialize)]
struct AnthropicEnvelope {
    #[serde(rename = "type")]
    kind: String,
    error: AnthropicErrorBody,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

/// `{"error":{"code":403,"message","status":"PERMISSION_DENIED"}}`
#[derive(Debug, Deserialize)]
struct GeminiEnvelope {
    error: GeminiErrorBody,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorBody {
    code: i64,
    #[serde(default)]
    message: String,
    status: String,
}

/// `{"error":{"message","type","param","code"}}`
#[derive(Debug, Deserialize)]
struct OpenAiEnvelope {
    error: OpenAiErrorBody,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorBody {
    message: String,
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    #[serde(default)]
    param: Option<Value>,
    #[serde(default)]
    code: Option<Value>,
}

/// Bedrock / AWS JSON protocol: `{"message": "..."}` plus an `__type` or
/// `x-amzn-errortype` naming the exception.
#[derive(Debug, Deserialize)]
struct AwsEnvelope {
    #[serde(alias = "Message")]
    message: String,
    #[serde(rename = "__type", default)]
    error_type: Option<String>,
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub fn parse_anthropic(status: u16, body: &Value) -> Option<RelayError> {
    let env: AnthropicEnvelope = serde_json::from_value(body.clone()).ok()?;
    if env.kind != "error" || env.error.message.is_empty() {
        return None;
    }
    Some(RelayError::new(
        status,
        &env.error.error_type,
        &env.error.error_type,
        env.error.message,
    ))
}

pub fn parse_gemini(status: u16, body: &Value) -> Option<RelayError> {
    let env: GeminiEnvelope = serde_json::from_value(body.clone()).ok()?;
    if env.error.message.is_empty() {
        return None;
    }
    Some(RelayError::new(
        status,
        &env.error.status,
        &env.error.code.to_string(),
        env.error.message,
    ))
}

pub fn parse_openai(status: u16, body: &Value) -> Option<RelayError> {
    let env: OpenAiEnvelope = serde_json::from_value(body.clone()).ok()?;
    if env.error.message.is_empty() {
        return None;
    }
    let mut err = RelayError::new(
        status,
        env.error.error_type.as_deref().unwrap_or("upstream_error"),
        "",
        env.error.message,
    );
    err.body.code = env.error.code.as_ref().and_then(value_to_string);
    err.body.param = env.error.param.as_ref().and_then(value_to_string);
    Some(err)
}

pub fn parse_aws(status: u16, body: &Value) -> Option<RelayError> {
    let env: AwsEnvelope = serde_json::from_value(body.clone()).ok()?;
    if env.message.is_empty() {
        return None;
    }
    // "com.amazon...#ThrottlingException" -> "ThrottlingException"
    let kind = env
        .error_type
        .as_deref()
        .map(|t| t.rsplit('#').next().unwrap_or(t).to_string())
        .unwrap_or_else(|| "upstream_error".to_string());
    Some(RelayError::new(status, &kind, &kind, env.message))
}

pub type EnvelopeParser = fn(u16, &Value) -> Option<RelayError>;

/// Typed parsers in priority order. Anthropic and Gemini come before OpenAI
/// because their envelopes would also satisfy the looser OpenAI shape.
const TYPED_PARSERS: [(&str, EnvelopeParser); 4] = [
    ("anthropic", parse_anthropic),
    ("gemini", parse_gemini),
    ("openai", parse_openai),
    ("aws", parse_aws),
];

/// Look for a human readable message under the field names providers use.
pub fn generic_message(body: &Value) -> Option<String> {
    let paths: [&[&str]; 7] = [
        &["error", "message"],
        &["message"],
        &["msg"],
        &["err"],
        &["error_msg"],
        &["header", "message"],
        &["response", "error", "message"],
    ];
    for path in paths {
        let mut cur = body;
        let mut found = true;
        for key in path {
            match cur.get(*key) {
                Some(next) => cur = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            if let Some(s) = cur.as_str().filter(|s| !s.is_empty()) {
                return Some(s.to_string());
            }
        }
    }
    // A bare string under "error" is common with small self-hosted servers.
    body.get("error")
        .and_then(|e| e.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

pub fn status_default_message(status: u16) -> &'static str {
    match status {
        504 => "upstream gateway timed out, please retry later",
        502 => "upstream returned a bad gateway response",
        503 => "upstream service is temporarily unavailable",
        429 => "upstream rate limit reached, please slow down",
        401 => "upstream rejected the credentials (invalid or expired API key)",
        403 => "upstream denied access to this resource",
        404 => "upstream resource or model not found",
        _ => "upstream returned an unexpected error",
    }
}

/// Normalize a failed upstream response into the canonical error.
///
/// `native` is the adaptor's own parser and takes priority.
pub fn relay_error_from_body(
    status: u16,
    body: &[u8],
    native: Option<EnvelopeParser>,
) -> RelayError {
    let fallback = |message: String| {
        RelayError::new(status, "upstream_error", "bad_response_status_code", message)
            .with_param(status.to_string())
    };

    let parsed: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return fallback(status_default_message(status).to_string()),
    };

    if let Some(parser) = native {
        if let Some(err) = parser(status, &parsed) {
            return err;
        }
    }
    for (name, parser) in TYPED_PARSERS {
        if let Some(err) = parser(status, &parsed) {
            tracing::debug!(parser = name, status, "matched upstream error envelope");
            return err;
        }
    }
    match generic_message(&parsed) {
        Some(msg) => fallback(msg),
        None => fallback(status_default_message(status).to_string()),
    }
}

/// A 2xx body that nevertheless carries an error envelope.
pub fn embedded_error(body: &Value, native: Option<EnvelopeParser>) -> Option<RelayError> {
    let looks_like_error = body.get("type").and_then(|t| t.as_str()) == Some("error")
        || body.get("error").map(|e| e.is_object()).unwrap_or(false);
    if !looks_like_error {
        return None;
    }
    let status = 500;
    native
        .and_then(|p| p(status, body))
        .or_else(|| TYPED_PARSERS.iter().find_map(|(_, p)| p(status, body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn anthropic_envelope_maps_type_to_code() {
        let body = json!({"type": "error", "error": {"type": "authentication_error", "message": "invalid x-api-key"}});
        let err = relay_error_from_body(401, body.to_string().as_bytes(), None);
        assert_eq!(err.error_type(), "authentication_error");
        assert_eq!(err.code(), Some("authentication_error"));
        assert_eq!(err.message(), "invalid x-api-key");
        assert_eq!(err.status, 401);
    }

    #[test]
    fn gemini_envelope_wins_over_openai_shape() {
        let body = json!({"error": {"code": 403, "message": "API key not valid", "status": "PERMISSION_DENIED"}});
        let err = relay_error_from_body(403, body.to_string().as_bytes(), None);
        assert_eq!(err.error_type(), "PERMISSION_DENIED");
        assert_eq!(err.code(), Some("403"));
    }

    #[test]
    fn openai_envelope_keeps_code_and_param() {
        let body = json!({"error": {"message": "quota", "type": "insufficient_quota", "code": "insufficient_quota", "param": null}});
        let err = relay_error_from_body(429, body.to_string().as_bytes(), None);
        assert_eq!(err.error_type(), "insufficient_quota");
        assert_eq!(err.code(), Some("insufficient_quota"));
        assert_eq!(err.body.param, None);
    }

    #[test]
    fn native_parser_takes_priority() {
        let body = json!({"error": {"message": "m", "type": "t"}});
        fn custom(status: u16, _: &Value) -> Option<RelayError> {
            Some(RelayError::new(status, "custom", "custom", "from adaptor"))
        }
        let err = relay_error_from_body(400, body.to_string().as_bytes(), Some(custom));
        assert_eq!(err.message(), "from adaptor");
    }

    #[test]
    fn generic_fields_are_sniffed_in_order() {
        assert_eq!(generic_message(&json!({"msg": "a", "err": "b"})), Some("a".into()));
        assert_eq!(generic_message(&json!({"error_msg": "c"})), Some("c".into()));
        assert_eq!(
            generic_message(&json!({"response": {"error": {"message": "deep"}}})),
            Some("deep".into())
        );
        assert_eq!(generic_message(&json!({"error": "plain"})), Some("plain".into()));
        assert_eq!(generic_message(&json!({"other": 1})), None);
    }

    #[test]
    fn unknown_shapes_fall_back_to_status_message() {
        let err = relay_error_from_body(504, b"<html>timeout</html>", None);
        assert_eq!(err.message(), status_default_message(504));
        assert_eq!(err.error_type(), "upstream_error");
        assert_eq!(err.code(), Some("bad_response_status_code"));
        assert_eq!(err.body.param.as_deref(), Some("504"));

        let err = relay_error_from_body(429, b"{\"x\":1}", None);
        assert!(err.message().contains("rate limit"));
    }

    #[test]
    fn aws_exception_name_is_shortened() {
        let body = json!({"message": "Too many requests", "__type": "com.amazon.coral#ThrottlingException"});
        let err = relay_error_from_body(429, body.to_string().as_bytes(), None);
        assert_eq!(err.error_type(), "ThrottlingException");
    }

    #[test]
    fn embedded_errors_are_detected_in_success_bodies() {
        let body = json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}});
        assert_eq!(embedded_error(&body, None).unwrap().error_type(), "overloaded_error");
        assert!(embedded_error(&json!({"id": "x", "choices": []}), None).is_none());
    }
}
