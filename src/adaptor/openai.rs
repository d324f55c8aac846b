//! OpenAI and OpenAI-compatible upstreams (vLLM, Ollama, hosted proxies).
//!
//! The canonical schema is this dialect, so conversion is mostly pass-through:
//! the mapped model name is substituted and streaming requests always ask for
//! a trailing usage chunk so metering does not have to estimate.

use super::{Adaptor, AdaptorError, RelayMeta, Result};
use crate::models::chat::{
    ChatCompletionRequest, ChatCompletionResponse, ChatStreamChoice, ChatUsage,
};
use crate::stream::{DialectError, RecordOutcome, StreamAccumulator, StreamDialect, StreamRecord};
use http::header::{HeaderMap, AUTHORIZATION};
use serde::Deserialize;
use serde_json::{json, Value};

const MODELS: &[&str] = &[
    "gpt-3.5-turbo",
    "gpt-4",
    "gpt-4-turbo",
    "gpt-4o",
    "gpt-4o-mini",
    "gpt-4.1",
    "gpt-4.1-mini",
    "o3-mini",
];

pub struct OpenAiAdaptor {
    http: reqwest::Client,
}

impl OpenAiAdaptor {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

/// `{base}/v1/chat/completions` without doubling a `/v1` already in the base.
pub fn chat_completions_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{}/chat/completions", base)
    } else {
        format!("{}/v1/chat/completions", base)
    }
}

#[async_trait::async_trait]
impl Adaptor for OpenAiAdaptor {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<String> {
        Ok(chat_completions_url(&meta.base_url))
    }

    fn setup_headers(
        &self,
        headers: &mut HeaderMap,
        _client: &HeaderMap,
        meta: &RelayMeta,
    ) -> Result<()> {
        if !meta.api_key.is_empty() {
            headers.insert(
                AUTHORIZATION,
                super::header_value(&format!("Bearer {}", meta.api_key))?,
            );
        }
        Ok(())
    }

    async fn convert_request(
        &self,
        req: &ChatCompletionRequest,
        meta: &RelayMeta,
    ) -> Result<Value> {
        let mut body =
            serde_json::to_value(req).map_err(|e| AdaptorError::Convert(e.to_string()))?;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".into(), Value::String(meta.actual_model.clone()));
            if req.stream {
                obj.insert("stream_options".into(), json!({"include_usage": true}));
            }
        }
        Ok(body)
    }

    fn convert_response(
        &self,
        _meta: &RelayMeta,
        body: &[u8],
    ) -> Result<(ChatCompletionResponse, ChatUsage)> {
        let resp: ChatCompletionResponse =
            serde_json::from_slice(body).map_err(|e| AdaptorError::Decode(e.to_string()))?;
        let usage = resp.usage.clone().unwrap_or_default();
        Ok((resp, usage))
    }

    fn stream_dialect(&self, _meta: &RelayMeta) -> Box<dyn StreamDialect> {
        Box::new(OpenAiDialect)
    }

    fn error_parser(&self) -> Option<super::error::EnvelopeParser> {
        Some(super::error::parse_openai)
    }

    fn models(&self) -> Vec<String> {
        MODELS.iter().map(|m| m.to_string()).collect()
    }
}

/// A chunk as compatible servers actually send it; several omit `object`
/// or `created`.
#[derive(Debug, Deserialize)]
struct LooseChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

/// Canonical chunks; records are forwarded after identity/usage bookkeeping.
#[derive(Debug, Default)]
pub struct OpenAiDialect;

impl StreamDialect for OpenAiDialect {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn on_record(
        &mut self,
        record: &StreamRecord,
        acc: &mut StreamAccumulator,
    ) -> std::result::Result<RecordOutcome, DialectError> {
        let data = record.data.trim();
        if data == "[DONE]" {
            return Ok(RecordOutcome::Done);
        }
        if data.is_empty() {
            return Ok(RecordOutcome::Consumed);
        }
        let value: Value = serde_json::from_str(data)?;
        if let Some(err) = super::error::embedded_error(&value, Some(super::error::parse_openai)) {
            return Err(DialectError::Upstream(err));
        }
        let chunk: LooseChunk = serde_json::from_value(value)?;
        acc.set_identity(Some(&chunk.id), Some(&chunk.model));
        if let Some(usage) = &chunk.usage {
            acc.observe_usage(usage);
        }
        match chunk.choices.into_iter().next() {
            Some(choice) => Ok(RecordOutcome::Delta {
                delta: choice.delta,
                finish_reason: choice.finish_reason,
            }),
            None => Ok(RecordOutcome::Consumed),
        }
    }
}
