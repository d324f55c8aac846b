//! Provider Adaptor contract
//!
//! One adaptor type per upstream family, held as `Arc<dyn Adaptor>` in an
//! [`AdaptorRegistry`] keyed by [`ApiType`]. Adaptors are stateless: everything
//! about a single call (channel, key, mapped model, stream flag) lives in
//! [`RelayMeta`].
//!
//! Call order per request: `init` → `convert_request` → `execute` →
//! `convert_response` or `stream_dialect`. `execute` performs exactly one
//! network call and never retries.

pub mod anthropic;
pub mod bedrock;
pub mod error;
pub mod gemini;
pub mod openai;
pub mod vertex;

use crate::channel::{ChannelConfig, ChannelType};
use crate::error::RelayError;
use crate::models::chat::{ChatCompletionRequest, ChatCompletionResponse, ChatUsage};
use crate::stream::{ByteStream, RecordStream, SseFrames, StreamDialect};
use base64::Engine;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use http::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdaptorError {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),
    #[error("request conversion failed: {0}")]
    Convert(String),
    #[error("response decoding failed: {0}")]
    Decode(String),
    #[error("invalid header override {0}")]
    InvalidHeader(String),
    #[error("upstream request failed: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, AdaptorError>;

impl From<AdaptorError> for RelayError {
    fn from(err: AdaptorError) -> Self {
        match err {
            AdaptorError::Transport(msg) => RelayError::transport(msg),
            AdaptorError::Convert(_) | AdaptorError::UnsupportedModel(_) => {
                RelayError::local(err, "convert_request_failed", 400)
            }
            AdaptorError::Decode(_) => RelayError::local(err, "bad_response_body", 500),
            AdaptorError::InvalidCredentials(_) | AdaptorError::InvalidHeader(_) => {
                RelayError::local(err, "channel_config_error", 500)
            }
        }
    }
}

/// Wire dialect an adaptor speaks. Several channel types may share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiType {
    OpenAi,
    Anthropic,
    Gemini,
    Bedrock,
    VertexAi,
}

impl From<ChannelType> for ApiType {
    fn from(t: ChannelType) -> Self {
        match t {
            ChannelType::OpenAi | ChannelType::OpenAiCompatible => ApiType::OpenAi,
            ChannelType::Anthropic => ApiType::Anthropic,
            ChannelType::Gemini => ApiType::Gemini,
            ChannelType::Bedrock => ApiType::Bedrock,
            ChannelType::VertexAi => ApiType::VertexAi,
        }
    }
}

/// Per-request relay context.
#[derive(Debug, Clone)]
pub struct RelayMeta {
    pub request_id: String,
    pub token_id: String,
    pub token_name: String,
    pub user_id: String,
    pub group: String,
    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub channel_name: String,
    pub channel_ratio: f64,
    pub key_index: usize,
    pub api_key: String,
    pub base_url: String,
    pub config: ChannelConfig,
    pub headers_override: HashMap<String, String>,
    /// Model name the client asked for.
    pub origin_model: String,
    /// Model name after channel mapping; this is what goes upstream.
    pub actual_model: String,
    pub is_stream: bool,
    pub include_usage: bool,
    pub request_path: String,
    pub prompt_tokens: u64,
    pub start: Instant,
    pub first_response: Option<Instant>,
}

impl RelayMeta {
    /// Bare context for a channel; the orchestrator fills in the rest.
    pub fn for_channel(
        channel: &crate::channel::Channel,
        api_key: &str,
        key_index: usize,
        model: &str,
    ) -> Self {
        let actual_model = channel
            .model_mapping
            .get(model)
            .filter(|m| !m.is_empty())
            .cloned()
            .unwrap_or_else(|| model.to_string());
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            token_id: String::new(),
            token_name: String::new(),
            user_id: String::new(),
            group: "default".to_string(),
            channel_id: channel.id,
            channel_type: channel.channel_type,
            channel_name: channel.name.clone(),
            channel_ratio: channel.ratio,
            key_index,
            api_key: api_key.to_string(),
            base_url: channel.base_url(),
            config: channel.config.clone(),
            headers_override: channel.headers_override.clone(),
            origin_model: model.to_string(),
            actual_model,
            is_stream: false,
            include_usage: false,
            request_path: "/v1/chat/completions".to_string(),
            prompt_tokens: 0,
            start: Instant::now(),
            first_response: None,
        }
    }
}

pub enum UpstreamBody {
    /// Raw bytes from an HTTP upstream; SSE when streaming.
    Bytes(ByteStream),
    /// Records already framed by a provider SDK.
    Records(RecordStream),
    Full(Bytes),
}

pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn full(status: u16, content_type: &str, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: Some(content_type.to_string()),
            body: UpstreamBody::Full(body.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false)
    }

    /// Buffer the whole body.
    pub async fn into_bytes(self) -> std::result::Result<Bytes, std::io::Error> {
        match self.body {
            UpstreamBody::Full(b) => Ok(b),
            UpstreamBody::Bytes(mut s) => {
                let mut out = Vec::new();
                while let Some(chunk) = s.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
            UpstreamBody::Records(mut s) => {
                let mut out = Vec::new();
                while let Some(rec) = s.next().await {
                    out.extend_from_slice(rec?.data.as_bytes());
                    out.push(b'\n');
                }
                Ok(Bytes::from(out))
            }
        }
    }

    /// Framed records for the Streaming Translator.
    pub fn into_records(self) -> RecordStream {
        match self.body {
            UpstreamBody::Records(s) => s,
            UpstreamBody::Bytes(s) => Box::pin(SseFrames::new(s)),
            UpstreamBody::Full(b) => {
                let once = futures_util::stream::iter(vec![Ok::<Bytes, std::io::Error>(b)]);
                Box::pin(SseFrames::new(once))
            }
        }
    }
}

#[async_trait::async_trait]
pub trait Adaptor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Shared HTTP client used by `execute`.
    fn http(&self) -> &reqwest::Client;

    /// Structural credential checks before any work is done.
    fn init(&self, _meta: &RelayMeta) -> Result<()> {
        Ok(())
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<String>;

    /// Provider auth and version headers. Common headers are already set.
    fn setup_headers(
        &self,
        headers: &mut HeaderMap,
        client: &HeaderMap,
        meta: &RelayMeta,
    ) -> Result<()>;

    async fn convert_request(&self, req: &ChatCompletionRequest, meta: &RelayMeta)
        -> Result<Value>;

    async fn execute(
        &self,
        meta: &RelayMeta,
        body: Value,
        client_headers: &HeaderMap,
    ) -> Result<UpstreamResponse> {
        let url = self.request_url(meta)?;
        let mut headers = HeaderMap::new();
        setup_common_headers(&mut headers, client_headers, meta);
        self.setup_headers(&mut headers, client_headers, meta)?;
        apply_headers_override(&mut headers, meta)?;
        send_json(self.http(), &url, headers, &body).await
    }

    fn convert_response(
        &self,
        meta: &RelayMeta,
        body: &[u8],
    ) -> Result<(ChatCompletionResponse, ChatUsage)>;

    fn stream_dialect(&self, meta: &RelayMeta) -> Box<dyn StreamDialect>;

    /// Native error envelope parser, tried before the generic ones.
    fn error_parser(&self) -> Option<error::EnvelopeParser> {
        None
    }

    fn models(&self) -> Vec<String>;
}

/// Content-Type and Accept, copied from the client where present.
pub fn setup_common_headers(headers: &mut HeaderMap, client: &HeaderMap, meta: &RelayMeta) {
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    match client.get(ACCEPT) {
        Some(v) => {
            headers.insert(ACCEPT, v.clone());
        }
        None if meta.is_stream => {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        None => {
            headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        }
    }
}

/// Channel header overrides win over everything; `{api_key}` expands to the
/// selected key.
pub fn apply_headers_override(headers: &mut HeaderMap, meta: &RelayMeta) -> Result<()> {
    for (name, value) in &meta.headers_override {
        let value = value.replace("{api_key}", &meta.api_key);
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| AdaptorError::InvalidHeader(name.clone()))?;
        let value =
            HeaderValue::from_str(&value).map_err(|_| AdaptorError::InvalidHeader(name.to_string()))?;
        headers.insert(name, value);
    }
    Ok(())
}

pub(crate) fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| AdaptorError::InvalidCredentials("key contains invalid header characters".into()))
}

/// POST a JSON body and hand back the status and unread body stream.
pub async fn send_json(
    http: &reqwest::Client,
    url: &str,
    headers: HeaderMap,
    body: &Value,
) -> Result<UpstreamResponse> {
    let resp = http
        .post(url)
        .headers(headers)
        .json(body)
        .send()
        .await
        .map_err(|e| AdaptorError::Transport(e.to_string()))?;
    let status = resp.status().as_u16();
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let stream: ByteStream = Box::pin(resp.bytes_stream().map_err(std::io::Error::other));
    Ok(UpstreamResponse {
        status,
        content_type,
        body: UpstreamBody::Bytes(stream),
    })
}

/// Guess an image MIME type from its magic bytes.
pub(crate) fn sniff_image_mime(data: &[u8]) -> &'static str {
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if data.starts_with(b"GIF8") {
        "image/gif"
    } else if data.len() > 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

/// Resolve an `image_url` to `(mime, base64 data)`. Data URLs are decoded in
/// place; remote URLs are fetched.
pub(crate) async fn image_to_base64(http: &reqwest::Client, url: &str) -> Result<(String, String)> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (header, data) = rest
            .split_once(',')
            .ok_or_else(|| AdaptorError::Convert("malformed data url".into()))?;
        let mime = header.split(';').next().unwrap_or("image/jpeg");
        return Ok((mime.to_string(), data.to_string()));
    }
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|e| AdaptorError::Convert(format!("fetch image {}: {}", url, e)))?;
    if !resp.status().is_success() {
        return Err(AdaptorError::Convert(format!(
            "fetch image {}: status {}",
            url,
            resp.status()
        )));
    }
    let header_mime = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
        .filter(|s| s.starts_with("image/"));
    let data = resp
        .bytes()
        .await
        .map_err(|e| AdaptorError::Convert(format!("read image {}: {}", url, e)))?;
    let mime = header_mime.unwrap_or_else(|| sniff_image_mime(&data).to_string());
    Ok((mime, base64::engine::general_purpose::STANDARD.encode(&data)))
}

/// Adaptors by wire dialect.
#[derive(Clone)]
pub struct AdaptorRegistry {
    adaptors: HashMap<ApiType, Arc<dyn Adaptor>>,
}

impl AdaptorRegistry {
    pub fn new(http: reqwest::Client) -> Self {
        let mut adaptors: HashMap<ApiType, Arc<dyn Adaptor>> = HashMap::new();
        adaptors.insert(ApiType::OpenAi, Arc::new(openai::OpenAiAdaptor::new(http.clone())));
        adaptors.insert(
            ApiType::Anthropic,
            Arc::new(anthropic::AnthropicAdaptor::new(http.clone())),
        );
        adaptors.insert(ApiType::Gemini, Arc::new(gemini::GeminiAdaptor::new(http.clone())));
        adaptors.insert(
            ApiType::Bedrock,
            Arc::new(bedrock::BedrockAdaptor::new(http.clone())),
        );
        adaptors.insert(ApiType::VertexAi, Arc::new(vertex::VertexAdaptor::new(http)));
        Self { adaptors }
    }

    pub fn register(&mut self, api: ApiType, adaptor: Arc<dyn Adaptor>) {
        self.adaptors.insert(api, adaptor);
    }

    pub fn get(&self, channel_type: ChannelType) -> Option<Arc<dyn Adaptor>> {
        self.adaptors.get(&ApiType::from(channel_type)).cloned()
    }

    /// `(model, owner)` pairs across every adaptor catalog.
    pub fn models(&self) -> Vec<(String, &'static str)> {
        let mut out: Vec<(String, &'static str)> = self
            .adaptors
            .values()
            .flat_map(|a| {
                let owner = a.name();
                a.models().into_iter().map(move |m| (m, owner))
            })
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;

    fn meta(stream: bool) -> RelayMeta {
        let mut ch = Channel::new(1, "c", ChannelType::OpenAi, "sk-test");
        ch.headers_override
            .insert("X-Custom-Auth".into(), "Token {api_key}".into());
        ch.model_mapping.insert("gpt-4".into(), "gpt-4o".into());
        let mut m = RelayMeta::for_channel(&ch, "sk-test", 0, "gpt-4");
        m.is_stream = stream;
        m
    }

    #[test]
    fn model_mapping_sets_actual_model() {
        let m = meta(false);
        assert_eq!(m.origin_model, "gpt-4");
        assert_eq!(m.actual_model, "gpt-4o");
    }

    #[test]
    fn streaming_requests_accept_event_stream() {
        let mut headers = HeaderMap::new();
        setup_common_headers(&mut headers, &HeaderMap::new(), &meta(true));
        assert_eq!(headers.get(ACCEPT).unwrap(), "text/event-stream");

        let mut client = HeaderMap::new();
        client.insert(ACCEPT, HeaderValue::from_static("application/x-ndjson"));
        let mut headers = HeaderMap::new();
        setup_common_headers(&mut headers, &client, &meta(true));
        assert_eq!(headers.get(ACCEPT).unwrap(), "application/x-ndjson");
    }

    #[test]
    fn header_override_expands_api_key() {
        let mut headers = HeaderMap::new();
        apply_headers_override(&mut headers, &meta(false)).unwrap();
        assert_eq!(headers.get("x-custom-auth").unwrap(), "Token sk-test");
    }

    #[test]
    fn registry_routes_compatible_channels_to_openai() {
        let reg = AdaptorRegistry::new(reqwest::Client::new());
        assert_eq!(reg.get(ChannelType::OpenAiCompatible).unwrap().name(), "openai");
        assert_eq!(reg.get(ChannelType::Bedrock).unwrap().name(), "bedrock");
        assert_eq!(reg.get(ChannelType::VertexAi).unwrap().name(), "vertex_ai");
        assert!(reg.models().iter().any(|(m, o)| m.starts_with("claude") && *o == "anthropic"));
    }

    #[test]
    fn sniffs_common_image_types() {
        assert_eq!(sniff_image_mime(&[0x89, b'P', b'N', b'G', 0, 0]), "image/png");
        assert_eq!(sniff_image_mime(b"GIF89a"), "image/gif");
        assert_eq!(sniff_image_mime(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
    }

    #[tokio::test]
    async fn data_urls_are_decoded_in_place() {
        let (mime, data) = image_to_base64(&reqwest::Client::new(), "data:image/png;base64,AAAA")
            .await
            .unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(data, "AAAA");
    }
}
