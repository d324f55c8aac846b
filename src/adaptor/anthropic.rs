//! Anthropic Messages API.
//!
//! - System/developer messages fold into the top-level `system` string.
//! - Tool results become user turns with a `tool_result` block; assistant tool
//!   calls become `tool_use` blocks.
//! - A `-thinking` model suffix enables extended thinking.
//! - Usage is normalized so `prompt_tokens` includes cache writes and reads.
//!
//! The request builder and stream dialect are shared with Bedrock and Vertex.

use super::{Adaptor, AdaptorError, RelayMeta, Result};
use crate::error::RelayError;
use crate::models::chat::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatDelta, ChatMessage,
    ChatResponseMessage, ChatUsage, FunctionCall, FunctionCallDelta, PromptTokensDetails, Role,
    ToolCall, ToolCallDelta, ToolDefinition,
};
use crate::stream::{DialectError, RecordOutcome, StreamAccumulator, StreamDialect, StreamRecord};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

pub const DEFAULT_VERSION: &str = "2023-06-01";
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const THINKING_SUFFIX: &str = "-thinking";
const THINKING_BETA: &str = "interleaved-thinking-2025-05-14";
const MIN_THINKING_BUDGET: u32 = 1024;

const MODELS: &[&str] = &[
    "claude-instant-1.2",
    "claude-2.1",
    "claude-3-haiku-20240307",
    "claude-3-opus-20240229",
    "claude-3-5-haiku-20241022",
    "claude-3-5-sonnet-20240620",
    "claude-3-5-sonnet-20241022",
    "claude-3-7-sonnet-20250219",
    "claude-3-7-sonnet-20250219-thinking",
    "claude-sonnet-4-20250514",
    "claude-sonnet-4-20250514-thinking",
    "claude-opus-4-20250514",
    "claude-opus-4-20250514-thinking",
];

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct MessagesRequest {
    pub model: Option<String>,
    /// Only sent to Bedrock, which takes the version in the body.
    pub anthropic_version: Option<String>,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub stop_sequences: Option<Vec<String>>,
    pub stream: Option<bool>,
    pub tools: Option<Vec<Tool>>,
    pub tool_choice: Option<ToolChoice>,
    pub thinking: Option<Thinking>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Tool {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolChoice {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Thinking {
    #[serde(rename = "type")]
    pub kind: String,
    pub budget_tokens: u32,
}

/// Where the request is going. Bedrock wants no `model`/`stream` in the body;
/// Vertex takes the model from the URL but keeps `stream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Direct,
    Bedrock,
    Vertex,
}

pub fn is_thinking_model(model: &str) -> bool {
    model.ends_with(THINKING_SUFFIX)
}

pub fn base_model_name(model: &str) -> &str {
    model.strip_suffix(THINKING_SUFFIX).unwrap_or(model)
}

fn legacy_model_name(model: &str) -> &str {
    match model {
        "claude-instant-1" => "claude-instant-1.1",
        "claude-2" => "claude-2.1",
        other => other,
    }
}

fn thinking_budget_ratio(effort: Option<&str>) -> f64 {
    match effort {
        Some("low") => 0.2,
        Some("medium") => 0.5,
        _ => 0.8,
    }
}

fn convert_tool(tool: &ToolDefinition) -> Tool {
    let ToolDefinition::Function { function } = tool;
    let mut schema = function
        .parameters
        .clone()
        .filter(|p| p.is_object())
        .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
    if let Some(obj) = schema.as_object_mut() {
        obj.entry("type").or_insert_with(|| json!("object"));
    }
    Tool {
        name: function.name.clone(),
        description: function.description.clone(),
        input_schema: schema,
    }
}

/// `None` means the field is omitted.
fn convert_tool_choice(choice: Option<&Value>) -> Option<ToolChoice> {
    let auto = ToolChoice {
        kind: "auto".into(),
        name: None,
    };
    match choice {
        None => Some(auto),
        Some(Value::String(s)) => match s.as_str() {
            "required" | "any" => Some(ToolChoice {
                kind: "any".into(),
                name: None,
            }),
            "none" => None,
            _ => Some(auto),
        },
        Some(Value::Object(obj)) => {
            match obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
            {
                Some(name) => Some(ToolChoice {
                    kind: "tool".into(),
                    name: Some(name.to_string()),
                }),
                None => Some(auto),
            }
        }
        Some(_) => Some(auto),
    }
}

async fn user_blocks(http: &reqwest::Client, msg: &ChatMessage) -> Vec<ContentBlock> {
    let parts = match &msg.content {
        Value::Array(parts) => parts,
        _ => {
            let text = msg.content_text();
            return if text.is_empty() {
                Vec::new()
            } else {
                vec![ContentBlock::Text { text }]
            };
        }
    };
    let mut blocks = Vec::new();
    for part in parts {
        match part.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        blocks.push(ContentBlock::Text {
                            text: text.to_string(),
                        });
                    }
                }
            }
            Some("image_url") => {
                let url = part
                    .get("image_url")
                    .and_then(|u| u.get("url").or(Some(u)))
                    .and_then(|u| u.as_str());
                let Some(url) = url else { continue };
                match super::image_to_base64(http, url).await {
                    Ok((media_type, data)) => blocks.push(ContentBlock::Image {
                        source: ImageSource {
                            kind: "base64".into(),
                            media_type,
                            data,
                        },
                    }),
                    Err(e) => tracing::warn!(error = %e, "dropping image that could not be inlined"),
                }
            }
            _ => {}
        }
    }
    blocks
}

fn push_turn(messages: &mut Vec<Message>, role: &str, blocks: Vec<ContentBlock>) {
    if blocks.is_empty() {
        return;
    }
    match messages.last_mut() {
        Some(last) if last.role == role => last.content.extend(blocks),
        _ => messages.push(Message {
            role: role.to_string(),
            content: blocks,
        }),
    }
}

/// Canonical request → Messages API body.
pub async fn build_request(
    http: &reqwest::Client,
    req: &ChatCompletionRequest,
    model: &str,
    target: Target,
) -> Result<MessagesRequest> {
    let thinking = is_thinking_model(model);
    let base = legacy_model_name(base_model_name(model));

    let mut out = MessagesRequest {
        model: (target == Target::Direct).then(|| base.to_string()),
        max_tokens: req.effective_max_tokens().unwrap_or(0),
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        stream: (target != Target::Bedrock && req.stream).then_some(true),
        ..Default::default()
    };

    let stops = req.stop_sequences();
    if !stops.is_empty() {
        out.stop_sequences = Some(stops);
    }

    if let Some(tools) = req.tools.as_ref().filter(|t| !t.is_empty()) {
        out.tools = Some(tools.iter().map(convert_tool).collect());
        out.tool_choice = convert_tool_choice(req.tool_choice.as_ref());
    }

    if out.max_tokens == 0 {
        out.max_tokens = DEFAULT_MAX_TOKENS;
    }

    if thinking {
        let ratio = thinking_budget_ratio(req.reasoning_effort.as_deref());
        let budget = ((out.max_tokens as f64 * ratio) as u32).max(MIN_THINKING_BUDGET);
        if out.max_tokens <= budget {
            out.max_tokens = budget + MIN_THINKING_BUDGET;
        }
        out.thinking = Some(Thinking {
            kind: "enabled".into(),
            budget_tokens: budget,
        });
        out.temperature = Some(1.0);
        out.top_p = None;
        out.top_k = None;
    }

    let mut system: Vec<String> = Vec::new();
    let mut messages: Vec<Message> = Vec::new();
    for msg in &req.messages {
        match msg.role {
            Role::System | Role::Developer => {
                let text = msg.content_text();
                if !text.is_empty() {
                    system.push(text);
                }
            }
            Role::Tool => push_turn(
                &mut messages,
                "user",
                vec![ContentBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.content_text(),
                }],
            ),
            Role::Assistant => {
                let mut blocks = Vec::new();
                let text = msg.content_text();
                if !text.is_empty() {
                    blocks.push(ContentBlock::Text { text });
                }
                for tc in msg.tool_calls.iter().flatten() {
                    let input = serde_json::from_str::<Value>(&tc.function.arguments)
                        .ok()
                        .filter(|v| v.is_object())
                        .unwrap_or_else(|| json!({}));
                    blocks.push(ContentBlock::ToolUse {
                        id: tc.id.clone(),
                        name: tc.function.name.clone(),
                        input,
                    });
                }
                push_turn(&mut messages, "assistant", blocks);
            }
            Role::User | Role::Function => {
                let blocks = user_blocks(http, msg).await;
                push_turn(&mut messages, "user", blocks);
            }
        }
    }
    if !system.is_empty() {
        out.system = Some(system.join("\n"));
    }
    if messages.is_empty() {
        return Err(AdaptorError::Convert("request has no user or assistant messages".into()));
    }
    out.messages = messages;
    Ok(out)
}

pub fn stop_reason_to_finish(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop".into(),
        "max_tokens" => "length".into(),
        "tool_use" => "tool_calls".into(),
        "refusal" => "content_filter".into(),
        other => other.into(),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheCreation {
    #[serde(default)]
    pub ephemeral_5m_input_tokens: u64,
    #[serde(default)]
    pub ephemeral_1h_input_tokens: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation: Option<CacheCreation>,
}

impl Usage {
    pub fn to_chat(&self) -> ChatUsage {
        let prompt = self.input_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens;
        let mut u = ChatUsage::new(prompt, self.output_tokens);
        match &self.cache_creation {
            Some(cc) if cc.ephemeral_5m_input_tokens + cc.ephemeral_1h_input_tokens > 0 => {
                u.cache_creation_5m_tokens = cc.ephemeral_5m_input_tokens;
                u.cache_creation_1h_tokens = cc.ephemeral_1h_input_tokens;
            }
            _ => u.cache_creation_tokens = self.cache_creation_input_tokens,
        }
        u.cache_read_tokens = self.cache_read_input_tokens;
        if self.cache_read_input_tokens > 0 {
            u.prompt_tokens_details = Some(PromptTokensDetails {
                cached_tokens: self.cache_read_input_tokens,
                audio_tokens: 0,
            });
        }
        u
    }
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

/// Messages API response body → canonical response.
pub fn parse_response(body: &[u8], fallback_model: &str) -> Result<(ChatCompletionResponse, ChatUsage)> {
    let resp: MessagesResponse =
        serde_json::from_slice(body).map_err(|e| AdaptorError::Decode(e.to_string()))?;
    let mut text = String::new();
    let mut reasoning: Vec<String> = Vec::new();
    let mut tool_calls = Vec::new();
    for block in resp.content {
        match block.kind.as_str() {
            "text" => text.push_str(block.text.as_deref().unwrap_or_default()),
            "thinking" => {
                if let Some(t) = block.thinking.filter(|t| !t.is_empty()) {
                    reasoning.push(t);
                }
            }
            "tool_use" => {
                let args = block.input.unwrap_or_else(|| json!({}));
                tool_calls.push(ToolCall {
                    id: block.id.unwrap_or_default(),
                    call_type: "function".into(),
                    function: FunctionCall {
                        name: block.name.unwrap_or_default(),
                        arguments: args.to_string(),
                    },
                });
            }
            _ => {}
        }
    }
    let usage = resp.usage.to_chat();
    let model = if resp.model.is_empty() {
        fallback_model.to_string()
    } else {
        resp.model
    };
    let out = ChatCompletionResponse {
        id: if resp.id.is_empty() {
            crate::models::chat::new_completion_id()
        } else {
            resp.id
        },
        object: "chat.completion".into(),
        created: crate::models::chat::unix_now(),
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatResponseMessage {
                role: "assistant".into(),
                content: Some(text),
                reasoning_content: (!reasoning.is_empty()).then(|| reasoning.join("\n")),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: resp.stop_reason.as_deref().map(stop_reason_to_finish),
            logprobs: None,
        }],
        usage: Some(usage.clone()),
        system_fingerprint: None,
    };
    Ok((out, usage))
}

pub struct AnthropicAdaptor {
    http: reqwest::Client,
}

impl AnthropicAdaptor {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait::async_trait]
impl Adaptor for AnthropicAdaptor {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<String> {
        let base = meta.base_url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base);
        Ok(format!("{}/v1/messages", base))
    }

    fn setup_headers(
        &self,
        headers: &mut HeaderMap,
        client: &HeaderMap,
        meta: &RelayMeta,
    ) -> Result<()> {
        headers.insert(
            HeaderName::from_static("x-api-key"),
            super::header_value(&meta.api_key)?,
        );
        let version = client
            .get("anthropic-version")
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_VERSION));
        headers.insert(HeaderName::from_static("anthropic-version"), version);

        let mut betas: Vec<String> = client
            .get("anthropic-beta")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(',').map(|b| b.trim().to_string()).collect())
            .unwrap_or_default();
        betas.retain(|b| !b.is_empty());
        if is_thinking_model(&meta.actual_model) && !betas.iter().any(|b| b == THINKING_BETA) {
            betas.push(THINKING_BETA.to_string());
        }
        if !betas.is_empty() {
            headers.insert(
                HeaderName::from_static("anthropic-beta"),
                HeaderValue::from_str(&betas.join(","))
                    .map_err(|_| AdaptorError::InvalidHeader("anthropic-beta".into()))?,
            );
        }
        Ok(())
    }

    async fn convert_request(
        &self,
        req: &ChatCompletionRequest,
        meta: &RelayMeta,
    ) -> Result<Value> {
        let body = build_request(&self.http, req, &meta.actual_model, Target::Direct).await?;
        serde_json::to_value(body).map_err(|e| AdaptorError::Convert(e.to_string()))
    }

    fn convert_response(
        &self,
        meta: &RelayMeta,
        body: &[u8],
    ) -> Result<(ChatCompletionResponse, ChatUsage)> {
        parse_response(body, &meta.actual_model)
    }

    fn stream_dialect(&self, _meta: &RelayMeta) -> Box<dyn StreamDialect> {
        Box::new(AnthropicDialect::default())
    }

    fn error_parser(&self) -> Option<super::error::EnvelopeParser> {
        Some(super::error::parse_anthropic)
    }

    fn models(&self) -> Vec<String> {
        MODELS.iter().map(|m| m.to_string()).collect()
    }
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    content_block: Option<ResponseBlock>,
    #[serde(default)]
    delta: Option<EventDelta>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default, rename = "amazon-bedrock-invocationMetrics")]
    bedrock_metrics: Option<BedrockMetrics>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct EventDelta {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BedrockMetrics {
    #[serde(default)]
    input_token_count: u64,
    #[serde(default)]
    output_token_count: u64,
}

/// Typed Messages API stream events. Content block indexes count text
/// blocks too, so tool calls get their own dense ordinal.
#[derive(Debug, Default)]
pub struct AnthropicDialect {
    tool_ordinals: HashMap<u32, u32>,
}

impl AnthropicDialect {
    fn tool_delta(index: u32, id: Option<String>, name: Option<String>, args: String) -> RecordOutcome {
        let first = id.is_some();
        RecordOutcome::Delta {
            delta: ChatDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index,
                    id,
                    call_type: first.then(|| "function".to_string()),
                    function: Some(FunctionCallDelta {
                        name,
                        arguments: Some(args),
                    }),
                }]),
                ..Default::default()
            },
            finish_reason: None,
        }
    }

    fn reasoning(text: String) -> RecordOutcome {
        RecordOutcome::Delta {
            delta: ChatDelta {
                reasoning_content: Some(text),
                ..Default::default()
            },
            finish_reason: None,
        }
    }
}

impl StreamDialect for AnthropicDialect {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn on_record(
        &mut self,
        record: &StreamRecord,
        acc: &mut StreamAccumulator,
    ) -> std::result::Result<RecordOutcome, DialectError> {
        if record.data.trim().is_empty() {
            return Ok(RecordOutcome::Consumed);
        }
        let value: Value = serde_json::from_str(&record.data)?;
        if value.get("type").and_then(|t| t.as_str()) == Some("error") {
            let status = match value.pointer("/error/type").and_then(|t| t.as_str()) {
                Some("overloaded_error") => 529,
                Some("rate_limit_error") => 429,
                _ => 500,
            };
            let err = super::error::parse_anthropic(status, &value).unwrap_or_else(|| {
                RelayError::new(status, "upstream_error", "stream_error", value.to_string())
            });
            return Err(DialectError::Upstream(err));
        }
        let event: StreamEvent = serde_json::from_value(value)?;
        match event.kind.as_str() {
            "message_start" => {
                if let Some(msg) = event.message {
                    acc.set_identity(msg.id.as_deref(), msg.model.as_deref());
                    if let Some(u) = msg.usage {
                        acc.observe_usage(&u.to_chat());
                    }
                }
                Ok(RecordOutcome::Consumed)
            }
            "content_block_start" => {
                let block = event
                    .content_block
                    .ok_or_else(|| DialectError::Malformed("content_block_start without block".into()))?;
                match block.kind.as_str() {
                    "text" => Ok(block
                        .text
                        .filter(|t| !t.is_empty())
                        .map(RecordOutcome::text)
                        .unwrap_or(RecordOutcome::Consumed)),
                    "thinking" => Ok(block
                        .thinking
                        .filter(|t| !t.is_empty())
                        .map(Self::reasoning)
                        .unwrap_or(RecordOutcome::Consumed)),
                    "tool_use" => {
                        let ordinal = self.tool_ordinals.len() as u32;
                        self.tool_ordinals.insert(event.index.unwrap_or(ordinal), ordinal);
                        Ok(Self::tool_delta(
                            ordinal,
                            Some(block.id.unwrap_or_default()),
                            block.name,
                            String::new(),
                        ))
                    }
                    _ => Ok(RecordOutcome::Consumed),
                }
            }
            "content_block_delta" => {
                let delta = event
                    .delta
                    .ok_or_else(|| DialectError::Malformed("content_block_delta without delta".into()))?;
                match delta.kind.as_deref() {
                    Some("text_delta") => Ok(RecordOutcome::text(delta.text.unwrap_or_default())),
                    Some("thinking_delta") => Ok(Self::reasoning(delta.thinking.unwrap_or_default())),
                    Some("input_json_delta") => {
                        let block = event.index.unwrap_or(0);
                        let ordinal = *self.tool_ordinals.get(&block).ok_or_else(|| {
                            DialectError::Malformed(format!("input_json_delta for unknown block {}", block))
                        })?;
                        Ok(Self::tool_delta(
                            ordinal,
                            None,
                            None,
                            delta.partial_json.unwrap_or_default(),
                        ))
                    }
                    _ => Ok(RecordOutcome::Consumed),
                }
            }
            "message_delta" => {
                if let Some(u) = &event.usage {
                    acc.observe_usage(&u.to_chat());
                }
                match event.delta.and_then(|d| d.stop_reason) {
                    Some(reason) => Ok(RecordOutcome::finish(stop_reason_to_finish(&reason))),
                    None => Ok(RecordOutcome::Consumed),
                }
            }
            "message_stop" => {
                if let Some(m) = event.bedrock_metrics {
                    acc.observe_usage(&ChatUsage::new(m.input_token_count, m.output_token_count));
                }
                Ok(RecordOutcome::Done)
            }
            _ => Ok(RecordOutcome::Consumed),
        }
    }
}
