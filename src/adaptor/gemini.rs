//! Google Gemini `generateContent` API.
//!
//! Roles map to `user` / `model`; system and developer messages become
//! `systemInstruction`. Tool results are `functionResponse` parts whose name
//! comes from the message or from the id of the call they answer.
//! `-thinking` / `-nothinking` model suffixes control the thinking budget.

use super::{Adaptor, AdaptorError, RelayMeta, Result};
use crate::models::chat::{
    self, ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatDelta, ChatMessage,
    ChatResponseMessage, ChatUsage, CompletionTokensDetails, FunctionCall, FunctionCallDelta,
    PromptTokensDetails, Role, ToolCall, ToolCallDelta, ToolDefinition,
};
use crate::stream::{DialectError, RecordOutcome, StreamAccumulator, StreamDialect, StreamRecord};
use http::header::{HeaderMap, HeaderName};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

pub const DEFAULT_API_VERSION: &str = "v1beta";
pub const DEFAULT_SAFETY_THRESHOLD: &str = "BLOCK_NONE";
const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

const MODELS: &[&str] = &[
    "gemini-1.5-flash",
    "gemini-1.5-pro",
    "gemini-2.0-flash",
    "gemini-2.5-flash",
    "gemini-2.5-flash-thinking",
    "gemini-2.5-flash-nothinking",
    "gemini-2.5-flash-lite",
    "gemini-2.5-pro",
    "gemini-2.5-pro-thinking",
];

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub text: Option<String>,
    pub thought: Option<bool>,
    pub inline_data: Option<InlineData>,
    pub function_call: Option<FunctionCallPart>,
    pub function_response: Option<FunctionResponsePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCallPart {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionResponsePart {
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Content {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SystemInstruction {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    pub thinking_budget: Option<i64>,
    pub include_thoughts: Option<bool>,
    pub thinking_level: Option<String>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub stop_sequences: Option<Vec<String>>,
    pub response_mime_type: Option<String>,
    pub thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tools {
    pub function_declarations: Vec<Value>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    pub system_instruction: Option<SystemInstruction>,
    pub safety_settings: Vec<SafetySetting>,
    pub generation_config: GenerationConfig,
    pub tools: Option<Vec<Tools>>,
}

/// Strip the thinking control suffix from a model name.
pub fn base_model_name(model: &str) -> &str {
    model
        .strip_suffix("-thinking")
        .or_else(|| model.strip_suffix("-nothinking"))
        .unwrap_or(model)
}

/// Budget for a `-thinking` model; -1 asks for dynamic thinking.
pub fn thinking_budget(base_model: &str, max_tokens: Option<u32>) -> i64 {
    let Some(max) = max_tokens.filter(|m| *m > 0) else {
        return -1;
    };
    let budget = (max as f64 * 0.6) as i64;
    match base_model {
        "gemini-2.5-pro" => budget.clamp(128, 32768),
        "gemini-2.5-flash" => budget.clamp(0, 24576),
        "gemini-2.5-flash-lite" => budget.clamp(512, 24576),
        _ => budget,
    }
}

fn thinking_level(effort: &str) -> Option<&'static str> {
    match effort.to_ascii_lowercase().as_str() {
        "none" => Some("none"),
        "minimal" => Some("minimal"),
        "low" => Some("low"),
        // OpenAI medium maps to Gemini high
        "medium" | "high" => Some("high"),
        _ => None,
    }
}

/// Tool output as a JSON object; Gemini rejects arrays and scalars here.
fn function_response_body(msg: &ChatMessage) -> Value {
    let parsed = match &msg.content {
        Value::String(s) => serde_json::from_str::<Value>(s).unwrap_or_else(|_| json!({"result": s})),
        other => other.clone(),
    };
    match parsed {
        Value::Object(_) => parsed,
        Value::Null => json!({}),
        other => json!({ "result": other }),
    }
}

async fn message_parts(http: &reqwest::Client, msg: &ChatMessage) -> Vec<Part> {
    let mut parts = Vec::new();
    match &msg.content {
        Value::Array(items) => {
            for item in items {
                match item.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                            parts.push(Part {
                                text: Some(text.to_string()),
                                ..Default::default()
                            });
                        }
                    }
                    Some("image_url") => {
                        let url = item
                            .get("image_url")
                            .and_then(|u| u.get("url").or(Some(u)))
                            .and_then(|u| u.as_str());
                        let Some(url) = url else { continue };
                        match super::image_to_base64(http, url).await {
                            Ok((mime_type, data)) => parts.push(Part {
                                inline_data: Some(InlineData { mime_type, data }),
                                ..Default::default()
                            }),
                            Err(e) => tracing::warn!(error = %e, "dropping image that could not be inlined"),
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {
            let text = msg.content_text();
            if !text.is_empty() {
                parts.push(Part {
                    text: Some(text),
                    ..Default::default()
                });
            }
        }
    }
    parts
}

fn push_content(contents: &mut Vec<Content>, role: &str, parts: Vec<Part>) {
    if parts.is_empty() {
        return;
    }
    match contents.last_mut() {
        Some(last) if last.role == role => last.parts.extend(parts),
        _ => contents.push(Content {
            role: role.to_string(),
            parts,
        }),
    }
}

/// Canonical request → `generateContent` body.
pub async fn build_request(
    http: &reqwest::Client,
    req: &ChatCompletionRequest,
    model: &str,
    safety_threshold: &str,
) -> Result<GenerateRequest> {
    let stops = req.stop_sequences();
    let mut generation = GenerationConfig {
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        max_output_tokens: req.effective_max_tokens().filter(|m| *m > 0),
        stop_sequences: (!stops.is_empty()).then_some(stops),
        ..Default::default()
    };
    if req
        .response_format
        .as_ref()
        .and_then(|f| f.get("type"))
        .and_then(|t| t.as_str())
        == Some("json_object")
    {
        generation.response_mime_type = Some("application/json".into());
    }

    let base = base_model_name(model);
    if model.ends_with("-thinking") {
        generation.thinking_config = Some(ThinkingConfig {
            thinking_budget: Some(thinking_budget(base, req.effective_max_tokens())),
            include_thoughts: Some(true),
            thinking_level: None,
        });
    } else if model.ends_with("-nothinking") {
        generation.thinking_config = Some(ThinkingConfig {
            thinking_budget: Some(0),
            ..Default::default()
        });
    }
    if let Some(level) = req.reasoning_effort.as_deref().and_then(thinking_level) {
        generation
            .thinking_config
            .get_or_insert_with(Default::default)
            .thinking_level = Some(level.to_string());
    }

    let tools = req.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
        let declarations = tools
            .iter()
            .map(|ToolDefinition::Function { function }| {
                let mut decl = Map::new();
                decl.insert("name".into(), json!(function.name));
                if let Some(d) = &function.description {
                    decl.insert("description".into(), json!(d));
                }
                if let Some(p) = &function.parameters {
                    decl.insert("parameters".into(), p.clone());
                }
                Value::Object(decl)
            })
            .collect();
        vec![Tools {
            function_declarations: declarations,
        }]
    });

    let call_names: HashMap<&str, &str> = req
        .messages
        .iter()
        .flat_map(|m| m.tool_calls.iter().flatten())
        .map(|tc| (tc.id.as_str(), tc.function.name.as_str()))
        .collect();

    let mut system_parts = Vec::new();
    let mut contents: Vec<Content> = Vec::new();
    for msg in &req.messages {
        match msg.role {
            Role::System | Role::Developer => {
                let text = msg.content_text();
                if !text.is_empty() {
                    system_parts.push(Part {
                        text: Some(text),
                        ..Default::default()
                    });
                }
            }
            Role::Tool | Role::Function => {
                let name = msg
                    .name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .or_else(|| {
                        msg.tool_call_id
                            .as_deref()
                            .and_then(|id| call_names.get(id))
                            .map(|n| n.to_string())
                    })
                    .unwrap_or_default();
                let part = Part {
                    function_response: Some(FunctionResponsePart {
                        name,
                        response: function_response_body(msg),
                    }),
                    ..Default::default()
                };
                push_content(&mut contents, "user", vec![part]);
            }
            Role::Assistant => {
                let mut parts = message_parts(http, msg).await;
                for tc in msg.tool_calls.iter().flatten() {
                    let args = serde_json::from_str::<Value>(&tc.function.arguments)
                        .ok()
                        .filter(|v| v.is_object())
                        .unwrap_or_else(|| json!({}));
                    parts.push(Part {
                        function_call: Some(FunctionCallPart {
                            name: tc.function.name.clone(),
                            args,
                        }),
                        ..Default::default()
                    });
                }
                push_content(&mut contents, "model", parts);
            }
            Role::User => {
                let parts = message_parts(http, msg).await;
                push_content(&mut contents, "user", parts);
            }
        }
    }
    if contents.is_empty() {
        return Err(AdaptorError::Convert("request has no user or assistant messages".into()));
    }

    Ok(GenerateRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then_some(SystemInstruction {
            parts: system_parts,
        }),
        safety_settings: SAFETY_CATEGORIES
            .iter()
            .map(|c| SafetySetting {
                category: c.to_string(),
                threshold: safety_threshold.to_string(),
            })
            .collect(),
        generation_config: generation,
        tools,
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub thoughts_token_count: u64,
    #[serde(default)]
    pub cached_content_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
}

impl UsageMetadata {
    pub fn to_chat(&self) -> ChatUsage {
        let completion = self.candidates_token_count + self.thoughts_token_count;
        let mut u = ChatUsage::new(self.prompt_token_count, completion);
        u.total_tokens = u.total_tokens.max(self.total_token_count);
        if self.thoughts_token_count > 0 {
            u.completion_tokens_details = Some(CompletionTokensDetails {
                reasoning_tokens: self.thoughts_token_count,
                audio_tokens: 0,
            });
        }
        if self.cached_content_token_count > 0 {
            u.prompt_tokens_details = Some(PromptTokensDetails {
                cached_tokens: self.cached_content_token_count,
                audio_tokens: 0,
            });
            u.cache_read_tokens = self.cached_content_token_count;
        }
        u
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    response_id: Option<String>,
}

pub fn finish_reason(reason: &str, has_tool_calls: bool) -> String {
    match reason {
        "STOP" if has_tool_calls => "tool_calls".into(),
        "STOP" => "stop".into(),
        "MAX_TOKENS" => "length".into(),
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" | "IMAGE_SAFETY" => {
            "content_filter".into()
        }
        other => other.to_ascii_lowercase(),
    }
}

/// Split a candidate into answer text, thought text and function calls.
fn split_parts(content: Option<Content>) -> (String, String, Vec<FunctionCallPart>) {
    let mut text = String::new();
    let mut thoughts = String::new();
    let mut calls = Vec::new();
    for part in content.map(|c| c.parts).unwrap_or_default() {
        if let Some(call) = part.function_call {
            calls.push(call);
        } else if let Some(t) = part.text {
            if part.thought.unwrap_or(false) {
                thoughts.push_str(&t);
            } else {
                text.push_str(&t);
            }
        }
    }
    (text, thoughts, calls)
}

fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

pub fn parse_response(body: &[u8], fallback_model: &str) -> Result<(ChatCompletionResponse, ChatUsage)> {
    let resp: GenerateResponse =
        serde_json::from_slice(body).map_err(|e| AdaptorError::Decode(e.to_string()))?;
    let usage = resp.usage_metadata.as_ref().map(|u| u.to_chat()).unwrap_or_default();
    let blocked = resp
        .prompt_feedback
        .as_ref()
        .and_then(|f| f.block_reason.as_ref())
        .is_some();

    let mut choices = Vec::new();
    for (i, cand) in resp.candidates.into_iter().enumerate() {
        let (text, thoughts, calls) = split_parts(cand.content);
        let tool_calls: Vec<ToolCall> = calls
            .into_iter()
            .map(|c| ToolCall {
                id: new_call_id(),
                call_type: chat::default_tool_type(),
                function: FunctionCall {
                    name: c.name,
                    arguments: c.args.to_string(),
                },
            })
            .collect();
        let finish = cand
            .finish_reason
            .as_deref()
            .map(|r| finish_reason(r, !tool_calls.is_empty()));
        choices.push(ChatChoice {
            index: i as u32,
            message: ChatResponseMessage {
                role: "assistant".into(),
                content: Some(text),
                reasoning_content: (!thoughts.is_empty()).then_some(thoughts),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: finish,
            logprobs: None,
        });
    }
    if choices.is_empty() && blocked {
        choices.push(ChatChoice {
            index: 0,
            message: ChatResponseMessage {
                role: "assistant".into(),
                content: Some(String::new()),
                reasoning_content: None,
                tool_calls: None,
            },
            finish_reason: Some("content_filter".into()),
            logprobs: None,
        });
    }

    Ok((
        ChatCompletionResponse {
            id: resp.response_id.unwrap_or_else(chat::new_completion_id),
            object: "chat.completion".into(),
            created: chat::unix_now(),
            model: resp.model_version.unwrap_or_else(|| fallback_model.to_string()),
            choices,
            usage: Some(usage.clone()),
            system_fingerprint: None,
        },
        usage,
    ))
}

pub struct GeminiAdaptor {
    http: reqwest::Client,
}

impl GeminiAdaptor {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait::async_trait]
impl Adaptor for GeminiAdaptor {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<String> {
        let version = match meta.config.api_version.as_deref() {
            None | Some("") => DEFAULT_API_VERSION,
            Some(v @ ("v1beta" | "v1alpha" | "v1")) => v,
            Some(other) => {
                return Err(AdaptorError::Convert(format!(
                    "unsupported gemini api version {}",
                    other
                )))
            }
        };
        let action = if meta.is_stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        Ok(format!(
            "{}/{}/models/{}:{}",
            meta.base_url.trim_end_matches('/'),
            version,
            base_model_name(&meta.actual_model),
            action
        ))
    }

    fn setup_headers(
        &self,
        headers: &mut HeaderMap,
        _client: &HeaderMap,
        meta: &RelayMeta,
    ) -> Result<()> {
        headers.insert(
            HeaderName::from_static("x-goog-api-key"),
            super::header_value(&meta.api_key)?,
        );
        Ok(())
    }

    async fn convert_request(
        &self,
        req: &ChatCompletionRequest,
        meta: &RelayMeta,
    ) -> Result<Value> {
        let threshold = meta
            .config
            .safety_threshold
            .as_deref()
            .unwrap_or(DEFAULT_SAFETY_THRESHOLD);
        let body = build_request(&self.http, req, &meta.actual_model, threshold).await?;
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
        Box::new(GeminiDialect::default())
    }

    fn error_parser(&self) -> Option<super::error::EnvelopeParser> {
        Some(super::error::parse_gemini)
    }

    fn models(&self) -> Vec<String> {
        MODELS.iter().map(|m| m.to_string()).collect()
    }
}

/// Each `data:` record is a full `GenerateContentResponse` slice; usage
/// metadata is cumulative so the latest report wins.
#[derive(Debug, Default)]
pub struct GeminiDialect {
    tool_calls: u32,
}

impl StreamDialect for GeminiDialect {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn on_record(
        &mut self,
        record: &StreamRecord,
        acc: &mut StreamAccumulator,
    ) -> std::result::Result<RecordOutcome, DialectError> {
        let data = record.data.trim();
        if data.is_empty() {
            return Ok(RecordOutcome::Consumed);
        }
        let value: Value = serde_json::from_str(data)?;
        if let Some(err) = super::error::embedded_error(&value, Some(super::error::parse_gemini)) {
            return Err(DialectError::Upstream(err));
        }
        let resp: GenerateResponse = serde_json::from_value(value)?;
        acc.set_identity(resp.response_id.as_deref(), resp.model_version.as_deref());
        if let Some(u) = &resp.usage_metadata {
            acc.observe_usage(&u.to_chat());
        }

        let Some(cand) = resp.candidates.into_iter().next() else {
            if resp.prompt_feedback.and_then(|f| f.block_reason).is_some() {
                return Ok(RecordOutcome::finish("content_filter"));
            }
            return Ok(RecordOutcome::Consumed);
        };
        let (text, thoughts, calls) = split_parts(cand.content);
        let mut delta = ChatDelta::default();
        if !text.is_empty() {
            delta.content = Some(text);
        }
        if !thoughts.is_empty() {
            delta.reasoning_content = Some(thoughts);
        }
        if !calls.is_empty() {
            let deltas = calls
                .into_iter()
                .map(|c| {
                    let index = self.tool_calls;
                    self.tool_calls += 1;
                    ToolCallDelta {
                        index,
                        id: Some(new_call_id()),
                        call_type: Some("function".into()),
                        function: Some(FunctionCallDelta {
                            name: Some(c.name),
                            arguments: Some(c.args.to_string()),
                        }),
                    }
                })
                .collect();
            delta.tool_calls = Some(deltas);
        }
        let finish = cand
            .finish_reason
            .as_deref()
            .map(|r| finish_reason(r, self.tool_calls > 0));
        if delta == ChatDelta::default() && finish.is_none() {
            return Ok(RecordOutcome::Consumed);
        }
        Ok(RecordOutcome::Delta {
            delta,
            finish_reason: finish,
        })
    }
}
