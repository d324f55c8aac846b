//! Canonical (OpenAI-compatible) wire models.
//!
//! Every adaptor consumes `chat::ChatCompletionRequest` and produces
//! `chat::ChatCompletionResponse` / `chat::ChatCompletionChunk`. Usage counters
//! carry the provider-specific cache fields needed by the cost model; those are
//! skipped on the wire when zero so clients see the usual OpenAI shape.

pub mod chat {
    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value};

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum Role {
        System,
        Developer,
        User,
        Assistant,
        Tool,
        Function,
    }

    impl Role {
        pub fn as_str(&self) -> &'static str {
            match self {
                Role::System => "system",
                Role::Developer => "developer",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
                Role::Function => "function",
            }
        }

        /// System-like roles are folded into a provider's dedicated system field.
        pub fn is_system(&self) -> bool {
            matches!(self, Role::System | Role::Developer)
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct ChatMessage {
        pub role: Role,
        #[serde(default)]
        pub content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tool_calls: Option<Vec<ToolCall>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tool_call_id: Option<String>,
    }

    impl ChatMessage {
        pub fn text(role: Role, text: impl Into<String>) -> Self {
            Self {
                role,
                content: Value::String(text.into()),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            }
        }

        /// Concatenated text of a string or multi-part content.
        pub fn content_text(&self) -> String {
            match &self.content {
                Value::String(s) => s.clone(),
                Value::Array(parts) => parts
                    .iter()
                    .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Value::Null => String::new(),
                other => other.to_string(),
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct FunctionDef {
        pub name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub parameters: Option<Value>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum ToolDefinition {
        Function { function: FunctionDef },
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct FunctionCall {
        pub name: String,
        #[serde(default)]
        pub arguments: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct ToolCall {
        pub id: String,
        #[serde(rename = "type", default = "default_tool_type")]
        pub call_type: String,
        pub function: FunctionCall,
    }

    pub(crate) fn default_tool_type() -> String {
        "function".to_string()
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    pub struct StreamOptions {
        #[serde(default)]
        pub include_usage: bool,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct ChatCompletionRequest {
        pub model: String,
        pub messages: Vec<ChatMessage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub temperature: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub top_p: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub top_k: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub max_tokens: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub max_completion_tokens: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub stop: Option<Value>,
        #[serde(default)]
        pub stream: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub stream_options: Option<StreamOptions>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tools: Option<Vec<ToolDefinition>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tool_choice: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub reasoning_effort: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub response_format: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub user: Option<String>,
        /// Fields the gateway does not model; forwarded untouched to
        /// OpenAI-compatible upstreams and dropped elsewhere.
        #[serde(flatten)]
        pub extra: Map<String, Value>,
    }

    impl ChatCompletionRequest {
        /// `max_completion_tokens` wins over the legacy `max_tokens`.
        pub fn effective_max_tokens(&self) -> Option<u32> {
            self.max_completion_tokens
                .filter(|n| *n > 0)
                .or(self.max_tokens)
        }

        /// Stop sequences from either a single string or an array.
        pub fn stop_sequences(&self) -> Vec<String> {
            match &self.stop {
                Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect(),
                _ => Vec::new(),
            }
        }

        pub fn include_usage(&self) -> bool {
            self.stream_options
                .as_ref()
                .map(|o| o.include_usage)
                .unwrap_or(false)
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
    pub struct PromptTokensDetails {
        #[serde(default)]
        pub cached_tokens: u64,
        #[serde(default)]
        pub audio_tokens: u64,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
    pub struct CompletionTokensDetails {
        #[serde(default)]
        pub reasoning_tokens: u64,
        #[serde(default)]
        pub audio_tokens: u64,
    }

    fn is_zero(n: &u64) -> bool {
        *n == 0
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
    pub struct ChatUsage {
        #[serde(default)]
        pub prompt_tokens: u64,
        #[serde(default)]
        pub completion_tokens: u64,
        #[serde(default)]
        pub total_tokens: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub prompt_tokens_details: Option<PromptTokensDetails>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub completion_tokens_details: Option<CompletionTokensDetails>,
        /// Prompt-cache writes without a TTL breakdown (priced as 5m).
        #[serde(default, skip_serializing_if = "is_zero")]
        pub cache_creation_tokens: u64,
        #[serde(default, skip_serializing_if = "is_zero")]
        pub cache_creation_5m_tokens: u64,
        #[serde(default, skip_serializing_if = "is_zero")]
        pub cache_creation_1h_tokens: u64,
        #[serde(default, skip_serializing_if = "is_zero")]
        pub cache_read_tokens: u64,
    }

    impl ChatUsage {
        pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
            Self {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
                ..Default::default()
            }
        }

        pub fn is_empty(&self) -> bool {
            self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
        }

        pub fn cached_tokens(&self) -> u64 {
            self.prompt_tokens_details
                .as_ref()
                .map(|d| d.cached_tokens)
                .unwrap_or(0)
        }

        pub fn reasoning_tokens(&self) -> u64 {
            self.completion_tokens_details
                .as_ref()
                .map(|d| d.reasoning_tokens)
                .unwrap_or(0)
        }

        pub fn prompt_audio_tokens(&self) -> u64 {
            self.prompt_tokens_details
                .as_ref()
                .map(|d| d.audio_tokens)
                .unwrap_or(0)
        }

        pub fn completion_audio_tokens(&self) -> u64 {
            self.completion_tokens_details
                .as_ref()
                .map(|d| d.audio_tokens)
                .unwrap_or(0)
        }

        /// Field-wise maximum; counters never move backwards within a stream.
        pub fn merge_max(&mut self, other: &ChatUsage) {
            self.prompt_tokens = self.prompt_tokens.max(other.prompt_tokens);
            self.completion_tokens = self.completion_tokens.max(other.completion_tokens);
            self.cache_creation_tokens = self.cache_creation_tokens.max(other.cache_creation_tokens);
            self.cache_creation_5m_tokens = self
                .cache_creation_5m_tokens
                .max(other.cache_creation_5m_tokens);
            self.cache_creation_1h_tokens = self
                .cache_creation_1h_tokens
                .max(other.cache_creation_1h_tokens);
            self.cache_read_tokens = self.cache_read_tokens.max(other.cache_read_tokens);
            if let Some(theirs) = &other.prompt_tokens_details {
                let mine = self.prompt_tokens_details.get_or_insert_with(Default::default);
                mine.cached_tokens = mine.cached_tokens.max(theirs.cached_tokens);
                mine.audio_tokens = mine.audio_tokens.max(theirs.audio_tokens);
            }
            if let Some(theirs) = &other.completion_tokens_details {
                let mine = self
                    .completion_tokens_details
                    .get_or_insert_with(Default::default);
                mine.reasoning_tokens = mine.reasoning_tokens.max(theirs.reasoning_tokens);
                mine.audio_tokens = mine.audio_tokens.max(theirs.audio_tokens);
            }
            self.total_tokens = self
                .total_tokens
                .max(other.total_tokens)
                .max(self.prompt_tokens + self.completion_tokens);
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct ChatResponseMessage {
        pub role: String,
        #[serde(default)]
        pub content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub reasoning_content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tool_calls: Option<Vec<ToolCall>>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct ChatChoice {
        pub index: u32,
        pub message: ChatResponseMessage,
        #[serde(default)]
        pub finish_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub logprobs: Option<Value>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct ChatCompletionResponse {
        pub id: String,
        pub object: String,
        pub created: u64,
        pub model: String,
        pub choices: Vec<ChatChoice>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub usage: Option<ChatUsage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub system_fingerprint: Option<String>,
    }

    impl ChatCompletionResponse {
        /// Text of the first choice, used when usage has to be estimated.
        pub fn first_text(&self) -> String {
            self.choices
                .first()
                .and_then(|c| c.message.content.clone())
                .unwrap_or_default()
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    pub struct FunctionCallDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub arguments: Option<String>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    pub struct ToolCallDelta {
        pub index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub id: Option<String>,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        pub call_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub function: Option<FunctionCallDelta>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    pub struct ChatDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub role: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub reasoning_content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tool_calls: Option<Vec<ToolCallDelta>>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct ChatStreamChoice {
        pub index: u32,
        pub delta: ChatDelta,
        #[serde(default)]
        pub finish_reason: Option<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct ChatCompletionChunk {
        pub id: String,
        pub object: String,
        pub created: u64,
        pub model: String,
        pub choices: Vec<ChatStreamChoice>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub usage: Option<ChatUsage>,
    }

    pub fn unix_now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    pub fn new_completion_id() -> String {
        format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::chat::*;
    use serde_json::json;

    #[test]
    fn request_keeps_unknown_fields_in_extra() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "seed": 7,
            "logit_bias": {"50256": -100}
        }))
        .unwrap();
        assert_eq!(req.extra.get("seed"), Some(&json!(7)));
        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back["logit_bias"]["50256"], json!(-100));
        assert!(back.get("tools").is_none());
    }

    #[test]
    fn max_completion_tokens_overrides_max_tokens() {
        let mut req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [],
            "max_tokens": 100,
            "max_completion_tokens": 300
        }))
        .unwrap();
        assert_eq!(req.effective_max_tokens(), Some(300));
        req.max_completion_tokens = Some(0);
        assert_eq!(req.effective_max_tokens(), Some(100));
    }

    #[test]
    fn stop_accepts_string_or_array() {
        let mut req: ChatCompletionRequest =
            serde_json::from_value(json!({"model": "m", "messages": [], "stop": "END"})).unwrap();
        assert_eq!(req.stop_sequences(), vec!["END".to_string()]);
        req.stop = Some(json!(["a", "b"]));
        assert_eq!(req.stop_sequences().len(), 2);
    }

    #[test]
    fn merge_max_never_decreases() {
        let mut usage = ChatUsage::new(10, 5);
        usage.merge_max(&ChatUsage::new(3, 9));
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 9);
        assert_eq!(usage.total_tokens, 19);
    }

    #[test]
    fn usage_hides_zero_cache_fields_on_the_wire() {
        let v = serde_json::to_value(ChatUsage::new(1, 2)).unwrap();
        assert!(v.get("cache_read_tokens").is_none());
        assert_eq!(v["total_tokens"], json!(3));
    }

    #[test]
    fn content_text_joins_parts() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "a"},
                {"type": "image_url", "image_url": {"url": "http://x"}},
                {"type": "text", "text": "b"}
            ]
        }))
        .unwrap();
        assert_eq!(msg.content_text(), "a\nb");
    }
}
