//! BPE token counting for pre-consumption estimates and for billing answers
//! whose upstream reported no usage.
//!
//! Encoders take a few hundred milliseconds to load, so one [`TokenCounter`]
//! is built at startup and shared by the orchestrator and stream settlement.
//! Models outside the OpenAI families are counted with `cl100k_base`.

use crate::models::chat::ChatCompletionRequest;
use tiktoken_rs::CoreBPE;

#[derive(Debug, thiserror::Error)]
#[error("failed to load {encoding} encoder: {message}")]
pub struct TokenizerError {
    pub encoding: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Cl100kBase,
    O200kBase,
}

impl Encoding {
    pub fn for_model(model: &str) -> Self {
        let m = model.rsplit('/').next().unwrap_or(model).to_ascii_lowercase();
        const O200K: [&str; 8] = [
            "gpt-4o", "chatgpt-4o", "gpt-4.1", "gpt-4.5", "gpt-5", "o1", "o3", "o4",
        ];
        if O200K.iter().any(|p| m.starts_with(p)) {
            Encoding::O200kBase
        } else {
            Encoding::Cl100kBase
        }
    }
}

/// Owns the loaded encoders.
pub struct TokenCounter {
    cl100k: CoreBPE,
    o200k: CoreBPE,
}

impl TokenCounter {
    pub fn new() -> Result<Self, TokenizerError> {
        let cl100k = tiktoken_rs::cl100k_base().map_err(|e| TokenizerError {
            encoding: "cl100k_base",
            message: e.to_string(),
        })?;
        let o200k = tiktoken_rs::o200k_base().map_err(|e| TokenizerError {
            encoding: "o200k_base",
            message: e.to_string(),
        })?;
        tracing::debug!("token encoders loaded");
        Ok(Self { cl100k, o200k })
    }

    fn encoder(&self, model: &str) -> &CoreBPE {
        match Encoding::for_model(model) {
            Encoding::Cl100kBase => &self.cl100k,
            Encoding::O200kBase => &self.o200k,
        }
    }

    pub fn count(&self, model: &str, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        self.encoder(model).encode_with_special_tokens(text).len() as u64
    }

    /// Sum over several fragments of one answer.
    pub fn count_all<'a>(&self, model: &str, parts: impl IntoIterator<Item = &'a str>) -> u64 {
        let bpe = self.encoder(model);
        parts
            .into_iter()
            .filter(|p| !p.is_empty())
            .map(|p| bpe.encode_with_special_tokens(p).len() as u64)
            .sum()
    }

    /// Prompt estimate: 3 priming tokens, 4 per message plus its content,
    /// name and tool calls, plus the serialized tool definitions.
    pub fn prompt_tokens(&self, req: &ChatCompletionRequest) -> u64 {
        let bpe = self.encoder(&req.model);
        let count = |s: &str| -> u64 {
            if s.is_empty() {
                0
            } else {
                bpe.encode_with_special_tokens(s).len() as u64
            }
        };
        let mut total = 3u64;
        for m in &req.messages {
            total += 4 + count(&m.content_text());
            if let Some(name) = &m.name {
                total += 1 + count(name);
            }
            for tc in m.tool_calls.iter().flatten() {
                total += count(&tc.function.name) + count(&tc.function.arguments);
            }
        }
        if let Some(tools) = &req.tools {
            if let Ok(raw) = serde_json::to_string(tools) {
                total += count(&raw);
            }
        }
        total
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use once_cell::sync::Lazy;

    pub(crate) static COUNTER: Lazy<TokenCounter> =
        Lazy::new(|| TokenCounter::new().expect("encoders load"));

    #[test]
    fn model_families_pick_their_encoding() {
        assert_eq!(Encoding::for_model("gpt-4o-mini"), Encoding::O200kBase);
        assert_eq!(Encoding::for_model("openai/o3-mini"), Encoding::O200kBase);
        assert_eq!(Encoding::for_model("gpt-3.5-turbo"), Encoding::Cl100kBase);
        assert_eq!(Encoding::for_model("claude-3-5-sonnet-20241022"), Encoding::Cl100kBase);
        assert_eq!(Encoding::for_model("gemini-2.5-pro"), Encoding::Cl100kBase);
    }

    #[test]
    fn cjk_text_counts_close_to_one_token_per_character() {
        let text = "你好世界你好世界你好世界";
        for model in ["gpt-4o", "gpt-3.5-turbo"] {
            let n = COUNTER.count(model, text);
            assert!(n >= 8, "{model}: {n}");
        }
    }

    #[test]
    fn counts_match_the_encoder() {
        assert_eq!(COUNTER.count("gpt-4", ""), 0);
        assert_eq!(COUNTER.count("gpt-4", "hello world"), 2);
        assert_eq!(
            COUNTER.count_all("gpt-4", ["hello", "", " world"]),
            COUNTER.count("gpt-4", "hello") + COUNTER.count("gpt-4", " world")
        );
    }

    #[test]
    fn prompt_estimate_adds_message_overhead() {
        let req: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "What is 2+2?"}]
        }))
        .unwrap();
        let content = COUNTER.count("gpt-4", "What is 2+2?");
        assert!(content > 0);
        assert_eq!(COUNTER.prompt_tokens(&req), 3 + 4 + content);
    }
}
