//! Cost Model
//!
//! Pure functions from (model, token counts, modality, group) to quota units.
//!
//! - Text: `ceil((prompt + completion × completion_ratio) × model_ratio × group_ratio × channel_ratio)`.
//! - Prompt caching: cache writes priced by TTL (5m ×1.25, 1h ×2.0), cache reads ×0.1.
//! - Audio: audio prompt/completion tokens priced with their own ratios.
//! - Image/video: a fixed per-call price in USD converted with `quota_per_unit`.
//!
//! A model ratio of 1 corresponds to $0.002 per 1K prompt tokens.

use crate::models::chat::ChatUsage;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const CACHE_WRITE_5M_MULTIPLIER: f64 = 1.25;
pub const CACHE_WRITE_1H_MULTIPLIER: f64 = 2.0;
pub const CACHE_READ_MULTIPLIER: f64 = 0.1;

static DEFAULT_MODEL_RATIO: Lazy<HashMap<&'static str, f64>> = Lazy::new(|| {
    HashMap::from([
        ("gpt-3.5-turbo", 0.25),
        ("gpt-4", 15.0),
        ("gpt-4-turbo", 5.0),
        ("gpt-4o", 1.25),
        ("gpt-4o-mini", 0.075),
        ("gpt-4.1", 1.0),
        ("gpt-4.1-mini", 0.2),
        ("o3-mini", 0.55),
        ("gpt-4o-audio-preview", 1.25),
        ("claude-instant-1.1", 0.4),
        ("claude-2.1", 4.0),
        ("claude-3-haiku-20240307", 0.125),
        ("claude-3-5-haiku-20241022", 0.4),
        ("claude-3-5-sonnet-20240620", 1.5),
        ("claude-3-5-sonnet-20241022", 1.5),
        ("claude-3-7-sonnet-20250219", 1.5),
        ("claude-3-opus-20240229", 7.5),
        ("claude-sonnet-4-20250514", 1.5),
        ("claude-opus-4-20250514", 7.5),
        ("gemini-1.5-flash", 0.0375),
        ("gemini-1.5-pro", 0.625),
        ("gemini-2.0-flash", 0.05),
        ("gemini-2.5-flash", 0.15),
        ("gemini-2.5-flash-lite", 0.05),
        ("gemini-2.5-pro", 0.625),
        ("mistral-large-latest", 1.0),
    ])
});

static DEFAULT_COMPLETION_RATIO: Lazy<HashMap<&'static str, f64>> = Lazy::new(|| {
    HashMap::from([
        ("gpt-4o-mini", 4.0),
        ("o3-mini", 4.0),
        ("gemini-2.5-flash", 8.33),
        ("gemini-2.5-pro", 8.0),
        ("gemini-2.0-flash", 4.0),
    ])
});

/// Fixed per-call prices in USD for image/video generation models.
static DEFAULT_MODEL_PRICE: Lazy<HashMap<&'static str, f64>> = Lazy::new(|| {
    HashMap::from([
        ("dall-e-2", 0.02),
        ("dall-e-3", 0.04),
        ("gpt-image-1", 0.04),
        ("imagen-3.0-generate-002", 0.04),
        ("veo-2.0-generate-001", 0.35),
    ])
});

static DEFAULT_AUDIO_RATIO: Lazy<HashMap<&'static str, AudioRatio>> = Lazy::new(|| {
    HashMap::from([
        (
            "gpt-4o-audio-preview",
            AudioRatio {
                prompt: 16.0,
                completion: 2.0,
            },
        ),
        (
            "gpt-4o-mini-audio-preview",
            AudioRatio {
                prompt: 66.67,
                completion: 2.0,
            },
        ),
    ])
});

/// Audio token multipliers relative to the text model ratio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioRatio {
    pub prompt: f64,
    pub completion: f64,
}

/// Ratio tables. Defaults are built in; every map can be overridden from config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RatioTables {
    pub model_ratio: HashMap<String, f64>,
    pub completion_ratio: HashMap<String, f64>,
    pub group_ratio: HashMap<String, f64>,
    pub model_price: HashMap<String, f64>,
    pub audio_ratio: HashMap<String, AudioRatio>,
    /// Ratio applied to models missing from every table.
    pub default_model_ratio: f64,
    /// Quota units per USD.
    pub quota_per_unit: f64,
    /// Flat amount added to every pre-consume estimate.
    pub pre_consumed_base: u64,
}

impl Default for RatioTables {
    fn default() -> Self {
        Self {
            model_ratio: HashMap::new(),
            completion_ratio: HashMap::new(),
            group_ratio: HashMap::from([
                ("default".to_string(), 1.0),
                ("vip".to_string(), 1.0),
                ("svip".to_string(), 1.0),
            ]),
            model_price: HashMap::new(),
            audio_ratio: HashMap::new(),
            default_model_ratio: 30.0,
            quota_per_unit: 500_000.0,
            pre_consumed_base: 500,
        }
    }
}

impl RatioTables {
    pub fn model_ratio(&self, name: &str) -> f64 {
        let mut name = name;
        if (name.starts_with("qwen-") || name.starts_with("command-")) && name.ends_with("-internet")
        {
            name = name.trim_end_matches("-internet");
        }
        if let Some(r) = self.model_ratio.get(name) {
            return *r;
        }
        if let Some(r) = DEFAULT_MODEL_RATIO.get(name) {
            return *r;
        }
        tracing::warn!(model = %name, fallback = self.default_model_ratio, "model ratio not found");
        self.default_model_ratio
    }

    pub fn completion_ratio(&self, name: &str) -> f64 {
        if let Some(r) = self.completion_ratio.get(name) {
            return *r;
        }
        if let Some(r) = DEFAULT_COMPLETION_RATIO.get(name) {
            return *r;
        }
        if name.starts_with("gpt-3.5") {
            return if name == "gpt-3.5-turbo" || name.ends_with("0125") {
                3.0
            } else if name.ends_with("1106") {
                2.0
            } else {
                4.0 / 3.0
            };
        }
        if name.starts_with("gpt-4.1") {
            return 4.0;
        }
        if name.starts_with("gpt-4") {
            return if name.starts_with("gpt-4-turbo")
                || name.starts_with("gpt-4o")
                || name.ends_with("preview")
            {
                3.0
            } else {
                2.0
            };
        }
        if name.starts_with("claude-3") || name.starts_with("claude-sonnet-4") || name.starts_with("claude-opus-4") {
            return 5.0;
        }
        if name.starts_with("claude-") || name.starts_with("mistral-") || name.starts_with("gemini-")
        {
            return 3.0;
        }
        1.0
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        match self.group_ratio.get(group) {
            Some(r) => *r,
            None => {
                tracing::warn!(group = %group, "group ratio not found, using 1");
                1.0
            }
        }
    }

    /// Fixed per-call price in USD, when the model is billed per call.
    pub fn model_price(&self, name: &str) -> Option<f64> {
        self.model_price
            .get(name)
            .copied()
            .or_else(|| DEFAULT_MODEL_PRICE.get(name).copied())
    }

    pub fn audio_ratio(&self, name: &str) -> Option<AudioRatio> {
        self.audio_ratio
            .get(name)
            .copied()
            .or_else(|| DEFAULT_AUDIO_RATIO.get(name).copied())
    }

    /// Collect every ratio needed to bill one request.
    pub fn pricing_for(&self, model: &str, group: &str, channel_ratio: f64) -> Pricing {
        Pricing {
            model_ratio: self.model_ratio(model),
            completion_ratio: self.completion_ratio(model),
            group_ratio: self.group_ratio(group),
            channel_ratio: if channel_ratio > 0.0 { channel_ratio } else { 1.0 },
            audio: self.audio_ratio(model),
            fixed_price: self.model_price(model),
            quota_per_unit: self.quota_per_unit,
        }
    }

    /// Upper-bound estimate reserved before the upstream call.
    pub fn pre_consumed_quota(&self, prompt_tokens: u64, max_tokens: Option<u32>, pricing: &Pricing) -> i64 {
        if let Some(price) = pricing.fixed_price {
            return fixed_price_quota(price, pricing, 1);
        }
        let tokens = self.pre_consumed_base + prompt_tokens + max_tokens.unwrap_or(0) as u64;
        (tokens as f64 * pricing.ratio()) as i64
    }
}

/// All multipliers for one request, resolved once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pricing {
    pub model_ratio: f64,
    pub completion_ratio: f64,
    pub group_ratio: f64,
    pub channel_ratio: f64,
    pub audio: Option<AudioRatio>,
    pub fixed_price: Option<f64>,
    pub quota_per_unit: f64,
}

impl Pricing {
    pub fn ratio(&self) -> f64 {
        self.model_ratio * self.group_ratio * self.channel_ratio
    }
}

/// Weighted token amounts that make up a quota figure.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostBreakdown {
    pub text_prompt: f64,
    pub completion: f64,
    pub audio_prompt: f64,
    pub audio_completion: f64,
    pub cache_write_5m: f64,
    pub cache_write_1h: f64,
    pub cache_read: f64,
    pub quota: i64,
}

/// Actual cost of a finished call from its usage.
pub fn quota_for_usage(usage: &ChatUsage, pricing: &Pricing) -> CostBreakdown {
    if let Some(price) = pricing.fixed_price {
        return CostBreakdown {
            quota: fixed_price_quota(price, pricing, 1),
            ..Default::default()
        };
    }

    let total = usage.total_tokens.max(usage.prompt_tokens + usage.completion_tokens);
    if total == 0 {
        return CostBreakdown::default();
    }

    let cache_5m = usage.cache_creation_5m_tokens + usage.cache_creation_tokens;
    let cache_1h = usage.cache_creation_1h_tokens;
    let cache_read = usage.cache_read_tokens;

    let (audio_prompt_tokens, audio_completion_tokens) = match pricing.audio {
        Some(_) => (usage.prompt_audio_tokens(), usage.completion_audio_tokens()),
        None => (0, 0),
    };
    let audio = pricing.audio.unwrap_or(AudioRatio {
        prompt: 1.0,
        completion: 1.0,
    });

    let text_prompt_tokens = usage
        .prompt_tokens
        .saturating_sub(cache_5m + cache_1h + cache_read + audio_prompt_tokens);
    let text_completion_tokens = usage.completion_tokens.saturating_sub(audio_completion_tokens);

    let mut b = CostBreakdown {
        text_prompt: text_prompt_tokens as f64,
        completion: text_completion_tokens as f64 * pricing.completion_ratio,
        audio_prompt: audio_prompt_tokens as f64 * audio.prompt,
        audio_completion: audio_completion_tokens as f64
            * audio.prompt
            * audio.completion
            * pricing.completion_ratio,
        cache_write_5m: cache_5m as f64 * CACHE_WRITE_5M_MULTIPLIER,
        cache_write_1h: cache_1h as f64 * CACHE_WRITE_1H_MULTIPLIER,
        cache_read: cache_read as f64 * CACHE_READ_MULTIPLIER,
        quota: 0,
    };
    let weighted = b.text_prompt
        + b.completion
        + b.audio_prompt
        + b.audio_completion
        + b.cache_write_5m
        + b.cache_write_1h
        + b.cache_read;
    let ratio = pricing.ratio();
    let mut quota = (weighted * ratio).ceil() as i64;
    if ratio != 0.0 && quota <= 0 {
        quota = 1;
    }
    b.quota = quota;
    b
}

/// Per-call price for image/video models.
pub fn fixed_price_quota(price_usd: f64, pricing: &Pricing, count: u32) -> i64 {
    (price_usd * pricing.quota_per_unit * pricing.group_ratio * pricing.channel_ratio * count as f64)
        .ceil() as i64
}

/// Parse a per-user channel-type ratio string such as `{41:0.2,42:0.6}`.
/// Malformed entries are skipped.
pub fn parse_channel_type_ratios(raw: &str) -> HashMap<i64, f64> {
    let inner = raw.trim().trim_start_matches('{').trim_end_matches('}');
    inner
        .split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once(':')?;
            let k = k.trim().trim_matches('"').parse::<i64>().ok()?;
            let v = v.trim().parse::<f64>().ok()?;
            Some((k, v))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::{CompletionTokensDetails, PromptTokensDetails};

    fn pricing(model_ratio: f64, completion_ratio: f64) -> Pricing {
        Pricing {
            model_ratio,
            completion_ratio,
            group_ratio: 1.0,
            channel_ratio: 1.0,
            audio: None,
            fixed_price: None,
            quota_per_unit: 500_000.0,
        }
    }

    #[test]
    fn text_quota_rounds_up() {
        let usage = ChatUsage::new(10, 1);
        let b = quota_for_usage(&usage, &pricing(1.5, 5.0));
        // (10 + 1×5) × 1.5 = 22.5
        assert_eq!(b.quota, 23);
    }

    #[test]
    fn zero_tokens_cost_nothing_and_tiny_usage_costs_one() {
        assert_eq!(quota_for_usage(&ChatUsage::default(), &pricing(1.0, 1.0)).quota, 0);
        let b = quota_for_usage(&ChatUsage::new(1, 0), &pricing(0.0001, 1.0));
        assert_eq!(b.quota, 1);
    }

    #[test]
    fn cache_writes_are_priced_by_ttl() {
        let mut usage = ChatUsage::new(1000, 0);
        usage.cache_creation_5m_tokens = 200;
        usage.cache_creation_1h_tokens = 100;
        usage.cache_read_tokens = 500;
        let b = quota_for_usage(&usage, &pricing(1.0, 1.0));
        assert_eq!(b.text_prompt, 200.0);
        assert_eq!(b.cache_write_5m, 250.0);
        assert_eq!(b.cache_write_1h, 200.0);
        assert_eq!(b.cache_read, 50.0);
        assert_eq!(b.quota, 700);
    }

    #[test]
    fn audio_tokens_use_their_own_ratios() {
        let mut usage = ChatUsage::new(100, 10);
        usage.prompt_tokens_details = Some(PromptTokensDetails {
            cached_tokens: 0,
            audio_tokens: 40,
        });
        usage.completion_tokens_details = Some(CompletionTokensDetails {
            reasoning_tokens: 0,
            audio_tokens: 10,
        });
        let mut p = pricing(1.0, 2.0);
        p.audio = Some(AudioRatio {
            prompt: 10.0,
            completion: 2.0,
        });
        let b = quota_for_usage(&usage, &p);
        assert_eq!(b.text_prompt, 60.0);
        assert_eq!(b.audio_prompt, 400.0);
        assert_eq!(b.audio_completion, 400.0);
        assert_eq!(b.completion, 0.0);
    }

    #[test]
    fn fixed_price_models_ignore_tokens() {
        let tables = RatioTables::default();
        let p = tables.pricing_for("dall-e-3", "default", 1.0);
        let b = quota_for_usage(&ChatUsage::new(5000, 5000), &p);
        assert_eq!(b.quota, 20_000);
        assert_eq!(tables.pre_consumed_quota(10, Some(10), &p), 20_000);
    }

    #[test]
    fn pre_consume_includes_base_prompt_and_max_tokens() {
        let tables = RatioTables::default();
        let p = pricing(2.0, 1.0);
        assert_eq!(tables.pre_consumed_quota(100, Some(400), &p), 2000);
    }

    #[test]
    fn unknown_model_falls_back_to_default_ratio() {
        let tables = RatioTables::default();
        assert_eq!(tables.model_ratio("no-such-model"), 30.0);
        assert_eq!(tables.model_ratio("claude-3-5-sonnet-20241022"), 1.5);
        assert_eq!(tables.completion_ratio("claude-3-5-sonnet-20241022"), 5.0);
    }

    #[test]
    fn channel_type_ratio_string_parses() {
        let m = parse_channel_type_ratios("{41:0.2, 42:0.6, bad}");
        assert_eq!(m.get(&41), Some(&0.2));
        assert_eq!(m.get(&42), Some(&0.6));
        assert_eq!(m.len(), 2);
    }
}
