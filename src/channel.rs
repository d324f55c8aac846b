//! Channels and their keys.
//!
//! A channel is one upstream credential set: provider type, base URL and one or
//! more keys. Multi-key channels track a status per key; the channel itself is
//! only auto-disabled once no key is left enabled.
//!
//! The store trait exposes per-row atomic operations only (compare-and-set on a
//! channel's status, single key status writes). There are no multi-row
//! transactions, so the "all keys disabled" re-check is best effort.

use crate::models::chat::unix_now;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Channel not found: {0}")]
    NotFound(i64),
    #[error("No keys available: {0}")]
    NoKeys(String),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Upstream provider family a channel talks to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    OpenAi,
    /// Any server speaking the OpenAI chat completions dialect (vLLM, Ollama, ...).
    OpenAiCompatible,
    Anthropic,
    Gemini,
    Bedrock,
    /// Google Vertex AI; the key is a service-account JSON document.
    VertexAi,
}

impl ChannelType {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ChannelType::OpenAi | ChannelType::OpenAiCompatible => "https://api.openai.com",
            ChannelType::Anthropic => "https://api.anthropic.com",
            ChannelType::Gemini => "https://generativelanguage.googleapis.com",
            ChannelType::Bedrock | ChannelType::VertexAi => "",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    #[default]
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeySelection {
    #[default]
    Polling,
    Random,
}

/// Why and when something was disabled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DisableInfo {
    pub reason: String,
    pub time: u64,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl DisableInfo {
    pub fn new(reason: impl Into<String>, model: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            reason: reason.into(),
            time: unix_now(),
            model: model.into(),
            status_code,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct KeyMetadata {
    #[serde(default)]
    pub usage: u64,
    #[serde(default)]
    pub last_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<DisableInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MultiKeyInfo {
    #[serde(default)]
    pub is_multi_key: bool,
    #[serde(default)]
    pub selection: KeySelection,
    #[serde(default)]
    pub polling_index: usize,
    /// Index → status; a missing entry means enabled.
    #[serde(default)]
    pub key_status: HashMap<usize, KeyStatus>,
    #[serde(default)]
    pub key_metadata: HashMap<usize, KeyMetadata>,
}

/// Provider-specific settings carried on a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChannelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Gemini safety threshold, e.g. `BLOCK_NONE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_threshold: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_ratio() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default)]
    pub base_url: Option<String>,
    /// One key, a newline separated list, or a JSON array of keys.
    pub key: String,
    #[serde(default)]
    pub status: ChannelStatus,
    /// Auto-disable policy flag; when false the monitor only logs.
    #[serde(default = "default_true")]
    pub auto_disable: bool,
    #[serde(default)]
    pub disabled: Option<DisableInfo>,
    #[serde(default)]
    pub multi_key: MultiKeyInfo,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default)]
    pub headers_override: HashMap<String, String>,
    #[serde(default)]
    pub config: ChannelConfig,
    #[serde(default = "default_ratio")]
    pub ratio: f64,
    #[serde(default)]
    pub group: Option<String>,
}

impl Channel {
    pub fn new(id: i64, name: &str, channel_type: ChannelType, key: &str) -> Self {
        let mut ch = Self {
            id,
            name: name.to_string(),
            channel_type,
            base_url: None,
            key: key.to_string(),
            status: ChannelStatus::Enabled,
            auto_disable: true,
            disabled: None,
            multi_key: MultiKeyInfo::default(),
            models: Vec::new(),
            model_mapping: HashMap::new(),
            headers_override: HashMap::new(),
            config: ChannelConfig::default(),
            ratio: 1.0,
            group: None,
        };
        ch.multi_key.is_multi_key = ch.parse_keys().len() > 1;
        ch
    }

    pub fn base_url(&self) -> String {
        self.base_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.channel_type.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }

    /// Split the raw key material into individual keys.
    pub fn parse_keys(&self) -> Vec<String> {
        let trimmed = self.key.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            if let Ok(keys) = serde_json::from_str::<Vec<String>>(trimmed) {
                return keys;
            }
            // Service-account documents, one per key.
            if let Ok(docs) = serde_json::from_str::<Vec<serde_json::Map<String, serde_json::Value>>>(trimmed) {
                return docs
                    .into_iter()
                    .map(|d| serde_json::Value::Object(d).to_string())
                    .collect();
            }
        }
        if trimmed.starts_with('{') {
            if let Ok(doc) = serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(trimmed) {
                return vec![serde_json::Value::Object(doc).to_string()];
            }
        }
        trimmed
            .split('\n')
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(|k| k.to_string())
            .collect()
    }

    pub fn is_multi_key(&self) -> bool {
        self.multi_key.is_multi_key
    }

    pub fn key_status(&self, index: usize) -> KeyStatus {
        self.multi_key
            .key_status
            .get(&index)
            .copied()
            .unwrap_or(KeyStatus::Enabled)
    }

    pub fn enabled_key_indices(&self) -> Vec<usize> {
        (0..self.parse_keys().len())
            .filter(|i| self.key_status(*i) == KeyStatus::Enabled)
            .collect()
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    pub fn masked_key(&self, index: usize) -> String {
        self.parse_keys()
            .get(index)
            .map(|k| mask_key(k))
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn key_views(&self) -> Vec<KeyView> {
        self.parse_keys()
            .iter()
            .enumerate()
            .map(|(index, key)| {
                let status = self.key_status(index);
                KeyView {
                    index,
                    masked: mask_key(key),
                    fingerprint: key_fingerprint(key),
                    enabled: status == KeyStatus::Enabled,
                    status,
                    metadata: self
                        .multi_key
                        .key_metadata
                        .get(&index)
                        .cloned()
                        .unwrap_or_default(),
                }
            })
            .collect()
    }

    /// Pick the next usable key. Polling advances `polling_index`, so callers
    /// must hold the row for writing.
    pub fn select_key(&mut self, exclude: &[usize]) -> Result<(String, usize)> {
        let keys = self.parse_keys();
        if !self.is_multi_key() {
            return keys
                .into_iter()
                .next()
                .map(|k| (k, 0))
                .ok_or_else(|| ChannelError::NoKeys(format!("channel #{}", self.id)));
        }
        if keys.is_empty() {
            return Err(ChannelError::NoKeys(format!("channel #{}", self.id)));
        }
        let available: Vec<usize> = (0..keys.len())
            .filter(|i| self.key_status(*i) == KeyStatus::Enabled && !exclude.contains(i))
            .collect();
        if available.is_empty() {
            return Err(ChannelError::NoKeys(format!(
                "channel #{} has no enabled keys after excluding {:?}",
                self.id, exclude
            )));
        }
        let idx = match self.multi_key.selection {
            KeySelection::Random => *available
                .choose(&mut rand::thread_rng())
                .unwrap_or(&available[0]),
            KeySelection::Polling => {
                let start = if self.multi_key.polling_index < keys.len() {
                    self.multi_key.polling_index
                } else {
                    0
                };
                (0..keys.len())
                    .map(|i| (start + i) % keys.len())
                    .find(|i| available.contains(i))
                    .unwrap_or(available[0])
            }
        };
        self.multi_key.polling_index = (idx + 1) % keys.len();
        Ok((keys[idx].clone(), idx))
    }
}

/// Read-only view of one key of a channel.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct KeyView {
    pub index: usize,
    pub masked: String,
    pub fingerprint: String,
    pub enabled: bool,
    pub status: KeyStatus,
    pub metadata: KeyMetadata,
}

/// `sk-a***wxyz` style masking used in logs and notifications.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}***{tail}")
    } else {
        "***".to_string()
    }
}

/// Short stable identifier of a key that never reveals it.
pub fn key_fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..6])
}

/// Per-row atomic access to channel state.
#[async_trait::async_trait]
pub trait ChannelStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Channel>;

    async fn list(&self) -> Result<Vec<Channel>>;

    /// Compare-and-set of the channel status. Returns false when the current
    /// status did not match `expected`.
    async fn set_status(
        &self,
        id: i64,
        expected: ChannelStatus,
        new: ChannelStatus,
        info: Option<DisableInfo>,
    ) -> Result<bool>;

    /// Write one key's status. Returns false if it already had that status.
    async fn set_key_status(
        &self,
        id: i64,
        index: usize,
        status: KeyStatus,
        info: Option<DisableInfo>,
    ) -> Result<bool>;

    /// Select a key and advance the polling cursor in one step.
    async fn select_key(&self, id: i64, exclude: &[usize]) -> Result<(String, usize)>;

    async fn record_key_used(&self, id: i64, index: usize) -> Result<()>;
}

/// In-memory channel store.
#[derive(Clone, Default)]
pub struct MemoryChannelStore {
    channels: Arc<RwLock<HashMap<i64, Channel>>>,
}

impl MemoryChannelStore {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self {
            channels: Arc::new(RwLock::new(
                channels.into_iter().map(|c| (c.id, c)).collect(),
            )),
        }
    }

    pub fn insert(&self, channel: Channel) -> Result<()> {
        let mut guard = self
            .channels
            .write()
            .map_err(|e| ChannelError::Storage(format!("Lock error: {}", e)))?;
        guard.insert(channel.id, channel);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn get(&self, id: i64) -> Result<Channel> {
        let guard = self
            .channels
            .read()
            .map_err(|e| ChannelError::Storage(format!("Lock error: {}", e)))?;
        guard.get(&id).cloned().ok_or(ChannelError::NotFound(id))
    }

    async fn list(&self) -> Result<Vec<Channel>> {
        let guard = self
            .channels
            .read()
            .map_err(|e| ChannelError::Storage(format!("Lock error: {}", e)))?;
        let mut out: Vec<Channel> = guard.values().cloned().collect();
        out.sort_by_key(|c| c.id);
        Ok(out)
    }

    async fn set_status(
        &self,
        id: i64,
        expected: ChannelStatus,
        new: ChannelStatus,
        info: Option<DisableInfo>,
    ) -> Result<bool> {
        let mut guard = self
            .channels
            .write()
            .map_err(|e| ChannelError::Storage(format!("Lock error: {}", e)))?;
        let ch = guard.get_mut(&id).ok_or(ChannelError::NotFound(id))?;
        if ch.status != expected {
            return Ok(false);
        }
        ch.status = new;
        if new == ChannelStatus::Enabled {
            ch.disabled = None;
        } else if info.is_some() {
            ch.disabled = info;
        }
        Ok(true)
    }

    async fn set_key_status(
        &self,
        id: i64,
        index: usize,
        status: KeyStatus,
        info: Option<DisableInfo>,
    ) -> Result<bool> {
        let mut guard = self
            .channels
            .write()
            .map_err(|e| ChannelError::Storage(format!("Lock error: {}", e)))?;
        let ch = guard.get_mut(&id).ok_or(ChannelError::NotFound(id))?;
        if ch.key_status(index) == status {
            return Ok(false);
        }
        if status == KeyStatus::Enabled {
            ch.multi_key.key_status.remove(&index);
        } else {
            ch.multi_key.key_status.insert(index, status);
        }
        let meta = ch.multi_key.key_metadata.entry(index).or_default();
        meta.disabled = if status == KeyStatus::Enabled { None } else { info };
        Ok(true)
    }

    async fn select_key(&self, id: i64, exclude: &[usize]) -> Result<(String, usize)> {
        let mut guard = self
            .channels
            .write()
            .map_err(|e| ChannelError::Storage(format!("Lock error: {}", e)))?;
        let ch = guard.get_mut(&id).ok_or(ChannelError::NotFound(id))?;
        ch.select_key(exclude)
    }

    async fn record_key_used(&self, id: i64, index: usize) -> Result<()> {
        let mut guard = self
            .channels
            .write()
            .map_err(|e| ChannelError::Storage(format!("Lock error: {}", e)))?;
        let ch = guard.get_mut(&id).ok_or(ChannelError::NotFound(id))?;
        if ch.is_multi_key() {
            let meta = ch.multi_key.key_metadata.entry(index).or_default();
            meta.usage += 1;
            meta.last_used = unix_now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_parse_from_lines_or_json() {
        let ch = Channel::new(1, "a", ChannelType::OpenAi, "k1\n\n k2 \nk3\n");
        assert_eq!(ch.parse_keys(), vec!["k1", "k2", "k3"]);
        assert!(ch.is_multi_key());

        let ch = Channel::new(2, "b", ChannelType::OpenAi, r#"["x","y"]"#);
        assert_eq!(ch.parse_keys(), vec!["x", "y"]);

        let ch = Channel::new(3, "c", ChannelType::OpenAi, "only");
        assert!(!ch.is_multi_key());
    }

    #[test]
    fn service_account_documents_are_whole_keys() {
        let doc = "{\n  \"type\": \"service_account\",\n  \"project_id\": \"p1\"\n}\n";
        let ch = Channel::new(4, "v", ChannelType::VertexAi, doc);
        let keys = ch.parse_keys();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].contains("\"project_id\":\"p1\""));
        assert!(!ch.is_multi_key());

        let many = r#"[{"project_id":"p1"},{"project_id":"p2"}]"#;
        let ch = Channel::new(5, "v", ChannelType::VertexAi, many);
        assert_eq!(ch.parse_keys().len(), 2);
        assert!(ch.is_multi_key());
    }

    #[test]
    fn polling_skips_disabled_and_excluded_keys() {
        let mut ch = Channel::new(1, "a", ChannelType::OpenAi, "k0\nk1\nk2");
        ch.multi_key.key_status.insert(1, KeyStatus::AutoDisabled);
        assert_eq!(ch.select_key(&[]).unwrap().1, 0);
        assert_eq!(ch.select_key(&[]).unwrap().1, 2);
        assert_eq!(ch.select_key(&[]).unwrap().1, 0);
        assert_eq!(ch.select_key(&[0]).unwrap().1, 2);
        assert!(ch.select_key(&[0, 2]).is_err());
    }

    #[test]
    fn random_selection_only_returns_enabled_keys() {
        let mut ch = Channel::new(1, "a", ChannelType::OpenAi, "k0\nk1\nk2");
        ch.multi_key.selection = KeySelection::Random;
        ch.multi_key.key_status.insert(0, KeyStatus::ManuallyDisabled);
        ch.multi_key.key_status.insert(2, KeyStatus::AutoDisabled);
        for _ in 0..10 {
            assert_eq!(ch.select_key(&[]).unwrap(), ("k1".to_string(), 1));
        }
    }

    #[test]
    fn masking_hides_the_middle() {
        assert_eq!(mask_key("sk-abcdefghijkl"), "sk-a***ijkl");
        assert_eq!(mask_key("short"), "***");
        assert_eq!(key_fingerprint("sk-abc").len(), 12);
    }

    #[tokio::test]
    async fn set_status_is_compare_and_set() {
        let store = MemoryChannelStore::new(vec![Channel::new(7, "c", ChannelType::Anthropic, "k")]);
        let info = DisableInfo::new("status 401", "claude", Some(401));
        assert!(store
            .set_status(7, ChannelStatus::Enabled, ChannelStatus::AutoDisabled, Some(info.clone()))
            .await
            .unwrap());
        assert!(!store
            .set_status(7, ChannelStatus::Enabled, ChannelStatus::AutoDisabled, Some(info))
            .await
            .unwrap());
        let ch = store.get(7).await.unwrap();
        assert_eq!(ch.status, ChannelStatus::AutoDisabled);
        assert_eq!(ch.disabled.unwrap().status_code, Some(401));
    }

    #[tokio::test]
    async fn key_status_write_reports_change() {
        let store = MemoryChannelStore::new(vec![Channel::new(1, "m", ChannelType::OpenAi, "a\nb")]);
        assert!(store
            .set_key_status(1, 1, KeyStatus::AutoDisabled, None)
            .await
            .unwrap());
        assert!(!store
            .set_key_status(1, 1, KeyStatus::AutoDisabled, None)
            .await
            .unwrap());
        assert_eq!(store.get(1).await.unwrap().enabled_key_indices(), vec![0]);
    }
}
