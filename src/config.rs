//! Gateway configuration.
//!
//! An optional YAML (or JSON) file describes channels, users, tokens, ratio
//! overrides, the health policy and notification webhooks. `RELAYIUM_*`
//! environment variables override the scalar settings on top of the file.
//!
//! ```yaml
//! ledger: "sled:./data/ledger.db"
//! channels:
//!   - id: 1
//!     name: anthropic-main
//!     type: anthropic
//!     key: "sk-ant-1\nsk-ant-2"
//!     models: [claude-3-5-sonnet-20241022]
//! users:
//!   - id: alice
//!     balance: 500000
//! tokens:
//!   - key: sk-relay-alice
//!     user_id: alice
//!     channel_ratios: "{1:0.8}"
//! ```

use crate::channel::Channel;
use crate::cost::{parse_channel_type_ratios, RatioTables};
use crate::health::HealthPolicy;
use crate::ledger::{LedgerError, LedgerStore, DEFAULT_TRUST_MULTIPLE};
use crate::ledger_memory::MemoryLedgerStore;
use crate::ledger_redis::RedisLedgerStore;
use crate::ledger_sled::SledLedgerStore;
use crate::notify::DEFAULT_QUEUE_CAPACITY;
use crate::util::{env_flag, env_parse, env_string};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("ledger backend: {0}")]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Tokenizer(#[from] crate::tokenizer::TokenizerError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserConfig {
    pub id: String,
    #[serde(default)]
    pub balance: i64,
}

fn default_group() -> String {
    "default".to_string()
}

/// A client API token as it appears in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenConfig {
    /// The bearer value clients send.
    pub key: String,
    /// Defaults to the key itself.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub user_id: String,
    #[serde(default = "default_group")]
    pub group: String,
    /// Remaining token quota; absent means unlimited.
    #[serde(default)]
    pub quota: Option<i64>,
    /// Per-channel ratio overrides such as `{41:0.2,42:0.6}`.
    #[serde(default)]
    pub channel_ratios: String,
}

impl TokenConfig {
    pub fn token_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.key)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.token_id())
    }

    pub fn parsed_channel_ratios(&self) -> HashMap<i64, f64> {
        parse_channel_type_ratios(&self.channel_ratios)
    }
}

/// Where balances and consume logs live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerBackend {
    Memory,
    /// `None` uses `RELAYIUM_LEDGER_SLED_PATH` or its default.
    Sled(Option<PathBuf>),
    Redis(String),
}

impl LedgerBackend {
    /// `memory`, `sled`, `sled:<path>` or a `redis://` / `rediss://` URL.
    pub fn parse(spec: &str) -> Result<Self> {
        let s = spec.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("memory") {
            return Ok(LedgerBackend::Memory);
        }
        if s.starts_with("redis://") || s.starts_with("rediss://") {
            return Ok(LedgerBackend::Redis(s.to_string()));
        }
        if s.eq_ignore_ascii_case("sled") {
            return Ok(LedgerBackend::Sled(None));
        }
        if let Some(path) = s.strip_prefix("sled:") {
            if path.trim().is_empty() {
                return Err(ConfigError::Invalid("sled: needs a path".into()));
            }
            return Ok(LedgerBackend::Sled(Some(PathBuf::from(path.trim()))));
        }
        Err(ConfigError::Invalid(format!("unknown ledger backend {:?}", s)))
    }

    pub fn open(&self) -> Result<Arc<dyn LedgerStore>> {
        Ok(match self {
            LedgerBackend::Memory => Arc::new(MemoryLedgerStore::default()),
            LedgerBackend::Sled(Some(path)) => Arc::new(SledLedgerStore::open(path)?),
            LedgerBackend::Sled(None) => Arc::new(SledLedgerStore::open_default()?),
            LedgerBackend::Redis(url) => Arc::new(RedisLedgerStore::connect_url(url)?),
        })
    }
}

fn default_ledger() -> String {
    "memory".to_string()
}

fn default_metrics_interval() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_trust_multiple() -> i64 {
    DEFAULT_TRUST_MULTIPLE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub bind_addr: Option<String>,
    #[serde(default = "default_ledger")]
    pub ledger: String,
    #[serde(default = "default_trust_multiple")]
    pub trust_multiple: i64,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
    #[serde(default)]
    pub ratios: RatioTables,
    #[serde(default)]
    pub health: HealthPolicy,
    #[serde(default)]
    pub webhooks: Vec<String>,
    #[serde(default = "default_queue_capacity")]
    pub notify_queue_capacity: usize,
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            ledger: default_ledger(),
            trust_multiple: DEFAULT_TRUST_MULTIPLE,
            channels: Vec::new(),
            users: Vec::new(),
            tokens: Vec::new(),
            ratios: RatioTables::default(),
            health: HealthPolicy::default(),
            webhooks: Vec::new(),
            notify_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            metrics_interval_secs: default_metrics_interval(),
        }
    }
}

impl RelayConfig {
    /// File (when given, else `RELAYIUM_CONFIG`), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env_string("RELAYIUM_CONFIG").map(PathBuf::from));
        let mut cfg = match path {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cfg = Self::from_yaml(&text)?;
        tracing::info!(
            path = %path.display(),
            channels = cfg.channels.len(),
            tokens = cfg.tokens.len(),
            "loaded config file"
        );
        Ok(cfg)
    }

    /// Parse YAML or JSON.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut cfg: RelayConfig = serde_yaml::from_str(text)?;
        for ch in &mut cfg.channels {
            ch.multi_key.is_multi_key = ch.parse_keys().len() > 1;
        }
        Ok(cfg)
    }

    pub fn apply_env(&mut self) {
        if let Some(v) = env_string("RELAYIUM_BIND_ADDR") {
            self.bind_addr = Some(v);
        }
        if let Some(v) = env_string("RELAYIUM_LEDGER") {
            self.ledger = v;
        }
        if let Some(v) = env_parse("RELAYIUM_TRUST_MULTIPLE") {
            self.trust_multiple = v;
        }
        if let Some(v) = env_flag("RELAYIUM_AUTO_DISABLE") {
            self.health.auto_disable = v;
        }
        if let Some(v) = env_flag("RELAYIUM_AUTO_ENABLE") {
            self.health.auto_enable = v;
        }
        if let Some(v) = env_flag("RELAYIUM_DISABLE_ON_RATE_LIMIT") {
            self.health.disable_on_rate_limit = v;
        }
        if let Some(v) = env_string("RELAYIUM_DISABLE_KEYWORDS") {
            // Comma separated in env form.
            self.health.keywords = v.replace(',', "\n");
        }
        if let Some(v) = env_parse("RELAYIUM_SUCCESS_WINDOW") {
            self.health.success_window = v;
        }
        if let Some(v) = env_parse("RELAYIUM_SUCCESS_THRESHOLD") {
            self.health.success_threshold = v;
        }
        if let Some(v) = env_string("RELAYIUM_WEBHOOK_URLS") {
            self.webhooks = v
                .split(',')
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect();
        }
        if let Some(v) = env_parse("RELAYIUM_NOTIFY_QUEUE_CAPACITY") {
            self.notify_queue_capacity = v;
        }
        if let Some(v) = env_parse("RELAYIUM_METRICS_INTERVAL_SECONDS") {
            self.metrics_interval_secs = v;
        }
        if let Some(v) = env_parse("RELAYIUM_QUOTA_PER_UNIT") {
            self.ratios.quota_per_unit = v;
        }
        if let Some(v) = env_parse("RELAYIUM_DEFAULT_MODEL_RATIO") {
            self.ratios.default_model_ratio = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for ch in &self.channels {
            if !ids.insert(ch.id) {
                return Err(ConfigError::Invalid(format!("duplicate channel id {}", ch.id)));
            }
            if ch.parse_keys().is_empty() {
                return Err(ConfigError::Invalid(format!("channel {} has no key", ch.id)));
            }
        }
        let users: HashSet<&str> = self.users.iter().map(|u| u.id.as_str()).collect();
        let mut keys = HashSet::new();
        for t in &self.tokens {
            if !users.contains(t.user_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "token {} references unknown user {}",
                    t.display_name(),
                    t.user_id
                )));
            }
            if !keys.insert(t.key.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate token key for {}",
                    t.display_name()
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.health.success_threshold) {
            return Err(ConfigError::Invalid("success_threshold must be within 0..=1".into()));
        }
        LedgerBackend::parse(&self.ledger)?;
        Ok(())
    }

    pub fn ledger_backend(&self) -> Result<LedgerBackend> {
        LedgerBackend::parse(&self.ledger)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.max(1))
    }

    /// Write configured balances into the store. Existing users keep theirs
    /// when the store is persistent and already knows them.
    pub async fn seed_ledger(&self, store: &dyn LedgerStore) -> Result<()> {
        for u in &self.users {
            match store.user_balance(&u.id).await {
                Ok(_) => {}
                Err(LedgerError::UnknownUser(_)) => store.set_user_balance(&u.id, u.balance).await?,
                Err(e) => return Err(e.into()),
            }
        }
        for t in &self.tokens {
            if let Some(q) = t.quota {
                if store.token_balance(t.token_id()).await?.is_none() {
                    store.set_token_balance(t.token_id(), Some(q)).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelType;

    const SAMPLE: &str = r#"
ledger: memory
channels:
  - id: 1
    name: anthropic-main
    type: anthropic
    key: "sk-ant-1\nsk-ant-2"
    models: [claude-3-5-sonnet-20241022]
  - id: 2
    name: openai
    type: open_ai
    key: sk-openai
users:
  - id: alice
    balance: 1000
tokens:
  - key: sk-relay-alice
    user_id: alice
    quota: 50
    channel_ratios: "{1:0.8}"
health:
  disable_on_rate_limit: true
  keywords: |
    organization has been disabled
"#;

    #[test]
    fn parses_yaml_file_shape() {
        let cfg = RelayConfig::from_yaml(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.channels.len(), 2);
        assert_eq!(cfg.channels[0].channel_type, ChannelType::Anthropic);
        assert!(cfg.channels[0].multi_key.is_multi_key);
        assert!(!cfg.channels[1].multi_key.is_multi_key);
        assert_eq!(cfg.tokens[0].token_id(), "sk-relay-alice");
        assert_eq!(cfg.tokens[0].group, "default");
        assert_eq!(cfg.tokens[0].parsed_channel_ratios().get(&1), Some(&0.8));
        assert!(cfg.health.disable_on_rate_limit);
        assert!(cfg.health.auto_disable);
        assert_eq!(cfg.health.keyword_list(), vec!["organization has been disabled"]);
        assert_eq!(cfg.metrics_interval_secs, 60);
    }

    #[test]
    fn json_is_accepted() {
        let cfg = RelayConfig::from_yaml(
            r#"{"channels":[{"id":3,"name":"g","type":"gemini","key":"AIza"}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.channels[0].channel_type, ChannelType::Gemini);
        assert_eq!(cfg.ledger, "memory");
    }

    #[test]
    fn rejects_tokens_for_unknown_users() {
        let cfg = RelayConfig::from_yaml(
            "tokens:\n  - key: k\n    user_id: ghost\n",
        )
        .unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_duplicate_channel_ids() {
        let cfg = RelayConfig::from_yaml(
            "channels:\n  - {id: 1, name: a, type: open_ai, key: x}\n  - {id: 1, name: b, type: open_ai, key: y}\n",
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ledger_backend_specs() {
        assert_eq!(LedgerBackend::parse("memory").unwrap(), LedgerBackend::Memory);
        assert_eq!(LedgerBackend::parse("").unwrap(), LedgerBackend::Memory);
        assert_eq!(
            LedgerBackend::parse("sled:/tmp/l.db").unwrap(),
            LedgerBackend::Sled(Some(PathBuf::from("/tmp/l.db")))
        );
        assert_eq!(
            LedgerBackend::parse("redis://127.0.0.1/").unwrap(),
            LedgerBackend::Redis("redis://127.0.0.1/".into())
        );
        assert_eq!(LedgerBackend::parse("sled").unwrap(), LedgerBackend::Sled(None));
        assert!(LedgerBackend::parse("sled:").is_err());
        assert!(LedgerBackend::parse("postgres://x").is_err());
    }

    #[tokio::test]
    async fn seeding_keeps_existing_balances() {
        let cfg = RelayConfig::from_yaml(SAMPLE).unwrap();
        let store = MemoryLedgerStore::default();
        store.set_user_balance("alice", 7).await.unwrap();
        cfg.seed_ledger(&store).await.unwrap();
        assert_eq!(store.user_balance("alice").await.unwrap(), 7);
        assert_eq!(store.token_balance("sk-relay-alice").await.unwrap(), Some(50));
    }

    #[test]
    fn sled_backend_opens_in_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LedgerBackend::Sled(Some(dir.path().join("ledger.db")));
        assert!(backend.open().is_ok());
    }
}
