//! Channel Health Monitor
//!
//! Classifies relay failures and walks channels and keys through their
//! enabled/disabled states:
//!
//! - single-key channel, disabling failure → channel `AutoDisabled`
//! - multi-key channel, disabling failure → that key `AutoDisabled`; the
//!   channel follows only once no key is left enabled
//! - success on an `AutoDisabled` channel with auto-enable on → `Enabled`
//!
//! Nothing here is ever deleted, and `ManuallyDisabled` is never touched.

use crate::channel::{
    Channel, ChannelError, ChannelStatus, ChannelStore, DisableInfo, KeyStatus,
};
use crate::error::RelayError;
use crate::notify::{Notification, Notifier};
use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Error types that always mean the credential is unusable.
const DISABLING_TYPES: [&str; 4] = [
    "insufficient_quota",
    "authentication_error",
    "permission_error",
    "forbidden",
];

const DISABLING_CODES: [&str; 2] = ["invalid_api_key", "account_deactivated"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// Global switch; channels also carry their own `auto_disable` flag.
    pub auto_disable: bool,
    pub auto_enable: bool,
    pub disable_on_rate_limit: bool,
    /// Newline separated, matched case-insensitively against message, type and code.
    pub keywords: String,
    /// Outcomes per success-rate window; 0 turns the window off.
    pub success_window: usize,
    /// A full window below this success rate disables.
    pub success_threshold: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            auto_disable: true,
            auto_enable: true,
            disable_on_rate_limit: false,
            keywords: String::new(),
            success_window: 0,
            success_threshold: 0.5,
        }
    }
}

impl HealthPolicy {
    pub fn keyword_list(&self) -> Vec<String> {
        self.keywords
            .lines()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(|k| k.to_string())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Auth,
    RateLimit,
    Quota,
    Keyword,
    SuccessRate,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub should_disable: bool,
    pub category: Category,
    pub reason: String,
    pub status_code: Option<u16>,
}

impl Verdict {
    fn keep(category: Category, reason: String) -> Self {
        Self {
            should_disable: false,
            category,
            reason,
            status_code: None,
        }
    }

    fn disable(category: Category, reason: String) -> Self {
        Self {
            should_disable: true,
            category,
            reason,
            status_code: None,
        }
    }

    fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }
}

/// Case-insensitive substring matcher over the admin keyword list.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    set: Option<RegexSet>,
}

impl KeywordMatcher {
    pub fn new(keywords: &[String]) -> Self {
        if keywords.is_empty() {
            return Self { set: None };
        }
        let patterns: Vec<String> = keywords.iter().map(|k| regex::escape(k)).collect();
        let set = match RegexSetBuilder::new(&patterns).case_insensitive(true).build() {
            Ok(set) => Some(set),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring keyword list");
                None
            }
        };
        Self { set }
    }

    pub fn matches(&self, haystack: &str) -> bool {
        self.set.as_ref().map(|s| s.is_match(haystack)).unwrap_or(false)
    }
}

/// Decide whether a failure should take the credential out of rotation.
pub fn classify(err: &RelayError, policy: &HealthPolicy, keywords: &KeywordMatcher) -> Verdict {
    classify_inner(err, policy, keywords).with_status(err.status)
}

fn classify_inner(err: &RelayError, policy: &HealthPolicy, keywords: &KeywordMatcher) -> Verdict {
    let reason = format!("status {}: {}", err.status, err.message());
    if err.local {
        return Verdict::keep(Category::None, reason);
    }
    if err.status == 401 || err.status == 403 {
        return Verdict::disable(Category::Auth, reason);
    }
    if err.status == 429 {
        return if policy.disable_on_rate_limit {
            Verdict::disable(Category::RateLimit, reason)
        } else {
            Verdict::keep(Category::RateLimit, reason)
        };
    }
    let error_type = err.error_type();
    let code = err.code().unwrap_or_default();
    if DISABLING_TYPES.contains(&error_type) || DISABLING_CODES.contains(&code) {
        let category = if error_type == "insufficient_quota" {
            Category::Quota
        } else {
            Category::Auth
        };
        return Verdict::disable(category, reason);
    }
    if keywords.matches(err.message()) || keywords.matches(error_type) || keywords.matches(code) {
        return Verdict::disable(Category::Keyword, reason);
    }
    Verdict::keep(Category::None, reason)
}

/// Fixed-size window of recent outcomes.
#[derive(Debug, Clone)]
pub struct SuccessWindow {
    size: usize,
    outcomes: VecDeque<bool>,
}

impl SuccessWindow {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            outcomes: VecDeque::with_capacity(size),
        }
    }

    /// Record an outcome; returns the success rate once the window is full.
    pub fn record(&mut self, ok: bool) -> Option<f64> {
        if self.size == 0 {
            return None;
        }
        if self.outcomes.len() == self.size {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(ok);
        if self.outcomes.len() < self.size {
            return None;
        }
        let successes = self.outcomes.iter().filter(|o| **o).count();
        Some(successes as f64 / self.size as f64)
    }

    pub fn reset(&mut self) {
        self.outcomes.clear();
    }
}

/// What the monitor did in response to an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    None,
    /// Disabling was warranted but the channel's policy flag is off.
    Suppressed,
    KeyDisabled { channel_disabled: bool },
    ChannelDisabled,
    KeyEnabled,
    ChannelEnabled,
}

pub enum Outcome<'a> {
    Success,
    Failure(&'a RelayError),
}

pub struct HealthMonitor {
    store: Arc<dyn ChannelStore>,
    notifier: Arc<Notifier>,
    policy: HealthPolicy,
    keywords: KeywordMatcher,
    windows: Mutex<HashMap<(i64, usize), SuccessWindow>>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn ChannelStore>, notifier: Arc<Notifier>, policy: HealthPolicy) -> Self {
        let keywords = KeywordMatcher::new(&policy.keyword_list());
        Self {
            store,
            notifier,
            policy,
            keywords,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    pub fn classify(&self, err: &RelayError) -> Verdict {
        classify(err, &self.policy, &self.keywords)
    }

    pub async fn record_outcome(
        &self,
        channel_id: i64,
        key_index: usize,
        model: &str,
        outcome: Outcome<'_>,
    ) -> Result<HealthAction, ChannelError> {
        let ok = matches!(outcome, Outcome::Success);
        let window_rate = self.record_window(channel_id, key_index, ok);

        let verdict = match outcome {
            Outcome::Success => {
                if let Some(rate) = window_rate.filter(|r| *r < self.policy.success_threshold) {
                    Verdict::disable(
                        Category::SuccessRate,
                        format!("success rate {:.2} below {:.2}", rate, self.policy.success_threshold),
                    )
                } else {
                    return self.maybe_enable(channel_id, key_index).await;
                }
            }
            Outcome::Failure(err) => {
                let mut verdict = self.classify(err);
                if !verdict.should_disable {
                    if let Some(rate) = window_rate.filter(|r| *r < self.policy.success_threshold) {
                        verdict = Verdict::disable(
                            Category::SuccessRate,
                            format!(
                                "success rate {:.2} below {:.2}, last error {}",
                                rate, self.policy.success_threshold, verdict.reason
                            ),
                        )
                        .with_status(err.status);
                    }
                }
                verdict
            }
        };
        if !verdict.should_disable {
            return Ok(HealthAction::None);
        }

        let channel = self.store.get(channel_id).await?;
        if !(self.policy.auto_disable && channel.auto_disable) {
            tracing::warn!(
                channel_id,
                key_index,
                reason = %verdict.reason,
                "channel failure would disable, auto-disable is off"
            );
            return Ok(HealthAction::Suppressed);
        }
        self.reset_window(channel_id, key_index);

        let status_code = verdict.status_code;
        if channel.is_multi_key() {
            self.disable_key(&channel, key_index, model, &verdict, status_code)
                .await
        } else {
            self.disable_channel(&channel, model, &verdict.reason, status_code)
                .await
        }
    }

    async fn disable_key(
        &self,
        channel: &Channel,
        key_index: usize,
        model: &str,
        verdict: &Verdict,
        status_code: Option<u16>,
    ) -> Result<HealthAction, ChannelError> {
        let info = DisableInfo::new(verdict.reason.clone(), model, status_code);
        let changed = self
            .store
            .set_key_status(channel.id, key_index, KeyStatus::AutoDisabled, Some(info))
            .await?;
        if changed {
            tracing::warn!(
                channel_id = channel.id,
                key_index,
                reason = %verdict.reason,
                "key auto-disabled"
            );
            self.notifier.notify(Notification::KeyDisabled {
                channel_id: channel.id,
                channel_name: channel.name.clone(),
                key_index,
                masked_key: channel.masked_key(key_index),
                reason: verdict.reason.clone(),
                model: model.to_string(),
                status_code,
            });
        }
        let channel_disabled = self.recheck_all_keys(channel.id, model).await?;
        Ok(HealthAction::KeyDisabled { channel_disabled })
    }

    async fn disable_channel(
        &self,
        channel: &Channel,
        model: &str,
        reason: &str,
        status_code: Option<u16>,
    ) -> Result<HealthAction, ChannelError> {
        let info = DisableInfo::new(reason, model, status_code);
        let changed = self
            .store
            .set_status(
                channel.id,
                ChannelStatus::Enabled,
                ChannelStatus::AutoDisabled,
                Some(info),
            )
            .await?;
        if !changed {
            return Ok(HealthAction::None);
        }
        tracing::warn!(channel_id = channel.id, reason, "channel auto-disabled");
        self.notifier.notify(Notification::ChannelDisabled {
            channel_id: channel.id,
            channel_name: channel.name.clone(),
            reason: reason.to_string(),
            model: model.to_string(),
        });
        Ok(HealthAction::ChannelDisabled)
    }

    /// Re-read the channel and disable it if no key is left enabled. The
    /// read and the status write are separate row operations; a key enabled
    /// in between is not seen. Returns true if this call disabled the channel.
    pub async fn recheck_all_keys(&self, channel_id: i64, model: &str) -> Result<bool, ChannelError> {
        let channel = self.store.get(channel_id).await?;
        if !channel.enabled_key_indices().is_empty() || !channel.is_enabled() {
            return Ok(false);
        }
        let action = self
            .disable_channel(&channel, model, "all keys are disabled", None)
            .await?;
        Ok(action == HealthAction::ChannelDisabled)
    }

    async fn maybe_enable(&self, channel_id: i64, key_index: usize) -> Result<HealthAction, ChannelError> {
        if !self.policy.auto_enable {
            return Ok(HealthAction::None);
        }
        let channel = self.store.get(channel_id).await?;
        let mut action = HealthAction::None;
        if channel.is_multi_key() && channel.key_status(key_index) == KeyStatus::AutoDisabled {
            if self
                .store
                .set_key_status(channel_id, key_index, KeyStatus::Enabled, None)
                .await?
            {
                tracing::info!(channel_id, key_index, "key re-enabled");
                action = HealthAction::KeyEnabled;
            }
        }
        if channel.status == ChannelStatus::AutoDisabled
            && self
                .store
                .set_status(channel_id, ChannelStatus::AutoDisabled, ChannelStatus::Enabled, None)
                .await?
        {
            tracing::info!(channel_id, "channel re-enabled");
            self.notifier.notify(Notification::ChannelEnabled {
                channel_id,
                channel_name: channel.name.clone(),
            });
            action = HealthAction::ChannelEnabled;
        }
        Ok(action)
    }

    fn record_window(&self, channel_id: i64, key_index: usize, ok: bool) -> Option<f64> {
        if self.policy.success_window == 0 {
            return None;
        }
        let mut windows = match self.windows.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        windows
            .entry((channel_id, key_index))
            .or_insert_with(|| SuccessWindow::new(self.policy.success_window))
            .record(ok)
    }

    fn reset_window(&self, channel_id: i64, key_index: usize) {
        if let Ok(mut windows) = self.windows.lock() {
            if let Some(w) = windows.get_mut(&(channel_id, key_index)) {
                w.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelType, MemoryChannelStore};
    use crate::notify::tests::CollectingSink;

    fn err(status: u16, kind: &str, code: &str, msg: &str) -> RelayError {
        RelayError::new(status, kind, code, msg)
    }

    fn classify_default(e: &RelayError) -> Verdict {
        classify(e, &HealthPolicy::default(), &KeywordMatcher::new(&[]))
    }

    #[test]
    fn auth_failures_disable_and_name_the_status() {
        let v = classify_default(&err(401, "invalid_request_error", "invalid_api_key", "Incorrect API key"));
        assert!(v.should_disable);
        assert_eq!(v.category, Category::Auth);
        assert!(v.reason.contains("401"));
    }

    #[test]
    fn rate_limits_disable_only_when_configured() {
        let e = err(429, "rate_limit_error", "rate_limited", "slow down");
        assert!(!classify_default(&e).should_disable);
        let policy = HealthPolicy {
            disable_on_rate_limit: true,
            ..Default::default()
        };
        let v = classify(&e, &policy, &KeywordMatcher::new(&[]));
        assert!(v.should_disable);
        assert_eq!(v.category, Category::RateLimit);
    }

    #[test]
    fn quota_types_and_keywords_disable() {
        let v = classify_default(&err(400, "insufficient_quota", "x", "You exceeded your quota"));
        assert_eq!(v.category, Category::Quota);

        let policy = HealthPolicy {
            keywords: "Your credit balance is too low\n\n  organization has been DISABLED ".into(),
            ..Default::default()
        };
        let kw = KeywordMatcher::new(&policy.keyword_list());
        let v = classify(&err(400, "invalid_request_error", "x", "This organization has been disabled."), &policy, &kw);
        assert!(v.should_disable);
        assert_eq!(v.category, Category::Keyword);
        assert!(!classify(&err(500, "server_error", "x", "boom"), &policy, &kw).should_disable);
    }

    #[test]
    fn local_errors_never_disable() {
        let e = RelayError::local("bad request body", "convert_request_failed", 401);
        assert!(!classify_default(&e).should_disable);
    }

    #[test]
    fn window_reports_only_when_full() {
        let mut w = SuccessWindow::new(4);
        assert_eq!(w.record(true), None);
        assert_eq!(w.record(false), None);
        assert_eq!(w.record(false), None);
        assert_eq!(w.record(false), Some(0.25));
        assert_eq!(w.record(true), Some(0.25));
    }

    fn monitor(channels: Vec<Channel>, policy: HealthPolicy) -> (HealthMonitor, Arc<MemoryChannelStore>, Arc<Notifier>) {
        let store = Arc::new(MemoryChannelStore::new(channels));
        let notifier = Arc::new(Notifier::start(vec![Arc::new(CollectingSink::default())], 16));
        let m = HealthMonitor::new(store.clone(), notifier.clone(), policy);
        (m, store, notifier)
    }

    #[tokio::test]
    async fn single_key_channel_is_disabled_with_reason() {
        let (m, store, _) = monitor(
            vec![Channel::new(1, "solo", ChannelType::Anthropic, "sk-ant-xyz")],
            HealthPolicy::default(),
        );
        let e = err(401, "authentication_error", "authentication_error", "invalid x-api-key");
        let action = m.record_outcome(1, 0, "claude-3-haiku", Outcome::Failure(&e)).await.unwrap();
        assert_eq!(action, HealthAction::ChannelDisabled);
        let ch = store.get(1).await.unwrap();
        assert_eq!(ch.status, ChannelStatus::AutoDisabled);
        let info = ch.disabled.unwrap();
        assert!(info.reason.contains("401"));
        assert_eq!(info.model, "claude-3-haiku");
        assert_eq!(info.status_code, Some(401));
    }

    #[tokio::test]
    async fn policy_flag_off_only_logs() {
        let mut ch = Channel::new(1, "solo", ChannelType::OpenAi, "sk");
        ch.auto_disable = false;
        let (m, store, _) = monitor(vec![ch], HealthPolicy::default());
        let e = err(401, "x", "invalid_api_key", "bad key");
        let action = m.record_outcome(1, 0, "gpt-4o", Outcome::Failure(&e)).await.unwrap();
        assert_eq!(action, HealthAction::Suppressed);
        assert!(store.get(1).await.unwrap().is_enabled());
    }

    #[tokio::test]
    async fn multi_key_failure_disables_only_that_key() {
        let (m, store, _) = monitor(
            vec![Channel::new(2, "pool", ChannelType::OpenAi, "k0\nk1\nk2")],
            HealthPolicy::default(),
        );
        let e = err(401, "x", "invalid_api_key", "bad key");
        let action = m.record_outcome(2, 1, "gpt-4o", Outcome::Failure(&e)).await.unwrap();
        assert_eq!(action, HealthAction::KeyDisabled { channel_disabled: false });
        let ch = store.get(2).await.unwrap();
        assert!(ch.is_enabled());
        assert_eq!(ch.enabled_key_indices(), vec![0, 2]);
        let meta = &ch.multi_key.key_metadata[&1];
        assert_eq!(meta.disabled.as_ref().unwrap().status_code, Some(401));

        m.record_outcome(2, 0, "gpt-4o", Outcome::Failure(&e)).await.unwrap();
        let last = m.record_outcome(2, 2, "gpt-4o", Outcome::Failure(&e)).await.unwrap();
        assert_eq!(last, HealthAction::KeyDisabled { channel_disabled: true });
        let ch = store.get(2).await.unwrap();
        assert_eq!(ch.status, ChannelStatus::AutoDisabled);
        assert!(!m.recheck_all_keys(2, "gpt-4o").await.unwrap());
    }

    #[tokio::test]
    async fn success_re_enables_auto_disabled_channel() {
        let (m, store, _) = monitor(
            vec![Channel::new(3, "solo", ChannelType::Gemini, "key")],
            HealthPolicy::default(),
        );
        let e = err(403, "PERMISSION_DENIED", "403", "denied");
        m.record_outcome(3, 0, "gemini-2.0-flash", Outcome::Failure(&e)).await.unwrap();
        assert!(!store.get(3).await.unwrap().is_enabled());
        let action = m.record_outcome(3, 0, "gemini-2.0-flash", Outcome::Success).await.unwrap();
        assert_eq!(action, HealthAction::ChannelEnabled);
        assert!(store.get(3).await.unwrap().is_enabled());
    }

    #[tokio::test]
    async fn manual_disable_is_left_alone() {
        let mut ch = Channel::new(4, "manual", ChannelType::OpenAi, "key");
        ch.status = ChannelStatus::ManuallyDisabled;
        let (m, store, _) = monitor(vec![ch], HealthPolicy::default());
        let action = m.record_outcome(4, 0, "gpt-4o", Outcome::Success).await.unwrap();
        assert_eq!(action, HealthAction::None);
        assert_eq!(store.get(4).await.unwrap().status, ChannelStatus::ManuallyDisabled);
    }

    #[tokio::test]
    async fn low_success_rate_disables() {
        let policy = HealthPolicy {
            success_window: 3,
            success_threshold: 0.5,
            ..Default::default()
        };
        let (m, store, _) = monitor(vec![Channel::new(5, "flaky", ChannelType::OpenAi, "key")], policy);
        let e = err(500, "server_error", "x", "boom");
        assert_eq!(m.record_outcome(5, 0, "m", Outcome::Failure(&e)).await.unwrap(), HealthAction::None);
        assert_eq!(m.record_outcome(5, 0, "m", Outcome::Success).await.unwrap(), HealthAction::None);
        let action = m.record_outcome(5, 0, "m", Outcome::Failure(&e)).await.unwrap();
        assert_eq!(action, HealthAction::ChannelDisabled);
        let reason = store.get(5).await.unwrap().disabled.unwrap().reason;
        assert!(reason.contains("success rate 0.33"));
    }
}
