//! Two-phase quota ledger.
//!
//! A request first reserves an upper-bound estimate against the user's and
//! token's balances, then settles exactly once: `reconcile` charges the actual
//! cost (applying only the difference), `rollback` returns the whole hold.
//! For every reservation `refund + actual_charge == reserved`.
//!
//! Users with a balance far above the estimate are trusted: nothing is held up
//! front and the full cost is charged at reconcile time.
//!
//! Storage is behind [`LedgerStore`]; see `ledger_memory`, `ledger_sled` and
//! `ledger_redis` for the backends.

use crate::error::RelayError;
use crate::models::chat::unix_now;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_TRUST_MULTIPLE: i64 = 100;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("user quota is not enough: need {needed}, have {available}")]
    InsufficientUserQuota { needed: i64, available: i64 },
    #[error("token quota is not enough: need {needed}, have {available}")]
    InsufficientTokenQuota { needed: i64, available: i64 },
    #[error("Unknown user: {0}")]
    UnknownUser(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

impl From<LedgerError> for RelayError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientUserQuota { .. } => {
                RelayError::local(err, "insufficient_user_quota", 403)
            }
            LedgerError::InsufficientTokenQuota { .. } => {
                RelayError::local(err, "insufficient_token_quota", 403)
            }
            LedgerError::UnknownUser(_) => RelayError::local(err, "invalid_user", 401),
            other => RelayError::local(other, "ledger_error", 500),
        }
    }
}

/// A hold placed before the upstream call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub user_id: String,
    pub token_id: String,
    /// Amount actually held; 0 when `trusted`.
    pub amount: i64,
    /// The estimate that was asked for.
    pub estimate: i64,
    pub trusted: bool,
    pub created_at: u64,
}

/// Result of settling a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub reservation_id: String,
    pub reserved: i64,
    pub actual: i64,
    /// `actual - reserved`, the amount taken (positive) or returned (negative)
    /// at settle time.
    pub delta: i64,
    /// False when the reservation had already been settled.
    pub applied: bool,
    pub settled_at: u64,
}

impl Settlement {
    pub fn refund(&self) -> i64 {
        self.reserved - self.actual
    }
}

/// One immutable consumption record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConsumeLog {
    pub request_id: String,
    pub created_at: u64,
    pub user_id: String,
    pub token_id: String,
    pub token_name: String,
    pub channel_id: i64,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub quota: i64,
    pub model_ratio: f64,
    pub completion_ratio: f64,
    pub group_ratio: f64,
    pub channel_ratio: f64,
    pub duration_ms: u64,
    pub is_stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_token_ms: Option<u64>,
    #[serde(default)]
    pub cache_creation_5m_tokens: u64,
    #[serde(default)]
    pub cache_creation_1h_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub content: String,
}

/// Lifetime counters for a user or channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub used_quota: i64,
    pub request_count: u64,
}

/// Balance and counter storage. Every method is a single-key atomic operation.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    async fn user_balance(&self, user_id: &str) -> Result<i64>;

    /// Add `delta` to the user's balance and return the new balance.
    async fn adjust_user(&self, user_id: &str, delta: i64) -> Result<i64>;

    /// `None` means the token has no limit.
    async fn token_balance(&self, token_id: &str) -> Result<Option<i64>>;

    /// No-op for unlimited tokens.
    async fn adjust_token(&self, token_id: &str, delta: i64) -> Result<()>;

    /// Take `amount` from the user only if the balance covers it, in one
    /// atomic step. Returns the new balance; `InsufficientUserQuota` leaves
    /// the balance untouched.
    async fn try_debit_user(&self, user_id: &str, amount: i64) -> Result<i64>;

    /// Same for a limited token. Unlimited tokens succeed with `None`.
    async fn try_debit_token(&self, token_id: &str, amount: i64) -> Result<Option<i64>>;

    async fn set_user_balance(&self, user_id: &str, balance: i64) -> Result<()>;

    async fn set_token_balance(&self, token_id: &str, balance: Option<i64>) -> Result<()>;

    /// Bump used quota and request count for the user and the channel.
    async fn record_used(&self, user_id: &str, channel_id: i64, quota: i64) -> Result<()>;

    async fn user_usage(&self, user_id: &str) -> Result<UsageStats>;

    async fn channel_usage(&self, channel_id: i64) -> Result<UsageStats>;

    async fn append_log(&self, log: &ConsumeLog) -> Result<()>;

    async fn logs(&self, user_id: Option<&str>) -> Result<Vec<ConsumeLog>>;

    /// Mark a reservation settled. Returns false if it already was.
    async fn mark_settled(&self, reservation_id: &str) -> Result<bool>;

    /// Remove the marker again after a settlement that did not go through.
    async fn clear_settled(&self, reservation_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn LedgerStore>,
    trust_multiple: i64,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            trust_multiple: DEFAULT_TRUST_MULTIPLE,
        }
    }

    pub fn with_trust_multiple(mut self, multiple: i64) -> Self {
        self.trust_multiple = multiple;
        self
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Hold `estimate` against the user and token.
    pub async fn reserve(&self, user_id: &str, token_id: &str, estimate: i64) -> Result<Reservation> {
        let estimate = estimate.max(0);
        let balance = self.store.user_balance(user_id).await?;
        if balance <= 0 || balance < estimate {
            return Err(LedgerError::InsufficientUserQuota {
                needed: estimate,
                available: balance,
            });
        }
        let token_balance = self.store.token_balance(token_id).await?;
        if let Some(remain) = token_balance {
            if remain < estimate {
                return Err(LedgerError::InsufficientTokenQuota {
                    needed: estimate,
                    available: remain,
                });
            }
        }

        let mut reservation = Reservation {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            token_id: token_id.to_string(),
            amount: estimate,
            estimate,
            trusted: false,
            created_at: unix_now(),
        };

        // Plenty of headroom on both sides: skip the hold.
        let token_trusted = token_balance
            .map(|r| r > self.trust_multiple.saturating_mul(estimate))
            .unwrap_or(true);
        if balance > self.trust_multiple.saturating_mul(estimate) && token_trusted {
            reservation.amount = 0;
            reservation.trusted = true;
            tracing::debug!(user_id, balance, estimate, "trusted user, no quota held");
            return Ok(reservation);
        }
        if estimate == 0 {
            return Ok(reservation);
        }

        self.store.try_debit_user(user_id, estimate).await?;
        if let Err(e) = self.store.try_debit_token(token_id, estimate).await {
            if let Err(undo) = self.store.adjust_user(user_id, estimate).await {
                tracing::error!(user_id, estimate, error = %undo, "failed to undo user hold");
            }
            return Err(e);
        }
        tracing::debug!(reservation = %reservation.id, user_id, estimate, "quota reserved");
        Ok(reservation)
    }

    /// Charge the actual cost: apply `actual - reserved`, update counters and
    /// write the consumption log. Settling twice is a no-op.
    ///
    /// If the balance change fails the settlement marker is removed again,
    /// so the same reservation can still be reconciled or rolled back.
    /// Counter and log failures after the charge are logged only.
    pub async fn reconcile(
        &self,
        reservation: &Reservation,
        actual: i64,
        channel_id: i64,
        log: ConsumeLog,
    ) -> Result<Settlement> {
        let actual = actual.max(0);
        let mut settlement = Settlement {
            reservation_id: reservation.id.clone(),
            reserved: reservation.amount,
            actual,
            delta: actual - reservation.amount,
            applied: false,
            settled_at: unix_now(),
        };
        if !self.store.mark_settled(&reservation.id).await? {
            tracing::warn!(reservation = %reservation.id, "reservation already settled");
            return Ok(settlement);
        }
        if let Err(e) = self.apply_delta(reservation, settlement.delta).await {
            self.release(reservation).await;
            return Err(e);
        }
        settlement.applied = true;
        if actual > 0 {
            if let Err(e) = self
                .store
                .record_used(&reservation.user_id, channel_id, actual)
                .await
            {
                tracing::error!(reservation = %reservation.id, error = %e, "failed to record used quota");
            }
        }
        if let Err(e) = self.store.append_log(&log).await {
            tracing::error!(reservation = %reservation.id, quota = log.quota, error = %e, "failed to append consume log");
        }
        tracing::debug!(
            reservation = %reservation.id,
            reserved = reservation.amount,
            actual,
            delta = settlement.delta,
            "quota reconciled"
        );
        Ok(settlement)
    }

    /// Return the full hold. Settling twice is a no-op.
    pub async fn rollback(&self, reservation: &Reservation) -> Result<Settlement> {
        let mut settlement = Settlement {
            reservation_id: reservation.id.clone(),
            reserved: reservation.amount,
            actual: 0,
            delta: -reservation.amount,
            applied: false,
            settled_at: unix_now(),
        };
        if !self.store.mark_settled(&reservation.id).await? {
            return Ok(settlement);
        }
        if let Err(e) = self.apply_delta(reservation, settlement.delta).await {
            self.release(reservation).await;
            return Err(e);
        }
        settlement.applied = true;
        tracing::debug!(reservation = %reservation.id, refunded = reservation.amount, "quota rolled back");
        Ok(settlement)
    }

    /// Charge `delta` (negative refunds) to user and token. Either both move
    /// or neither does.
    async fn apply_delta(&self, reservation: &Reservation, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        self.store.adjust_user(&reservation.user_id, -delta).await?;
        if let Err(e) = self.store.adjust_token(&reservation.token_id, -delta).await {
            if let Err(undo) = self.store.adjust_user(&reservation.user_id, delta).await {
                tracing::error!(reservation = %reservation.id, delta, error = %undo, "failed to undo user adjustment");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn release(&self, reservation: &Reservation) {
        if let Err(e) = self.store.clear_settled(&reservation.id).await {
            tracing::error!(reservation = %reservation.id, error = %e, "failed to clear settlement marker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger_memory::MemoryLedgerStore;

    async fn ledger(user_balance: i64, token: Option<i64>) -> QuotaLedger {
        let store = MemoryLedgerStore::default();
        store.set_user_balance("u1", user_balance).await.unwrap();
        store.set_token_balance("t1", token).await.unwrap();
        QuotaLedger::new(Arc::new(store))
    }

    fn log(quota: i64) -> ConsumeLog {
        ConsumeLog {
            user_id: "u1".into(),
            token_id: "t1".into(),
            channel_id: 3,
            model: "gpt-4o".into(),
            quota,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reserve_then_reconcile_refunds_the_difference() {
        let ledger = ledger(1000, None).await;
        let r = ledger.reserve("u1", "t1", 50).await.unwrap();
        assert!(!r.trusted);
        assert_eq!(ledger.store().user_balance("u1").await.unwrap(), 950);

        let s = ledger.reconcile(&r, 30, 3, log(30)).await.unwrap();
        assert!(s.applied);
        assert_eq!(s.delta, -20);
        assert_eq!(s.refund() + s.actual, s.reserved);
        assert_eq!(ledger.store().user_balance("u1").await.unwrap(), 970);

        let used = ledger.store().user_usage("u1").await.unwrap();
        assert_eq!(used, UsageStats { used_quota: 30, request_count: 1 });
        assert_eq!(ledger.store().channel_usage(3).await.unwrap().used_quota, 30);
        assert_eq!(ledger.store().logs(Some("u1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rollback_restores_balance_and_token() {
        let ledger = ledger(1000, Some(500)).await;
        let r = ledger.reserve("u1", "t1", 120).await.unwrap();
        assert_eq!(ledger.store().token_balance("t1").await.unwrap(), Some(380));
        let s = ledger.rollback(&r).await.unwrap();
        assert_eq!(s.refund(), 120);
        assert_eq!(ledger.store().user_balance("u1").await.unwrap(), 1000);
        assert_eq!(ledger.store().token_balance("t1").await.unwrap(), Some(500));
        assert!(ledger.store().logs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn settling_twice_is_a_no_op() {
        let ledger = ledger(1000, None).await;
        let r = ledger.reserve("u1", "t1", 50).await.unwrap();
        ledger.reconcile(&r, 80, 3, log(80)).await.unwrap();
        assert_eq!(ledger.store().user_balance("u1").await.unwrap(), 920);

        let again = ledger.reconcile(&r, 80, 3, log(80)).await.unwrap();
        assert!(!again.applied);
        let back = ledger.rollback(&r).await.unwrap();
        assert!(!back.applied);
        assert_eq!(ledger.store().user_balance("u1").await.unwrap(), 920);
        assert_eq!(ledger.store().logs(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insufficient_balance_is_rejected_with_403() {
        let ledger = ledger(40, None).await;
        let err = ledger.reserve("u1", "t1", 50).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientUserQuota { needed: 50, available: 40 }));
        let relay: RelayError = err.into();
        assert_eq!(relay.status, 403);
        assert_eq!(relay.code(), Some("insufficient_user_quota"));
        assert_eq!(ledger.store().user_balance("u1").await.unwrap(), 40);

        let ledger = self::ledger(1000, Some(10)).await;
        let err = ledger.reserve("u1", "t1", 50).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientTokenQuota { .. }));
    }

    #[tokio::test]
    async fn trusted_users_are_charged_only_at_reconcile() {
        let ledger = ledger(1_000_000, None).await;
        let r = ledger.reserve("u1", "t1", 50).await.unwrap();
        assert!(r.trusted);
        assert_eq!(r.amount, 0);
        assert_eq!(ledger.store().user_balance("u1").await.unwrap(), 1_000_000);

        let s = ledger.reconcile(&r, 70, 3, log(70)).await.unwrap();
        assert_eq!(s.delta, 70);
        assert_eq!(ledger.store().user_balance("u1").await.unwrap(), 999_930);
    }

    #[tokio::test]
    async fn limited_token_blocks_trust() {
        let ledger = ledger(1_000_000, Some(1000)).await;
        let r = ledger.reserve("u1", "t1", 50).await.unwrap();
        assert!(!r.trusted);
        assert_eq!(ledger.store().token_balance("t1").await.unwrap(), Some(950));
    }

    #[tokio::test]
    async fn unknown_user_is_unauthorized() {
        let ledger = ledger(1000, None).await;
        let err: RelayError = ledger.reserve("nobody", "t1", 1).await.unwrap_err().into();
        assert_eq!(err.status, 401);
    }

    /// Memory store whose balance reads yield and whose next `adjust_user`
    /// can be made to fail.
    struct FlakyStore {
        inner: MemoryLedgerStore,
        fail_adjust: std::sync::atomic::AtomicBool,
    }

    impl FlakyStore {
        fn new(inner: MemoryLedgerStore) -> Self {
            Self {
                inner,
                fail_adjust: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl LedgerStore for FlakyStore {
        async fn user_balance(&self, user_id: &str) -> Result<i64> {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.inner.user_balance(user_id).await
        }
        async fn adjust_user(&self, user_id: &str, delta: i64) -> Result<i64> {
            if self.fail_adjust.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(LedgerError::Storage("connection reset".into()));
            }
            self.inner.adjust_user(user_id, delta).await
        }
        async fn token_balance(&self, token_id: &str) -> Result<Option<i64>> {
            self.inner.token_balance(token_id).await
        }
        async fn adjust_token(&self, token_id: &str, delta: i64) -> Result<()> {
            self.inner.adjust_token(token_id, delta).await
        }
        async fn try_debit_user(&self, user_id: &str, amount: i64) -> Result<i64> {
            self.inner.try_debit_user(user_id, amount).await
        }
        async fn try_debit_token(&self, token_id: &str, amount: i64) -> Result<Option<i64>> {
            self.inner.try_debit_token(token_id, amount).await
        }
        async fn set_user_balance(&self, user_id: &str, balance: i64) -> Result<()> {
            self.inner.set_user_balance(user_id, balance).await
        }
        async fn set_token_balance(&self, token_id: &str, balance: Option<i64>) -> Result<()> {
            self.inner.set_token_balance(token_id, balance).await
        }
        async fn record_used(&self, user_id: &str, channel_id: i64, quota: i64) -> Result<()> {
            self.inner.record_used(user_id, channel_id, quota).await
        }
        async fn user_usage(&self, user_id: &str) -> Result<UsageStats> {
            self.inner.user_usage(user_id).await
        }
        async fn channel_usage(&self, channel_id: i64) -> Result<UsageStats> {
            self.inner.channel_usage(channel_id).await
        }
        async fn append_log(&self, log: &ConsumeLog) -> Result<()> {
            self.inner.append_log(log).await
        }
        async fn logs(&self, user_id: Option<&str>) -> Result<Vec<ConsumeLog>> {
            self.inner.logs(user_id).await
        }
        async fn mark_settled(&self, reservation_id: &str) -> Result<bool> {
            self.inner.mark_settled(reservation_id).await
        }
        async fn clear_settled(&self, reservation_id: &str) -> Result<()> {
            self.inner.clear_settled(reservation_id).await
        }
    }

    async fn flaky_ledger(user_balance: i64) -> (QuotaLedger, Arc<FlakyStore>) {
        let inner = MemoryLedgerStore::default();
        inner.set_user_balance("u1", user_balance).await.unwrap();
        let store = Arc::new(FlakyStore::new(inner));
        (QuotaLedger::new(store.clone()), store)
    }

    #[tokio::test]
    async fn failed_reconcile_can_be_retried() {
        let (ledger, store) = flaky_ledger(1000).await;
        let r = ledger.reserve("u1", "t1", 50).await.unwrap();
        assert_eq!(ledger.store().user_balance("u1").await.unwrap(), 950);

        store.fail_adjust.store(true, std::sync::atomic::Ordering::SeqCst);
        let err = ledger.reconcile(&r, 30, 3, log(30)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)));
        assert_eq!(ledger.store().user_balance("u1").await.unwrap(), 950);
        assert!(ledger.store().logs(None).await.unwrap().is_empty());

        let s = ledger.reconcile(&r, 30, 3, log(30)).await.unwrap();
        assert!(s.applied);
        assert_eq!(ledger.store().user_balance("u1").await.unwrap(), 970);
        assert_eq!(ledger.store().logs(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_rollback_can_be_retried() {
        let (ledger, store) = flaky_ledger(1000).await;
        let r = ledger.reserve("u1", "t1", 50).await.unwrap();

        store.fail_adjust.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(ledger.rollback(&r).await.is_err());
        assert_eq!(ledger.store().user_balance("u1").await.unwrap(), 950);

        assert!(ledger.rollback(&r).await.unwrap().applied);
        assert_eq!(ledger.store().user_balance("u1").await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn concurrent_reserves_cannot_overdraw() {
        let (ledger, _) = flaky_ledger(100).await;
        let (a, b) = tokio::join!(
            ledger.reserve("u1", "t1", 60),
            ledger.reserve("u1", "t1", 60)
        );
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let failed = a.err().or(b.err()).unwrap();
        assert!(matches!(
            failed,
            LedgerError::InsufficientUserQuota { needed: 60, available: 40 }
        ));
        assert_eq!(ledger.store().user_balance("u1").await.unwrap(), 40);
    }
}
