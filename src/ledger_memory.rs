//! In-memory ledger store.

use crate::ledger::{ConsumeLog, LedgerError, LedgerStore, Result, UsageStats};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct State {
    users: HashMap<String, i64>,
    tokens: HashMap<String, i64>,
    user_usage: HashMap<String, UsageStats>,
    channel_usage: HashMap<i64, UsageStats>,
    logs: Vec<ConsumeLog>,
    settled: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<RwLock<State>>,
}

impl MemoryLedgerStore {
    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|e| LedgerError::Storage(format!("Lock error: {}", e)))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|e| LedgerError::Storage(format!("Lock error: {}", e)))
    }
}

#[async_trait::async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn user_balance(&self, user_id: &str) -> Result<i64> {
        self.read()?
            .users
            .get(user_id)
            .copied()
            .ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))
    }

    async fn adjust_user(&self, user_id: &str, delta: i64) -> Result<i64> {
        let mut state = self.write()?;
        let balance = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))?;
        *balance += delta;
        Ok(*balance)
    }

    async fn token_balance(&self, token_id: &str) -> Result<Option<i64>> {
        Ok(self.read()?.tokens.get(token_id).copied())
    }

    async fn adjust_token(&self, token_id: &str, delta: i64) -> Result<()> {
        if let Some(balance) = self.write()?.tokens.get_mut(token_id) {
            *balance += delta;
        }
        Ok(())
    }

    async fn try_debit_user(&self, user_id: &str, amount: i64) -> Result<i64> {
        let mut state = self.write()?;
        let balance = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))?;
        if *balance < amount {
            return Err(LedgerError::InsufficientUserQuota {
                needed: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        Ok(*balance)
    }

    async fn try_debit_token(&self, token_id: &str, amount: i64) -> Result<Option<i64>> {
        let mut state = self.write()?;
        let Some(balance) = state.tokens.get_mut(token_id) else {
            return Ok(None);
        };
        if *balance < amount {
            return Err(LedgerError::InsufficientTokenQuota {
                needed: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        Ok(Some(*balance))
    }

    async fn set_user_balance(&self, user_id: &str, balance: i64) -> Result<()> {
        self.write()?.users.insert(user_id.to_string(), balance);
        Ok(())
    }

    async fn set_token_balance(&self, token_id: &str, balance: Option<i64>) -> Result<()> {
        let mut state = self.write()?;
        match balance {
            Some(b) => state.tokens.insert(token_id.to_string(), b),
            None => state.tokens.remove(token_id),
        };
        Ok(())
    }

    async fn record_used(&self, user_id: &str, channel_id: i64, quota: i64) -> Result<()> {
        let mut state = self.write()?;
        let user = state.user_usage.entry(user_id.to_string()).or_default();
        user.used_quota += quota;
        user.request_count += 1;
        let channel = state.channel_usage.entry(channel_id).or_default();
        channel.used_quota += quota;
        channel.request_count += 1;
        Ok(())
    }

    async fn user_usage(&self, user_id: &str) -> Result<UsageStats> {
        Ok(self.read()?.user_usage.get(user_id).copied().unwrap_or_default())
    }

    async fn channel_usage(&self, channel_id: i64) -> Result<UsageStats> {
        Ok(self
            .read()?
            .channel_usage
            .get(&channel_id)
            .copied()
            .unwrap_or_default())
    }

    async fn append_log(&self, log: &ConsumeLog) -> Result<()> {
        self.write()?.logs.push(log.clone());
        Ok(())
    }

    async fn logs(&self, user_id: Option<&str>) -> Result<Vec<ConsumeLog>> {
        Ok(self
            .read()?
            .logs
            .iter()
            .filter(|l| user_id.map(|u| l.user_id == u).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn mark_settled(&self, reservation_id: &str) -> Result<bool> {
        Ok(self.write()?.settled.insert(reservation_id.to_string()))
    }

    async fn clear_settled(&self, reservation_id: &str) -> Result<()> {
        self.write()?.settled.remove(reservation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_tokens_ignore_adjustments() {
        let store = MemoryLedgerStore::default();
        store.adjust_token("free", -500).await.unwrap();
        assert_eq!(store.token_balance("free").await.unwrap(), None);
        store.set_token_balance("capped", Some(10)).await.unwrap();
        store.adjust_token("capped", -4).await.unwrap();
        assert_eq!(store.token_balance("capped").await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn mark_settled_is_compare_and_set() {
        let store = MemoryLedgerStore::default();
        assert!(store.mark_settled("r1").await.unwrap());
        assert!(!store.mark_settled("r1").await.unwrap());
        store.clear_settled("r1").await.unwrap();
        assert!(store.mark_settled("r1").await.unwrap());
    }

    #[tokio::test]
    async fn debits_never_go_below_zero() {
        let store = MemoryLedgerStore::default();
        store.set_user_balance("u1", 100).await.unwrap();
        assert_eq!(store.try_debit_user("u1", 60).await.unwrap(), 40);
        assert!(matches!(
            store.try_debit_user("u1", 60).await,
            Err(LedgerError::InsufficientUserQuota { needed: 60, available: 40 })
        ));
        assert_eq!(store.user_balance("u1").await.unwrap(), 40);

        assert_eq!(store.try_debit_token("free", 1_000).await.unwrap(), None);
        store.set_token_balance("capped", Some(5)).await.unwrap();
        assert!(matches!(
            store.try_debit_token("capped", 6).await,
            Err(LedgerError::InsufficientTokenQuota { .. })
        ));
        assert_eq!(store.try_debit_token("capped", 5).await.unwrap(), Some(0));
    }
}
