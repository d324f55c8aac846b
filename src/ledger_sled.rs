//! sled-backed ledger store.
//!
//! Balances are big-endian `i64` values updated with `update_and_fetch`, so
//! each adjustment is atomic per key. Settlement markers use
//! `compare_and_swap` from absent to present.

use crate::ledger::{ConsumeLog, LedgerError, LedgerStore, Result, UsageStats};
use std::path::{Path, PathBuf};

fn storage(e: sled::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

fn encode(v: i64) -> [u8; 8] {
    v.to_be_bytes()
}

fn decode(bytes: &[u8]) -> Option<i64> {
    bytes.try_into().ok().map(i64::from_be_bytes)
}

pub struct SledLedgerStore {
    db: sled::Db,
    users: sled::Tree,
    tokens: sled::Tree,
    usage: sled::Tree,
    logs: sled::Tree,
    settled: sled::Tree,
}

impl SledLedgerStore {
    /// Open at `RELAYIUM_LEDGER_SLED_PATH` (default `./data/ledger.db`).
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("RELAYIUM_LEDGER_SLED_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "./data/ledger.db".to_string());
        Self::open(PathBuf::from(path))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = sled::open(path).map_err(storage)?;
        Ok(Self {
            users: db.open_tree("users").map_err(storage)?,
            tokens: db.open_tree("tokens").map_err(storage)?,
            usage: db.open_tree("usage").map_err(storage)?,
            logs: db.open_tree("logs").map_err(storage)?,
            settled: db.open_tree("settled").map_err(storage)?,
            db,
        })
    }

    /// Subtract `amount` when the stored value covers it. Returns the value
    /// seen before the update, `None` when the key is absent.
    fn debit_if_covered(tree: &sled::Tree, key: &str, amount: i64) -> Result<Option<i64>> {
        let old = tree
            .fetch_and_update(key.as_bytes(), |old| {
                old.map(|raw| match decode(raw) {
                    Some(b) if b >= amount => encode(b - amount).to_vec(),
                    _ => raw.to_vec(),
                })
            })
            .map_err(storage)?;
        Ok(old.and_then(|v| decode(&v)))
    }

    fn bump_usage(&self, key: String, quota: i64) -> Result<()> {
        self.usage
            .update_and_fetch(key.as_bytes(), |old| {
                let mut stats: UsageStats = old
                    .and_then(|b| serde_json::from_slice(b).ok())
                    .unwrap_or_default();
                stats.used_quota += quota;
                stats.request_count += 1;
                serde_json::to_vec(&stats).ok()
            })
            .map_err(storage)?;
        Ok(())
    }

    fn read_usage(&self, key: String) -> Result<UsageStats> {
        match self.usage.get(key.as_bytes()).map_err(storage)? {
            Some(v) => Ok(serde_json::from_slice(&v)?),
            None => Ok(UsageStats::default()),
        }
    }
}

#[async_trait::async_trait]
impl LedgerStore for SledLedgerStore {
    async fn user_balance(&self, user_id: &str) -> Result<i64> {
        self.users
            .get(user_id.as_bytes())
            .map_err(storage)?
            .and_then(|v| decode(&v))
            .ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))
    }

    async fn adjust_user(&self, user_id: &str, delta: i64) -> Result<i64> {
        let updated = self
            .users
            .update_and_fetch(user_id.as_bytes(), |old| {
                old.and_then(decode).map(|b| encode(b + delta).to_vec())
            })
            .map_err(storage)?;
        updated
            .and_then(|v| decode(&v))
            .ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))
    }

    async fn token_balance(&self, token_id: &str) -> Result<Option<i64>> {
        Ok(self
            .tokens
            .get(token_id.as_bytes())
            .map_err(storage)?
            .and_then(|v| decode(&v)))
    }

    async fn adjust_token(&self, token_id: &str, delta: i64) -> Result<()> {
        self.tokens
            .update_and_fetch(token_id.as_bytes(), |old| {
                old.and_then(decode).map(|b| encode(b + delta).to_vec())
            })
            .map_err(storage)?;
        Ok(())
    }

    async fn try_debit_user(&self, user_id: &str, amount: i64) -> Result<i64> {
        match Self::debit_if_covered(&self.users, user_id, amount)? {
            None => Err(LedgerError::UnknownUser(user_id.to_string())),
            Some(before) if before < amount => Err(LedgerError::InsufficientUserQuota {
                needed: amount,
                available: before,
            }),
            Some(before) => Ok(before - amount),
        }
    }

    async fn try_debit_token(&self, token_id: &str, amount: i64) -> Result<Option<i64>> {
        match Self::debit_if_covered(&self.tokens, token_id, amount)? {
            None => Ok(None),
            Some(before) if before < amount => Err(LedgerError::InsufficientTokenQuota {
                needed: amount,
                available: before,
            }),
            Some(before) => Ok(Some(before - amount)),
        }
    }

    async fn set_user_balance(&self, user_id: &str, balance: i64) -> Result<()> {
        self.users
            .insert(user_id.as_bytes(), &encode(balance)[..])
            .map_err(storage)?;
        Ok(())
    }

    async fn set_token_balance(&self, token_id: &str, balance: Option<i64>) -> Result<()> {
        match balance {
            Some(b) => self.tokens.insert(token_id.as_bytes(), &encode(b)[..]),
            None => self.tokens.remove(token_id.as_bytes()),
        }
        .map_err(storage)?;
        Ok(())
    }

    async fn record_used(&self, user_id: &str, channel_id: i64, quota: i64) -> Result<()> {
        self.bump_usage(format!("user:{}", user_id), quota)?;
        self.bump_usage(format!("channel:{}", channel_id), quota)
    }

    async fn user_usage(&self, user_id: &str) -> Result<UsageStats> {
        self.read_usage(format!("user:{}", user_id))
    }

    async fn channel_usage(&self, channel_id: i64) -> Result<UsageStats> {
        self.read_usage(format!("channel:{}", channel_id))
    }

    async fn append_log(&self, log: &ConsumeLog) -> Result<()> {
        let id = self.db.generate_id().map_err(storage)?;
        let value = serde_json::to_vec(log)?;
        self.logs.insert(id.to_be_bytes(), value).map_err(storage)?;
        self.logs.flush().map_err(storage)?;
        Ok(())
    }

    async fn logs(&self, user_id: Option<&str>) -> Result<Vec<ConsumeLog>> {
        let mut out = Vec::new();
        for item in self.logs.iter() {
            let (_k, v) = item.map_err(storage)?;
            let log: ConsumeLog = serde_json::from_slice(&v)?;
            if user_id.map(|u| log.user_id == u).unwrap_or(true) {
                out.push(log);
            }
        }
        Ok(out)
    }

    async fn mark_settled(&self, reservation_id: &str) -> Result<bool> {
        let swapped = self
            .settled
            .compare_and_swap(
                reservation_id.as_bytes(),
                None as Option<&[u8]>,
                Some(&b"1"[..]),
            )
            .map_err(storage)?;
        Ok(swapped.is_ok())
    }

    async fn clear_settled(&self, reservation_id: &str) -> Result<()> {
        self.settled
            .remove(reservation_id.as_bytes())
            .map_err(storage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::QuotaLedger;
    use std::sync::Arc;

    #[tokio::test]
    async fn balances_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        {
            let store = SledLedgerStore::open(&path).unwrap();
            store.set_user_balance("u1", 1000).await.unwrap();
            assert_eq!(store.adjust_user("u1", -50).await.unwrap(), 950);
            store.db.flush().unwrap();
        }
        let store = SledLedgerStore::open(&path).unwrap();
        assert_eq!(store.user_balance("u1").await.unwrap(), 950);
        assert!(matches!(
            store.adjust_user("ghost", 1).await,
            Err(LedgerError::UnknownUser(_))
        ));
    }

    #[tokio::test]
    async fn ledger_round_trip_on_sled() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledLedgerStore::open(dir.path().join("l.db")).unwrap();
        store.set_user_balance("u1", 1000).await.unwrap();
        store.set_token_balance("t1", Some(400)).await.unwrap();
        let ledger = QuotaLedger::new(Arc::new(store));

        let r = ledger.reserve("u1", "t1", 50).await.unwrap();
        let log = ConsumeLog {
            user_id: "u1".into(),
            quota: 30,
            ..Default::default()
        };
        ledger.reconcile(&r, 30, 2, log.clone()).await.unwrap();
        assert!(!ledger.reconcile(&r, 30, 2, log).await.unwrap().applied);

        let store = ledger.store();
        assert_eq!(store.user_balance("u1").await.unwrap(), 970);
        assert_eq!(store.token_balance("t1").await.unwrap(), Some(370));
        assert_eq!(store.channel_usage(2).await.unwrap().request_count, 1);
        assert_eq!(store.logs(Some("u1")).await.unwrap()[0].quota, 30);
    }

    #[tokio::test]
    async fn conditional_debit_leaves_short_balances_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledLedgerStore::open(dir.path().join("d.db")).unwrap();
        store.set_user_balance("u1", 100).await.unwrap();
        assert_eq!(store.try_debit_user("u1", 60).await.unwrap(), 40);
        assert!(matches!(
            store.try_debit_user("u1", 60).await,
            Err(LedgerError::InsufficientUserQuota { needed: 60, available: 40 })
        ));
        assert_eq!(store.user_balance("u1").await.unwrap(), 40);
        assert!(matches!(
            store.try_debit_user("ghost", 1).await,
            Err(LedgerError::UnknownUser(_))
        ));
        assert_eq!(store.try_debit_token("free", 10).await.unwrap(), None);

        assert!(store.mark_settled("r1").await.unwrap());
        store.clear_settled("r1").await.unwrap();
        assert!(store.mark_settled("r1").await.unwrap());
    }
}
