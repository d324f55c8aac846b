//! Redis-backed ledger store.
//!
//! Blocking commands over an r2d2 pool. Balances use `INCRBY`, counters
//! `HINCRBY`, settlement markers `SET NX`, logs `RPUSH`.

use crate::ledger::{ConsumeLog, LedgerError, LedgerStore, Result, UsageStats};
use std::collections::HashMap;

fn storage(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

pub struct RedisConnectionManager {
    client: redis::Client,
}

impl r2d2::ManageConnection for RedisConnectionManager {
    type Connection = redis::Connection;
    type Error = redis::RedisError;

    fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        self.client.get_connection()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        let _: String = redis::cmd("PING").query(conn)?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Key layout under a namespace prefix.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    ns: String,
}

impl RedisKeys {
    pub fn new(ns: &str) -> Self {
        Self { ns: ns.to_string() }
    }

    pub fn user(&self, id: &str) -> String {
        format!("{}user:{}", self.ns, id)
    }

    pub fn token(&self, id: &str) -> String {
        format!("{}token:{}", self.ns, id)
    }

    pub fn user_usage(&self, id: &str) -> String {
        format!("{}usage:user:{}", self.ns, id)
    }

    pub fn channel_usage(&self, id: i64) -> String {
        format!("{}usage:channel:{}", self.ns, id)
    }

    pub fn settled(&self, reservation_id: &str) -> String {
        format!("{}settled:{}", self.ns, reservation_id)
    }

    pub fn logs(&self) -> String {
        format!("{}logs", self.ns)
    }
}

/// Settlement markers expire after a day; no reservation lives that long.
const SETTLED_TTL_SECS: u64 = 86_400;

/// Conditional DECRBY. Replies `{-1, 0}` for a missing key, `{0, balance}`
/// when the balance is short and `{1, remaining}` after debiting.
const DEBIT_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if not cur then
  return {-1, 0}
end
cur = tonumber(cur)
local amount = tonumber(ARGV[1])
if cur < amount then
  return {0, cur}
end
return {1, redis.call('DECRBY', KEYS[1], amount)}
"#;

pub struct RedisLedgerStore {
    pool: r2d2::Pool<RedisConnectionManager>,
    keys: RedisKeys,
}

impl RedisLedgerStore {
    /// Connect using `RELAYIUM_REDIS_URL` and `RELAYIUM_REDIS_POOL_MAX`.
    pub fn connect_default() -> Result<Self> {
        let url = std::env::var("RELAYIUM_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        Self::connect_url(&url)
    }

    pub fn connect_url(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(storage)?;
        let manager = RedisConnectionManager { client };
        let max_size = std::env::var("RELAYIUM_REDIS_POOL_MAX")
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(16);
        let pool = r2d2::Pool::builder()
            .max_size(max_size)
            .build(manager)
            .map_err(storage)?;
        Ok(Self {
            pool,
            keys: RedisKeys::new("relayium:ledger:"),
        })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<RedisConnectionManager>> {
        self.pool.get().map_err(storage)
    }

    /// Runs [`DEBIT_SCRIPT`]. Returns `None` for a missing key, otherwise
    /// whether the debit happened and the balance after it.
    fn debit_if_covered(&self, key: &str, amount: i64) -> Result<Option<(bool, i64)>> {
        let mut conn = self.conn()?;
        let (status, value): (i64, i64) = redis::cmd("EVAL")
            .arg(DEBIT_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(amount)
            .query(&mut *conn)
            .map_err(storage)?;
        Ok(match status {
            -1 => None,
            s => Some((s == 1, value)),
        })
    }

    fn read_usage(&self, key: &str) -> Result<UsageStats> {
        let mut conn = self.conn()?;
        let fields: HashMap<String, i64> = redis::cmd("HGETALL")
            .arg(key)
            .query(&mut *conn)
            .map_err(storage)?;
        Ok(UsageStats {
            used_quota: fields.get("used_quota").copied().unwrap_or(0),
            request_count: fields.get("request_count").copied().unwrap_or(0).max(0) as u64,
        })
    }
}

#[async_trait::async_trait]
impl LedgerStore for RedisLedgerStore {
    async fn user_balance(&self, user_id: &str) -> Result<i64> {
        let mut conn = self.conn()?;
        let val: Option<i64> = redis::cmd("GET")
            .arg(self.keys.user(user_id))
            .query(&mut *conn)
            .map_err(storage)?;
        val.ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))
    }

    async fn adjust_user(&self, user_id: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn()?;
        let key = self.keys.user(user_id);
        let exists: bool = redis::cmd("EXISTS")
            .arg(&key)
            .query(&mut *conn)
            .map_err(storage)?;
        if !exists {
            return Err(LedgerError::UnknownUser(user_id.to_string()));
        }
        redis::cmd("INCRBY")
            .arg(&key)
            .arg(delta)
            .query(&mut *conn)
            .map_err(storage)
    }

    async fn try_debit_user(&self, user_id: &str, amount: i64) -> Result<i64> {
        match self.debit_if_covered(&self.keys.user(user_id), amount)? {
            None => Err(LedgerError::UnknownUser(user_id.to_string())),
            Some((false, available)) => Err(LedgerError::InsufficientUserQuota {
                needed: amount,
                available,
            }),
            Some((true, after)) => Ok(after),
        }
    }

    async fn try_debit_token(&self, token_id: &str, amount: i64) -> Result<Option<i64>> {
        match self.debit_if_covered(&self.keys.token(token_id), amount)? {
            None => Ok(None),
            Some((false, available)) => Err(LedgerError::InsufficientTokenQuota {
                needed: amount,
                available,
            }),
            Some((true, after)) => Ok(Some(after)),
        }
    }

    async fn token_balance(&self, token_id: &str) -> Result<Option<i64>> {
        let mut conn = self.conn()?;
        redis::cmd("GET")
            .arg(self.keys.token(token_id))
            .query(&mut *conn)
            .map_err(storage)
    }

    async fn adjust_token(&self, token_id: &str, delta: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let key = self.keys.token(token_id);
        let exists: bool = redis::cmd("EXISTS")
            .arg(&key)
            .query(&mut *conn)
            .map_err(storage)?;
        if exists {
            let _: i64 = redis::cmd("INCRBY")
                .arg(&key)
                .arg(delta)
                .query(&mut *conn)
                .map_err(storage)?;
        }
        Ok(())
    }

    async fn set_user_balance(&self, user_id: &str, balance: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let _: () = redis::cmd("SET")
            .arg(self.keys.user(user_id))
            .arg(balance)
            .query(&mut *conn)
            .map_err(storage)?;
        Ok(())
    }

    async fn set_token_balance(&self, token_id: &str, balance: Option<i64>) -> Result<()> {
        let mut conn = self.conn()?;
        let key = self.keys.token(token_id);
        match balance {
            Some(b) => {
                let _: () = redis::cmd("SET")
                    .arg(&key)
                    .arg(b)
                    .query(&mut *conn)
                    .map_err(storage)?;
            }
            None => {
                let _: i64 = redis::cmd("DEL").arg(&key).query(&mut *conn).map_err(storage)?;
            }
        }
        Ok(())
    }

    async fn record_used(&self, user_id: &str, channel_id: i64, quota: i64) -> Result<()> {
        let mut conn = self.conn()?;
        for key in [self.keys.user_usage(user_id), self.keys.channel_usage(channel_id)] {
            let _: () = redis::pipe()
                .cmd("HINCRBY")
                .arg(&key)
                .arg("used_quota")
                .arg(quota)
                .ignore()
                .cmd("HINCRBY")
                .arg(&key)
                .arg("request_count")
                .arg(1)
                .ignore()
                .query(&mut *conn)
                .map_err(storage)?;
        }
        Ok(())
    }

    async fn user_usage(&self, user_id: &str) -> Result<UsageStats> {
        self.read_usage(&self.keys.user_usage(user_id))
    }

    async fn channel_usage(&self, channel_id: i64) -> Result<UsageStats> {
        self.read_usage(&self.keys.channel_usage(channel_id))
    }

    async fn append_log(&self, log: &ConsumeLog) -> Result<()> {
        let mut conn = self.conn()?;
        let val = serde_json::to_string(log)?;
        let _: i64 = redis::cmd("RPUSH")
            .arg(self.keys.logs())
            .arg(val)
            .query(&mut *conn)
            .map_err(storage)?;
        Ok(())
    }

    async fn logs(&self, user_id: Option<&str>) -> Result<Vec<ConsumeLog>> {
        let mut conn = self.conn()?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.keys.logs())
            .arg(0)
            .arg(-1)
            .query(&mut *conn)
            .map_err(storage)?;
        let mut out = Vec::with_capacity(raw.len());
        for s in raw {
            let log: ConsumeLog = serde_json::from_str(&s)?;
            if user_id.map(|u| log.user_id == u).unwrap_or(true) {
                out.push(log);
            }
        }
        Ok(out)
    }

    async fn mark_settled(&self, reservation_id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let set: Option<String> = redis::cmd("SET")
            .arg(self.keys.settled(reservation_id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(SETTLED_TTL_SECS)
            .query(&mut *conn)
            .map_err(storage)?;
        Ok(set.is_some())
    }

    async fn clear_settled(&self, reservation_id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.keys.settled(reservation_id))
            .query(&mut *conn)
            .map_err(storage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let keys = RedisKeys::new("relayium:ledger:");
        assert_eq!(keys.user("42"), "relayium:ledger:user:42");
        assert_eq!(keys.channel_usage(7), "relayium:ledger:usage:channel:7");
        assert_eq!(keys.settled("r-1"), "relayium:ledger:settled:r-1");
    }

    #[test]
    fn malformed_url_is_a_storage_error() {
        assert!(matches!(
            RedisLedgerStore::connect_url("not a redis url"),
            Err(LedgerError::Storage(_))
        ));
    }
}
