//! Redis store strategy for multi-instance deployments.
//!
//! Multi-command steps (`INCR` + `PEXPIRE`, score + rank pruning) run inside
//! `MULTI` pipelines so concurrent instances never observe half-applied state.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::info;

use super::RateLimitStore;
use crate::error::StoreResult;

fn millis_i64(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// [`RateLimitStore`] backed by a Redis `ConnectionManager`.
///
/// The manager reconnects on its own and is cheap to clone per command.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("conn", &"<ConnectionManager>")
            .finish()
    }
}

impl RedisStore {
    /// Open a managed connection to `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the URL is invalid or the initial
    /// connection fails.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!("Connected to Redis store");
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let pairs: Vec<(&str, &str)> = fields.iter().map(|(f, v)| (*f, v.as_str())).collect();
        let mut conn = self.conn();
        let _: () = conn.hset_multiple(key, &pairs).await?;
        Ok(())
    }

    async fn hash_replace(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(key).ignore();
        if !fields.is_empty() {
            pipe.cmd("HSET").arg(key);
            for (field, value) in fields {
                pipe.arg(*field).arg(value.as_str());
            }
            pipe.ignore();
            if let Some(ttl) = ttl {
                pipe.cmd("PEXPIRE").arg(key).arg(millis_i64(ttl)).ignore();
            }
        }
        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.conn();
        let value: i64 = conn.hincr(key, field, delta).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis_i64(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.conn();
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis_i64(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn counter_get(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("PX")
            .arg(millis_i64(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let count: i64 = conn.exists(key).await?;
        Ok(count > 0)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn();
        // -2 = missing, -1 = no expiry
        let ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(u64::try_from(ms).ok().map(Duration::from_millis))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn sorted_prune(&self, key: &str, min_score: f64, max_len: usize) -> StoreResult<()> {
        let keep = i64::try_from(max_len).unwrap_or(i64::MAX);
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({min_score}"))
            .ignore()
            .cmd("ZREMRANGEBYRANK")
            .arg(key)
            .arg(0)
            .arg(-keep - 1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn sorted_tail_scores(&self, key: &str, count: usize) -> StoreResult<Vec<f64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let start = -isize::try_from(count).unwrap_or(isize::MAX);
        let mut conn = self.conn();
        let members: Vec<(String, f64)> = conn.zrange_withscores(key, start, -1).await?;
        Ok(members.into_iter().map(|(_, score)| score).collect())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let mut keys: Vec<String> = conn.keys(format!("{prefix}*")).await?;
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
