//! In-process store strategy.
//!
//! Each key lives in a `DashMap` shard and every operation runs under that
//! shard's entry lock, so per-key mutations are atomic across tasks. Limits
//! enforced through this store are per process: use [`super::RedisStore`]
//! when more than one instance serves traffic.
//!
//! Expired keys are dropped when read, and every [`SWEEP_INTERVAL`] writes a
//! full sweep removes the ones nobody reads again (old window counters,
//! minute buckets, idle identifiers).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tracing::debug;

use super::RateLimitStore;
use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};

/// Writes between two sweeps of expired entries.
pub const SWEEP_INTERVAL: u64 = 256;

#[derive(Debug, Clone)]
enum Value {
    Flag,
    Counter(i64),
    Hash(HashMap<String, String>),
    Sorted(Vec<(f64, String)>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Flag => "flag",
            Value::Counter(_) => "counter",
            Value::Hash(_) => "hash",
            Value::Sorted(_) => "sorted set",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at_ms: None,
        }
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

fn wrong_type(key: &str, found: &Value) -> StoreError {
    StoreError::Backend(format!(
        "WRONGTYPE operation against key `{key}` holding a {}",
        found.type_name()
    ))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// `DashMap`-backed [`RateLimitStore`] with clock-driven expiry.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            writes: AtomicU64::new(0),
        }
    }

    /// Number of live (non-expired) keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Swept expired entries");
        }
        removed
    }

    /// Count one write and sweep on every [`SWEEP_INTERVAL`]th. Must run
    /// before any shard lock is taken.
    fn note_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_INTERVAL == 0 {
            self.purge_expired();
        }
    }

    /// Run `f` against the live entry for `key`, creating it with `init` when
    /// absent or expired.
    fn mutate<R>(
        &self,
        key: &str,
        init: impl FnOnce() -> Value,
        f: impl FnOnce(&mut Entry, u64) -> StoreResult<R>,
    ) -> StoreResult<R> {
        self.note_write();
        let now = self.clock.now_ms();
        let mut slot = match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(occupied) => {
                let mut existing = occupied.into_ref();
                if existing.is_expired(now) {
                    *existing = Entry::new(init());
                }
                existing
            }
            MapEntry::Vacant(vacant) => vacant.insert(Entry::new(init())),
        };
        f(&mut *slot, now)
    }

    /// Run `f` against the live entry for `key` without creating it.
    fn read<R>(&self, key: &str, f: impl FnOnce(Option<&Entry>) -> R) -> R {
        let now = self.clock.now_ms();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return f(Some(entry.value())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
        }
        f(None)
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.read(key, |entry| match entry {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Ok(fields.clone()),
            Some(other) => Err(wrong_type(key, &other.value)),
        })
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        self.mutate(
            key,
            || Value::Hash(HashMap::new()),
            |entry, _| match &mut entry.value {
                Value::Hash(map) => {
                    for (field, value) in fields {
                        map.insert((*field).to_string(), value.clone());
                    }
                    Ok(())
                }
                other => Err(wrong_type(key, other)),
            },
        )
    }

    async fn hash_replace(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        self.note_write();
        if fields.is_empty() {
            self.entries.remove(key);
            return Ok(());
        }
        let now = self.clock.now_ms();
        let map = fields
            .iter()
            .map(|(field, value)| ((*field).to_string(), value.clone()))
            .collect();
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Hash(map),
                expires_at_ms: ttl.map(|ttl| now.saturating_add(millis(ttl))),
            },
        );
        Ok(())
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.mutate(
            key,
            || Value::Hash(HashMap::new()),
            |entry, _| match &mut entry.value {
                Value::Hash(map) => {
                    let current = match map.get(field) {
                        Some(raw) => raw.parse::<i64>().map_err(|_| {
                            StoreError::Backend(format!(
                                "hash value at `{key}`.`{field}` is not an integer"
                            ))
                        })?,
                        None => 0,
                    };
                    let next = current.saturating_add(delta);
                    map.insert(field.to_string(), next.to_string());
                    Ok(next)
                }
                other => Err(wrong_type(key, other)),
            },
        )
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now_ms();
        if let Some(mut entry) = self.entries.get_mut(key)
            && !entry.is_expired(now)
        {
            entry.expires_at_ms = Some(now.saturating_add(millis(ttl)));
        }
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.mutate(
            key,
            || Value::Counter(0),
            |entry, now| match &mut entry.value {
                Value::Counter(count) => {
                    *count = count.saturating_add(1);
                    let value = *count;
                    entry.expires_at_ms = Some(now.saturating_add(millis(ttl)));
                    Ok(value)
                }
                other => Err(wrong_type(key, other)),
            },
        )
    }

    async fn counter_get(&self, key: &str) -> StoreResult<i64> {
        self.read(key, |entry| match entry {
            None => Ok(0),
            Some(Entry {
                value: Value::Counter(count),
                ..
            }) => Ok(*count),
            Some(other) => Err(wrong_type(key, &other.value)),
        })
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.note_write();
        let now = self.clock.now_ms();
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Flag,
                expires_at_ms: Some(now.saturating_add(millis(ttl))),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.read(key, |entry| entry.is_some()))
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = self.clock.now_ms();
        Ok(self.read(key, |entry| {
            entry
                .and_then(|e| e.expires_at_ms)
                .map(|at| Duration::from_millis(at.saturating_sub(now)))
        }))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = self.clock.now_ms();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.mutate(
            key,
            || Value::Sorted(Vec::new()),
            |entry, _| match &mut entry.value {
                Value::Sorted(members) => {
                    members.retain(|(_, m)| m != member);
                    let at = members.partition_point(|(s, _)| *s <= score);
                    members.insert(at, (score, member.to_string()));
                    Ok(())
                }
                other => Err(wrong_type(key, other)),
            },
        )
    }

    async fn sorted_prune(&self, key: &str, min_score: f64, max_len: usize) -> StoreResult<()> {
        let now = self.clock.now_ms();
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(());
        };
        if entry.is_expired(now) {
            return Ok(());
        }
        match &mut entry.value {
            Value::Sorted(members) => {
                members.retain(|(s, _)| *s >= min_score);
                if members.len() > max_len {
                    let excess = members.len() - max_len;
                    members.drain(..excess);
                }
                Ok(())
            }
            other => Err(wrong_type(key, other)),
        }
    }

    async fn sorted_tail_scores(&self, key: &str, count: usize) -> StoreResult<Vec<f64>> {
        self.read(key, |entry| match entry {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Sorted(members),
                ..
            }) => {
                let skip = members.len().saturating_sub(count);
                Ok(members.iter().skip(skip).map(|(s, _)| *s).collect())
            }
            Some(other) => Err(wrong_type(key, &other.value)),
        })
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = self.clock.now_ms();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
