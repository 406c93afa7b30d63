//! Counter storage for the rate limiter.
//!
//! The limiter only needs one atomic operation per check: "increment the
//! counter for this key, starting a new window if the old one has passed".
//! [`InMemoryRateLimitStore`] does this under a per-key `DashMap` entry lock;
//! [`RedisRateLimitStore`] does it in a Lua script so several processes can
//! share one budget.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{CoreError, ErrorCode, Result};

/// Window counter for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub key: String,
    /// Requests seen in the current window, including the current one
    pub count: u64,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitEntry {
    fn start(key: &str, window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            count: 1,
            reset_at: window_end(now, window),
        }
    }

    /// The window has passed; the next hit starts a new one.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.reset_at < now
    }
}

fn window_end(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_add_signed(w))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count one request for `key` and return the updated entry.
    async fn hit(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<RateLimitEntry>;

    /// Drop entries whose window has passed. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Short backend name for logs and metrics.
    fn backend(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-local store. Memory is bounded by the keys active in the trailing
/// window as long as `purge_expired` runs periodically.
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    entries: DashMap<String, RateLimitEntry>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    fn hit_sync(&self, key: &str, window: Duration, now: DateTime<Utc>) -> RateLimitEntry {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry {
                key: key.to_string(),
                count: 0,
                reset_at: now,
            });

        if entry.count == 0 || entry.is_expired(now) {
            *entry = RateLimitEntry::start(key, window, now);
        } else {
            entry.count = entry.count.saturating_add(1);
        }
        entry.clone()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn hit(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<RateLimitEntry> {
        Ok(self.hit_sync(key, window, now))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let expired = entry.is_expired(now);
            if expired {
                removed += 1;
            }
            !expired
        });
        Ok(removed)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis store
// ═══════════════════════════════════════════════════════════════════════════════

/// Increments the key, starting a window (PEXPIRE) on the first hit, and
/// returns the count together with the remaining window in milliseconds.
const HIT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Store shared between processes through Redis. Keys expire on their own,
/// so `purge_expired` has nothing to do.
///
/// Every check goes through one [`ConnectionManager`], which multiplexes
/// requests and reconnects after failures.
pub struct RedisRateLimitStore {
    conn: ConnectionManager,
    prefix: String,
    script: redis::Script,
}

impl RedisRateLimitStore {
    /// Open a managed connection and verify it.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            CoreError::new(ErrorCode::CacheConnectionFailed, "Invalid Redis URL")
                .with_internal_message(e.to_string())
        })?;

        let mut conn = client.get_connection_manager().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Rate limiter connected to Redis");

        Ok(Self {
            conn,
            prefix: prefix.into(),
            script: redis::Script::new(HIT_SCRIPT),
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn hit(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<RateLimitEntry> {
        let mut conn = self.conn.clone();
        let window_ms = window.as_millis().max(1) as u64;

        let (count, ttl_ms): (u64, i64) = self
            .script
            .key(format!("{}{}", self.prefix, key))
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        let reset_at = now
            .checked_add_signed(chrono::Duration::milliseconds(ttl_ms.max(0)))
            .unwrap_or(now);
        debug!(key, count, ttl_ms, "Redis rate limit hit");

        Ok(RateLimitEntry {
            key: key.to_string(),
            count,
            reset_at,
        })
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
