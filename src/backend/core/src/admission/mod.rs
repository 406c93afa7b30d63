//! Admission control: keyed fixed-window rate limiting.
//!
//! Features:
//! - Per-key counters that reset once the window has passed
//! - Named tiers (strict, standard, generous, public, AI generation)
//! - Pluggable key strategies (address + subject, address only, custom)
//! - Redis-backed store for multi-instance deployments, with in-memory
//!   fallback when Redis is unavailable
//! - Periodic purge of expired entries
//!
//! # Example
//!
//! ```rust,ignore
//! use amoeba_core::admission::{ClientIdentity, RateLimiter, RateLimitConfig, RateLimitTier};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! let caller = ClientIdentity::new("203.0.113.7").with_subject("user-42");
//!
//! limiter.check(&RateLimitTier::strict(), &caller).await?;
//! ```

pub mod store;

pub use store::{InMemoryRateLimitStore, RateLimitEntry, RateLimitStore, RedisRateLimitStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CoreError, ErrorCode, ErrorDetails, Result};
use crate::telemetry::AdmissionMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Disabled limiters admit everything
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// How often expired entries are purged
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Prefix applied to every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Shared store; in-memory when unset
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Fall back to the in-memory store when the shared store errors
    #[serde(default = "default_enabled")]
    pub graceful_degradation: bool,

    /// Per-tier rule overrides, keyed by tier name
    #[serde(default)]
    pub tiers: HashMap<String, RateLimitRule>,
}

fn default_enabled() -> bool {
    true
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_key_prefix() -> String {
    "amoeba:ratelimit:".to_string()
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            cleanup_interval: default_cleanup_interval(),
            key_prefix: default_key_prefix(),
            redis_url: None,
            graceful_degradation: default_enabled(),
            tiers: HashMap::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rules, tiers and keys
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub max_requests: u64,
    /// Shown to callers that are turned away
    #[serde(default = "default_message")]
    pub message: String,
}

fn default_message() -> String {
    "Too many requests, please try again later".to_string()
}

impl RateLimitRule {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            window,
            max_requests,
            message: default_message(),
        }
    }

    pub fn per_minute(max_requests: u64) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// The caller as seen at the admission boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentity {
    /// Network address, `"unknown"` when not available
    pub address: String,
    /// Authenticated subject
    pub subject: Option<String>,
    /// API credential identifier
    pub credential: Option<String>,
}

impl ClientIdentity {
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            address: if address.is_empty() {
                "unknown".to_string()
            } else {
                address
            },
            subject: None,
            credential: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

type KeyFn = dyn Fn(&ClientIdentity) -> String + Send + Sync;

/// How a caller is turned into a counter key.
#[derive(Clone, Default)]
pub enum KeyStrategy {
    /// `"<address>:<subject|anonymous>"`
    #[default]
    AddressAndSubject,
    AddressOnly,
    Custom(Arc<KeyFn>),
}

impl KeyStrategy {
    pub fn custom<F>(func: F) -> Self
    where
        F: Fn(&ClientIdentity) -> String + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(func))
    }

    /// Key by API credential, falling back to the address.
    pub fn per_credential() -> Self {
        Self::custom(|identity| match &identity.credential {
            Some(credential) => format!("credential:{}", credential),
            None => identity.address.clone(),
        })
    }

    pub fn key_for(&self, identity: &ClientIdentity) -> String {
        match self {
            Self::AddressAndSubject => format!(
                "{}:{}",
                identity.address,
                identity.subject.as_deref().unwrap_or("anonymous")
            ),
            Self::AddressOnly => identity.address.clone(),
            Self::Custom(func) => func(identity),
        }
    }
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddressAndSubject => write!(f, "AddressAndSubject"),
            Self::AddressOnly => write!(f, "AddressOnly"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// A named rule plus the key strategy it applies to.
#[derive(Debug, Clone)]
pub struct RateLimitTier {
    pub name: String,
    pub rule: RateLimitRule,
    pub key: KeyStrategy,
}

impl RateLimitTier {
    pub fn new(name: impl Into<String>, rule: RateLimitRule) -> Self {
        Self {
            name: name.into(),
            rule,
            key: KeyStrategy::default(),
        }
    }

    /// Expensive mutations and job creation.
    pub fn strict() -> Self {
        Self::new(
            "strict",
            RateLimitRule::per_minute(5)
                .with_message("Too many requests to this endpoint. Please try again in a minute."),
        )
    }

    /// Authenticated reads.
    pub fn standard() -> Self {
        Self::new("standard", RateLimitRule::per_minute(60))
    }

    /// High-frequency polling.
    pub fn generous() -> Self {
        Self::new("generous", RateLimitRule::per_minute(120))
    }

    /// Unauthenticated endpoints, keyed by address only.
    pub fn public() -> Self {
        Self::new("public", RateLimitRule::per_minute(30)).with_key_strategy(KeyStrategy::AddressOnly)
    }

    pub fn ai_generation() -> Self {
        Self::new(
            "ai_generation",
            RateLimitRule::per_minute(10).with_message(
                "AI generation rate limit reached. Please wait before generating more content.",
            ),
        )
    }

    pub fn with_key_strategy(mut self, key: KeyStrategy) -> Self {
        self.key = key;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Limiter
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    /// Seconds until the window resets, set when denied
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    fn unlimited(now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit: u64::MAX,
            remaining: u64::MAX,
            reset_at: now,
            retry_after_secs: None,
        }
    }

    fn from_entry(entry: &RateLimitEntry, max_requests: u64, now: DateTime<Utc>) -> Self {
        let allowed = entry.count <= max_requests;
        Self {
            allowed,
            limit: max_requests,
            remaining: max_requests.saturating_sub(entry.count),
            reset_at: entry.reset_at,
            retry_after_secs: (!allowed).then(|| retry_after_secs(entry.reset_at, now)),
        }
    }
}

/// Whole seconds until `reset_at`, rounded up, never below one.
fn retry_after_secs(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (reset_at - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}

struct LimiterInner {
    config: RateLimitConfig,
    shared: Option<Arc<dyn RateLimitStore>>,
    local: InMemoryRateLimitStore,
}

/// Keyed rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl RateLimiter {
    /// In-memory limiter.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                config,
                shared: None,
                local: InMemoryRateLimitStore::new(),
            }),
        }
    }

    /// Limiter over a shared store, with the in-memory store as fallback.
    pub fn with_store(config: RateLimitConfig, store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                config,
                shared: Some(store),
                local: InMemoryRateLimitStore::new(),
            }),
        }
    }

    /// Build from config, connecting to Redis when a URL is set. A failed
    /// connection falls back to in-memory limiting unless degradation is off.
    pub async fn from_config(config: RateLimitConfig) -> Result<Self> {
        let Some(url) = config.redis_url.clone() else {
            debug!("No Redis URL configured, using in-memory rate limiting");
            return Ok(Self::new(config));
        };

        match RedisRateLimitStore::connect(&url, config.key_prefix.clone()).await {
            Ok(store) => Ok(Self::with_store(config, Arc::new(store))),
            Err(e) if config.graceful_degradation => {
                warn!(error = %e, "Failed to connect to Redis for rate limiting, using in-memory fallback");
                Ok(Self::new(config))
            }
            Err(e) => Err(e),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &'static str {
        match &self.inner.shared {
            Some(store) => store.backend(),
            None => self.inner.local.backend(),
        }
    }

    /// Count a request for `key` against `max_requests` per `window`.
    pub async fn allow(&self, key: &str, window: Duration, max_requests: u64) -> Result<RateLimitDecision> {
        self.allow_at(key, window, max_requests, Utc::now()).await
    }

    pub async fn allow_at(
        &self,
        key: &str,
        window: Duration,
        max_requests: u64,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        if !self.inner.config.enabled {
            return Ok(RateLimitDecision::unlimited(now));
        }

        let entry = self.hit(key, window, now).await?;
        let decision = RateLimitDecision::from_entry(&entry, max_requests, now);

        if !decision.allowed {
            warn!(
                key,
                count = entry.count,
                limit = max_requests,
                retry_after_secs = decision.retry_after_secs,
                "Rate limit exceeded"
            );
        }
        Ok(decision)
    }

    /// Admit `identity` under `tier`, or return a `RateLimitExceeded` error.
    pub async fn check(&self, tier: &RateLimitTier, identity: &ClientIdentity) -> Result<RateLimitDecision> {
        self.check_at(tier, identity, Utc::now()).await
    }

    pub async fn check_at(
        &self,
        tier: &RateLimitTier,
        identity: &ClientIdentity,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        let rule = self.inner.config.tiers.get(&tier.name).unwrap_or(&tier.rule);
        let key = format!("{}:{}", tier.name, tier.key.key_for(identity));

        let decision = self
            .allow_at(&key, rule.window, rule.max_requests, now)
            .await?;
        AdmissionMetrics::checked(&tier.name, decision.allowed);

        if decision.allowed {
            return Ok(decision);
        }

        let retry_after = decision.retry_after_secs.unwrap_or(1);
        Err(CoreError::new(ErrorCode::RateLimitExceeded, rule.message.clone()).with_details(
            ErrorDetails::new()
                .with_entity("rate_limit_key", key)
                .with_context("tier", &tier.name)
                .with_context("limit", decision.limit)
                .with_retry_after(retry_after),
        ))
    }

    /// Remove expired entries from the stores.
    pub async fn purge_expired(&self) -> Result<usize> {
        self.purge_expired_at(Utc::now()).await
    }

    pub async fn purge_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = self.inner.local.purge_expired(now).await?;
        if let Some(store) = &self.inner.shared {
            removed += store.purge_expired(now).await?;
        }
        if removed > 0 {
            AdmissionMetrics::evicted(removed);
            debug!(removed, "Purged expired rate limit entries");
        }
        Ok(removed)
    }

    /// Number of keys tracked in process memory.
    pub fn tracked_keys(&self) -> usize {
        self.inner.local.len()
    }

    /// Spawn the periodic purge at `config.cleanup_interval`.
    pub fn start_cleanup(&self) -> CleanupHandle {
        self.start_cleanup_every(self.inner.config.cleanup_interval)
    }

    pub fn start_cleanup_every(&self, interval: Duration) -> CleanupHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let limiter = self.clone();

        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            timer.tick().await;

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = timer.tick() => {
                        if let Err(e) = limiter.purge_expired().await {
                            warn!(error = %e, "Rate limit cleanup failed");
                        }
                    }
                }
            }
            debug!("Rate limit cleanup stopped");
        });

        CleanupHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn hit(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<RateLimitEntry> {
        let Some(store) = &self.inner.shared else {
            return self.inner.local.hit(key, window, now).await;
        };

        match store.hit(key, window, now).await {
            Ok(entry) => Ok(entry),
            Err(e) if self.inner.config.graceful_degradation => {
                warn!(
                    error = %e,
                    backend = store.backend(),
                    "Rate limit store failed, using in-memory fallback"
                );
                self.inner.local.hit(key, window, now).await
            }
            Err(e) => Err(e),
        }
    }
}

/// Stops the periodic purge.
pub struct CleanupHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Rate limit cleanup task ended abnormally");
        }
    }
}
