//! Sliding-window quota engine.
//!
//! Three independent windows per client: requests-per-minute,
//! requests-per-day, tokens-per-minute. Counters live in an external fast
//! key-value store with a TTL equal to the window, keyed by the epoch
//! bucket, so expiry does the sliding. Checks are a single atomic
//! increment; the store is the source of truth under concurrency.
//!
//! The engine leans available: when the store is unreachable a check
//! logs and admits the request rather than failing it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

use crate::config::QuotaDefaults;
use crate::tenant::RateLimits;

/// Which window rejected the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    RequestsPerMinute,
    RequestsPerDay,
    TokensPerMinute,
}

impl QuotaScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestsPerMinute => "requests_per_minute",
            Self::RequestsPerDay => "requests_per_day",
            Self::TokensPerMinute => "tokens_per_minute",
        }
    }

    fn window_secs(self) -> u64 {
        match self {
            Self::RequestsPerMinute | Self::TokensPerMinute => 60,
            Self::RequestsPerDay => 86_400,
        }
    }

    fn key(self, client_id: &str, now_secs: i64) -> String {
        let bucket = now_secs / self.window_secs() as i64;
        match self {
            Self::RequestsPerMinute => format!("rl:rpm:{client_id}:{bucket}"),
            Self::RequestsPerDay => format!("rl:rpd:{client_id}:{bucket}"),
            Self::TokensPerMinute => format!("rl:tpm:{client_id}:{bucket}"),
        }
    }
}

#[derive(Debug, Error)]
#[error("quota exceeded for {}", scope.as_str())]
pub struct QuotaExceeded {
    pub scope: QuotaScope,
}

#[derive(Debug, Error)]
#[error("counter store unavailable: {0}")]
pub struct CounterError(pub String);

/// Atomic counter backend.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `amount` to `key`, creating it with `ttl_secs` when new, and
    /// return the post-increment value. Must be atomic on the store side.
    async fn incr_with_ttl(&self, key: &str, amount: u64, ttl_secs: u64)
    -> Result<u64, CounterError>;
}

/// Redis-backed counters: one atomic INCRBY+EXPIRE pipeline per check.
pub struct RedisCounterStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisCounterStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_with_ttl(
        &self,
        key: &str,
        amount: u64,
        ttl_secs: u64,
    ) -> Result<u64, CounterError> {
        let mut conn = self.manager.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(key, amount)
            .expire(key, ttl_secs as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| CounterError(e.to_string()))?;
        Ok(count)
    }
}

/// In-process counters for tests and single-node development.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_with_ttl(
        &self,
        key: &str,
        amount: u64,
        ttl_secs: u64,
    ) -> Result<u64, CounterError> {
        let mut counters = self.counters.lock().expect("counter lock poisoned");
        let now = Instant::now();
        counters.retain(|_, (_, expiry)| *expiry > now);
        let entry = counters
            .entry(key.to_string())
            .or_insert((0, now + Duration::from_secs(ttl_secs)));
        entry.0 += amount;
        Ok(entry.0)
    }
}

/// A store that always fails, for exercising the lean-available path.
#[cfg(test)]
pub struct BrokenCounterStore;

#[cfg(test)]
#[async_trait]
impl CounterStore for BrokenCounterStore {
    async fn incr_with_ttl(&self, _: &str, _: u64, _: u64) -> Result<u64, CounterError> {
        Err(CounterError("store is down".into()))
    }
}

pub struct QuotaEngine {
    store: Arc<dyn CounterStore>,
    defaults: QuotaDefaults,
}

impl QuotaEngine {
    pub fn new(store: Arc<dyn CounterStore>, defaults: QuotaDefaults) -> Self {
        Self { store, defaults }
    }

    /// Admission check for one request: counts it against the rpm and rpd
    /// windows and rejects when either exceeds its effective limit, or
    /// when the tpm window is already over budget from previous turns.
    pub async fn check_request(
        &self,
        client_id: &str,
        overrides: RateLimits,
    ) -> Result<(), QuotaExceeded> {
        self.check_request_at(client_id, overrides, chrono::Utc::now().timestamp())
            .await
    }

    pub(crate) async fn check_request_at(
        &self,
        client_id: &str,
        overrides: RateLimits,
        now_secs: i64,
    ) -> Result<(), QuotaExceeded> {
        let checks = [
            (QuotaScope::RequestsPerMinute, 1u64, effective_limit(overrides.rpm, self.defaults.rpm)),
            (QuotaScope::RequestsPerDay, 1u64, effective_limit(overrides.rpd, self.defaults.rpd)),
            // Tokens only reject the *next* request; the counter is fed by
            // record_tokens, so this is a read (increment by zero).
            (QuotaScope::TokensPerMinute, 0u64, effective_limit(overrides.tpm, self.defaults.tpm)),
        ];

        for (scope, amount, limit) in checks {
            let Some(limit) = limit else { continue };
            let key = scope.key(client_id, now_secs);
            match self
                .store
                .incr_with_ttl(&key, amount, scope.window_secs())
                .await
            {
                Ok(count) => {
                    if count > limit {
                        return Err(QuotaExceeded { scope });
                    }
                }
                Err(e) => {
                    // Advisory under partition: admit and log.
                    warn!(client_id, scope = scope.as_str(), error = %e,
                        "quota check skipped, counter store unavailable");
                }
            }
        }
        Ok(())
    }

    /// Feed consumed tokens into the tpm window. Never fails the request.
    pub async fn record_tokens(&self, client_id: &str, total_tokens: u64) {
        self.record_tokens_at(client_id, total_tokens, chrono::Utc::now().timestamp())
            .await;
    }

    pub(crate) async fn record_tokens_at(&self, client_id: &str, total_tokens: u64, now_secs: i64) {
        if total_tokens == 0 {
            return;
        }
        let scope = QuotaScope::TokensPerMinute;
        let key = scope.key(client_id, now_secs);
        if let Err(e) = self
            .store
            .incr_with_ttl(&key, total_tokens, scope.window_secs())
            .await
        {
            warn!(client_id, tokens = total_tokens, error = %e,
                "token accounting failed, counter store unavailable");
        }
    }
}

/// Client override wins unless zero; zero falls back to the default.
/// Both zero means the scope is unlimited.
fn effective_limit(override_value: u32, default_value: u32) -> Option<u64> {
    if override_value > 0 {
        Some(override_value as u64)
    } else if default_value > 0 {
        Some(default_value as u64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(defaults: QuotaDefaults) -> QuotaEngine {
        QuotaEngine::new(Arc::new(MemoryCounterStore::default()), defaults)
    }

    fn limits(rpm: u32, rpd: u32, tpm: u32) -> RateLimits {
        RateLimits { rpm, rpd, tpm }
    }

    #[test]
    fn effective_limit_fallback() {
        assert_eq!(effective_limit(5, 60), Some(5));
        assert_eq!(effective_limit(0, 60), Some(60));
        assert_eq!(effective_limit(0, 0), None);
    }

    #[tokio::test]
    async fn rpm_window_rejects_third_request() {
        let engine = engine_with(QuotaDefaults { rpm: 0, rpd: 0, tpm: 0 });
        let limits = limits(2, 0, 0);
        let t0 = 1_700_000_000;

        assert!(engine.check_request_at("c1", limits, t0).await.is_ok());
        assert!(engine.check_request_at("c1", limits, t0 + 1).await.is_ok());
        let err = engine.check_request_at("c1", limits, t0 + 2).await.unwrap_err();
        assert_eq!(err.scope, QuotaScope::RequestsPerMinute);

        // Next minute bucket admits again.
        assert!(engine.check_request_at("c1", limits, t0 + 62).await.is_ok());
    }

    #[tokio::test]
    async fn zero_override_falls_back_to_default() {
        let engine = engine_with(QuotaDefaults { rpm: 1, rpd: 0, tpm: 0 });
        let limits = limits(0, 0, 0);
        let t0 = 1_700_000_000;

        assert!(engine.check_request_at("c1", limits, t0).await.is_ok());
        assert!(engine.check_request_at("c1", limits, t0).await.is_err());
    }

    #[tokio::test]
    async fn token_window_rejects_next_request_only() {
        let engine = engine_with(QuotaDefaults { rpm: 0, rpd: 0, tpm: 0 });
        let limits = limits(0, 0, 10);
        let t0 = 1_700_000_000;

        // Under budget: admitted, then a large turn lands.
        assert!(engine.check_request_at("c1", limits, t0).await.is_ok());
        engine.record_tokens_at("c1", 25, t0).await;

        // The overage rejects the next request in the same window...
        let err = engine.check_request_at("c1", limits, t0 + 5).await.unwrap_err();
        assert_eq!(err.scope, QuotaScope::TokensPerMinute);

        // ...but not once the window has rolled over.
        assert!(engine.check_request_at("c1", limits, t0 + 61).await.is_ok());
    }

    #[tokio::test]
    async fn daily_window_is_independent() {
        let engine = engine_with(QuotaDefaults { rpm: 0, rpd: 2, tpm: 0 });
        let limits = limits(0, 0, 0);
        let t0 = 1_700_000_000;

        assert!(engine.check_request_at("c1", limits, t0).await.is_ok());
        assert!(engine.check_request_at("c1", limits, t0 + 3600).await.is_ok());
        let err = engine
            .check_request_at("c1", limits, t0 + 7200)
            .await
            .unwrap_err();
        assert_eq!(err.scope, QuotaScope::RequestsPerDay);
    }

    #[tokio::test]
    async fn clients_do_not_share_windows() {
        let engine = engine_with(QuotaDefaults { rpm: 1, rpd: 0, tpm: 0 });
        let limits = limits(0, 0, 0);
        let t0 = 1_700_000_000;

        assert!(engine.check_request_at("c1", limits, t0).await.is_ok());
        assert!(engine.check_request_at("c2", limits, t0).await.is_ok());
        assert!(engine.check_request_at("c1", limits, t0).await.is_err());
    }

    #[tokio::test]
    async fn store_outage_admits_requests() {
        let engine = QuotaEngine::new(
            Arc::new(BrokenCounterStore),
            QuotaDefaults { rpm: 1, rpd: 1, tpm: 1 },
        );
        let limits = limits(0, 0, 0);
        for _ in 0..5 {
            assert!(engine.check_request("c1", limits).await.is_ok());
        }
        // Recording against a broken store must not panic or fail.
        engine.record_tokens("c1", 100).await;
    }
}
