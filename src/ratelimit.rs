//! Rate Limiter / Usage Gate (RLG) — atomic admission check and counter
//! increments, grounded on the teacher's sliding-window `RateLimiter`
//! (`auth.rs`) and per-key windowed counters (`pool/rate_tracker.rs`), here
//! promoted from in-process state to atomic counters in the shared store so
//! admission is correct across every worker task.
//!
//! All costs are tracked in micro-dollars (1e-6 USD), matching CC's
//! `realCostMicro` output, including the window bucket's cost counter —
//! the persisted schema only fixes the key names, not an internal unit.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Datelike, Utc};

use crate::config::day_key;
use crate::error::FulcrumError;
use crate::store::SharedStore;

/// The subset of `ApiKey` limits the gate needs. A window of zero disables
/// the per-window admission check entirely.
#[derive(Debug, Clone)]
pub struct KeyLimits {
    pub rate_limit_window_secs: i64,
    pub rate_limit_requests: i64,
    pub rate_limit_tokens: i64,
    pub rate_limit_cost_micro: i64,
    pub total_cost_limit_usd: Option<f64>,
    pub daily_cost_limit_usd: Option<f64>,
    pub weekly_cost_limit_usd: Option<f64>,
    /// e.g. `Some("opus")` for `weeklyOpusCostLimit`.
    pub weekly_family: Option<String>,
}

pub struct RateLimitGate {
    store: Arc<dyn SharedStore>,
    /// Fixed UTC offset, in minutes, the daily-cost key is midnight-aligned
    /// against — see [`crate::config::Config::daily_reset_utc_offset_minutes`].
    daily_reset_utc_offset_minutes: i32,
}

impl RateLimitGate {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self::with_daily_reset_offset(store, 0)
    }

    pub fn with_daily_reset_offset(store: Arc<dyn SharedStore>, daily_reset_utc_offset_minutes: i32) -> Self {
        Self { store, daily_reset_utc_offset_minutes }
    }

    fn requests_key(key_id: &str) -> String {
        format!("rate_limit:requests:{key_id}")
    }
    fn tokens_key(key_id: &str) -> String {
        format!("rate_limit:tokens:{key_id}")
    }
    fn cost_key(key_id: &str) -> String {
        format!("rate_limit:cost:{key_id}")
    }
    fn window_start_key(key_id: &str) -> String {
        format!("rate_limit:window_start:{key_id}")
    }
    fn total_cost_key(key_id: &str) -> String {
        format!("usage:cost:total:{key_id}")
    }
    fn daily_cost_key(key_id: &str, day: &str) -> String {
        format!("usage:cost:daily:{key_id}:{day}")
    }
    fn weekly_cost_key(key_id: &str, family: &str, iso_week: &str) -> String {
        format!("usage:cost:weekly:{family}:{key_id}:{iso_week}")
    }

    /// Admission check for an inbound request. On success, increments
    /// `requestCount`; tokens/cost are updated later by UR once the
    /// response settles, since admission can't know them in advance.
    ///
    /// All of the quota checks below are pure reads against counters this
    /// method never writes (UR owns them), so a stale read only ever costs
    /// a request admitted slightly past a cap it's about to exceed anyway —
    /// acceptable under at-least-once accounting. `requestCount` is the one
    /// counter both checked and incremented here, which is where a plain
    /// read-then-write would race concurrent admitters against the real
    /// store: every racer can observe the same under-the-cap count before
    /// any of them commits its increment, over-admitting by up to the
    /// number of concurrent callers. `incr_by` is a single atomic command
    /// against the real store, so the request counter is incremented first
    /// and any rejection (this dimension or a later one) compensates with a
    /// decrement, making the counter itself the serialization point instead
    /// of the read.
    pub async fn admit(&self, key_id: &str, limits: &KeyLimits, now: DateTime<Utc>) -> Result<(), FulcrumError> {
        let mut reserved_request = false;

        if limits.rate_limit_window_secs > 0 {
            self.roll_window_if_expired(key_id, limits.rate_limit_window_secs, now)
                .await
                .map_err(|_| FulcrumError::Internal)?;

            let token_count = self.read_i64(&Self::tokens_key(key_id)).await?;
            let cost_micro = self.read_i64(&Self::cost_key(key_id)).await?;
            if token_count > limits.rate_limit_tokens {
                return Err(FulcrumError::RateLimitExceeded { dimension: "tokens" });
            }
            if cost_micro > limits.rate_limit_cost_micro {
                return Err(FulcrumError::RateLimitExceeded { dimension: "cost" });
            }

            let request_count = self
                .store
                .incr_by(&Self::requests_key(key_id), 1)
                .await
                .map_err(|_| FulcrumError::Internal)?;
            reserved_request = true;
            if request_count > limits.rate_limit_requests {
                self.release_request(key_id).await;
                return Err(FulcrumError::RateLimitExceeded { dimension: "requests" });
            }
            self.store
                .expire(&Self::requests_key(key_id), limits.rate_limit_window_secs)
                .await
                .map_err(|_| FulcrumError::Internal)?;
        }

        if let Err(err) = self.check_cost_caps(key_id, limits, now).await {
            if reserved_request {
                self.release_request(key_id).await;
            }
            return Err(err);
        }
        Ok(())
    }

    async fn check_cost_caps(&self, key_id: &str, limits: &KeyLimits, now: DateTime<Utc>) -> Result<(), FulcrumError> {
        if let Some(cap) = limits.total_cost_limit_usd {
            let total = self.read_f64(&Self::total_cost_key(key_id)).await?;
            if total > cap {
                return Err(FulcrumError::QuotaExceeded { dimension: "lifetime" });
            }
        }
        if let Some(cap) = limits.daily_cost_limit_usd {
            let day = day_key(now, self.daily_reset_utc_offset_minutes);
            let daily = self.read_f64(&Self::daily_cost_key(key_id, &day)).await?;
            if daily > cap {
                return Err(FulcrumError::QuotaExceeded { dimension: "daily" });
            }
        }
        if let (Some(cap), Some(family)) = (limits.weekly_cost_limit_usd, limits.weekly_family.as_deref()) {
            let iso_week = format!("{}-W{:02}", now.iso_week().year(), now.iso_week().week());
            let weekly = self.read_f64(&Self::weekly_cost_key(key_id, family, &iso_week)).await?;
            if weekly > cap {
                return Err(FulcrumError::QuotaExceeded { dimension: "weekly" });
            }
        }
        Ok(())
    }

    /// Compensating decrement for a request counted by [`Self::admit`]'s
    /// atomic reservation but ultimately rejected by a later check.
    async fn release_request(&self, key_id: &str) {
        let _ = self.store.incr_by(&Self::requests_key(key_id), -1).await;
    }

    /// Called by UR once usage is known: increments the window's token/cost
    /// counters, a no-op if the window has already rolled past this request.
    pub async fn record_window_usage(
        &self,
        key_id: &str,
        tokens: i64,
        cost_micro: i64,
        window_secs: i64,
        window_started_at: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if window_secs <= 0 {
            return Ok(());
        }
        let current_start = self.store.get(&Self::window_start_key(key_id)).await?;
        let still_current = current_start
            .and_then(|s| s.parse::<i64>().ok())
            .map(|ws| ws == window_started_at && now.timestamp_millis() < ws + window_secs * 1000)
            .unwrap_or(false);
        if !still_current {
            return Ok(());
        }
        self.store.incr_by(&Self::tokens_key(key_id), tokens).await?;
        self.store.incr_by(&Self::cost_key(key_id), cost_micro).await?;
        Ok(())
    }

    async fn roll_window_if_expired(&self, key_id: &str, window_secs: i64, now: DateTime<Utc>) -> Result<()> {
        let window_start = self.store.get(&Self::window_start_key(key_id)).await?;
        let now_ms = now.timestamp_millis();
        let window_ms = window_secs * 1000;
        let needs_reset = match window_start.and_then(|s| s.parse::<i64>().ok()) {
            None => true,
            Some(ws) => now_ms >= ws + window_ms,
        };
        if needs_reset {
            self.store.set(&Self::window_start_key(key_id), &now_ms.to_string()).await?;
            self.store.expire(&Self::window_start_key(key_id), window_secs).await?;
            self.store.set(&Self::requests_key(key_id), "0").await?;
            self.store.set(&Self::tokens_key(key_id), "0").await?;
            self.store.set(&Self::cost_key(key_id), "0").await?;
        }
        Ok(())
    }

    async fn read_i64(&self, key: &str) -> Result<i64, FulcrumError> {
        Ok(self
            .store
            .get(key)
            .await
            .map_err(|_| FulcrumError::Internal)?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0))
    }

    async fn read_f64(&self, key: &str) -> Result<f64, FulcrumError> {
        Ok(self
            .store
            .get(key)
            .await
            .map_err(|_| FulcrumError::Internal)?
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::Duration;

    fn limits(window_secs: i64, requests: i64) -> KeyLimits {
        KeyLimits {
            rate_limit_window_secs: window_secs,
            rate_limit_requests: requests,
            rate_limit_tokens: i64::MAX,
            rate_limit_cost_micro: i64::MAX,
            total_cost_limit_usd: None,
            daily_cost_limit_usd: None,
            weekly_cost_limit_usd: None,
            weekly_family: None,
        }
    }

    /// Concrete scenario 1: 2 requests admitted per 1-minute window, a
    /// third within the same second is rejected, a fourth 60s later is
    /// admitted once the window has rolled.
    #[tokio::test]
    async fn window_admits_exactly_the_configured_count_then_resets() {
        let store = Arc::new(MemoryStore::new());
        let gate = RateLimitGate::new(store);
        let limits = limits(60, 2);
        let t0 = Utc::now();

        assert!(gate.admit("key-1", &limits, t0).await.is_ok());
        assert!(gate.admit("key-1", &limits, t0 + Duration::milliseconds(200)).await.is_ok());
        let third = gate.admit("key-1", &limits, t0 + Duration::milliseconds(400)).await;
        assert!(matches!(third, Err(FulcrumError::RateLimitExceeded { dimension: "requests" })));

        let fourth = gate.admit("key-1", &limits, t0 + Duration::seconds(61)).await;
        assert!(fourth.is_ok(), "window should have rolled after 61s");
    }

    /// Invariant 1: admission soundness under concurrency.
    #[tokio::test]
    async fn admission_soundness_under_concurrency() {
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(RateLimitGate::new(store));
        let limits = Arc::new(limits(60, 5));
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let gate = gate.clone();
            let limits = limits.clone();
            handles.push(tokio::spawn(async move { gate.admit("key-1", &limits, now).await.is_ok() }));
        }
        let mut successes = 0;
        for h in handles {
            if h.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 5);
    }

    #[tokio::test]
    async fn lifetime_cap_rejects_with_quota_exceeded() {
        let store = Arc::new(MemoryStore::new());
        store.set("usage:cost:total:key-1", "120.0").await.unwrap();
        let gate = RateLimitGate::new(store);
        let mut limits = limits(0, i64::MAX);
        limits.total_cost_limit_usd = Some(100.0);

        let err = gate.admit("key-1", &limits, Utc::now()).await.unwrap_err();
        assert!(matches!(err, FulcrumError::QuotaExceeded { dimension: "lifetime" }));
    }

    /// Daily cap keys are midnight-aligned against the configured offset,
    /// not UTC: a spend recorded under yesterday's local date shouldn't be
    /// visible to a request admitted just after UTC midnight in a
    /// west-of-UTC timezone, since locally it's still yesterday.
    #[tokio::test]
    async fn daily_cap_uses_configured_utc_offset_for_the_day_boundary() {
        let store = Arc::new(MemoryStore::new());
        let just_after_utc_midnight = DateTime::parse_from_rfc3339("2026-07-27T01:00:00Z").unwrap().with_timezone(&Utc);
        let eastern_yesterday = crate::config::day_key(just_after_utc_midnight, -5 * 60);
        store.set(&RateLimitGate::daily_cost_key("key-1", &eastern_yesterday), "90.0").await.unwrap();

        let gate = RateLimitGate::with_daily_reset_offset(store, -5 * 60);
        let mut limits = limits(0, i64::MAX);
        limits.daily_cost_limit_usd = Some(50.0);

        let err = gate.admit("key-1", &limits, just_after_utc_midnight).await.unwrap_err();
        assert!(matches!(err, FulcrumError::QuotaExceeded { dimension: "daily" }));
    }

    #[tokio::test]
    async fn daily_cap_under_utc_default_ignores_offset_day() {
        let store = Arc::new(MemoryStore::new());
        let just_after_utc_midnight = DateTime::parse_from_rfc3339("2026-07-27T01:00:00Z").unwrap().with_timezone(&Utc);
        let eastern_yesterday = crate::config::day_key(just_after_utc_midnight, -5 * 60);
        store.set(&RateLimitGate::daily_cost_key("key-1", &eastern_yesterday), "90.0").await.unwrap();

        let gate = RateLimitGate::new(store);
        let mut limits = limits(0, i64::MAX);
        limits.daily_cost_limit_usd = Some(50.0);

        assert!(gate.admit("key-1", &limits, just_after_utc_midnight).await.is_ok());
    }
}
