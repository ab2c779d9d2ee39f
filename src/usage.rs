//! Usage Recorder (UR) — consumes stream-completion events and pipelines
//! the resulting counter increments into SS, grounded on the teacher's
//! `usage_log`/`provider_daily_metrics` accumulation shape
//! (`keyvault-package/src/vault/store.rs`) generalized from a SQLite insert
//! log to SS hash increments across lifetime/daily/monthly/model windows.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::accounts::AccountRepository;
use crate::config::day_key;
use crate::keys::KeyValidator;
use crate::pricing::CostBreakdown;
use crate::ratelimit::RateLimitGate;
use crate::store::SharedStore;

const DAILY_TTL_SECS: i64 = 35 * 24 * 3600;
const MONTHLY_TTL_SECS: i64 = 400 * 24 * 3600; // ~13 months
const WEEKLY_TTL_SECS: i64 = 14 * 24 * 3600;

#[derive(Debug, Clone, Default)]
pub struct UsageCounts {
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_create_tokens: i64,
    pub cache_read_tokens: i64,
}

impl UsageCounts {
    fn all_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_create_tokens + self.cache_read_tokens
    }
}

pub struct UsageEvent<'a> {
    pub key_id: &'a str,
    pub account_id: &'a str,
    pub provider: &'a str,
    pub model: &'a str,
    pub usage: UsageCounts,
    pub cost: CostBreakdown,
    pub rated_cost_micro: i64,
    /// Weekly family bucket (e.g. `Some("opus")`) this model belongs to, if any.
    pub weekly_family: Option<&'a str>,
    /// Rate-limit window parameters so the window counters are only
    /// touched while still current; `0` disables the window update.
    pub rate_limit_window_secs: i64,
    pub window_started_at_ms: i64,
}

pub struct UsageRecorder {
    store: Arc<dyn SharedStore>,
    accounts: Arc<AccountRepository>,
    keys: Arc<KeyValidator>,
    rate_limits: Arc<RateLimitGate>,
    /// Fixed UTC offset, in minutes, the daily/model-daily aggregate keys
    /// are midnight-aligned against — see
    /// [`crate::config::Config::daily_reset_utc_offset_minutes`].
    daily_reset_utc_offset_minutes: i32,
}

impl UsageRecorder {
    pub fn new(
        store: Arc<dyn SharedStore>,
        accounts: Arc<AccountRepository>,
        keys: Arc<KeyValidator>,
        rate_limits: Arc<RateLimitGate>,
    ) -> Self {
        Self::with_daily_reset_offset(store, accounts, keys, rate_limits, 0)
    }

    pub fn with_daily_reset_offset(
        store: Arc<dyn SharedStore>,
        accounts: Arc<AccountRepository>,
        keys: Arc<KeyValidator>,
        rate_limits: Arc<RateLimitGate>,
        daily_reset_utc_offset_minutes: i32,
    ) -> Self {
        Self { store, accounts, keys, rate_limits, daily_reset_utc_offset_minutes }
    }

    /// Record a completed request. Failures are logged and swallowed —
    /// accounting never blocks or fails the client response.
    pub async fn record(&self, event: UsageEvent<'_>) {
        if let Err(err) = self.record_inner(&event).await {
            tracing::error!(key_id = event.key_id, account_id = event.account_id, error = %err, "usage recording failed");
        }
    }

    async fn record_inner(&self, event: &UsageEvent<'_>) -> Result<()> {
        let now = Utc::now();
        let day = day_key(now, self.daily_reset_utc_offset_minutes);

        // 1+2: lifetime/daily/monthly/model-daily/model-monthly aggregates.
        self.bump_aggregate(&format!("usage:{}:alltime", event.key_id), event, None).await?;
        self.bump_aggregate(&format!("usage:{}:daily:{day}", event.key_id), event, Some(DAILY_TTL_SECS)).await?;
        self.bump_aggregate(
            &format!("usage:{}:monthly:{}", event.key_id, now.format("%Y-%m")),
            event,
            Some(MONTHLY_TTL_SECS),
        )
        .await?;
        self.bump_aggregate(
            &format!("usage:{}:model:alltime:{}", event.key_id, event.model),
            event,
            None,
        )
        .await?;
        self.bump_aggregate(
            &format!("usage:{}:model:daily:{}:{day}", event.key_id, event.model),
            event,
            Some(DAILY_TTL_SECS),
        )
        .await?;
        self.bump_aggregate(
            &format!("usage:{}:model:monthly:{}:{}", event.key_id, event.model, now.format("%Y-%m")),
            event,
            Some(MONTHLY_TTL_SECS),
        )
        .await?;

        if event.cost.has_pricing {
            self.store
                .incr_by_float(&format!("usage:cost:total:{}", event.key_id), event.cost.total_cost_usd)
                .await?;
        }

        // 3: rate-window token/cost counters, only while still current.
        self.rate_limits
            .record_window_usage(
                event.key_id,
                event.usage.all_tokens(),
                event.cost.real_cost_micro,
                event.rate_limit_window_secs,
                event.window_started_at_ms,
                now,
            )
            .await?;

        // 4: family-scoped weekly counter.
        if let Some(family) = event.weekly_family {
            let iso_week = {
                use chrono::Datelike;
                format!("{}-W{:02}", now.iso_week().year(), now.iso_week().week())
            };
            self.store
                .incr_by_float(
                    &format!("usage:cost:weekly:{}:{}:{}", family, event.key_id, iso_week),
                    event.cost.total_cost_usd,
                )
                .await?;
            self.store
                .expire(&format!("usage:cost:weekly:{}:{}:{}", family, event.key_id, iso_week), WEEKLY_TTL_SECS)
                .await?;
        }

        // 5: touch lastUsedAt on both key and account.
        self.keys.touch_last_used(event.key_id).await?;
        self.accounts.touch_last_used(event.provider, event.account_id).await?;

        Ok(())
    }

    async fn bump_aggregate(&self, key: &str, event: &UsageEvent<'_>, ttl_secs: Option<i64>) -> Result<()> {
        self.store.incr_by(&format!("{key}:requests"), event.usage.requests).await?;
        self.store.incr_by(&format!("{key}:inputTokens"), event.usage.input_tokens).await?;
        self.store.incr_by(&format!("{key}:outputTokens"), event.usage.output_tokens).await?;
        self.store.incr_by(&format!("{key}:cacheCreateTokens"), event.usage.cache_create_tokens).await?;
        self.store.incr_by(&format!("{key}:cacheReadTokens"), event.usage.cache_read_tokens).await?;
        self.store.incr_by(&format!("{key}:allTokens"), event.usage.all_tokens()).await?;
        if event.cost.has_pricing {
            self.store.incr_by(&format!("{key}:realCostMicro"), event.cost.real_cost_micro).await?;
            self.store.incr_by(&format!("{key}:ratedCostMicro"), event.rated_cost_micro).await?;
        }
        if let Some(ttl) = ttl_secs {
            for suffix in [
                "requests",
                "inputTokens",
                "outputTokens",
                "cacheCreateTokens",
                "cacheReadTokens",
                "allTokens",
                "realCostMicro",
                "ratedCostMicro",
            ] {
                self.store.expire(&format!("{key}:{suffix}"), ttl).await?;
            }
        }
        Ok(())
    }
}
