//! Daemon configuration, loaded from environment variables with defaults —
//! same shape as the teacher daemon's `Config::from_env`.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};

/// Configuration loaded from the environment at startup.
pub struct Config {
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    pub admin_token_file: PathBuf,
    pub redis_url: String,
    pub pricing_file: PathBuf,
    pub service_rates_file: PathBuf,
    /// Freshness floor for PR/SRR in-process caches, in seconds.
    pub pricing_cache_secs: u64,
    pub service_rate_cache_secs: u64,
    /// Default sticky-binding TTL, in seconds.
    pub sticky_ttl_secs: u64,
    /// Fixed UTC offset, in minutes, that daily-cost and daily-usage keys
    /// are midnight-aligned against (e.g. `-300` for US Eastern standard
    /// time). A named tz database isn't carried as a dependency since the
    /// relay only needs a day boundary, not DST-aware local wall-clock
    /// display; operators in a DST-observing region update this twice a
    /// year.
    pub daily_reset_utc_offset_minutes: i32,
}

impl Config {
    pub fn from_env() -> Self {
        let home = dirs::home_dir().expect("cannot determine home directory");
        let data_dir = std::env::var("FULCRUM_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".fulcrum"));

        Self {
            socket_path: data_dir.join("fulcrum.sock"),
            admin_token_file: data_dir.join("fulcrum.token"),
            redis_url: std::env::var("FULCRUM_REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            pricing_file: std::env::var("FULCRUM_PRICING_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("pricing.yaml")),
            service_rates_file: std::env::var("FULCRUM_SERVICE_RATES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("service_rates.yaml")),
            pricing_cache_secs: 300,
            service_rate_cache_secs: 60,
            sticky_ttl_secs: 600,
            daily_reset_utc_offset_minutes: std::env::var("FULCRUM_DAILY_RESET_UTC_OFFSET_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            data_dir,
        }
    }
}

/// The midnight-aligned `YYYY-MM-DD` key for `now`, under a fixed UTC
/// offset — shifting the instant before formatting is equivalent to
/// computing the calendar date in that offset's local time, without
/// needing a `FixedOffset` value (which rejects offsets outside ±24h;
/// `daily_reset_utc_offset_minutes` is always within that range in
/// practice, but the shift-then-format form has no such constraint to
/// violate).
pub fn day_key(now: DateTime<Utc>, offset_minutes: i32) -> String {
    (now + Duration::minutes(offset_minutes as i64)).format("%Y-%m-%d").to_string()
}
