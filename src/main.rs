//! fulcrum — multi-tenant LLM relay admission, upstream scheduling, and
//! usage/limit accounting daemon.
//!
//! Runs as a system service, listening on a Unix socket for a small
//! JSON-RPC control surface (health, usage, and admin seeding methods).
//! The request-admission → scheduling → accounting pipeline (KV → RLG →
//! SCH → PE → UR) is driven by whatever process embeds `fulcrum` as a
//! library; this binary's job is to stand the pipeline up and keep it
//! running.
//!
//! Security:
//! - Usage/limit/account state lives in the shared store, not locally.
//! - Bearer token auth on all `fulcrum.admin.*` methods.
//! - Token file with 0600 permissions (self-healing).
//! - Per-caller rate limiting on the control socket.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

mod accounts;
mod admin_auth;
mod config;
mod error;
mod health;
mod keys;
mod pricing;
mod proxy;
mod ratelimit;
mod scheduler;
mod server;
mod service_rate;
mod store;
mod usage;

use accounts::AccountRepository;
use admin_auth::AdminAuthGuard;
use config::Config;
use health::UpstreamHealthTracker;
use keys::KeyValidator;
use pricing::PricingRegistry;
use ratelimit::RateLimitGate;
use scheduler::Scheduler;
use service_rate::ServiceRateRegistry;
use store::redis::RedisStore;
use store::SharedStore;
use usage::UsageRecorder;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fulcrum=info".into()),
        )
        .with_target(false)
        .init();

    info!("fulcrum v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    std::fs::create_dir_all(&config.data_dir)?;

    // ── Admin Auth Bootstrap ────────────────────────────────────────
    let admin_auth = AdminAuthGuard::bootstrap(&config.admin_token_file)
        .context("failed to bootstrap admin auth")?;
    info!(
        token_file = %admin_auth.token_file_path().display(),
        "admin auth ready — bearer token required for fulcrum.admin.* methods"
    );

    // ── Shared Store ────────────────────────────────────────────────
    let store: Arc<dyn SharedStore> = Arc::new(
        RedisStore::connect(&config.redis_url)
            .await
            .context("failed to connect to shared store")?,
    );

    // ── Pricing / Service-Rate Registries ───────────────────────────
    let pricing = Arc::new(
        PricingRegistry::load(config.pricing_file.clone(), Duration::from_secs(config.pricing_cache_secs))
            .await
            .context("failed to load pricing catalog")?,
    );
    let service_rates = Arc::new(
        ServiceRateRegistry::load(config.service_rates_file.clone(), Duration::from_secs(config.service_rate_cache_secs)).await,
    );

    // ── Core Components ─────────────────────────────────────────────
    let accounts = Arc::new(AccountRepository::new(Arc::clone(&store)));
    let health = Arc::new(UpstreamHealthTracker::new(Arc::clone(&store)));
    let keys = Arc::new(KeyValidator::new(Arc::clone(&store)));
    let rate_limits = Arc::new(RateLimitGate::with_daily_reset_offset(
        Arc::clone(&store),
        config.daily_reset_utc_offset_minutes,
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&accounts),
        Arc::clone(&health),
        config.sticky_ttl_secs as i64,
    ));
    let usage = Arc::new(UsageRecorder::with_daily_reset_offset(
        Arc::clone(&store),
        Arc::clone(&accounts),
        Arc::clone(&keys),
        Arc::clone(&rate_limits),
        config.daily_reset_utc_offset_minutes,
    ));
    // The admission/scheduling/accounting pipeline is fully live here even
    // though this binary's own control surface never drives it directly —
    // request ingress is the job of the (out-of-scope) HTTP adapter layer
    // that embeds `ProxyEngine::admit_and_route`/`complete` against this
    // same set of handles.
    let _proxy = Arc::new(
        proxy::ProxyEngine::new(
            Arc::clone(&keys),
            Arc::clone(&rate_limits),
            Arc::clone(&scheduler),
            Arc::clone(&health),
            Arc::clone(&pricing),
            Arc::clone(&service_rates),
            Arc::clone(&usage),
        )
        .context("failed to build proxy engine")?,
    );

    // ── Control Surface ─────────────────────────────────────────────
    let srv = server::Server::new(
        config.socket_path.clone(),
        Arc::clone(&store),
        Arc::clone(&keys),
        Arc::clone(&accounts),
        Arc::clone(&health),
        admin_auth,
    );

    info!("fulcrum daemon ready — control surface starting");
    srv.run().await?;

    Ok(())
}
