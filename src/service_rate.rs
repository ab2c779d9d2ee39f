//! Service Rate Registry (SRR) — maps each provider family to a multiplier
//! against the base "consumption credit" unit. Grounded on the teacher's
//! small static-registry style (`pool/registry.rs`) applied to a
//! provider→multiplier map instead of a model table, with the same
//! file-mtime refresh idiom as the pricing registry.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRateTable {
    pub base_service: String,
    pub rates: HashMap<String, f64>,
}

impl Default for ServiceRateTable {
    fn default() -> Self {
        Self {
            base_service: "claude".to_string(),
            rates: default_rates(),
        }
    }
}

fn default_rates() -> HashMap<String, f64> {
    [
        ("anthropic".to_string(), 1.0),
        ("openai".to_string(), 1.0),
        ("google".to_string(), 1.0),
        ("groq".to_string(), 1.0),
        ("deepseek".to_string(), 1.0),
        ("perplexity".to_string(), 1.0),
        ("bedrock".to_string(), 1.0),
        ("azure".to_string(), 1.0),
    ]
    .into_iter()
    .collect()
}

impl ServiceRateTable {
    /// Validate on write: every rate must be a finite positive number.
    fn validate(&self) -> Result<()> {
        for (provider, rate) in &self.rates {
            if !rate.is_finite() || *rate <= 0.0 {
                anyhow::bail!("service rate for {provider} must be a finite positive number, got {rate}");
            }
        }
        Ok(())
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read service rates file {}", path.display()))?;
        let table: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse service rates file {}", path.display()))?;
        table.validate()?;
        Ok(table)
    }
}

/// Keyword list per provider family, used when a request carries no explicit
/// account-type mapping. `claude` is the documented final default.
const KEYWORD_FAMILIES: &[(&str, &[&str])] = &[
    ("openai", &["gpt", "o1", "o3", "o4", "codex", "chatgpt"]),
    ("google", &["gemini", "palm"]),
    ("groq", &["groq"]),
    ("deepseek", &["deepseek"]),
    ("perplexity", &["perplexity", "sonar"]),
    ("bedrock", &["titan", "nova"]),
];

/// Infer a provider family from a model name when no explicit
/// account-type mapping applies.
pub fn infer_provider(model: &str) -> &'static str {
    let lower = model.to_lowercase();
    for (family, keywords) in KEYWORD_FAMILIES {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            return family;
        }
    }
    // `claude` is the documented final default; the account-repository
    // provider key for that family is `anthropic`.
    "anthropic"
}

#[derive(Clone)]
pub struct ServiceRateRegistry {
    path: PathBuf,
    freshness: Duration,
    table: Arc<RwLock<Arc<ServiceRateTable>>>,
    last_checked_ms: Arc<AtomicU64>,
    last_mtime_ms: Arc<AtomicU64>,
}

impl ServiceRateRegistry {
    pub async fn load(path: PathBuf, freshness: Duration) -> Self {
        let table = ServiceRateTable::load_from_file(&path).unwrap_or_default();
        let mtime_ms = file_mtime_ms(&path).unwrap_or(0);
        Self {
            path,
            freshness,
            table: Arc::new(RwLock::new(Arc::new(table))),
            last_checked_ms: Arc::new(AtomicU64::new(now_ms())),
            last_mtime_ms: Arc::new(AtomicU64::new(mtime_ms)),
        }
    }

    /// `convertToCredits(costUsd, provider) = costUsd × rate(provider)`.
    pub async fn convert_to_credits(&self, cost_usd: f64, provider: &str) -> f64 {
        self.maybe_refresh().await;
        let table = self.table.read().await;
        let rate = table.rates.get(provider).copied().unwrap_or(1.0);
        cost_usd * rate
    }

    /// Resolve the provider family for a model: explicit mapping first,
    /// else keyword inference, else the documented `claude` default.
    pub fn resolve_provider(&self, explicit: Option<&str>, model: &str) -> String {
        if let Some(p) = explicit {
            return p.to_string();
        }
        infer_provider(model).to_string()
    }

    async fn maybe_refresh(&self) {
        let now = now_ms();
        let last_checked = self.last_checked_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last_checked) < self.freshness.as_millis() as u64 {
            return;
        }
        self.last_checked_ms.store(now, Ordering::Relaxed);

        let Some(mtime) = file_mtime_ms(&self.path) else { return };
        if mtime == self.last_mtime_ms.load(Ordering::Relaxed) {
            return;
        }
        if let Ok(fresh) = ServiceRateTable::load_from_file(&self.path) {
            *self.table.write().await = Arc::new(fresh);
            self.last_mtime_ms.store(mtime, Ordering::Relaxed);
            tracing::info!(path = %self.path.display(), "service rate table refreshed");
        }
    }
}

fn file_mtime_ms(path: &Path) -> Option<u64> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_millis() as u64)
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
