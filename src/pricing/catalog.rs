//! Pricing Registry: a file-loaded, periodically refreshed catalog of
//! per-model token prices, grounded on the teacher's static model-table
//! pattern (`pool/registry.rs`'s `GOOGLE_MODELS: &[ModelSpec]`) but made
//! file-backed and refreshable like `agentreplay`'s `model_pricing.rs`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Per-token USD prices for a single model, including its optional
/// above-200K-token variant and fast-mode multiplier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPriceRow {
    pub model: String,
    pub input: f64,
    pub output: f64,
    pub cache_create_5m: f64,
    pub cache_create_1h: f64,
    pub cache_read: f64,

    #[serde(default)]
    pub input_200k: Option<f64>,
    #[serde(default)]
    pub output_200k: Option<f64>,
    #[serde(default)]
    pub cache_create_5m_200k: Option<f64>,
    #[serde(default)]
    pub cache_create_1h_200k: Option<f64>,
    #[serde(default)]
    pub cache_read_200k: Option<f64>,

    /// Applies when the upstream advertised a fast-mode beta header and the
    /// response marked `speed=fast`. Defaults to 6x per the documented rule.
    #[serde(default = "default_fast_mode_multiplier")]
    pub fast_mode_multiplier: f64,
}

fn default_fast_mode_multiplier() -> f64 {
    6.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingCatalog {
    pub rows: HashMap<String, ModelPriceRow>,
}

impl PricingCatalog {
    pub fn resolve(&self, model: &str) -> Option<&ModelPriceRow> {
        let base_model = model.strip_suffix("[1m]").unwrap_or(model);
        self.rows.get(base_model).or_else(|| self.rows.get(model))
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pricing file {}", path.display()))?;
        let rows: Vec<ModelPriceRow> = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse pricing file {}", path.display()))?;
        Ok(Self {
            rows: rows.into_iter().map(|r| (r.model.clone(), r)).collect(),
        })
    }
}

/// Periodically refreshed, process-global pricing catalog. The file's mtime
/// is checked on every `resolve()` call against a cached timestamp; callers
/// never pay the cost of a stat more than once per `freshness` window, and
/// a refresh publishes a new immutable snapshot rather than mutating one in
/// place, per the concurrency model's "writers publish, don't mutate" rule.
pub struct PricingRegistry {
    path: PathBuf,
    freshness: Duration,
    catalog: RwLock<Arc<PricingCatalog>>,
    last_checked_ms: AtomicU64,
    last_mtime_ms: AtomicU64,
}

impl PricingRegistry {
    pub async fn load(path: PathBuf, freshness: Duration) -> Result<Self> {
        let catalog = PricingCatalog::load_from_file(&path).unwrap_or_default();
        let mtime_ms = file_mtime_ms(&path).unwrap_or(0);
        Ok(Self {
            path,
            freshness,
            catalog: RwLock::new(Arc::new(catalog)),
            last_checked_ms: AtomicU64::new(now_ms()),
            last_mtime_ms: AtomicU64::new(mtime_ms),
        })
    }

    /// Resolve a model's price row, refreshing the catalog from disk first
    /// if the freshness floor has elapsed and the file's mtime has changed.
    pub async fn resolve(&self, model: &str) -> Option<ModelPriceRow> {
        self.maybe_refresh().await;
        let catalog = self.catalog.read().await;
        catalog.resolve(model).cloned()
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

        if let Ok(fresh) = PricingCatalog::load_from_file(&self.path) {
            *self.catalog.write().await = Arc::new(fresh);
            self.last_mtime_ms.store(mtime, Ordering::Relaxed);
            tracing::info!(path = %self.path.display(), "pricing catalog refreshed");
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
