//! Upstream Health Tracker (UHT) — records typed transient-unavailable
//! marks on upstream accounts with TTL, grounded on the teacher's
//! `KeyStatus::RateLimited` transition (`keyvault-package/src/vault/store.rs`)
//! and on `clawde-io-apps`'s `mark_blocked`/`mark_rate_limited` pair.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use http::HeaderMap;

use crate::error::UnavailabilityKind;
use crate::store::SharedStore;

pub struct UpstreamHealthTracker {
    store: Arc<dyn SharedStore>,
}

impl UpstreamHealthTracker {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    fn key(provider: &str, account_id: &str) -> String {
        format!("unavailable:{provider}:{account_id}")
    }

    /// Mark an account temporarily unavailable. `retry_after_hint`, when
    /// present and positive, overrides the kind's default TTL — upstream's
    /// own estimate of when it'll be ready again always wins.
    pub async fn mark_unavailable(
        &self,
        provider: &str,
        account_id: &str,
        status_code: u16,
        kind: UnavailabilityKind,
        retry_after_hint: Option<Duration>,
    ) -> Result<()> {
        let ttl_secs = retry_after_hint
            .map(|d| d.as_secs() as i64)
            .filter(|s| *s > 0)
            .unwrap_or(kind.default_ttl_secs() as i64);

        let key = Self::key(provider, account_id);
        let marked_at = Utc::now().to_rfc3339();
        self.store
            .hset_many(
                &key,
                &[
                    ("statusCode", status_code.to_string()),
                    ("errorKind", kind.as_str().to_string()),
                    ("markedAt", marked_at),
                ],
            )
            .await?;
        self.store.expire(&key, ttl_secs).await?;

        tracing::warn!(provider, account_id, kind = kind.as_str(), ttl_secs, "account marked unavailable");
        Ok(())
    }

    pub async fn is_unavailable(&self, provider: &str, account_id: &str) -> Result<bool> {
        self.store.exists(&Self::key(provider, account_id)).await
    }

    /// Operator-initiated clear; marks also disappear on TTL.
    pub async fn clear(&self, provider: &str, account_id: &str) -> Result<()> {
        self.store.del(&Self::key(provider, account_id)).await?;
        tracing::info!(provider, account_id, "unavailability mark cleared");
        Ok(())
    }

    /// Parse the upstream's own hint for when a rate limit will lift,
    /// preferring whichever header yields a positive future delta.
    pub fn parse_retry_hint(headers: &HeaderMap, now_epoch_secs: i64) -> Option<Duration> {
        if let Some(v) = headers.get("retry-after").and_then(|v| v.to_str().ok()) {
            if let Ok(secs) = v.trim().parse::<i64>() {
                if secs > 0 {
                    return Some(Duration::from_secs(secs as u64));
                }
            }
        }
        for header_name in ["anthropic-ratelimit-unified-reset", "x-ratelimit-reset-requests"] {
            if let Some(v) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
                if let Ok(epoch) = v.trim().parse::<i64>() {
                    let delta = epoch - now_epoch_secs;
                    if delta > 0 {
                        return Some(Duration::from_secs(delta as u64));
                    }
                } else if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(v.trim()) {
                    let delta = dt.timestamp() - now_epoch_secs;
                    if delta > 0 {
                        return Some(Duration::from_secs(delta as u64));
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn mark_and_check_unavailability() {
        let store = Arc::new(MemoryStore::new());
        let uht = UpstreamHealthTracker::new(store);

        assert!(!uht.is_unavailable("anthropic", "acct-1").await.unwrap());
        uht.mark_unavailable("anthropic", "acct-1", 429, UnavailabilityKind::RateLimit, None)
            .await
            .unwrap();
        assert!(uht.is_unavailable("anthropic", "acct-1").await.unwrap());
    }

    #[tokio::test]
    async fn clear_removes_mark() {
        let store = Arc::new(MemoryStore::new());
        let uht = UpstreamHealthTracker::new(store);
        uht.mark_unavailable("anthropic", "acct-1", 503, UnavailabilityKind::ServerError, None)
            .await
            .unwrap();
        uht.clear("anthropic", "acct-1").await.unwrap();
        assert!(!uht.is_unavailable("anthropic", "acct-1").await.unwrap());
    }

    #[test]
    fn retry_after_header_wins_when_positive() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "30".parse().unwrap());
        let hint = UpstreamHealthTracker::parse_retry_hint(&headers, 1_000_000);
        assert_eq!(hint, Some(Duration::from_secs(30)));
    }

    #[test]
    fn reset_epoch_header_used_when_future() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-reset-requests", "1000060".parse().unwrap());
        let hint = UpstreamHealthTracker::parse_retry_hint(&headers, 1_000_000);
        assert_eq!(hint, Some(Duration::from_secs(60)));
    }

    #[test]
    fn no_hint_when_all_headers_absent_or_past() {
        let headers = HeaderMap::new();
        assert_eq!(UpstreamHealthTracker::parse_retry_hint(&headers, 1_000_000), None);
    }
}
