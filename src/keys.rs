//! Key Validator (KV) — lookup, state checks, and lazy activation for
//! `ApiKey` records, grounded on the teacher's `KeyStore` CRUD shape
//! (`keyvault-package/src/vault/store.rs`) generalized from an
//! encrypted-value vault to a one-way-hashed secret with a reverse index,
//! and on `auth.rs`'s `constant_time_eq` for secret comparison.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::FulcrumError;
use crate::store::SharedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpirationMode {
    Fixed,
    ActivationOnFirstUse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub secret_hash: String,
    pub is_active: bool,
    pub is_deleted: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expiration_mode: ExpirationMode,
    pub activation_days: i64,
    pub is_activated: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub binding: Option<String>,
    pub restricted_models: Vec<String>,
    pub allowed_clients: Vec<String>,
    pub permissions: Vec<String>,
    pub tags: Vec<String>,

    pub token_limit: i64,
    pub concurrency_limit: i64,
    pub rate_limit_window_minutes: i64,
    pub rate_limit_requests: i64,
    pub rate_limit_cost_micro: i64,
    pub daily_cost_limit_usd: Option<f64>,
    pub total_cost_limit_usd: Option<f64>,
    pub weekly_opus_cost_limit_usd: Option<f64>,
    /// Per-key overrides of the service-rate table, by provider family.
    pub service_rate_overrides: HashMap<String, f64>,
}

/// Why a validation attempt failed, surfaced to callers as a typed reason
/// rather than a bare bool so `validateForStats`/`validateForRelay` can
/// report `invalid-api-key { reason }` precisely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    NotFound,
    Disabled,
    Expired,
}

impl InvalidReason {
    fn as_static_str(&self) -> &'static str {
        match self {
            InvalidReason::NotFound => "not-found",
            InvalidReason::Disabled => "disabled",
            InvalidReason::Expired => "expired",
        }
    }
}

pub struct KeyValidator {
    store: Arc<dyn SharedStore>,
}

fn key_key(id: &str) -> String {
    format!("apikey:{id}")
}

const HASH_MAP_KEY: &str = "apikey:hash_map";

/// SHA-256 HMAC of the secret under a fixed, publicly-known key — used
/// purely as a fast, constant-time-friendly digest, not a MAC secret.
/// Public so callers minting new `ApiKey` records (the admin add-key path)
/// can populate `secret_hash` without duplicating the digest scheme.
pub fn hash_secret(secret: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(b"fulcrum-apikey-digest-v1").expect("hmac accepts any key length");
    mac.update(secret.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

impl KeyValidator {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub async fn add_key(&self, key: &ApiKey) -> Result<()> {
        self.store.hset_many(&key_key(&key.id), &serialize(key)).await?;
        self.store.hset(HASH_MAP_KEY, &key.secret_hash, &key.id).await?;
        tracing::info!(key_id = %key.id, "api key added");
        Ok(())
    }

    pub async fn remove_key(&self, id: &str) -> Result<()> {
        if let Some(key) = self.get(id).await? {
            self.store.hdel(HASH_MAP_KEY, &key.secret_hash).await?;
        }
        self.store.del(&key_key(id)).await?;
        tracing::info!(key_id = id, "api key removed");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ApiKey>> {
        let map = self.store.hgetall(&key_key(id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(parse_key(&map).context("malformed api key record")?))
    }

    async fn lookup_by_secret(&self, secret: &str) -> Result<Option<ApiKey>> {
        let hash = hash_secret(secret);
        let Some(id) = self.store.hget(HASH_MAP_KEY, &hash).await? else {
            return Ok(None);
        };
        self.get(&id).await
    }

    fn eligibility(key: &ApiKey, now: DateTime<Utc>) -> Result<(), InvalidReason> {
        if key.is_deleted || !key.is_active {
            return Err(InvalidReason::Disabled);
        }
        if let Some(expires_at) = key.expires_at {
            if now >= expires_at {
                return Err(InvalidReason::Expired);
            }
        }
        Ok(())
    }

    /// Lookup-and-check only, no activation side effect. Used by
    /// admin self-query paths.
    pub async fn validate_for_stats(&self, secret: &str) -> Result<ApiKey, FulcrumError> {
        let key = self
            .lookup_by_secret(secret)
            .await
            .map_err(|_| FulcrumError::Internal)?
            .ok_or(FulcrumError::InvalidApiKey { reason: InvalidReason::NotFound.as_static_str() })?;

        Self::eligibility(&key, Utc::now()).map_err(|reason| FulcrumError::InvalidApiKey {
            reason: reason.as_static_str(),
        })?;
        Ok(key)
    }

    /// Lookup, eligibility check, and lazy activation-on-first-use.
    pub async fn validate_for_relay(&self, secret: &str) -> Result<ApiKey, FulcrumError> {
        let mut key = self
            .lookup_by_secret(secret)
            .await
            .map_err(|_| FulcrumError::Internal)?
            .ok_or(FulcrumError::InvalidApiKey { reason: InvalidReason::NotFound.as_static_str() })?;

        Self::eligibility(&key, Utc::now()).map_err(|reason| FulcrumError::InvalidApiKey {
            reason: reason.as_static_str(),
        })?;

        if key.expiration_mode == ExpirationMode::ActivationOnFirstUse && !key.is_activated {
            self.activate(&mut key).await.map_err(|_| FulcrumError::Internal)?;
            // Re-check eligibility: the freshly derived expiresAt might
            // already be in the past for a zero/negative activationDays key.
            Self::eligibility(&key, Utc::now()).map_err(|reason| FulcrumError::InvalidApiKey {
                reason: reason.as_static_str(),
            })?;
        }

        Ok(key)
    }

    /// Atomic activation-on-first-use transition: compare-and-set on
    /// `isActivated` so concurrent losers observe the post-transition
    /// `activatedAt`/`expiresAt` instead of racing a read-modify-write.
    async fn activate(&self, key: &mut ApiKey) -> Result<()> {
        let now = Utc::now();
        let key_key = key_key(&key.id);
        let won = self
            .store
            .hash_field_cas(&key_key, "isActivated", Some("false"), "true")
            .await?;

        if won {
            let expires_at = now + chrono::Duration::days(key.activation_days);
            self.store
                .hset_many(
                    &key_key,
                    &[
                        ("activatedAt", now.to_rfc3339()),
                        ("expiresAt", expires_at.to_rfc3339()),
                    ],
                )
                .await?;
            key.is_activated = true;
            key.activated_at = Some(now);
            key.expires_at = Some(expires_at);
            tracing::info!(key_id = %key.id, activated_at = %now, expires_at = %expires_at, "key activated on first use");
        } else {
            // Lost the race: re-read so we reflect the winner's timestamps.
            if let Some(fresh) = self.get(&key.id).await? {
                *key = fresh;
            }
        }
        Ok(())
    }

    pub async fn touch_last_used(&self, id: &str) -> Result<()> {
        self.store.hset(&key_key(id), "lastUsedAt", &Utc::now().to_rfc3339()).await
    }

    /// Set containment; `'all'` in `key_permissions` grants every provider.
    pub fn has_permission(key_permissions: &[String], required: &str) -> bool {
        key_permissions.iter().any(|p| p == "all" || p == required)
    }
}

fn serialize(key: &ApiKey) -> Vec<(&'static str, String)> {
    vec![
        ("id", key.id.clone()),
        ("name", key.name.clone()),
        ("description", key.description.clone()),
        ("createdAt", key.created_at.to_rfc3339()),
        ("secretHash", key.secret_hash.clone()),
        ("isActive", key.is_active.to_string()),
        ("isDeleted", key.is_deleted.to_string()),
        ("lastUsedAt", key.last_used_at.map(|t| t.to_rfc3339()).unwrap_or_default()),
        ("expiresAt", key.expires_at.map(|t| t.to_rfc3339()).unwrap_or_default()),
        (
            "expirationMode",
            match key.expiration_mode {
                ExpirationMode::Fixed => "fixed".to_string(),
                ExpirationMode::ActivationOnFirstUse => "activation-on-first-use".to_string(),
            },
        ),
        ("activationDays", key.activation_days.to_string()),
        ("isActivated", key.is_activated.to_string()),
        ("activatedAt", key.activated_at.map(|t| t.to_rfc3339()).unwrap_or_default()),
        ("binding", key.binding.clone().unwrap_or_default()),
        ("restrictedModels", key.restricted_models.join(",")),
        ("allowedClients", key.allowed_clients.join(",")),
        ("permissions", key.permissions.join(",")),
        ("tags", key.tags.join(",")),
        ("tokenLimit", key.token_limit.to_string()),
        ("concurrencyLimit", key.concurrency_limit.to_string()),
        ("rateLimitWindow", key.rate_limit_window_minutes.to_string()),
        ("rateLimitRequests", key.rate_limit_requests.to_string()),
        ("rateLimitCost", key.rate_limit_cost_micro.to_string()),
        ("dailyCostLimit", key.daily_cost_limit_usd.map(|v| v.to_string()).unwrap_or_default()),
        ("totalCostLimit", key.total_cost_limit_usd.map(|v| v.to_string()).unwrap_or_default()),
        ("weeklyOpusCostLimit", key.weekly_opus_cost_limit_usd.map(|v| v.to_string()).unwrap_or_default()),
        (
            "serviceRateOverrides",
            key.service_rate_overrides
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(","),
        ),
    ]
}

fn parse_key(map: &HashMap<String, String>) -> Result<ApiKey> {
    let get = |field: &str| -> Result<String> {
        map.get(field).cloned().with_context(|| format!("missing field {field}"))
    };
    let parse_dt = |field: &str| -> Option<DateTime<Utc>> {
        map.get(field)
            .filter(|s| !s.is_empty())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    };
    let split_list = |field: &str| -> Vec<String> {
        map.get(field)
            .map(|s| s.split(',').filter(|p| !p.is_empty()).map(|p| p.to_string()).collect())
            .unwrap_or_default()
    };
    let expiration_mode = match get("expirationMode")?.as_str() {
        "activation-on-first-use" => ExpirationMode::ActivationOnFirstUse,
        _ => ExpirationMode::Fixed,
    };

    Ok(ApiKey {
        id: get("id")?,
        name: get("name")?,
        description: map.get("description").cloned().unwrap_or_default(),
        created_at: parse_dt("createdAt").unwrap_or_else(Utc::now),
        secret_hash: get("secretHash")?,
        is_active: get("isActive")?.parse().unwrap_or(false),
        is_deleted: get("isDeleted")?.parse().unwrap_or(false),
        last_used_at: parse_dt("lastUsedAt"),
        expires_at: parse_dt("expiresAt"),
        expiration_mode,
        activation_days: map.get("activationDays").and_then(|s| s.parse().ok()).unwrap_or(0),
        is_activated: get("isActivated")?.parse().unwrap_or(false),
        activated_at: parse_dt("activatedAt"),
        binding: map.get("binding").filter(|s| !s.is_empty()).cloned(),
        restricted_models: split_list("restrictedModels"),
        allowed_clients: split_list("allowedClients"),
        permissions: split_list("permissions"),
        tags: split_list("tags"),
        token_limit: map.get("tokenLimit").and_then(|s| s.parse().ok()).unwrap_or(i64::MAX),
        concurrency_limit: map.get("concurrencyLimit").and_then(|s| s.parse().ok()).unwrap_or(i64::MAX),
        rate_limit_window_minutes: map.get("rateLimitWindow").and_then(|s| s.parse().ok()).unwrap_or(0),
        rate_limit_requests: map.get("rateLimitRequests").and_then(|s| s.parse().ok()).unwrap_or(i64::MAX),
        rate_limit_cost_micro: map.get("rateLimitCost").and_then(|s| s.parse().ok()).unwrap_or(i64::MAX),
        daily_cost_limit_usd: map.get("dailyCostLimit").filter(|s| !s.is_empty()).and_then(|s| s.parse().ok()),
        total_cost_limit_usd: map.get("totalCostLimit").filter(|s| !s.is_empty()).and_then(|s| s.parse().ok()),
        weekly_opus_cost_limit_usd: map
            .get("weeklyOpusCostLimit")
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse().ok()),
        service_rate_overrides: map
            .get("serviceRateOverrides")
            .map(|s| {
                s.split(',')
                    .filter(|p| !p.is_empty())
                    .filter_map(|pair| {
                        let (k, v) = pair.split_once('=')?;
                        Some((k.to_string(), v.parse().ok()?))
                    })
                    .collect()
            })
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn sample(id: &str, secret: &str, mode: ExpirationMode) -> ApiKey {
        ApiKey {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            created_at: Utc::now(),
            secret_hash: hash_secret(secret),
            is_active: true,
            is_deleted: false,
            last_used_at: None,
            expires_at: None,
            expiration_mode: mode,
            activation_days: 7,
            is_activated: false,
            activated_at: None,
            binding: None,
            restricted_models: vec![],
            allowed_clients: vec![],
            permissions: vec!["claude".to_string()],
            tags: vec![],
            token_limit: i64::MAX,
            concurrency_limit: i64::MAX,
            rate_limit_window_minutes: 0,
            rate_limit_requests: i64::MAX,
            rate_limit_cost_micro: i64::MAX,
            daily_cost_limit_usd: None,
            total_cost_limit_usd: None,
            weekly_opus_cost_limit_usd: None,
            service_rate_overrides: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn validate_for_stats_round_trips_without_activating() {
        let store = Arc::new(MemoryStore::new());
        let kv = KeyValidator::new(store);
        kv.add_key(&sample("key-1", "s3cr3t", ExpirationMode::Fixed)).await.unwrap();

        let key = kv.validate_for_stats("s3cr3t").await.unwrap();
        assert_eq!(key.id, "key-1");
        assert!(!key.is_activated);
    }

    #[tokio::test]
    async fn unknown_secret_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let kv = KeyValidator::new(store);
        let err = kv.validate_for_stats("nope").await.unwrap_err();
        assert!(matches!(err, FulcrumError::InvalidApiKey { reason: "not-found" }));
    }

    #[tokio::test]
    async fn disabled_key_rejected() {
        let store = Arc::new(MemoryStore::new());
        let kv = KeyValidator::new(store);
        let mut key = sample("key-1", "s3cr3t", ExpirationMode::Fixed);
        key.is_active = false;
        kv.add_key(&key).await.unwrap();
        let err = kv.validate_for_stats("s3cr3t").await.unwrap_err();
        assert!(matches!(err, FulcrumError::InvalidApiKey { reason: "disabled" }));
    }

    /// Concrete scenario 6: activation-on-first-use at T, expiry at T+7d.
    #[tokio::test]
    async fn activation_on_first_use_sets_expiry_relative_to_first_use() {
        let store = Arc::new(MemoryStore::new());
        let kv = KeyValidator::new(store);
        let mut key = sample("key-1", "s3cr3t", ExpirationMode::ActivationOnFirstUse);
        key.activation_days = 7;
        kv.add_key(&key).await.unwrap();

        let activated = kv.validate_for_relay("s3cr3t").await.unwrap();
        assert!(activated.is_activated);
        let expected_expiry = activated.activated_at.unwrap() + chrono::Duration::days(7);
        assert_eq!(activated.expires_at.unwrap(), expected_expiry);

        // A second use before expiry does not re-activate or move expiresAt.
        let second = kv.validate_for_relay("s3cr3t").await.unwrap();
        assert_eq!(second.activated_at, activated.activated_at);
        assert_eq!(second.expires_at, activated.expires_at);
    }

    /// Invariant 2: concurrent first-use requests produce exactly one
    /// transition, with every observer agreeing on `activatedAt`.
    #[tokio::test]
    async fn concurrent_activation_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(KeyValidator::new(store));
        kv.add_key(&sample("key-1", "s3cr3t", ExpirationMode::ActivationOnFirstUse)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move { kv.validate_for_relay("s3cr3t").await.unwrap() }));
        }
        let mut activated_ats = std::collections::HashSet::new();
        for h in handles {
            let key = h.await.unwrap();
            activated_ats.insert(key.activated_at.unwrap().to_rfc3339());
        }
        assert_eq!(activated_ats.len(), 1, "all observers must agree on activatedAt");
    }

    #[test]
    fn has_permission_honors_all_wildcard() {
        let perms = vec!["all".to_string()];
        assert!(KeyValidator::has_permission(&perms, "gemini"));
        let perms = vec!["claude".to_string()];
        assert!(KeyValidator::has_permission(&perms, "claude"));
        assert!(!KeyValidator::has_permission(&perms, "openai"));
    }
}
