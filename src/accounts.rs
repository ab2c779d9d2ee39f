//! Account Repository (AR) — one per provider family; CRUD and health
//! queries over `UpstreamAccount` records. Grounded on the teacher's
//! `KeyStore` CRUD shape (`keyvault-package/src/vault/store.rs`), generalized
//! from encrypted API keys to upstream provider accounts, and backed by the
//! shared store instead of SQLite so state is visible to every task.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::SharedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Shared,
    Dedicated,
}

/// One upstream provider account: id, name, endpoint variant, priority,
/// schedulability, and derived health — per the data model's
/// `UpstreamAccount` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamAccount {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub endpoint_type: String,
    pub account_type: AccountType,
    pub priority: i64,
    pub schedulable: bool,
    pub healthy: bool,
    pub last_used_at: Option<DateTime<Utc>>,
}

pub struct AccountRepository {
    store: Arc<dyn SharedStore>,
}

fn account_key(provider: &str, id: &str) -> String {
    format!("account:{provider}:{id}")
}

fn provider_set_key(provider: &str) -> String {
    format!("account:set:{provider}")
}

fn group_key(group_id: &str) -> String {
    format!("account:group:{group_id}")
}

impl AccountRepository {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub async fn add_account(&self, account: &UpstreamAccount) -> Result<()> {
        let key = account_key(&account.provider, &account.id);
        let account_type_str = match account.account_type {
            AccountType::Shared => "shared",
            AccountType::Dedicated => "dedicated",
        };
        self.store
            .hset_many(
                &key,
                &[
                    ("id", account.id.clone()),
                    ("name", account.name.clone()),
                    ("provider", account.provider.clone()),
                    ("endpointType", account.endpoint_type.clone()),
                    ("accountType", account_type_str.to_string()),
                    ("priority", account.priority.to_string()),
                    ("schedulable", account.schedulable.to_string()),
                    ("healthy", account.healthy.to_string()),
                    (
                        "lastUsedAt",
                        account.last_used_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    ),
                ],
            )
            .await?;
        self.store.sadd(&provider_set_key(&account.provider), &account.id).await?;
        tracing::info!(account_id = %account.id, provider = %account.provider, "account added");
        Ok(())
    }

    pub async fn remove_account(&self, provider: &str, id: &str) -> Result<()> {
        self.store.del(&account_key(provider, id)).await?;
        self.store.srem(&provider_set_key(provider), id).await?;
        tracing::info!(account_id = id, provider, "account removed");
        Ok(())
    }

    pub async fn get(&self, provider: &str, id: &str) -> Result<Option<UpstreamAccount>> {
        let map = self.store.hgetall(&account_key(provider, id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(parse_account(&map).context("malformed account record")?))
    }

    pub async fn list_by_provider(&self, provider: &str) -> Result<Vec<UpstreamAccount>> {
        let ids = self.store.smembers(&provider_set_key(provider)).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(account) = self.get(provider, &id).await? {
                out.push(account);
            }
        }
        Ok(out)
    }

    pub async fn group_members(&self, provider: &str, group_id: &str) -> Result<Vec<UpstreamAccount>> {
        let ids = self.store.smembers(&group_key(group_id)).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(account) = self.get(provider, &id).await? {
                out.push(account);
            }
        }
        Ok(out)
    }

    pub async fn add_to_group(&self, group_id: &str, account_id: &str) -> Result<()> {
        self.store.sadd(&group_key(group_id), account_id).await
    }

    pub async fn set_schedulable(&self, provider: &str, id: &str, schedulable: bool) -> Result<()> {
        self.store.hset(&account_key(provider, id), "schedulable", &schedulable.to_string()).await
    }

    pub async fn set_healthy(&self, provider: &str, id: &str, healthy: bool) -> Result<()> {
        self.store.hset(&account_key(provider, id), "healthy", &healthy.to_string()).await
    }

    /// Touch `lastUsedAt`; idempotent, safe to call on every scheduling hit.
    pub async fn touch_last_used(&self, provider: &str, id: &str) -> Result<()> {
        self.store
            .hset(&account_key(provider, id), "lastUsedAt", &Utc::now().to_rfc3339())
            .await
    }
}

fn parse_account(map: &std::collections::HashMap<String, String>) -> Result<UpstreamAccount> {
    let get = |field: &str| -> Result<String> {
        map.get(field).cloned().with_context(|| format!("missing field {field}"))
    };
    let account_type = match get("accountType")?.as_str() {
        "dedicated" => AccountType::Dedicated,
        _ => AccountType::Shared,
    };
    let last_used_raw = map.get("lastUsedAt").cloned().unwrap_or_default();
    let last_used_at = if last_used_raw.is_empty() {
        None
    } else {
        DateTime::parse_from_rfc3339(&last_used_raw).ok().map(|t| t.with_timezone(&Utc))
    };

    Ok(UpstreamAccount {
        id: get("id")?,
        name: get("name")?,
        provider: get("provider")?,
        endpoint_type: get("endpointType")?,
        account_type,
        priority: get("priority")?.parse().unwrap_or(100),
        schedulable: get("schedulable")?.parse().unwrap_or(false),
        healthy: get("healthy")?.parse().unwrap_or(false),
        last_used_at,
    })
}
