//! Scheduler (SCH) — selects an upstream account for a given
//! (key, endpoint, session), grounded on `clawde-io-apps`'s
//! `AccountPool::get_available` (availability filtering, least-loaded/LRU
//! tie-break) and the teacher's `pool/swarm.rs` failover-cascade idiom.

use std::sync::Arc;

use anyhow::Result;

use crate::accounts::{AccountRepository, UpstreamAccount};
use crate::error::FulcrumError;
use crate::health::UpstreamHealthTracker;
use crate::store::SharedStore;

/// A key's routing binding to a specific provider family: a bare account id
/// (dedicated), a `group:<id>` reference, or no binding at all (shared pool).
#[derive(Debug, Clone)]
pub enum AccountBinding {
    None,
    Dedicated(String),
    Group(String),
}

impl AccountBinding {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None => AccountBinding::None,
            Some(s) => match s.strip_prefix("group:") {
                Some(gid) => AccountBinding::Group(gid.to_string()),
                None => AccountBinding::Dedicated(s.to_string()),
            },
        }
    }
}

pub struct ScheduleRequest<'a> {
    pub provider: &'a str,
    pub endpoint_type: &'a str,
    pub key_id: &'a str,
    pub binding: &'a AccountBinding,
    pub session_hash: Option<&'a str>,
}

pub struct Scheduler {
    store: Arc<dyn SharedStore>,
    accounts: Arc<AccountRepository>,
    health: Arc<UpstreamHealthTracker>,
    sticky_ttl_secs: i64,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn SharedStore>,
        accounts: Arc<AccountRepository>,
        health: Arc<UpstreamHealthTracker>,
        sticky_ttl_secs: i64,
    ) -> Self {
        Self { store, accounts, health, sticky_ttl_secs }
    }

    pub async fn select(&self, req: &ScheduleRequest<'_>) -> Result<UpstreamAccount, FulcrumError> {
        // 1. Binding.
        if let AccountBinding::Dedicated(account_id) = req.binding {
            if let Some(account) = self.get_account(req.provider, account_id).await? {
                if !self.unavailable(req.provider, account_id).await? {
                    self.accounts
                        .touch_last_used(req.provider, account_id)
                        .await
                        .map_err(|_| FulcrumError::Internal)?;
                    return Ok(account);
                }
                // Bound account is temporarily unavailable — fall through to
                // the shared pool rather than failing outright.
            }
        }

        let candidates = match req.binding {
            AccountBinding::Group(group_id) => self
                .accounts
                .group_members(req.provider, group_id)
                .await
                .map_err(|_| FulcrumError::Internal)?,
            _ => self
                .accounts
                .list_by_provider(req.provider)
                .await
                .map_err(|_| FulcrumError::Internal)?,
        };

        let mut filtered = Vec::with_capacity(candidates.len());
        for account in candidates {
            if !account.schedulable || !account.healthy {
                continue;
            }
            if !endpoint_compatible(&account.endpoint_type, req.endpoint_type) {
                continue;
            }
            if self.unavailable(req.provider, &account.id).await? {
                continue;
            }
            filtered.push(account);
        }

        if filtered.is_empty() {
            return Err(FulcrumError::AccountUnavailable {
                provider: req.provider.to_string(),
                endpoint: req.endpoint_type.to_string(),
            });
        }

        // 4. Sticky affinity, only for non-dedicated selections with a session hash.
        if let Some(session_hash) = req.session_hash {
            let sticky_key = self.sticky_key(req.endpoint_type, req.key_id, session_hash);
            if let Some(account_id) = self.store.get(&sticky_key).await.map_err(|_| FulcrumError::Internal)? {
                if let Some(account) = filtered.iter().find(|a| a.id == account_id).cloned() {
                    self.store
                        .expire(&sticky_key, self.sticky_ttl_secs)
                        .await
                        .map_err(|_| FulcrumError::Internal)?;
                    self.accounts
                        .touch_last_used(req.provider, &account.id)
                        .await
                        .map_err(|_| FulcrumError::Internal)?;
                    return Ok(account);
                }
                self.store.del(&sticky_key).await.map_err(|_| FulcrumError::Internal)?;
            }
        }

        // 5. Priority selection, tie-broken by oldest lastUsedAt.
        filtered.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.last_used_at.cmp(&b.last_used_at))
        });
        let chosen = filtered.into_iter().next().expect("checked non-empty above");

        self.accounts
            .touch_last_used(req.provider, &chosen.id)
            .await
            .map_err(|_| FulcrumError::Internal)?;

        if let Some(session_hash) = req.session_hash {
            let sticky_key = self.sticky_key(req.endpoint_type, req.key_id, session_hash);
            self.store.set(&sticky_key, &chosen.id).await.map_err(|_| FulcrumError::Internal)?;
            self.store
                .expire(&sticky_key, self.sticky_ttl_secs)
                .await
                .map_err(|_| FulcrumError::Internal)?;
        }

        Ok(chosen)
    }

    fn sticky_key(&self, endpoint: &str, key_id: &str, session_hash: &str) -> String {
        format!("sticky:{endpoint}:{key_id}:{session_hash}")
    }

    async fn get_account(&self, provider: &str, id: &str) -> Result<Option<UpstreamAccount>, FulcrumError> {
        self.accounts.get(provider, id).await.map_err(|_| FulcrumError::Internal)
    }

    async fn unavailable(&self, provider: &str, id: &str) -> Result<bool, FulcrumError> {
        self.health.is_unavailable(provider, id).await.map_err(|_| FulcrumError::Internal)
    }
}

/// `endpointType=comm` is a wildcard matching any endpoint; otherwise
/// normalize both sides and compare, with `{anthropic, openai}` treated as
/// a compatible sharing pair.
fn endpoint_compatible(account_endpoint: &str, requested_endpoint: &str) -> bool {
    if account_endpoint.eq_ignore_ascii_case("comm") {
        return true;
    }
    let a = account_endpoint.to_lowercase();
    let r = requested_endpoint.to_lowercase();
    if a == r {
        return true;
    }
    let compatible_pair = |x: &str, y: &str| {
        (x == "anthropic" && y == "openai") || (x == "openai" && y == "anthropic")
    };
    compatible_pair(&a, &r)
}
