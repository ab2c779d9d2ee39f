//! Local control surface — Unix-socket JSON-RPC loop, grounded on the
//! teacher's `server/mod.rs`: same request/response envelope, bearer-token
//! auth split, and per-caller rate limiting, generalized from the
//! generate/models/swarm surface to fulcrum's admin/health/usage surface.
//!
//! This is not the relay's HTTP ingress (out of scope — see SPEC_FULL.md
//! §1 Non-goals); it exists only so the core is a runnable daemon and so
//! `fulcrum.admin.*` methods exist to seed keys/accounts for integration
//! tests, exactly mirroring the teacher's own justification for this
//! surface.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{info, warn};

use crate::accounts::{AccountRepository, AccountType, UpstreamAccount};
use crate::admin_auth::{requires_admin, AdminAuthGuard, ControlSurfaceRateLimiter};
use crate::health::UpstreamHealthTracker;
use crate::keys::{hash_secret, ApiKey, ExpirationMode, KeyValidator};
use crate::store::SharedStore;

// ── JSON-RPC Types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    params: Option<serde_json::Value>,
    id: Option<serde_json::Value>,
    /// Bearer token for admin-gated methods.
    auth: Option<String>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self { jsonrpc: "2.0".into(), result: Some(result), error: None, id }
    }
    fn error(id: Option<serde_json::Value>, code: i32, message: String) -> Self {
        Self { jsonrpc: "2.0".into(), result: None, error: Some(JsonRpcError { code, message }), id }
    }
    fn auth_error(id: Option<serde_json::Value>) -> Self {
        Self::error(id, -32001, "Authentication required — include a valid \"auth\" field with the admin bearer token".into())
    }
    fn rate_limited(id: Option<serde_json::Value>, retry_after_secs: u64) -> Self {
        Self::error(id, -32002, format!("Rate limited — retry after {} seconds", retry_after_secs))
    }
}

// ── Server ──────────────────────────────────────────────────────────

pub struct Server {
    socket_path: PathBuf,
    store: Arc<dyn SharedStore>,
    keys: Arc<KeyValidator>,
    accounts: Arc<AccountRepository>,
    health: Arc<UpstreamHealthTracker>,
    auth: Arc<RwLock<AdminAuthGuard>>,
    rate_limiter: Arc<ControlSurfaceRateLimiter>,
}

impl Server {
    pub fn new(
        socket_path: PathBuf,
        store: Arc<dyn SharedStore>,
        keys: Arc<KeyValidator>,
        accounts: Arc<AccountRepository>,
        health: Arc<UpstreamHealthTracker>,
        auth: AdminAuthGuard,
    ) -> Self {
        Self {
            socket_path,
            store,
            keys,
            accounts,
            health,
            auth: Arc::new(RwLock::new(auth)),
            // 100 requests per minute per caller — generous but prevents abuse.
            rate_limiter: Arc::new(ControlSurfaceRateLimiter::new(100, 60)),
        }
    }

    pub async fn run(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(socket = %self.socket_path.display(), "control surface listening (admin auth enforced)");

        loop {
            let (stream, _) = listener.accept().await?;
            let store = Arc::clone(&self.store);
            let keys = Arc::clone(&self.keys);
            let accounts = Arc::clone(&self.accounts);
            let health = Arc::clone(&self.health);
            let auth = Arc::clone(&self.auth);
            let rate_limiter = Arc::clone(&self.rate_limiter);

            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                const MAX_REQUEST_BYTES: u64 = 1_048_576;
                let bounded = reader.take(MAX_REQUEST_BYTES);
                let mut reader = BufReader::new(bounded);
                let mut line = String::new();

                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break,
                        Ok(_) => {
                            let response = handle_request(&line, &store, &keys, &accounts, &health, &auth, &rate_limiter).await;
                            let resp_json = serde_json::to_string(&response).unwrap_or_default();
                            if writer.write_all(resp_json.as_bytes()).await.is_err() { break; }
                            if writer.write_all(b"\n").await.is_err() { break; }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    }
}

// ── Request Handling ────────────────────────────────────────────────

async fn handle_request(
    raw: &str,
    store: &Arc<dyn SharedStore>,
    keys: &KeyValidator,
    accounts: &AccountRepository,
    health: &UpstreamHealthTracker,
    auth: &RwLock<AdminAuthGuard>,
    rate_limiter: &ControlSurfaceRateLimiter,
) -> JsonRpcResponse {
    let req: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => return JsonRpcResponse::error(None, -32700, format!("Parse error: {}", e)),
    };

    if requires_admin(&req.method) {
        let token = match &req.auth {
            Some(t) => t.as_str(),
            None => {
                warn!(method = %req.method, "request rejected — no auth token");
                return JsonRpcResponse::auth_error(req.id);
            }
        };
        let valid = auth.read().unwrap().validate(token);
        if !valid {
            warn!(method = %req.method, "request rejected — invalid auth token");
            return JsonRpcResponse::auth_error(req.id);
        }
    }

    let caller = req.params.as_ref()
        .and_then(|p| p.get("caller"))
        .and_then(|v| v.as_str())
        .unwrap_or("anonymous");
    if let Err(retry_secs) = rate_limiter.check(caller) {
        warn!(caller, method = %req.method, "rate limited");
        return JsonRpcResponse::rate_limited(req.id, retry_secs);
    }

    let params = req.params.unwrap_or(serde_json::Value::Null);

    match req.method.as_str() {
        "fulcrum.health" => handle_health(req.id, params, accounts).await,
        "fulcrum.usage" => handle_usage(req.id, params, store).await,
        "fulcrum.admin.addKey" => handle_add_key(req.id, params, keys).await,
        "fulcrum.admin.addAccount" => handle_add_account(req.id, params, accounts).await,
        "fulcrum.admin.removeKey" => handle_remove_key(req.id, params, keys).await,
        "fulcrum.admin.removeAccount" => handle_remove_account(req.id, params, accounts).await,
        "fulcrum.admin.clearUnavailability" => handle_clear_unavailability(req.id, params, health).await,
        "fulcrum.admin.rotateToken" => handle_rotate_token(req.id, auth),
        _ => JsonRpcResponse::error(req.id, -32601, format!("Unknown method: {}", req.method)),
    }
}

// ── fulcrum.health / fulcrum.usage ──────────────────────────────────

#[derive(Deserialize)]
struct HealthParams {
    provider: Option<String>,
}

async fn handle_health(id: Option<serde_json::Value>, params: serde_json::Value, accounts: &AccountRepository) -> JsonRpcResponse {
    let p: HealthParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return JsonRpcResponse::error(id, -32602, format!("Invalid params: {}", e)),
    };
    let Some(provider) = p.provider else {
        return JsonRpcResponse::success(id, serde_json::json!({ "ok": true }));
    };
    match accounts.list_by_provider(&provider).await {
        Ok(list) => {
            let accounts_json: Vec<serde_json::Value> = list.iter().map(|a| {
                serde_json::json!({
                    "id": a.id,
                    "name": a.name,
                    "endpointType": a.endpoint_type,
                    "priority": a.priority,
                    "schedulable": a.schedulable,
                    "healthy": a.healthy,
                    "lastUsedAt": a.last_used_at.map(|t| t.to_rfc3339()),
                })
            }).collect();
            JsonRpcResponse::success(id, serde_json::json!({ "ok": true, "accounts": accounts_json }))
        }
        Err(e) => JsonRpcResponse::error(id, -32000, e.to_string()),
    }
}

#[derive(Deserialize)]
struct UsageParams {
    #[serde(rename = "keyId")]
    key_id: String,
    /// One of "alltime", "daily", "monthly"; defaults to "alltime".
    window: Option<String>,
    /// Required for "daily" (`%Y-%m-%d`) and "monthly" (`%Y-%m`) windows.
    period: Option<String>,
}

async fn handle_usage(id: Option<serde_json::Value>, params: serde_json::Value, store: &Arc<dyn SharedStore>) -> JsonRpcResponse {
    let p: UsageParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return JsonRpcResponse::error(id, -32602, format!("Invalid params: {}", e)),
    };
    let window = p.window.as_deref().unwrap_or("alltime");
    let storage_key = match window {
        "alltime" => format!("usage:{}:alltime", p.key_id),
        "daily" => {
            let Some(day) = p.period else {
                return JsonRpcResponse::error(id, -32602, "\"period\" is required for the daily window".into());
            };
            format!("usage:{}:daily:{}", p.key_id, day)
        }
        "monthly" => {
            let Some(month) = p.period else {
                return JsonRpcResponse::error(id, -32602, "\"period\" is required for the monthly window".into());
            };
            format!("usage:{}:monthly:{}", p.key_id, month)
        }
        other => return JsonRpcResponse::error(id, -32602, format!("unknown window \"{}\"", other)),
    };

    match store.hgetall(&storage_key).await {
        Ok(map) => JsonRpcResponse::success(id, serde_json::json!({ "ok": true, "usage": map })),
        Err(e) => JsonRpcResponse::error(id, -32000, e.to_string()),
    }
}

// ── fulcrum.admin.* ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct AddKeyParams {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    secret: String,
    #[serde(default)]
    binding: Option<String>,
    #[serde(default)]
    restricted_models: Vec<String>,
    #[serde(default)]
    allowed_clients: Vec<String>,
    #[serde(default = "default_all_permissions")]
    permissions: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "default_activation_on_first_use")]
    expiration_mode: ExpirationMode,
    #[serde(default)]
    activation_days: i64,
    #[serde(default)]
    token_limit: Option<i64>,
    #[serde(default)]
    concurrency_limit: Option<i64>,
    #[serde(default)]
    rate_limit_window_minutes: Option<i64>,
    #[serde(default)]
    rate_limit_requests: Option<i64>,
    #[serde(default)]
    rate_limit_cost_micro: Option<i64>,
    #[serde(default)]
    daily_cost_limit_usd: Option<f64>,
    #[serde(default)]
    total_cost_limit_usd: Option<f64>,
    #[serde(default)]
    weekly_opus_cost_limit_usd: Option<f64>,
    #[serde(default)]
    service_rate_overrides: HashMap<String, f64>,
}

fn default_all_permissions() -> Vec<String> {
    vec!["all".to_string()]
}
fn default_activation_on_first_use() -> ExpirationMode {
    ExpirationMode::ActivationOnFirstUse
}

async fn handle_add_key(id: Option<serde_json::Value>, params: serde_json::Value, keys: &KeyValidator) -> JsonRpcResponse {
    let p: AddKeyParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return JsonRpcResponse::error(id, -32602, format!("Invalid params: {}", e)),
    };
    let secret_hash = hash_secret(&p.secret);
    let key = ApiKey {
        id: p.id.clone(),
        name: p.name,
        description: p.description,
        created_at: chrono::Utc::now(),
        secret_hash,
        is_active: true,
        is_deleted: false,
        last_used_at: None,
        expires_at: None,
        expiration_mode: p.expiration_mode,
        activation_days: p.activation_days,
        is_activated: false,
        activated_at: None,
        binding: p.binding,
        restricted_models: p.restricted_models,
        allowed_clients: p.allowed_clients,
        permissions: p.permissions,
        tags: p.tags,
        token_limit: p.token_limit.unwrap_or(i64::MAX),
        concurrency_limit: p.concurrency_limit.unwrap_or(i64::MAX),
        rate_limit_window_minutes: p.rate_limit_window_minutes.unwrap_or(0),
        rate_limit_requests: p.rate_limit_requests.unwrap_or(i64::MAX),
        rate_limit_cost_micro: p.rate_limit_cost_micro.unwrap_or(i64::MAX),
        daily_cost_limit_usd: p.daily_cost_limit_usd,
        total_cost_limit_usd: p.total_cost_limit_usd,
        weekly_opus_cost_limit_usd: p.weekly_opus_cost_limit_usd,
        service_rate_overrides: p.service_rate_overrides,
    };
    match keys.add_key(&key).await {
        Ok(()) => JsonRpcResponse::success(id, serde_json::json!({ "ok": true, "id": p.id })),
        Err(e) => JsonRpcResponse::error(id, -32000, e.to_string()),
    }
}

#[derive(Deserialize)]
struct RemoveKeyParams {
    id: String,
}

async fn handle_remove_key(id: Option<serde_json::Value>, params: serde_json::Value, keys: &KeyValidator) -> JsonRpcResponse {
    let p: RemoveKeyParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return JsonRpcResponse::error(id, -32602, format!("Invalid params: {}", e)),
    };
    match keys.remove_key(&p.id).await {
        Ok(()) => JsonRpcResponse::success(id, serde_json::json!({ "ok": true, "removed": p.id })),
        Err(e) => JsonRpcResponse::error(id, -32000, e.to_string()),
    }
}

#[derive(Deserialize)]
struct AddAccountParams {
    id: String,
    name: String,
    provider: String,
    #[serde(default = "default_endpoint_type", rename = "endpointType")]
    endpoint_type: String,
    #[serde(default, rename = "accountType")]
    account_type: AccountTypeParam,
    #[serde(default = "default_priority")]
    priority: i64,
    #[serde(default = "default_true")]
    schedulable: bool,
    #[serde(default)]
    group: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "lowercase")]
enum AccountTypeParam {
    #[default]
    Shared,
    Dedicated,
}

fn default_endpoint_type() -> String { "comm".to_string() }
fn default_priority() -> i64 { 100 }
fn default_true() -> bool { true }

async fn handle_add_account(id: Option<serde_json::Value>, params: serde_json::Value, accounts: &AccountRepository) -> JsonRpcResponse {
    let p: AddAccountParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return JsonRpcResponse::error(id, -32602, format!("Invalid params: {}", e)),
    };
    let account_type = match p.account_type {
        AccountTypeParam::Shared => AccountType::Shared,
        AccountTypeParam::Dedicated => AccountType::Dedicated,
    };
    let account = UpstreamAccount {
        id: p.id.clone(),
        name: p.name,
        provider: p.provider.clone(),
        endpoint_type: p.endpoint_type,
        account_type,
        priority: p.priority,
        schedulable: p.schedulable,
        healthy: true,
        last_used_at: None,
    };
    if let Err(e) = accounts.add_account(&account).await {
        return JsonRpcResponse::error(id, -32000, e.to_string());
    }
    if let Some(group) = p.group {
        if let Err(e) = accounts.add_to_group(&group, &p.id).await {
            return JsonRpcResponse::error(id, -32000, e.to_string());
        }
    }
    JsonRpcResponse::success(id, serde_json::json!({ "ok": true, "id": p.id }))
}

#[derive(Deserialize)]
struct RemoveAccountParams {
    provider: String,
    id: String,
}

async fn handle_remove_account(id: Option<serde_json::Value>, params: serde_json::Value, accounts: &AccountRepository) -> JsonRpcResponse {
    let p: RemoveAccountParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return JsonRpcResponse::error(id, -32602, format!("Invalid params: {}", e)),
    };
    match accounts.remove_account(&p.provider, &p.id).await {
        Ok(()) => JsonRpcResponse::success(id, serde_json::json!({ "ok": true, "removed": p.id })),
        Err(e) => JsonRpcResponse::error(id, -32000, e.to_string()),
    }
}

#[derive(Deserialize)]
struct ClearUnavailabilityParams {
    provider: String,
    id: String,
}

async fn handle_clear_unavailability(id: Option<serde_json::Value>, params: serde_json::Value, health: &UpstreamHealthTracker) -> JsonRpcResponse {
    let p: ClearUnavailabilityParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return JsonRpcResponse::error(id, -32602, format!("Invalid params: {}", e)),
    };
    match health.clear(&p.provider, &p.id).await {
        Ok(()) => JsonRpcResponse::success(id, serde_json::json!({ "ok": true })),
        Err(e) => JsonRpcResponse::error(id, -32000, e.to_string()),
    }
}

fn handle_rotate_token(id: Option<serde_json::Value>, auth: &RwLock<AdminAuthGuard>) -> JsonRpcResponse {
    let mut guard = auth.write().unwrap();
    match guard.rotate() {
        Ok(_) => {
            info!("admin token rotated via admin request");
            JsonRpcResponse::success(id, serde_json::json!({
                "ok": true,
                "message": "Token rotated. Clients should re-read the admin token file."
            }))
        }
        Err(e) => JsonRpcResponse::error(id, -32000, format!("token rotation failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn setup() -> (Arc<dyn SharedStore>, Arc<KeyValidator>, Arc<AccountRepository>, Arc<UpstreamHealthTracker>, Arc<RwLock<AdminAuthGuard>>, Arc<ControlSurfaceRateLimiter>) {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let keys = Arc::new(KeyValidator::new(store.clone()));
        let accounts = Arc::new(AccountRepository::new(store.clone()));
        let health = Arc::new(UpstreamHealthTracker::new(store.clone()));
        let dir = tempfile::tempdir().unwrap();
        let auth = Arc::new(RwLock::new(AdminAuthGuard::bootstrap(&dir.path().join("token")).unwrap()));
        // Leak the tempdir so it outlives the guard for the duration of the test.
        std::mem::forget(dir);
        let rate_limiter = Arc::new(ControlSurfaceRateLimiter::new(100, 60));
        (store, keys, accounts, health, auth, rate_limiter)
    }

    #[tokio::test]
    async fn unauthenticated_admin_call_is_rejected() {
        let (store, keys, accounts, health, auth, rl) = setup();
        let raw = r#"{"jsonrpc":"2.0","method":"fulcrum.admin.addKey","params":{"id":"k1","name":"k1","secret":"s"},"id":1}"#;
        let resp = handle_request(raw, &store, &keys, &accounts, &health, &auth, &rl).await;
        assert_eq!(resp.error.unwrap().code, -32001);
    }

    #[tokio::test]
    async fn authenticated_add_and_remove_key_round_trips() {
        let (store, keys, accounts, health, auth, rl) = setup();
        let token = auth.read().unwrap().validate("");
        assert!(!token);
        // Read the real token back out via bootstrap's file for the test call.
        let real_token = {
            let guard = auth.read().unwrap();
            std::fs::read_to_string(guard.token_file_path()).unwrap().trim().to_string()
        };

        let add_raw = format!(
            r#"{{"jsonrpc":"2.0","method":"fulcrum.admin.addKey","params":{{"id":"k1","name":"k1","secret":"s3cr3t"}},"auth":"{}","id":1}}"#,
            real_token
        );
        let resp = handle_request(&add_raw, &store, &keys, &accounts, &health, &auth, &rl).await;
        assert!(resp.error.is_none());
        assert!(keys.get("k1").await.unwrap().is_some());

        let remove_raw = format!(
            r#"{{"jsonrpc":"2.0","method":"fulcrum.admin.removeKey","params":{{"id":"k1"}},"auth":"{}","id":2}}"#,
            real_token
        );
        let resp = handle_request(&remove_raw, &store, &keys, &accounts, &health, &auth, &rl).await;
        assert!(resp.error.is_none());
        assert!(keys.get("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn health_is_open_without_auth() {
        let (store, keys, accounts, health, auth, rl) = setup();
        let raw = r#"{"jsonrpc":"2.0","method":"fulcrum.health","params":{},"id":1}"#;
        let resp = handle_request(raw, &store, &keys, &accounts, &health, &auth, &rl).await;
        assert!(resp.error.is_none());
    }
}
