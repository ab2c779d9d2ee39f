//! Proxy Engine (PE) — glues KV → RLG → SCH → upstream transport → UR,
//! grounded on the teacher's `pool/swarm.rs` failover-cascade shape for the
//! admit/route/forward sequencing, on `adapters/anthropic.rs`'s two-pool
//! reqwest usage for the streaming/non-streaming HTTP clients, and on
//! `wangyccn-AI-Relay-Technology`'s `forward/client.rs` (`make_request`,
//! `drain_sse_lines`) for the pooled-request-plus-SSE-framing shape of the
//! actual transport below.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::accounts::UpstreamAccount;
use crate::error::{FulcrumError, UnavailabilityKind};
use crate::health::UpstreamHealthTracker;
use crate::keys::{ApiKey, KeyValidator};
use crate::pricing::{calculate_cost, PricingRegistry, UsageInput};
use crate::ratelimit::{KeyLimits, RateLimitGate};
use crate::scheduler::{AccountBinding, ScheduleRequest, Scheduler};
use crate::service_rate::ServiceRateRegistry;
use crate::usage::{UsageCounts, UsageEvent, UsageRecorder};

/// Inbound request contract, owned by the adapter layer — the core only
/// consumes these fields.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub key_secret: String,
    pub provider: String,
    pub endpoint_type: String,
    pub model: String,
    pub is_streaming: bool,
    pub client_identifier: String,
    pub session_hash: Option<String>,
    pub request_beta_header: Option<String>,
}

/// What PE hands back to the adapter once a request is admitted and routed.
/// Credential/URL resolution for `account_id` stays with the adapter (the
/// core never holds upstream secrets); `header_overrides` carries any
/// account-specific headers the adapter should merge into the outbound
/// request it builds for [`ProxyEngine::forward_buffered`] /
/// [`ProxyEngine::forward_streaming`].
#[derive(Debug, Clone)]
pub struct OutboundDecision {
    pub account_id: String,
    pub header_overrides: Vec<(String, String)>,
}

/// A fully-resolved upstream HTTP request: URL, headers (already carrying
/// provider auth), and body. Built by the adapter, which alone knows how to
/// turn an `account_id` into credentials and a wire-protocol body; PE only
/// executes it against the right pool and frames the response.
pub struct OutboundHttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Usage extracted at stream-end (SSE) or from a buffered JSON completion.
#[derive(Debug, Clone, Default)]
pub struct StreamUsageEvent {
    pub input: u64,
    pub output: u64,
    pub cache_create: u64,
    pub cache_read: u64,
    pub ephemeral_5m: Option<u64>,
    pub ephemeral_1h: Option<u64>,
    pub speed: Option<String>,
    pub stop_reason: Option<String>,
}

/// An upstream failure observed by the proxy pipeline.
#[derive(Debug, Clone)]
pub struct UpstreamErrorEvent {
    pub http_status: u16,
    pub response_headers: http::HeaderMap,
    pub body_snippet: String,
    pub network_code: Option<String>,
}

/// A request that passed KV/RLG/SCH and is ready to be forwarded upstream.
pub struct AdmittedRequest {
    pub key: ApiKey,
    pub account: UpstreamAccount,
    pub decision: OutboundDecision,
    provider: String,
    rate_limit_window_secs: i64,
    window_started_at_ms: i64,
    weekly_family: Option<String>,
}

pub struct ProxyEngine {
    keys: Arc<KeyValidator>,
    rate_limits: Arc<RateLimitGate>,
    scheduler: Arc<Scheduler>,
    health: Arc<UpstreamHealthTracker>,
    pricing: Arc<PricingRegistry>,
    service_rates: Arc<ServiceRateRegistry>,
    usage: Arc<UsageRecorder>,
    stream_client: reqwest::Client,
    buffered_client: reqwest::Client,
}

impl ProxyEngine {
    pub fn new(
        keys: Arc<KeyValidator>,
        rate_limits: Arc<RateLimitGate>,
        scheduler: Arc<Scheduler>,
        health: Arc<UpstreamHealthTracker>,
        pricing: Arc<PricingRegistry>,
        service_rates: Arc<ServiceRateRegistry>,
        usage: Arc<UsageRecorder>,
    ) -> Result<Self> {
        let stream_client = reqwest::Client::builder()
            .pool_max_idle_per_host(256)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        let buffered_client = reqwest::Client::builder()
            .pool_max_idle_per_host(256)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            keys,
            rate_limits,
            scheduler,
            health,
            pricing,
            service_rates,
            usage,
            stream_client,
            buffered_client,
        })
    }

    /// The non-transport half of PE: validate the key, check admission,
    /// pick an upstream account. Returns everything the caller needs to
    /// open the upstream connection and, later, call [`Self::complete`].
    pub async fn admit_and_route(&self, req: &InboundRequest) -> Result<AdmittedRequest, FulcrumError> {
        let key = self.keys.validate_for_relay(&req.key_secret).await?;

        if !KeyValidator::has_permission(&key.permissions, &req.provider) {
            return Err(FulcrumError::PermissionDenied);
        }
        if !key.restricted_models.is_empty() && !key.restricted_models.iter().any(|m| m == &req.model) {
            return Err(FulcrumError::ModelUnavailable { model: req.model.clone() });
        }
        if !key.allowed_clients.is_empty() && !key.allowed_clients.iter().any(|c| c == &req.client_identifier) {
            return Err(FulcrumError::PermissionDenied);
        }

        let limits = self.key_limits(&key, &req.model);
        self.rate_limits.admit(&key.id, &limits, Utc::now()).await?;

        let binding = AccountBinding::parse(key.binding.as_deref());
        let schedule_req = ScheduleRequest {
            provider: &req.provider,
            endpoint_type: &req.endpoint_type,
            key_id: &key.id,
            binding: &binding,
            session_hash: req.session_hash.as_deref(),
        };
        let account = self.scheduler.select(&schedule_req).await?;

        let decision = OutboundDecision {
            account_id: account.id.clone(),
            header_overrides: Vec::new(),
        };

        let weekly_family = weekly_family_for(&req.model);

        Ok(AdmittedRequest {
            key,
            account,
            decision,
            provider: req.provider.clone(),
            rate_limit_window_secs: limits.rate_limit_window_secs,
            window_started_at_ms: Utc::now().timestamp_millis(),
            weekly_family,
        })
    }

    fn key_limits(&self, key: &ApiKey, model: &str) -> KeyLimits {
        let requested_family = weekly_family_for(model);
        let applies_weekly_cap = requested_family.as_deref() == Some("opus") && key.weekly_opus_cost_limit_usd.is_some();

        KeyLimits {
            rate_limit_window_secs: key.rate_limit_window_minutes * 60,
            rate_limit_requests: key.rate_limit_requests,
            rate_limit_tokens: key.token_limit,
            rate_limit_cost_micro: key.rate_limit_cost_micro,
            total_cost_limit_usd: key.total_cost_limit_usd,
            daily_cost_limit_usd: key.daily_cost_limit_usd,
            weekly_cost_limit_usd: if applies_weekly_cap { key.weekly_opus_cost_limit_usd } else { None },
            weekly_family: if applies_weekly_cap { requested_family } else { None },
        }
    }

    /// The HTTP client pool appropriate for this request's transport mode.
    fn client_for(&self, is_streaming: bool) -> &reqwest::Client {
        if is_streaming {
            &self.stream_client
        } else {
            &self.buffered_client
        }
    }

    /// Open an upstream connection via the buffered pool and return the
    /// full response. On a non-2xx status or network failure, classifies
    /// the failure through UHT and returns the sanitized error — the
    /// caller never sees a raw upstream status or transport error.
    pub async fn forward_buffered(
        &self,
        admitted: &AdmittedRequest,
        request: OutboundHttpRequest,
    ) -> Result<(http::HeaderMap, Vec<u8>), FulcrumError> {
        let resp = match self.send(self.client_for(false), &request).await {
            Ok(resp) => resp,
            Err(event) => return Err(self.handle_upstream_error(admitted, event).await),
        };

        let status = resp.status();
        let headers = resp.headers().clone();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let event = UpstreamErrorEvent {
                http_status: status.as_u16(),
                response_headers: headers,
                body_snippet: truncate(&body, 500),
                network_code: None,
            };
            return Err(self.handle_upstream_error(admitted, event).await);
        }

        let body = resp
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|_| FulcrumError::NetworkFailure)?;
        Ok((headers, body))
    }

    /// Open an upstream connection via the streaming pool, forward each
    /// chunk to `chunk_tx` as it arrives (the upstream reader suspends
    /// whenever the client writer can't drain, per the channel's bounded
    /// backpressure), and concurrently frame `data: …` SSE events for the
    /// caller to fold into a [`StreamUsageEvent`]. If the receiving end is
    /// gone (client disconnected) the upstream read is aborted and the
    /// pooled connection released.
    pub async fn forward_streaming(
        &self,
        admitted: &AdmittedRequest,
        request: OutboundHttpRequest,
        chunk_tx: mpsc::Sender<Bytes>,
    ) -> Result<Vec<SseFrame>, FulcrumError> {
        let resp = match self.send(self.client_for(true), &request).await {
            Ok(resp) => resp,
            Err(event) => return Err(self.handle_upstream_error(admitted, event).await),
        };

        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            let event = UpstreamErrorEvent {
                http_status: status.as_u16(),
                response_headers: headers,
                body_snippet: truncate(&body, 500),
                network_code: None,
            };
            return Err(self.handle_upstream_error(admitted, event).await);
        }

        let mut parser = SseFrameParser::new();
        let mut frames = Vec::new();
        let mut byte_stream = resp.bytes_stream();
        while let Some(next) = byte_stream.next().await {
            let chunk = match next {
                Ok(chunk) => chunk,
                Err(_) => return Err(FulcrumError::Timeout),
            };
            if let Ok(text) = std::str::from_utf8(&chunk) {
                frames.extend(parser.push(text));
            }
            if chunk_tx.send(chunk).await.is_err() {
                // Client disconnected: drop `byte_stream`/`resp` on return,
                // releasing the pooled connection without reading further.
                break;
            }
        }
        Ok(frames)
    }

    async fn send(&self, client: &reqwest::Client, request: &OutboundHttpRequest) -> Result<reqwest::Response, UpstreamErrorEvent> {
        let mut builder = client.post(&request.url).body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder.send().await.map_err(|err| UpstreamErrorEvent {
            http_status: 0,
            response_headers: http::HeaderMap::new(),
            body_snippet: err.to_string(),
            network_code: Some(if err.is_timeout() { "timeout".to_string() } else { "connect".to_string() }),
        })
    }

    /// Called once usage is known (stream-end or buffered completion):
    /// computes cost via CC, converts to credits via SRR, hands off to UR.
    pub async fn complete(&self, admitted: &AdmittedRequest, model: &str, beta_header: Option<&str>, usage: StreamUsageEvent) {
        let row = self.pricing.resolve(model).await;
        let usage_input = UsageInput {
            input: usage.input,
            output: usage.output,
            cache_create: usage.cache_create,
            cache_read: usage.cache_read,
            ephemeral_5m: usage.ephemeral_5m,
            ephemeral_1h: usage.ephemeral_1h,
            model: model.to_string(),
            request_beta_header: beta_header.map(|s| s.to_string()),
            speed: usage.speed.clone(),
        };
        let cost = calculate_cost(&usage_input, row.as_ref());
        let provider = self.service_rates.resolve_provider(Some(&admitted.provider), model);
        let credits = self.service_rates.convert_to_credits(cost.total_cost_usd, &provider).await;
        let rated_cost_micro = (credits * 1_000_000.0).round() as i64;

        self.usage
            .record(UsageEvent {
                key_id: &admitted.key.id,
                account_id: &admitted.account.id,
                provider: &admitted.provider,
                model,
                usage: UsageCounts {
                    requests: 1,
                    input_tokens: usage.input as i64,
                    output_tokens: usage.output as i64,
                    cache_create_tokens: usage.cache_create as i64,
                    cache_read_tokens: usage.cache_read as i64,
                },
                cost,
                rated_cost_micro,
                weekly_family: admitted.weekly_family.as_deref(),
                rate_limit_window_secs: admitted.rate_limit_window_secs,
                window_started_at_ms: admitted.window_started_at_ms,
            })
            .await;
    }

    /// Called on an upstream failure: classify it, mark the account
    /// temporarily unavailable in UHT, and return the sanitized error to
    /// surface to the client.
    pub async fn handle_upstream_error(&self, admitted: &AdmittedRequest, event: UpstreamErrorEvent) -> FulcrumError {
        let is_timeout = event.network_code.as_deref() == Some("timeout");
        if let Some(kind) = UnavailabilityKind::classify(event.http_status, is_timeout) {
            let hint = if kind == UnavailabilityKind::RateLimit {
                UpstreamHealthTracker::parse_retry_hint(&event.response_headers, Utc::now().timestamp())
            } else {
                None
            };
            if let Err(err) = self
                .health
                .mark_unavailable(&admitted.provider, &admitted.account.id, event.http_status, kind, hint)
                .await
            {
                tracing::warn!(error = %err, "failed to record unavailability mark");
            }
        }
        classify_upstream_status(event.http_status, is_timeout)
    }
}

/// Truncate a string at a byte boundary, never splitting a UTF-8 char.
fn truncate(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn classify_upstream_status(status: u16, is_timeout: bool) -> FulcrumError {
    if is_timeout || status == 504 {
        return FulcrumError::Timeout;
    }
    match status {
        429 => FulcrumError::RateLimitExceeded { dimension: "upstream" },
        401 | 403 => FulcrumError::AuthFailure,
        529 => FulcrumError::Overloaded,
        s if s >= 500 => FulcrumError::UpstreamError,
        _ => FulcrumError::UpstreamError,
    }
}

/// The documented "Opus weekly" family bucket; other weekly families can be
/// added here as they're introduced.
fn weekly_family_for(model: &str) -> Option<String> {
    if model.to_lowercase().contains("opus") {
        Some("opus".to_string())
    } else {
        None
    }
}

/// Parses a not-restartable SSE byte stream into discrete `data: …` frames,
/// buffering a partial frame across reads and skipping unparseable lines.
#[derive(Default)]
pub struct SseFrameParser {
    buffer: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Data(String),
    Done,
}

impl SseFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly-read bytes; returns any complete frames found so far.
    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let frame = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);
            for line in frame.lines() {
                let Some(data) = line.strip_prefix("data:") else { continue };
                let data = data.trim();
                if data == "[DONE]" {
                    frames.push(SseFrame::Done);
                } else {
                    frames.push(SseFrame::Data(data.to_string()));
                }
            }
        }
        frames
    }
}
