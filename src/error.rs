//! Typed domain errors for the relay core, mirroring the documented
//! error taxonomy one-to-one with fixed HTTP status mappings.

use thiserror::Error;

/// A sanitized, client-facing error code plus the canonical HTTP mapping.
#[derive(Error, Debug, Clone)]
pub enum FulcrumError {
    #[error("upstream is temporarily unavailable")]
    ServiceUnavailable,

    #[error("network failure reaching upstream")]
    NetworkFailure,

    #[error("authentication failed")]
    AuthFailure,

    #[error("rate limit exceeded")]
    RateLimitExceeded { dimension: &'static str },

    #[error("invalid request")]
    InvalidRequest { reason: String },

    #[error("model is not offered")]
    ModelUnavailable { model: String },

    #[error("upstream error")]
    UpstreamError,

    #[error("request timed out")]
    Timeout,

    #[error("permission denied")]
    PermissionDenied,

    #[error("not found")]
    NotFound,

    #[error("no upstream account available")]
    AccountUnavailable { provider: String, endpoint: String },

    #[error("upstream is overloaded")]
    Overloaded,

    #[error("invalid api key")]
    InvalidApiKey { reason: &'static str },

    #[error("quota exceeded")]
    QuotaExceeded { dimension: &'static str },

    #[error("internal error")]
    Internal,
}

impl FulcrumError {
    /// Fixed HTTP status mapping, per the error taxonomy table.
    pub fn http_status(&self) -> u16 {
        match self {
            FulcrumError::ServiceUnavailable => 503,
            FulcrumError::NetworkFailure => 502,
            FulcrumError::AuthFailure => 401,
            FulcrumError::RateLimitExceeded { .. } => 429,
            FulcrumError::InvalidRequest { .. } => 400,
            FulcrumError::ModelUnavailable { .. } => 503,
            FulcrumError::UpstreamError => 502,
            FulcrumError::Timeout => 504,
            FulcrumError::PermissionDenied => 403,
            FulcrumError::NotFound => 404,
            FulcrumError::AccountUnavailable { .. } => 503,
            FulcrumError::Overloaded => 529,
            FulcrumError::InvalidApiKey { .. } => 401,
            FulcrumError::QuotaExceeded { .. } => 429,
            FulcrumError::Internal => 500,
        }
    }

    /// Sanitized code surfaced to clients (matches the taxonomy table's `Code` column).
    pub fn code(&self) -> &'static str {
        match self {
            FulcrumError::ServiceUnavailable => "service-unavailable",
            FulcrumError::NetworkFailure => "network-failure",
            FulcrumError::AuthFailure => "auth-failure",
            FulcrumError::RateLimitExceeded { .. } => "rate-limit-exceeded",
            FulcrumError::InvalidRequest { .. } => "invalid-request",
            FulcrumError::ModelUnavailable { .. } => "model-unavailable",
            FulcrumError::UpstreamError => "upstream-error",
            FulcrumError::Timeout => "timeout",
            FulcrumError::PermissionDenied => "permission-denied",
            FulcrumError::NotFound => "not-found",
            FulcrumError::AccountUnavailable { .. } => "account-unavailable",
            FulcrumError::Overloaded => "overloaded",
            FulcrumError::InvalidApiKey { .. } => "invalid-api-key",
            FulcrumError::QuotaExceeded { .. } => "quota-exceeded",
            FulcrumError::Internal => "internal-error",
        }
    }
}

/// Classify an upstream HTTP status (observed by the proxy pipeline) into
/// an [`UnavailabilityKind`] for UHT, or `None` if the status isn't pausable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailabilityKind {
    ServerError,
    Overload,
    AuthError,
    Timeout,
    RateLimit,
}

impl UnavailabilityKind {
    pub fn classify(status: u16, is_network_timeout: bool) -> Option<Self> {
        if is_network_timeout {
            return Some(UnavailabilityKind::Timeout);
        }
        match status {
            429 => Some(UnavailabilityKind::RateLimit),
            401 | 403 => Some(UnavailabilityKind::AuthError),
            504 => Some(UnavailabilityKind::Timeout),
            529 => Some(UnavailabilityKind::Overload),
            s if s >= 500 => Some(UnavailabilityKind::ServerError),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnavailabilityKind::ServerError => "server_error",
            UnavailabilityKind::Overload => "overload",
            UnavailabilityKind::AuthError => "auth_error",
            UnavailabilityKind::Timeout => "timeout",
            UnavailabilityKind::RateLimit => "rate_limit",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "server_error" => Some(UnavailabilityKind::ServerError),
            "overload" => Some(UnavailabilityKind::Overload),
            "auth_error" => Some(UnavailabilityKind::AuthError),
            "timeout" => Some(UnavailabilityKind::Timeout),
            "rate_limit" => Some(UnavailabilityKind::RateLimit),
            _ => None,
        }
    }

    /// Default TTL in seconds, per the documented defaults (overridable).
    pub fn default_ttl_secs(&self) -> u64 {
        match self {
            UnavailabilityKind::ServerError => 300,
            UnavailabilityKind::Overload => 600,
            UnavailabilityKind::AuthError => 1800,
            UnavailabilityKind::Timeout => 300,
            UnavailabilityKind::RateLimit => 300,
        }
    }
}

/// Strip internal routing tags (patterns like `[name/name]`) before an
/// upstream error body is forwarded to a client.
pub fn sanitize_upstream_body(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '[' {
            let mut tag = String::new();
            let mut closed = false;
            while let Some(&next) = chars.peek() {
                if next == ']' {
                    chars.next();
                    closed = true;
                    break;
                }
                if next == '[' || next == '\n' {
                    break;
                }
                tag.push(next);
                chars.next();
            }
            if closed && tag.contains('/') && tag.chars().all(|c| c.is_alphanumeric() || c == '/' || c == '-' || c == '_') {
                continue;
            }
            out.push('[');
            out.push_str(&tag);
            if closed {
                out.push(']');
            }
        } else {
            out.push(c);
        }
    }
    out
}
