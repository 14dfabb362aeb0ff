use crate::config::RateLimitConfig;
use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, KeyRecord>>,
    limiter: Arc<TokenBuckets>,
}

/// Who is calling; inserted into request extensions by [`require_admin_auth`].
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub caller: String,
    pub key_id: String,
}

#[derive(Clone)]
struct KeyRecord {
    caller: String,
    key_id: String,
}

impl AuthState {
    /// `raw` is a comma-separated `label:key` list. An empty list locks every
    /// protected route.
    pub fn new(raw: &str, rate_limit: RateLimitConfig) -> Self {
        Self {
            records: Arc::new(parse_keys(raw)),
            limiter: Arc::new(TokenBuckets::new(rate_limit)),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).map(|record| AuthContext {
            caller: record.caller.clone(),
            key_id: record.key_id.clone(),
        })
    }

    async fn consume(&self, caller: &str) -> Result<RatePermit, RateExceeded> {
        self.limiter.consume(caller).await
    }
}

pub async fn require_admin_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing admin key: provide X-Admin-Key or a Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(unauthorized_response("admin key not recognized"));
    };

    match state.consume(&context.caller).await {
        Ok(permit) => {
            request.extensions_mut().insert(context.clone());
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            warn!(target = "compose.api", caller = %context.caller, "rate limited");
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ApiError::new("too many requests")),
            )
                .into_response();
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string()).filter(|v| !v.is_empty());
    }
    headers
        .get("X-Admin-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(ApiError::new(message))).into_response()
}

fn parse_keys(raw: &str) -> HashMap<String, KeyRecord> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let label = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (label, key) {
            (Some(label), Some(secret)) => {
                entries.insert(
                    secret.to_string(),
                    KeyRecord {
                        caller: label.to_string(),
                        key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            // the entry holds a secret, so only its position is logged
            _ => warn!(
                target = "compose.api",
                position = idx + 1,
                "ignored malformed ADMIN_API_KEYS entry"
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "compose.api",
            "ADMIN_API_KEYS is empty; protected routes will reject every request"
        );
    } else {
        info!(
            target = "compose.api",
            key_count = entries.len(),
            "loaded admin keys"
        );
    }
    entries
}

struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl TokenBuckets {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            rate_per_sec: if config.rate_per_sec > 0.0 {
                config.rate_per_sec
            } else {
                1.0
            },
            capacity: config.capacity.max(1.0),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn consume(&self, key: &str) -> Result<RatePermit, RateExceeded> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(RatePermit {
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        } else {
            let deficit = 1.0 - state.tokens;
            Err(RateExceeded {
                retry_after: (deficit / self.rate_per_sec).max(0.0),
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
struct RatePermit {
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RatePermit {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.tokens.max(0.0).floor() as u64;
        set_header(headers, "X-RateLimit-Limit", self.capacity as u64);
        set_header(headers, "X-RateLimit-Remaining", remaining);
        set_header(headers, "X-RateLimit-Reset", reset_secs(self.capacity, self.tokens, self.rate));
    }
}

#[derive(Debug, Clone)]
struct RateExceeded {
    retry_after: f64,
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RateExceeded {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        headers.insert(
            http::header::RETRY_AFTER,
            HeaderValue::from(self.retry_after.ceil().max(1.0) as u64),
        );
        set_header(headers, "X-RateLimit-Limit", self.capacity as u64);
        set_header(headers, "X-RateLimit-Remaining", 0);
        set_header(headers, "X-RateLimit-Reset", reset_secs(self.capacity, self.tokens, self.rate));
    }
}

fn reset_secs(capacity: f64, tokens: f64, rate: f64) -> u64 {
    ((capacity - tokens) / rate).ceil().max(0.0) as u64
}

fn set_header(headers: &mut http::HeaderMap, name: &'static str, value: u64) {
    headers.insert(name, HeaderValue::from(value));
}
