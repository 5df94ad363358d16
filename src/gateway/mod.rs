//! Axum-based webhook gateway with body limits, timeouts, and per-client
//! rate limiting.
//!
//! All webhook traffic lands on the fallback handler, which resolves the
//! request path against the target registry at request time. Accounts can
//! register and unregister paths while the server is running.

pub mod registry;
pub mod replay;

use crate::channels::{
    EventKind, InboundEvent, ReplyPipeline, StatusPatch, StatusSink, WebhookPayload,
};
use crate::config::GatewayConfig;
use crate::media::MediaStore;
use crate::util::{epoch_ms, truncate_with_ellipsis};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use parking_lot::Mutex;
use registry::{TargetRegistry, WebhookTarget};
use replay::ReplayCache;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Fixed window used by webhook rate limiting.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;
/// Body acknowledged to Meta before any event is dispatched.
pub const EVENT_RECEIVED: &str = "EVENT_RECEIVED";

const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Fixed-window request counter keyed by (path, client). A new window starts
/// when the previous one ends; the map is bounded and evicts the key with the
/// stalest window under cardinality pressure.
#[derive(Debug)]
pub struct FixedWindowRateLimiter {
    limit_per_window: u32,
    window: Duration,
    max_keys: usize,
    windows: Mutex<HashMap<String, WindowSlot>>,
}

#[derive(Debug, Clone, Copy)]
struct WindowSlot {
    started_at: Instant,
    count: u32,
}

impl FixedWindowRateLimiter {
    pub fn new(limit_per_window: u32, window: Duration, max_keys: usize) -> Self {
        Self {
            limit_per_window,
            window,
            max_keys: max_keys.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if the request fits in the current window. A limit of 0
    /// disables rate limiting.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        if self.limit_per_window == 0 {
            return true;
        }

        let mut windows = self.windows.lock();

        if let Some(slot) = windows.get_mut(key) {
            if now.duration_since(slot.started_at) >= self.window {
                slot.started_at = now;
                slot.count = 1;
                return true;
            }
            if slot.count >= self.limit_per_window {
                return false;
            }
            slot.count += 1;
            return true;
        }

        if windows.len() >= self.max_keys {
            let window = self.window;
            windows.retain(|_, slot| now.duration_since(slot.started_at) < window);

            if windows.len() >= self.max_keys {
                let evict_key = windows
                    .iter()
                    .min_by_key(|(_, slot)| slot.started_at)
                    .map(|(k, _)| k.clone());
                if let Some(evict_key) = evict_key {
                    windows.remove(&evict_key);
                }
            }
        }

        windows.insert(
            key.to_string(),
            WindowSlot {
                started_at: now,
                count: 1,
            },
        );
        true
    }
}

fn parse_client_ip(value: &str) -> Option<IpAddr> {
    let value = value.trim().trim_matches('"').trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }

    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr.ip());
    }

    let value = value.trim_matches(['[', ']']);
    value.parse::<IpAddr>().ok()
}

fn forwarded_client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    if let Some(xff) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
        for candidate in xff.split(',') {
            if let Some(ip) = parse_client_ip(candidate) {
                return Some(ip);
            }
        }
    }

    headers
        .get("X-Real-IP")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_client_ip)
}

fn client_key_from_request(
    peer_addr: Option<SocketAddr>,
    headers: &HeaderMap,
    trust_forwarded_headers: bool,
) -> String {
    if trust_forwarded_headers {
        if let Some(ip) = forwarded_client_ip(headers) {
            return ip.to_string();
        }
    }

    peer_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Compare two strings without early exit, padding the shorter input.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();

    let len_diff = a.len() ^ b.len();

    let max_len = a.len().max(b.len());
    let mut byte_diff = 0u8;
    for i in 0..max_len {
        let x = *a.get(i).unwrap_or(&0);
        let y = *b.get(i).unwrap_or(&0);
        byte_diff |= x ^ y;
    }
    (len_diff == 0) & (byte_diff == 0)
}

/// Verify a Meta webhook signature (`X-Hub-Signature-256`).
/// See: <https://developers.facebook.com/docs/graph-api/webhooks/getting-started#verification-requests>
pub fn verify_hub_signature(app_secret: &str, body: &[u8], signature_header: &str) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    // Signature format: "sha256=<hex_signature>"
    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    // Constant-time comparison
    mac.verify_slice(&expected).is_ok()
}

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TargetRegistry>,
    pub rate_limiter: Arc<FixedWindowRateLimiter>,
    pub replay: Arc<ReplayCache>,
    pub pipeline: Arc<dyn ReplyPipeline>,
    pub media: Arc<MediaStore>,
    pub trust_forwarded_headers: bool,
}

impl AppState {
    pub fn new(
        gateway: &GatewayConfig,
        registry: Arc<TargetRegistry>,
        pipeline: Arc<dyn ReplyPipeline>,
        media: Arc<MediaStore>,
    ) -> Self {
        Self {
            registry,
            rate_limiter: Arc::new(FixedWindowRateLimiter::new(
                gateway.webhook_rate_limit_per_minute,
                Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
                gateway.rate_limit_max_keys,
            )),
            replay: Arc::new(ReplayCache::new(
                Duration::from_secs(gateway.replay_ttl_secs),
                gateway.replay_max_entries,
            )),
            pipeline,
            media,
            trust_forwarded_headers: gateway.trust_forwarded_headers,
        }
    }
}

/// Build the gateway router. Webhook paths are not routed statically; the
/// fallback handler resolves them against the registry per request.
pub fn build_router(state: AppState, gateway: &GatewayConfig) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .fallback(handle_webhook)
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(gateway.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(gateway.request_timeout_secs),
        ))
}

/// Run the HTTP gateway until the process is stopped.
pub async fn run_gateway(gateway: &GatewayConfig, state: AppState) -> Result<()> {
    let app = build_router(state, gateway);

    let addr = format!("{}:{}", gateway.host, gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind gateway to {addr}"))?;

    tracing::info!("Webhook gateway listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// GET /health — gateway liveness plus per-account activity timestamps.
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let accounts: Vec<serde_json::Value> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|(path, target)| {
            serde_json::json!({
                "account_id": target.account_id,
                "path": path,
                "last_inbound_at": target.status.last_inbound_at(),
                "last_outbound_at": target.status.last_outbound_at(),
            })
        })
        .collect();

    Json(serde_json::json!({
        "status": "ok",
        "accounts": accounts,
    }))
}

#[derive(Debug, Deserialize, Default)]
struct HubVerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// Fallback handler for all registered webhook paths.
async fn handle_webhook(
    State(state): State<AppState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    Query(query): Query<HubVerifyQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let targets = state.registry.resolve(&path);
    if targets.is_empty() {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    }

    if method == Method::GET {
        handle_verify(&path, &targets, &query)
    } else if method == Method::POST {
        handle_delivery(state, &path, targets, Some(peer_addr), &headers, &body)
    } else {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, "GET, POST")],
            "Method Not Allowed",
        )
            .into_response()
    }
}

/// Meta webhook verification handshake. The raw challenge is echoed back on
/// success; a present-but-wrong token is a 403, a malformed request a 400.
fn handle_verify(path: &str, targets: &[Arc<WebhookTarget>], query: &HubVerifyQuery) -> Response {
    if query.mode.as_deref() != Some("subscribe") || query.challenge.is_none() {
        return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
    }

    let token_matches = query.verify_token.as_deref().is_some_and(|presented| {
        targets
            .iter()
            .any(|t| constant_time_eq(presented, &t.verify_token))
    });

    if token_matches {
        tracing::info!(path = %path, "webhook verification succeeded");
        if let Some(challenge) = query.challenge.clone() {
            return (StatusCode::OK, challenge).into_response();
        }
    }

    tracing::warn!(path = %path, "webhook verification failed: token mismatch");
    (StatusCode::FORBIDDEN, "Forbidden").into_response()
}

fn handle_delivery(
    state: AppState,
    path: &str,
    targets: Vec<Arc<WebhookTarget>>,
    peer_addr: Option<SocketAddr>,
    headers: &HeaderMap,
    body: &Bytes,
) -> Response {
    // ── Rate limit per (path, client) ──────────────────────────────
    let client = client_key_from_request(peer_addr, headers, state.trust_forwarded_headers);
    let rate_key = format!("{path}|{client}");
    if !state.rate_limiter.allow(&rate_key) {
        tracing::warn!(path = %path, client = %client, "webhook rate limit exceeded");
        return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
    }

    // ── Parse ──────────────────────────────────────────────────────
    let payload: WebhookPayload = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(path = %path, "malformed webhook payload: {e}");
            return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        }
    };

    // ── Signature: first target that verifies claims the delivery ──
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let Some(target) = claim_delivery(&targets, body, signature) else {
        tracing::warn!(path = %path, "webhook signature verification failed for all targets");
        return (StatusCode::UNAUTHORIZED, "Invalid signature").into_response();
    };

    if payload.object != "instagram" {
        tracing::debug!(
            path = %path,
            object = %payload.object,
            "ignoring webhook for foreign object type"
        );
        return (StatusCode::OK, EVENT_RECEIVED).into_response();
    }

    // Acknowledge before dispatch; Meta redelivers on anything else.
    tokio::spawn(dispatch_events(state, Arc::clone(target), payload));

    (StatusCode::OK, EVENT_RECEIVED).into_response()
}

fn claim_delivery<'a>(
    targets: &'a [Arc<WebhookTarget>],
    body: &Bytes,
    signature: &str,
) -> Option<&'a Arc<WebhookTarget>> {
    targets.iter().find(|target| match &target.app_secret {
        Some(secret) => verify_hub_signature(secret, body, signature),
        None => {
            tracing::debug!(
                account = %target.account_id,
                "no app secret configured; accepting delivery unverified"
            );
            true
        }
    })
}

/// Fan a verified batch out to the reply pipeline, one task per event so a
/// failing event never blocks its siblings.
async fn dispatch_events(state: AppState, target: Arc<WebhookTarget>, payload: WebhookPayload) {
    target.status.notify(StatusPatch::inbound(epoch_ms()));

    for entry in payload.entry {
        for messaging in entry.messaging {
            if messaging.is_echo_or_deleted() {
                tracing::debug!(
                    account = %target.account_id,
                    "skipping echo/deleted message"
                );
                continue;
            }

            if let Some(mid) = messaging.message_id() {
                if state.replay.check_and_mark(&format!("msg:{mid}")) {
                    tracing::debug!(
                        account = %target.account_id,
                        mid = %mid,
                        "skipping duplicate delivery"
                    );
                    continue;
                }
            }

            let Some(event) = crate::channels::instagram::normalize_event(
                &target.account_id,
                &messaging,
            ) else {
                tracing::debug!(
                    account = %target.account_id,
                    "skipping event with no actionable content"
                );
                continue;
            };

            if !target.channel.is_sender_allowed(&event.sender_id) {
                tracing::info!(
                    account = %target.account_id,
                    sender = %event.sender_id,
                    "sender not allowed by dm policy"
                );
                continue;
            }

            tokio::spawn(process_event(state.clone(), target.clone(), event));
        }
    }
}

async fn process_event(state: AppState, target: Arc<WebhookTarget>, mut event: InboundEvent) {
    tracing::info!(
        account = %target.account_id,
        sender = %event.sender_id,
        "inbound: {}",
        truncate_with_ellipsis(event.text.as_deref().unwrap_or("<media>"), 80)
    );

    target.channel.send_typing_on(&event.sender_id).await;

    if event.kind == EventKind::Media {
        if let Some(url) = event.attachment_urls.first() {
            match state.media.fetch(url).await {
                Ok(path) => event.media_path = Some(path.display().to_string()),
                Err(e) => {
                    tracing::warn!(
                        account = %target.account_id,
                        "media fetch failed: {e}"
                    );
                    if event.text.is_none() {
                        event.text = Some("<media:image>".to_string());
                    }
                }
            }
        }
    }

    let replies = match state.pipeline.produce_replies(&event).await {
        Ok(replies) => replies,
        Err(e) => {
            tracing::error!(
                account = %target.account_id,
                sender = %event.sender_id,
                "reply pipeline failed: {e}"
            );
            return;
        }
    };

    for reply in &replies {
        target
            .channel
            .deliver_reply(&event.sender_id, reply, target.status.as_ref())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── rate limiter ───────────────────────────────────────────────

    #[test]
    fn limiter_allows_up_to_limit() {
        let limiter = FixedWindowRateLimiter::new(3, Duration::from_secs(60), 100);
        let now = Instant::now();
        assert!(limiter.allow_at("k", now));
        assert!(limiter.allow_at("k", now));
        assert!(limiter.allow_at("k", now));
        assert!(!limiter.allow_at("k", now));
    }

    #[test]
    fn limiter_window_resets() {
        let limiter = FixedWindowRateLimiter::new(1, Duration::from_secs(60), 100);
        let now = Instant::now();
        assert!(limiter.allow_at("k", now));
        assert!(!limiter.allow_at("k", now + Duration::from_secs(59)));
        assert!(limiter.allow_at("k", now + Duration::from_secs(60)));
    }

    #[test]
    fn limiter_keys_are_independent() {
        let limiter = FixedWindowRateLimiter::new(1, Duration::from_secs(60), 100);
        let now = Instant::now();
        assert!(limiter.allow_at("a", now));
        assert!(limiter.allow_at("b", now));
        assert!(!limiter.allow_at("a", now));
    }

    #[test]
    fn limiter_zero_limit_disables() {
        let limiter = FixedWindowRateLimiter::new(0, Duration::from_secs(60), 100);
        for _ in 0..1_000 {
            assert!(limiter.allow("k"));
        }
    }

    #[test]
    fn limiter_evicts_stalest_key_at_capacity() {
        let limiter = FixedWindowRateLimiter::new(10, Duration::from_secs(60), 2);
        let now = Instant::now();
        assert!(limiter.allow_at("old", now));
        assert!(limiter.allow_at("mid", now + Duration::from_secs(1)));
        // Third key forces eviction of "old" (stalest window).
        assert!(limiter.allow_at("new", now + Duration::from_secs(2)));
        let windows = limiter.windows.lock();
        assert_eq!(windows.len(), 2);
        assert!(!windows.contains_key("old"));
        assert!(windows.contains_key("mid"));
        assert!(windows.contains_key("new"));
    }

    // ── signatures ─────────────────────────────────────────────────

    fn sign(secret: &str, body: &[u8]) -> String {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn signature_roundtrip_verifies() {
        let body = br#"{"object":"instagram","entry":[]}"#;
        let header = sign("app-secret", body);
        assert!(verify_hub_signature("app-secret", body, &header));
    }

    #[test]
    fn signature_wrong_secret_fails() {
        let body = b"payload";
        let header = sign("app-secret", body);
        assert!(!verify_hub_signature("other-secret", body, &header));
    }

    #[test]
    fn signature_tampered_body_fails() {
        let header = sign("app-secret", b"payload");
        assert!(!verify_hub_signature("app-secret", b"payload2", &header));
    }

    #[test]
    fn signature_requires_sha256_prefix() {
        let body = b"payload";
        let header = sign("app-secret", body);
        let stripped = header.strip_prefix("sha256=").unwrap();
        assert!(!verify_hub_signature("app-secret", body, stripped));
        assert!(!verify_hub_signature(
            "app-secret",
            body,
            &format!("sha1={stripped}")
        ));
    }

    #[test]
    fn signature_rejects_bad_hex() {
        assert!(!verify_hub_signature("secret", b"x", "sha256=not-hex"));
        assert!(!verify_hub_signature("secret", b"x", ""));
    }

    // ── client key ─────────────────────────────────────────────────

    #[test]
    fn client_ip_parses_plain_and_socket_forms() {
        assert_eq!(parse_client_ip("10.0.0.1"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(
            parse_client_ip("10.0.0.1:8080"),
            Some("10.0.0.1".parse().unwrap())
        );
        assert_eq!(parse_client_ip("[::1]"), Some("::1".parse().unwrap()));
        assert_eq!(parse_client_ip(""), None);
        assert_eq!(parse_client_ip("not-an-ip"), None);
    }

    #[test]
    fn forwarded_headers_ignored_unless_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", "203.0.113.9".parse().unwrap());
        let peer: SocketAddr = "192.0.2.1:443".parse().unwrap();

        assert_eq!(
            client_key_from_request(Some(peer), &headers, false),
            "192.0.2.1"
        );
        assert_eq!(
            client_key_from_request(Some(peer), &headers, true),
            "203.0.113.9"
        );
    }

    #[test]
    fn forwarded_takes_first_valid_candidate() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", "garbage, 198.51.100.7".parse().unwrap());
        assert_eq!(
            forwarded_client_ip(&headers),
            Some("198.51.100.7".parse().unwrap())
        );
    }

    #[test]
    fn missing_peer_falls_back_to_unknown() {
        let headers = HeaderMap::new();
        assert_eq!(client_key_from_request(None, &headers, true), "unknown");
    }

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_eq("hunter2", "hunter2"));
        assert!(!constant_time_eq("hunter2", "hunter3"));
        assert!(!constant_time_eq("hunter2", "hunter"));
        assert!(constant_time_eq("", ""));
    }
}
