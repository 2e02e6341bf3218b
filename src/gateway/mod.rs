//! Axum-based HTTP and WebSocket gateway.
//!
//! - `GET /`           health check
//! - `POST /verify`    check a token against an application secret
//! - `GET /createApp`  register an application (rate limited per client IP)
//! - `GET /ws`         realtime channel; see [`ws`] for the frame protocol
//!
//! Request bodies are capped at 64KB and requests time out after 30s.

pub mod hub;
pub mod limit;
pub mod ws;

pub use limit::CreateAppLimiter;

use crate::engine::{SignalHandle, SigningPolicy};
use crate::registry::ApplicationRegistry;
use crate::token;
use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use hub::ClientHub;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Client address for a request. Forwarded headers are only consulted when the
/// gateway sits behind a trusted proxy; otherwise the socket peer is used.
fn client_ip(peer: SocketAddr, headers: &HeaderMap, trust_forwarded_headers: bool) -> IpAddr {
    if trust_forwarded_headers {
        if let Some(ip) = forwarded_ip(headers) {
            return ip;
        }
    }
    peer.ip()
}

/// First parseable hop of `X-Forwarded-For`, then `X-Real-IP`.
fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    header("x-forwarded-for")
        .into_iter()
        .flat_map(|v| v.split(','))
        .chain(header("x-real-ip"))
        .find_map(parse_hop)
}

/// A bare address, or `addr:port` / `[v6]:port` as some proxies send it.
fn parse_hop(hop: &str) -> Option<IpAddr> {
    let hop = hop.trim();
    hop.parse::<IpAddr>()
        .ok()
        .or_else(|| hop.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    /// Connected realtime clients, keyed by correlation id
    pub hub: Arc<ClientHub>,
    /// Raises the engine's pending flag
    pub signal: SignalHandle,
    pub policy: Arc<SigningPolicy>,
    pub registry: Arc<dyn ApplicationRegistry>,
    pub trust_forwarded_headers: bool,
    pub create_app_limiter: Arc<CreateAppLimiter>,
}

/// Router with every route and the body-limit/timeout layers applied.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route("/verify", post(handle_verify))
        .route("/createApp", get(handle_create_app))
        .route("/ws", get(ws::handle_ws))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Serve on an already-bound listener until the server stops.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> Result<()> {
    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Gateway server stopped")
}

/// Bind `host:port` and serve.
pub async fn run_gateway(host: &str, port: u16, state: AppState) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid gateway address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind gateway on {addr}"))?;
    let actual = listener.local_addr()?;

    tracing::info!(addr = %actual, mode = state.policy.mode().as_str(), "Gateway listening");
    println!("cdp-auth gateway listening on http://{actual}");
    println!("  GET  /           health check");
    println!("  POST /verify     {{\"token\": \"...\", \"apiSecret\": \"...\"}}");
    println!("  GET  /createApp  register an application");
    println!("  GET  /ws         realtime channel");
    println!("  Press Ctrl+C to stop.\n");

    serve(listener, state).await
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /
async fn handle_index() -> impl IntoResponse {
    Json(serde_json::json!({ "success": true }))
}

#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    pub token: String,
    #[serde(rename = "apiSecret", default)]
    pub api_secret: Option<String>,
}

/// POST /verify
async fn handle_verify(
    State(state): State<AppState>,
    Json(body): Json<VerifyBody>,
) -> impl IntoResponse {
    let Some(secret) = state.policy.verification_secret(body.api_secret.as_deref()) else {
        let err = serde_json::json!({ "valid": false, "error": "apiSecret required" });
        return (StatusCode::BAD_REQUEST, Json(err));
    };

    match token::verify(&body.token, &secret) {
        Ok(claims) => (
            StatusCode::OK,
            Json(serde_json::json!({ "valid": true, "data": claims })),
        ),
        Err(e) => {
            tracing::debug!(kind = e.kind(), "Token verification failed");
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "valid": false,
                    "error": e.to_string(),
                    "kind": e.kind(),
                })),
            )
        }
    }
}

/// GET /createApp
async fn handle_create_app(
    State(state): State<AppState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let ip = client_ip(peer_addr, &headers, state.trust_forwarded_headers);
    if let Err(wait) = state.create_app_limiter.check(ip, Instant::now()) {
        let retry_after = limit::retry_after_secs(wait);
        tracing::warn!(%ip, retry_after, "/createApp refused: registration quota used");
        let err = serde_json::json!({
            "error": "Too many registration requests. Please retry later.",
            "retry_after": retry_after,
        });
        return (StatusCode::TOO_MANY_REQUESTS, Json(err));
    }

    let client_ip = ip.to_string();
    match state.registry.create(&client_ip).await {
        Ok(credentials) => (StatusCode::OK, Json(serde_json::json!(credentials))),
        Err(e) => {
            tracing::error!(ip = %client_ip, "Failed to register application: {e:#}");
            let err = serde_json::json!({ "error": "Could not create application" });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(err))
        }
    }
}
