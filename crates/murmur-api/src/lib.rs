//! Murmur API -- local node HTTP admin surface.
//!
//! HTTP on 127.0.0.1, bearer token auth. Read-only views of the gossip state
//! plus the administrative removal verbs (assassinate / force-remove).

use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};
use murmur_gossip::{GossipStatus, Gossiper, StatsSnapshot};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

/// Shared state for all API handlers.
pub struct AppState {
    pub gossiper: Arc<Gossiper>,
    pub bearer_token: String,
    pub start_time: std::time::Instant,
    pub cluster_name: String,
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/status", post(status))
        .route("/api/v1/endpoints", post(endpoints))
        .route("/api/v1/assassinate", post(assassinate))
        .route("/api/v1/remove", post(remove))
        .with_state(state)
}

// ============================================================================
// Auth (inline check)
// ============================================================================

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, &'static str)> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let expected = format!("Bearer {}", state.bearer_token);
    if auth != expected {
        return Err((StatusCode::UNAUTHORIZED, "invalid bearer token"));
    }
    Ok(())
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Serialize)]
pub struct StatusResponse {
    pub local_endpoint: SocketAddr,
    pub cluster_name: String,
    pub status: GossipStatus,
    pub uptime_secs: u64,
    pub endpoints: usize,
    pub live: usize,
    pub unreachable: usize,
    pub stats: StatsSnapshot,
}

#[derive(Serialize)]
pub struct EndpointDetail {
    pub endpoint: SocketAddr,
    pub generation: i32,
    pub max_version: i32,
    pub alive: bool,
    pub status: Option<String>,
    pub silent_secs: u64,
}

#[derive(Serialize)]
pub struct EndpointsResponse {
    pub endpoints: Vec<EndpointDetail>,
    pub live: Vec<SocketAddr>,
    pub unreachable: Vec<SocketAddr>,
}

#[derive(Deserialize)]
pub struct RemoveRequest {
    pub endpoint: SocketAddr,
}

#[derive(Serialize)]
pub struct RemoveResponse {
    pub removed: SocketAddr,
}

// ============================================================================
// Handlers
// ============================================================================

async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let g = &state.gossiper;
    let resp = StatusResponse {
        local_endpoint: g.local_addr(),
        cluster_name: state.cluster_name.clone(),
        status: g.status(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        endpoints: g.store().endpoint_count().await,
        live: g.store().live_snapshot().await.len(),
        unreachable: g.store().unreachable_snapshot().await.len(),
        stats: g.stats(),
    };
    Json(resp).into_response()
}

async fn endpoints(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let g = &state.gossiper;
    let snapshot = g.store().snapshot().await;
    let mut details: Vec<EndpointDetail> = snapshot
        .iter()
        .map(|(addr, rec)| EndpointDetail {
            endpoint: *addr,
            generation: rec.state.generation(),
            max_version: rec.state.max_version(),
            alive: rec.alive,
            status: rec.state.status().map(|s| s.to_string()),
            silent_secs: rec.update_ts.elapsed().as_secs(),
        })
        .collect();
    details.sort_by_key(|d| d.endpoint);

    let resp = EndpointsResponse {
        endpoints: details,
        live: g.store().live_snapshot().await,
        unreachable: g
            .store()
            .unreachable_snapshot()
            .await
            .into_iter()
            .map(|(a, _)| a)
            .collect(),
    };
    Json(resp).into_response()
}

async fn assassinate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RemoveRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    tracing::warn!(endpoint = %req.endpoint, "api: assassinate requested");
    match state.gossiper.assassinate_endpoint(req.endpoint).await {
        Ok(()) => Json(RemoveResponse {
            removed: req.endpoint,
        })
        .into_response(),
        Err(e) => (StatusCode::CONFLICT, e.to_string()).into_response(),
    }
}

async fn remove(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RemoveRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    tracing::warn!(endpoint = %req.endpoint, "api: force-remove requested");
    match state.gossiper.force_remove_endpoint(req.endpoint).await {
        Ok(()) => Json(RemoveResponse {
            removed: req.endpoint,
        })
        .into_response(),
        Err(e) => (StatusCode::CONFLICT, e.to_string()).into_response(),
    }
}
