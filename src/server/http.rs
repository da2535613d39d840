//! HTTP surface
//!
//! ```text
//! POST   /mcp      JSON-RPC; `initialize` issues an Mcp-Session-Id
//! DELETE /mcp      drop the session named by Mcp-Session-Id
//! GET    /healthz  process liveness
//! GET    /readyz   cluster API reachable
//! GET    /metrics  Prometheus text format
//! GET    /version
//! ```

use super::ServerState;
use crate::protocol::Session;
use crate::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SESSION_HEADER: &str = "mcp-session-id";

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/mcp", post(mcp).delete(close_session))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/version", get(version))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: ServerState, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP listening on {}", listener.local_addr()?);

    let sessions = state.sessions.clone();
    let sweeper_stop = shutdown.clone();
    tokio::spawn(async move {
        let period = (sessions.ttl() / 4).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = sweeper_stop.cancelled() => break,
                _ = interval.tick() => {
                    sessions.cleanup();
                }
            }
        }
    });

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

async fn mcp(State(state): State<ServerState>, headers: HeaderMap, body: Bytes) -> Response {
    // Dropped along with this future when the client goes away
    let cancel = CancellationToken::new();
    let _on_disconnect = cancel.clone().drop_guard();

    let (known_id, mut session) = match session_id(&headers)
        .and_then(|id| state.sessions.get(&id).map(|s| (id, s)))
    {
        Some((id, session)) => (Some(id), session),
        None => (None, Session::new()),
    };

    let response = state
        .dispatcher
        .handle_raw(&mut session, &body, &cancel)
        .await;

    let issued = match known_id {
        Some(id) => {
            state.sessions.insert(id, session);
            None
        }
        None if session.is_initialized() => {
            let id = Uuid::new_v4().to_string();
            debug!("issued session {}", id);
            state.sessions.insert(id.clone(), session);
            Some(id)
        }
        None => None,
    };

    let Some(response) = response else {
        return StatusCode::ACCEPTED.into_response();
    };

    let mut reply = Json(response).into_response();
    if let Some(id) = issued {
        match HeaderValue::from_str(&id) {
            Ok(value) => {
                reply.headers_mut().insert(SESSION_HEADER, value);
            }
            Err(e) => warn!("session id {} is not a valid header: {}", id, e),
        }
    }
    reply
}

async fn close_session(State(state): State<ServerState>, headers: HeaderMap) -> StatusCode {
    match session_id(&headers) {
        Some(id) if state.sessions.remove(&id) => {
            debug!("closed session {}", id);
            StatusCode::NO_CONTENT
        }
        _ => StatusCode::NOT_FOUND,
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ServerState>) -> Response {
    match state.aggregator.directory().snapshot().await {
        Ok(targets) => {
            let ready = targets.iter().filter(|t| t.ready).count();
            Json(json!({
                "ready": true,
                "agents": targets.len(),
                "ready_agents": ready,
            }))
            .into_response()
        }
        Err(e) => {
            warn!("readiness check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "ready": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn metrics(State(state): State<ServerState>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn version(State(state): State<ServerState>) -> Json<serde_json::Value> {
    Json(json!({
        "name": "orb8-gateway",
        "version": crate::VERSION,
        "transport": state.aggregator.transport_name(),
    }))
}
