//! Unauthenticated health-check endpoints for both roles.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::state::TunnelStats;
use crate::AppState;

/// `GET /api/health` - liveness probe.
///
/// Returns status, uptime, version, connected agent count and browser session
/// stats. No authentication required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let agents = state.relay.agent_count().await;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "agents": agents,
        "sessions": state.hub.session_count(),
        "dropped_events": state.hub.dropped(),
    }))
}

/// Router for the agent's optional health listener.
pub fn agent_router(stats: Arc<TunnelStats>) -> Router {
    Router::new()
        .route("/api/health", get(agent_health))
        .with_state(stats)
}

/// `GET /api/health` on the agent - tunnel state, counters and the most
/// recent connection events.
pub async fn agent_health(State(stats): State<Arc<TunnelStats>>) -> Json<Value> {
    let now = Instant::now();
    let recent_events: Vec<Value> = stats
        .recent_events()
        .await
        .iter()
        .rev()
        .take(10)
        .map(|e| {
            let ago = now.duration_since(e.timestamp).as_secs();
            let ago = if ago < 60 {
                format!("{ago}s ago")
            } else if ago < 3600 {
                format!("{}m ago", ago / 60)
            } else {
                format!("{}h ago", ago / 3600)
            };
            let mut event = json!({
                "time": ago,
                "event": e.event_type.as_str(),
                "detail": e.detail,
            });
            if let Some(delay) = e.delay {
                event["delay_ms"] = json!(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
            }
            event
        })
        .collect();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": stats.epoch.elapsed().as_secs(),
        "tunnel": {
            "state": stats.state().as_str(),
            "reconnects": stats.reconnects.load(Ordering::Relaxed),
            "messages_sent": stats.messages_sent.load(Ordering::Relaxed),
            "messages_received": stats.messages_received.load(Ordering::Relaxed),
            "recent_events": recent_events,
        },
    }))
}
