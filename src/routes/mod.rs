//! HTTP route handlers and the dashboard router.
//!
//! Each sub-module corresponds to an API endpoint group. All handlers except
//! [`health`] require a browser bearer token via the
//! [`crate::auth::require_token`] middleware. The browser WebSocket checks its
//! own token at upgrade, and agent endpoints authenticate with agent
//! credentials inside the relay.

pub mod clusters;
pub mod health;
pub mod watches;

use axum::{
    middleware,
    routing::{any, delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::hub::session::ws_upgrade;
use crate::tunnel::relay::relay_router;
use crate::{auth, AppState};

/// Build the full dashboard router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let authed_routes = Router::new()
        .route("/api/clusters", get(clusters::list_clusters))
        .route("/api/clusters/{cluster}/k8s/{*path}", any(clusters::proxy))
        .route(
            "/api/clusters/{cluster}/watches",
            post(watches::start_watch),
        )
        .route(
            "/api/clusters/{cluster}/watches/{id}",
            delete(watches::stop_watch),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ));

    let ws_route = Router::new()
        .route("/api/ws", get(ws_upgrade))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_ws_token,
        ));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_route)
        .with_state(state.clone())
        .merge(relay_router(state.relay))
        .layer(TraceLayer::new_for_http())
}
