//! Start and stop agent watches whose events feed the subscriber hub.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::auth::Principal;
use crate::tunnel::relay::RelayError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct StartWatch {
    /// Collection path on the cluster, e.g. `/api/v1/namespaces/default/pods`.
    pub path: String,
    pub resource_version: Option<String>,
    /// Subscription key fields browsers subscribe with.
    pub resource: String,
    #[serde(default)]
    pub namespace: String,
}

/// `POST /api/clusters/{cluster}/watches` - returns `201 {subscription_id}`.
pub async fn start_watch(
    State(state): State<AppState>,
    Extension(Principal(principal)): Extension<Principal>,
    Path(cluster): Path<String>,
    Json(req): Json<StartWatch>,
) -> Result<Response, RelayError> {
    let subscription_id = state
        .relay
        .watch(
            &cluster,
            &req.path,
            req.resource_version,
            &req.resource,
            &req.namespace,
        )
        .await?;
    info!(%principal, %cluster, %subscription_id, resource = %req.resource, "Watch started");
    Ok((
        StatusCode::CREATED,
        Json(json!({"subscription_id": subscription_id})),
    )
        .into_response())
}

/// `DELETE /api/clusters/{cluster}/watches/{id}`
pub async fn stop_watch(
    State(state): State<AppState>,
    Extension(Principal(principal)): Extension<Principal>,
    Path((cluster, id)): Path<(String, String)>,
) -> Result<Response, RelayError> {
    if state.relay.unwatch(&cluster, &id).await? {
        info!(%principal, %cluster, subscription_id = %id, "Watch stopped");
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Ok((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Watch '{id}' not found"), "code": "WATCH_NOT_FOUND"})),
        )
            .into_response())
    }
}
