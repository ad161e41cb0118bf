//! Connected clusters and Kubernetes API passthrough.

use std::collections::BTreeMap;

use axum::{
    body::{Body, Bytes},
    extract::{Path, RawQuery, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::debug;

use crate::tunnel::relay::{ClusterSummary, RelayError};
use crate::AppState;

/// Browser headers that must not travel through the tunnel.
const PRIVATE_HEADERS: &[&str] = &["authorization", "cookie", "host"];

/// `GET /api/clusters` - connected agents with their last cluster info.
pub async fn list_clusters(State(state): State<AppState>) -> Json<Vec<ClusterSummary>> {
    Json(state.relay.clusters().await)
}

/// `ANY /api/clusters/{cluster}/k8s/{*path}` - forward one API request to
/// the cluster's agent and relay its answer.
///
/// # Error responses
///
/// - `404 Not Found` - cluster not connected
/// - `502 Bad Gateway` - agent disconnected before answering
/// - `504 Gateway Timeout` - agent did not answer in time
pub async fn proxy(
    State(state): State<AppState>,
    Path((cluster, path)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RelayError> {
    let mut target = format!("/{}", path.trim_start_matches('/'));
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(&query);
    }

    let forwarded: BTreeMap<String, String> = headers
        .iter()
        .filter(|(name, _)| !PRIVATE_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
        .collect();

    let api_response = state
        .relay
        .request(&cluster, method.as_str(), &target, forwarded, body.to_vec())
        .await?;
    debug!(cluster = %cluster, %method, path = %target, status = api_response.status, "Passthrough complete");

    let status = StatusCode::from_u16(api_response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = (status, Body::from(api_response.body)).into_response();
    let out = response.headers_mut();
    for (name, value) in &api_response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            out.insert(name, value);
        }
    }
    Ok(response)
}
