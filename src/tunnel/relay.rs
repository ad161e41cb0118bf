//! Tunnel relay - the dashboard end of the agent tunnel.
//!
//! The relay:
//! 1. Redeems one-time bootstrap tokens at `POST /api/agent/register`
//! 2. Accepts agent streams at `GET /api/agent/connect` (bearer = permanent token)
//! 3. Correlates proxied `request`s with `response`s by id, with a timeout
//! 4. Pings every agent and evicts the ones that stop answering
//! 5. Maps `watch_event`s back to a subscription key and publishes them to
//!    the [`BroadcastSink`]

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::Message, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{
    AgentMessage, ApiRequest, ApiResponse, ClusterInfo, DashboardMessage, EventType,
    RegisterRequest, RegisterResponse, WatchEventMessage,
};
use crate::config::TunnelConfig;
use crate::hub::{BroadcastSink, HubEvent};
use crate::watch::{PathError, ResourcePath};

/// Capacity of the per-agent outbound queue.
const AGENT_QUEUE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid or already used bootstrap token")]
    InvalidBootstrapToken,
    #[error("cluster '{0}' is not connected")]
    NotConnected(String),
    #[error("agent connection lost")]
    AgentGone,
    #[error("agent did not respond within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Path(#[from] PathError),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidBootstrapToken => StatusCode::UNAUTHORIZED,
            Self::NotConnected(_) => StatusCode::NOT_FOUND,
            Self::AgentGone => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Path(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidBootstrapToken => "INVALID_BOOTSTRAP_TOKEN",
            Self::NotConnected(_) => "CLUSTER_NOT_CONNECTED",
            Self::AgentGone => "AGENT_DISCONNECTED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Path(_) => "INVALID_PATH",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({"error": self.to_string(), "code": self.code()})),
        )
            .into_response()
    }
}

// ─── Agent credentials ───────────────────────────────────────────────────────

/// A registered agent's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub cluster_id: String,
    pub cluster_name: String,
}

/// Issues and checks agent credentials.
pub trait CredentialStore: Send + Sync {
    /// Spend a bootstrap token and issue a permanent identity.
    fn redeem(&self, bootstrap_token: &str, cluster_name: &str)
        -> Result<RegisterResponse, RelayError>;

    /// Resolve a permanent token.
    fn authenticate(&self, token: &str) -> Option<AgentIdentity>;
}

/// In-memory store: bootstrap tokens come from config, issued tokens live
/// until the dashboard restarts.
pub struct MemoryCredentialStore {
    bootstrap: parking_lot::Mutex<HashSet<String>>,
    issued: parking_lot::RwLock<HashMap<String, AgentIdentity>>,
}

impl MemoryCredentialStore {
    pub fn new(bootstrap_tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            bootstrap: parking_lot::Mutex::new(bootstrap_tokens.into_iter().collect()),
            issued: parking_lot::RwLock::new(HashMap::new()),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn redeem(
        &self,
        bootstrap_token: &str,
        cluster_name: &str,
    ) -> Result<RegisterResponse, RelayError> {
        if !self.bootstrap.lock().remove(bootstrap_token) {
            return Err(RelayError::InvalidBootstrapToken);
        }
        let cluster_id = Uuid::new_v4().to_string();
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        self.issued.write().insert(
            token.clone(),
            AgentIdentity {
                cluster_id: cluster_id.clone(),
                cluster_name: cluster_name.to_string(),
            },
        );
        Ok(RegisterResponse { cluster_id, token })
    }

    fn authenticate(&self, token: &str) -> Option<AgentIdentity> {
        let issued = self.issued.read();
        issued
            .iter()
            .find(|(known, _)| crate::auth::constant_time_eq(known.as_bytes(), token.as_bytes()))
            .map(|(_, identity)| identity.clone())
    }
}

// ─── Relay state ─────────────────────────────────────────────────────────────

/// Where a dashboard-side watch subscription delivers its events.
#[derive(Debug, Clone)]
struct WatchRoute {
    resource: String,
    namespace: String,
}

/// An agent connected to the relay via its outbound tunnel.
pub struct ConnectedAgent {
    pub identity: AgentIdentity,
    /// Distinguishes this connection from a later one for the same cluster.
    connection_id: u64,
    agent_tx: mpsc::Sender<DashboardMessage>,
    /// Proxied requests awaiting responses, keyed by request id.
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ApiResponse>>>>,
    /// Active watch subscriptions, keyed by subscription id.
    watches: Arc<RwLock<HashMap<String, WatchRoute>>>,
    cluster_info: Arc<RwLock<Option<ClusterInfo>>>,
    /// Last pong as ms since relay epoch.
    last_pong_ms: Arc<AtomicU64>,
    connected_since: Instant,
    /// Signals the old handler to stop when the same cluster reconnects.
    shutdown_tx: watch::Sender<bool>,
}

/// Channels of one agent, cloned out of the registry so that no registry lock
/// is held while a send waits for space in the agent's queue.
struct AgentHandle {
    agent_tx: mpsc::Sender<DashboardMessage>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ApiResponse>>>>,
    watches: Arc<RwLock<HashMap<String, WatchRoute>>>,
}

/// Per-agent view for `GET /api/clusters`.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    pub cluster_id: String,
    pub cluster_name: String,
    pub connected_secs: u64,
    pub last_pong_ago_ms: u64,
    pub pending_requests: usize,
    pub watches: usize,
    pub info: Option<ClusterInfo>,
}

/// State shared across all relay handlers.
#[derive(Clone)]
pub struct RelayState {
    /// Connected agents keyed by cluster id.
    agents: Arc<RwLock<HashMap<String, ConnectedAgent>>>,
    credentials: Arc<dyn CredentialStore>,
    sink: Arc<dyn BroadcastSink>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    request_timeout: Duration,
    max_message_size: usize,
    /// Process epoch for lock-free heartbeat timestamps.
    epoch: Instant,
    next_connection_id: Arc<AtomicU64>,
}

impl RelayState {
    pub fn new(
        config: &TunnelConfig,
        credentials: Arc<dyn CredentialStore>,
        sink: Arc<dyn BroadcastSink>,
    ) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            credentials,
            sink,
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            max_message_size: config.max_message_size,
            epoch: Instant::now(),
            next_connection_id: Arc::new(AtomicU64::new(0)),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_connected(&self, cluster_id: &str) -> bool {
        self.agents.read().await.contains_key(cluster_id)
    }

    async fn handle(&self, cluster_id: &str) -> Result<AgentHandle, RelayError> {
        let agents = self.agents.read().await;
        let agent = agents
            .get(cluster_id)
            .ok_or_else(|| RelayError::NotConnected(cluster_id.to_string()))?;
        Ok(AgentHandle {
            agent_tx: agent.agent_tx.clone(),
            pending: Arc::clone(&agent.pending),
            watches: Arc::clone(&agent.watches),
        })
    }

    /// Send an API request to an agent and wait for its response.
    pub async fn request(
        &self,
        cluster_id: &str,
        method: &str,
        path: &str,
        headers: std::collections::BTreeMap<String, String>,
        body: Vec<u8>,
    ) -> Result<ApiResponse, RelayError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        let agent = self.handle(cluster_id).await?;
        agent.pending.lock().await.insert(request_id.clone(), tx);
        let msg = DashboardMessage::Request(ApiRequest {
            id: request_id.clone(),
            method: method.to_string(),
            path: path.to_string(),
            headers,
            body,
        });
        if agent.agent_tx.send(msg).await.is_err() {
            agent.pending.lock().await.remove(&request_id);
            return Err(RelayError::AgentGone);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RelayError::AgentGone),
            Err(_) => {
                agent.pending.lock().await.remove(&request_id);
                Err(RelayError::Timeout(self.request_timeout))
            }
        }
    }

    /// Ask an agent to start watching `path`. Events are published under
    /// `(cluster_id, resource, namespace)`. Returns the subscription id.
    pub async fn watch(
        &self,
        cluster_id: &str,
        path: &str,
        resource_version: Option<String>,
        resource: &str,
        namespace: &str,
    ) -> Result<String, RelayError> {
        ResourcePath::parse(path)?;
        let subscription_id = Uuid::new_v4().to_string();

        let agent = self.handle(cluster_id).await?;
        agent.watches.write().await.insert(
            subscription_id.clone(),
            WatchRoute {
                resource: resource.to_string(),
                namespace: namespace.to_string(),
            },
        );
        let msg = DashboardMessage::WatchSubscribe {
            subscription_id: subscription_id.clone(),
            path: path.to_string(),
            resource_version,
        };
        if agent.agent_tx.send(msg).await.is_err() {
            agent.watches.write().await.remove(&subscription_id);
            return Err(RelayError::AgentGone);
        }
        info!(cluster_id, subscription_id = %subscription_id, path, "Watch requested");
        Ok(subscription_id)
    }

    /// Stop a watch. Returns false if the subscription was unknown.
    pub async fn unwatch(&self, cluster_id: &str, subscription_id: &str) -> Result<bool, RelayError> {
        let agent = self.handle(cluster_id).await?;
        if agent.watches.write().await.remove(subscription_id).is_none() {
            return Ok(false);
        }
        agent
            .agent_tx
            .send(DashboardMessage::WatchUnsubscribe {
                subscription_id: subscription_id.to_string(),
            })
            .await
            .map_err(|_| RelayError::AgentGone)?;
        Ok(true)
    }

    pub async fn clusters(&self) -> Vec<ClusterSummary> {
        let now_ms = self.now_ms();
        let agents = self.agents.read().await;
        let mut list = Vec::with_capacity(agents.len());
        for agent in agents.values() {
            list.push(ClusterSummary {
                cluster_id: agent.identity.cluster_id.clone(),
                cluster_name: agent.identity.cluster_name.clone(),
                connected_secs: agent.connected_since.elapsed().as_secs(),
                last_pong_ago_ms: now_ms.saturating_sub(agent.last_pong_ms.load(Ordering::Relaxed)),
                pending_requests: agent.pending.lock().await.len(),
                watches: agent.watches.read().await.len(),
                info: agent.cluster_info.read().await.clone(),
            });
        }
        list.sort_by(|a, b| a.cluster_name.cmp(&b.cluster_name));
        list
    }

    /// Disconnect every agent (used during dashboard shutdown).
    pub async fn drain_all(&self) {
        let mut agents = self.agents.write().await;
        for (cluster_id, agent) in agents.drain() {
            let _ = agent.shutdown_tx.send(true);
            self.drain_agent(&agent, "dashboard shutting down").await;
            info!(cluster_id = %cluster_id, "Drained agent for shutdown");
        }
    }

    /// Fail everything in flight on an agent connection that is going away.
    ///
    /// Pending requests fail by dropping their oneshots. Each watch route ends
    /// with one `ERROR` event to its subscribers, the same as a watch the agent
    /// gave up on, so callers know to subscribe again.
    async fn drain_agent(&self, agent: &ConnectedAgent, reason: &str) {
        let cluster_id = &agent.identity.cluster_id;
        let count = {
            let mut pending = agent.pending.lock().await;
            let count = pending.len();
            pending.clear();
            count
        };
        if count > 0 {
            info!(cluster_id = %cluster_id, count, "Drained {count} pending requests: {reason}");
        }

        let routes: Vec<WatchRoute> = agent.watches.write().await.drain().map(|(_, r)| r).collect();
        if routes.is_empty() {
            return;
        }
        info!(cluster_id = %cluster_id, count = routes.len(), "Ending watches: {reason}");
        for route in routes {
            self.sink.publish(HubEvent {
                cluster: cluster_id.clone(),
                resource: route.resource,
                namespace: route.namespace,
                event_type: EventType::Error,
                object: json!({
                    "kind": "Status",
                    "apiVersion": "v1",
                    "status": "Failure",
                    "reason": "AgentDisconnected",
                    "message": format!("watch ended: {reason}"),
                }),
            });
        }
    }
}

/// Build the relay router with the agent-facing endpoints.
pub fn relay_router(relay_state: RelayState) -> Router {
    Router::new()
        .route("/api/agent/register", post(register_agent))
        .route("/api/agent/connect", get(agent_connect_ws))
        .with_state(relay_state)
}

// ─── Agent endpoints ─────────────────────────────────────────────────────────

/// `POST /api/agent/register` - trade a bootstrap token for a permanent identity.
async fn register_agent(
    State(state): State<RelayState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, RelayError> {
    match state
        .credentials
        .redeem(&request.token, &request.cluster_name)
    {
        Ok(response) => {
            info!(
                cluster_id = %response.cluster_id,
                cluster_name = %request.cluster_name,
                "Agent registered"
            );
            Ok(Json(response))
        }
        Err(e) => {
            warn!(cluster_name = %request.cluster_name, "Agent registration rejected: {e}");
            Err(e)
        }
    }
}

/// `GET /api/agent/connect` - agent tunnel stream.
async fn agent_connect_ws(
    State(state): State<RelayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(identity) =
        crate::auth::bearer_token(&headers).and_then(|t| state.credentials.authenticate(t))
    else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid agent token", "code": "UNAUTHORIZED"})),
        )
            .into_response();
    };

    let cluster_id = identity.cluster_id.clone();
    info!(cluster_id = %cluster_id, "Agent connecting...");
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| {
            let (sink, stream) = socket.split();
            serve_agent(stream, sink, state, identity)
                .instrument(info_span!("tunnel_agent", cluster_id = %cluster_id))
        })
}

/// Serve one agent stream until it closes, stops answering pings, or is
/// replaced by a newer connection for the same cluster.
pub async fn serve_agent<S, K, E>(mut stream: S, mut sink: K, state: RelayState, identity: AgentIdentity)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    K: Sink<Message> + Unpin + Send + 'static,
    K::Error: Display,
    E: Display,
{
    let cluster_id = identity.cluster_id.clone();
    let (agent_tx, mut agent_rx) = mpsc::channel::<DashboardMessage>(AGENT_QUEUE);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let connection_id = state.next_connection_id.fetch_add(1, Ordering::Relaxed);

    let agent = ConnectedAgent {
        identity,
        connection_id,
        agent_tx: agent_tx.clone(),
        pending: Arc::new(Mutex::new(HashMap::new())),
        watches: Arc::new(RwLock::new(HashMap::new())),
        cluster_info: Arc::new(RwLock::new(None)),
        last_pong_ms: Arc::new(AtomicU64::new(state.now_ms())),
        connected_since: Instant::now(),
        shutdown_tx,
    };
    let pending = Arc::clone(&agent.pending);
    let watches = Arc::clone(&agent.watches);
    let cluster_info = Arc::clone(&agent.cluster_info);
    let last_pong_ms = Arc::clone(&agent.last_pong_ms);

    // Same cluster reconnecting: stop the stale handler, then replace it.
    {
        let mut agents = state.agents.write().await;
        if let Some(old) = agents.insert(cluster_id.clone(), agent) {
            warn!(cluster_id = %cluster_id, "Agent reconnected while stale connection exists, evicting old");
            let _ = old.shutdown_tx.send(true);
            state.drain_agent(&old, "replaced by new connection").await;
        }
    }
    info!(cluster_id = %cluster_id, "Agent connected");

    // Forward agent_tx messages to the WS sink
    let send_task = tokio::spawn(async move {
        while let Some(msg) = agent_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode tunnel frame: {e}");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!("Agent write failed: {e}");
                break;
            }
        }
    });

    let mut heartbeat = tokio::time::interval(state.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let timeout_ms = u64::try_from(state.heartbeat_timeout.as_millis()).unwrap_or(u64::MAX);

    loop {
        let msg = tokio::select! {
            _ = shutdown_rx.changed() => {
                info!(cluster_id = %cluster_id, "Agent handler shutting down (replaced by new connection)");
                break;
            }
            _ = heartbeat.tick() => {
                let silent_ms = state.now_ms().saturating_sub(last_pong_ms.load(Ordering::Relaxed));
                if silent_ms > timeout_ms {
                    warn!(cluster_id = %cluster_id, silent_ms, "Evicting agent (heartbeat timeout)");
                    break;
                }
                if agent_tx.try_send(DashboardMessage::Ping).is_err() {
                    debug!(cluster_id = %cluster_id, "Agent queue full, skipping ping");
                }
                continue;
            }
            msg = stream.next() => match msg {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    debug!(cluster_id = %cluster_id, "Agent read error: {e}");
                    break;
                }
                None => break,
            },
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let parsed = match serde_json::from_str::<AgentMessage>(text.as_str()) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(cluster_id = %cluster_id, "Ignoring malformed agent frame: {e}");
                continue;
            }
        };

        match parsed {
            AgentMessage::Pong { .. } => {
                last_pong_ms.store(state.now_ms(), Ordering::Relaxed);
            }
            AgentMessage::Response(response) => {
                let sender = pending.lock().await.remove(&response.id);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(response);
                    }
                    None => warn!(
                        cluster_id = %cluster_id,
                        request_id = %response.id,
                        "Response arrived for timed-out or unknown request (dropped)"
                    ),
                }
            }
            AgentMessage::ClusterInfo(info) => {
                info!(
                    cluster_id = %cluster_id,
                    platform = %info.platform,
                    version = %info.version,
                    nodes = info.node_count,
                    "Cluster info received"
                );
                *cluster_info.write().await = Some(info);
            }
            AgentMessage::WatchEvent(event) => {
                route_watch_event(&state, &cluster_id, &watches, event).await;
            }
        }
    }

    // Remove our entry unless a newer connection already took the slot.
    {
        let mut agents = state.agents.write().await;
        if agents
            .get(&cluster_id)
            .is_some_and(|a| a.connection_id == connection_id)
        {
            if let Some(agent) = agents.remove(&cluster_id) {
                state.drain_agent(&agent, "agent disconnected").await;
            }
        }
    }
    info!(cluster_id = %cluster_id, "Agent disconnected");
    send_task.abort();
}

async fn route_watch_event(
    state: &RelayState,
    cluster_id: &str,
    watches: &RwLock<HashMap<String, WatchRoute>>,
    event: WatchEventMessage,
) {
    let route = if event.event_type == EventType::Error {
        // The agent gave up on this watch; forget it after delivering the error.
        let route = watches.write().await.remove(&event.subscription_id);
        warn!(
            cluster_id,
            subscription_id = %event.subscription_id,
            reason = %event.object.get("message").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            "Agent reported watch failure"
        );
        route
    } else {
        watches.read().await.get(&event.subscription_id).cloned()
    };
    let Some(route) = route else {
        debug!(
            cluster_id,
            subscription_id = %event.subscription_id,
            event_type = event.event_type.as_str(),
            "Dropping event for unknown subscription"
        );
        return;
    };
    state.sink.publish(HubEvent {
        cluster: cluster_id.to_string(),
        resource: route.resource,
        namespace: route.namespace,
        event_type: event.event_type,
        object: event.object,
    });
}

/// In-memory agent connections for tests across the crate.
#[cfg(test)]
pub(crate) mod test_agent {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use std::convert::Infallible;

    /// The agent side of an in-memory tunnel stream.
    pub(crate) struct FakeAgent {
        to_relay: fmpsc::UnboundedSender<Result<Message, Infallible>>,
        from_relay: fmpsc::UnboundedReceiver<Message>,
    }

    impl FakeAgent {
        pub(crate) fn send(&self, msg: &AgentMessage) {
            let text = serde_json::to_string(msg).unwrap();
            self.to_relay
                .unbounded_send(Ok(Message::Text(text.into())))
                .unwrap();
        }

        /// Next non-ping frame from the relay.
        pub(crate) async fn recv(&mut self) -> DashboardMessage {
            loop {
                let Some(Message::Text(text)) = self.from_relay.next().await else {
                    panic!("relay closed the stream");
                };
                let msg: DashboardMessage = serde_json::from_str(text.as_str()).unwrap();
                if msg != DashboardMessage::Ping {
                    return msg;
                }
            }
        }
    }

    fn identity(cluster_id: &str) -> AgentIdentity {
        AgentIdentity {
            cluster_id: cluster_id.into(),
            cluster_name: format!("{cluster_id}-name"),
        }
    }

    /// Serve a fake agent for `cluster_id` and wait until it's registered.
    pub(crate) async fn connect(
        state: &RelayState,
        cluster_id: &str,
    ) -> (FakeAgent, tokio::task::JoinHandle<()>) {
        let (to_relay, inbound) = fmpsc::unbounded();
        let (outbound, from_relay) = fmpsc::unbounded();
        let handle = tokio::spawn(serve_agent(
            inbound,
            outbound,
            state.clone(),
            identity(cluster_id),
        ));
        while !state.is_connected(cluster_id).await {
            tokio::task::yield_now().await;
        }
        (FakeAgent { to_relay, from_relay }, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::test_agent::connect;
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        events: parking_lot::Mutex<Vec<HubEvent>>,
    }

    impl BroadcastSink for RecordingSink {
        fn publish(&self, event: HubEvent) {
            self.events.lock().push(event);
        }
    }

    fn tunnel_config() -> TunnelConfig {
        TunnelConfig {
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            request_timeout_secs: 5,
            ..TunnelConfig::default()
        }
    }

    fn relay() -> (RelayState, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(MemoryCredentialStore::new(["boot".to_string()]));
        (
            RelayState::new(&tunnel_config(), store, Arc::clone(&sink) as Arc<dyn BroadcastSink>),
            sink,
        )
    }

    #[test]
    fn test_bootstrap_token_is_single_use() {
        let store = MemoryCredentialStore::new(["boot".to_string()]);
        let issued = store.redeem("boot", "prod").unwrap();
        assert!(matches!(
            store.redeem("boot", "prod"),
            Err(RelayError::InvalidBootstrapToken)
        ));
        let identity = store.authenticate(&issued.token).unwrap();
        assert_eq!(identity.cluster_id, issued.cluster_id);
        assert_eq!(identity.cluster_name, "prod");
        assert!(store.authenticate("forged").is_none());
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let (state, _) = relay();
        let (mut agent, _handle) = connect(&state, "c1").await;

        let requester = {
            let state = state.clone();
            tokio::spawn(async move {
                state
                    .request("c1", "GET", "/api/v1/namespaces", Default::default(), Vec::new())
                    .await
            })
        };

        let DashboardMessage::Request(req) = agent.recv().await else {
            panic!("expected request");
        };
        assert_eq!(req.path, "/api/v1/namespaces");
        agent.send(&AgentMessage::Response(ApiResponse {
            id: req.id,
            status: 200,
            headers: Default::default(),
            body: b"{}".to_vec(),
        }));

        let response = requester.await.unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"{}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_and_unknown_cluster_fails() {
        let (state, _) = relay();
        assert!(matches!(
            state.request("nope", "GET", "/", Default::default(), Vec::new()).await,
            Err(RelayError::NotConnected(_))
        ));

        let (_agent, _handle) = connect(&state, "c1").await;
        let res = state
            .request("c1", "GET", "/version", Default::default(), Vec::new())
            .await;
        assert!(matches!(res, Err(RelayError::Timeout(_))));
        assert_eq!(state.clusters().await[0].pending_requests, 0);
    }

    #[tokio::test]
    async fn test_watch_events_are_published_under_route_key() {
        let (state, sink) = relay();
        let (mut agent, _handle) = connect(&state, "c1").await;

        let id = state
            .watch("c1", "/api/v1/namespaces/default/pods", None, "pods", "default")
            .await
            .unwrap();
        let DashboardMessage::WatchSubscribe { subscription_id, path, .. } = agent.recv().await
        else {
            panic!("expected watch_subscribe");
        };
        assert_eq!(subscription_id, id);
        assert_eq!(path, "/api/v1/namespaces/default/pods");

        // Frames are handled in order, so the unknown one is settled first.
        agent.send(&AgentMessage::WatchEvent(WatchEventMessage {
            subscription_id: "unknown".into(),
            event_type: EventType::Added,
            object: json!({}),
        }));
        agent.send(&AgentMessage::WatchEvent(WatchEventMessage {
            subscription_id: id.clone(),
            event_type: EventType::Added,
            object: json!({"metadata": {"name": "web-0"}}),
        }));
        while sink.events.lock().is_empty() {
            tokio::task::yield_now().await;
        }

        let events = sink.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cluster, "c1");
        assert_eq!(events[0].resource, "pods");
        assert_eq!(events[0].namespace, "default");
        assert_eq!(events[0].event_type, EventType::Added);
    }

    #[tokio::test]
    async fn test_error_event_is_forwarded_then_subscription_forgotten() {
        let (state, sink) = relay();
        let (mut agent, _handle) = connect(&state, "c1").await;
        let id = state
            .watch("c1", "/apis/apps/v1/deployments", None, "deployments", "")
            .await
            .unwrap();
        let _ = agent.recv().await;

        agent.send(&AgentMessage::WatchEvent(WatchEventMessage {
            subscription_id: id.clone(),
            event_type: EventType::Error,
            object: json!({"kind": "Status", "message": "forbidden"}),
        }));
        while sink.events.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.events.lock()[0].event_type, EventType::Error);
        assert!(!state.unwatch("c1", &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_watch_rejects_bad_path() {
        let (state, _) = relay();
        let (_agent, _handle) = connect(&state, "c1").await;
        assert!(matches!(
            state.watch("c1", "/healthz", None, "x", "").await,
            Err(RelayError::Path(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_agent_is_evicted() {
        let (state, _) = relay();
        let (_agent, handle) = connect(&state, "c1").await;
        // Never answers pings: gone after the 90s timeout is observed on a tick.
        handle.await.unwrap();
        assert!(!state.is_connected("c1").await);
    }

    #[tokio::test]
    async fn test_reconnect_ends_watches_of_replaced_connection() {
        let (state, sink) = relay();
        let (mut old, old_handle) = connect(&state, "c1").await;
        state
            .watch("c1", "/api/v1/namespaces/default/pods", None, "pods", "default")
            .await
            .unwrap();
        let _ = old.recv().await;

        let (_new, _new_handle) = connect(&state, "c1").await;
        old_handle.await.unwrap();
        while sink.events.lock().is_empty() {
            tokio::task::yield_now().await;
        }

        let events = sink.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Error);
        assert_eq!(events[0].resource, "pods");
        assert_eq!(events[0].namespace, "default");
        assert_eq!(events[0].object["reason"], "AgentDisconnected");
        assert_eq!(state.clusters().await[0].watches, 0);
    }

    #[tokio::test]
    async fn test_disconnect_ends_watches() {
        let (state, sink) = relay();
        let (mut agent, handle) = connect(&state, "c1").await;
        state
            .watch("c1", "/apis/apps/v1/deployments", None, "deployments", "")
            .await
            .unwrap();
        let _ = agent.recv().await;

        drop(agent);
        handle.await.unwrap();

        assert!(!state.is_connected("c1").await);
        let events = sink.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Error);
        assert_eq!(events[0].resource, "deployments");
    }

    #[tokio::test]
    async fn test_full_agent_queue_does_not_block_other_clusters() {
        let (state, _) = relay();

        // An agent whose socket never accepts a frame: its queue fills up.
        let (_inbound_tx, inbound) =
            futures::channel::mpsc::unbounded::<Result<Message, std::convert::Infallible>>();
        let (outbound, _never_read) = futures::channel::mpsc::channel::<Message>(0);
        let identity = AgentIdentity {
            cluster_id: "stuck".into(),
            cluster_name: "stuck".into(),
        };
        tokio::spawn(serve_agent(inbound, outbound, state.clone(), identity));
        while !state.is_connected("stuck").await {
            tokio::task::yield_now().await;
        }

        let (mut ok, _ok_handle) = connect(&state, "ok").await;

        let parked = AGENT_QUEUE + 8;
        for _ in 0..parked {
            let state = state.clone();
            tokio::spawn(async move {
                let _ = state
                    .request("stuck", "GET", "/version", Default::default(), Vec::new())
                    .await;
            });
        }
        while state
            .clusters()
            .await
            .iter()
            .find(|c| c.cluster_id == "stuck")
            .map_or(0, |c| c.pending_requests)
            < parked
        {
            tokio::task::yield_now().await;
        }

        // Registry writes and other clusters' requests still go through.
        let (_late, _late_handle) = connect(&state, "late").await;
        let requester = {
            let state = state.clone();
            tokio::spawn(async move {
                state
                    .request("ok", "GET", "/version", Default::default(), Vec::new())
                    .await
            })
        };
        let DashboardMessage::Request(req) = ok.recv().await else {
            panic!("expected request");
        };
        ok.send(&AgentMessage::Response(ApiResponse {
            id: req.id,
            status: 200,
            headers: Default::default(),
            body: Vec::new(),
        }));
        assert_eq!(requester.await.unwrap().unwrap().status, 200);
        assert_eq!(state.agent_count().await, 3);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_stale_connection() {
        let (state, _) = relay();
        let (_old, old_handle) = connect(&state, "c1").await;
        let (mut new, _new_handle) = connect(&state, "c1").await;

        old_handle.await.unwrap();
        assert!(state.is_connected("c1").await);
        assert_eq!(state.agent_count().await, 1);

        // The surviving connection still serves requests.
        let requester = {
            let state = state.clone();
            tokio::spawn(async move {
                state
                    .request("c1", "GET", "/version", Default::default(), Vec::new())
                    .await
            })
        };
        let DashboardMessage::Request(req) = new.recv().await else {
            panic!("expected request");
        };
        new.send(&AgentMessage::Response(ApiResponse::error(req.id, 500, "boom")));
        assert_eq!(requester.await.unwrap().unwrap().status, 500);
    }
}
