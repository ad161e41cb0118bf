//! Tunnel client - outbound connection from a cluster agent to the dashboard.
//!
//! Lifecycle:
//!
//! ```text
//! Disconnected → Dialing → (Registering →) Streaming → Disconnected → Backoff → Dialing …
//!                                                                     ↓
//!                                                                 Cancelled
//! ```
//!
//! The first dial and the one-time registration are fatal when they fail.
//! After the first stream has been opened every failure is recovered by
//! waiting `backoff(attempt)` and re-dialing; `attempt` is reset whenever a
//! stream opens. Cancellation is the only clean way out of [`TunnelClient::run`].
//!
//! Per open stream there is one reader (this task), one writer task, one task
//! per inbound request and one task per active watch.

use std::convert::Infallible;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::credentials::Credentials;
use super::transport::{Connection, Dialer, MessageSink, RegistrationError, TransportError};
use super::{AgentMessage, ApiRequest, ApiResponse, ClusterInfo, DashboardMessage, RegisterRequest};
use crate::backoff::Backoff;
use crate::state::{ConnectionState, TunnelEventType, TunnelStats};
use crate::watch::{WatchManager, WatchSource};

/// Capacity of the pong lane. Pongs are tiny and answered immediately.
const CONTROL_QUEUE: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("dial failed: {0}")]
    Dial(#[source] TransportError),
    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),
    #[error("tunnel cancelled")]
    Cancelled,
}

/// Serves proxied API requests.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Always produces a response; failures become error statuses.
    async fn handle(&self, request: ApiRequest) -> ApiResponse;
}

/// Describes the local cluster, sent once per stream.
#[async_trait]
pub trait ClusterInfoProvider: Send + Sync {
    /// `None` when the cluster could not be described; nothing is sent then.
    async fn cluster_info(&self) -> Option<ClusterInfo>;
}

/// How a stream session ended, when it wasn't cancelled.
enum StreamOutcome {
    /// `open_stream` itself failed.
    OpenFailed(TransportError),
    /// The stream was open and then broke.
    Lost(String),
}

/// The agent end of the tunnel.
pub struct TunnelClient<D: Dialer> {
    dialer: D,
    cluster_name: String,
    credentials: Credentials,
    credentials_file: Option<PathBuf>,
    handler: Arc<dyn RequestHandler>,
    watch_source: Arc<dyn WatchSource>,
    cluster_info: Option<Arc<dyn ClusterInfoProvider>>,
    backoff: Backoff,
    outbound_queue: usize,
    request_limit: Arc<Semaphore>,
    stats: Arc<TunnelStats>,
}

impl<D: Dialer> TunnelClient<D> {
    pub fn new(
        dialer: D,
        credentials: Credentials,
        handler: Arc<dyn RequestHandler>,
        watch_source: Arc<dyn WatchSource>,
    ) -> Self {
        Self {
            dialer,
            cluster_name: "default".to_string(),
            credentials,
            credentials_file: None,
            handler,
            watch_source,
            cluster_info: None,
            backoff: Backoff::default(),
            outbound_queue: 256,
            request_limit: Arc::new(Semaphore::new(64)),
            stats: Arc::new(TunnelStats::new()),
        }
    }

    #[must_use]
    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_credentials_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_cluster_info(mut self, provider: Arc<dyn ClusterInfoProvider>) -> Self {
        self.cluster_info = Some(provider);
        self
    }

    #[must_use]
    pub fn with_outbound_queue(mut self, capacity: usize) -> Self {
        self.outbound_queue = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_request_concurrency(mut self, limit: usize) -> Self {
        self.request_limit = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    /// Handle for observing the client while it runs.
    pub fn stats(&self) -> Arc<TunnelStats> {
        Arc::clone(&self.stats)
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Run until cancelled or until the first dial or registration fails.
    /// `Err(TunnelError::Cancelled)` is the normal exit.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<Infallible, TunnelError> {
        let result = self.run_inner(&cancel).await;
        let final_state = if matches!(result, Err(TunnelError::Cancelled)) {
            ConnectionState::Cancelled
        } else {
            ConnectionState::Disconnected
        };
        self.stats.set_state(final_state);
        result
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> Result<Infallible, TunnelError> {
        self.stats.set_state(ConnectionState::Dialing);
        let mut conn = cancellable(cancel, self.dialer.dial())
            .await?
            .map_err(TunnelError::Dial)?;
        let token = self.ensure_registered(&mut conn, cancel).await?;

        let mut conn = Some(conn);
        let mut attempt: u32 = 0;
        loop {
            if let Some(mut current) = conn.take() {
                match self.stream_session(&mut current, &token, cancel).await? {
                    StreamOutcome::Lost(reason) => {
                        attempt = 0;
                        warn!("Tunnel: stream lost: {reason}");
                        self.stats
                            .push_event(TunnelEventType::Disconnected, reason)
                            .await;
                    }
                    StreamOutcome::OpenFailed(e) => {
                        warn!("Tunnel: failed to open stream: {e}");
                        self.stats
                            .push_event(TunnelEventType::StreamOpenFailed, e.to_string())
                            .await;
                    }
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self.backoff.delay(attempt);
            self.stats.set_state(ConnectionState::Backoff);
            self.stats.push_backoff(attempt, delay).await;
            info!(attempt, ?delay, "Tunnel: reconnecting after backoff");
            cancellable(cancel, tokio::time::sleep(delay)).await?;

            self.stats.set_state(ConnectionState::Dialing);
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            match cancellable(cancel, self.dialer.dial()).await? {
                Ok(next) => conn = Some(next),
                Err(e) => {
                    warn!("Tunnel: re-dial failed: {e}");
                    self.stats
                        .push_event(TunnelEventType::DialFailed, e.to_string())
                        .await;
                }
            }
        }
    }

    /// Register if still holding the one-time token. Returns the permanent token.
    async fn ensure_registered(
        &mut self,
        conn: &mut D::Conn,
        cancel: &CancellationToken,
    ) -> Result<String, TunnelError> {
        let bootstrap_token = match &self.credentials {
            Credentials::Registered { token, .. } => return Ok(token.clone()),
            Credentials::Unregistered { bootstrap_token } => bootstrap_token.clone(),
        };

        self.stats.set_state(ConnectionState::Registering);
        info!(cluster_name = %self.cluster_name, "Tunnel: registering with dashboard");
        let request = RegisterRequest {
            token: bootstrap_token,
            cluster_name: self.cluster_name.clone(),
        };
        let response = cancellable(cancel, conn.register(request)).await??;

        self.credentials = Credentials::Registered {
            cluster_id: response.cluster_id.clone(),
            token: response.token.clone(),
        };
        info!(cluster_id = %response.cluster_id, "Tunnel: registered");
        self.stats
            .push_event(TunnelEventType::Registered, response.cluster_id)
            .await;

        if let Some(path) = &self.credentials_file {
            // The token is already spent; losing the file only costs a re-bootstrap.
            if let Err(e) = self.credentials.save(path).await {
                warn!("Tunnel: could not persist credentials: {e}");
            }
        }
        Ok(response.token)
    }

    /// Open one stream and serve it until it breaks or `cancel` fires.
    async fn stream_session(
        &self,
        conn: &mut D::Conn,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, TunnelError> {
        let (sink, mut stream) = match cancellable(cancel, conn.open_stream(token)).await? {
            Ok(halves) => halves,
            Err(e) => return Ok(StreamOutcome::OpenFailed(e)),
        };
        self.stats.set_state(ConnectionState::Streaming);
        self.stats
            .push_event(TunnelEventType::Connected, String::new())
            .await;
        info!(cluster_id = self.credentials.cluster_id().unwrap_or_default(), "Tunnel: stream open");

        let session = cancel.child_token();
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let (data_tx, data_rx) = mpsc::channel(self.outbound_queue);
        let mut writer = tokio::spawn(write_loop(
            sink,
            control_rx,
            data_rx,
            session.clone(),
            Arc::clone(&self.stats),
        ));
        let watches = WatchManager::new(Arc::clone(&self.watch_source), session.clone());

        if let Some(provider) = &self.cluster_info {
            tokio::spawn(send_cluster_info(
                Arc::clone(provider),
                data_tx.clone(),
                session.clone(),
            ));
        }

        let mut writer_finished = false;
        let result = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break Err(TunnelError::Cancelled),
                res = &mut writer => {
                    writer_finished = true;
                    let reason = match res {
                        Ok(Ok(())) => "writer stopped".to_string(),
                        Ok(Err(e)) => format!("write failed: {e}"),
                        Err(e) => format!("writer task failed: {e}"),
                    };
                    break Ok(StreamOutcome::Lost(reason));
                }
                next = stream.next() => next,
            };

            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => break Ok(StreamOutcome::Lost(e.to_string())),
                None => break Ok(StreamOutcome::Lost("stream ended".to_string())),
            };
            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
            self.dispatch(msg, &control_tx, &data_tx, &watches, &session)
                .await;
        };

        // Tear down in dependency order: watches and request tasks first, then
        // the writer they feed.
        session.cancel();
        watches.stop_all().await;
        drop(stream);
        if !writer_finished {
            let _ = writer.await;
        }
        result
    }

    async fn dispatch(
        &self,
        msg: DashboardMessage,
        control_tx: &mpsc::Sender<AgentMessage>,
        data_tx: &mpsc::Sender<AgentMessage>,
        watches: &WatchManager,
        session: &CancellationToken,
    ) {
        match msg {
            DashboardMessage::Ping => {
                let pong = AgentMessage::Pong {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                };
                if control_tx.send(pong).await.is_err() {
                    debug!("Tunnel: writer gone, pong dropped");
                }
            }
            DashboardMessage::Request(request) => {
                tokio::spawn(serve_request(
                    Arc::clone(&self.handler),
                    Arc::clone(&self.request_limit),
                    request,
                    data_tx.clone(),
                    session.clone(),
                ));
            }
            DashboardMessage::WatchSubscribe {
                subscription_id,
                path,
                resource_version,
            } => {
                debug!(subscription_id = %subscription_id, %path, "Tunnel: watch subscribe");
                watches
                    .subscribe(&subscription_id, &path, resource_version, data_tx.clone())
                    .await;
            }
            DashboardMessage::WatchUnsubscribe { subscription_id } => {
                debug!(subscription_id = %subscription_id, "Tunnel: watch unsubscribe");
                watches.unsubscribe(&subscription_id).await;
            }
        }
    }
}

/// Await `fut` unless `cancel` fires first.
async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, TunnelError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(TunnelError::Cancelled),
        out = fut => Ok(out),
    }
}

async fn serve_request(
    handler: Arc<dyn RequestHandler>,
    limit: Arc<Semaphore>,
    request: ApiRequest,
    data_tx: mpsc::Sender<AgentMessage>,
    session: CancellationToken,
) {
    let id = request.id.clone();
    let response = tokio::select! {
        () = session.cancelled() => return,
        response = async {
            let Ok(_permit) = limit.acquire_owned().await else {
                return ApiResponse::error(id.clone(), 503, "agent shutting down");
            };
            handler.handle(request).await
        } => response,
    };
    if data_tx.send(AgentMessage::Response(response)).await.is_err() {
        debug!(request_id = %id, "Tunnel: stream closed before response was sent");
    }
}

async fn send_cluster_info(
    provider: Arc<dyn ClusterInfoProvider>,
    data_tx: mpsc::Sender<AgentMessage>,
    session: CancellationToken,
) {
    let info = tokio::select! {
        () = session.cancelled() => return,
        info = provider.cluster_info() => info,
    };
    if let Some(info) = info {
        let _ = data_tx.send(AgentMessage::ClusterInfo(info)).await;
    }
}

/// Drains the pong lane before the data lane, and stops on cancellation.
async fn write_loop(
    mut sink: MessageSink,
    mut control: mpsc::Receiver<AgentMessage>,
    mut data: mpsc::Receiver<AgentMessage>,
    cancel: CancellationToken,
    stats: Arc<TunnelStats>,
) -> Result<(), TransportError> {
    loop {
        let msg = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = sink.close().await;
                return Ok(());
            }
            Some(msg) = control.recv() => msg,
            Some(msg) = data.recv() => msg,
        };
        sink.send(msg).await?;
        stats.messages_sent.fetch_add(1, Ordering::Relaxed);
    }
}
