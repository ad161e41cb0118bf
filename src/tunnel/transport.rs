//! Agent-side transport: how a tunnel connection is dialed, registered and
//! turned into a message stream.
//!
//! The client state machine only sees the [`Dialer`] and [`Connection`]
//! traits. [`WsDialer`] is the production implementation: registration is a
//! JSON `POST /api/agent/register`, the stream is a WebSocket to
//! `/api/agent/connect` carrying the permanent token as a bearer header.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use reqwest::Url;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{AgentMessage, DashboardMessage, RegisterRequest, RegisterResponse};

/// Outbound half of an open tunnel stream.
pub type MessageSink = Pin<Box<dyn Sink<AgentMessage, Error = TransportError> + Send>>;
/// Inbound half of an open tunnel stream.
pub type MessageStream =
    Pin<Box<dyn Stream<Item = Result<DashboardMessage, TransportError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("stream closed by peer")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("registration request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Endpoint(String),
    #[error("registration rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Produces fresh connections to the dashboard.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Conn: Connection;

    /// Establish transport reachability to the configured endpoint.
    async fn dial(&self) -> Result<Self::Conn, TransportError>;
}

/// One dialed connection. Replaced, never reused, after a stream failure.
#[async_trait]
pub trait Connection: Send {
    /// One-shot registration exchange.
    async fn register(
        &mut self,
        request: RegisterRequest,
    ) -> Result<RegisterResponse, RegistrationError>;

    /// Open the bidirectional message stream, authenticated with `token`.
    async fn open_stream(
        &mut self,
        token: &str,
    ) -> Result<(MessageSink, MessageStream), TransportError>;
}

/// WebSocket/HTTP dialer for a dashboard at `endpoint` (`http(s)://host[:port][/prefix]`).
#[derive(Clone)]
pub struct WsDialer {
    /// Base URL, always ending in `/` so relative joins keep any path prefix.
    endpoint: Url,
    max_message_size: usize,
    http: reqwest::Client,
}

impl WsDialer {
    pub fn new(endpoint: &str, max_message_size: usize) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidEndpoint(endpoint.to_string());
        let mut url = Url::parse(endpoint).map_err(|_| invalid())?;
        if !matches!(url.scheme(), "http" | "https")
            || url.host_str().is_none()
            || !url.username().is_empty()
            || url.password().is_some()
            || url.query().is_some()
            || url.fragment().is_some()
        {
            return Err(invalid());
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self {
            endpoint: url,
            max_message_size,
            http,
        })
    }

    /// `host:port` of the endpoint, with the scheme's default port filled in.
    fn authority(&self) -> Result<String, TransportError> {
        let invalid = || TransportError::InvalidEndpoint(self.endpoint.to_string());
        // `host_str` keeps the brackets around IPv6 literals.
        let host = self.endpoint.host_str().ok_or_else(invalid)?;
        let port = self.endpoint.port_or_known_default().ok_or_else(invalid)?;
        Ok(format!("{host}:{port}"))
    }

    fn register_url(&self) -> Result<Url, TransportError> {
        self.endpoint
            .join("api/agent/register")
            .map_err(|_| TransportError::InvalidEndpoint(self.endpoint.to_string()))
    }

    fn ws_url(&self) -> Result<Url, TransportError> {
        let invalid = || TransportError::InvalidEndpoint(self.endpoint.to_string());
        let mut url = self.endpoint.join("api/agent/connect").map_err(|_| invalid())?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|()| invalid())?;
        Ok(url)
    }
}

#[async_trait]
impl Dialer for WsDialer {
    type Conn = WsConnection;

    /// Checks that the dashboard accepts TCP connections, so an unreachable
    /// endpoint fails the first dial. The returned connection holds no socket:
    /// registration is a separate HTTP request and the WebSocket is opened
    /// by [`Connection::open_stream`].
    async fn dial(&self) -> Result<WsConnection, TransportError> {
        let authority = self.authority()?;
        tokio::net::TcpStream::connect(&authority)
            .await
            .map_err(|e| TransportError::Connect(format!("{authority}: {e}")))?;
        debug!(%authority, "Tunnel: endpoint reachable");
        Ok(WsConnection {
            dialer: self.clone(),
        })
    }
}

/// A dialed WebSocket/HTTP connection to the dashboard.
pub struct WsConnection {
    dialer: WsDialer,
}

#[async_trait]
impl Connection for WsConnection {
    async fn register(
        &mut self,
        request: RegisterRequest,
    ) -> Result<RegisterResponse, RegistrationError> {
        let url = self
            .dialer
            .register_url()
            .map_err(|e| RegistrationError::Endpoint(e.to_string()))?;
        let resp = self.dialer.http.post(url).json(&request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RegistrationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json::<RegisterResponse>().await?)
    }

    async fn open_stream(
        &mut self,
        token: &str,
    ) -> Result<(MessageSink, MessageStream), TransportError> {
        let mut request = self.dialer.ws_url()?.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::Connect(format!("invalid token header: {e}")))?;
        request.headers_mut().insert("authorization", bearer);

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.dialer.max_message_size);
        config.max_frame_size = Some(self.dialer.max_message_size);

        let (ws, _response) =
            tokio_tungstenite::connect_async_with_config(request, Some(config), false).await?;
        let (ws_sink, ws_stream) = ws.split();

        let sink = ws_sink
            .sink_map_err(TransportError::from)
            .with(|msg: AgentMessage| async move {
                let text = serde_json::to_string(&msg)?;
                Ok::<_, TransportError>(Message::Text(text.into()))
            });

        let stream = ws_stream.filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<DashboardMessage>(&text) {
                    Ok(msg) => Some(Ok(msg)),
                    Err(e) => {
                        warn!("Tunnel: dropping malformed frame: {e}");
                        None
                    }
                },
                Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
                // Transport-level ping/pong is answered by tungstenite itself.
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::from(e))),
            }
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
