//! Shared state: the dashboard's `AppState` (passed to every handler via
//! Axum's `State` extractor) and the agent's tunnel statistics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::hub::Hub;
use crate::tunnel::relay::RelayState;

/// Shared application state for the dashboard.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Browser subscriber sessions and event fan-out.
    pub hub: Arc<Hub>,
    /// Connected cluster agents.
    pub relay: RelayState,
    /// Resolves browser bearer tokens to principals.
    pub authenticator: Arc<dyn Authenticator>,
}

/// Where the agent's tunnel state machine currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Dialing = 1,
    Registering = 2,
    Streaming = 3,
    Backoff = 4,
    Cancelled = 5,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Dialing,
            2 => Self::Registering,
            3 => Self::Streaming,
            4 => Self::Backoff,
            5 => Self::Cancelled,
            _ => Self::Disconnected,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Dialing => "dialing",
            Self::Registering => "registering",
            Self::Streaming => "streaming",
            Self::Backoff => "backoff",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Tunnel connection event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelEventType {
    Registered,
    Connected,
    Disconnected,
    StreamOpenFailed,
    DialFailed,
    Backoff,
}

impl TunnelEventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::StreamOpenFailed => "stream_open_failed",
            Self::DialFailed => "dial_failed",
            Self::Backoff => "backoff",
        }
    }
}

/// A tunnel lifecycle event for observability.
#[derive(Clone, Debug)]
pub struct ConnectionEvent {
    pub timestamp: Instant,
    pub event_type: TunnelEventType,
    pub detail: String,
    /// Set on [`TunnelEventType::Backoff`] events.
    pub delay: Option<Duration>,
}

/// Maximum number of recent events to retain.
const MAX_TUNNEL_EVENTS: usize = 50;

/// Agent tunnel statistics. Atomics for hot-path updates, a Mutex only for
/// the event log (cold path).
pub struct TunnelStats {
    state: AtomicU8,
    pub reconnects: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    /// Epoch for computing relative timestamps in events.
    pub epoch: Instant,
    pub events: Mutex<VecDeque<ConnectionEvent>>,
}

impl TunnelStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            reconnects: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            epoch: Instant::now(),
            events: Mutex::new(VecDeque::with_capacity(MAX_TUNNEL_EVENTS)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Push a connection event, evicting oldest if at capacity.
    pub async fn push_event(&self, event_type: TunnelEventType, detail: String) {
        self.push(ConnectionEvent {
            timestamp: Instant::now(),
            event_type,
            detail,
            delay: None,
        })
        .await;
    }

    /// Record that the client is about to wait `delay` before reconnect `attempt`.
    pub async fn push_backoff(&self, attempt: u32, delay: Duration) {
        self.push(ConnectionEvent {
            timestamp: Instant::now(),
            event_type: TunnelEventType::Backoff,
            detail: format!("attempt {attempt}"),
            delay: Some(delay),
        })
        .await;
    }

    async fn push(&self, event: ConnectionEvent) {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_TUNNEL_EVENTS {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Copy of the event log, oldest first.
    pub async fn recent_events(&self) -> Vec<ConnectionEvent> {
        self.events.lock().await.iter().cloned().collect()
    }

    /// Delays of every recorded backoff, oldest first.
    pub async fn backoff_delays(&self) -> Vec<Duration> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|e| e.delay)
            .collect()
    }
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}
