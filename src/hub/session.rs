//! Browser WebSocket sessions.
//!
//! ## Connection lifecycle
//!
//! 1. Browser connects to `GET /api/ws?token=<token>` (or sends
//!    `Authorization: Bearer <token>`). The token is checked once, before the
//!    upgrade completes.
//! 2. Two tasks run per session: a **reader** that applies control frames and
//!    tracks liveness, and a **writer** that drains the outbound queue and
//!    pings the browser.
//! 3. Either loop ending (read error, close, liveness timeout, write failure)
//!    removes the session from the hub.
//!
//! ## Control frames (browser → server)
//!
//! ```json
//! {"action": "subscribe", "cluster": "prod", "resource": "pods", "namespace": "default"}
//! {"action": "unsubscribe", "cluster": "prod", "resource": "pods"}
//! ```
//!
//! ## Event frames (server → browser)
//!
//! ```json
//! {"cluster": "prod", "resource": "pods", "namespace": "default", "type": "ADDED", "object": {}}
//! ```

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::Extension;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{Hub, SubscriberSession, SubscriptionKey};
use crate::auth::Principal;
use crate::config::HubConfig;
use crate::state::AppState;

/// Timing and size limits applied to every session.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub max_message_size: usize,
    pub send_queue: usize,
}

impl From<&HubConfig> for SessionLimits {
    fn from(config: &HubConfig) -> Self {
        Self {
            ping_interval: config.ping_interval(),
            pong_wait: config.pong_wait(),
            write_wait: config.write_wait(),
            max_message_size: config.max_message_size,
            send_queue: config.send_queue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Subscribe,
    Unsubscribe,
}

/// A decoded browser control frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlFrame {
    pub action: Action,
    pub cluster: String,
    pub resource: String,
    #[serde(default)]
    pub namespace: String,
}

impl ControlFrame {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(&self.cluster, &self.resource, &self.namespace)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("invalid control frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("control frame is missing {0}")]
    MissingField(&'static str),
}

/// Decode one control frame and apply it to `session`'s subscription set.
pub fn apply_control_frame(
    session: &SubscriberSession,
    raw: &[u8],
) -> Result<ControlFrame, ControlError> {
    let frame: ControlFrame = serde_json::from_slice(raw)?;
    if frame.cluster.is_empty() {
        return Err(ControlError::MissingField("cluster"));
    }
    if frame.resource.is_empty() {
        return Err(ControlError::MissingField("resource"));
    }
    match frame.action {
        Action::Subscribe => {
            session.subscribe(frame.key());
        }
        Action::Unsubscribe => {
            session.unsubscribe(&frame.key());
        }
    }
    Ok(frame)
}

/// `GET /api/ws` - upgrade into a subscriber session. The token was already
/// checked by [`crate::auth::require_ws_token`].
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Extension(Principal(principal)): Extension<Principal>,
    ws: WebSocketUpgrade,
) -> Response {
    let limits = SessionLimits::from(&state.config.hub);
    let hub = Arc::clone(&state.hub);
    ws.max_message_size(limits.max_message_size)
        .on_upgrade(move |socket| serve_session(socket, hub, principal, limits))
}

/// Run a registered session until either of its loops ends.
pub async fn serve_session(
    socket: WebSocket,
    hub: Arc<Hub>,
    principal: String,
    limits: SessionLimits,
) {
    let (session, outbound) = SubscriberSession::new(principal, limits.send_queue);
    let session_id = session.id();
    hub.register(Arc::clone(&session));
    info!(%session_id, principal = %session.principal(), "Subscriber connected");

    let (ws_sink, ws_stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(ws_sink, outbound, limits));
    let reader = read_loop(ws_stream, &session, limits);
    tokio::pin!(reader);

    let writer_done = tokio::select! {
        () = &mut reader => false,
        _ = &mut writer => true,
    };

    // Closing the queue lets the writer send a close frame and exit.
    hub.unregister(session_id);
    if !writer_done {
        let _ = timeout(limits.write_wait * 2, writer).await;
    }
    info!(%session_id, "Subscriber disconnected");
}

/// Reader: applies control frames, extends the deadline on every pong, and
/// returns on read error, close, oversized frame or liveness timeout.
pub async fn read_loop<S, E>(mut stream: S, session: &SubscriberSession, limits: SessionLimits)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let session_id = session.id();
    let mut deadline = Instant::now() + limits.pong_wait;
    loop {
        let msg = match timeout_at(deadline, stream.next()).await {
            Err(_) => {
                debug!(%session_id, "Subscriber missed liveness deadline");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(%session_id, "Subscriber read error: {e}");
                return;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let raw: &[u8] = match &msg {
            Message::Pong(_) => {
                deadline = Instant::now() + limits.pong_wait;
                continue;
            }
            Message::Close(_) => return,
            Message::Ping(_) => continue,
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        };

        if raw.len() > limits.max_message_size {
            warn!(%session_id, len = raw.len(), "Subscriber frame too large, closing");
            return;
        }
        match apply_control_frame(session, raw) {
            Ok(frame) => debug!(
                %session_id,
                action = ?frame.action,
                cluster = %frame.cluster,
                resource = %frame.resource,
                namespace = %frame.namespace,
                "Subscription updated"
            ),
            Err(e) => warn!(%session_id, "Ignoring control frame: {e}"),
        }
    }
}

/// Writer: forwards queued events, pings on a fixed interval, and sends a
/// close frame once the hub closes the queue.
pub async fn write_loop<K>(mut sink: K, mut outbound: mpsc::Receiver<Arc<str>>, limits: SessionLimits)
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let start = Instant::now() + limits.ping_interval;
    let mut ticker = tokio::time::interval_at(start, limits.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // A due ping goes out ahead of queued events, so a busy session
        // still gets pinged and its reader's deadline keeps moving.
        let frame = tokio::select! {
            biased;
            _ = ticker.tick() => Message::Ping(Bytes::new()),
            item = outbound.recv() => match item {
                Some(payload) => Message::Text(payload.as_ref().into()),
                None => {
                    let _ = timeout(limits.write_wait, sink.send(Message::Close(None))).await;
                    return;
                }
            },
        };

        match timeout(limits.write_wait, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Subscriber write failed: {e}");
                return;
            }
            Err(_) => {
                debug!("Subscriber write deadline exceeded");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;

    fn limits() -> SessionLimits {
        SessionLimits {
            ping_interval: Duration::from_secs(5),
            pong_wait: Duration::from_secs(10),
            write_wait: Duration::from_secs(1),
            max_message_size: 256,
            send_queue: 8,
        }
    }

    fn text(s: &str) -> Result<Message, std::convert::Infallible> {
        Ok(Message::Text(s.into()))
    }

    #[test]
    fn test_apply_control_frame_subscribe_and_unsubscribe() {
        let (session, _rx) = SubscriberSession::new("alice", 4);
        let frame = apply_control_frame(
            &session,
            br#"{"action":"subscribe","cluster":"prod","resource":"pods","namespace":"default"}"#,
        )
        .unwrap();
        assert_eq!(frame.action, Action::Subscribe);
        assert!(session.is_subscribed(&SubscriptionKey::new("prod", "pods", "default")));

        apply_control_frame(
            &session,
            br#"{"action":"unsubscribe","cluster":"prod","resource":"pods","namespace":"default"}"#,
        )
        .unwrap();
        assert_eq!(session.subscription_count(), 0);
    }

    #[test]
    fn test_missing_namespace_means_all_namespaces() {
        let (session, _rx) = SubscriberSession::new("alice", 4);
        apply_control_frame(
            &session,
            br#"{"action":"subscribe","cluster":"prod","resource":"nodes"}"#,
        )
        .unwrap();
        assert!(session.is_subscribed(&SubscriptionKey::new("prod", "nodes", "")));
    }

    #[test]
    fn test_malformed_frames_are_rejected_without_side_effects() {
        let (session, _rx) = SubscriberSession::new("alice", 4);
        assert!(apply_control_frame(&session, b"not json").is_err());
        assert!(apply_control_frame(
            &session,
            br#"{"action":"explode","cluster":"c","resource":"pods"}"#
        )
        .is_err());
        assert!(matches!(
            apply_control_frame(&session, br#"{"action":"subscribe","cluster":"","resource":"pods"}"#),
            Err(ControlError::MissingField("cluster"))
        ));
        assert_eq!(session.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_reader_survives_malformed_frame() {
        let (session, _rx) = SubscriberSession::new("alice", 4);
        let frames = futures::stream::iter(vec![
            text("{garbage"),
            text(r#"{"action":"subscribe","cluster":"c","resource":"pods"}"#),
        ]);
        read_loop(frames, &session, limits()).await;
        assert!(session.is_subscribed(&SubscriptionKey::new("c", "pods", "")));
    }

    #[tokio::test]
    async fn test_reader_stops_on_oversized_frame() {
        let (session, _rx) = SubscriberSession::new("alice", 4);
        let big = format!(
            r#"{{"action":"subscribe","cluster":"{}","resource":"pods"}}"#,
            "x".repeat(300)
        );
        let frames = futures::stream::iter(vec![
            text(&big),
            text(r#"{"action":"subscribe","cluster":"c","resource":"pods"}"#),
        ]);
        read_loop(frames, &session, limits()).await;
        assert_eq!(session.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_times_out_without_pong() {
        let (session, _rx) = SubscriberSession::new("alice", 4);
        let (_tx, rx) = fmpsc::unbounded::<Result<Message, std::convert::Infallible>>();
        let started = Instant::now();
        read_loop(rx, &session, limits()).await;
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_extends_deadline() {
        let (session, _rx) = SubscriberSession::new("alice", 4);
        let (tx, rx) = fmpsc::unbounded::<Result<Message, std::convert::Infallible>>();
        let started = Instant::now();
        let feeder = tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_secs(8)).await;
                if tx.unbounded_send(Ok(Message::Pong(Bytes::new()))).is_err() {
                    return;
                }
            }
            // Keep the stream open so only the deadline can end the reader.
            std::future::pending::<()>().await;
        });
        read_loop(rx, &session, limits()).await;
        // Three pongs 8s apart push the deadline to 24s + 10s.
        assert!(started.elapsed() >= Duration::from_secs(34));
        feeder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_forwards_events_then_closes() {
        let (sink_tx, mut sink_rx) = fmpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel::<Arc<str>>(4);
        tx.send(Arc::from(r#"{"type":"ADDED"}"#)).await.unwrap();
        drop(tx);

        write_loop(sink_tx, rx, limits()).await;

        match sink_rx.next().await {
            Some(Message::Text(t)) => assert_eq!(t.as_str(), r#"{"type":"ADDED"}"#),
            other => panic!("expected text frame, got {other:?}"),
        }
        assert!(matches!(sink_rx.next().await, Some(Message::Close(None))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_pings_on_interval() {
        let (sink_tx, mut sink_rx) = fmpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel::<Arc<str>>(4);
        let writer = tokio::spawn(write_loop(sink_tx, rx, limits()));

        tokio::time::sleep(Duration::from_secs(11)).await;
        let mut pings = 0;
        while let Ok(Some(msg)) = sink_rx.try_next() {
            if matches!(msg, Message::Ping(_)) {
                pings += 1;
            }
        }
        assert_eq!(pings, 2);

        drop(tx);
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_pings_while_queue_stays_full() {
        let (record_tx, mut record_rx) = fmpsc::unbounded::<Message>();
        let slow_sink = Box::pin(futures::sink::unfold(
            record_tx,
            |record_tx, msg: Message| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let _ = record_tx.unbounded_send(msg);
                Ok::<_, std::convert::Infallible>(record_tx)
            },
        ));
        let (tx, rx) = mpsc::channel::<Arc<str>>(4);
        let producer = tokio::spawn(async move {
            while tx.send(Arc::from(r#"{"type":"MODIFIED"}"#)).await.is_ok() {}
        });
        let writer = tokio::spawn(write_loop(slow_sink, rx, limits()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        producer.abort();
        writer.abort();

        let (mut texts, mut pings) = (0, 0);
        while let Ok(Some(msg)) = record_rx.try_next() {
            match msg {
                Message::Text(_) => texts += 1,
                Message::Ping(_) => pings += 1,
                _ => {}
            }
        }
        assert!(texts > 100, "texts={texts}");
        assert!(pings >= 5, "pings={pings}");
    }

    #[tokio::test]
    async fn test_serve_path_unregisters_on_reader_exit() {
        // Exercise the reader/hub contract without a socket: a session whose
        // reader ends is removed and its writer observes the closed queue.
        let hub = Arc::new(Hub::new());
        let (session, mut outbound) = SubscriberSession::new("alice", 4);
        hub.register(Arc::clone(&session));
        read_loop(futures::stream::iter(Vec::<Result<Message, std::convert::Infallible>>::new()), &session, limits()).await;
        hub.unregister(session.id());
        assert_eq!(hub.session_count(), 0);
        assert!(outbound.recv().await.is_none());
    }
}
