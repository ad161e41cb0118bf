//! Agent-side watch lifecycle.
//!
//! Every `watch_subscribe` from the dashboard becomes one background task that
//! holds a native watch open and forwards its changes as `watch_event` frames.
//! A second subscribe with the same id replaces the first: the old task is
//! cancelled and awaited before the new one is spawned, so two watches never
//! run under one id.
//!
//! Task tokens are children of the manager's token, which is itself a child
//! of the tunnel stream's token. Losing the stream therefore stops every watch.

pub mod path;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use path::{PathError, ResourcePath};

use crate::tunnel::{AgentMessage, EventType, WatchEventMessage};

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("failed to open watch: {0}")]
    Open(String),
    #[error("watch stream failed: {0}")]
    Stream(String),
}

/// One native change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceChange {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    /// Bookmarks and anything else the source emits; never forwarded.
    Other(String),
}

impl ResourceChange {
    fn into_event(self) -> Result<(EventType, Value), String> {
        match self {
            Self::Added(obj) => Ok((EventType::Added, obj)),
            Self::Modified(obj) => Ok((EventType::Modified, obj)),
            Self::Deleted(obj) => Ok((EventType::Deleted, obj)),
            Self::Other(kind) => Err(kind),
        }
    }
}

pub type ChangeStream = BoxStream<'static, Result<ResourceChange, WatchError>>;

/// Opens native watches. Implemented over the Kubernetes API in
/// [`crate::k8s::KubeWatchSource`].
#[async_trait]
pub trait WatchSource: Send + Sync {
    /// Start watching `path`. `resource_version` of `None` starts from the
    /// current state (initial `ADDED` events for existing objects).
    async fn open(
        &self,
        path: &ResourcePath,
        resource_version: Option<&str>,
    ) -> Result<ChangeStream, WatchError>;
}

struct ActiveWatch {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

type WatchTable = Arc<Mutex<HashMap<String, ActiveWatch>>>;

/// Owns the watch tasks of one tunnel stream.
pub struct WatchManager {
    source: Arc<dyn WatchSource>,
    cancel: CancellationToken,
    watches: WatchTable,
    next_generation: AtomicU64,
}

impl WatchManager {
    /// `cancel` is the scope every watch task's token is derived from.
    pub fn new(source: Arc<dyn WatchSource>, cancel: CancellationToken) -> Self {
        Self {
            source,
            cancel,
            watches: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Start (or replace) the watch registered under `id`.
    pub async fn subscribe(
        &self,
        id: &str,
        path: &str,
        resource_version: Option<String>,
        sender: mpsc::Sender<AgentMessage>,
    ) {
        let previous = self.watches.lock().remove(id);
        if let Some(old) = previous {
            debug!(subscription_id = id, "Replacing active watch");
            stop(old).await;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        let task = WatchTask {
            id: id.to_string(),
            path: path.to_string(),
            resource_version,
            source: Arc::clone(&self.source),
            sender,
            cancel: cancel.clone(),
            generation,
            watches: Arc::clone(&self.watches),
        };

        // Held across the spawn so a task that finishes immediately can't try
        // to remove itself before it's been inserted.
        let mut watches = self.watches.lock();
        let handle = tokio::spawn(task.run());
        watches.insert(
            id.to_string(),
            ActiveWatch {
                generation,
                cancel,
                handle,
            },
        );
    }

    /// Stop the watch under `id`. No-op if there is none.
    pub async fn unsubscribe(&self, id: &str) {
        let removed = self.watches.lock().remove(id);
        if let Some(watch) = removed {
            stop(watch).await;
            debug!(subscription_id = id, "Watch stopped");
        }
    }

    /// Stop every watch.
    pub async fn stop_all(&self) {
        let drained: Vec<(String, ActiveWatch)> = self.watches.lock().drain().collect();
        if drained.is_empty() {
            return;
        }
        let count = drained.len();
        for (_, watch) in &drained {
            watch.cancel.cancel();
        }
        for (_, watch) in drained {
            let _ = watch.handle.await;
        }
        info!(count, "Stopped all watches");
    }

    pub fn len(&self) -> usize {
        self.watches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.lock().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.watches.lock().contains_key(id)
    }
}

async fn stop(watch: ActiveWatch) {
    watch.cancel.cancel();
    if let Err(e) = watch.handle.await {
        warn!("Watch task panicked: {e}");
    }
}

struct WatchTask {
    id: String,
    path: String,
    resource_version: Option<String>,
    source: Arc<dyn WatchSource>,
    sender: mpsc::Sender<AgentMessage>,
    cancel: CancellationToken,
    generation: u64,
    watches: WatchTable,
}

impl WatchTask {
    async fn run(self) {
        self.forward().await;
        // Only drop our own entry; a replacement may already own the id.
        let mut watches = self.watches.lock();
        if watches
            .get(&self.id)
            .is_some_and(|w| w.generation == self.generation)
        {
            watches.remove(&self.id);
        }
    }

    async fn forward(&self) {
        let id = self.id.as_str();
        let path = match ResourcePath::parse(&self.path) {
            Ok(path) => path,
            Err(e) => {
                warn!(subscription_id = id, "Dropping watch: {e}");
                return;
            }
        };

        let opened = tokio::select! {
            () = self.cancel.cancelled() => return,
            res = self.source.open(&path, self.resource_version.as_deref()) => res,
        };
        let mut changes = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(subscription_id = id, %path, "Watch open failed: {e}");
                self.emit(EventType::Error, failure_status(&e)).await;
                return;
            }
        };
        info!(subscription_id = id, %path, "Watch started");

        loop {
            let item = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                item = changes.next() => item,
            };
            match item {
                None => {
                    debug!(subscription_id = id, "Watch source closed");
                    break;
                }
                Some(Err(e)) => {
                    warn!(subscription_id = id, "Watch source failed: {e}");
                    self.emit(EventType::Error, failure_status(&e)).await;
                    break;
                }
                Some(Ok(change)) => match change.into_event() {
                    Ok((event_type, object)) => {
                        if !self.emit(event_type, object).await {
                            break;
                        }
                    }
                    Err(kind) => debug!(subscription_id = id, %kind, "Skipping watch event"),
                },
            }
        }
    }

    /// Queue one event. Returns false once the tunnel writer is gone or the
    /// watch was cancelled.
    async fn emit(&self, event_type: EventType, object: Value) -> bool {
        let msg = AgentMessage::WatchEvent(WatchEventMessage {
            subscription_id: self.id.clone(),
            event_type,
            object,
        });
        tokio::select! {
            () = self.cancel.cancelled() => false,
            res = self.sender.send(msg) => res.is_ok(),
        }
    }
}

/// Body of the synthetic `ERROR` event, shaped like a Kubernetes `Status`.
fn failure_status(err: &WatchError) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": err.to_string(),
    })
}
