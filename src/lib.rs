#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! kubetunnel library - the building blocks of both binaries' roles.
//!
//! - `tunnel` - agent client, dashboard relay, wire protocol and transport
//! - `watch` - agent-side watch lifecycle over a pluggable watch source
//! - `k8s` - `kube`-backed request handler, watch source and cluster probe
//! - `hub` - dashboard subscriber hub and browser sessions
//! - `backoff` - reconnect delay policy
//! - `auth` - browser bearer token middleware
//! - `config` - configuration loading
//! - `routes` - REST route handlers and the dashboard router

pub mod auth;
pub mod backoff;
pub mod config;
pub mod hub;
pub mod k8s;
pub mod routes;
pub mod state;
pub mod tunnel;
pub mod watch;

// Re-export key types at crate root for convenience.
pub use backoff::Backoff;
pub use config::Config;
pub use hub::{BroadcastSink, Hub, HubEvent, SubscriberSession, SubscriptionKey};
pub use state::AppState;
pub use tunnel::client::TunnelClient;
pub use tunnel::relay::RelayState;
pub use watch::WatchManager;
