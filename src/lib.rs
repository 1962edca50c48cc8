#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # CloudHub
//!
//! Cloud-side message hub for fleets of edge nodes.
//!
//! ## Features
//!
//! - **Node sessions** over mutually authenticated TLS with keepalive supervision
//! - **Per-node message pools** with latest-wins dedup keyed by object UID
//! - **Reliable delivery**: ordered writes, per-message ack waiting and bounded retries
//! - **Sync points** recording the last resource version each node confirmed, with a
//!   periodic reconciler for drift
//! - **Per-message authorization** of node traffic as a `tower` layer
//!
//! ## Quick Start
//!
//! ```rust
//! use cloudhub::message::{group, operation, source};
//! use cloudhub::{CloudHub, HubConfig, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cloudhub::HubError> {
//!     let hub = CloudHub::builder(HubConfig::default()).build()?;
//!     hub.start();
//!
//!     let pod = Message::new()
//!         .with_route(source::EDGE_CONTROLLER, group::RESOURCE, "node/edge-1/default/pod/web", operation::UPDATE)
//!         .with_resource_version("7")
//!         .with_content(serde_json::json!({"metadata": {"uid": "9f1c", "name": "web"}}));
//!     hub.bus().send_to_hub(pod).await?;
//!
//!     hub.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod backoff;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod message;
pub mod objectsync;
pub mod pool;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod workqueue;

// Re-exports
pub use auth::{AuthError, AuthMode, AuthorizationLayer, MessageAuthorizer};
pub use backoff::Backoff;
pub use bus::{BusError, ControlPlaneBus};
pub use config::{ConfigError, HubConfig};
pub use dispatcher::{DispatchOutcome, DropReason, MessageDispatcher, UpstreamRoute};
pub use error::{HubError, TerminateReason};
pub use hub::{CloudHub, CloudHubBuilder};
pub use message::Message;
pub use objectsync::{MemorySyncStore, StoreError, SyncPoint, SyncPointKey, SyncPointStore, SyncPoints};
pub use pool::{MessagePools, NodeMessagePool, PoolSettings};
pub use session::{HubInfo, NodeSession, SessionManager, SessionSettings};
pub use telemetry::{HubEvent, Telemetry};
pub use transport::{Connection, PeerHeaders, TransportError};
