//! Structured hub events.
//!
//! Sessions, the dispatcher and the authorization layer report what they do as [`HubEvent`]s.
//! Events flow into a [`TelemetrySink`], which is a `tower::Service<HubEvent>`, so sinks compose
//! with ordinary tower combinators.
//!
//! Emission is best effort: a sink that is not ready or fails drops the event, and delivery
//! never waits on it.
//!
//! ```rust
//! use cloudhub::telemetry::{HubEvent, MemorySink, Telemetry};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sink = MemorySink::new();
//! let telemetry = Telemetry::new(sink.clone());
//! telemetry.emit(HubEvent::SessionOpened { node_id: "n1".into() }).await;
//! assert_eq!(sink.len(), 1);
//! # }
//! ```

use crate::error::TerminateReason;
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tower::Service;

/// Something observable the hub did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    SessionOpened { node_id: String },
    SessionClosed { node_id: String, reason: TerminateReason },
    /// Admission refused because the node limit is reached.
    NodeLimitReached { node_id: String, limit: usize },
    /// A message was written to a node.
    MessageWritten { node_id: String, message_id: String, ack: bool },
    AckReceived { node_id: String, message_id: String },
    /// Retry budget exhausted; the key went back on the queue.
    AckTimeout { node_id: String, message_id: String, attempts: usize },
    MessageDenied { node_id: String, operation: String, resource: String, reason: String },
    SyncPointSaved { node_id: String, name: String, resource_version: String },
    SyncPointDeleted { node_id: String, name: String },
}

impl fmt::Display for HubEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubEvent::SessionOpened { node_id } => write!(f, "SessionOpened({node_id})"),
            HubEvent::SessionClosed { node_id, reason } => {
                write!(f, "SessionClosed({node_id}, reason={reason})")
            }
            HubEvent::NodeLimitReached { node_id, limit } => {
                write!(f, "NodeLimitReached({node_id}, limit={limit})")
            }
            HubEvent::MessageWritten { node_id, message_id, ack } => {
                write!(f, "MessageWritten({node_id}, {message_id}, ack={ack})")
            }
            HubEvent::AckReceived { node_id, message_id } => {
                write!(f, "AckReceived({node_id}, {message_id})")
            }
            HubEvent::AckTimeout { node_id, message_id, attempts } => {
                write!(f, "AckTimeout({node_id}, {message_id}, attempts={attempts})")
            }
            HubEvent::MessageDenied { node_id, operation, resource, .. } => {
                write!(f, "MessageDenied({node_id}, {operation} {resource})")
            }
            HubEvent::SyncPointSaved { node_id, name, resource_version } => {
                write!(f, "SyncPointSaved({node_id}, {name}, rv={resource_version})")
            }
            HubEvent::SyncPointDeleted { node_id, name } => {
                write!(f, "SyncPointDeleted({node_id}, {name})")
            }
        }
    }
}

/// A sink consuming hub events.
pub trait TelemetrySink:
    Service<HubEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + 'static;
}

/// Send `event` to `sink` if it becomes ready, ignoring errors.
pub async fn emit_best_effort<S>(sink: S, event: HubEvent)
where
    S: Service<HubEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready) = sink.ready_oneshot().await {
        let _ = ready.call(event).await;
    }
}

type SinkFuture = Pin<Box<dyn std::future::Future<Output = Result<(), Infallible>> + Send>>;

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<HubEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: HubEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs events on the `cloudhub::telemetry` target.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<HubEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: HubEvent) -> Self::Future {
        tracing::debug!(target: "cloudhub::telemetry", event = %event, "hub_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent events in memory; the oldest are evicted past capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<HubEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded to 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<HubEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<HubEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: HubEvent) -> Self::Future {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() >= self.capacity {
            events.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

trait Emit: Send + Sync {
    fn emit(&self, event: HubEvent) -> BoxFuture<'static, ()>;
}

struct SinkEmitter<S>(S);

impl<S> Emit for SinkEmitter<S>
where
    S: TelemetrySink + Sync,
    S::Future: Send + 'static,
{
    fn emit(&self, event: HubEvent) -> BoxFuture<'static, ()> {
        Box::pin(emit_best_effort(self.0.clone(), event))
    }
}

/// Cloneable, type-erased handle to a sink.
#[derive(Clone)]
pub struct Telemetry {
    emitter: Arc<dyn Emit>,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::null()
    }
}

impl Telemetry {
    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        Self { emitter: Arc::new(SinkEmitter(sink)) }
    }

    pub fn null() -> Self {
        Self::new(NullSink)
    }

    pub fn log() -> Self {
        Self::new(LogSink)
    }

    pub async fn emit(&self, event: HubEvent) {
        self.emitter.emit(event).await;
    }
}
