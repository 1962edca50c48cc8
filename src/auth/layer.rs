//! Tower layer that gates upstream messages on authorization.

use super::MessageAuthorizer;
use crate::message::Message;
use crate::session::HubInfo;
use crate::telemetry::{HubEvent, Telemetry};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;

/// A message read from a node, with the identity it arrived under.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub info: HubInfo,
    pub message: Message,
}

impl InboundMessage {
    pub fn new(info: HubInfo, message: Message) -> Self {
        Self { info, message }
    }
}

/// Wraps an upstream service so that refused messages never reach it.
#[derive(Clone, Debug)]
pub struct AuthorizationLayer {
    authz: Arc<MessageAuthorizer>,
    telemetry: Telemetry,
}

impl AuthorizationLayer {
    pub fn new(authz: MessageAuthorizer) -> Self {
        Self { authz: Arc::new(authz), telemetry: Telemetry::null() }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }
}

impl<S> tower_layer::Layer<S> for AuthorizationLayer {
    type Service = AuthorizationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthorizationService {
            inner,
            authz: Arc::clone(&self.authz),
            telemetry: self.telemetry.clone(),
        }
    }
}

/// See [`AuthorizationLayer`].
#[derive(Clone, Debug)]
pub struct AuthorizationService<S> {
    inner: S,
    authz: Arc<MessageAuthorizer>,
    telemetry: Telemetry,
}

impl<S> Service<InboundMessage> for AuthorizationService<S>
where
    S: Service<InboundMessage, Response = ()> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = ();
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<(), S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: InboundMessage) -> Self::Future {
        match self.authz.admit(&req.info, &req.message) {
            Ok(()) => {
                let clone = self.inner.clone();
                let mut inner = std::mem::replace(&mut self.inner, clone);
                Box::pin(async move { inner.call(req).await })
            }
            Err(err) => {
                tracing::warn!(
                    target: "cloudhub::audit",
                    node_id = %req.info.node_id,
                    operation = %req.message.operation(),
                    resource = %req.message.resource(),
                    reason = %err,
                    "message denied"
                );
                let telemetry = self.telemetry.clone();
                let event = HubEvent::MessageDenied {
                    node_id: req.info.node_id,
                    operation: req.message.route.operation,
                    resource: req.message.route.resource,
                    reason: err.to_string(),
                };
                Box::pin(async move {
                    telemetry.emit(event).await;
                    Ok(())
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMode;
    use crate::message::operation;
    use crate::telemetry::MemorySink;
    use std::convert::Infallible;
    use std::sync::Mutex;
    use tower::{Layer, ServiceExt};

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<Message>>>);

    impl Service<InboundMessage> for Collect {
        type Response = ();
        type Error = Infallible;
        type Future = futures::future::Ready<Result<(), Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: InboundMessage) -> Self::Future {
            self.0.lock().unwrap().push(req.message);
            futures::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn denied_messages_never_reach_inner() {
        let sink = MemorySink::new();
        let seen = Collect::default();
        let layer = AuthorizationLayer::new(MessageAuthorizer::from_modes(&[AuthMode::Node], true, false))
            .with_telemetry(Telemetry::new(sink.clone()));
        let svc = layer.layer(seen.clone());
        let info = HubInfo::new("n1", "");

        let denied = Message::new().with_route("edged", "resource", "kube-system/configmap/x", operation::QUERY);
        svc.clone().oneshot(InboundMessage::new(info.clone(), denied)).await.unwrap();
        let keepalive = Message::new().with_route("edged", "", "", operation::KEEPALIVE);
        svc.oneshot(InboundMessage::new(info, keepalive)).await.unwrap();

        let seen = seen.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].operation(), operation::KEEPALIVE);
        assert!(matches!(sink.events().as_slice(), [HubEvent::MessageDenied { node_id, .. }] if node_id == "n1"));
    }
}
