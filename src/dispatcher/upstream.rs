//! Node to control plane.

use super::MessageDispatcher;
use crate::auth::attributes::is_volume_resource;
use crate::auth::layer::InboundMessage;
use crate::bus::groups;
use crate::message::{group, node_prefixed, operation, source, Message};
use crate::session::HubInfo;
use std::convert::Infallible;
use std::task::{Context, Poll};
use tower::Service;

/// Where an upstream message went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamRoute {
    Keepalive,
    /// Answer to a synchronous control-plane request.
    VolumeResponse,
    Ack,
    UserRouter,
    /// Published to the named controller group.
    Controller(&'static str),
}

/// Controller group owning messages from `source`.
pub fn controller_group(source: &str) -> &'static str {
    match source {
        source::META_SERVER => groups::DYNAMIC_CONTROLLER,
        source::TWIN => groups::DEVICE_CONTROLLER,
        _ => groups::EDGE_CONTROLLER,
    }
}

impl MessageDispatcher {
    /// Route one authorized message from `info`'s node.
    ///
    /// Failures past routing (no session, no subscriber, no pending request) are logged and
    /// never reach the node.
    pub fn dispatch_upstream(&self, info: &HubInfo, mut msg: Message) -> UpstreamRoute {
        let node_id = info.node_id.as_str();

        if msg.operation() == operation::KEEPALIVE {
            tracing::trace!(target: "cloudhub::dispatcher", node_id, "keepalive received");
            self.sessions.keepalive(node_id);
            return UpstreamRoute::Keepalive;
        }

        if is_volume_resource(msg.resource()) {
            if let Err(err) = self.bus.send_response(msg) {
                tracing::error!(target: "cloudhub::dispatcher", node_id, error = %err, "failed to answer volume request");
            }
            return UpstreamRoute::VolumeResponse;
        }

        if msg.operation() == operation::RESPONSE {
            if !self.sessions.receive_ack(node_id, msg.parent_id()) {
                tracing::debug!(
                    target: "cloudhub::dispatcher",
                    node_id,
                    parent_id = %msg.parent_id(),
                    "ack matches no pending message"
                );
            }
            return UpstreamRoute::Ack;
        }

        msg.route.resource = node_prefixed(node_id, msg.resource());
        let (route, target) = if msg.operation() == operation::UPLOAD && msg.group() == group::USER {
            (UpstreamRoute::UserRouter, groups::USER_ROUTER)
        } else {
            let target = controller_group(msg.source());
            (UpstreamRoute::Controller(target), target)
        };
        if let Err(err) = self.bus.publish(target, msg) {
            tracing::error!(target: "cloudhub::dispatcher", node_id, group = target, error = %err, "failed to publish upstream message");
        }
        route
    }
}

/// Terminal service of a session's read pipeline.
#[derive(Debug, Clone)]
pub struct UpstreamService {
    dispatcher: MessageDispatcher,
}

impl UpstreamService {
    pub fn new(dispatcher: MessageDispatcher) -> Self {
        Self { dispatcher }
    }
}

impl Service<InboundMessage> for UpstreamService {
    type Response = ();
    type Error = Infallible;
    type Future = futures::future::Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: InboundMessage) -> Self::Future {
        self.dispatcher.dispatch_upstream(&req.info, req.message);
        futures::future::ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ControlPlaneBus;
    use crate::objectsync::{MemorySyncStore, SyncPoints};
    use crate::pool::{MessagePools, PoolSettings};
    use crate::session::SessionManager;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn dispatcher() -> MessageDispatcher {
        let pools = Arc::new(MessagePools::new(PoolSettings::default()));
        let sessions = Arc::new(SessionManager::new(10, pools));
        MessageDispatcher::new(sessions, SyncPoints::new(Arc::new(MemorySyncStore::new())), ControlPlaneBus::new(8))
    }

    fn info() -> HubInfo {
        HubInfo::new("n1", "")
    }

    #[test]
    fn groups_by_source() {
        assert_eq!(controller_group(source::META_SERVER), groups::DYNAMIC_CONTROLLER);
        assert_eq!(controller_group(source::TWIN), groups::DEVICE_CONTROLLER);
        assert_eq!(controller_group("edged"), groups::EDGE_CONTROLLER);
    }

    #[tokio::test]
    async fn status_is_prefixed_and_published() {
        let d = dispatcher();
        let mut edge = d.bus().subscribe(groups::EDGE_CONTROLLER);
        let mut dynamic = d.bus().subscribe(groups::DYNAMIC_CONTROLLER);

        let status = Message::new().with_route("edged", group::RESOURCE, "default/podstatus/web", operation::UPDATE);
        assert_eq!(d.dispatch_upstream(&info(), status), UpstreamRoute::Controller(groups::EDGE_CONTROLLER));
        assert_eq!(edge.recv().await.unwrap().resource(), "node/n1/default/podstatus/web");

        let list = Message::new().with_route(source::META_SERVER, group::RESOURCE, "default/pod", operation::QUERY);
        d.dispatch_upstream(&info(), list);
        assert_eq!(dynamic.recv().await.unwrap().resource(), "node/n1/default/pod");
    }

    #[tokio::test]
    async fn user_upload_goes_to_router() {
        let d = dispatcher();
        let mut router = d.bus().subscribe(groups::USER_ROUTER);
        let upload = Message::new().with_route("router_eventbus", group::USER, "rule/r1", operation::UPLOAD);
        assert_eq!(d.dispatch_upstream(&info(), upload), UpstreamRoute::UserRouter);
        assert_eq!(router.recv().await.unwrap().resource(), "node/n1/rule/r1");
    }

    #[tokio::test]
    async fn volume_reply_completes_pending_request() {
        let d = dispatcher();
        let bus = d.bus().clone();
        let mut inbox = bus.take_inbox().unwrap();
        let request = Message::new().with_route(
            source::EDGE_CONTROLLER,
            group::RESOURCE,
            "node/n1/default/volume/pvc-1",
            operation::CREATE_VOLUME,
        );
        let waiter = tokio::spawn({
            let bus = bus.clone();
            let request = request.clone();
            async move { bus.send_sync(request, Duration::from_secs(5)).await }
        });
        let forwarded = inbox.recv().await.unwrap();
        let reply = forwarded
            .response("done")
            .with_route("edged", group::RESOURCE, "default/volume/pvc-1", operation::RESPONSE);
        assert_eq!(d.dispatch_upstream(&info(), reply), UpstreamRoute::VolumeResponse);
        let resp = waiter.await.unwrap().unwrap();
        assert_eq!(resp.parent_id(), request.id());
    }

    #[tokio::test]
    async fn keepalive_and_ack_never_published() {
        let d = dispatcher();
        let mut edge = d.bus().subscribe(groups::EDGE_CONTROLLER);
        let keepalive = Message::new().with_route("edged", "", "", operation::KEEPALIVE);
        let ack = Message::new()
            .with_route("edged", group::RESOURCE, "default/pod/web", operation::RESPONSE)
            .with_parent_id("m1");
        let mut svc = UpstreamService::new(d.clone());
        svc.ready().await.unwrap().call(InboundMessage::new(info(), keepalive)).await.unwrap();
        assert_eq!(d.dispatch_upstream(&info(), ack), UpstreamRoute::Ack);
        assert!(edge.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_subscriber_is_not_fatal() {
        let d = dispatcher();
        let msg = Message::new().with_route("edged", group::RESOURCE, "default/podstatus/web", operation::UPDATE);
        assert_eq!(d.dispatch_upstream(&info(), msg), UpstreamRoute::Controller(groups::EDGE_CONTROLLER));
    }
}
