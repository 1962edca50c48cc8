//! Which downstream messages need an acknowledgement.

use crate::message::{group, operation, resource_type, source, Message, MESSAGE_OK};
use serde_json::Value;

/// Resource substrings whose messages are fire-and-forget.
const NO_ACK_RESOURCES: [&str; 4] = [
    resource_type::POD_LIST,
    resource_type::MEMBERSHIP,
    resource_type::TWIN_CLOUD_UPDATED,
    resource_type::SERVICE_ACCOUNT_TOKEN,
];

/// Whether `msg` can be written once without waiting for the node to confirm it.
///
/// A response is only forced onto the no-ack side when its content is exactly `"OK"`; any
/// other response is judged by the remaining rules like an ordinary message.
pub fn no_ack_required(msg: &Message) -> bool {
    let resource = msg.resource();
    if NO_ACK_RESOURCES.iter().any(|r| resource.contains(r)) {
        return true;
    }
    if operation::is_volume(msg.operation())
        || msg.operation() == operation::APPLICATION_RESPONSE
        || msg.group() == group::USER
        || msg.source() == source::NODE_UPGRADE_CONTROLLER
    {
        return true;
    }
    if msg.operation() == operation::RESPONSE && msg.content == Value::String(MESSAGE_OK.into()) {
        return true;
    }
    msg.source() == source::EDGE_CONTROLLER
        && matches!(
            msg.resource_type(),
            resource_type::NODE
                | resource_type::LEASE
                | resource_type::NODE_PATCH
                | resource_type::POD_PATCH
                | resource_type::POD_STATUS
        )
}
