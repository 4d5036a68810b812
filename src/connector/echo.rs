use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, error};

use super::{GatewayConnector, GatewayConnectorHandler};
use crate::api::message::{Message, MessageBody};

/// A stand-in capability that answers every request with its own payload, signed by the node.
///
/// Holds a weak reference so the connector's handler table does not keep the connector alive.
pub struct EchoHandler {
    connector: Weak<GatewayConnector>,
}

impl EchoHandler {
    pub fn new(connector: &Arc<GatewayConnector>) -> Self {
        EchoHandler {
            connector: Arc::downgrade(connector),
        }
    }
}

#[async_trait]
impl GatewayConnectorHandler for EchoHandler {
    async fn handle_gateway_message(&self, gateway_id: &str, msg: Message) {
        let connector = match self.connector.upgrade() {
            Some(connector) => connector,
            None => return,
        };
        debug!(gateway_id = %gateway_id, message_id = %msg.body.message_id, "echoing request");
        let body = MessageBody {
            message_id: msg.body.message_id,
            method: msg.body.method,
            don_id: msg.body.don_id,
            receiver: msg.body.sender,
            payload: msg.body.payload,
            sender: String::new(),
        };
        if let Err(err) = connector.sign_and_send_to_gateway(gateway_id, body).await {
            error!(gateway_id = %gateway_id, %err, "failed to echo request");
        }
    }
}
