use async_trait::async_trait;
use std::borrow::Borrow;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::api::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::api::message::Message;
use crate::config::{DonConfig, DonMemberConfig, HandlerConfig};
use crate::connector::GatewayConnectorHandler;
use crate::gateway::handler::{send_to_user, Don, Handler, UserCallback, UserCallbackPayload};
use crate::keypair::Keypair;
use crate::{Error, Result};

#[ctor::ctor]
fn init_tests() {
    // capture tracing output in tests, filtered by RUST_LOG
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A DON called `don_1` whose members are the given keys, with one quorum handler named `vault`.
pub fn don_config<K: Borrow<Keypair>>(f: usize, keys: &[K]) -> DonConfig {
    DonConfig {
        don_id: String::from("don_1"),
        f,
        members: keys
            .iter()
            .enumerate()
            .map(|(i, key)| DonMemberConfig {
                name: format!("node_{}", i),
                address: key.borrow().address(),
                signer: None,
            })
            .collect(),
        handlers: vec![HandlerConfig {
            name: String::from("vault"),
            handler_type: String::from("quorum"),
            config: serde_json::Value::Null,
        }],
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

/// Node side handler that queues every message it is given.
pub struct RecordingConnectorHandler {
    sender: mpsc::UnboundedSender<(String, Message)>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<(String, Message)>>,
}

impl Default for RecordingConnectorHandler {
    fn default() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        RecordingConnectorHandler {
            sender,
            receiver: AsyncMutex::new(receiver),
        }
    }
}

impl RecordingConnectorHandler {
    /// Wait for the next `(gateway_id, message)` pair.
    pub async fn next(&self) -> (String, Message) {
        self.receiver.lock().await.recv().await.unwrap()
    }
}

#[async_trait]
impl GatewayConnectorHandler for RecordingConnectorHandler {
    async fn handle_gateway_message(&self, gateway_id: &str, msg: Message) {
        let _ = self.sender.send((gateway_id.to_string(), msg));
    }
}

/// Gateway side handler that records what it sees. By default every user request is answered
/// at once with its own params as the result.
#[derive(Default)]
pub struct RecordingHandler {
    silent: bool,
    fail_start: bool,
    started: Mutex<bool>,
    closed: Mutex<bool>,
    user_methods: Mutex<Vec<String>>,
    node_messages: Mutex<Vec<(JsonRpcResponse, String)>>,
    // callbacks held back by a silent handler
    held: Mutex<Vec<UserCallback>>,
}

impl RecordingHandler {
    /// Never answers user requests.
    pub fn silent() -> Self {
        RecordingHandler {
            silent: true,
            ..Default::default()
        }
    }

    pub fn failing_start() -> Self {
        RecordingHandler {
            fail_start: true,
            ..Default::default()
        }
    }

    pub fn user_methods(&self) -> Vec<String> {
        lock(&self.user_methods).clone()
    }

    pub fn node_methods(&self) -> Vec<String> {
        lock(&self.node_messages)
            .iter()
            .map(|(response, _)| response.method.clone())
            .collect()
    }

    pub fn node_messages(&self) -> Vec<(JsonRpcResponse, String)> {
        lock(&self.node_messages).clone()
    }

    pub fn started(&self) -> bool {
        *lock(&self.started)
    }

    pub fn closed(&self) -> bool {
        *lock(&self.closed)
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn start(&self) -> Result<()> {
        if self.fail_start {
            return Err(Error::InvalidConfig(String::from("refusing to start")));
        }
        *lock(&self.started) = true;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *lock(&self.closed) = true;
        Ok(())
    }

    async fn handle_user_message(&self, request: JsonRpcRequest, callback: UserCallback) -> Result<()> {
        lock(&self.user_methods).push(request.method.clone());
        if self.silent {
            lock(&self.held).push(callback);
            return Ok(());
        }
        let response = JsonRpcResponse::success(
            &request.id,
            &request.method,
            request.params.unwrap_or(serde_json::Value::Null),
        );
        send_to_user(callback, UserCallbackPayload::success(&response)?);
        Ok(())
    }

    async fn handle_node_message(&self, response: JsonRpcResponse, node_address: &str) -> Result<()> {
        lock(&self.node_messages).push((response, node_address.to_string()));
        Ok(())
    }
}

/// Records what would have gone out to the nodes.
#[derive(Default)]
pub struct MockDon {
    sent: Mutex<Vec<(String, JsonRpcRequest)>>,
    failing: Mutex<HashSet<String>>,
}

impl MockDon {
    pub fn sent(&self) -> Vec<(String, JsonRpcRequest)> {
        lock(&self.sent).clone()
    }

    /// Make every send to `node_address` fail from now on.
    pub fn fail_for(&self, node_address: &str) {
        lock(&self.failing).insert(node_address.to_string());
    }
}

#[async_trait]
impl Don for MockDon {
    async fn send_to_node(&self, node_address: &str, request: &JsonRpcRequest) -> Result<()> {
        if lock(&self.failing).contains(node_address) {
            return Err(Error::NodeNotConnected(node_address.to_string()));
        }
        lock(&self.sent).push((node_address.to_string(), request.clone()));
        Ok(())
    }
}
