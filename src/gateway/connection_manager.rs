use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warp::ws::{Message as WsMessage, WebSocket};

use crate::api::codec::JsonRpcCodec;
use crate::api::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, JSON_RPC_VERSION};
use crate::api::message::{Message, MessageBody};
use crate::config::{ConnectionManagerConfig, DonConfig};
use crate::crypto::{generate_random_bytes, normalize_address, public_key_to_address, recover_signer};
use crate::gateway::handler::{Don, Handler};
use crate::networking::handshake::{
    pack_challenge, unpack_auth_header, ChallengeElems, HandshakeError,
};
use crate::time::{within_tolerance, Clock};
use crate::{Error, Result};

pub type SessionSender = mpsc::UnboundedSender<std::result::Result<WsMessage, warp::Error>>;

struct NodeSession {
    id: u64,
    sender: SessionSender,
}

struct NodeState {
    name: String,
    address: String,
    session: Mutex<Option<NodeSession>>,
}

impl NodeState {
    fn lock(&self) -> MutexGuard<'_, Option<NodeSession>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Sessions of the members of one DON, and the handler their responses go to.
pub struct DonConnectionManager {
    don_config: DonConfig,
    codec: JsonRpcCodec,
    nodes: HashMap<String, NodeState>,
    handler: RwLock<Option<Arc<dyn Handler>>>,
    next_session_id: AtomicU64,
}

impl DonConnectionManager {
    fn new(don_config: DonConfig) -> Self {
        let nodes = don_config
            .members
            .iter()
            .map(|member| {
                (
                    normalize_address(&member.address),
                    NodeState {
                        name: member.name.clone(),
                        address: member.address.clone(),
                        session: Mutex::new(None),
                    },
                )
            })
            .collect();
        DonConnectionManager {
            don_config,
            codec: JsonRpcCodec,
            nodes,
            handler: RwLock::new(None),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn don_id(&self) -> &str {
        &self.don_config.don_id
    }

    pub fn don_config(&self) -> &DonConfig {
        &self.don_config
    }

    pub fn set_handler(&self, handler: Arc<dyn Handler>) {
        *self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handler);
    }

    pub fn handler(&self) -> Option<Arc<dyn Handler>> {
        self.handler
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_member(&self, node_address: &str) -> bool {
        self.nodes.contains_key(&normalize_address(node_address))
    }

    /// Addresses of the members with a live session, sorted.
    pub fn connected_nodes(&self) -> Vec<String> {
        let mut connected: Vec<String> = self
            .nodes
            .values()
            .filter(|node| node.lock().is_some())
            .map(|node| node.address.clone())
            .collect();
        connected.sort();
        connected
    }

    /// Make `sender` the session of `node_address`, replacing any previous session. Returns the
    /// session id to hand back to [`DonConnectionManager::detach_session`].
    pub fn attach_session(&self, node_address: &str, sender: SessionSender) -> Result<u64> {
        let node = self.node(node_address)?;
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let previous = node.lock().replace(NodeSession { id, sender });
        if previous.is_some() {
            info!(don_id = %self.don_id(), node = %node.name, "replacing existing node session");
        } else {
            info!(don_id = %self.don_id(), node = %node.name, "node connected");
        }
        Ok(id)
    }

    /// Drop session `session_id` unless it was replaced in the meantime.
    pub fn detach_session(&self, node_address: &str, session_id: u64) {
        if let Ok(node) = self.node(node_address) {
            let mut session = node.lock();
            if session.as_ref().map(|current| current.id) == Some(session_id) {
                session.take();
                info!(don_id = %self.don_id(), node = %node.name, "node disconnected");
            }
        }
    }

    /// Decode one frame from `node_address` and pass it to the DON's handler. Bad frames are
    /// logged and dropped, they never end the session.
    pub async fn handle_node_frame(&self, node_address: &str, data: &[u8]) {
        let response = match self.decode_node_frame(node_address, data) {
            Ok(response) => response,
            Err(err) => {
                warn!(don_id = %self.don_id(), node_address = %node_address, %err, "dropping node message");
                return;
            }
        };
        let handler = match self.handler() {
            Some(handler) => handler,
            None => {
                error!(don_id = %self.don_id(), "no handler registered for DON");
                return;
            }
        };
        let address = match self.node(node_address) {
            Ok(node) => node.address.clone(),
            Err(_) => return,
        };
        if let Err(err) = handler.handle_node_message(response, &address).await {
            error!(don_id = %self.don_id(), node_address = %node_address, %err, "error processing node message");
        }
    }

    fn decode_node_frame(&self, node_address: &str, data: &[u8]) -> Result<JsonRpcResponse> {
        let msg = self.codec.decode_response(data)?;
        if let Some(signer) = msg.validate()? {
            if normalize_address(&signer) != normalize_address(node_address) {
                return Err(Error::InvalidSignature(format!(
                    "message signed by {} on the session of {}",
                    signer, node_address
                )));
            }
        }
        if msg.body.don_id != self.don_config.don_id {
            return Err(Error::InvalidMessage(format!(
                "message for DON {} on a session of DON {}",
                msg.body.don_id, self.don_config.don_id
            )));
        }
        Ok(node_message_to_response(msg))
    }

    fn node(&self, node_address: &str) -> Result<&NodeState> {
        self.nodes
            .get(&normalize_address(node_address))
            .ok_or_else(|| Error::UnknownNode(node_address.to_string()))
    }
}

/// A node answers with its payload, or with `{"error": {"code": .., "message": ..}}`.
fn node_message_to_response(msg: Message) -> JsonRpcResponse {
    let MessageBody {
        message_id,
        method,
        payload,
        ..
    } = msg.body;
    let error = payload
        .get("error")
        .and_then(|error| serde_json::from_value::<JsonRpcError>(error.clone()).ok());
    match error {
        Some(error) => JsonRpcResponse {
            version: String::from(JSON_RPC_VERSION),
            id: message_id,
            method,
            result: None,
            error: Some(error),
        },
        None => JsonRpcResponse::success(&message_id, &method, payload),
    }
}

#[async_trait]
impl Don for DonConnectionManager {
    async fn send_to_node(&self, node_address: &str, request: &JsonRpcRequest) -> Result<()> {
        let node = self.node(node_address)?;
        let msg = Message::unsigned(MessageBody {
            message_id: request.id.clone(),
            method: request.method.clone(),
            don_id: self.don_config.don_id.clone(),
            receiver: node.address.clone(),
            payload: request.params.clone().unwrap_or(Value::Null),
            sender: String::new(),
        });
        let data = self.codec.encode_request(&msg)?;
        let session = node.lock();
        match session.as_ref() {
            Some(session) => session
                .sender
                .send(Ok(WsMessage::binary(data)))
                .map_err(|_| Error::NodeNotConnected(node_address.to_string())),
            None => Err(Error::NodeNotConnected(node_address.to_string())),
        }
    }
}

/// A node that proved it holds a DON member key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedNode {
    pub don_id: String,
    pub node_address: String,
}

struct HandshakeAttempt {
    node: AuthenticatedNode,
    challenge: Vec<u8>,
    started_at: Instant,
}

/// Server side of the node handshake, and the owner of every DON's node sessions.
pub struct ConnectionManager {
    config: ConnectionManagerConfig,
    clock: Arc<dyn Clock>,
    handshake_timeout: Duration,
    dons: HashMap<String, Arc<DonConnectionManager>>,
    attempts: Mutex<HashMap<String, HandshakeAttempt>>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionManagerConfig,
        dons: &[DonConfig],
        handshake_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut don_managers = HashMap::new();
        for don_config in dons {
            don_config.validate()?;
            let manager = Arc::new(DonConnectionManager::new(don_config.clone()));
            if don_managers
                .insert(don_config.don_id.clone(), manager)
                .is_some()
            {
                return Err(Error::InvalidConfig(format!(
                    "duplicate DON ID {}",
                    don_config.don_id
                )));
            }
        }
        Ok(ConnectionManager {
            config,
            clock,
            handshake_timeout,
            dons: don_managers,
            attempts: Mutex::new(HashMap::new()),
        })
    }

    pub fn don(&self, don_id: &str) -> Result<&Arc<DonConnectionManager>> {
        self.dons
            .get(don_id)
            .ok_or_else(|| Error::UnknownDon(don_id.to_string()))
    }

    pub fn don_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.dons.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Check a node's auth header and issue a challenge. Returns the attempt id the signed
    /// challenge must be presented with, and the challenge itself.
    pub fn start_handshake(&self, auth_header: &[u8]) -> Result<(String, Vec<u8>)> {
        let (elems, signed, signature) = unpack_auth_header(auth_header)?;
        if elems.gateway_id != self.config.auth_gateway_id {
            return Err(HandshakeError::InvalidGateway.into());
        }
        let now = self.clock.now_secs();
        if !within_tolerance(elems.timestamp, now, self.config.auth_timestamp_tolerance_sec) {
            return Err(HandshakeError::InvalidTimestamp.into());
        }
        let don = self.don(&elems.don_id)?;
        let signer =
            recover_signer(&[&signed], &signature).map_err(|_| HandshakeError::InvalidSigner)?;
        let node_address = public_key_to_address(&signer);
        if !don.is_member(&node_address) {
            return Err(HandshakeError::InvalidSigner.into());
        }

        let challenge = pack_challenge(&ChallengeElems {
            timestamp: now,
            gateway_id: self.config.auth_gateway_id.clone(),
            challenge_bytes: generate_random_bytes(self.config.auth_challenge_len),
        })?;
        let attempt_id = Uuid::new_v4().to_string();
        let started_at = Instant::now();
        let mut attempts = self.lock_attempts();
        let handshake_timeout = self.handshake_timeout;
        attempts.retain(|_, attempt| {
            started_at.saturating_duration_since(attempt.started_at) <= handshake_timeout
        });
        attempts.insert(
            attempt_id.clone(),
            HandshakeAttempt {
                node: AuthenticatedNode {
                    don_id: elems.don_id,
                    node_address,
                },
                challenge: challenge.clone(),
                started_at,
            },
        );
        debug!(attempt_id = %attempt_id, "issued handshake challenge");
        Ok((attempt_id, challenge))
    }

    /// Check the node's signature over the challenge of `attempt_id`. Every attempt can be
    /// finalized at most once.
    pub fn finalize_handshake(
        &self,
        attempt_id: &str,
        signed_challenge: &[u8],
    ) -> Result<AuthenticatedNode> {
        let attempt = self
            .lock_attempts()
            .remove(attempt_id)
            .ok_or(HandshakeError::UnknownAttempt)?;
        if attempt.started_at.elapsed() > self.handshake_timeout {
            return Err(Error::HandshakeTimeout(attempt.node.node_address));
        }
        let signer = recover_signer(&[&attempt.challenge], signed_challenge)
            .map_err(|_| HandshakeError::InvalidSigner)?;
        if normalize_address(&public_key_to_address(&signer))
            != normalize_address(&attempt.node.node_address)
        {
            return Err(HandshakeError::InvalidSigner.into());
        }
        Ok(attempt.node)
    }

    pub fn abandon_handshake(&self, attempt_id: &str) {
        self.lock_attempts().remove(attempt_id);
    }

    pub fn connected_nodes(&self, don_id: &str) -> Result<Vec<String>> {
        Ok(self.don(don_id)?.connected_nodes())
    }

    /// Drive one upgraded node websocket: wait for the signed challenge, then pump frames to
    /// the DON until the node goes away.
    pub async fn serve_node(self: Arc<Self>, attempt_id: String, ws: WebSocket) {
        let (mut ws_sink, mut ws_stream) = ws.split();
        let first_frame = match timeout(self.handshake_timeout, ws_stream.next()).await {
            Ok(Some(Ok(frame))) if frame.is_binary() => Some(frame.into_bytes()),
            _ => None,
        };
        let node = match first_frame {
            Some(data) => self.finalize_handshake(&attempt_id, &data),
            None => {
                self.abandon_handshake(&attempt_id);
                Err(HandshakeError::MissingChallenge.into())
            }
        };
        let node = match node {
            Ok(node) => node,
            Err(err) => {
                warn!(attempt_id = %attempt_id, %err, "node handshake failed");
                let _ = ws_sink.close().await;
                return;
            }
        };
        let don = match self.don(&node.don_id) {
            Ok(don) => don.clone(),
            Err(_) => return,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(
            UnboundedReceiverStream::new(receiver)
                .forward(ws_sink)
                .map(|result| {
                    if let Err(err) = result {
                        error!(%err, "error sending websocket message to node");
                    }
                }),
        );
        let session_id = match don.attach_session(&node.node_address, sender) {
            Ok(session_id) => session_id,
            Err(err) => {
                error!(%err, "failed to attach node session");
                return;
            }
        };

        while let Some(result) = ws_stream.next().await {
            match result {
                Ok(frame) if frame.is_binary() || frame.is_text() => {
                    don.handle_node_frame(&node.node_address, frame.as_bytes())
                        .await
                }
                Ok(frame) if frame.is_close() => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(node_address = %node.node_address, %err, "error receiving node message");
                    break;
                }
            }
        }
        don.detach_session(&node.node_address, session_id);
    }

    fn lock_attempts(&self) -> MutexGuard<'_, HashMap<String, HandshakeAttempt>> {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
