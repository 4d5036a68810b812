//! Node side of the gateway transport.
//!
//! A [`GatewayConnector`] keeps one authenticated websocket session open to every configured
//! Gateway, redialing with backoff whenever a session drops, and hands each inbound request to
//! the [`GatewayConnectorHandler`] registered for its method.

pub mod echo;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, event, info, warn, Level};
use url::Url;

use crate::api::codec::JsonRpcCodec;
use crate::api::message::{Message, MessageBody};
use crate::config::{ConnectorConfig, ConnectorGatewayConfig};
use crate::crypto::{normalize_address, public_key_to_address, Signer};
use crate::networking::backoff::RedialBackoff;
use crate::networking::client::{ConnectionInitiator, WebSocketClient};
use crate::networking::connection::ConnectionWrapper;
use crate::networking::handshake::{
    pack_auth_header, unpack_challenge, AuthHeaderElems, HandshakeError,
};
use crate::service::{ServiceState, StateMachine};
use crate::time::{within_tolerance, Clock};
use crate::{Error, Result};

/// A node capability reachable through the Gateway.
#[async_trait]
pub trait GatewayConnectorHandler: Send + Sync {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn handle_gateway_message(&self, gateway_id: &str, msg: Message);
}

struct GatewayState {
    config: ConnectorGatewayConfig,
    url: Url,
    conn: ConnectionWrapper,
    // true while a session is up
    ready: watch::Sender<bool>,
}

pub struct GatewayConnector {
    state: StateMachine,
    config: ConnectorConfig,
    codec: JsonRpcCodec,
    clock: Arc<dyn Clock>,
    signer: Arc<dyn Signer>,
    node_address: String,
    handlers_lock: RwLock<HashMap<String, Arc<dyn GatewayConnectorHandler>>>,
    gateways: HashMap<String, Arc<GatewayState>>,
    url_to_id: HashMap<String, String>,
    ws_client: WebSocketClient,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayConnector {
    pub fn new(
        config: ConnectorConfig,
        signer: Arc<dyn Signer>,
        clock: Arc<dyn Clock>,
    ) -> Result<GatewayConnector> {
        config.validate()?;

        let node_address = public_key_to_address(&signer.public_key());
        if !config.node_address.is_empty()
            && normalize_address(&config.node_address) != normalize_address(&node_address)
        {
            return Err(Error::InvalidConfig(format!(
                "node address {} does not match signer {}",
                config.node_address, node_address
            )));
        }

        let mut gateways = HashMap::new();
        let mut url_to_id = HashMap::new();
        for gateway_config in &config.gateways {
            let url = Url::parse(&gateway_config.url)?;
            url_to_id.insert(url.to_string(), gateway_config.id.clone());
            let (ready, _) = watch::channel(false);
            gateways.insert(
                gateway_config.id.clone(),
                Arc::new(GatewayState {
                    config: gateway_config.clone(),
                    conn: ConnectionWrapper::new(url.as_str()),
                    url,
                    ready,
                }),
            );
        }

        let (shutdown, _) = watch::channel(false);
        Ok(GatewayConnector {
            state: StateMachine::new("GatewayConnector"),
            ws_client: WebSocketClient::new(config.ws_client),
            config,
            codec: JsonRpcCodec,
            clock,
            signer,
            node_address,
            handlers_lock: RwLock::new(HashMap::new()),
            gateways,
            url_to_id,
            shutdown,
            tasks: Mutex::new(vec![]),
        })
    }

    /// Register `handler` for every method in `methods`. Nothing is registered if any of the
    /// methods is already taken.
    pub async fn add_handler(
        &self,
        methods: &[&str],
        handler: Arc<dyn GatewayConnectorHandler>,
    ) -> Result<()> {
        if methods.is_empty() {
            return Err(Error::NoMethods);
        }
        let mut handlers = self.handlers_lock.write().await;
        for method in methods {
            if handlers.contains_key(*method) {
                return Err(Error::HandlerExists(method.to_string()));
            }
        }
        for method in methods {
            handlers.insert(method.to_string(), handler.clone());
        }
        Ok(())
    }

    /// Wait until the session to `gateway_id` is up. Fails with [`Error::Cancelled`] if the
    /// connector is closed first.
    pub async fn await_connection(&self, gateway_id: &str) -> Result<()> {
        let gateway = self.gateway(gateway_id)?;
        let mut ready = gateway.ready.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                return Err(Error::Cancelled);
            }
            if *ready.borrow() {
                return Ok(());
            }
            tokio::select! {
                res = ready.changed() => {
                    if res.is_err() {
                        return Err(Error::Cancelled);
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
    }

    pub async fn send_to_gateway(&self, gateway_id: &str, msg: &Message) -> Result<()> {
        let gateway = self.gateway(gateway_id)?;
        if self.state.state() != ServiceState::Started {
            return Err(Error::NotStarted);
        }
        let data = self.codec.encode_response(msg)?;
        gateway.conn.write(data).await
    }

    /// Sign `body` with the node key, stamp the node address as sender and send it. Not retried.
    pub async fn sign_and_send_to_gateway(&self, gateway_id: &str, body: MessageBody) -> Result<()> {
        let msg = Message::sign(body, self.signer.as_ref())?;
        self.send_to_gateway(gateway_id, &msg).await.map_err(|err| {
            warn!(gateway_id = %gateway_id, %err, "failed to send message to gateway");
            err
        })
    }

    pub fn gateway_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.gateways.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn don_id(&self) -> &str {
        &self.config.don_id
    }

    pub fn node_address(&self) -> &str {
        &self.node_address
    }

    pub fn state(&self) -> ServiceState {
        self.state.state()
    }

    /// Spawn a read loop and a reconnect loop per gateway and start the registered handlers.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.state.try_start()?;
        info!(don_id = %self.config.don_id, "starting gateway connector");

        let handlers = self.unique_handlers().await;
        for handler in handlers {
            handler.start().await?;
        }

        let mut tasks = vec![];
        for gateway in self.gateways.values() {
            let read_channel = gateway.conn.take_read_channel().ok_or_else(|| {
                Error::InvalidConfig(format!("read channel for {} already taken", gateway.url))
            })?;
            tasks.push(tokio::spawn(
                self.clone().read_loop(gateway.clone(), read_channel),
            ));
            tasks.push(tokio::spawn(self.clone().reconnect_loop(gateway.clone())));
        }
        self.lock_tasks().extend(tasks);
        Ok(())
    }

    /// Stop every loop, close the sessions and the handlers. Waits for the loops to exit.
    pub async fn close(&self) -> Result<()> {
        self.state.try_stop()?;
        info!(don_id = %self.config.don_id, "closing gateway connector");
        self.shutdown.send_replace(true);

        let mut first_err = None;
        for gateway in self.gateways.values() {
            if let Err(err) = gateway.conn.close().await {
                first_err.get_or_insert(err);
            }
            gateway.ready.send_replace(false);
        }

        let tasks: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        for handler in self.unique_handlers().await {
            if let Err(err) = handler.close().await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn gateway(&self, gateway_id: &str) -> Result<&Arc<GatewayState>> {
        self.gateways
            .get(gateway_id)
            .ok_or_else(|| Error::UnknownGateway(gateway_id.to_string()))
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn unique_handlers(&self) -> Vec<Arc<dyn GatewayConnectorHandler>> {
        let handlers = self.handlers_lock.read().await;
        let mut unique: Vec<Arc<dyn GatewayConnectorHandler>> = vec![];
        for handler in handlers.values() {
            if !unique.iter().any(|seen| Arc::ptr_eq(seen, handler)) {
                unique.push(handler.clone());
            }
        }
        unique
    }

    async fn read_loop(
        self: Arc<Self>,
        gateway: Arc<GatewayState>,
        mut read_channel: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => return,
                item = read_channel.recv() => match item {
                    Some(data) => self.handle_frame(&gateway.config.id, &data).await,
                    None => return,
                },
            }
        }
    }

    async fn handle_frame(&self, gateway_id: &str, data: &[u8]) {
        let msg = match self.codec.decode_request(data) {
            Ok(msg) => msg,
            Err(err) => {
                error!(gateway_id = %gateway_id, %err, "parse error when reading from gateway");
                return;
            }
        };
        if let Err(err) = msg.validate() {
            error!(gateway_id = %gateway_id, %err, "failed to validate message signature");
            return;
        }
        let handler = self
            .handlers_lock
            .read()
            .await
            .get(&msg.body.method)
            .cloned();
        match handler {
            Some(handler) => handler.handle_gateway_message(gateway_id, msg).await,
            None => {
                error!(gateway_id = %gateway_id, method = %msg.body.method, "no handler for method")
            }
        }
    }

    async fn reconnect_loop(self: Arc<Self>, gateway: Arc<GatewayState>) {
        let mut backoff = RedialBackoff::default();
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                return;
            }
            let connect_result = tokio::select! {
                _ = shutdown.changed() => return,
                res = self.ws_client.connect(self.as_ref(), &gateway.url) => res,
            };
            match connect_result {
                Ok(stream) => {
                    event!(Level::INFO, url = %gateway.url, "connected successfully");
                    let closed = gateway.conn.reset(stream).await;
                    gateway.ready.send_replace(true);
                    tokio::select! {
                        _ = closed => {}
                        _ = shutdown.changed() => {}
                    }
                    gateway.ready.send_replace(false);
                    gateway.conn.disconnect().await;
                    info!(url = %gateway.url, "connection closed");
                    backoff.reset();
                }
                Err(err) => {
                    error!(url = %gateway.url, %err, "connection error");
                }
            }
            if *shutdown.borrow() {
                return;
            }
            let delay = backoff.next_delay();
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = sleep(delay) => debug!(url = %gateway.url, ?delay, "reconnecting ..."),
            }
        }
    }

    fn gateway_id_for_url(&self, url: &Url) -> Result<&String> {
        self.url_to_id
            .get(url.as_str())
            .ok_or_else(|| HandshakeError::InvalidGateway.into())
    }
}

impl ConnectionInitiator for GatewayConnector {
    fn new_auth_header(&self, url: &Url) -> Result<Vec<u8>> {
        let gateway_id = self.gateway_id_for_url(url)?;
        let mut auth_header = pack_auth_header(&AuthHeaderElems {
            timestamp: self.clock.now_secs(),
            don_id: self.config.don_id.clone(),
            gateway_id: gateway_id.clone(),
        })?;
        let signature = self.signer.sign(&[&auth_header])?;
        auth_header.extend(&signature);
        Ok(auth_header)
    }

    fn challenge_response(&self, url: &Url, challenge: &[u8]) -> Result<Vec<u8>> {
        let elems = unpack_challenge(challenge)?;
        if elems.challenge_bytes.len() < self.config.auth_min_challenge_len {
            return Err(HandshakeError::ChallengeTooShort.into());
        }
        let gateway_id = self.gateway_id_for_url(url)?;
        if &elems.gateway_id != gateway_id {
            return Err(HandshakeError::InvalidGateway.into());
        }
        if !within_tolerance(
            elems.timestamp,
            self.clock.now_secs(),
            self.config.auth_timestamp_tolerance_sec,
        ) {
            return Err(HandshakeError::InvalidTimestamp.into());
        }
        Ok(self.signer.sign(&[challenge])?.to_vec())
    }
}
