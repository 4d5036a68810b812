use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::api::jsonrpc::{ErrorCode, JsonRpcRequest, JsonRpcResponse};
use crate::config::DonConfig;
use crate::gateway::handler::{
    send_to_user, validate_user_request, Don, Handler, UserCallback, UserCallbackPayload,
};
use crate::service::StateMachine;
use crate::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DummyHandlerConfig {
    pub request_timeout_sec: u64,
    pub cleanup_period_ms: u64,
}

impl Default for DummyHandlerConfig {
    fn default() -> Self {
        DummyHandlerConfig {
            request_timeout_sec: 30,
            cleanup_period_ms: 5000,
        }
    }
}

struct PendingRequest {
    callback: UserCallback,
    created_at: Instant,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingRequest>>>;

/// Answer expired requests with a timeout and forget requests whose user went away.
async fn remove_expired(pending: &PendingMap, request_timeout: Duration, now: Instant) -> usize {
    let expired: Vec<(String, PendingRequest)> = {
        let mut pending = pending.lock().await;
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| {
                entry.callback.is_closed()
                    || now.saturating_duration_since(entry.created_at) > request_timeout
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
            .collect()
    };
    let count = expired.len();
    for (id, entry) in expired {
        debug!(request_id = %id, "request expired");
        send_to_user(
            entry.callback,
            UserCallbackPayload::error(&id, ErrorCode::RequestTimeoutError, "request expired without a node response"),
        );
    }
    count
}

/// Sends every request to all members and answers with whichever response comes back first.
/// No agreement is checked, so it is only meant for testing a deployment end to end.
pub struct DummyHandler {
    state: StateMachine,
    config: DummyHandlerConfig,
    don_config: DonConfig,
    don: Arc<dyn Don>,
    pending_lock: PendingMap,
    shutdown: watch::Sender<bool>,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DummyHandler {
    pub fn new(config: DummyHandlerConfig, don_config: DonConfig, don: Arc<dyn Don>) -> Result<Self> {
        if config.request_timeout_sec == 0 || config.cleanup_period_ms == 0 {
            return Err(Error::InvalidConfig(String::from(
                "request_timeout_sec and cleanup_period_ms must be positive",
            )));
        }
        let (shutdown, _) = watch::channel(false);
        Ok(DummyHandler {
            state: StateMachine::new("DummyHandler"),
            config,
            don_config,
            don,
            pending_lock: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
            sweeper: std::sync::Mutex::new(None),
        })
    }

    pub async fn pending_requests(&self) -> usize {
        self.pending_lock.lock().await.len()
    }

    pub async fn remove_expired_requests(&self, now: Instant) -> usize {
        remove_expired(&self.pending_lock, self.request_timeout(), now).await
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_sec)
    }

    fn lock_sweeper(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Handler for DummyHandler {
    async fn start(&self) -> Result<()> {
        self.state.try_start()?;
        info!(don_id = %self.don_config.don_id, "starting dummy handler");
        let pending = self.pending_lock.clone();
        let request_timeout = self.request_timeout();
        let period = Duration::from_millis(self.config.cleanup_period_ms);
        let mut shutdown = self.shutdown.subscribe();
        let sweeper = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        remove_expired(&pending, request_timeout, Instant::now()).await;
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
        *self.lock_sweeper() = Some(sweeper);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.try_stop()?;
        info!(don_id = %self.don_config.don_id, "closing dummy handler");
        self.shutdown.send_replace(true);
        let sweeper = self.lock_sweeper().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        let pending: Vec<(String, PendingRequest)> = self.pending_lock.lock().await.drain().collect();
        for (id, entry) in pending {
            send_to_user(
                entry.callback,
                UserCallbackPayload::error(&id, ErrorCode::FatalError, "gateway is shutting down"),
            );
        }
        Ok(())
    }

    async fn handle_user_message(
        &self,
        request: JsonRpcRequest,
        callback: UserCallback,
    ) -> Result<()> {
        if let Err(err) = validate_user_request(&request) {
            send_to_user(
                callback,
                UserCallbackPayload::error(&request.id, ErrorCode::InvalidParamsError, &err.to_string()),
            );
            return Err(err);
        }
        {
            let mut pending = self.pending_lock.lock().await;
            if pending.contains_key(&request.id) {
                drop(pending);
                send_to_user(
                    callback,
                    UserCallbackPayload::error(&request.id, ErrorCode::ConflictError, "request ID already used"),
                );
                return Err(Error::RequestIdUsed(request.id));
            }
            pending.insert(
                request.id.clone(),
                PendingRequest {
                    callback,
                    created_at: Instant::now(),
                },
            );
        }

        let mut failures = 0;
        for member in &self.don_config.members {
            if let Err(err) = self.don.send_to_node(&member.address, &request).await {
                failures += 1;
                warn!(node = %member.address, %err, "error sending request to node");
            }
        }
        if failures == self.don_config.members.len() {
            if let Some(entry) = self.pending_lock.lock().await.remove(&request.id) {
                send_to_user(
                    entry.callback,
                    UserCallbackPayload::error(&request.id, ErrorCode::FatalError, "failed to forward user request to nodes"),
                );
            }
            return Err(Error::FanOutFailed);
        }
        Ok(())
    }

    async fn handle_node_message(
        &self,
        response: JsonRpcResponse,
        node_address: &str,
    ) -> Result<()> {
        let entry = self.pending_lock.lock().await.remove(&response.id);
        match entry {
            Some(entry) => {
                debug!(request_id = %response.id, node_address = %node_address, "first response wins");
                let payload = UserCallbackPayload::success(&response)?;
                send_to_user(entry.callback, payload);
            }
            None => debug!(request_id = %response.id, "ignoring response for finished request"),
        }
        Ok(())
    }
}
