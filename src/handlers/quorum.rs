use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::aggregation::signer_set::{SignerSet, StaticSignerRegistry};
use crate::aggregation::{QuorumAggregator, QuorumAggregatorConfig, QuorumThreshold};
use crate::api::jsonrpc::{ErrorCode, JsonRpcRequest, JsonRpcResponse};
use crate::config::DonConfig;
use crate::gateway::handler::{
    send_to_user, validate_user_request, Don, Handler, UserCallback, UserCallbackPayload,
};
use crate::ratelimit::{RateLimiter, RateLimiterConfig};
use crate::service::StateMachine;
use crate::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct QuorumHandlerConfig {
    pub request_timeout_sec: u64,
    pub cleanup_period_ms: u64,
    /// node responses older than this stop counting toward a quorum
    pub response_max_age_ms: u64,
    pub response_threshold: QuorumThreshold,
    pub signature_threshold: QuorumThreshold,
    pub node_rate_limiter: RateLimiterConfig,
}

impl Default for QuorumHandlerConfig {
    fn default() -> Self {
        QuorumHandlerConfig {
            request_timeout_sec: 30,
            cleanup_period_ms: 5000,
            response_max_age_ms: 60_000,
            response_threshold: QuorumThreshold::default(),
            signature_threshold: QuorumThreshold::default(),
            node_rate_limiter: RateLimiterConfig::default(),
        }
    }
}

/// Answer a user request and record how it ended.
fn finish(request_id: &str, callback: UserCallback, payload: UserCallbackPayload) {
    info!(
        request_id = %request_id,
        outcome = payload.error_code.outcome(),
        error_code = %payload.error_code,
        "user request finished"
    );
    send_to_user(callback, payload);
}

struct ActiveRequestState {
    callback: Option<UserCallback>,
    responders: HashSet<String>,
}

/// A user request waiting for its nodes. The callback is taken exactly once, by whoever
/// resolves the request first.
struct ActiveRequest {
    request: JsonRpcRequest,
    created_at: Instant,
    state: Mutex<ActiveRequestState>,
}

impl ActiveRequest {
    fn new(request: JsonRpcRequest, callback: UserCallback, created_at: Instant) -> Self {
        ActiveRequest {
            request,
            created_at,
            state: Mutex::new(ActiveRequestState {
                callback: Some(callback),
                responders: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ActiveRequestState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Pending requests of one handler, shared with its sweeper task.
struct RequestCorrelator {
    request_timeout: Duration,
    aggregator: Arc<QuorumAggregator>,
    active_requests: RwLock<HashMap<String, Arc<ActiveRequest>>>,
}

impl RequestCorrelator {
    fn get(&self, request_id: &str) -> Option<Arc<ActiveRequest>> {
        self.read().get(request_id).cloned()
    }

    /// Answer `active` and forget it. Returns false if it had been answered already.
    fn resolve(&self, active: &ActiveRequest, payload: UserCallbackPayload) -> bool {
        let callback = active.lock().callback.take();
        let request_id = &active.request.id;
        {
            let mut requests = self.write();
            let same = requests
                .get(request_id)
                .map(|current| std::ptr::eq(current.as_ref(), active))
                .unwrap_or(false);
            if same {
                requests.remove(request_id);
            }
        }
        self.aggregator.remove_request(request_id);
        match callback {
            Some(callback) => {
                finish(request_id, callback, payload);
                true
            }
            None => false,
        }
    }

    fn remove_expired_requests(&self, now: Instant) -> usize {
        let expired: Vec<Arc<ActiveRequest>> = self
            .read()
            .values()
            .filter(|active| now.saturating_duration_since(active.created_at) > self.request_timeout)
            .cloned()
            .collect();
        let mut count = 0;
        for active in expired {
            let responders = active.lock().responders.len();
            debug!(request_id = %active.request.id, responders, "request expired");
            let payload = UserCallbackPayload::error(
                &active.request.id,
                ErrorCode::RequestTimeoutError,
                "request expired without getting enough responses",
            );
            if self.resolve(&active, payload) {
                count += 1;
            }
        }
        count
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ActiveRequest>>> {
        self.active_requests
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ActiveRequest>>> {
        self.active_requests
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Correlates user requests with node responses.
///
/// Each accepted request is sent to every DON member. Node responses are fed to a
/// [`QuorumAggregator`] and the first canonical response goes back to the user. Requests that do
/// not collect enough agreeing responses within `request_timeout_sec` are answered with a
/// timeout error by a background sweep.
pub struct QuorumHandler {
    state: StateMachine,
    don_config: DonConfig,
    config: QuorumHandlerConfig,
    don: Arc<dyn Don>,
    node_rate_limiter: RateLimiter,
    correlator: Arc<RequestCorrelator>,
    shutdown: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl QuorumHandler {
    pub fn new(config: QuorumHandlerConfig, don_config: DonConfig, don: Arc<dyn Don>) -> Result<Self> {
        if config.request_timeout_sec == 0 || config.cleanup_period_ms == 0 {
            return Err(Error::InvalidConfig(String::from(
                "request timeout and cleanup period must be positive",
            )));
        }
        let members = don_config.members.len();
        for (name, threshold) in [
            ("response", config.response_threshold),
            ("signature", config.signature_threshold),
        ] {
            let required = threshold.required(don_config.f);
            if required > members {
                return Err(Error::InvalidConfig(format!(
                    "{} threshold of {} exceeds the {} members of DON {}",
                    name, required, members, don_config.don_id
                )));
            }
        }
        let signer_set = SignerSet::from_members(don_config.f, &don_config.members)?;
        let aggregator = QuorumAggregator::new(
            QuorumAggregatorConfig {
                f: don_config.f,
                response_threshold: config.response_threshold,
                signature_threshold: config.signature_threshold,
                response_max_age: Duration::from_millis(config.response_max_age_ms),
                cleanup_period: Duration::from_millis(config.cleanup_period_ms),
            },
            Arc::new(StaticSignerRegistry::new(signer_set)),
        );
        let (shutdown, _) = watch::channel(false);
        Ok(QuorumHandler {
            state: StateMachine::new("QuorumHandler"),
            node_rate_limiter: RateLimiter::new(config.node_rate_limiter.clone())?,
            correlator: Arc::new(RequestCorrelator {
                request_timeout: Duration::from_secs(config.request_timeout_sec),
                aggregator: Arc::new(aggregator),
                active_requests: RwLock::new(HashMap::new()),
            }),
            config,
            don_config,
            don,
            shutdown,
            sweeper: Mutex::new(None),
        })
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.read().len()
    }

    /// Answer every request older than the timeout with a timeout error. Returns how many were
    /// expired.
    pub fn remove_expired_requests(&self, now: Instant) -> usize {
        self.correlator.remove_expired_requests(now)
    }

    async fn fan_out(&self, request: &JsonRpcRequest) -> Result<()> {
        let mut failures = 0;
        for member in &self.don_config.members {
            if let Err(err) = self.don.send_to_node(&member.address, request).await {
                failures += 1;
                error!(request_id = %request.id, node = %member.address, %err, "error sending request to node");
            }
        }
        if failures > 0 && failures == self.don_config.members.len() {
            return Err(Error::FanOutFailed);
        }
        debug!(request_id = %request.id, failures, "forwarded request to nodes");
        Ok(())
    }

    fn lock_sweeper(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Handler for QuorumHandler {
    async fn start(&self) -> Result<()> {
        self.state.try_start()?;
        info!(don_id = %self.don_config.don_id, "starting quorum handler");
        self.correlator.aggregator.start()?;

        let correlator = self.correlator.clone();
        let period = Duration::from_millis(self.config.cleanup_period_ms);
        let mut shutdown = self.shutdown.subscribe();
        let sweeper = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        correlator.remove_expired_requests(Instant::now());
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
        info!(don_id = %self.don_config.don_id, "closing quorum handler");
        self.shutdown.send_replace(true);
        let sweeper = self.lock_sweeper().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        let pending: Vec<Arc<ActiveRequest>> = self.correlator.read().values().cloned().collect();
        for active in pending {
            let payload = UserCallbackPayload::error(
                &active.request.id,
                ErrorCode::FatalError,
                "gateway is shutting down",
            );
            self.correlator.resolve(&active, payload);
        }
        self.correlator.aggregator.close().await
    }

    async fn handle_user_message(
        &self,
        request: JsonRpcRequest,
        callback: UserCallback,
    ) -> Result<()> {
        if let Err(err) = validate_user_request(&request) {
            finish(
                &request.id,
                callback,
                UserCallbackPayload::error(&request.id, ErrorCode::InvalidParamsError, &err.to_string()),
            );
            return Err(err);
        }
        debug!(request_id = %request.id, method = %request.method, "handling user request");

        let active = {
            let mut requests = self.correlator.write();
            if requests.contains_key(&request.id) {
                drop(requests);
                warn!(request_id = %request.id, "request ID already used");
                finish(
                    &request.id,
                    callback,
                    UserCallbackPayload::error(
                        &request.id,
                        ErrorCode::ConflictError,
                        "request ID already used",
                    ),
                );
                return Err(Error::RequestIdUsed(request.id));
            }
            let active = Arc::new(ActiveRequest::new(request, callback, Instant::now()));
            requests.insert(active.request.id.clone(), active.clone());
            active
        };

        if let Err(err) = self.fan_out(&active.request).await {
            self.correlator.resolve(
                &active,
                UserCallbackPayload::error(&active.request.id, ErrorCode::FatalError, &err.to_string()),
            );
            return Err(err);
        }
        Ok(())
    }

    async fn handle_node_message(
        &self,
        response: JsonRpcResponse,
        node_address: &str,
    ) -> Result<()> {
        if !self.node_rate_limiter.allow(node_address) {
            debug!(node_address = %node_address, request_id = %response.id, "node is rate limited");
            return Ok(());
        }
        let active = match self.correlator.get(&response.id) {
            Some(active) => active,
            None => {
                warn!(node_address = %node_address, request_id = %response.id, "no pending request found for ID");
                return Ok(());
            }
        };
        {
            let mut state = active.lock();
            if state.callback.is_none() {
                return Ok(());
            }
            state.responders.insert(node_address.to_string());
        }

        match self
            .correlator
            .aggregator
            .aggregate(&response.id, &response, node_address)
            .await
        {
            Ok(Some(canonical)) => {
                debug!(request_id = %response.id, "reached quorum for response");
                let payload = UserCallbackPayload::success(&canonical).unwrap_or_else(|err| {
                    error!(request_id = %response.id, %err, "failed to encode node response");
                    UserCallbackPayload::error(
                        &response.id,
                        ErrorCode::NodeResponseEncodingError,
                        &ErrorCode::NodeResponseEncodingError.to_string(),
                    )
                });
                self.correlator.resolve(&active, payload);
            }
            Ok(None) => {
                debug!(request_id = %response.id, node_address = %node_address, "not enough responses to reach quorum");
            }
            Err(err) => {
                error!(request_id = %response.id, %err, "error aggregating node responses");
                self.correlator.resolve(
                    &active,
                    UserCallbackPayload::error(
                        &response.id,
                        ErrorCode::HandlerError,
                        &ErrorCode::HandlerError.to_string(),
                    ),
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::signature::SignedResponse;
    use crate::crypto::Signer;
    use crate::keypair::Keypair;
    use crate::test_utilities::{don_config, MockDon};
    use serde_json::json;
    use tokio::sync::oneshot;

    fn handler(keys: &[Keypair], don: Arc<MockDon>) -> QuorumHandler {
        QuorumHandler::new(QuorumHandlerConfig::default(), don_config(1, keys), don).unwrap()
    }

    fn request(id: &str) -> JsonRpcRequest {
        JsonRpcRequest::new(id, "vault.get", Some(json!({"key": "k"})))
    }

    fn node_response(id: &str, value: i64) -> JsonRpcResponse {
        JsonRpcResponse::success(id, "vault.get", json!({ "value": value }))
    }

    fn decode(payload: &UserCallbackPayload) -> JsonRpcResponse {
        serde_json::from_slice(&payload.raw_response).unwrap()
    }

    #[tokio::test]
    async fn test_fan_out_and_quorum() {
        let keys: Vec<Keypair> = (0..4).map(|_| Keypair::new()).collect();
        let don = Arc::new(MockDon::default());
        let handler = handler(&keys, don.clone());
        let (callback, mut receiver) = oneshot::channel();

        handler.handle_user_message(request("1"), callback).await.unwrap();
        let sent = don.sent();
        assert_eq!(sent.len(), 4);
        for (member, (address, sent_request)) in keys.iter().zip(sent.iter()) {
            assert_eq!(address, &member.address());
            assert_eq!(sent_request, &request("1"));
        }

        handler
            .handle_node_message(node_response("1", 2), &keys[3].address())
            .await
            .unwrap();
        for key in &keys[..2] {
            handler
                .handle_node_message(node_response("1", 1), &key.address())
                .await
                .unwrap();
        }
        assert!(receiver.try_recv().is_err());
        handler
            .handle_node_message(node_response("1", 1), &keys[2].address())
            .await
            .unwrap();

        let payload = receiver.await.unwrap();
        assert_eq!(payload.error_code, ErrorCode::NoError);
        assert_eq!(decode(&payload), node_response("1", 1));
        assert_eq!(handler.pending_requests(), 0);

        // late responses for a finished request are ignored
        handler
            .handle_node_message(node_response("1", 1), &keys[3].address())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_signed_response_resolves_alone() {
        let keys: Vec<Keypair> = (0..4).map(|_| Keypair::new()).collect();
        let don = Arc::new(MockDon::default());
        let handler = handler(&keys, don);
        let (callback, receiver) = oneshot::channel();
        handler.handle_user_message(request("7"), callback).await.unwrap();

        let signers: Vec<&dyn Signer> = keys[..3].iter().map(|k| k as &dyn Signer).collect();
        let signed = SignedResponse::sign(json!({"secret": "s"}), vec![3u8; 64], &signers).unwrap();
        let response =
            JsonRpcResponse::success("7", "vault.get", serde_json::to_value(&signed).unwrap());
        handler
            .handle_node_message(response.clone(), &keys[0].address())
            .await
            .unwrap();
        assert_eq!(decode(&receiver.await.unwrap()), response);
    }

    #[tokio::test]
    async fn test_duplicate_request_id() {
        let keys: Vec<Keypair> = (0..4).map(|_| Keypair::new()).collect();
        let handler = handler(&keys, Arc::new(MockDon::default()));
        let (first, mut first_receiver) = oneshot::channel();
        handler.handle_user_message(request("1"), first).await.unwrap();

        let (second, second_receiver) = oneshot::channel();
        assert!(matches!(
            handler.handle_user_message(request("1"), second).await,
            Err(Error::RequestIdUsed(_))
        ));
        assert_eq!(second_receiver.await.unwrap().error_code, ErrorCode::ConflictError);
        // the original request is still pending
        assert!(first_receiver.try_recv().is_err());
        assert_eq!(handler.pending_requests(), 1);

        let (empty, empty_receiver) = oneshot::channel();
        assert!(matches!(
            handler.handle_user_message(request(""), empty).await,
            Err(Error::EmptyRequestId)
        ));
        assert_eq!(
            empty_receiver.await.unwrap().error_code,
            ErrorCode::InvalidParamsError
        );
    }

    #[tokio::test]
    async fn test_fan_out_failures() {
        let keys: Vec<Keypair> = (0..4).map(|_| Keypair::new()).collect();
        let don = Arc::new(MockDon::default());
        let handler = handler(&keys, don.clone());

        don.fail_for(&keys[0].address());
        let (callback, mut receiver) = oneshot::channel();
        handler.handle_user_message(request("partial"), callback).await.unwrap();
        assert!(receiver.try_recv().is_err());

        for key in &keys {
            don.fail_for(&key.address());
        }
        let (callback, receiver) = oneshot::channel();
        assert!(matches!(
            handler.handle_user_message(request("all"), callback).await,
            Err(Error::FanOutFailed)
        ));
        assert_eq!(receiver.await.unwrap().error_code, ErrorCode::FatalError);
        assert_eq!(handler.pending_requests(), 1);
    }

    #[tokio::test]
    async fn test_expired_requests_time_out_once() {
        let keys: Vec<Keypair> = (0..4).map(|_| Keypair::new()).collect();
        let handler = handler(&keys, Arc::new(MockDon::default()));
        let (callback, receiver) = oneshot::channel();
        handler.handle_user_message(request("slow"), callback).await.unwrap();
        handler
            .handle_node_message(node_response("slow", 1), &keys[0].address())
            .await
            .unwrap();

        let now = Instant::now();
        assert_eq!(handler.remove_expired_requests(now), 0);
        assert_eq!(handler.remove_expired_requests(now + Duration::from_secs(31)), 1);
        assert_eq!(handler.remove_expired_requests(now + Duration::from_secs(62)), 0);

        let payload = receiver.await.unwrap();
        assert_eq!(payload.error_code, ErrorCode::RequestTimeoutError);
        assert_eq!(decode(&payload).id, "slow");

        // responses arriving after expiry are stale
        for key in &keys[1..] {
            handler
                .handle_node_message(node_response("slow", 1), &key.address())
                .await
                .unwrap();
        }
        assert_eq!(handler.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_node_rate_limit_drops_responses() {
        let keys: Vec<Keypair> = (0..4).map(|_| Keypair::new()).collect();
        let mut config = QuorumHandlerConfig::default();
        config.response_threshold = QuorumThreshold::Fixed(2);
        config.node_rate_limiter = RateLimiterConfig {
            global_rps: 100.0,
            global_burst: 100,
            per_sender_rps: 0.001,
            per_sender_burst: 1,
        };
        let handler =
            QuorumHandler::new(config, don_config(1, &keys), Arc::new(MockDon::default())).unwrap();

        let (callback, mut receiver) = oneshot::channel();
        handler.handle_user_message(request("a"), callback).await.unwrap();
        handler
            .handle_node_message(node_response("zzz", 1), &keys[0].address())
            .await
            .unwrap();
        // keys[0] spent its only token on the stale response above
        handler
            .handle_node_message(node_response("a", 1), &keys[0].address())
            .await
            .unwrap();
        handler
            .handle_node_message(node_response("a", 1), &keys[1].address())
            .await
            .unwrap();
        assert!(receiver.try_recv().is_err());
        handler
            .handle_node_message(node_response("a", 1), &keys[2].address())
            .await
            .unwrap();
        assert_eq!(receiver.await.unwrap().error_code, ErrorCode::NoError);
    }

    #[tokio::test]
    async fn test_close_answers_pending_requests() {
        let keys: Vec<Keypair> = (0..4).map(|_| Keypair::new()).collect();
        let handler = handler(&keys, Arc::new(MockDon::default()));
        handler.start().await.unwrap();
        let (callback, receiver) = oneshot::channel();
        handler.handle_user_message(request("1"), callback).await.unwrap();
        handler.close().await.unwrap();
        assert_eq!(receiver.await.unwrap().error_code, ErrorCode::FatalError);
        assert!(matches!(handler.close().await, Err(Error::AlreadyStopped(_))));
    }

    #[test]
    fn test_config_defaults() {
        let config: QuorumHandlerConfig =
            crate::handlers::decode_handler_config(&json!({"request_timeout_sec": 5})).unwrap();
        assert_eq!(config.request_timeout_sec, 5);
        assert_eq!(config.cleanup_period_ms, 5000);
        assert_eq!(config.response_threshold, QuorumThreshold::TwoFPlusOne);
        let config: QuorumHandlerConfig =
            crate::handlers::decode_handler_config(&serde_json::Value::Null).unwrap();
        assert_eq!(config, QuorumHandlerConfig::default());
    }

    #[tokio::test]
    async fn test_oversized_request_rejected_before_fan_out() {
        let keys: Vec<Keypair> = (0..4).map(|_| Keypair::new()).collect();
        let don = Arc::new(MockDon::default());
        let handler = handler(&keys, don.clone());

        let (callback, receiver) = oneshot::channel();
        let long_id = "i".repeat(200);
        assert!(matches!(
            handler.handle_user_message(request(&long_id), callback).await,
            Err(Error::InvalidMessage(_))
        ));
        assert_eq!(receiver.await.unwrap().error_code, ErrorCode::InvalidParamsError);

        let (callback, receiver) = oneshot::channel();
        let long_method = JsonRpcRequest::new("2", &"m".repeat(65), None);
        assert!(handler.handle_user_message(long_method, callback).await.is_err());
        assert_eq!(receiver.await.unwrap().error_code, ErrorCode::InvalidParamsError);

        assert!(don.sent().is_empty());
        assert_eq!(handler.pending_requests(), 0);
    }

    #[test]
    fn test_threshold_above_member_count_rejected() {
        let keys: Vec<Keypair> = (0..4).map(|_| Keypair::new()).collect();
        let mut config = QuorumHandlerConfig::default();
        config.response_threshold = QuorumThreshold::Fixed(5);
        assert!(matches!(
            QuorumHandler::new(config, don_config(1, &keys), Arc::new(MockDon::default())),
            Err(Error::InvalidConfig(_))
        ));

        let mut config = QuorumHandlerConfig::default();
        config.signature_threshold = QuorumThreshold::Fixed(4);
        assert!(QuorumHandler::new(config, don_config(1, &keys), Arc::new(MockDon::default())).is_ok());

        // 2f+1 = 3 cannot be met by two members
        assert!(matches!(
            QuorumHandler::new(
                QuorumHandlerConfig::default(),
                don_config(1, &keys[..2]),
                Arc::new(MockDon::default())
            ),
            Err(Error::InvalidConfig(_))
        ));
    }
}
