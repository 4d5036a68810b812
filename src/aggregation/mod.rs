//! Deciding when enough DON members agree on a response.
//!
//! [`QuorumAggregator`] first tries to validate a response as a signed report
//! ([`signature::validate_signatures`]); when that is not possible it falls back to counting
//! identical responses ([`identical::IdenticalResponseAggregator`]).

pub mod identical;
pub mod signature;
pub mod signer_set;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

use crate::api::jsonrpc::JsonRpcResponse;
use crate::service::StateMachine;
use crate::Result;

use identical::IdenticalResponseAggregator;
use signature::{validate_signatures, SignedResponse};
use signer_set::SignerRegistry;

/// How many distinct members must back a response, in terms of the DON's `f`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuorumThreshold {
    FPlusOne,
    TwoFPlusOne,
    Fixed(usize),
}

impl QuorumThreshold {
    pub fn required(&self, f: usize) -> usize {
        match self {
            QuorumThreshold::FPlusOne => f + 1,
            QuorumThreshold::TwoFPlusOne => 2 * f + 1,
            QuorumThreshold::Fixed(count) => (*count).max(1),
        }
    }
}

impl Default for QuorumThreshold {
    fn default() -> Self {
        QuorumThreshold::TwoFPlusOne
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuorumAggregatorConfig {
    pub f: usize,
    pub response_threshold: QuorumThreshold,
    pub signature_threshold: QuorumThreshold,
    pub response_max_age: Duration,
    pub cleanup_period: Duration,
}

pub struct QuorumAggregator {
    state: StateMachine,
    config: QuorumAggregatorConfig,
    registry: Arc<dyn SignerRegistry>,
    identical: IdenticalResponseAggregator,
    shutdown: watch::Sender<bool>,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl QuorumAggregator {
    pub fn new(config: QuorumAggregatorConfig, registry: Arc<dyn SignerRegistry>) -> Self {
        let (shutdown, _) = watch::channel(false);
        QuorumAggregator {
            state: StateMachine::new("QuorumAggregator"),
            identical: IdenticalResponseAggregator::new(
                config.response_threshold.required(config.f),
                config.response_max_age,
            ),
            config,
            registry,
            shutdown,
            reaper: std::sync::Mutex::new(None),
        }
    }

    /// Feed one node response for `request_id`.
    ///
    /// Returns the canonical response as soon as either enough valid signatures back it, or
    /// enough nodes reported the same thing. `Ok(None)` means "not yet".
    pub async fn aggregate(
        &self,
        request_id: &str,
        response: &JsonRpcResponse,
        node_address: &str,
    ) -> Result<Option<JsonRpcResponse>> {
        if let Some(signed) = SignedResponse::from_response(response) {
            let signer_set = self.registry.signer_set().await?;
            if signer_set.is_empty() {
                debug!(request_id = %request_id, "no signers known, falling back to quorum");
            } else {
                let required = self.config.signature_threshold.required(signer_set.f());
                match validate_signatures(&signed, &signer_set, required) {
                    Ok(valid) => {
                        debug!(request_id = %request_id, valid, "signed response accepted");
                        return Ok(Some(response.clone()));
                    }
                    Err(err) => {
                        debug!(request_id = %request_id, %err, "failed to validate signatures, falling back to quorum")
                    }
                }
            }
        }
        self.identical.collect(request_id, response, node_address)
    }

    /// Forget everything collected for `request_id`.
    pub fn remove_request(&self, request_id: &str) {
        self.identical.remove_request(request_id);
    }

    pub fn reap_expired(&self, now: Instant) -> usize {
        self.identical.reap_expired(now)
    }

    pub fn response_threshold(&self) -> usize {
        self.identical.threshold()
    }

    /// Start the periodic reaping of stale observations.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.state.try_start()?;
        info!("starting quorum aggregator");
        let aggregator = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let reaper = tokio::spawn(async move {
            let mut ticker = interval(aggregator.config.cleanup_period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        aggregator.reap_expired(Instant::now());
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
        *self.lock_reaper() = Some(reaper);
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.state.try_stop()?;
        info!("stopping quorum aggregator");
        self.shutdown.send_replace(true);
        let reaper = self.lock_reaper().take();
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }
        Ok(())
    }

    fn lock_reaper(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.reaper.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
