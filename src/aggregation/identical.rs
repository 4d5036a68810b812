use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::api::jsonrpc::JsonRpcResponse;
use crate::Result;

/// Digest used to compare node responses.
///
/// Signatures on a signed report are stripped first: every node attaches its own, so they would
/// keep otherwise identical reports apart.
pub fn response_digest(response: &JsonRpcResponse) -> Result<String> {
    let mut response = response.clone();
    if let Some(Value::Object(result)) = response.result.as_mut() {
        result.remove("signatures");
    }
    response.digest()
}

#[derive(Debug)]
struct DigestObservation {
    response: JsonRpcResponse,
    nodes: HashSet<String>,
}

#[derive(Debug)]
struct Vote {
    digest: String,
    observed_at: Instant,
}

#[derive(Debug, Default)]
struct RequestObservations {
    by_digest: HashMap<String, DigestObservation>,
    by_node: HashMap<String, Vote>,
}

impl RequestObservations {
    fn withdraw(&mut self, node_address: &str, digest: &str) {
        let now_empty = match self.by_digest.get_mut(digest) {
            Some(observation) => {
                observation.nodes.remove(node_address);
                observation.nodes.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_digest.remove(digest);
        }
    }
}

/// Counts the distinct nodes reporting each response digest, per request.
///
/// A node counts toward one digest at a time: a node that changes its answer has its vote moved.
/// Digests nobody supports any more are dropped immediately, and votes older than `max_age` are
/// withdrawn by [`IdenticalResponseAggregator::reap_expired`].
#[derive(Debug)]
pub struct IdenticalResponseAggregator {
    threshold: usize,
    max_age: Duration,
    requests: Mutex<HashMap<String, RequestObservations>>,
}

impl IdenticalResponseAggregator {
    pub fn new(threshold: usize, max_age: Duration) -> Self {
        IdenticalResponseAggregator {
            threshold,
            max_age,
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn collect(
        &self,
        request_id: &str,
        response: &JsonRpcResponse,
        node_address: &str,
    ) -> Result<Option<JsonRpcResponse>> {
        self.collect_at(request_id, response, node_address, Instant::now())
    }

    /// Record `node_address`'s vote for `response` and return the response once `threshold`
    /// distinct nodes back the same digest. Falling short is `Ok(None)`, not an error.
    pub fn collect_at(
        &self,
        request_id: &str,
        response: &JsonRpcResponse,
        node_address: &str,
        now: Instant,
    ) -> Result<Option<JsonRpcResponse>> {
        let digest = response_digest(response)?;
        let mut requests = self.lock();
        let observations = requests.entry(request_id.to_string()).or_default();

        let previous = observations.by_node.insert(
            node_address.to_string(),
            Vote {
                digest: digest.clone(),
                observed_at: now,
            },
        );
        if let Some(previous) = previous {
            if previous.digest != digest {
                debug!(request_id = %request_id, node_address = %node_address, "node changed its response");
                observations.withdraw(node_address, &previous.digest);
            }
        }

        let observation = observations
            .by_digest
            .entry(digest)
            .or_insert_with(|| DigestObservation {
                response: response.clone(),
                nodes: HashSet::new(),
            });
        observation.nodes.insert(node_address.to_string());

        if observation.nodes.len() >= self.threshold {
            return Ok(Some(observation.response.clone()));
        }
        Ok(None)
    }

    /// Number of nodes currently backing `response` for `request_id`.
    pub fn support(&self, request_id: &str, response: &JsonRpcResponse) -> Result<usize> {
        let digest = response_digest(response)?;
        let requests = self.lock();
        Ok(requests
            .get(request_id)
            .and_then(|observations| observations.by_digest.get(&digest))
            .map(|observation| observation.nodes.len())
            .unwrap_or(0))
    }

    pub fn digest_count(&self, request_id: &str) -> usize {
        self.lock()
            .get(request_id)
            .map(|observations| observations.by_digest.len())
            .unwrap_or(0)
    }

    pub fn remove_request(&self, request_id: &str) {
        self.lock().remove(request_id);
    }

    pub fn pending_requests(&self) -> usize {
        self.lock().len()
    }

    /// Withdraw every vote observed more than `max_age` before `now`. Returns how many votes
    /// were withdrawn.
    pub fn reap_expired(&self, now: Instant) -> usize {
        let mut requests = self.lock();
        let mut expired_count = 0;
        for observations in requests.values_mut() {
            let expired: Vec<(String, String)> = observations
                .by_node
                .iter()
                .filter(|(_, vote)| now.saturating_duration_since(vote.observed_at) > self.max_age)
                .map(|(node, vote)| (node.clone(), vote.digest.clone()))
                .collect();
            for (node, digest) in expired {
                observations.by_node.remove(&node);
                observations.withdraw(&node, &digest);
                expired_count += 1;
            }
        }
        requests.retain(|_, observations| !observations.by_node.is_empty());
        if expired_count > 0 {
            debug!(count = expired_count, "removed expired observations");
        }
        expired_count
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RequestObservations>> {
        match self.requests.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
