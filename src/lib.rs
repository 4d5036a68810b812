/*!
# DON Gateway

Users of a decentralized oracle network never talk to the DON member nodes directly. A
**Gateway** sits in between: it accepts JSON-RPC requests from users, fans every request out to
all member nodes and reconciles the (possibly conflicting, possibly malicious) node responses
into one answer that at least a quorum of members agree on.

This crate holds both sides of that arrangement:

* the node side [`connector::GatewayConnector`], which keeps an authenticated websocket session
  open to each configured Gateway and dispatches inbound messages to handlers keyed by method,
* the Gateway side [`gateway::Gateway`], made of the connection manager that authenticates
  nodes, the [`gateway::router::Router`] that picks a handler by method prefix, the
  [`handlers::quorum::QuorumHandler`] that correlates user requests with node responses, and the
  [`aggregation::QuorumAggregator`] that decides when enough nodes agree.

# Usage

```bash
don_gateway --config config/gateway
don_node --config config/node
```

# Trust model

A DON of `n = 3f + 1` members tolerates `f` faulty members. A response is only handed back to
the user once `threshold` distinct members vouch for it, either by signing it (verified against
the DON's signer keys) or by reporting byte-identical content.
*/
pub mod aggregation;
pub mod api;
pub mod config;
pub mod connector;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod keypair;
pub mod networking;
pub mod ratelimit;
pub mod service;
pub mod time;

#[cfg(test)]
pub mod test_utilities;

pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
