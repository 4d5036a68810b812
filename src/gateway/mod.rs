//! Gateway side: authenticates DON member nodes, accepts user requests and routes both to the
//! configured handlers.
//!
//! Nodes dial in on the node server, users post JSON-RPC to `<user path>/<don_id>` on the user
//! server. Each DON gets its own [`router::Router`] over the handlers built by a
//! [`factory::HandlerFactory`].

pub mod connection_manager;
pub mod factory;
pub mod handler;
pub mod router;
pub mod server;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{event, info, Level};
use warp::filters::BoxedFilter;
use warp::Reply;

use crate::config::GatewayConfig;
use crate::ratelimit::RateLimiter;
use crate::service::{ServiceState, StateMachine};
use crate::time::Clock;
use crate::{Error, Result};

use connection_manager::ConnectionManager;
use factory::HandlerFactory;
use handler::{Don, Handler};
use router::Router;
use server::UserRequestContext;

/// Where the two servers ended up listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayAddresses {
    pub node: SocketAddr,
    pub user: SocketAddr,
}

pub struct Gateway {
    state: StateMachine,
    config: GatewayConfig,
    connection_manager: Arc<ConnectionManager>,
    routers: HashMap<String, Arc<Router>>,
    user_context: Arc<UserRequestContext>,
    shutdown: watch::Sender<bool>,
    servers: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, factory: &HandlerFactory, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let connection_manager = Arc::new(ConnectionManager::new(
            config.connection_manager.clone(),
            &config.dons,
            Duration::from_millis(config.node_server.handshake_timeout_ms),
            clock,
        )?);

        let mut routers = HashMap::new();
        let mut user_handlers: HashMap<String, Arc<dyn Handler>> = HashMap::new();
        for don_config in &config.dons {
            let don = connection_manager.don(&don_config.don_id)?.clone();
            let mut handlers = vec![];
            for handler_config in &don_config.handlers {
                let handler =
                    factory.new_handler(handler_config, don_config, don.clone() as Arc<dyn Don>)?;
                handlers.push((handler_config.name.clone(), handler));
            }
            let router = Arc::new(Router::new(handlers)?);
            don.set_handler(router.clone());
            user_handlers.insert(don_config.don_id.clone(), router.clone());
            routers.insert(don_config.don_id.clone(), router);
        }

        let user_context = Arc::new(UserRequestContext {
            codec: Default::default(),
            handlers: user_handlers,
            rate_limiter: RateLimiter::new(config.user_rate_limiter.clone())?,
            request_timeout: Duration::from_millis(config.user_server.request_timeout_ms),
        });
        let (shutdown, _) = watch::channel(false);
        Ok(Gateway {
            state: StateMachine::new("Gateway"),
            config,
            connection_manager,
            routers,
            user_context,
            shutdown,
            servers: Mutex::new(vec![]),
        })
    }

    pub fn node_routes(&self) -> BoxedFilter<(Box<dyn Reply>,)> {
        server::node_route(&self.config.node_server.path, self.connection_manager.clone())
    }

    pub fn user_routes(&self) -> BoxedFilter<(Box<dyn Reply>,)> {
        server::user_route(
            &self.config.user_server.path,
            self.config.user_server.max_request_bytes,
            self.user_context.clone(),
        )
    }

    /// Start the handlers, then both servers. Port 0 in the config picks a free port.
    pub async fn start(&self) -> Result<GatewayAddresses> {
        self.state.try_start()?;
        for (don_id, router) in &self.routers {
            info!(don_id = %don_id, "starting DON handlers");
            router.start().await?;
        }

        let node = self.serve(
            "node",
            &self.config.node_server.host,
            self.config.node_server.port,
            self.node_routes(),
        )?;
        let user = self.serve(
            "user",
            &self.config.user_server.host,
            self.config.user_server.port,
            self.user_routes(),
        )?;
        Ok(GatewayAddresses { node, user })
    }

    pub async fn close(&self) -> Result<()> {
        self.state.try_stop()?;
        info!("closing gateway");
        self.shutdown.send_replace(true);
        let servers: Vec<JoinHandle<()>> = self.lock_servers().drain(..).collect();
        for server in servers {
            let _ = server.await;
        }
        let mut first_err = None;
        for router in self.routers.values() {
            if let Err(err) = router.close().await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn connected_nodes(&self, don_id: &str) -> Result<Vec<String>> {
        self.connection_manager.connected_nodes(don_id)
    }

    pub fn don_ids(&self) -> Vec<String> {
        self.connection_manager.don_ids()
    }

    pub fn state(&self) -> ServiceState {
        self.state.state()
    }

    fn serve(
        &self,
        name: &'static str,
        host: &str,
        port: u16,
        routes: BoxedFilter<(Box<dyn Reply>,)>,
    ) -> Result<SocketAddr> {
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid {} server address {}:{}", name, host, port)))?;
        let mut shutdown = self.shutdown.subscribe();
        let (bound, server) = warp::serve(routes).try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown.changed().await;
        })?;
        event!(Level::INFO, server = name, addr = %bound, "listening");
        self.lock_servers().push(tokio::spawn(server));
        Ok(bound)
    }

    fn lock_servers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.servers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
