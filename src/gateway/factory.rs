use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{DonConfig, HandlerConfig};
use crate::gateway::handler::{Don, Handler};
use crate::handlers::decode_handler_config;
use crate::handlers::dummy::{DummyHandler, DummyHandlerConfig};
use crate::handlers::quorum::{QuorumHandler, QuorumHandlerConfig};
use crate::{Error, Result};

pub const QUORUM_HANDLER_TYPE: &str = "quorum";
pub const DUMMY_HANDLER_TYPE: &str = "dummy";

pub type HandlerConstructor =
    Box<dyn Fn(&HandlerConfig, &DonConfig, Arc<dyn Don>) -> Result<Arc<dyn Handler>> + Send + Sync>;

/// Builds handlers by their configured `handler_type`.
pub struct HandlerFactory {
    constructors: HashMap<String, HandlerConstructor>,
}

impl HandlerFactory {
    /// A factory that knows no handler types.
    pub fn empty() -> Self {
        HandlerFactory {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler_type: &str, constructor: HandlerConstructor) {
        self.constructors
            .insert(handler_type.to_string(), constructor);
    }

    pub fn new_handler(
        &self,
        handler_config: &HandlerConfig,
        don_config: &DonConfig,
        don: Arc<dyn Don>,
    ) -> Result<Arc<dyn Handler>> {
        let constructor = self
            .constructors
            .get(&handler_config.handler_type)
            .ok_or_else(|| Error::UnknownHandlerType(handler_config.handler_type.clone()))?;
        constructor(handler_config, don_config, don)
    }
}

impl Default for HandlerFactory {
    fn default() -> Self {
        let mut factory = HandlerFactory::empty();
        factory.register(
            QUORUM_HANDLER_TYPE,
            Box::new(
                |handler_config: &HandlerConfig,
                 don_config: &DonConfig,
                 don: Arc<dyn Don>|
                 -> Result<Arc<dyn Handler>> {
                    let config: QuorumHandlerConfig =
                        decode_handler_config(&handler_config.config)?;
                    Ok(Arc::new(QuorumHandler::new(config, don_config.clone(), don)?))
                },
            ),
        );
        factory.register(
            DUMMY_HANDLER_TYPE,
            Box::new(
                |handler_config: &HandlerConfig,
                 don_config: &DonConfig,
                 don: Arc<dyn Don>|
                 -> Result<Arc<dyn Handler>> {
                    let config: DummyHandlerConfig =
                        decode_handler_config(&handler_config.config)?;
                    Ok(Arc::new(DummyHandler::new(config, don_config.clone(), don)?))
                },
            ),
        );
        factory
    }
}
