use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::jsonrpc::{ErrorCode, JsonRpcRequest, JsonRpcResponse};
use crate::gateway::handler::{send_to_user, Handler, UserCallback, UserCallbackPayload};
use crate::service::StateMachine;
use crate::{Error, Result};

/// Picks the handler for a method.
///
/// A DON with a single handler sends everything to it. With several handlers the method must
/// look like `<handler name>.<anything>` and the part before the first `.` selects the handler.
pub struct Router {
    state: StateMachine,
    handlers: HashMap<String, Arc<dyn Handler>>,
    // start/close order
    names: Vec<String>,
}

impl Router {
    pub fn new(handlers: Vec<(String, Arc<dyn Handler>)>) -> Result<Self> {
        if handlers.is_empty() {
            return Err(Error::NoHandlers);
        }
        let mut by_name = HashMap::new();
        let mut names = vec![];
        for (name, handler) in handlers {
            if by_name.contains_key(&name) {
                return Err(Error::DuplicateHandlerName(name));
            }
            names.push(name.clone());
            by_name.insert(name, handler);
        }
        Ok(Router {
            state: StateMachine::new("Router"),
            handlers: by_name,
            names,
        })
    }

    pub fn handler_for(&self, method: &str) -> Result<&Arc<dyn Handler>> {
        if self.handlers.len() == 1 {
            if let Some(handler) = self.handlers.values().next() {
                return Ok(handler);
            }
        }
        let prefix = match method.find('.') {
            Some(index) => &method[..index],
            None => return Err(Error::HandlerNotFound(method.to_string())),
        };
        self.handlers
            .get(prefix)
            .ok_or_else(|| Error::HandlerNotFound(method.to_string()))
    }

    fn ordered(&self) -> impl Iterator<Item = &Arc<dyn Handler>> {
        self.names.iter().filter_map(move |name| self.handlers.get(name))
    }
}

#[async_trait]
impl Handler for Router {
    async fn start(&self) -> Result<()> {
        self.state.try_start()?;
        info!(handlers = ?self.names, "starting handlers");
        for handler in self.ordered() {
            handler.start().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.try_stop()?;
        for handler in self.ordered() {
            handler.close().await?;
        }
        Ok(())
    }

    async fn handle_user_message(
        &self,
        request: JsonRpcRequest,
        callback: UserCallback,
    ) -> Result<()> {
        match self.handler_for(&request.method) {
            Ok(handler) => handler.handle_user_message(request, callback).await,
            Err(err) => {
                debug!(method = %request.method, "no handler for user request");
                send_to_user(
                    callback,
                    UserCallbackPayload::error(
                        &request.id,
                        ErrorCode::UnsupportedMethodError,
                        &err.to_string(),
                    ),
                );
                Err(err)
            }
        }
    }

    async fn handle_node_message(
        &self,
        response: JsonRpcResponse,
        node_address: &str,
    ) -> Result<()> {
        self.handler_for(&response.method)?
            .handle_node_message(response, node_address)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utilities::RecordingHandler;
    use tokio::sync::oneshot;

    fn router(names: &[&str]) -> (Router, Vec<Arc<RecordingHandler>>) {
        let handlers: Vec<Arc<RecordingHandler>> = names
            .iter()
            .map(|_| Arc::new(RecordingHandler::default()))
            .collect();
        let router = Router::new(
            names
                .iter()
                .zip(handlers.iter())
                .map(|(name, handler)| (name.to_string(), handler.clone() as Arc<dyn Handler>))
                .collect(),
        )
        .unwrap();
        (router, handlers)
    }

    #[tokio::test]
    async fn test_single_handler_takes_everything() {
        let (router, handlers) = router(&["only"]);
        let (callback, _receiver) = oneshot::channel();
        router
            .handle_user_message(JsonRpcRequest::new("1", "no_dot", None), callback)
            .await
            .unwrap();
        router
            .handle_node_message(JsonRpcResponse::success("1", "other.x", 1.into()), "n")
            .await
            .unwrap();
        assert_eq!(handlers[0].user_methods(), vec!["no_dot"]);
        assert_eq!(handlers[0].node_methods(), vec!["other.x"]);
    }

    #[tokio::test]
    async fn test_prefix_routing() {
        let (router, handlers) = router(&["vault", "http"]);
        let (callback, _receiver) = oneshot::channel();
        router
            .handle_user_message(JsonRpcRequest::new("1", "vault.get.deep", None), callback)
            .await
            .unwrap();
        router
            .handle_node_message(JsonRpcResponse::success("2", "http.trigger", 1.into()), "n")
            .await
            .unwrap();
        assert_eq!(handlers[0].user_methods(), vec!["vault.get.deep"]);
        assert_eq!(handlers[1].node_methods(), vec!["http.trigger"]);

        for method in ["vault", "unknown.get", ".get"] {
            let (callback, receiver) = oneshot::channel();
            assert!(matches!(
                router
                    .handle_user_message(JsonRpcRequest::new("3", method, None), callback)
                    .await,
                Err(Error::HandlerNotFound(_))
            ));
            let payload = receiver.await.unwrap();
            assert_eq!(payload.error_code, ErrorCode::UnsupportedMethodError);
        }
    }

    #[tokio::test]
    async fn test_start_close_fan_out() {
        let (router, handlers) = router(&["a", "b"]);
        router.start().await.unwrap();
        assert!(handlers.iter().all(|handler| handler.started()));
        assert!(matches!(router.start().await, Err(Error::AlreadyStarted(_))));
        router.close().await.unwrap();
        assert!(handlers.iter().all(|handler| handler.closed()));
    }

    #[tokio::test]
    async fn test_first_start_failure_aborts() {
        let failing = Arc::new(RecordingHandler::failing_start());
        let after = Arc::new(RecordingHandler::default());
        let router = Router::new(vec![
            (String::from("a"), failing as Arc<dyn Handler>),
            (String::from("b"), after.clone() as Arc<dyn Handler>),
        ])
        .unwrap();
        assert!(router.start().await.is_err());
        assert!(!after.started());
    }

    #[test]
    fn test_bad_handler_sets() {
        assert!(matches!(Router::new(vec![]), Err(Error::NoHandlers)));
        let handler = Arc::new(RecordingHandler::default()) as Arc<dyn Handler>;
        assert!(matches!(
            Router::new(vec![
                (String::from("a"), handler.clone()),
                (String::from("a"), handler),
            ]),
            Err(Error::DuplicateHandlerName(_))
        ));
    }
}
