use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use crate::api::codec::JsonRpcCodec;
use crate::api::jsonrpc::{ErrorCode, JsonRpcRequest, JsonRpcResponse};
use crate::api::message::{MESSAGE_ID_MAX_LEN, MESSAGE_METHOD_MAX_LEN};
use crate::{Error, Result};

/// What the user ends up receiving for one request: an encoded JSON-RPC frame plus the error
/// code it carries, so the server can pick an HTTP status without decoding it again.
#[derive(Debug, Clone, PartialEq)]
pub struct UserCallbackPayload {
    pub raw_response: Vec<u8>,
    pub error_code: ErrorCode,
}

impl UserCallbackPayload {
    pub fn success(response: &JsonRpcResponse) -> Result<Self> {
        Ok(UserCallbackPayload {
            raw_response: JsonRpcCodec.encode_user_response(response)?,
            error_code: response.error_code(),
        })
    }

    pub fn error(id: &str, code: ErrorCode, message: &str) -> Self {
        UserCallbackPayload {
            raw_response: JsonRpcCodec.encode_error_response(id, code, message),
            error_code: code,
        }
    }
}

/// Single use channel a handler answers a user request on.
pub type UserCallback = oneshot::Sender<UserCallbackPayload>;

/// Deliver `payload` on `callback`. The user may have given up waiting already, which is not
/// an error for the handler.
pub fn send_to_user(callback: UserCallback, payload: UserCallbackPayload) {
    if callback.send(payload).is_err() {
        debug!("user callback dropped before the response was delivered");
    }
}

/// Reject user requests the nodes would refuse to accept. The ID and method travel in the
/// node message body, so they are held to the same bounds.
pub fn validate_user_request(request: &JsonRpcRequest) -> Result<()> {
    if request.id.is_empty() {
        return Err(Error::EmptyRequestId);
    }
    if request.id.len() > MESSAGE_ID_MAX_LEN {
        return Err(Error::InvalidMessage(format!(
            "request ID longer than {} bytes",
            MESSAGE_ID_MAX_LEN
        )));
    }
    if request.method.is_empty() || request.method.len() > MESSAGE_METHOD_MAX_LEN {
        return Err(Error::InvalidMessage(format!(
            "method name must be between 1 and {} bytes",
            MESSAGE_METHOD_MAX_LEN
        )));
    }
    Ok(())
}

/// A gateway capability for one DON, selected by method prefix.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Accept a user request. Every accepted request is answered exactly once on `callback`,
    /// and a rejected one gets its error on `callback` before the error is returned.
    async fn handle_user_message(
        &self,
        request: JsonRpcRequest,
        callback: UserCallback,
    ) -> Result<()>;

    /// Consume one node response, already authenticated as coming from `node_address`.
    async fn handle_node_message(
        &self,
        response: JsonRpcResponse,
        node_address: &str,
    ) -> Result<()>;
}

/// The members of one DON as seen from a handler.
#[async_trait]
pub trait Don: Send + Sync {
    async fn send_to_node(&self, node_address: &str, request: &JsonRpcRequest) -> Result<()>;
}
