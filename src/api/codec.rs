use crate::api::jsonrpc::{ErrorCode, JsonRpcRequest, JsonRpcResponse, JSON_RPC_VERSION};
use crate::api::message::Message;
use crate::{Error, Result};

/// Maps gateway [`Message`]s onto JSON-RPC frames.
///
/// Gateway to node traffic travels as requests (`params` holds the message), node to gateway
/// traffic as responses (`result` holds the message).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRpcCodec;

impl JsonRpcCodec {
    pub fn encode_request(&self, msg: &Message) -> Result<Vec<u8>> {
        let request = JsonRpcRequest::new(
            &msg.body.message_id,
            &msg.body.method,
            Some(serde_json::to_value(msg)?),
        );
        Ok(serde_json::to_vec(&request)?)
    }

    pub fn decode_request(&self, data: &[u8]) -> Result<Message> {
        let request: JsonRpcRequest = serde_json::from_slice(data)?;
        if request.version != JSON_RPC_VERSION {
            return Err(Error::InvalidMessage(format!(
                "unsupported JSON-RPC version {}",
                request.version
            )));
        }
        let params = request
            .params
            .ok_or_else(|| Error::InvalidMessage(String::from("missing params")))?;
        let msg: Message = serde_json::from_value(params)?;
        if msg.body.message_id != request.id || msg.body.method != request.method {
            return Err(Error::InvalidMessage(String::from(
                "envelope does not match message body",
            )));
        }
        Ok(msg)
    }

    pub fn encode_response(&self, msg: &Message) -> Result<Vec<u8>> {
        let response = JsonRpcResponse::success(
            &msg.body.message_id,
            &msg.body.method,
            serde_json::to_value(msg)?,
        );
        Ok(serde_json::to_vec(&response)?)
    }

    pub fn decode_response(&self, data: &[u8]) -> Result<Message> {
        let response: JsonRpcResponse = serde_json::from_slice(data)?;
        if let Some(error) = response.error {
            return Err(Error::InvalidMessage(format!(
                "node returned error frame: {}",
                error.message
            )));
        }
        let result = response
            .result
            .ok_or_else(|| Error::InvalidMessage(String::from("missing result")))?;
        let msg: Message = serde_json::from_value(result)?;
        if msg.body.message_id != response.id {
            return Err(Error::InvalidMessage(String::from(
                "envelope does not match message body",
            )));
        }
        Ok(msg)
    }

    pub fn decode_user_request(&self, data: &[u8]) -> Result<JsonRpcRequest> {
        let request: JsonRpcRequest = serde_json::from_slice(data)?;
        if request.version != JSON_RPC_VERSION {
            return Err(Error::InvalidMessage(format!(
                "unsupported JSON-RPC version {}",
                request.version
            )));
        }
        Ok(request)
    }

    pub fn encode_user_response(&self, response: &JsonRpcResponse) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    /// Error frames are built from plain strings and cannot fail to encode.
    pub fn encode_error_response(&self, id: &str, code: ErrorCode, message: &str) -> Vec<u8> {
        let response = JsonRpcResponse::failure(id, code, message);
        serde_json::to_vec(&response).unwrap_or_default()
    }
}
