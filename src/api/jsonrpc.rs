use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::crypto::hash;
use crate::Result;

pub const JSON_RPC_VERSION: &str = "2.0";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    #[serde(rename = "jsonrpc")]
    pub version: String,
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: &str, method: &str, params: Option<Value>) -> Self {
        JsonRpcRequest {
            version: String::from(JSON_RPC_VERSION),
            id: id.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    #[serde(rename = "jsonrpc")]
    pub version: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: &str, method: &str, result: Value) -> Self {
        JsonRpcResponse {
            version: String::from(JSON_RPC_VERSION),
            id: id.to_string(),
            method: method.to_string(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: &str, code: ErrorCode, message: &str) -> Self {
        JsonRpcResponse {
            version: String::from(JSON_RPC_VERSION),
            id: id.to_string(),
            method: String::new(),
            result: None,
            error: Some(JsonRpcError {
                code: code.to_jsonrpc_code(),
                message: message.to_string(),
                data: None,
            }),
        }
    }

    /// Hex digest of the canonical JSON form of the response.
    ///
    /// The response goes through `serde_json::Value`, whose objects are ordered maps, so two
    /// responses that differ only in object key order share a digest.
    pub fn digest(&self) -> Result<String> {
        let canonical = serde_json::to_vec(&serde_json::to_value(self)?)?;
        Ok(hex::encode(hash(&canonical)))
    }

    pub fn error_code(&self) -> ErrorCode {
        match &self.error {
            Some(error) => ErrorCode::from_jsonrpc_code(error.code),
            None => ErrorCode::NoError,
        }
    }
}

/// Gateway error taxonomy, mapped onto JSON-RPC error codes for users.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    UserMessageParseError,
    UnsupportedMethodError,
    UnsupportedDonIdError,
    HandlerError,
    RequestTimeoutError,
    NodeResponseEncodingError,
    FatalError,
    InvalidParamsError,
    ConflictError,
    LimitExceededError,
    StaleNodeResponseError,
}

impl ErrorCode {
    pub fn to_jsonrpc_code(self) -> i64 {
        match self {
            ErrorCode::NoError => 0,
            ErrorCode::UserMessageParseError => -32700,
            ErrorCode::UnsupportedMethodError => -32601,
            ErrorCode::InvalidParamsError => -32602,
            ErrorCode::UnsupportedDonIdError => -32602,
            ErrorCode::FatalError => -32603,
            ErrorCode::HandlerError => -32603,
            ErrorCode::NodeResponseEncodingError => -32603,
            ErrorCode::RequestTimeoutError => -32000,
            ErrorCode::StaleNodeResponseError => -32001,
            ErrorCode::LimitExceededError => -32005,
            ErrorCode::ConflictError => -32009,
        }
    }

    /// Several codes share a JSON-RPC number (an unsupported DON ID is reported as invalid
    /// params), so this is lossy: -32602 always decodes to [`ErrorCode::InvalidParamsError`].
    pub fn from_jsonrpc_code(code: i64) -> ErrorCode {
        match code {
            0 => ErrorCode::NoError,
            -32700 => ErrorCode::UserMessageParseError,
            -32601 => ErrorCode::UnsupportedMethodError,
            -32602 => ErrorCode::InvalidParamsError,
            -32000 => ErrorCode::RequestTimeoutError,
            -32001 => ErrorCode::StaleNodeResponseError,
            -32005 => ErrorCode::LimitExceededError,
            -32009 => ErrorCode::ConflictError,
            _ => ErrorCode::HandlerError,
        }
    }

    /// Outcome label for request level log events.
    pub fn outcome(self) -> &'static str {
        match self {
            ErrorCode::NoError => "success",
            code if code.is_internal() => "internal_error",
            _ => "user_error",
        }
    }

    /// Internal errors are logged in full but reported to users by name only.
    pub fn is_internal(self) -> bool {
        matches!(
            self,
            ErrorCode::FatalError
                | ErrorCode::HandlerError
                | ErrorCode::NodeResponseEncodingError
                | ErrorCode::StaleNodeResponseError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
