use crate::networking::handshake::HandshakeError;

/// Errors produced by the connector, the gateway and the handlers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid Gateway ID {0}")]
    UnknownGateway(String),

    #[error("duplicate Gateway ID {0}")]
    DuplicateGatewayId(String),

    #[error("duplicate Gateway URL {0}")]
    DuplicateGatewayUrl(String),

    #[error("invalid DON ID {0:?}")]
    InvalidDonId(String),

    #[error("unknown DON ID {0}")]
    UnknownDon(String),

    #[error("handler for method {0} already exists")]
    HandlerExists(String),

    #[error("cannot add a handler without methods")]
    NoMethods,

    #[error("duplicate handler name {0}")]
    DuplicateHandlerName(String),

    #[error("unknown handler type {0}")]
    UnknownHandlerType(String),

    #[error("connector not started")]
    NotStarted,

    #[error("{0} has already been started")]
    AlreadyStarted(&'static str),

    #[error("{0} has already been stopped")]
    AlreadyStopped(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    #[error("handler not found for method {0}")]
    HandlerNotFound(String),

    #[error("no handlers registered")]
    NoHandlers,

    #[error("request ID already used: {0}")]
    RequestIdUsed(String),

    #[error("request ID cannot be empty")]
    EmptyRequestId,

    #[error("failed to forward user request to nodes")]
    FanOutFailed,

    #[error("node {0} is not connected")]
    NodeNotConnected(String),

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("only {valid} valid signatures, need at least {required}")]
    NotEnoughSignatures { valid: usize, required: usize },

    #[error("handshake with {0} timed out")]
    HandshakeTimeout(String),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Secp256k1(#[from] secp256k1::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Server(#[from] warp::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
