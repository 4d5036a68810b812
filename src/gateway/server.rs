use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::path::FullPath;
use warp::{Filter, Rejection, Reply};

use crate::api::codec::JsonRpcCodec;
use crate::api::jsonrpc::ErrorCode;
use crate::gateway::connection_manager::ConnectionManager;
use crate::gateway::handler::{Handler, UserCallbackPayload};
use crate::networking::handshake::{
    AUTH_HEADER_NAME, CHALLENGE_HEADER_NAME, HANDSHAKE_ENCODED_AUTH_HEADER_MAX_LEN,
};
use crate::ratelimit::RateLimiter;

/// What the user endpoint needs to answer a request.
pub struct UserRequestContext {
    pub codec: JsonRpcCodec,
    /// top level handler of each DON, keyed by DON ID
    pub handlers: HashMap<String, Arc<dyn Handler>>,
    pub rate_limiter: RateLimiter,
    pub request_timeout: Duration,
}

/// `GET <path>` upgraded to the node websocket.
pub fn node_route(
    path: &str,
    connection_manager: Arc<ConnectionManager>,
) -> BoxedFilter<(Box<dyn Reply>,)> {
    exact_path(path)
        .and(warp::ws())
        .and(warp::header::optional::<String>(AUTH_HEADER_NAME))
        .and(with_connection_manager(connection_manager))
        .and_then(node_upgrade_handler)
        .boxed()
}

/// `POST <path>/<don_id>` with a JSON-RPC request body.
pub fn user_route(
    path: &str,
    max_request_bytes: u64,
    context: Arc<UserRequestContext>,
) -> BoxedFilter<(Box<dyn Reply>,)> {
    warp::post()
        .and(path_param(path))
        .and(warp::addr::remote())
        .and(warp::body::content_length_limit(max_request_bytes))
        .and(warp::body::bytes())
        .and(with_context(context))
        .and_then(user_request_handler)
        .boxed()
}

fn exact_path(path: &str) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    let expected = normalize_path(path);
    warp::path::full()
        .and_then(move |full: FullPath| {
            let matches = full.as_str().trim_end_matches('/') == expected;
            async move {
                if matches {
                    Ok(())
                } else {
                    Err(warp::reject::not_found())
                }
            }
        })
        .untuple_one()
}

/// Matches `<prefix>/<param>` and extracts the last segment.
fn path_param(prefix: &str) -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    let prefix = format!("{}/", normalize_path(prefix));
    warp::path::full().and_then(move |full: FullPath| {
        let param = full
            .as_str()
            .strip_prefix(prefix.as_str())
            .map(|rest| rest.trim_end_matches('/'))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(String::from);
        async move { param.ok_or_else(warp::reject::not_found) }
    })
}

fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}

fn with_connection_manager(
    connection_manager: Arc<ConnectionManager>,
) -> impl Filter<Extract = (Arc<ConnectionManager>,), Error = Infallible> + Clone {
    warp::any().map(move || connection_manager.clone())
}

fn with_context(
    context: Arc<UserRequestContext>,
) -> impl Filter<Extract = (Arc<UserRequestContext>,), Error = Infallible> + Clone {
    warp::any().map(move || context.clone())
}

async fn node_upgrade_handler(
    ws: warp::ws::Ws,
    auth_header: Option<String>,
    connection_manager: Arc<ConnectionManager>,
) -> Result<Box<dyn Reply>, Rejection> {
    let auth_header = auth_header
        .filter(|value| value.len() <= HANDSHAKE_ENCODED_AUTH_HEADER_MAX_LEN)
        .and_then(|value| hex::decode(value).ok());
    let auth_header = match auth_header {
        Some(auth_header) => auth_header,
        None => {
            return Ok(Box::new(warp::reply::with_status(
                "missing or malformed auth header",
                StatusCode::BAD_REQUEST,
            )))
        }
    };
    match connection_manager.start_handshake(&auth_header) {
        Ok((attempt_id, challenge)) => {
            let reply = ws.on_upgrade(move |socket| connection_manager.serve_node(attempt_id, socket));
            Ok(Box::new(warp::reply::with_header(
                reply,
                CHALLENGE_HEADER_NAME,
                hex::encode(challenge),
            )))
        }
        Err(err) => {
            warn!(%err, "rejecting node handshake");
            Ok(Box::new(warp::reply::with_status(
                err.to_string(),
                StatusCode::UNAUTHORIZED,
            )))
        }
    }
}

async fn user_request_handler(
    don_id: String,
    remote: Option<SocketAddr>,
    body: Bytes,
    context: Arc<UserRequestContext>,
) -> Result<Box<dyn Reply>, Rejection> {
    let sender = remote
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default();
    if !context.rate_limiter.allow(&sender) {
        debug!(sender = %sender, "user is rate limited");
        return Ok(error_reply(&context, "", ErrorCode::LimitExceededError, "rate limit exceeded"));
    }

    let request = match context.codec.decode_user_request(&body) {
        Ok(request) => request,
        Err(err) => {
            debug!(%err, "failed to parse user request");
            return Ok(error_reply(
                &context,
                "",
                ErrorCode::UserMessageParseError,
                &format!("user message parse error: {}", err),
            ));
        }
    };
    let handler = match context.handlers.get(&don_id) {
        Some(handler) => handler.clone(),
        None => {
            return Ok(error_reply(
                &context,
                &request.id,
                ErrorCode::UnsupportedDonIdError,
                &format!("unsupported DON ID {}", don_id),
            ))
        }
    };

    let request_id = request.id.clone();
    let (callback, receiver) = oneshot::channel();
    if let Err(err) = handler.handle_user_message(request, callback).await {
        // the handler has answered on the callback already
        debug!(request_id = %request_id, %err, "handler rejected user request");
    }
    let payload = match timeout(context.request_timeout, receiver).await {
        Ok(Ok(payload)) => payload,
        Ok(Err(_)) => UserCallbackPayload::error(
            &request_id,
            ErrorCode::FatalError,
            &ErrorCode::FatalError.to_string(),
        ),
        Err(_) => UserCallbackPayload::error(
            &request_id,
            ErrorCode::RequestTimeoutError,
            "timeout while waiting for response",
        ),
    };
    Ok(payload_reply(payload))
}

fn error_reply(
    context: &UserRequestContext,
    id: &str,
    code: ErrorCode,
    message: &str,
) -> Box<dyn Reply> {
    payload_reply(UserCallbackPayload {
        raw_response: context.codec.encode_error_response(id, code, message),
        error_code: code,
    })
}

fn payload_reply(payload: UserCallbackPayload) -> Box<dyn Reply> {
    Box::new(warp::reply::with_status(
        warp::reply::with_header(payload.raw_response, "content-type", "application/json"),
        http_status(payload.error_code),
    ))
}

pub fn http_status(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NoError => StatusCode::OK,
        ErrorCode::UserMessageParseError
        | ErrorCode::UnsupportedMethodError
        | ErrorCode::UnsupportedDonIdError
        | ErrorCode::InvalidParamsError => StatusCode::BAD_REQUEST,
        ErrorCode::LimitExceededError => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::ConflictError => StatusCode::CONFLICT,
        ErrorCode::RequestTimeoutError => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::HandlerError
        | ErrorCode::FatalError
        | ErrorCode::NodeResponseEncodingError
        | ErrorCode::StaleNodeResponseError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
