use futures::SinkExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, event, Level};
use url::Url;

use crate::networking::connection::WsStream;
use crate::networking::handshake::{HandshakeError, AUTH_HEADER_NAME, CHALLENGE_HEADER_NAME};
use crate::{Error, Result};

/// The party that proves its identity while dialing: builds the signed auth header sent with
/// the upgrade request and signs the challenge the remote end answers with.
pub trait ConnectionInitiator: Send + Sync {
    fn new_auth_header(&self, url: &Url) -> Result<Vec<u8>>;
    fn challenge_response(&self, url: &Url, challenge: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct WebSocketClientConfig {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

impl Default for WebSocketClientConfig {
    fn default() -> Self {
        WebSocketClientConfig {
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

/// Dials a gateway and runs the two step handshake:
///
/// 1. the upgrade request carries the hex encoded auth header in `Authorization`,
/// 2. the upgrade response carries a hex encoded challenge in `Challenge`,
/// 3. the signed challenge is written as the first binary frame.
#[derive(Debug, Clone)]
pub struct WebSocketClient {
    config: WebSocketClientConfig,
}

impl WebSocketClient {
    pub fn new(config: WebSocketClientConfig) -> Self {
        WebSocketClient { config }
    }

    pub async fn connect(&self, initiator: &dyn ConnectionInitiator, url: &Url) -> Result<WsStream> {
        let auth_header = initiator.new_auth_header(url)?;
        let mut request = url.as_str().into_client_request()?;
        let header_value = HeaderValue::from_str(&hex::encode(&auth_header))
            .map_err(|_| HandshakeError::AuthHeaderParse)?;
        request.headers_mut().insert(AUTH_HEADER_NAME, header_value);

        let handshake_timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        let (mut stream, response) = timeout(handshake_timeout, connect_async(request))
            .await
            .map_err(|_| Error::HandshakeTimeout(url.to_string()))??;

        let challenge_hex = response
            .headers()
            .get(CHALLENGE_HEADER_NAME)
            .ok_or(HandshakeError::MissingChallenge)?
            .to_str()
            .map_err(|_| HandshakeError::ChallengeParse)?;
        let challenge = hex::decode(challenge_hex).map_err(|_| HandshakeError::ChallengeParse)?;
        debug!(url = %url, challenge_len = challenge.len(), "received challenge");

        let signed_challenge = match initiator.challenge_response(url, &challenge) {
            Ok(signed_challenge) => signed_challenge,
            Err(err) => {
                event!(Level::ERROR, url = %url, %err, "refusing gateway challenge");
                let _ = stream.close(None).await;
                return Err(err);
            }
        };
        stream.send(Message::Binary(signed_challenge)).await?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    struct FixedInitiator {
        reject_challenge: bool,
    }

    impl ConnectionInitiator for FixedInitiator {
        fn new_auth_header(&self, _url: &Url) -> Result<Vec<u8>> {
            Ok(vec![0xAB, 0xCD])
        }

        fn challenge_response(&self, _url: &Url, challenge: &[u8]) -> Result<Vec<u8>> {
            if self.reject_challenge {
                return Err(HandshakeError::ChallengeTooShort.into());
            }
            let mut response = challenge.to_vec();
            response.reverse();
            Ok(response)
        }
    }

    async fn spawn_server(
        challenge: Option<&'static str>,
    ) -> (Url, tokio::task::JoinHandle<(String, Option<Vec<u8>>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/node", listener.local_addr().unwrap())).unwrap();
        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut auth = String::new();
            let callback = |req: &Request, mut response: Response| -> std::result::Result<Response, ErrorResponse> {
                auth = req
                    .headers()
                    .get(AUTH_HEADER_NAME)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if let Some(challenge) = challenge {
                    response
                        .headers_mut()
                        .insert(CHALLENGE_HEADER_NAME, HeaderValue::from_static(challenge));
                }
                Ok(response)
            };
            let mut ws = accept_hdr_async(tcp, callback).await.unwrap();
            let first_frame = match ws.next().await {
                Some(Ok(Message::Binary(data))) => Some(data),
                _ => None,
            };
            (auth, first_frame)
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_handshake_sends_auth_and_signed_challenge() {
        let (url, server) = spawn_server(Some("010203")).await;
        let client = WebSocketClient::new(WebSocketClientConfig::default());
        let initiator = FixedInitiator {
            reject_challenge: false,
        };
        let _stream = client.connect(&initiator, &url).await.unwrap();

        let (auth, first_frame) = server.await.unwrap();
        assert_eq!(auth, "abcd");
        assert_eq!(first_frame, Some(vec![3, 2, 1]));
    }

    #[tokio::test]
    async fn test_missing_challenge_fails() {
        let (url, _server) = spawn_server(None).await;
        let client = WebSocketClient::new(WebSocketClientConfig::default());
        let initiator = FixedInitiator {
            reject_challenge: false,
        };
        let err = client.connect(&initiator, &url).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Handshake(HandshakeError::MissingChallenge)
        ));
    }

    #[tokio::test]
    async fn test_rejected_challenge_is_not_answered() {
        let (url, server) = spawn_server(Some("00")).await;
        let client = WebSocketClient::new(WebSocketClientConfig::default());
        let initiator = FixedInitiator {
            reject_challenge: true,
        };
        assert!(client.connect(&initiator, &url).await.is_err());
        let (_, first_frame) = server.await.unwrap();
        assert_eq!(first_frame, None);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}", listener.local_addr().unwrap())).unwrap();
        drop(listener);
        let client = WebSocketClient::new(WebSocketClientConfig::default());
        let initiator = FixedInitiator {
            reject_challenge: false,
        };
        assert!(matches!(
            client.connect(&initiator, &url).await,
            Err(Error::WebSocket(_))
        ));
    }
}
