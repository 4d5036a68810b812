use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::crypto::address_to_public_key;
use crate::networking::client::WebSocketClientConfig;
use crate::networking::handshake::{HANDSHAKE_DON_ID_LEN, HANDSHAKE_GATEWAY_ID_LEN};
use crate::ratelimit::RateLimiterConfig;
use crate::{Error, Result};

/// Read a config file (any format the `config` crate understands, extension optional) and
/// overlay `DON_`-prefixed environment variables, e.g. `DON_NODE_SERVER__PORT=5003`.
pub fn load<T: DeserializeOwned>(name: &str) -> Result<T> {
    let mut settings = config::Config::default();
    settings.merge(config::File::with_name(name))?;
    settings.merge(config::Environment::with_prefix("DON").separator("__"))?;
    Ok(settings.try_into()?)
}

pub fn load_from_str<T: DeserializeOwned>(content: &str, format: config::FileFormat) -> Result<T> {
    let mut settings = config::Config::default();
    settings.merge(config::File::from_str(content, format))?;
    Ok(settings.try_into()?)
}

fn check_id(kind: &str, id: &str, max_len: usize) -> Result<()> {
    if id.is_empty() || id.len() > max_len {
        return Err(Error::InvalidConfig(format!(
            "{} must be between 1 and {} bytes, got {:?}",
            kind, max_len, id
        )));
    }
    Ok(())
}

//
// Node side
//

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectorGatewayConfig {
    pub id: String,
    pub url: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectorConfig {
    /// Address of the node key, `0x` + hex compressed public key. May be left empty, in which
    /// case the signer's address is used.
    #[serde(default)]
    pub node_address: String,
    pub don_id: String,
    pub gateways: Vec<ConnectorGatewayConfig>,
    #[serde(default)]
    pub ws_client: WebSocketClientConfig,
    #[serde(default = "default_min_challenge_len")]
    pub auth_min_challenge_len: usize,
    #[serde(default = "default_timestamp_tolerance_sec")]
    pub auth_timestamp_tolerance_sec: u32,
}

fn default_min_challenge_len() -> usize {
    20
}

fn default_timestamp_tolerance_sec() -> u32 {
    30
}

impl ConnectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.don_id.is_empty() || self.don_id.len() > HANDSHAKE_DON_ID_LEN {
            return Err(Error::InvalidDonId(self.don_id.clone()));
        }
        let mut ids = HashSet::new();
        let mut urls = HashSet::new();
        for gateway in &self.gateways {
            check_id("gateway ID", &gateway.id, HANDSHAKE_GATEWAY_ID_LEN)?;
            if !ids.insert(gateway.id.as_str()) {
                return Err(Error::DuplicateGatewayId(gateway.id.clone()));
            }
            let url = url::Url::parse(&gateway.url)?;
            if !urls.insert(url.to_string()) {
                return Err(Error::DuplicateGatewayUrl(gateway.url.clone()));
            }
        }
        Ok(())
    }
}

/// Everything the `don_node` binary reads from its config file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeConfig {
    pub node: NodeKeyConfig,
    pub connector: ConnectorConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeKeyConfig {
    /// hex encoded secp256k1 secret key
    pub secret_key: String,
    /// methods answered by the built-in echo capability
    #[serde(default)]
    pub methods: Vec<String>,
}

//
// Gateway side
//

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_node_path")]
    pub path: String,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_user_path")]
    pub path: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionManagerConfig {
    pub auth_gateway_id: String,
    #[serde(default = "default_challenge_len")]
    pub auth_challenge_len: usize,
    #[serde(default = "default_timestamp_tolerance_sec")]
    pub auth_timestamp_tolerance_sec: u32,
}

fn default_host() -> String {
    String::from("127.0.0.1")
}

fn default_node_path() -> String {
    String::from("/node")
}

fn default_user_path() -> String {
    String::from("/user")
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    12000
}

fn default_max_request_bytes() -> u64 {
    100_000
}

fn default_challenge_len() -> usize {
    32
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DonMemberConfig {
    pub name: String,
    /// node transport key, used for the handshake and for message signatures
    pub address: String,
    /// key the node signs reports with, when it differs from the transport key
    #[serde(default)]
    pub signer: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HandlerConfig {
    pub name: String,
    pub handler_type: String,
    /// handler specific settings, decoded by the handler's constructor
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DonConfig {
    pub don_id: String,
    pub f: usize,
    pub members: Vec<DonMemberConfig>,
    pub handlers: Vec<HandlerConfig>,
}

impl DonConfig {
    pub fn validate(&self) -> Result<()> {
        if self.don_id.is_empty() || self.don_id.len() > HANDSHAKE_DON_ID_LEN {
            return Err(Error::InvalidDonId(self.don_id.clone()));
        }
        if self.members.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "DON {} has no members",
                self.don_id
            )));
        }
        if 3 * self.f + 1 > self.members.len() {
            return Err(Error::InvalidConfig(format!(
                "DON {} with {} members cannot tolerate f={}",
                self.don_id,
                self.members.len(),
                self.f
            )));
        }
        let mut addresses = HashSet::new();
        for member in &self.members {
            address_to_public_key(&member.address)?;
            if let Some(signer) = &member.signer {
                address_to_public_key(signer)?;
            }
            if !addresses.insert(crate::crypto::normalize_address(&member.address)) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate member address {}",
                    member.address
                )));
            }
        }
        if self.handlers.is_empty() {
            return Err(Error::NoHandlers);
        }
        let mut names = HashSet::new();
        for handler in &self.handlers {
            if !names.insert(handler.name.as_str()) {
                return Err(Error::DuplicateHandlerName(handler.name.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub node_server: NodeServerConfig,
    pub user_server: UserServerConfig,
    #[serde(default)]
    pub user_rate_limiter: RateLimiterConfig,
    pub connection_manager: ConnectionManagerConfig,
    pub dons: Vec<DonConfig>,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        check_id(
            "gateway ID",
            &self.connection_manager.auth_gateway_id,
            HANDSHAKE_GATEWAY_ID_LEN,
        )?;
        if self.connection_manager.auth_challenge_len == 0 {
            return Err(Error::InvalidConfig(String::from(
                "challenge length must be positive",
            )));
        }
        let mut don_ids = HashSet::new();
        for don in &self.dons {
            don.validate()?;
            if !don_ids.insert(don.don_id.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate DON ID {}",
                    don.don_id
                )));
            }
        }
        Ok(())
    }
}
