//! Gateway capabilities a DON can be configured with.
//!
//! * [`quorum::QuorumHandler`] fans requests out and answers once enough members agree.
//! * [`dummy::DummyHandler`] fans requests out and answers with the first node response.

pub mod dummy;
pub mod quorum;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{Error, Result};

/// Decode a handler's JSON settings block. A missing block means all defaults.
pub fn decode_handler_config<T: DeserializeOwned + Default>(value: &Value) -> Result<T> {
    match value {
        Value::Null => Ok(T::default()),
        Value::Object(_) => serde_json::from_value(value.clone())
            .map_err(|err| Error::InvalidConfig(format!("handler config: {}", err))),
        other => Err(Error::InvalidConfig(format!(
            "handler config must be a table, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::QuorumThreshold;
    use quorum::QuorumHandlerConfig;
    use serde_json::json;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: QuorumHandlerConfig = decode_handler_config(&Value::Null).unwrap();
        assert_eq!(config, QuorumHandlerConfig::default());

        let config: QuorumHandlerConfig = decode_handler_config(&json!({
            "request_timeout_sec": 5,
            "response_threshold": "f_plus_one",
        }))
        .unwrap();
        assert_eq!(config.request_timeout_sec, 5);
        assert_eq!(config.response_threshold, QuorumThreshold::FPlusOne);
        assert_eq!(config.cleanup_period_ms, 5000);

        assert!(matches!(
            decode_handler_config::<QuorumHandlerConfig>(&json!([1, 2])),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            decode_handler_config::<QuorumHandlerConfig>(&json!(7)),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_unknown_config_keys_rejected() {
        let result = decode_handler_config::<QuorumHandlerConfig>(&json!({
            "request_timeout_secs": 5,
        }));
        match result {
            Err(Error::InvalidConfig(message)) => {
                assert!(message.contains("request_timeout_secs"), "{}", message)
            }
            other => panic!("expected InvalidConfig, got {:?}", other.map(|_| ())),
        }
    }
}
