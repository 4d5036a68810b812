use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

use crate::aggregation::signer_set::SignerSet;
use crate::api::jsonrpc::JsonRpcResponse;
use crate::crypto::{decode_hex, encode_hex, hash, hash_parts, recover_public_key, DonHash, Signer};
use crate::{Error, Result};

/// Config digest (32 bytes) followed by the zero padded epoch and round (32 bytes).
pub const REPORT_CONTEXT_MIN_LEN: usize = 64;

/// A report signed by several DON members, carried as the `result` of a node response.
///
/// ```json
/// {"payload": {...}, "context": "0x...", "signatures": ["0x...", "0x..."]}
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignedResponse {
    pub payload: Value,
    #[serde(with = "hex_bytes")]
    pub context: Vec<u8>,
    #[serde(with = "hex_bytes_list")]
    pub signatures: Vec<Vec<u8>>,
}

impl SignedResponse {
    /// Collect one signature per signer over `payload` in `context`.
    pub fn sign(payload: Value, context: Vec<u8>, signers: &[&dyn Signer]) -> Result<Self> {
        let mut response = SignedResponse {
            payload,
            context,
            signatures: vec![],
        };
        let payload_hash = response.payload_hash()?;
        for signer in signers {
            let signature = signer.sign(&[&payload_hash[..], &response.context[..]])?;
            response.signatures.push(signature.to_vec());
        }
        Ok(response)
    }

    /// `None` when the response does not carry a signed report.
    pub fn from_response(response: &JsonRpcResponse) -> Option<Self> {
        let result = response.result.as_ref()?;
        serde_json::from_value(result.clone()).ok()
    }

    /// The hash every member signs: `hash(hash(payload) || context)`.
    pub fn signing_hash(&self) -> Result<DonHash> {
        Ok(hash_parts(&[&self.payload_hash()?[..], &self.context[..]]))
    }

    fn payload_hash(&self) -> Result<DonHash> {
        Ok(hash(&serde_json::to_vec(&self.payload)?))
    }
}

/// Check that at least `min_required` distinct members of `signers` signed `response`.
///
/// Signatures that fail to recover, or recover to keys outside the set, are skipped rather than
/// failing the whole report. Returns the number of distinct valid signers seen.
pub fn validate_signatures(
    response: &SignedResponse,
    signers: &SignerSet,
    min_required: usize,
) -> Result<usize> {
    if response.context.len() < REPORT_CONTEXT_MIN_LEN {
        return Err(Error::InvalidSignature(format!(
            "context too short: expected min {} bytes, got {} bytes",
            REPORT_CONTEXT_MIN_LEN,
            response.context.len()
        )));
    }
    if response.signatures.len() < min_required {
        return Err(Error::NotEnoughSignatures {
            valid: 0,
            required: min_required,
        });
    }

    let signing_hash = response.signing_hash()?;
    let mut valid_signers = HashSet::new();
    for signature in &response.signatures {
        match recover_public_key(&signing_hash, signature) {
            Ok(signer) if signers.contains(&signer) => {
                valid_signers.insert(signer);
                if valid_signers.len() >= min_required {
                    return Ok(valid_signers.len());
                }
            }
            Ok(_) => debug!("signature from a key outside the signer set"),
            Err(err) => debug!(%err, "skipping unrecoverable signature"),
        }
    }
    Err(Error::NotEnoughSignatures {
        valid: valid_signers.len(),
        required: min_required,
    })
}

mod hex_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode_hex(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;
        decode_hex(&value).map_err(serde::de::Error::custom)
    }
}

mod hex_bytes_list {
    use super::*;

    pub fn serialize<S: Serializer>(
        list: &[Vec<u8>],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let encoded: Vec<String> = list.iter().map(|bytes| encode_hex(bytes)).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<Vec<u8>>, D::Error> {
        let values = Vec::<String>::deserialize(deserializer)?;
        values
            .iter()
            .map(|value| decode_hex(value).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::Keypair;
    use serde_json::json;

    fn context() -> Vec<u8> {
        let mut context = vec![0u8; REPORT_CONTEXT_MIN_LEN];
        context[..32].copy_from_slice(&hash(b"config digest"));
        context[59..63].copy_from_slice(&7u32.to_be_bytes());
        context
    }

    fn dons(n: usize) -> (Vec<Keypair>, SignerSet) {
        let keys: Vec<Keypair> = (0..n).map(|_| Keypair::new()).collect();
        let set = SignerSet::new(1, keys.iter().map(|k| Signer::public_key(k)));
        (keys, set)
    }

    #[test]
    fn test_enough_distinct_signers() {
        let (keys, set) = dons(4);
        let signers: Vec<&dyn Signer> = keys.iter().take(3).map(|k| k as &dyn Signer).collect();
        let response = SignedResponse::sign(json!({"value": 42}), context(), &signers).unwrap();
        assert_eq!(validate_signatures(&response, &set, 3).unwrap(), 3);
    }

    #[test]
    fn test_duplicate_and_foreign_signatures_do_not_count() {
        let (keys, set) = dons(4);
        let outsider = Keypair::new();
        let signers: Vec<&dyn Signer> = vec![
            &keys[0] as &dyn Signer,
            &keys[0],
            &outsider,
            &keys[1],
        ];
        let mut response = SignedResponse::sign(json!("report"), context(), &signers).unwrap();
        response.signatures.push(vec![0u8; 65]);
        assert!(matches!(
            validate_signatures(&response, &set, 3),
            Err(Error::NotEnoughSignatures {
                valid: 2,
                required: 3
            })
        ));
    }

    #[test]
    fn test_short_context_is_rejected() {
        let (keys, set) = dons(1);
        let signers: Vec<&dyn Signer> = vec![&keys[0] as &dyn Signer];
        let response = SignedResponse::sign(json!(1), vec![0u8; 10], &signers).unwrap();
        assert!(matches!(
            validate_signatures(&response, &set, 1),
            Err(Error::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let (keys, set) = dons(3);
        let signers: Vec<&dyn Signer> = keys.iter().map(|k| k as &dyn Signer).collect();
        let mut response = SignedResponse::sign(json!({"v": 1}), context(), &signers).unwrap();
        response.payload = json!({"v": 2});
        assert!(validate_signatures(&response, &set, 1).is_err());
    }

    #[test]
    fn test_from_response_reads_result() {
        let (keys, _) = dons(1);
        let signers: Vec<&dyn Signer> = vec![&keys[0] as &dyn Signer];
        let signed = SignedResponse::sign(json!({"v": 1}), context(), &signers).unwrap();
        let response =
            JsonRpcResponse::success("1", "vault.get", serde_json::to_value(&signed).unwrap());
        assert_eq!(SignedResponse::from_response(&response), Some(signed));

        let plain = JsonRpcResponse::success("1", "vault.get", json!({"v": 1}));
        assert_eq!(SignedResponse::from_response(&plain), None);
    }
}
