use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{
    decode_hex, encode_hex, normalize_address, public_key_to_address, recover_signer, Signer,
};
use crate::{Error, Result};

pub const MESSAGE_ID_MAX_LEN: usize = 128;
pub const MESSAGE_METHOD_MAX_LEN: usize = 64;
pub const MESSAGE_DON_ID_MAX_LEN: usize = 64;
/// `0x` followed by a hex encoded compressed public key.
pub const MESSAGE_RECEIVER_LEN: usize = 2 + 2 * 33;

/// The part of a gateway message covered by the sender's signature.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct MessageBody {
    pub message_id: String,
    pub method: String,
    pub don_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub receiver: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub body: MessageBody,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

fn pad(value: &str, len: usize) -> Vec<u8> {
    let mut bytes = value.as_bytes().to_vec();
    bytes.resize(len.max(bytes.len()), 0);
    bytes
}

impl MessageBody {
    /// Canonical bytes a sender signs:
    ///
    /// ```bytes
    /// 0-127     message_id (zero padded)
    /// 128-191   method (zero padded)
    /// 192-255   don_id (zero padded)
    /// 256-323   receiver (zero padded)
    /// 324..     payload as canonical JSON
    /// ```
    ///
    /// The sender is not part of the signed bytes, it is recovered from the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let mut vbytes: Vec<u8> = vec![];
        vbytes.extend(pad(&self.message_id, MESSAGE_ID_MAX_LEN));
        vbytes.extend(pad(&self.method, MESSAGE_METHOD_MAX_LEN));
        vbytes.extend(pad(&self.don_id, MESSAGE_DON_ID_MAX_LEN));
        vbytes.extend(pad(&self.receiver, MESSAGE_RECEIVER_LEN));
        vbytes.extend(serde_json::to_vec(&self.payload)?);
        Ok(vbytes)
    }
}

impl Message {
    pub fn unsigned(body: MessageBody) -> Self {
        Message {
            body,
            signature: String::new(),
        }
    }

    /// Sign `body`, stamping the signer's address as the sender.
    pub fn sign(mut body: MessageBody, signer: &dyn Signer) -> Result<Self> {
        body.sender = public_key_to_address(&signer.public_key());
        let signature = signer.sign(&[&body.signing_bytes()?])?;
        Ok(Message {
            body,
            signature: encode_hex(&signature),
        })
    }

    /// Check field bounds and, when the message is signed, that the signature was produced by
    /// the declared sender. Returns the verified sender address for signed messages.
    pub fn validate(&self) -> Result<Option<String>> {
        let body = &self.body;
        if body.message_id.is_empty() || body.message_id.len() > MESSAGE_ID_MAX_LEN {
            return Err(Error::InvalidMessage(String::from("invalid message ID length")));
        }
        if body.method.is_empty() || body.method.len() > MESSAGE_METHOD_MAX_LEN {
            return Err(Error::InvalidMessage(String::from("invalid method name length")));
        }
        if body.don_id.is_empty() || body.don_id.len() > MESSAGE_DON_ID_MAX_LEN {
            return Err(Error::InvalidMessage(String::from("invalid DON ID length")));
        }
        if body.receiver.len() > MESSAGE_RECEIVER_LEN {
            return Err(Error::InvalidMessage(String::from("invalid receiver length")));
        }
        if self.signature.is_empty() {
            return Ok(None);
        }
        let signature = decode_hex(&self.signature)?;
        let signer = recover_signer(&[&body.signing_bytes()?], &signature)?;
        let signer_address = public_key_to_address(&signer);
        if normalize_address(&signer_address) != normalize_address(&body.sender) {
            return Err(Error::InvalidSignature(String::from(
                "signer address does not match sender",
            )));
        }
        Ok(Some(signer_address))
    }
}
