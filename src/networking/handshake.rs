use std::convert::TryInto;

use crate::crypto::{DonSignature, SIGNATURE_LEN};

pub const HANDSHAKE_TIMESTAMP_LEN: usize = 4;
pub const HANDSHAKE_DON_ID_LEN: usize = 64;
pub const HANDSHAKE_GATEWAY_ID_LEN: usize = 64;
pub const HANDSHAKE_SIGNATURE_LEN: usize = SIGNATURE_LEN;
pub const HANDSHAKE_AUTH_HEADER_LEN: usize = HANDSHAKE_TIMESTAMP_LEN
    + HANDSHAKE_DON_ID_LEN
    + HANDSHAKE_GATEWAY_ID_LEN
    + HANDSHAKE_SIGNATURE_LEN;
pub const HANDSHAKE_ENCODED_AUTH_HEADER_MAX_LEN: usize = 512;
pub const HANDSHAKE_CHALLENGE_MIN_LEN: usize = HANDSHAKE_TIMESTAMP_LEN + HANDSHAKE_GATEWAY_ID_LEN;

/// HTTP header carrying the hex encoded auth header on the websocket upgrade request.
pub const AUTH_HEADER_NAME: &str = "authorization";
/// HTTP header carrying the hex encoded challenge on the upgrade response.
pub const CHALLENGE_HEADER_NAME: &str = "challenge";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("invalid gateway ID")]
    InvalidGateway,
    #[error("timestamp outside of tolerance window")]
    InvalidTimestamp,
    #[error("challenge too short")]
    ChallengeTooShort,
    #[error("unable to parse auth header")]
    AuthHeaderParse,
    #[error("unable to parse challenge")]
    ChallengeParse,
    #[error("signer is not a DON member")]
    InvalidSigner,
    #[error("unknown handshake attempt")]
    UnknownAttempt,
    #[error("identifier longer than {0} bytes")]
    IdTooLong(usize),
    #[error("missing challenge header")]
    MissingChallenge,
}

/// The part of the auth header covered by the node's signature.
///
/// ```bytes
/// 0-3       timestamp (big-endian u32, seconds)
/// 4-67      don_id (zero padded)
/// 68-131    gateway_id (zero padded)
/// 132-196   signature over bytes 0-131
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeaderElems {
    pub timestamp: u32,
    pub don_id: String,
    pub gateway_id: String,
}

/// Challenge issued by the gateway, signed back verbatim by the node.
///
/// ```bytes
/// 0-3       timestamp (big-endian u32, seconds)
/// 4-67      gateway_id (zero padded)
/// 68..      challenge nonce
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeElems {
    pub timestamp: u32,
    pub gateway_id: String,
    pub challenge_bytes: Vec<u8>,
}

fn pad_id(id: &str, len: usize) -> Result<Vec<u8>, HandshakeError> {
    if id.len() > len {
        return Err(HandshakeError::IdTooLong(len));
    }
    let mut bytes = id.as_bytes().to_vec();
    bytes.resize(len, 0);
    Ok(bytes)
}

fn unpad_id(bytes: &[u8]) -> Option<String> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    if bytes[end..].iter().any(|b| *b != 0) {
        return None;
    }
    String::from_utf8(bytes[..end].to_vec()).ok()
}

pub fn pack_auth_header(elems: &AuthHeaderElems) -> Result<Vec<u8>, HandshakeError> {
    let mut vbytes: Vec<u8> = vec![];
    vbytes.extend(&elems.timestamp.to_be_bytes());
    vbytes.extend(pad_id(&elems.don_id, HANDSHAKE_DON_ID_LEN)?);
    vbytes.extend(pad_id(&elems.gateway_id, HANDSHAKE_GATEWAY_ID_LEN)?);
    Ok(vbytes)
}

/// Split a full auth header into its elements, the signed prefix and the signature.
pub fn unpack_auth_header(
    bytes: &[u8],
) -> Result<(AuthHeaderElems, Vec<u8>, DonSignature), HandshakeError> {
    if bytes.len() != HANDSHAKE_AUTH_HEADER_LEN {
        return Err(HandshakeError::AuthHeaderParse);
    }
    let signed_len = HANDSHAKE_AUTH_HEADER_LEN - HANDSHAKE_SIGNATURE_LEN;
    let timestamp = u32::from_be_bytes(
        bytes[0..HANDSHAKE_TIMESTAMP_LEN]
            .try_into()
            .map_err(|_| HandshakeError::AuthHeaderParse)?,
    );
    let don_start = HANDSHAKE_TIMESTAMP_LEN;
    let gateway_start = don_start + HANDSHAKE_DON_ID_LEN;
    let don_id = unpad_id(&bytes[don_start..gateway_start]).ok_or(HandshakeError::AuthHeaderParse)?;
    let gateway_id =
        unpad_id(&bytes[gateway_start..signed_len]).ok_or(HandshakeError::AuthHeaderParse)?;
    let signature: DonSignature = bytes[signed_len..]
        .try_into()
        .map_err(|_| HandshakeError::AuthHeaderParse)?;
    Ok((
        AuthHeaderElems {
            timestamp,
            don_id,
            gateway_id,
        },
        bytes[..signed_len].to_vec(),
        signature,
    ))
}

pub fn pack_challenge(elems: &ChallengeElems) -> Result<Vec<u8>, HandshakeError> {
    let mut vbytes: Vec<u8> = vec![];
    vbytes.extend(&elems.timestamp.to_be_bytes());
    vbytes.extend(pad_id(&elems.gateway_id, HANDSHAKE_GATEWAY_ID_LEN)?);
    vbytes.extend(&elems.challenge_bytes);
    Ok(vbytes)
}

pub fn unpack_challenge(bytes: &[u8]) -> Result<ChallengeElems, HandshakeError> {
    if bytes.len() < HANDSHAKE_CHALLENGE_MIN_LEN {
        return Err(HandshakeError::ChallengeParse);
    }
    let timestamp = u32::from_be_bytes(
        bytes[0..HANDSHAKE_TIMESTAMP_LEN]
            .try_into()
            .map_err(|_| HandshakeError::ChallengeParse)?,
    );
    let gateway_id = unpad_id(&bytes[HANDSHAKE_TIMESTAMP_LEN..HANDSHAKE_CHALLENGE_MIN_LEN])
        .ok_or(HandshakeError::ChallengeParse)?;
    Ok(ChallengeElems {
        timestamp,
        gateway_id,
        challenge_bytes: bytes[HANDSHAKE_CHALLENGE_MIN_LEN..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{public_key_to_address, recover_signer, Signer};
    use crate::keypair::Keypair;

    #[test]
    fn test_auth_header_pack_unpack() {
        let keypair = Keypair::new();
        let elems = AuthHeaderElems {
            timestamp: 1_700_000_000,
            don_id: String::from("don_1"),
            gateway_id: String::from("gateway_1"),
        };
        let mut header = pack_auth_header(&elems).unwrap();
        let signature = keypair.sign(&[&header]).unwrap();
        header.extend(&signature);
        assert_eq!(header.len(), HANDSHAKE_AUTH_HEADER_LEN);

        let (unpacked, signed, sig) = unpack_auth_header(&header).unwrap();
        assert_eq!(unpacked, elems);
        assert_eq!(sig, signature);
        let signer = recover_signer(&[&signed], &sig).unwrap();
        assert_eq!(public_key_to_address(&signer), keypair.address());
    }

    #[test]
    fn test_auth_header_rejects_bad_input() {
        assert_eq!(
            unpack_auth_header(&[0u8; 10]),
            Err(HandshakeError::AuthHeaderParse)
        );

        let long_id = AuthHeaderElems {
            timestamp: 1,
            don_id: "d".repeat(HANDSHAKE_DON_ID_LEN + 1),
            gateway_id: String::from("g"),
        };
        assert_eq!(
            pack_auth_header(&long_id),
            Err(HandshakeError::IdTooLong(HANDSHAKE_DON_ID_LEN))
        );

        // bytes after the padding terminator are not allowed
        let mut header = pack_auth_header(&AuthHeaderElems {
            timestamp: 1,
            don_id: String::from("don"),
            gateway_id: String::from("gw"),
        })
        .unwrap();
        header[HANDSHAKE_TIMESTAMP_LEN + 10] = b'x';
        header.extend(&[0u8; HANDSHAKE_SIGNATURE_LEN]);
        assert_eq!(
            unpack_auth_header(&header),
            Err(HandshakeError::AuthHeaderParse)
        );
    }

    #[test]
    fn test_challenge_pack_unpack() {
        let elems = ChallengeElems {
            timestamp: 42,
            gateway_id: String::from("gateway_1"),
            challenge_bytes: vec![7u8; 32],
        };
        let packed = pack_challenge(&elems).unwrap();
        assert_eq!(packed.len(), HANDSHAKE_CHALLENGE_MIN_LEN + 32);
        assert_eq!(unpack_challenge(&packed).unwrap(), elems);
        assert_eq!(
            unpack_challenge(&packed[..HANDSHAKE_CHALLENGE_MIN_LEN - 1]),
            Err(HandshakeError::ChallengeParse)
        );
    }
}
