use rand::RngCore;
use secp256k1::recovery::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};

use crate::{Error, Result};

pub type DonHash = [u8; 32];
pub type DonPublicKey = [u8; 33];
/// Compact recoverable signature: `r || s || recovery_id`.
pub type DonSignature = [u8; 65];

pub const SIGNATURE_LEN: usize = 65;

/// Anything able to produce recoverable signatures over a list of byte slices.
///
/// The slices are concatenated and hashed before signing, so
/// `sign(&[a, b])` and `sign(&[&[a, b].concat()])` produce the same signature.
pub trait Signer: Send + Sync {
    fn sign(&self, data: &[&[u8]]) -> Result<DonSignature>;
    fn public_key(&self) -> DonPublicKey;
}

pub fn hash(data: &[u8]) -> DonHash {
    *blake3::hash(data).as_bytes()
}

pub fn hash_parts(parts: &[&[u8]]) -> DonHash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

pub fn sign_hash(hash: &DonHash, secret_key: &SecretKey) -> Result<DonSignature> {
    let msg = Message::from_slice(hash)?;
    let (recovery_id, compact) = SECP256K1.sign_recoverable(&msg, secret_key).serialize_compact();
    let mut signature = [0u8; SIGNATURE_LEN];
    signature[..64].copy_from_slice(&compact);
    signature[64] = recovery_id.to_i32() as u8;
    Ok(signature)
}

/// Recover the compressed public key that produced `signature` over `hash`.
pub fn recover_public_key(hash: &DonHash, signature: &[u8]) -> Result<DonPublicKey> {
    if signature.len() != SIGNATURE_LEN {
        return Err(Error::InvalidSignature(format!(
            "expected {} bytes, got {}",
            SIGNATURE_LEN,
            signature.len()
        )));
    }
    let recovery_id = RecoveryId::from_i32(signature[64] as i32)?;
    let recoverable = RecoverableSignature::from_compact(&signature[..64], recovery_id)?;
    let msg = Message::from_slice(hash)?;
    let public_key = SECP256K1.recover(&msg, &recoverable)?;
    Ok(public_key.serialize())
}

pub fn recover_signer(data: &[&[u8]], signature: &[u8]) -> Result<DonPublicKey> {
    recover_public_key(&hash_parts(data), signature)
}

pub fn verify(hash: &DonHash, signature: &[u8], public_key: &DonPublicKey) -> bool {
    match recover_public_key(hash, signature) {
        Ok(recovered) => &recovered == public_key,
        Err(_) => false,
    }
}

pub fn public_key_to_address(public_key: &DonPublicKey) -> String {
    encode_hex(public_key)
}

pub fn address_to_public_key(address: &str) -> Result<DonPublicKey> {
    let bytes = decode_hex(address)?;
    let public_key = PublicKey::from_slice(&bytes)?;
    Ok(public_key.serialize())
}

/// Addresses are compared case-insensitively and with or without the `0x` prefix.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", stripped.to_lowercase())
}

pub fn encode_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

pub fn decode_hex(value: &str) -> Result<Vec<u8>> {
    let stripped = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    Ok(hex::decode(stripped)?)
}

pub fn generate_random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

pub fn generate_secret_key() -> SecretKey {
    loop {
        // out-of-range scalars are astronomically unlikely but still rejected
        if let Ok(secret_key) = SecretKey::from_slice(&generate_random_bytes(32)) {
            return secret_key;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_parts_matches_concatenation() {
        let joined = hash(b"helloworld");
        assert_eq!(hash_parts(&[b"hello", b"world"]), joined);
        assert_ne!(hash_parts(&[b"hello", b"world!"]), joined);
    }

    #[test]
    fn sign_and_recover() {
        let secret_key = generate_secret_key();
        let public_key = PublicKey::from_secret_key(&SECP256K1, &secret_key).serialize();
        let digest = hash(b"gateway");

        let signature = sign_hash(&digest, &secret_key).unwrap();
        assert_eq!(recover_public_key(&digest, &signature).unwrap(), public_key);
        assert!(verify(&digest, &signature, &public_key));
        assert!(!verify(&hash(b"other"), &signature, &public_key));
    }

    #[test]
    fn recover_rejects_malformed_signatures() {
        let digest = hash(b"gateway");
        assert!(recover_public_key(&digest, &[0u8; 10]).is_err());

        let mut bad_recovery_id = [1u8; SIGNATURE_LEN];
        bad_recovery_id[64] = 9;
        assert!(recover_public_key(&digest, &bad_recovery_id).is_err());
    }

    #[test]
    fn address_normalization() {
        assert_eq!(normalize_address("0xABcd"), "0xabcd");
        assert_eq!(normalize_address("ABcd"), "0xabcd");
        assert_eq!(normalize_address(" 0Xab "), "0xab");
    }

    #[test]
    fn address_round_trip() {
        let secret_key = generate_secret_key();
        let public_key = PublicKey::from_secret_key(&SECP256K1, &secret_key).serialize();
        let address = public_key_to_address(&public_key);
        assert!(address.starts_with("0x"));
        assert_eq!(address_to_public_key(&address).unwrap(), public_key);
        assert!(address_to_public_key("0x1234").is_err());
    }
}
