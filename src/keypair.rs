use crate::crypto::{
    generate_secret_key, hash_parts, public_key_to_address, sign_hash, DonPublicKey,
    DonSignature, Signer,
};
use crate::Result;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use std::fmt;

/// An secp256k1 keypair for signing gateway traffic.
#[derive(Debug, PartialEq)]
pub struct Keypair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl Keypair {
    /// Create and return a keypair with a randomly generated private key.
    pub fn new() -> Keypair {
        let secret_key = generate_secret_key();
        let public_key = PublicKey::from_secret_key(&SECP256K1, &secret_key);
        Keypair {
            secret_key,
            public_key,
        }
    }

    /// Create and return a keypair with the given bytes as the private key
    pub fn from_secret_slice(slice: &[u8]) -> Result<Keypair> {
        let secret_key = SecretKey::from_slice(slice)?;
        let public_key = PublicKey::from_secret_key(&SECP256K1, &secret_key);

        Ok(Keypair {
            secret_key,
            public_key,
        })
    }

    /// Create and return a keypair with the given hex string as the private key
    pub fn from_secret_hex(secret_hex: &str) -> Result<Keypair> {
        let stripped = secret_hex.strip_prefix("0x").unwrap_or(secret_hex);
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(stripped, &mut bytes as &mut [u8])?;
        Keypair::from_secret_slice(&bytes)
    }

    /// The node address: hex encoded compressed public key
    pub fn address(&self) -> String {
        public_key_to_address(&self.public_key.serialize())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }
}

impl Default for Keypair {
    fn default() -> Self {
        Keypair::new()
    }
}

impl Signer for Keypair {
    fn sign(&self, data: &[&[u8]]) -> Result<DonSignature> {
        sign_hash(&hash_parts(data), &self.secret_key)
    }

    fn public_key(&self) -> DonPublicKey {
        self.public_key.serialize()
    }
}

impl fmt::Display for Keypair {
    /// formats a Keypair without leaking the secret key
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "address:{}", self.address())
    }
}
