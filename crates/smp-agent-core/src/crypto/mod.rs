pub mod boxes;
pub mod ratchet;
pub mod x3dh;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("decrypt")]
    Decrypt,
    #[error("encrypt")]
    Encrypt,
    #[error("padding")]
    Padding,
    #[error("missing remote ratchet key")]
    MissingRemoteKey,
    #[error("too many skipped keys")]
    TooManySkipped,
    #[error("bad key material")]
    BadKey,
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// X25519 pair held as raw bytes so ratchet and queue records stay serde-plain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DhKeyPair {
    public: [u8; 32],
    secret: [u8; 32],
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret).to_bytes();
        Self {
            public,
            secret: secret.to_bytes(),
        }
    }

    pub fn public(&self) -> [u8; 32] {
        self.public
    }

    pub fn dh(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(self.secret);
        secret
            .diffie_hellman(&X25519Public::from(*peer_public))
            .to_bytes()
    }
}

/// Ed25519 pair used for relay queue command authentication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignKeyPair {
    verify: [u8; 32],
    secret: [u8; 32],
}

impl SignKeyPair {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self {
            verify: signing.verifying_key().to_bytes(),
            secret: signing.to_bytes(),
        }
    }

    pub fn verify_key(&self) -> [u8; 32] {
        self.verify
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let signing = SigningKey::from_bytes(&self.secret);
        signing.sign(msg).to_bytes().to_vec()
    }
}

pub fn verify_signature(verify_key: &[u8; 32], msg: &[u8], signature: &[u8]) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(verify_key) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    vk.verify(msg, &sig).is_ok()
}

/// Pads to a fixed protocol length: u16 length prefix, payload, zero fill.
pub fn pad(plaintext: &[u8], padded_len: usize) -> Result<Vec<u8>, CryptoError> {
    if plaintext.len() + 2 > padded_len || plaintext.len() > u16::MAX as usize {
        return Err(CryptoError::Padding);
    }
    let mut out = Vec::with_capacity(padded_len);
    out.extend_from_slice(&(plaintext.len() as u16).to_be_bytes());
    out.extend_from_slice(plaintext);
    out.resize(padded_len, 0);
    Ok(out)
}

pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if padded.len() < 2 {
        return Err(CryptoError::Padding);
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if 2 + len > padded.len() {
        return Err(CryptoError::Padding);
    }
    Ok(padded[2..2 + len].to_vec())
}
