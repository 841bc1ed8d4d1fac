use crate::crypto::{pad, unpad, CryptoError, DhKeyPair};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

const BOX_INFO: &[u8] = b"smp-agent:queue-box:v1";

/// SMP client-layer sealed box: an ephemeral DH public key, an explicit
/// nonce, and the AEAD ciphertext. The very first confirmation on a queue is
/// opened with the one-time DH derived from `dh_public`; later messages the
/// same way, so the receiver keeps no per-sender box state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientEnvelope {
    pub dh_public: [u8; 32],
    pub nonce: [u8; 24],
    pub ciphertext: Vec<u8>,
}

pub fn seal(
    recipient_public: &[u8; 32],
    plaintext: &[u8],
    padded_len: usize,
) -> Result<ClientEnvelope, CryptoError> {
    let ephemeral = DhKeyPair::generate();
    let key = derive_key(ephemeral.dh(recipient_public));
    let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::BadKey)?;
    let mut nonce = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut nonce);
    let padded = pad(plaintext, padded_len)?;
    let dh_public = ephemeral.public();
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: &padded,
                aad: &dh_public,
            },
        )
        .map_err(|_| CryptoError::Encrypt)?;
    Ok(ClientEnvelope {
        dh_public,
        nonce,
        ciphertext,
    })
}

pub fn open(recipient: &DhKeyPair, envelope: &ClientEnvelope) -> Result<Vec<u8>, CryptoError> {
    let key = derive_key(recipient.dh(&envelope.dh_public));
    let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::BadKey)?;
    let padded = cipher
        .decrypt(
            XNonce::from_slice(&envelope.nonce),
            Payload {
                msg: envelope.ciphertext.as_slice(),
                aad: &envelope.dh_public,
            },
        )
        .map_err(|_| CryptoError::Decrypt)?;
    unpad(&padded)
}

pub fn encode(envelope: &ClientEnvelope) -> Result<Vec<u8>, CryptoError> {
    serde_json::to_vec(envelope).map_err(|_| CryptoError::Encrypt)
}

pub fn decode(bytes: &[u8]) -> Result<ClientEnvelope, CryptoError> {
    serde_json::from_slice(bytes).map_err(|_| CryptoError::Decrypt)
}

fn derive_key(shared: [u8; 32]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, &shared);
    let mut okm = [0u8; 32];
    let _ = hkdf.expand(BOX_INFO, &mut okm);
    okm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let recipient = DhKeyPair::generate();
        let envelope = seal(&recipient.public(), b"confirmation-body", 256).expect("seal");
        let plain = open(&recipient, &envelope).expect("open");
        assert_eq!(plain, b"confirmation-body");
    }

    #[test]
    fn ciphertext_is_padded_length() {
        let recipient = DhKeyPair::generate();
        let short = seal(&recipient.public(), b"a", 256).expect("seal");
        let long = seal(&recipient.public(), &[7u8; 200], 256).expect("seal");
        assert_eq!(short.ciphertext.len(), long.ciphertext.len());
    }

    #[test]
    fn tampering_fails_decrypt() {
        let recipient = DhKeyPair::generate();
        let mut envelope = seal(&recipient.public(), b"body", 128).expect("seal");
        envelope.ciphertext[0] ^= 0xFF;
        assert_eq!(open(&recipient, &envelope), Err(CryptoError::Decrypt));
    }

    #[test]
    fn wrong_recipient_fails_decrypt() {
        let recipient = DhKeyPair::generate();
        let other = DhKeyPair::generate();
        let envelope = seal(&recipient.public(), b"body", 128).expect("seal");
        assert_eq!(open(&other, &envelope), Err(CryptoError::Decrypt));
    }
}
