use crate::crypto::{pad, unpad, CryptoError, DhKeyPair};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;

const ROOT_INFO: &[u8] = b"smp-agent:ratchet:root:v1";
const CHAIN_INFO: &[u8] = b"smp-agent:ratchet:chain:v1";
const DEFAULT_MAX_SKIP: u32 = 512;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RatchetHeader {
    pub dh_public: [u8; 32],
    pub prev_n: u32,
    pub msg_n: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RatchetedMessage {
    pub header: RatchetHeader,
    pub nonce: [u8; 24],
    pub ciphertext: Vec<u8>,
}

pub fn encode_msg(msg: &RatchetedMessage) -> Result<Vec<u8>, CryptoError> {
    serde_json::to_vec(msg).map_err(|_| CryptoError::Encrypt)
}

pub fn decode_msg(bytes: &[u8]) -> Result<RatchetedMessage, CryptoError> {
    serde_json::from_slice(bytes).map_err(|_| CryptoError::Decrypt)
}

/// Message key retained for an out-of-order message, keyed by the header key
/// it was derived under and the message number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkippedEntry {
    pub header_key: [u8; 32],
    pub msg_n: u32,
    pub msg_key: [u8; 32],
}

#[derive(Clone, Debug, Default)]
pub struct SkippedKeys {
    map: HashMap<([u8; 32], u32), [u8; 32]>,
}

impl SkippedKeys {
    pub fn from_entries(entries: Vec<SkippedEntry>) -> Self {
        let mut map = HashMap::new();
        for entry in entries {
            map.insert((entry.header_key, entry.msg_n), entry.msg_key);
        }
        Self { map }
    }

    pub fn to_entries(&self) -> Vec<SkippedEntry> {
        self.map
            .iter()
            .map(|((header_key, msg_n), msg_key)| SkippedEntry {
                header_key: *header_key,
                msg_n: *msg_n,
                msg_key: *msg_key,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn insert(&mut self, header_key: [u8; 32], msg_n: u32, msg_key: [u8; 32]) {
        self.map.insert((header_key, msg_n), msg_key);
    }

    fn take(&mut self, header_key: &[u8; 32], msg_n: u32) -> Option<[u8; 32]> {
        self.map.remove(&(*header_key, msg_n))
    }
}

/// What one decrypt did to the skipped-key set; persisted atomically with the
/// ratchet state and the decrypted message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SkippedDiff {
    pub added: Vec<SkippedEntry>,
    pub consumed: Vec<([u8; 32], u32)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecryptOutcome {
    Plaintext(Vec<u8>),
    Duplicate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RatchetState {
    root_key: [u8; 32],
    dh_self: DhKeyPair,
    dh_remote: Option<[u8; 32]>,
    send_chain: Option<[u8; 32]>,
    recv_chain: Option<[u8; 32]>,
    send_n: u32,
    recv_n: u32,
    prev_send_n: u32,
    max_skip: u32,
}

impl RatchetState {
    /// Sending side: the joiner knows the peer's ratchet key from the
    /// connection request and can encrypt immediately.
    pub fn init_snd(root_key: [u8; 32], self_pair: DhKeyPair, remote_public: [u8; 32]) -> Self {
        Self {
            root_key,
            dh_self: self_pair,
            dh_remote: Some(remote_public),
            send_chain: None,
            recv_chain: None,
            send_n: 0,
            recv_n: 0,
            prev_send_n: 0,
            max_skip: DEFAULT_MAX_SKIP,
        }
    }

    /// Receiving side: must decrypt one message before it can send.
    pub fn init_rcv(root_key: [u8; 32], self_pair: DhKeyPair) -> Self {
        Self {
            root_key,
            dh_self: self_pair,
            dh_remote: None,
            send_chain: None,
            recv_chain: None,
            send_n: 0,
            recv_n: 0,
            prev_send_n: 0,
            max_skip: DEFAULT_MAX_SKIP,
        }
    }

    pub fn encrypt(
        &mut self,
        padded_len: usize,
        plaintext: &[u8],
    ) -> Result<RatchetedMessage, CryptoError> {
        if self.send_chain.is_none() {
            self.dh_ratchet_send()?;
        }
        let chain = self.send_chain.as_mut().ok_or(CryptoError::Encrypt)?;
        let (next_chain, msg_key) = kdf_chain(chain);
        *chain = next_chain;
        let header = RatchetHeader {
            dh_public: self.dh_self.public(),
            prev_n: self.prev_send_n,
            msg_n: self.send_n,
        };
        self.send_n += 1;
        let padded = pad(plaintext, padded_len)?;
        let mut nonce = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = seal(&msg_key, &nonce, &padded, &header)?;
        Ok(RatchetedMessage {
            header,
            nonce,
            ciphertext,
        })
    }

    pub fn decrypt(
        &mut self,
        skipped: &mut SkippedKeys,
        msg: &RatchetedMessage,
    ) -> Result<(DecryptOutcome, SkippedDiff), CryptoError> {
        let mut diff = SkippedDiff::default();
        let header_key = msg.header.dh_public;
        let msg_key = if let Some(key) = skipped.take(&header_key, msg.header.msg_n) {
            diff.consumed.push((header_key, msg.header.msg_n));
            key
        } else {
            if self.dh_remote != Some(header_key) {
                self.skip_to(msg.header.prev_n, skipped, &mut diff)?;
                self.dh_ratchet_receive(header_key);
            } else if msg.header.msg_n < self.recv_n {
                // key already consumed and not retained: replayed envelope
                return Ok((DecryptOutcome::Duplicate, diff));
            }
            self.skip_to(msg.header.msg_n, skipped, &mut diff)?;
            let chain = self.recv_chain.as_mut().ok_or(CryptoError::Decrypt)?;
            let (next_chain, key) = kdf_chain(chain);
            *chain = next_chain;
            self.recv_n += 1;
            key
        };
        let padded = open(&msg_key, &msg.nonce, &msg.ciphertext, &msg.header)?;
        let plaintext = unpad(&padded)?;
        Ok((DecryptOutcome::Plaintext(plaintext), diff))
    }

    fn dh_ratchet_send(&mut self) -> Result<(), CryptoError> {
        let remote = self.dh_remote.ok_or(CryptoError::MissingRemoteKey)?;
        self.dh_self = DhKeyPair::generate();
        let dh_out = self.dh_self.dh(&remote);
        let (root, chain) = kdf_root(&self.root_key, &dh_out);
        self.root_key = root;
        self.send_chain = Some(chain);
        self.prev_send_n = self.send_n;
        self.send_n = 0;
        Ok(())
    }

    fn dh_ratchet_receive(&mut self, remote_public: [u8; 32]) {
        let dh_out = self.dh_self.dh(&remote_public);
        let (root, chain) = kdf_root(&self.root_key, &dh_out);
        self.root_key = root;
        self.recv_chain = Some(chain);
        self.send_chain = None;
        self.recv_n = 0;
        self.dh_remote = Some(remote_public);
    }

    fn skip_to(
        &mut self,
        until: u32,
        skipped: &mut SkippedKeys,
        diff: &mut SkippedDiff,
    ) -> Result<(), CryptoError> {
        let Some(header_key) = self.dh_remote else {
            return Ok(());
        };
        let Some(chain) = self.recv_chain.as_mut() else {
            return Ok(());
        };
        if until > self.recv_n.saturating_add(self.max_skip) {
            return Err(CryptoError::TooManySkipped);
        }
        while self.recv_n < until {
            let (next_chain, msg_key) = kdf_chain(chain);
            *chain = next_chain;
            skipped.insert(header_key, self.recv_n, msg_key);
            diff.added.push(SkippedEntry {
                header_key,
                msg_n: self.recv_n,
                msg_key,
            });
            self.recv_n += 1;
        }
        Ok(())
    }
}

fn kdf_root(root: &[u8; 32], dh_out: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let hkdf = Hkdf::<Sha256>::new(Some(root), dh_out);
    let mut okm = [0u8; 64];
    let _ = hkdf.expand(ROOT_INFO, &mut okm);
    let mut new_root = [0u8; 32];
    let mut chain = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    (new_root, chain)
}

fn kdf_chain(chain: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let hkdf = Hkdf::<Sha256>::new(None, chain);
    let mut okm = [0u8; 64];
    let _ = hkdf.expand(CHAIN_INFO, &mut okm);
    let mut next = [0u8; 32];
    let mut msg_key = [0u8; 32];
    next.copy_from_slice(&okm[..32]);
    msg_key.copy_from_slice(&okm[32..]);
    (next, msg_key)
}

fn header_aad(header: &RatchetHeader) -> Vec<u8> {
    let mut aad = Vec::with_capacity(40);
    aad.extend_from_slice(&header.dh_public);
    aad.extend_from_slice(&header.prev_n.to_be_bytes());
    aad.extend_from_slice(&header.msg_n.to_be_bytes());
    aad
}

fn seal(
    key: &[u8; 32],
    nonce: &[u8; 24],
    padded: &[u8],
    header: &RatchetHeader,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::BadKey)?;
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: padded,
                aad: &header_aad(header),
            },
        )
        .map_err(|_| CryptoError::Encrypt)
}

fn open(
    key: &[u8; 32],
    nonce: &[u8; 24],
    ciphertext: &[u8],
    header: &RatchetHeader,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::BadKey)?;
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &header_aad(header),
            },
        )
        .map_err(|_| CryptoError::Decrypt)
}
