use crate::crypto::DhKeyPair;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use smp_agent_api::types::E2eParams;

const X3DH_INFO: &[u8] = b"smp-agent:x3dh:v1";

/// A side's private X3DH material: long-lived identity DH pair plus the pair
/// that seeds the ratchet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct X3dhKeys {
    pub identity: DhKeyPair,
    pub ratchet: DhKeyPair,
}

impl X3dhKeys {
    pub fn generate() -> Self {
        Self {
            identity: DhKeyPair::generate(),
            ratchet: DhKeyPair::generate(),
        }
    }

    pub fn params(&self, version: u16) -> E2eParams {
        E2eParams {
            version,
            identity_key: self.identity.public(),
            ratchet_key: self.ratchet.public(),
        }
    }
}

/// Root key on the joining (sending) side.
pub fn snd_side(own: &X3dhKeys, peer: &E2eParams) -> [u8; 32] {
    let dh1 = own.identity.dh(&peer.identity_key);
    let dh2 = own.ratchet.dh(&peer.ratchet_key);
    let dh3 = own.identity.dh(&peer.ratchet_key);
    kdf(&dh1, &dh2, &dh3)
}

/// Root key on the accepting (receiving) side, mirroring `snd_side`.
pub fn rcv_side(own: &X3dhKeys, peer: &E2eParams) -> [u8; 32] {
    let dh1 = own.identity.dh(&peer.identity_key);
    let dh2 = own.ratchet.dh(&peer.ratchet_key);
    let dh3 = own.ratchet.dh(&peer.identity_key);
    kdf(&dh1, &dh2, &dh3)
}

fn kdf(dh1: &[u8; 32], dh2: &[u8; 32], dh3: &[u8; 32]) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(dh1);
    ikm.extend_from_slice(dh2);
    ikm.extend_from_slice(dh3);
    let hkdf = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = [0u8; 32];
    let _ = hkdf.expand(X3DH_INFO, &mut okm);
    okm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_same_root() {
        let initiator = X3dhKeys::generate();
        let joiner = X3dhKeys::generate();
        let snd = snd_side(&joiner, &initiator.params(2));
        let rcv = rcv_side(&initiator, &joiner.params(2));
        assert_eq!(snd, rcv);
    }

    #[test]
    fn different_peers_derive_different_roots() {
        let initiator = X3dhKeys::generate();
        let joiner = X3dhKeys::generate();
        let other = X3dhKeys::generate();
        let snd = snd_side(&joiner, &initiator.params(2));
        let wrong = snd_side(&other, &initiator.params(2));
        assert_ne!(snd, wrong);
    }
}
