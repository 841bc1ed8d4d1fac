use crate::crypto::x3dh::X3dhKeys;
use crate::crypto::{DhKeyPair, SignKeyPair};
use serde::{Deserialize, Serialize};
use smp_agent_api::types::{ConnId, QueueAddr, QueueId, ServerRef, SmpQueueUri, VersionRange};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum RcvQueueStatus {
    New,
    Confirmed,
    Secured,
    Active,
    Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum SndQueueStatus {
    New,
    Confirmed,
    Active,
    Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum RotationAction {
    CreateNext,
    SecureNext,
    SuspendCurrent,
    DeleteCurrent,
}

/// Receive queue owned by this agent at a relay. `rcv_id` authenticates us to
/// the relay; `snd_id` is the address the peer sends to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RcvQueue {
    pub server: ServerRef,
    pub rcv_id: QueueId,
    pub snd_id: QueueId,
    pub sign_key: SignKeyPair,
    pub e2e_key: DhKeyPair,
    pub peer_verify_key: Option<[u8; 32]>,
    pub client_version: u16,
    pub status: RcvQueueStatus,
    pub current: bool,
    pub rotation: Option<RotationAction>,
    pub rotation_started_ms: Option<u64>,
    pub next_link: Option<QueueId>,
}

impl RcvQueue {
    pub fn uri(&self, client_version_range: VersionRange) -> SmpQueueUri {
        SmpQueueUri {
            server: self.server.clone(),
            snd_id: self.snd_id.clone(),
            dh_public: self.e2e_key.public(),
            client_version_range,
        }
    }

    pub fn addr(&self) -> QueueAddr {
        QueueAddr {
            server: self.server.clone(),
            snd_id: self.snd_id.clone(),
        }
    }
}

/// Send queue toward the peer's relay. `e2e_public` is the queue owner's DH
/// key from the queue URI; every send is sealed to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SndQueue {
    pub server: ServerRef,
    pub snd_id: QueueId,
    pub sign_key: SignKeyPair,
    pub e2e_public: [u8; 32],
    pub status: SndQueueStatus,
    pub current: bool,
    pub next_link: Option<QueueId>,
}

impl SndQueue {
    pub fn from_uri(uri: &SmpQueueUri) -> Self {
        Self {
            server: uri.server.clone(),
            snd_id: uri.snd_id.clone(),
            sign_key: SignKeyPair::generate(),
            e2e_public: uri.dh_public,
            status: SndQueueStatus::New,
            current: true,
            next_link: None,
        }
    }

    pub fn addr(&self) -> QueueAddr {
        QueueAddr {
            server: self.server.clone(),
            snd_id: self.snd_id.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum ConnVariant {
    Rcv,
    Snd,
    Duplex,
    Contact,
}

/// One logical two-party connection. Queue cross-references stay inside the
/// record; inbound routing goes through the store's `(server, rcv_id)` index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnRecord {
    pub conn_id: ConnId,
    pub variant: ConnVariant,
    pub initiator: bool,
    pub agent_version: u16,
    pub enable_ntfs: bool,
    pub duplex_handshake: Option<bool>,
    pub rcv_queues: Vec<RcvQueue>,
    pub snd_queues: Vec<SndQueue>,
    pub x3dh: Option<X3dhKeys>,
    /// Own conn info held back until the legacy REPLY arrives.
    pub pending_conn_info: Option<Vec<u8>>,
}

impl ConnRecord {
    pub fn current_rcv(&self) -> Option<&RcvQueue> {
        self.rcv_queues.iter().find(|q| q.current)
    }

    pub fn current_rcv_mut(&mut self) -> Option<&mut RcvQueue> {
        self.rcv_queues.iter_mut().find(|q| q.current)
    }

    pub fn next_rcv(&self) -> Option<&RcvQueue> {
        self.rcv_queues.iter().find(|q| !q.current)
    }

    pub fn current_snd(&self) -> Option<&SndQueue> {
        self.snd_queues.iter().find(|q| q.current)
    }

    pub fn current_snd_mut(&mut self) -> Option<&mut SndQueue> {
        self.snd_queues.iter_mut().find(|q| q.current)
    }

    pub fn next_snd(&self) -> Option<&SndQueue> {
        self.snd_queues.iter().find(|q| !q.current)
    }

    pub fn rcv_by_id(&self, rcv_id: &QueueId) -> Option<&RcvQueue> {
        self.rcv_queues.iter().find(|q| &q.rcv_id == rcv_id)
    }

    pub fn servers(&self) -> Vec<ServerRef> {
        let mut servers: Vec<ServerRef> = self
            .rcv_queues
            .iter()
            .map(|q| q.server.clone())
            .chain(self.snd_queues.iter().map(|q| q.server.clone()))
            .collect();
        servers.dedup();
        servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smp_agent_api::types::VersionRange;

    fn rq(current: bool, tag: &str) -> RcvQueue {
        RcvQueue {
            server: ServerRef::new("relay", 5223, "fp"),
            rcv_id: QueueId::new(format!("rcv-{tag}")),
            snd_id: QueueId::new(format!("snd-{tag}")),
            sign_key: SignKeyPair::generate(),
            e2e_key: DhKeyPair::generate(),
            peer_verify_key: None,
            client_version: 4,
            status: RcvQueueStatus::New,
            current,
            rotation: None,
            rotation_started_ms: None,
            next_link: None,
        }
    }

    #[test]
    fn current_and_next_queue_lookup() {
        let conn = ConnRecord {
            conn_id: ConnId::new("c1"),
            variant: ConnVariant::Duplex,
            initiator: true,
            agent_version: 2,
            enable_ntfs: false,
            duplex_handshake: Some(true),
            rcv_queues: vec![rq(true, "cur"), rq(false, "next")],
            snd_queues: Vec::new(),
            x3dh: None,
            pending_conn_info: None,
        };
        assert_eq!(conn.current_rcv().unwrap().rcv_id.value, "rcv-cur");
        assert_eq!(conn.next_rcv().unwrap().rcv_id.value, "rcv-next");
    }

    #[test]
    fn queue_uri_carries_e2e_key() {
        let queue = rq(true, "a");
        let uri = queue.uri(VersionRange::new(1, 4));
        assert_eq!(uri.dh_public, queue.e2e_key.public());
        assert_eq!(uri.snd_id, queue.snd_id);
    }
}
