use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use smp_agent_api::types::{ConnId, QueueId, ServerRef};

pub fn random_id(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn new_conn_id() -> ConnId {
    ConnId::new(random_id(12))
}

/// Identity of a send-pipeline worker: one per sender-side queue address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SndWorkerKey {
    pub server: ServerRef,
    pub snd_id: QueueId,
}

/// Key of the rotation buffer: the receive-side address messages arrive on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RcvQueueKey {
    pub server: ServerRef,
    pub rcv_id: QueueId,
}
