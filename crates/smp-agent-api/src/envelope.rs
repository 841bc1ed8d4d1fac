use crate::error::{AgentError, AgentErrorKind};
use crate::types::{ConnectionRequest, E2eParams, QueueAddr, SmpQueueUri};
use serde::{Deserialize, Serialize};

/// Agent-layer envelope carried inside the SMP client body, visible after the
/// per-queue box decrypt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum AgentEnvelope {
    /// First message on a `New` queue: the sender's key for securing the
    /// queue, its X3DH reply parameters, and its ratchet-sealed conn info.
    Confirmation {
        agent_version: u16,
        e2e: Option<E2eParams>,
        sender_key: Option<[u8; 32]>,
        enc_conn_info: Vec<u8>,
    },
    /// Contact-queue message asking the owner to open a new connection.
    Invitation {
        conn_req: ConnectionRequest,
        conn_info: Vec<u8>,
    },
    /// Any ratchet-protected message once the connection is set up.
    Msg {
        agent_version: u16,
        enc_agent_message: Vec<u8>,
    },
}

/// Plaintext of a confirmation's `enc_conn_info`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum ConnInfoPayload {
    Info {
        conn_info: Vec<u8>,
    },
    Reply {
        queues: Vec<SmpQueueUri>,
        conn_info: Vec<u8>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrivHeader {
    pub snd_msg_id: u64,
    pub prev_msg_hash: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum AgentMsgPayload {
    Hello,
    Reply { queues: Vec<SmpQueueUri> },
    Msg { body: Vec<u8> },
    QNew { current: QueueAddr, next_uri: SmpQueueUri },
    QKeys { sender_key: [u8; 32], next_uri: SmpQueueUri },
    QReady { addr: QueueAddr },
    QTest,
    QSwitch { addr: QueueAddr },
    QHello,
}

/// Inner agent message, visible after ratchet decrypt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentMessage {
    pub header: PrivHeader,
    pub payload: AgentMsgPayload,
}

pub fn encode_envelope(envelope: &AgentEnvelope) -> Result<Vec<u8>, AgentError> {
    serde_json::to_vec(envelope).map_err(|e| AgentError::Internal(format!("envelope encode: {e}")))
}

pub fn decode_envelope(bytes: &[u8]) -> Result<AgentEnvelope, AgentError> {
    serde_json::from_slice(bytes).map_err(|_| AgentError::Agent(AgentErrorKind::Message))
}

pub fn encode_agent_message(msg: &AgentMessage) -> Result<Vec<u8>, AgentError> {
    serde_json::to_vec(msg).map_err(|e| AgentError::Internal(format!("agent msg encode: {e}")))
}

pub fn decode_agent_message(bytes: &[u8]) -> Result<AgentMessage, AgentError> {
    serde_json::from_slice(bytes).map_err(|_| AgentError::Agent(AgentErrorKind::Message))
}

pub fn encode_conn_info(payload: &ConnInfoPayload) -> Result<Vec<u8>, AgentError> {
    serde_json::to_vec(payload).map_err(|e| AgentError::Internal(format!("conn info encode: {e}")))
}

pub fn decode_conn_info(bytes: &[u8]) -> Result<ConnInfoPayload, AgentError> {
    serde_json::from_slice(bytes).map_err(|_| AgentError::Agent(AgentErrorKind::Message))
}
