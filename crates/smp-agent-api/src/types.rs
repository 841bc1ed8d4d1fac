use crate::error::{AgentError, AgentErrorKind};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnId {
    pub value: String,
}

impl ConnId {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl Display for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Relay-assigned opaque queue id, base64 on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueId {
    pub value: String,
}

impl QueueId {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl Display for QueueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Uniquely names a relay: host, port and the fingerprint of its TLS key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerRef {
    pub host: String,
    pub port: u16,
    pub fingerprint: String,
}

impl ServerRef {
    pub fn new(host: impl Into<String>, port: u16, fingerprint: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            fingerprint: fingerprint.into(),
        }
    }
}

impl Display for ServerRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}#{}", self.host, self.port, self.fingerprint)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersionRange {
    pub min_version: u16,
    pub max_version: u16,
}

impl VersionRange {
    pub fn new(min_version: u16, max_version: u16) -> Self {
        Self {
            min_version,
            max_version,
        }
    }
}

/// Sender-side address of a relay queue, as embedded in connection requests
/// and rotation messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmpQueueUri {
    pub server: ServerRef,
    pub snd_id: QueueId,
    pub dh_public: [u8; 32],
    pub client_version_range: VersionRange,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueAddr {
    pub server: ServerRef,
    pub snd_id: QueueId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum ConnectionMode {
    Invitation,
    Contact,
}

/// Public X3DH parameters for one side of a connection. `ratchet_key` doubles
/// as that side's initial ratchet public key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct E2eParams {
    pub version: u16,
    pub identity_key: [u8; 32],
    pub ratchet_key: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionRequest {
    pub mode: ConnectionMode,
    pub queue_uri: SmpQueueUri,
    pub e2e: Option<E2eParams>,
    pub agent_version_range: VersionRange,
}

const INVITATION_SCHEME: &str = "smp-agent://invitation#";
const CONTACT_SCHEME: &str = "smp-agent://contact#";

impl ConnectionRequest {
    pub fn encode(&self) -> Result<String, AgentError> {
        let body = serde_json::to_vec(self)
            .map_err(|e| AgentError::Internal(format!("conn request encode: {e}")))?;
        let scheme = match self.mode {
            ConnectionMode::Invitation => INVITATION_SCHEME,
            ConnectionMode::Contact => CONTACT_SCHEME,
        };
        Ok(format!("{}{}", scheme, URL_SAFE_NO_PAD.encode(body)))
    }

    pub fn decode(uri: &str) -> Result<Self, AgentError> {
        let payload = uri
            .strip_prefix(INVITATION_SCHEME)
            .or_else(|| uri.strip_prefix(CONTACT_SCHEME))
            .ok_or(AgentError::Agent(AgentErrorKind::Message))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AgentError::Agent(AgentErrorKind::Message))?;
        let req: ConnectionRequest = serde_json::from_slice(&bytes)
            .map_err(|_| AgentError::Agent(AgentErrorKind::Message))?;
        Ok(req)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MsgFlags {
    #[serde(default)]
    pub notification: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum MsgIntegrity {
    Ok,
    BadId,
    Duplicate,
    Skipped { from_id: u64, to_id: u64 },
    BadHash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MsgMeta {
    pub internal_id: u64,
    pub ext_snd_id: u64,
    pub broker_id: String,
    pub ts_ms: u64,
    pub integrity: MsgIntegrity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum SwitchPhase {
    Started,
    Completed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionStats {
    pub rcv_queues: usize,
    pub snd_queues: usize,
    pub pending_snd_msgs: usize,
}

/// Application-visible event, delivered as `(corr_id, conn_id, event)` on the
/// agent's broadcast stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum AgentEvent {
    Inv {
        conn_req: String,
    },
    Conf {
        conf_id: String,
        servers: Vec<ServerRef>,
        conn_info: Vec<u8>,
    },
    Info {
        conn_info: Vec<u8>,
    },
    Req {
        inv_id: String,
        conn_info: Vec<u8>,
    },
    Con,
    End,
    Msg {
        meta: MsgMeta,
        flags: MsgFlags,
        body: Vec<u8>,
    },
    Sent {
        internal_id: u64,
    },
    Stat {
        stats: ConnectionStats,
    },
    Ok,
    Switch {
        phase: SwitchPhase,
        stats: ConnectionStats,
    },
    Err {
        err: AgentError,
    },
    MErr {
        internal_id: u64,
        err: AgentError,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnNotice {
    pub corr_id: Option<String>,
    pub conn_id: ConnId,
    pub event: AgentEvent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum NtfMode {
    Instant,
    Periodic,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceToken {
    pub provider: String,
    pub token: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum NtfTknStatus {
    Registered,
    Confirmed,
    Active,
    Expired,
}
