use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol-level failures attributed to the peer agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(deny_unknown_fields)]
pub enum AgentErrorKind {
    #[error("A_VERSION")]
    Version,
    #[error("A_MESSAGE")]
    Message,
    #[error("A_PROHIBITED")]
    Prohibited,
    #[error("A_DUPLICATE")]
    Duplicate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(deny_unknown_fields)]
pub enum ConnErrorKind {
    #[error("NOT_AVAILABLE")]
    NotAvailable,
    #[error("NOT_ACCEPTED")]
    NotAccepted,
    #[error("SIMPLEX")]
    Simplex,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(deny_unknown_fields)]
pub enum CmdErrorKind {
    #[error("PROHIBITED")]
    Prohibited,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(deny_unknown_fields)]
pub enum SmpErrorKind {
    #[error("AUTH")]
    Auth,
    #[error("QUOTA")]
    Quota,
    #[error("NO_MSG")]
    NoMsg,
    #[error("SMP {0}")]
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(deny_unknown_fields)]
pub enum BrokerErrorKind {
    #[error("HOST")]
    Host,
    #[error("TIMEOUT")]
    Timeout,
    #[error("UNEXPECTED {0}")]
    Unexpected(String),
}

/// The taxonomy surfaced to the application, both as command results and
/// inside `ERR` / `MERR` events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(deny_unknown_fields)]
pub enum AgentError {
    #[error("AGENT {0}")]
    Agent(AgentErrorKind),
    #[error("CONN {0}")]
    Conn(ConnErrorKind),
    #[error("CMD {0}")]
    Cmd(CmdErrorKind),
    #[error("SMP {0}")]
    Smp(SmpErrorKind),
    #[error("NTF {0}")]
    Ntf(String),
    #[error("BROKER {0}")]
    Broker(BrokerErrorKind),
    #[error("INTERNAL {0}")]
    Internal(String),
}
