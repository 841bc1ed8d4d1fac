use crate::error::{AgentError, AgentErrorKind};
use crate::types::{ConnectionRequest, VersionRange};

pub const AGENT_VERSION_RANGE: VersionRange = VersionRange {
    min_version: 1,
    max_version: 2,
};

pub const SMP_CLIENT_VERSION_RANGE: VersionRange = VersionRange {
    min_version: 1,
    max_version: 4,
};

pub const E2E_VERSION_RANGE: VersionRange = VersionRange {
    min_version: 1,
    max_version: 2,
};

/// Highest version shared by both ranges.
pub fn compatible_version(ours: VersionRange, theirs: VersionRange) -> Option<u16> {
    let min = ours.min_version.max(theirs.min_version);
    let max = ours.max_version.min(theirs.max_version);
    if min <= max {
        Some(max)
    } else {
        None
    }
}

/// Negotiates the agent, client and e2e versions of a connection request
/// against our advertised ranges. Any incompatibility is `A_VERSION`.
pub fn negotiate_versions(
    req: &ConnectionRequest,
    agent_range: VersionRange,
    client_range: VersionRange,
) -> Result<NegotiatedVersions, AgentError> {
    let agent_version = compatible_version(agent_range, req.agent_version_range)
        .ok_or(AgentError::Agent(AgentErrorKind::Version))?;
    let client_version = compatible_version(client_range, req.queue_uri.client_version_range)
        .ok_or(AgentError::Agent(AgentErrorKind::Version))?;
    let e2e_version = match &req.e2e {
        Some(params) => {
            let range = VersionRange::new(params.version, params.version);
            Some(
                compatible_version(E2E_VERSION_RANGE, range)
                    .ok_or(AgentError::Agent(AgentErrorKind::Version))?,
            )
        }
        None => None,
    };
    Ok(NegotiatedVersions {
        agent_version,
        client_version,
        e2e_version,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NegotiatedVersions {
    pub agent_version: u16,
    pub client_version: u16,
    pub e2e_version: Option<u16>,
}

impl NegotiatedVersions {
    /// The v2 handshake creates both receive queues before HELLO and drops
    /// the REPLY message.
    pub fn duplex_handshake(&self) -> bool {
        self.agent_version >= 2
    }
}
