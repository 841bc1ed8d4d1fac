use serde::{Deserialize, Serialize};
use smp_agent_api::types::{ServerRef, VersionRange};
use smp_agent_api::validation::{AGENT_VERSION_RANGE, SMP_CLIENT_VERSION_RANGE};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    pub socks_proxy: Option<String>,
    pub tcp_timeout_ms: u64,
    pub tcp_keep_alive: Option<bool>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            socks_proxy: None,
            tcp_timeout_ms: 5_000,
            tcp_keep_alive: Some(true),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub storage_path: String,
    pub namespace: String,
    pub smp_servers: Vec<ServerRef>,
    pub ntf_servers: Vec<ServerRef>,
    pub smp_client_vrange: VersionRange,
    pub smp_agent_vrange: VersionRange,
    pub message_retry_interval_ms: u64,
    pub hello_timeout_ms: u64,
    pub message_timeout_ms: u64,
    pub ntf_cron_interval_ms: u64,
    pub ntf_max_messages: usize,
    pub e2e_enc_conn_info_length: usize,
    pub e2e_enc_user_msg_length: usize,
    pub event_buffer: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            storage_path: ".smp-agent".to_string(),
            namespace: "default".to_string(),
            smp_servers: Vec::new(),
            ntf_servers: Vec::new(),
            smp_client_vrange: SMP_CLIENT_VERSION_RANGE,
            smp_agent_vrange: AGENT_VERSION_RANGE,
            message_retry_interval_ms: 1_000,
            hello_timeout_ms: 7_200_000,
            message_timeout_ms: 7_200_000,
            ntf_cron_interval_ms: 1_200_000,
            ntf_max_messages: 6,
            e2e_enc_conn_info_length: 14_848,
            e2e_enc_user_msg_length: 15_856,
            event_buffer: 256,
        }
    }
}
