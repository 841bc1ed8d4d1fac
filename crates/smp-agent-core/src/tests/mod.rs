pub mod contact_tests;
pub mod handshake_tests;
pub mod rotation_tests;
pub mod store_tests;

use crate::config::AgentConfig;
use crate::ntf::InMemoryNtfServer;
use crate::relay::InMemorySmpNetwork;
use crate::Agent;
use smp_agent_api::types::{
    AgentEvent, ConnId, ConnNotice, ConnectionMode, MsgFlags, ServerRef, VersionRange,
};
use smp_agent_store::key_provider::{KeyProvider, MasterKey};
use smp_agent_store::StoreBackendError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Clone)]
pub struct TestKeyProvider;

impl KeyProvider for TestKeyProvider {
    fn get_or_create_master_key(&self) -> Result<MasterKey, StoreBackendError> {
        Ok(MasterKey::new([7u8; 32]))
    }

    fn get_master_key(&self) -> Result<MasterKey, StoreBackendError> {
        Ok(MasterKey::new([7u8; 32]))
    }
}

pub fn temp_path(label: &str) -> String {
    format!("/tmp/{}-{}", label, Uuid::new_v4())
}

pub fn test_server() -> ServerRef {
    ServerRef::new("relay.test", 5223, "fp-main")
}

pub fn alt_server() -> ServerRef {
    ServerRef::new("relay2.test", 5223, "fp-alt")
}

pub fn ntf_server() -> ServerRef {
    ServerRef::new("ntf.test", 443, "fp-ntf")
}

pub fn test_config(label: &str) -> AgentConfig {
    AgentConfig {
        storage_path: temp_path(label),
        namespace: "test".to_string(),
        smp_servers: vec![test_server(), alt_server()],
        ntf_servers: vec![ntf_server()],
        message_retry_interval_ms: 20,
        hello_timeout_ms: 3_000,
        message_timeout_ms: 3_000,
        e2e_enc_conn_info_length: 4_096,
        e2e_enc_user_msg_length: 4_096,
        ..AgentConfig::default()
    }
}

pub async fn test_agent(
    label: &str,
    network: &InMemorySmpNetwork,
    ntf: &InMemoryNtfServer,
) -> Agent {
    Agent::init(
        test_config(label),
        Arc::new(TestKeyProvider),
        Arc::new(network.clone()),
        Arc::new(ntf.clone()),
    )
    .await
    .expect("agent init")
}

pub fn legacy_config(label: &str) -> AgentConfig {
    AgentConfig {
        smp_agent_vrange: VersionRange::new(1, 1),
        ..test_config(label)
    }
}

/// Receives events until `pred` matches, skipping unrelated ones.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<ConnNotice>,
    pred: impl Fn(&ConnNotice) -> bool,
) -> ConnNotice {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let notice = rx.recv().await.expect("event stream");
            if pred(&notice) {
                return notice;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub fn is_con(notice: &ConnNotice) -> bool {
    matches!(notice.event, AgentEvent::Con)
}

/// Drives the invitation handshake to `CON` on both sides and returns the
/// established connection ids.
pub async fn connect_pair(
    a: &Agent,
    b: &Agent,
    rx_a: &mut broadcast::Receiver<ConnNotice>,
    rx_b: &mut broadcast::Receiver<ConnNotice>,
) -> (ConnId, ConnId) {
    let (conn_a, uri) = a
        .create_connection(ConnectionMode::Invitation)
        .await
        .expect("create");
    let conn_b = b
        .join_connection(&uri, b"join-info".to_vec())
        .await
        .expect("join");
    let conf = wait_for(rx_a, |n| matches!(n.event, AgentEvent::Conf { .. })).await;
    let AgentEvent::Conf { conf_id, .. } = conf.event else {
        unreachable!()
    };
    a.allow_connection(&conf_id, b"allow-info".to_vec())
        .await
        .expect("allow");
    wait_for(rx_a, is_con).await;
    wait_for(rx_b, is_con).await;
    (conn_a, conn_b)
}

pub async fn send_and_receive(
    a: &Agent,
    conn_a: &ConnId,
    rx_a: &mut broadcast::Receiver<ConnNotice>,
    rx_b: &mut broadcast::Receiver<ConnNotice>,
    body: &[u8],
) -> smp_agent_api::types::MsgMeta {
    let internal_id = a
        .send_message(conn_a, MsgFlags::default(), body.to_vec())
        .await
        .expect("send");
    wait_for(rx_a, |n| {
        matches!(n.event, AgentEvent::Sent { internal_id: id } if id == internal_id)
    })
    .await;
    let expected = body.to_vec();
    let msg = wait_for(rx_b, move |n| {
        matches!(&n.event, AgentEvent::Msg { body: b, .. } if b == &expected)
    })
    .await;
    let AgentEvent::Msg { meta, .. } = msg.event else {
        unreachable!()
    };
    meta
}
