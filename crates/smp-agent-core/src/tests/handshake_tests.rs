use super::{is_con, legacy_config, test_agent, wait_for, TestKeyProvider};
use crate::ntf::InMemoryNtfServer;
use crate::relay::InMemorySmpNetwork;
use crate::Agent;
use smp_agent_api::error::{AgentError, AgentErrorKind};
use smp_agent_api::types::{AgentEvent, ConnectionMode, MsgFlags, MsgIntegrity};
use std::sync::Arc;

#[tokio::test]
async fn invitation_happy_path() {
    let network = InMemorySmpNetwork::new();
    let ntf = InMemoryNtfServer::new();
    let a = test_agent("inv-a", &network, &ntf).await;
    let b = test_agent("inv-b", &network, &ntf).await;
    let mut rx_a = a.subscribe();
    let mut rx_b = b.subscribe();

    let (conn_a, uri) = a
        .create_connection(ConnectionMode::Invitation)
        .await
        .expect("create");
    assert!(uri.starts_with("smp-agent://invitation#"));

    let conn_b = b
        .join_connection(&uri, b"hi".to_vec())
        .await
        .expect("join");

    let conf = wait_for(&mut rx_a, |n| {
        matches!(n.event, AgentEvent::Conf { .. })
    })
    .await;
    assert_eq!(conf.conn_id, conn_a);
    let AgentEvent::Conf {
        conf_id, conn_info, ..
    } = conf.event
    else {
        unreachable!()
    };
    assert_eq!(conn_info, b"hi");

    a.allow_connection(&conf_id, b"hello".to_vec())
        .await
        .expect("allow");

    let info = wait_for(&mut rx_b, |n| matches!(n.event, AgentEvent::Info { .. })).await;
    let AgentEvent::Info { conn_info } = info.event else {
        unreachable!()
    };
    assert_eq!(conn_info, b"hello");

    wait_for(&mut rx_a, is_con).await;
    wait_for(&mut rx_b, is_con).await;

    let internal_id = a
        .send_message(&conn_a, MsgFlags::default(), b"ping".to_vec())
        .await
        .expect("send");
    wait_for(&mut rx_a, |n| {
        matches!(n.event, AgentEvent::Sent { internal_id: id } if id == internal_id)
    })
    .await;

    let msg = wait_for(&mut rx_b, |n| matches!(n.event, AgentEvent::Msg { .. })).await;
    assert_eq!(msg.conn_id, conn_b);
    let AgentEvent::Msg { meta, body, .. } = msg.event else {
        unreachable!()
    };
    assert_eq!(body, b"ping");
    assert_eq!(meta.integrity, MsgIntegrity::Ok);

    b.ack_message(&conn_b, meta.internal_id).await.expect("ack");
    // second ack has no network effect
    b.ack_message(&conn_b, meta.internal_id)
        .await
        .expect("ack again");
}

#[tokio::test]
async fn messages_flow_both_ways_with_ok_integrity() {
    let network = InMemorySmpNetwork::new();
    let ntf = InMemoryNtfServer::new();
    let a = test_agent("both-a", &network, &ntf).await;
    let b = test_agent("both-b", &network, &ntf).await;
    let mut rx_a = a.subscribe();
    let mut rx_b = b.subscribe();
    let (conn_a, conn_b) = super::connect_pair(&a, &b, &mut rx_a, &mut rx_b).await;

    for n in 0u8..3 {
        let meta =
            super::send_and_receive(&a, &conn_a, &mut rx_a, &mut rx_b, &[b'a', n]).await;
        assert_eq!(meta.integrity, MsgIntegrity::Ok);
        b.ack_message(&conn_b, meta.internal_id).await.expect("ack");
    }
    for n in 0u8..3 {
        let meta =
            super::send_and_receive(&b, &conn_b, &mut rx_b, &mut rx_a, &[b'b', n]).await;
        assert_eq!(meta.integrity, MsgIntegrity::Ok);
        a.ack_message(&conn_a, meta.internal_id).await.expect("ack");
    }
}

#[tokio::test]
async fn legacy_handshake_uses_reply_queue() {
    let network = InMemorySmpNetwork::new();
    let ntf = InMemoryNtfServer::new();
    let a = Agent::init(
        legacy_config("legacy-a"),
        Arc::new(TestKeyProvider),
        Arc::new(network.clone()),
        Arc::new(ntf.clone()),
    )
    .await
    .expect("agent a");
    let b = Agent::init(
        legacy_config("legacy-b"),
        Arc::new(TestKeyProvider),
        Arc::new(network.clone()),
        Arc::new(ntf.clone()),
    )
    .await
    .expect("agent b");
    let mut rx_a = a.subscribe();
    let mut rx_b = b.subscribe();

    let (conn_a, uri) = a
        .create_connection(ConnectionMode::Invitation)
        .await
        .expect("create");
    let conn_b = b
        .join_connection(&uri, b"legacy-hi".to_vec())
        .await
        .expect("join");

    let conf = wait_for(&mut rx_a, |n| matches!(n.event, AgentEvent::Conf { .. })).await;
    let AgentEvent::Conf { conf_id, servers, .. } = conf.event else {
        unreachable!()
    };
    // no reply queues before the REPLY message in the v1 handshake
    assert!(servers.is_empty());
    a.allow_connection(&conf_id, b"legacy-hello".to_vec())
        .await
        .expect("allow");

    wait_for(&mut rx_a, is_con).await;
    wait_for(&mut rx_b, is_con).await;

    let meta = super::send_and_receive(&a, &conn_a, &mut rx_a, &mut rx_b, b"after").await;
    assert_eq!(meta.integrity, MsgIntegrity::Ok);
    b.ack_message(&conn_b, meta.internal_id).await.expect("ack");
}

#[tokio::test]
async fn incompatible_version_is_rejected() {
    let network = InMemorySmpNetwork::new();
    let ntf = InMemoryNtfServer::new();
    let a = Agent::init(
        legacy_config("ver-a"),
        Arc::new(TestKeyProvider),
        Arc::new(network.clone()),
        Arc::new(ntf.clone()),
    )
    .await
    .expect("agent a");
    let b = test_agent("ver-b", &network, &ntf).await;

    let (_, uri) = a
        .create_connection(ConnectionMode::Invitation)
        .await
        .expect("create");
    // sabotage the advertised range so nothing overlaps
    let mut req = smp_agent_api::types::ConnectionRequest::decode(&uri).expect("decode");
    req.agent_version_range = smp_agent_api::types::VersionRange::new(9, 9);
    let bad_uri = req.encode().expect("encode");
    let err = b
        .join_connection(&bad_uri, b"x".to_vec())
        .await
        .unwrap_err();
    assert_eq!(err, AgentError::Agent(AgentErrorKind::Version));
}

#[tokio::test]
async fn send_on_pending_invitation_is_simplex() {
    let network = InMemorySmpNetwork::new();
    let ntf = InMemoryNtfServer::new();
    let a = test_agent("simplex-a", &network, &ntf).await;
    let (conn_a, _) = a
        .create_connection(ConnectionMode::Invitation)
        .await
        .expect("create");
    let err = a
        .send_message(&conn_a, MsgFlags::default(), b"early".to_vec())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        AgentError::Conn(smp_agent_api::error::ConnErrorKind::Simplex)
    );
}

#[tokio::test]
async fn delete_connection_is_idempotent() {
    let network = InMemorySmpNetwork::new();
    let ntf = InMemoryNtfServer::new();
    let a = test_agent("del-a", &network, &ntf).await;
    let b = test_agent("del-b", &network, &ntf).await;
    let mut rx_a = a.subscribe();
    let mut rx_b = b.subscribe();
    let (conn_a, _) = super::connect_pair(&a, &b, &mut rx_a, &mut rx_b).await;

    a.delete_connection(&conn_a).await.expect("delete");
    a.delete_connection(&conn_a).await.expect("second delete");
}
