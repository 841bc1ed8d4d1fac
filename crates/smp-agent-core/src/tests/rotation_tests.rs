use super::{connect_pair, test_agent, wait_for};
use crate::ntf::InMemoryNtfServer;
use crate::relay::InMemorySmpNetwork;
use smp_agent_api::error::{AgentError, CmdErrorKind};
use smp_agent_api::types::{AgentEvent, MsgFlags, MsgIntegrity, SwitchPhase};
use std::time::Duration;

#[tokio::test]
async fn rotation_completes_on_both_sides() {
    let network = InMemorySmpNetwork::new();
    let ntf = InMemoryNtfServer::new();
    let a = test_agent("rot-a", &network, &ntf).await;
    let b = test_agent("rot-b", &network, &ntf).await;
    let mut rx_a = a.subscribe();
    let mut rx_b = b.subscribe();
    let (conn_a, conn_b) = connect_pair(&a, &b, &mut rx_a, &mut rx_b).await;

    let servers_before = a
        .get_connection_servers(&conn_a)
        .await
        .expect("servers before");

    a.switch_connection(&conn_a).await.expect("switch");

    wait_for(&mut rx_a, |n| {
        matches!(
            n.event,
            AgentEvent::Switch {
                phase: SwitchPhase::Started,
                ..
            }
        )
    })
    .await;
    wait_for(&mut rx_b, |n| {
        matches!(
            n.event,
            AgentEvent::Switch {
                phase: SwitchPhase::Started,
                ..
            }
        )
    })
    .await;
    wait_for(&mut rx_b, |n| {
        matches!(
            n.event,
            AgentEvent::Switch {
                phase: SwitchPhase::Completed,
                ..
            }
        )
    })
    .await;
    wait_for(&mut rx_a, |n| {
        matches!(
            n.event,
            AgentEvent::Switch {
                phase: SwitchPhase::Completed,
                ..
            }
        )
    })
    .await;

    let servers_after = a
        .get_connection_servers(&conn_a)
        .await
        .expect("servers after");
    assert_ne!(servers_before, servers_after);

    // messages still flow over the rotated pair, both directions
    let meta = super::send_and_receive(&b, &conn_b, &mut rx_b, &mut rx_a, b"post-rotate").await;
    assert_eq!(meta.integrity, MsgIntegrity::Ok);
    a.ack_message(&conn_a, meta.internal_id).await.expect("ack");
    let meta = super::send_and_receive(&a, &conn_a, &mut rx_a, &mut rx_b, b"reverse").await;
    assert_eq!(meta.integrity, MsgIntegrity::Ok);
}

#[tokio::test]
async fn message_during_rotation_arrives_before_completion() {
    let network = InMemorySmpNetwork::new();
    let ntf = InMemoryNtfServer::new();
    let a = test_agent("rotmsg-a", &network, &ntf).await;
    let b = test_agent("rotmsg-b", &network, &ntf).await;
    let mut rx_a = a.subscribe();
    let mut rx_b = b.subscribe();
    let (conn_a, conn_b) = connect_pair(&a, &b, &mut rx_a, &mut rx_b).await;

    a.switch_connection(&conn_a).await.expect("switch");
    b.send_message(&conn_b, MsgFlags::default(), b"mid-rotation".to_vec())
        .await
        .expect("send");

    // collect A's events until Completed, acking the message as the app would
    let mut saw_msg_at = None;
    let mut completed_at = None;
    let mut idx = 0usize;
    while completed_at.is_none() {
        let notice = tokio::time::timeout(Duration::from_secs(5), rx_a.recv())
            .await
            .expect("timeout")
            .expect("event");
        match notice.event {
            AgentEvent::Msg { meta, ref body, .. } if body.as_slice() == b"mid-rotation" => {
                saw_msg_at = Some(idx);
                a.ack_message(&conn_a, meta.internal_id).await.expect("ack");
            }
            AgentEvent::Switch {
                phase: SwitchPhase::Completed,
                ..
            } => completed_at = Some(idx),
            _ => {}
        }
        idx += 1;
    }
    let msg_at = saw_msg_at.expect("message delivered");
    assert!(msg_at < completed_at.expect("completed"));
}

#[tokio::test]
async fn switch_requires_established_duplex() {
    let network = InMemorySmpNetwork::new();
    let ntf = InMemoryNtfServer::new();
    let a = test_agent("rotbad-a", &network, &ntf).await;
    let (conn_a, _) = a
        .create_connection(smp_agent_api::types::ConnectionMode::Invitation)
        .await
        .expect("create");
    let err = a.switch_connection(&conn_a).await.unwrap_err();
    assert_eq!(err, AgentError::Cmd(CmdErrorKind::Prohibited));
}

#[tokio::test]
async fn second_switch_during_rotation_is_prohibited() {
    let network = InMemorySmpNetwork::new();
    let ntf = InMemoryNtfServer::new();
    let a = test_agent("rotdup-a", &network, &ntf).await;
    let b = test_agent("rotdup-b", &network, &ntf).await;
    let mut rx_a = a.subscribe();
    let mut rx_b = b.subscribe();
    let (conn_a, _conn_b) = connect_pair(&a, &b, &mut rx_a, &mut rx_b).await;

    a.switch_connection(&conn_a).await.expect("switch");
    let err = a.switch_connection(&conn_a).await.unwrap_err();
    assert_eq!(err, AgentError::Cmd(CmdErrorKind::Prohibited));
}
