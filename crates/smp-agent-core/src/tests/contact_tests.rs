use super::{is_con, test_agent, wait_for};
use crate::ntf::InMemoryNtfServer;
use crate::relay::InMemorySmpNetwork;
use smp_agent_api::error::{AgentError, CmdErrorKind, ConnErrorKind};
use smp_agent_api::types::{AgentEvent, ConnectionMode, MsgFlags, MsgIntegrity};

#[tokio::test]
async fn contact_request_accept_establishes_connection() {
    let network = InMemorySmpNetwork::new();
    let ntf = InMemoryNtfServer::new();
    let a = test_agent("contact-a", &network, &ntf).await;
    let b = test_agent("contact-b", &network, &ntf).await;
    let mut rx_a = a.subscribe();
    let mut rx_b = b.subscribe();

    let (_contact_conn, contact_uri) = a
        .create_connection(ConnectionMode::Contact)
        .await
        .expect("create contact");
    assert!(contact_uri.starts_with("smp-agent://contact#"));

    let conn_b = b
        .join_connection(&contact_uri, b"want-to-chat".to_vec())
        .await
        .expect("join contact");

    let req = wait_for(&mut rx_a, |n| matches!(n.event, AgentEvent::Req { .. })).await;
    let AgentEvent::Req { inv_id, conn_info } = req.event else {
        unreachable!()
    };
    assert_eq!(conn_info, b"want-to-chat");

    let conn_a = a
        .accept_contact(&inv_id, b"welcome".to_vec())
        .await
        .expect("accept");

    // the sub-connection now follows the invitation flow: B is its initiator
    let conf = wait_for(&mut rx_b, |n| matches!(n.event, AgentEvent::Conf { .. })).await;
    assert_eq!(conf.conn_id, conn_b);
    let AgentEvent::Conf {
        conf_id, conn_info, ..
    } = conf.event
    else {
        unreachable!()
    };
    assert_eq!(conn_info, b"welcome");
    b.allow_connection(&conf_id, b"come-in".to_vec())
        .await
        .expect("allow");

    wait_for(&mut rx_a, is_con).await;
    wait_for(&mut rx_b, is_con).await;

    let meta = super::send_and_receive(&a, &conn_a, &mut rx_a, &mut rx_b, b"first").await;
    assert_eq!(meta.integrity, MsgIntegrity::Ok);
}

#[tokio::test]
async fn rejected_contact_stays_unconnected() {
    let network = InMemorySmpNetwork::new();
    let ntf = InMemoryNtfServer::new();
    let a = test_agent("reject-a", &network, &ntf).await;
    let b = test_agent("reject-b", &network, &ntf).await;
    let mut rx_a = a.subscribe();

    let (_, contact_uri) = a
        .create_connection(ConnectionMode::Contact)
        .await
        .expect("create contact");
    let conn_b = b
        .join_connection(&contact_uri, b"hello?".to_vec())
        .await
        .expect("join contact");

    let req = wait_for(&mut rx_a, |n| matches!(n.event, AgentEvent::Req { .. })).await;
    let AgentEvent::Req { inv_id, .. } = req.event else {
        unreachable!()
    };
    a.reject_contact(&inv_id).await.expect("reject");

    // accepting after reject fails: the invitation is gone
    let err = a.accept_contact(&inv_id, b"late".to_vec()).await.unwrap_err();
    assert_eq!(err, AgentError::Cmd(CmdErrorKind::Prohibited));

    // B's side never progressed past a receive-only connection
    let err = b
        .send_message(&conn_b, MsgFlags::default(), b"anyone?".to_vec())
        .await
        .unwrap_err();
    assert_eq!(err, AgentError::Conn(ConnErrorKind::Simplex));
}

#[tokio::test]
async fn accept_twice_is_prohibited() {
    let network = InMemorySmpNetwork::new();
    let ntf = InMemoryNtfServer::new();
    let a = test_agent("twice-a", &network, &ntf).await;
    let b = test_agent("twice-b", &network, &ntf).await;
    let mut rx_a = a.subscribe();

    let (_, contact_uri) = a
        .create_connection(ConnectionMode::Contact)
        .await
        .expect("create contact");
    b.join_connection(&contact_uri, b"hi".to_vec())
        .await
        .expect("join contact");

    let req = wait_for(&mut rx_a, |n| matches!(n.event, AgentEvent::Req { .. })).await;
    let AgentEvent::Req { inv_id, .. } = req.event else {
        unreachable!()
    };
    a.accept_contact(&inv_id, b"ok".to_vec()).await.expect("accept");
    let err = a.accept_contact(&inv_id, b"again".to_vec()).await.unwrap_err();
    assert_eq!(err, AgentError::Cmd(CmdErrorKind::Prohibited));
}
