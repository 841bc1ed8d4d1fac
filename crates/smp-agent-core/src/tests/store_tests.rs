use super::{temp_path, test_server, TestKeyProvider};
use crate::connection::{
    ConnRecord, ConnVariant, RcvQueue, RcvQueueStatus, RotationAction, SndQueue, SndQueueStatus,
};
use crate::crypto::ratchet::{RatchetState, SkippedDiff};
use crate::crypto::x3dh::{self, X3dhKeys};
use crate::crypto::{DhKeyPair, SignKeyPair};
use crate::store::{MsgKind, Store, StoreError};
use smp_agent_api::envelope::AgentMsgPayload;
use smp_agent_api::types::{ConnId, MsgFlags, MsgIntegrity, QueueId};
use smp_agent_store::EncryptedStore;

fn open_store(label: &str) -> Store {
    let kv = EncryptedStore::open(temp_path(label), "test", &TestKeyProvider).expect("open");
    Store::new(kv)
}

fn rcv_queue(tag: &str, current: bool) -> RcvQueue {
    RcvQueue {
        server: test_server(),
        rcv_id: QueueId::new(format!("rcv-{tag}")),
        snd_id: QueueId::new(format!("snd-{tag}")),
        sign_key: SignKeyPair::generate(),
        e2e_key: DhKeyPair::generate(),
        peer_verify_key: None,
        client_version: 4,
        status: RcvQueueStatus::New,
        current,
        rotation: None,
        rotation_started_ms: None,
        next_link: None,
    }
}

fn snd_queue(tag: &str) -> SndQueue {
    SndQueue {
        server: test_server(),
        snd_id: QueueId::new(format!("peer-{tag}")),
        sign_key: SignKeyPair::generate(),
        e2e_public: DhKeyPair::generate().public(),
        status: SndQueueStatus::New,
        current: true,
        next_link: None,
    }
}

fn conn_fixture(id: &str) -> ConnRecord {
    ConnRecord {
        conn_id: ConnId::new(id),
        variant: ConnVariant::Duplex,
        initiator: true,
        agent_version: 2,
        enable_ntfs: false,
        duplex_handshake: Some(true),
        rcv_queues: vec![rcv_queue(id, true)],
        snd_queues: vec![snd_queue(id)],
        x3dh: None,
        pending_conn_info: None,
    }
}

fn snd_ratchet() -> RatchetState {
    let initiator = X3dhKeys::generate();
    let joiner = X3dhKeys::generate();
    let root = x3dh::snd_side(&joiner, &initiator.params(2));
    RatchetState::init_snd(root, joiner.ratchet.clone(), initiator.ratchet.public())
}

#[tokio::test]
async fn staged_messages_chain_hashes_and_ids() {
    let store = open_store("chain");
    let conn = conn_fixture("c1");
    let conn_id = conn.conn_id.clone();
    let queue_dh = conn.snd_queues[0].e2e_public;
    store.create_conn(&conn).await.expect("create");
    store
        .init_ratchet(&conn_id, snd_ratchet())
        .await
        .expect("ratchet");

    let first = store
        .stage_agent_msg(
            &conn_id,
            MsgKind::AMsg,
            MsgFlags::default(),
            &AgentMsgPayload::Msg {
                body: b"one".to_vec(),
            },
            2,
            &queue_dh,
            2048,
        )
        .await
        .expect("stage one");
    let second = store
        .stage_agent_msg(
            &conn_id,
            MsgKind::AMsg,
            MsgFlags::default(),
            &AgentMsgPayload::Msg {
                body: b"two".to_vec(),
            },
            2,
            &queue_dh,
            2048,
        )
        .await
        .expect("stage two");

    assert_eq!(first.internal_id, 1);
    assert_eq!(second.internal_id, 2);
    assert_eq!(first.snd_msg_id, 1);
    assert_eq!(second.snd_msg_id, 2);

    let rec1 = store
        .get_snd_msg(&conn_id, 1)
        .await
        .expect("get")
        .expect("rec 1");
    let rec2 = store
        .get_snd_msg(&conn_id, 2)
        .await
        .expect("get")
        .expect("rec 2");
    assert_eq!(rec2.prev_hash, rec1.hash);
    assert_eq!(rec1.prev_hash, [0u8; 32]);

    assert_eq!(
        store.pending_snd_ids(&conn_id).await.expect("pending"),
        vec![1, 2]
    );
    store.delete_snd_msg(&conn_id, 1).await.expect("delete");
    assert_eq!(
        store.pending_snd_ids(&conn_id).await.expect("pending"),
        vec![2]
    );
}

#[tokio::test]
async fn rcv_integrity_classification() {
    let store = open_store("integrity");
    let conn = conn_fixture("c2");
    let conn_id = conn.conn_id.clone();
    store.create_conn(&conn).await.expect("create");
    store
        .init_ratchet(&conn_id, snd_ratchet())
        .await
        .expect("ratchet");
    let (state, _) = store.load_ratchet(&conn_id).await.expect("load");
    let diff = SkippedDiff::default();

    let h1 = [1u8; 32];
    let ok = store
        .apply_rcv_msg(&conn_id, "b1", 1, [0u8; 32], h1, &state, &diff)
        .await
        .expect("apply 1");
    assert_eq!(ok.integrity, MsgIntegrity::Ok);

    let bad_hash = store
        .apply_rcv_msg(&conn_id, "b2", 2, [9u8; 32], [2u8; 32], &state, &diff)
        .await
        .expect("apply 2");
    assert_eq!(bad_hash.integrity, MsgIntegrity::BadHash);

    let skipped = store
        .apply_rcv_msg(&conn_id, "b3", 4, [2u8; 32], [4u8; 32], &state, &diff)
        .await
        .expect("apply 4");
    assert_eq!(
        skipped.integrity,
        MsgIntegrity::Skipped { from_id: 3, to_id: 3 }
    );

    let bad_id = store
        .apply_rcv_msg(&conn_id, "b4", 3, [4u8; 32], [3u8; 32], &state, &diff)
        .await
        .expect("apply stale");
    assert_eq!(bad_id.integrity, MsgIntegrity::BadId);
}

#[tokio::test]
async fn user_ack_is_recorded_once() {
    let store = open_store("ack");
    let conn = conn_fixture("c3");
    let conn_id = conn.conn_id.clone();
    store.create_conn(&conn).await.expect("create");
    store
        .init_ratchet(&conn_id, snd_ratchet())
        .await
        .expect("ratchet");
    let (state, _) = store.load_ratchet(&conn_id).await.expect("load");
    let applied = store
        .apply_rcv_msg(
            &conn_id,
            "broker-1",
            1,
            [0u8; 32],
            [1u8; 32],
            &state,
            &SkippedDiff::default(),
        )
        .await
        .expect("apply");

    let first = store
        .mark_user_acked(&conn_id, applied.internal_id)
        .await
        .expect("ack");
    assert_eq!(first.as_deref(), Some("broker-1"));
    let second = store
        .mark_user_acked(&conn_id, applied.internal_id)
        .await
        .expect("ack again");
    assert_eq!(second, None);

    let idx = store
        .find_broker_msg(&conn_id, "broker-1")
        .await
        .expect("find")
        .expect("idx");
    assert!(idx.acked);
}

#[tokio::test]
async fn switch_curr_rcv_queue_promotes_next() {
    let store = open_store("switch");
    let conn = conn_fixture("c4");
    let conn_id = conn.conn_id.clone();
    let old_rcv_id = conn.rcv_queues[0].rcv_id.clone();
    store.create_conn(&conn).await.expect("create");

    let next = rcv_queue("c4-next", false);
    let next_rcv_id = next.rcv_id.clone();
    store
        .add_next_rcv_queue(&conn_id, next)
        .await
        .expect("add next");
    store
        .set_rotation(&conn_id, &old_rcv_id, RotationAction::CreateNext)
        .await
        .expect("rotation");

    let old = store
        .switch_curr_rcv_queue(&conn_id)
        .await
        .expect("switch");
    assert_eq!(old.rcv_id, old_rcv_id);

    let fresh = store.get_conn(&conn_id).await.expect("conn");
    assert_eq!(fresh.rcv_queues.len(), 1);
    let current = fresh.current_rcv().expect("current");
    assert_eq!(current.rcv_id, next_rcv_id);
    assert_eq!(current.rotation, None);

    // routing index follows the swap
    assert_eq!(
        store
            .resolve_rcv_queue(&test_server(), &old_rcv_id)
            .await
            .expect("resolve old"),
        None
    );
    assert_eq!(
        store
            .resolve_rcv_queue(&test_server(), &next_rcv_id)
            .await
            .expect("resolve new"),
        Some(conn_id.clone())
    );
}

#[tokio::test]
async fn queue_status_is_monotone() {
    let store = open_store("status");
    let conn = conn_fixture("c5");
    let conn_id = conn.conn_id.clone();
    let rcv_id = conn.rcv_queues[0].rcv_id.clone();
    store.create_conn(&conn).await.expect("create");

    store
        .set_rcv_status(&conn_id, &rcv_id, RcvQueueStatus::Secured)
        .await
        .expect("advance");
    let err = store
        .set_rcv_status(&conn_id, &rcv_id, RcvQueueStatus::Confirmed)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Integrity(_)));
}

#[tokio::test]
async fn duplicate_conn_is_rejected() {
    let store = open_store("dupconn");
    let conn = conn_fixture("c6");
    store.create_conn(&conn).await.expect("create");
    let err = store.create_conn(&conn).await.unwrap_err();
    assert_eq!(err, StoreError::Duplicate);
}
