use crate::connection::{
    ConnRecord, ConnVariant, RcvQueue, RcvQueueStatus, RotationAction, SndQueue, SndQueueStatus,
};
use crate::crypto::ratchet::{decode_msg, DecryptOutcome, RatchetState};
use crate::crypto::{boxes, sha256, x3dh};
use crate::relay::{BrokerEvent, InboundEvent};
use crate::store::{MsgKind, StagedConfirmation, StagedInvitation};
use crate::ids::RcvQueueKey;
use crate::{Agent, BufferedMsg};
use smp_agent_api::envelope::{
    decode_agent_message, decode_conn_info, decode_envelope, AgentEnvelope, AgentMessage,
    AgentMsgPayload, ConnInfoPayload,
};
use smp_agent_api::error::{AgentError, AgentErrorKind};
use smp_agent_api::types::{
    AgentEvent, ConnId, MsgFlags, MsgMeta, QueueId, ServerRef, SwitchPhase,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub(crate) async fn run_dispatcher(agent: Agent, mut rx: mpsc::UnboundedReceiver<InboundEvent>) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = handle_event(&agent, event).await {
            debug!("inbound event dropped: {e}");
        }
    }
}

async fn handle_event(agent: &Agent, event: InboundEvent) -> Result<(), AgentError> {
    match event.event {
        BrokerEvent::End => handle_end(agent, &event.server, event.session_id, &event.rcv_id).await,
        BrokerEvent::Msg { broker_id, body } => {
            handle_msg(agent, &event.server, &event.rcv_id, &broker_id, body).await
        }
    }
}

/// A transport reset invalidates subscriptions only if the session id still
/// names the live client for that server.
async fn handle_end(
    agent: &Agent,
    server: &ServerRef,
    session_id: uuid::Uuid,
    rcv_id: &QueueId,
) -> Result<(), AgentError> {
    if agent.pool.current_session(server) != Some(session_id) {
        return Ok(());
    }
    agent.pool.drop_session(server);
    let Some(conn_id) = agent.store.resolve_rcv_queue(server, rcv_id).await? else {
        return Ok(());
    };
    agent
        .subscribed
        .lock()
        .expect("subscribed set")
        .remove(&conn_id);
    agent.emit(conn_id, AgentEvent::End);
    Ok(())
}

async fn handle_msg(
    agent: &Agent,
    server: &ServerRef,
    rcv_id: &QueueId,
    broker_id: &str,
    body: Vec<u8>,
) -> Result<(), AgentError> {
    // unacked messages dropped here are redelivered after reactivation
    let Some(_lease) = agent.gate.begin_op(crate::gate::OpClass::MsgDelivery) else {
        return Ok(());
    };
    let _guard = agent.state_lock.clone().lock_owned().await;
    let Some(conn_id) = agent.store.resolve_rcv_queue(server, rcv_id).await? else {
        debug!("message on unknown queue {rcv_id}@{server}");
        return Ok(());
    };
    let conn = agent.store.get_conn(&conn_id).await?;
    let Some(queue) = conn.rcv_by_id(rcv_id).cloned() else {
        return Ok(());
    };

    // relay redelivery of a message we already processed
    if let Some(idx) = agent.store.find_broker_msg(&conn_id, broker_id).await? {
        let _ = agent.pool.send_ack(&queue, broker_id).await;
        if idx.acked {
            let _ = agent.store.delete_rcv_msg(&conn_id, idx.internal_id).await;
        }
        return Ok(());
    }

    let envelope_bytes = match boxes::decode(&body).and_then(|env| boxes::open(&queue.e2e_key, &env))
    {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("client envelope decrypt failed on {conn_id}: {e}");
            agent.emit(
                conn_id.clone(),
                AgentEvent::Err {
                    err: AgentError::Agent(AgentErrorKind::Message),
                },
            );
            let _ = agent.pool.send_ack(&queue, broker_id).await;
            return Ok(());
        }
    };
    let envelope = match decode_envelope(&envelope_bytes) {
        Ok(envelope) => envelope,
        Err(_) => {
            agent.emit(
                conn_id.clone(),
                AgentEvent::Err {
                    err: AgentError::Agent(AgentErrorKind::Message),
                },
            );
            let _ = agent.pool.send_ack(&queue, broker_id).await;
            return Ok(());
        }
    };

    match envelope {
        AgentEnvelope::Confirmation {
            agent_version,
            e2e,
            sender_key,
            enc_conn_info,
        } => {
            handle_confirmation(
                agent,
                conn,
                &queue,
                broker_id,
                agent_version,
                e2e,
                sender_key,
                enc_conn_info,
            )
            .await
        }
        AgentEnvelope::Invitation {
            conn_req,
            conn_info,
        } => handle_invitation(agent, conn, &queue, broker_id, conn_req, conn_info).await,
        AgentEnvelope::Msg {
            enc_agent_message, ..
        } => handle_agent_msg(agent, conn, &queue, broker_id, enc_agent_message).await,
    }
}

/// Confirmation on a `New` receive queue of an invitation connection: the
/// joiner's keys and conn info, staged for `allow_connection`.
#[allow(clippy::too_many_arguments)]
async fn handle_confirmation(
    agent: &Agent,
    conn: ConnRecord,
    queue: &RcvQueue,
    broker_id: &str,
    agent_version: u16,
    e2e: Option<smp_agent_api::types::E2eParams>,
    sender_key: Option<[u8; 32]>,
    enc_conn_info: Vec<u8>,
) -> Result<(), AgentError> {
    let conn_id = conn.conn_id.clone();
    match conn.variant {
        ConnVariant::Rcv => {
            if queue.status != RcvQueueStatus::New {
                let _ = agent.pool.send_ack(queue, broker_id).await;
                return Ok(());
            }
            let (Some(own), Some(peer)) = (conn.x3dh.as_ref(), e2e.as_ref()) else {
                return protocol_violation(agent, &conn_id, queue, broker_id).await;
            };
            let root = x3dh::rcv_side(own, peer);
            let mut ratchet = RatchetState::init_rcv(root, own.ratchet.clone());
            let mut skipped = crate::crypto::ratchet::SkippedKeys::default();
            let ratcheted = match decode_msg(&enc_conn_info) {
                Ok(msg) => msg,
                Err(_) => return protocol_violation(agent, &conn_id, queue, broker_id).await,
            };
            let plain = match ratchet.decrypt(&mut skipped, &ratcheted) {
                Ok((DecryptOutcome::Plaintext(plain), _)) => plain,
                _ => return protocol_violation(agent, &conn_id, queue, broker_id).await,
            };
            let (reply_queues, conn_info) = match decode_conn_info(&plain) {
                Ok(ConnInfoPayload::Reply { queues, conn_info }) => (queues, conn_info),
                Ok(ConnInfoPayload::Info { conn_info }) => (Vec::new(), conn_info),
                Err(_) => return protocol_violation(agent, &conn_id, queue, broker_id).await,
            };
            let servers = reply_queues.iter().map(|q| q.server.clone()).collect();
            let conf_id = agent
                .store
                .stage_confirmation(StagedConfirmation {
                    conf_id: String::new(),
                    conn_id: conn_id.clone(),
                    agent_version,
                    sender_key,
                    reply_queues,
                    conn_info: conn_info.clone(),
                    ratchet,
                })
                .await?;
            agent
                .store
                .set_rcv_status(&conn_id, &queue.rcv_id, RcvQueueStatus::Confirmed)
                .await?;
            agent.emit(
                conn_id,
                AgentEvent::Conf {
                    conf_id,
                    servers,
                    conn_info,
                },
            );
            let _ = agent.pool.send_ack(queue, broker_id).await;
            Ok(())
        }
        // joiner side: the initiator's reply confirmation secures our queue
        ConnVariant::Duplex | ConnVariant::Snd => {
            if queue.status > RcvQueueStatus::Confirmed {
                let _ = agent.pool.send_ack(queue, broker_id).await;
                return Ok(());
            }
            let (mut ratchet, mut skipped) = agent.store.load_ratchet(&conn_id).await?;
            let first_processing = match decode_msg(&enc_conn_info) {
                Ok(ratcheted) => match ratchet.decrypt(&mut skipped, &ratcheted) {
                    Ok((DecryptOutcome::Plaintext(plain), diff)) => {
                        agent.store.store_ratchet(&conn_id, &ratchet, &diff).await?;
                        match decode_conn_info(&plain) {
                            Ok(ConnInfoPayload::Info { conn_info })
                            | Ok(ConnInfoPayload::Reply { conn_info, .. }) => {
                                agent.emit(conn_id.clone(), AgentEvent::Info { conn_info });
                                true
                            }
                            Err(_) => {
                                return protocol_violation(agent, &conn_id, queue, broker_id).await
                            }
                        }
                    }
                    Ok((DecryptOutcome::Duplicate, _)) => false,
                    Err(_) => return protocol_violation(agent, &conn_id, queue, broker_id).await,
                },
                Err(_) => return protocol_violation(agent, &conn_id, queue, broker_id).await,
            };
            if let Some(key) = sender_key {
                agent
                    .store
                    .set_rcv_peer_verify_key(&conn_id, &queue.rcv_id, key)
                    .await?;
                agent
                    .store
                    .set_rcv_status(&conn_id, &queue.rcv_id, RcvQueueStatus::Confirmed)
                    .await?;
                // securing may fail transiently; the queue stays Confirmed
                // and is re-secured on the next subscribe cycle
                match agent.pool.secure_queue(queue, key).await {
                    Ok(()) => {
                        agent
                            .store
                            .set_rcv_status(&conn_id, &queue.rcv_id, RcvQueueStatus::Secured)
                            .await?;
                    }
                    Err(e) => warn!("secure queue failed on {conn_id}: {e}"),
                }
            }
            if first_processing && conn.duplex_handshake == Some(true) {
                agent
                    .stage_current(
                        &conn_id,
                        MsgKind::Hello,
                        MsgFlags::default(),
                        &AgentMsgPayload::Hello,
                    )
                    .await?;
            }
            let _ = agent.pool.send_ack(queue, broker_id).await;
            Ok(())
        }
        ConnVariant::Contact => protocol_violation(agent, &conn_id, queue, broker_id).await,
    }
}

async fn handle_invitation(
    agent: &Agent,
    conn: ConnRecord,
    queue: &RcvQueue,
    broker_id: &str,
    conn_req: smp_agent_api::types::ConnectionRequest,
    conn_info: Vec<u8>,
) -> Result<(), AgentError> {
    let conn_id = conn.conn_id.clone();
    if conn.variant != ConnVariant::Contact {
        return protocol_violation(agent, &conn_id, queue, broker_id).await;
    }
    let encoded = conn_req.encode()?;
    let inv_id = agent
        .store
        .stage_invitation(StagedInvitation {
            inv_id: String::new(),
            contact_conn_id: conn_id.clone(),
            conn_req: encoded,
            conn_info: conn_info.clone(),
            accepted: false,
        })
        .await?;
    agent.emit(conn_id, AgentEvent::Req { inv_id, conn_info });
    let _ = agent.pool.send_ack(queue, broker_id).await;
    Ok(())
}

async fn handle_agent_msg(
    agent: &Agent,
    conn: ConnRecord,
    queue: &RcvQueue,
    broker_id: &str,
    enc_agent_message: Vec<u8>,
) -> Result<(), AgentError> {
    let conn_id = conn.conn_id.clone();
    if conn.variant == ConnVariant::Contact {
        return protocol_violation(agent, &conn_id, queue, broker_id).await;
    }
    let (mut ratchet, mut skipped) = match agent.store.load_ratchet(&conn_id).await {
        Ok(loaded) => loaded,
        Err(_) => return protocol_violation(agent, &conn_id, queue, broker_id).await,
    };
    let Ok(ratcheted) = decode_msg(&enc_agent_message) else {
        return protocol_violation(agent, &conn_id, queue, broker_id).await;
    };
    let (plain, diff) = match ratchet.decrypt(&mut skipped, &ratcheted) {
        Ok((DecryptOutcome::Plaintext(plain), diff)) => (plain, diff),
        Ok((DecryptOutcome::Duplicate, _)) => {
            // replayed under a different relay id: peer resent after our ack
            agent.emit(
                conn_id.clone(),
                AgentEvent::Err {
                    err: AgentError::Agent(AgentErrorKind::Duplicate),
                },
            );
            let _ = agent.pool.send_ack(queue, broker_id).await;
            return Ok(());
        }
        Err(e) => {
            debug!("ratchet decrypt failed on {conn_id}: {e}");
            return protocol_violation(agent, &conn_id, queue, broker_id).await;
        }
    };
    let Ok(msg) = decode_agent_message(&plain) else {
        return protocol_violation(agent, &conn_id, queue, broker_id).await;
    };
    let applied = agent
        .store
        .apply_rcv_msg(
            &conn_id,
            broker_id,
            msg.header.snd_msg_id,
            msg.header.prev_msg_hash,
            sha256(&plain),
            &ratchet,
            &diff,
        )
        .await?;
    route_payload(agent, conn, queue, broker_id, msg, applied).await
}

async fn route_payload(
    agent: &Agent,
    conn: ConnRecord,
    queue: &RcvQueue,
    broker_id: &str,
    msg: AgentMessage,
    applied: crate::store::RcvApplied,
) -> Result<(), AgentError> {
    let conn_id = conn.conn_id.clone();
    match msg.payload {
        AgentMsgPayload::Hello => {
            agent
                .store
                .set_rcv_status(&conn_id, &queue.rcv_id, RcvQueueStatus::Active)
                .await?;
            let fresh = agent.store.get_conn(&conn_id).await?;
            if let Some(sq) = fresh.current_snd() {
                if sq.status == SndQueueStatus::Active {
                    agent.emit(conn_id.clone(), AgentEvent::Con);
                } else if fresh.duplex_handshake == Some(true)
                    && sq.status == SndQueueStatus::Confirmed
                {
                    agent
                        .stage_current(
                            &conn_id,
                            MsgKind::Hello,
                            MsgFlags::default(),
                            &AgentMsgPayload::Hello,
                        )
                        .await?;
                }
            }
            let _ = agent.pool.send_ack(queue, broker_id).await;
            Ok(())
        }
        AgentMsgPayload::Reply { queues } => {
            // legacy handshake only: the joiner offers its reply queue
            if conn.variant != ConnVariant::Rcv {
                return protocol_violation(agent, &conn_id, queue, broker_id).await;
            }
            let Some(uri) = queues.first() else {
                return protocol_violation(agent, &conn_id, queue, broker_id).await;
            };
            let snd = SndQueue::from_uri(uri);
            let sender_key = snd.sign_key.verify_key();
            let mut fresh = agent.store.get_conn(&conn_id).await?;
            fresh.snd_queues.push(snd);
            fresh.variant = ConnVariant::Duplex;
            let conn_info = fresh.pending_conn_info.take().unwrap_or_default();
            agent.store.put_conn(&fresh).await?;
            agent
                .stage_confirmation_current(
                    &conn_id,
                    MsgKind::ConnInfoReply,
                    &ConnInfoPayload::Info { conn_info },
                    None,
                    Some(sender_key),
                )
                .await?;
            let _ = agent.pool.send_ack(queue, broker_id).await;
            Ok(())
        }
        AgentMsgPayload::Msg { body } => {
            let meta = MsgMeta {
                internal_id: applied.internal_id,
                ext_snd_id: msg.header.snd_msg_id,
                broker_id: broker_id.to_string(),
                ts_ms: crate::time::now_ms(),
                integrity: applied.integrity,
            };
            if queue.current {
                agent.emit(
                    conn_id,
                    AgentEvent::Msg {
                        meta,
                        flags: MsgFlags::default(),
                        body,
                    },
                );
            } else {
                // rotation in progress: hold until the next queue is current
                let key = RcvQueueKey {
                    server: queue.server.clone(),
                    rcv_id: queue.rcv_id.clone(),
                };
                agent
                    .rotation_buffer
                    .lock()
                    .expect("rotation buffer")
                    .entry(key)
                    .or_default()
                    .push(BufferedMsg {
                        meta,
                        flags: MsgFlags::default(),
                        body,
                    });
            }
            Ok(())
        }
        AgentMsgPayload::QNew { next_uri, .. } => {
            agent.emit(
                conn_id.clone(),
                AgentEvent::Switch {
                    phase: SwitchPhase::Started,
                    stats: agent.connection_stats(&conn_id).await,
                },
            );
            let mut next = SndQueue::from_uri(&next_uri);
            next.current = false;
            let sender_key = next.sign_key.verify_key();
            agent.store.add_next_snd_queue(&conn_id, next).await?;
            agent
                .stage_current(
                    &conn_id,
                    MsgKind::QKeys,
                    MsgFlags::default(),
                    &AgentMsgPayload::QKeys {
                        sender_key,
                        next_uri,
                    },
                )
                .await?;
            let _ = agent.pool.send_ack(queue, broker_id).await;
            Ok(())
        }
        AgentMsgPayload::QKeys { sender_key, .. } => {
            let fresh = agent.store.get_conn(&conn_id).await?;
            let Some(next) = fresh.next_rcv().cloned() else {
                return protocol_violation(agent, &conn_id, queue, broker_id).await;
            };
            let Some(current) = fresh.current_rcv() else {
                return protocol_violation(agent, &conn_id, queue, broker_id).await;
            };
            agent
                .store
                .set_rcv_peer_verify_key(&conn_id, &next.rcv_id, sender_key)
                .await?;
            agent
                .store
                .set_rotation(&conn_id, &current.rcv_id, RotationAction::SecureNext)
                .await?;
            match agent.pool.secure_queue(&next, sender_key).await {
                Ok(()) => {
                    agent
                        .store
                        .set_rcv_status(&conn_id, &next.rcv_id, RcvQueueStatus::Secured)
                        .await?;
                    agent
                        .stage_current(
                            &conn_id,
                            MsgKind::QReady,
                            MsgFlags::default(),
                            &AgentMsgPayload::QReady { addr: next.addr() },
                        )
                        .await?;
                }
                Err(e) => warn!("secure next queue failed on {conn_id}: {e}"),
            }
            let _ = agent.pool.send_ack(queue, broker_id).await;
            Ok(())
        }
        AgentMsgPayload::QReady { .. } => {
            let fresh = agent.store.get_conn(&conn_id).await?;
            let Some(next) = fresh.next_snd() else {
                return protocol_violation(agent, &conn_id, queue, broker_id).await;
            };
            agent
                .store
                .set_snd_status(&conn_id, &next.snd_id, SndQueueStatus::Confirmed)
                .await?;
            agent
                .stage_next(
                    &conn_id,
                    MsgKind::QTest,
                    MsgFlags::default(),
                    &AgentMsgPayload::QTest,
                )
                .await?;
            let _ = agent.pool.send_ack(queue, broker_id).await;
            Ok(())
        }
        AgentMsgPayload::QTest => {
            // arrives on the next queue: the peer's path works
            let fresh = agent.store.get_conn(&conn_id).await?;
            let Some(next) = fresh.next_rcv() else {
                return protocol_violation(agent, &conn_id, queue, broker_id).await;
            };
            agent
                .stage_current(
                    &conn_id,
                    MsgKind::QSwitch,
                    MsgFlags::default(),
                    &AgentMsgPayload::QSwitch { addr: next.addr() },
                )
                .await?;
            let _ = agent.pool.send_ack(queue, broker_id).await;
            Ok(())
        }
        AgentMsgPayload::QSwitch { .. } => {
            let old = agent.store.switch_curr_snd_queue(&conn_id).await?;
            agent.delivery.drop_worker(&crate::ids::SndWorkerKey {
                server: old.server.clone(),
                snd_id: old.snd_id.clone(),
            });
            agent
                .stage_current(
                    &conn_id,
                    MsgKind::QHello,
                    MsgFlags::default(),
                    &AgentMsgPayload::QHello,
                )
                .await?;
            let _ = agent.pool.send_ack(queue, broker_id).await;
            Ok(())
        }
        AgentMsgPayload::QHello => {
            let fresh = agent.store.get_conn(&conn_id).await?;
            let Some(current) = fresh.current_rcv().cloned() else {
                return protocol_violation(agent, &conn_id, queue, broker_id).await;
            };
            agent
                .store
                .set_rotation(&conn_id, &current.rcv_id, RotationAction::SuspendCurrent)
                .await?;
            let _ = agent.pool.send_ack(queue, broker_id).await;
            let remaining = agent.pool.suspend_queue(&current).await.unwrap_or(0);
            if remaining == 0 {
                agent
                    .store
                    .set_rotation(&conn_id, &current.rcv_id, RotationAction::DeleteCurrent)
                    .await?;
                complete_rotation(agent, &conn_id).await?;
            }
            Ok(())
        }
    }
}

/// Deletes the retired queue, promotes the next one, releases buffered
/// messages in arrival order, and reports completion.
pub(crate) async fn complete_rotation(agent: &Agent, conn_id: &ConnId) -> Result<(), AgentError> {
    let conn = agent.store.get_conn(conn_id).await?;
    let Some(old) = conn.current_rcv() else {
        return Ok(());
    };
    if let Err(e) = agent.pool.delete_queue(old).await {
        warn!("old queue delete failed on {conn_id}: {e}");
    }
    let _old = agent.store.switch_curr_rcv_queue(conn_id).await?;
    let fresh = agent.store.get_conn(conn_id).await?;
    if let Some(new_current) = fresh.current_rcv() {
        let key = RcvQueueKey {
            server: new_current.server.clone(),
            rcv_id: new_current.rcv_id.clone(),
        };
        let buffered = agent
            .rotation_buffer
            .lock()
            .expect("rotation buffer")
            .remove(&key)
            .unwrap_or_default();
        for msg in buffered {
            agent.emit(
                conn_id.clone(),
                AgentEvent::Msg {
                    meta: msg.meta,
                    flags: msg.flags,
                    body: msg.body,
                },
            );
        }
    }
    agent.emit(
        conn_id.clone(),
        AgentEvent::Switch {
            phase: SwitchPhase::Completed,
            stats: agent.connection_stats(conn_id).await,
        },
    );
    Ok(())
}

async fn protocol_violation(
    agent: &Agent,
    conn_id: &ConnId,
    queue: &RcvQueue,
    broker_id: &str,
) -> Result<(), AgentError> {
    agent.emit(
        conn_id.clone(),
        AgentEvent::Err {
            err: AgentError::Agent(AgentErrorKind::Prohibited),
        },
    );
    let _ = agent.pool.send_ack(queue, broker_id).await;
    Ok(())
}
