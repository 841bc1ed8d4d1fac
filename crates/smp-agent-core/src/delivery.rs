use crate::connection::{ConnRecord, SndQueue, SndQueueStatus};
use crate::gate::OpClass;
use crate::ids::SndWorkerKey;
use crate::relay::TransportError;
use crate::store::{MsgKind, SndMsgRec};
use crate::time::now_ms;
use crate::Agent;
use smp_agent_api::envelope::AgentMsgPayload;
use smp_agent_api::error::{
    AgentError, BrokerErrorKind, ConnErrorKind, SmpErrorKind,
};
use smp_agent_api::types::{AgentEvent, ConnId, MsgFlags};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub(crate) struct QueuedSnd {
    pub conn_id: ConnId,
    pub internal_id: u64,
}

/// One serial worker per `(server, snd_id)`; all connections sharing that
/// queue identity share the worker.
#[derive(Clone, Default)]
pub(crate) struct DeliveryPool {
    workers: Arc<Mutex<HashMap<SndWorkerKey, mpsc::UnboundedSender<QueuedSnd>>>>,
}

impl DeliveryPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kick(&self, agent: &Agent, key: SndWorkerKey, items: Vec<QueuedSnd>) {
        let mut workers = self.workers.lock().expect("delivery workers");
        let tx = workers.entry(key.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let agent = agent.clone();
            let key = key.clone();
            tokio::spawn(run_worker(agent, key, rx));
            tx
        });
        for item in items {
            let _ = tx.send(item);
        }
    }

    pub fn drop_worker(&self, key: &SndWorkerKey) {
        self.workers.lock().expect("delivery workers").remove(key);
    }
}

async fn run_worker(agent: Agent, key: SndWorkerKey, mut rx: mpsc::UnboundedReceiver<QueuedSnd>) {
    while let Some(item) = rx.recv().await {
        deliver_one(&agent, &key, item).await;
    }
}

/// Sends one outbox record to completion: success, permanent failure, or
/// timeout. Transient errors retry with exponential backoff; each network
/// attempt holds a `SndNetwork` lease so suspension can drain.
async fn deliver_one(agent: &Agent, key: &SndWorkerKey, item: QueuedSnd) {
    let rec = match agent.store.get_snd_msg(&item.conn_id, item.internal_id).await {
        Ok(Some(rec)) => rec,
        Ok(None) => return, // cancelled or already resolved
        Err(e) => {
            warn!("outbox read failed for {}: {e}", item.conn_id);
            return;
        }
    };
    let timeout = match rec.kind {
        MsgKind::Hello => agent.config.hello_timeout_ms,
        _ => agent.config.message_timeout_ms,
    };
    let deadline = rec.ts_ms.saturating_add(timeout);
    let backoff_cap = agent.net_config().tcp_timeout_ms.max(1);
    let mut interval = agent.config.message_retry_interval_ms.max(1);

    loop {
        let conn = match agent.store.get_conn(&item.conn_id).await {
            Ok(conn) => conn,
            Err(_) => return, // connection deleted under us
        };
        let Some(queue) = conn
            .snd_queues
            .iter()
            .find(|q| q.server == key.server && q.snd_id == key.snd_id)
            .cloned()
        else {
            // queue dropped under us: rotation cancelled or switched away.
            // Control messages die with the queue; user payloads must not
            // resolve silently.
            if rec.kind == MsgKind::AMsg {
                agent.emit(
                    conn.conn_id.clone(),
                    AgentEvent::MErr {
                        internal_id: rec.internal_id,
                        err: AgentError::Conn(ConnErrorKind::NotAvailable),
                    },
                );
            }
            let _ = agent.store.delete_snd_msg(&item.conn_id, item.internal_id).await;
            return;
        };

        let Some(lease) = agent.gate.begin_op(OpClass::SndNetwork) else {
            agent.gate.wait_resumed(OpClass::SndNetwork).await;
            continue;
        };
        let result = send_wire(agent, &queue, &rec).await;
        drop(lease);

        match result {
            Ok(()) => {
                on_send_success(agent, &conn, &queue, &rec).await;
                let _ = agent.store.delete_snd_msg(&item.conn_id, item.internal_id).await;
                return;
            }
            Err(err) => match classify(&err, rec.kind, &conn) {
                Disposition::Retry => {
                    if now_ms() >= deadline {
                        on_timeout(agent, &conn, &rec).await;
                        let _ = agent
                            .store
                            .delete_snd_msg(&item.conn_id, item.internal_id)
                            .await;
                        return;
                    }
                    debug!(
                        "transient send failure on {} msg {}: {err}; retrying",
                        conn.conn_id, rec.internal_id
                    );
                    tokio::time::sleep(Duration::from_millis(interval)).await;
                    interval = (interval * 2).min(backoff_cap);
                }
                Disposition::CancelRotation => {
                    warn!("rotation cancelled on {}: {err}", conn.conn_id);
                    let _ = agent.store.drop_next_snd_queue(&item.conn_id).await;
                    let _ = agent
                        .store
                        .delete_snd_msg(&item.conn_id, item.internal_id)
                        .await;
                    return;
                }
                Disposition::Terminal(event) => {
                    agent.emit(
                        conn.conn_id.clone(),
                        patch_internal_id(event, rec.internal_id),
                    );
                    let _ = agent
                        .store
                        .delete_snd_msg(&item.conn_id, item.internal_id)
                        .await;
                    return;
                }
            },
        }
    }
}

async fn send_wire(agent: &Agent, queue: &SndQueue, rec: &SndMsgRec) -> Result<(), TransportError> {
    match rec.kind {
        MsgKind::ConnInfo | MsgKind::ConnInfoReply => {
            agent.pool.send_confirmation(queue, rec.wire.clone()).await
        }
        _ => agent.pool.send_agent_message(queue, rec.wire.clone()).await,
    }
}

enum Disposition {
    Retry,
    CancelRotation,
    Terminal(AgentEvent),
}

fn not_available_or_accepted(conn: &ConnRecord) -> AgentEvent {
    let kind = if conn.initiator {
        ConnErrorKind::NotAvailable
    } else {
        ConnErrorKind::NotAccepted
    };
    AgentEvent::Err {
        err: AgentError::Conn(kind),
    }
}

fn classify(err: &TransportError, kind: MsgKind, conn: &ConnRecord) -> Disposition {
    let duplex = conn.duplex_handshake == Some(true);
    match err {
        TransportError::Smp(SmpErrorKind::Quota) => match kind {
            MsgKind::ConnInfo | MsgKind::ConnInfoReply => Disposition::Terminal(AgentEvent::Err {
                err: AgentError::Conn(ConnErrorKind::NotAvailable),
            }),
            MsgKind::QTest | MsgKind::QHello => Disposition::CancelRotation,
            _ => Disposition::Retry,
        },
        TransportError::Smp(SmpErrorKind::Auth) => match kind {
            MsgKind::ConnInfo | MsgKind::ConnInfoReply => Disposition::Terminal(AgentEvent::Err {
                err: AgentError::Conn(ConnErrorKind::NotAvailable),
            }),
            MsgKind::Hello if duplex => Disposition::Terminal(not_available_or_accepted(conn)),
            // legacy hello races queue securing; retried until the hello
            // timeout, then reported like the duplex case
            MsgKind::Hello => Disposition::Retry,
            MsgKind::Reply => Disposition::Terminal(AgentEvent::Err {
                err: AgentError::Smp(SmpErrorKind::Auth),
            }),
            MsgKind::AMsg => Disposition::Terminal(AgentEvent::MErr {
                internal_id: 0, // filled by caller via rec
                err: AgentError::Smp(SmpErrorKind::Auth),
            }),
            _ => Disposition::Terminal(AgentEvent::Err {
                err: AgentError::Smp(SmpErrorKind::Auth),
            }),
        },
        TransportError::Broker(BrokerErrorKind::Host)
        | TransportError::Broker(BrokerErrorKind::Timeout)
        | TransportError::Network(_) => Disposition::Retry,
        TransportError::Smp(kind_err) => Disposition::Terminal(match kind {
            MsgKind::AMsg => AgentEvent::MErr {
                internal_id: 0,
                err: AgentError::Smp(kind_err.clone()),
            },
            _ => AgentEvent::Err {
                err: AgentError::Smp(kind_err.clone()),
            },
        }),
        TransportError::Broker(b) => Disposition::Terminal(match kind {
            MsgKind::AMsg => AgentEvent::MErr {
                internal_id: 0,
                err: AgentError::Broker(b.clone()),
            },
            _ => AgentEvent::Err {
                err: AgentError::Broker(b.clone()),
            },
        }),
        TransportError::Crypto(msg) => Disposition::Terminal(AgentEvent::Err {
            err: AgentError::Internal(format!("send crypto: {msg}")),
        }),
    }
}

async fn on_timeout(agent: &Agent, conn: &ConnRecord, rec: &SndMsgRec) {
    let event = match rec.kind {
        MsgKind::AMsg => AgentEvent::MErr {
            internal_id: rec.internal_id,
            err: AgentError::Broker(BrokerErrorKind::Timeout),
        },
        MsgKind::Hello => not_available_or_accepted(conn),
        _ => AgentEvent::Err {
            err: AgentError::Broker(BrokerErrorKind::Timeout),
        },
    };
    agent.emit(conn.conn_id.clone(), event);
}

/// Kind-specific post-processing once the relay accepted the message. Runs
/// under the agent lock so state-machine effects stay serialized.
async fn on_send_success(agent: &Agent, conn: &ConnRecord, queue: &SndQueue, rec: &SndMsgRec) {
    let _guard = agent.state_lock.clone().lock_owned().await;
    let conn_id = conn.conn_id.clone();
    match rec.kind {
        MsgKind::ConnInfo | MsgKind::ConnInfoReply => {
            let _ = agent
                .store
                .set_snd_status(&conn_id, &queue.snd_id, SndQueueStatus::Confirmed)
                .await;
            if conn.duplex_handshake != Some(true) {
                if let Err(e) = agent
                    .stage_current(&conn_id, MsgKind::Hello, MsgFlags::default(), &AgentMsgPayload::Hello)
                    .await
                {
                    warn!("hello enqueue failed on {conn_id}: {e}");
                }
            }
        }
        MsgKind::Hello => {
            let _ = agent
                .store
                .set_snd_status(&conn_id, &queue.snd_id, SndQueueStatus::Active)
                .await;
            match agent.store.get_conn(&conn_id).await {
                Ok(fresh) => {
                    let peer_active = fresh
                        .current_rcv()
                        .map(|q| q.status == crate::connection::RcvQueueStatus::Active)
                        .unwrap_or(false);
                    if peer_active {
                        agent.emit(conn_id.clone(), AgentEvent::Con);
                    } else if conn.duplex_handshake != Some(true) && fresh.rcv_queues.is_empty() {
                        // legacy joiner: no receive queue yet, create one and
                        // offer it via REPLY
                        if let Err(e) = agent.create_legacy_reply_queue(&conn_id).await {
                            warn!("reply queue creation failed on {conn_id}: {e}");
                        }
                    }
                }
                Err(e) => warn!("conn reload failed on {conn_id}: {e}"),
            }
        }
        MsgKind::AMsg => {
            agent.emit(
                conn_id,
                AgentEvent::Sent {
                    internal_id: rec.internal_id,
                },
            );
        }
        MsgKind::QHello => {
            agent.emit(
                conn_id.clone(),
                AgentEvent::Switch {
                    phase: smp_agent_api::types::SwitchPhase::Completed,
                    stats: agent.connection_stats(&conn_id).await,
                },
            );
        }
        _ => {}
    }
}

/// Terminal classification needs the record's internal id for `MERR`; patch
/// it in where the classifier could not know it.
fn patch_internal_id(event: AgentEvent, internal_id: u64) -> AgentEvent {
    match event {
        AgentEvent::MErr { err, .. } => AgentEvent::MErr { internal_id, err },
        other => other,
    }
}
