use crate::connection::{RcvQueue, RcvQueueStatus, SndQueue};
use crate::crypto::{boxes, verify_signature, DhKeyPair, SignKeyPair};
use crate::ids::random_id;
use async_trait::async_trait;
use smp_agent_api::envelope::{encode_envelope, AgentEnvelope};
use smp_agent_api::error::{AgentError, BrokerErrorKind, SmpErrorKind};
use smp_agent_api::types::{ConnectionRequest, QueueId, ServerRef, SmpQueueUri};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("SMP {0}")]
    Smp(SmpErrorKind),
    #[error("BROKER {0}")]
    Broker(BrokerErrorKind),
    #[error("network {0}")]
    Network(String),
    #[error("crypto {0}")]
    Crypto(String),
}

impl From<TransportError> for AgentError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Smp(kind) => AgentError::Smp(kind),
            TransportError::Broker(kind) => AgentError::Broker(kind),
            TransportError::Network(msg) => AgentError::Broker(BrokerErrorKind::Unexpected(msg)),
            TransportError::Crypto(msg) => AgentError::Internal(format!("transport crypto: {msg}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NewQueue {
    pub rcv_id: QueueId,
    pub snd_id: QueueId,
}

#[derive(Clone, Debug)]
pub enum BrokerEvent {
    Msg { broker_id: String, body: Vec<u8> },
    End,
}

/// One item on the process-wide inbound stream shared by all servers.
#[derive(Clone, Debug)]
pub struct InboundEvent {
    pub server: ServerRef,
    pub session_id: Uuid,
    pub rcv_id: QueueId,
    pub event: BrokerEvent,
}

#[derive(Clone, Debug)]
pub struct SendAuth {
    pub verify_key: [u8; 32],
    pub signature: Vec<u8>,
}

/// Raw per-server protocol surface, injected at agent init. The production
/// implementation owns the TCP/TLS sessions; tests use `InMemorySmpNetwork`.
#[async_trait]
pub trait SmpTransport: Send + Sync {
    async fn create_queue(
        &self,
        server: &ServerRef,
        recipient_key: [u8; 32],
    ) -> Result<NewQueue, TransportError>;

    async fn secure_queue(
        &self,
        server: &ServerRef,
        rcv_id: &QueueId,
        sender_key: [u8; 32],
    ) -> Result<(), TransportError>;

    async fn send(
        &self,
        server: &ServerRef,
        snd_id: &QueueId,
        auth: Option<SendAuth>,
        body: Vec<u8>,
    ) -> Result<(), TransportError>;

    async fn ack(
        &self,
        server: &ServerRef,
        rcv_id: &QueueId,
        broker_id: &str,
    ) -> Result<(), TransportError>;

    async fn suspend_queue(
        &self,
        server: &ServerRef,
        rcv_id: &QueueId,
    ) -> Result<u64, TransportError>;

    async fn delete_queue(
        &self,
        server: &ServerRef,
        rcv_id: &QueueId,
    ) -> Result<(), TransportError>;

    async fn subscribe_queue(
        &self,
        server: &ServerRef,
        rcv_id: &QueueId,
        session_id: Uuid,
        sink: mpsc::UnboundedSender<InboundEvent>,
    ) -> Result<(), TransportError>;
}

/// Per-server client cache. Each server gets a session id; the inbound
/// streams of all subscriptions fan into one channel consumed by the receive
/// dispatcher.
#[derive(Clone)]
pub struct SmpClientPool {
    transport: Arc<dyn SmpTransport>,
    sessions: Arc<Mutex<HashMap<ServerRef, Uuid>>>,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
}

impl SmpClientPool {
    pub fn new(
        transport: Arc<dyn SmpTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<InboundEvent>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                transport,
                sessions: Arc::new(Mutex::new(HashMap::new())),
                inbound_tx,
            },
            inbound_rx,
        )
    }

    pub fn session_id(&self, server: &ServerRef) -> Uuid {
        let mut sessions = self.sessions.lock().expect("session lock");
        *sessions.entry(server.clone()).or_insert_with(Uuid::new_v4)
    }

    pub fn current_session(&self, server: &ServerRef) -> Option<Uuid> {
        self.sessions.lock().expect("session lock").get(server).copied()
    }

    pub fn drop_session(&self, server: &ServerRef) {
        self.sessions.lock().expect("session lock").remove(server);
    }

    pub async fn create_rcv_queue(
        &self,
        server: &ServerRef,
        client_version: u16,
    ) -> Result<RcvQueue, TransportError> {
        let sign_key = SignKeyPair::generate();
        let e2e_key = DhKeyPair::generate();
        let ids = self
            .transport
            .create_queue(server, sign_key.verify_key())
            .await?;
        Ok(RcvQueue {
            server: server.clone(),
            rcv_id: ids.rcv_id,
            snd_id: ids.snd_id,
            sign_key,
            e2e_key,
            peer_verify_key: None,
            client_version,
            status: RcvQueueStatus::New,
            current: true,
            rotation: None,
            rotation_started_ms: None,
            next_link: None,
        })
    }

    pub async fn secure_queue(
        &self,
        queue: &RcvQueue,
        sender_key: [u8; 32],
    ) -> Result<(), TransportError> {
        self.transport
            .secure_queue(&queue.server, &queue.rcv_id, sender_key)
            .await
    }

    /// Relay `NO_MSG` on ack means the message is already gone; swallowed.
    pub async fn send_ack(&self, queue: &RcvQueue, broker_id: &str) -> Result<(), TransportError> {
        match self
            .transport
            .ack(&queue.server, &queue.rcv_id, broker_id)
            .await
        {
            Err(TransportError::Smp(SmpErrorKind::NoMsg)) => Ok(()),
            other => other,
        }
    }

    pub async fn suspend_queue(&self, queue: &RcvQueue) -> Result<u64, TransportError> {
        self.transport
            .suspend_queue(&queue.server, &queue.rcv_id)
            .await
    }

    pub async fn delete_queue(&self, queue: &RcvQueue) -> Result<(), TransportError> {
        self.transport
            .delete_queue(&queue.server, &queue.rcv_id)
            .await
    }

    pub async fn subscribe_queue(&self, queue: &RcvQueue) -> Result<(), TransportError> {
        let session_id = self.session_id(&queue.server);
        self.transport
            .subscribe_queue(
                &queue.server,
                &queue.rcv_id,
                session_id,
                self.inbound_tx.clone(),
            )
            .await
    }

    pub async fn subscribe_queues(
        &self,
        queues: &[RcvQueue],
    ) -> Vec<(QueueId, Result<(), TransportError>)> {
        let mut results = Vec::with_capacity(queues.len());
        for queue in queues {
            results.push((queue.rcv_id.clone(), self.subscribe_queue(queue).await));
        }
        results
    }

    /// Unsigned send of a sealed confirmation envelope to a `New` queue.
    pub async fn send_confirmation(
        &self,
        queue: &SndQueue,
        wire: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.transport
            .send(&queue.server, &queue.snd_id, None, wire)
            .await
    }

    /// Signed send on a secured queue.
    pub async fn send_agent_message(
        &self,
        queue: &SndQueue,
        wire: Vec<u8>,
    ) -> Result<(), TransportError> {
        let auth = SendAuth {
            verify_key: queue.sign_key.verify_key(),
            signature: queue.sign_key.sign(&wire),
        };
        self.transport
            .send(&queue.server, &queue.snd_id, Some(auth), wire)
            .await
    }

    /// One-shot invitation to a contact queue; not routed through the outbox.
    pub async fn send_invitation(
        &self,
        uri: &SmpQueueUri,
        conn_req: ConnectionRequest,
        conn_info: Vec<u8>,
    ) -> Result<(), TransportError> {
        let envelope = AgentEnvelope::Invitation {
            conn_req,
            conn_info,
        };
        let bytes =
            encode_envelope(&envelope).map_err(|e| TransportError::Crypto(format!("{e}")))?;
        let padded_len = (bytes.len() + 2).div_ceil(1024) * 1024;
        let sealed = boxes::seal(&uri.dh_public, &bytes, padded_len)
            .map_err(|e| TransportError::Crypto(format!("{e}")))?;
        let wire =
            boxes::encode(&sealed).map_err(|e| TransportError::Crypto(format!("{e}")))?;
        self.transport.send(&uri.server, &uri.snd_id, None, wire).await
    }
}

// ---------------------------------------------------------------------------
// In-memory relay network

struct MemQueue {
    server: ServerRef,
    rcv_id: QueueId,
    snd_id: QueueId,
    #[allow(dead_code)]
    recipient_key: [u8; 32],
    sender_key: Option<[u8; 32]>,
    suspended: bool,
    messages: VecDeque<(String, Vec<u8>)>,
    subscriber: Option<(Uuid, mpsc::UnboundedSender<InboundEvent>)>,
}

#[derive(Default)]
struct MemState {
    by_rcv: HashMap<(ServerRef, String), MemQueue>,
    snd_to_rcv: HashMap<(ServerRef, String), String>,
    fail_sends_remaining: usize,
    quota_snd_ids: Vec<(ServerRef, String)>,
}

/// Relay network double shared between agents under test: real queue
/// semantics (AUTH on secured queues, QUOTA injection, suspend counts,
/// push delivery) without a server process.
#[derive(Clone, Default)]
pub struct InMemorySmpNetwork {
    state: Arc<Mutex<MemState>>,
}

impl InMemorySmpNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next `n` sends fail with `BROKER HOST`, then the network recovers.
    pub fn fail_next_sends(&self, n: usize) {
        self.state.lock().expect("mem state").fail_sends_remaining = n;
    }

    /// All further sends to this sender id fail with `QUOTA`.
    pub fn set_quota(&self, server: &ServerRef, snd_id: &QueueId) {
        self.state
            .lock()
            .expect("mem state")
            .quota_snd_ids
            .push((server.clone(), snd_id.value.clone()));
    }

    /// Redelivers the oldest unacked message, as a relay would after a
    /// transport reset.
    pub fn redeliver_oldest(&self, server: &ServerRef, rcv_id: &QueueId) {
        let state = self.state.lock().expect("mem state");
        let Some(queue) = state.by_rcv.get(&(server.clone(), rcv_id.value.clone())) else {
            return;
        };
        let Some((broker_id, body)) = queue.messages.front().cloned() else {
            return;
        };
        if let Some((session_id, sink)) = queue.subscriber.as_ref() {
            let _ = sink.send(InboundEvent {
                server: queue.server.clone(),
                session_id: *session_id,
                rcv_id: queue.rcv_id.clone(),
                event: BrokerEvent::Msg { broker_id, body },
            });
        }
    }

    /// Simulates a transport reset: every subscription on the server emits
    /// `END` with its session id.
    pub fn reset_transport(&self, server: &ServerRef) {
        let mut state = self.state.lock().expect("mem state");
        for queue in state.by_rcv.values_mut() {
            if &queue.server != server {
                continue;
            }
            if let Some((session_id, sink)) = queue.subscriber.take() {
                let _ = sink.send(InboundEvent {
                    server: queue.server.clone(),
                    session_id,
                    rcv_id: queue.rcv_id.clone(),
                    event: BrokerEvent::End,
                });
            }
        }
    }
}

#[async_trait]
impl SmpTransport for InMemorySmpNetwork {
    async fn create_queue(
        &self,
        server: &ServerRef,
        recipient_key: [u8; 32],
    ) -> Result<NewQueue, TransportError> {
        let mut state = self.state.lock().expect("mem state");
        let rcv_id = QueueId::new(random_id(16));
        let snd_id = QueueId::new(random_id(16));
        state.snd_to_rcv.insert(
            (server.clone(), snd_id.value.clone()),
            rcv_id.value.clone(),
        );
        state.by_rcv.insert(
            (server.clone(), rcv_id.value.clone()),
            MemQueue {
                server: server.clone(),
                rcv_id: rcv_id.clone(),
                snd_id: snd_id.clone(),
                recipient_key,
                sender_key: None,
                suspended: false,
                messages: VecDeque::new(),
                subscriber: None,
            },
        );
        Ok(NewQueue { rcv_id, snd_id })
    }

    async fn secure_queue(
        &self,
        server: &ServerRef,
        rcv_id: &QueueId,
        sender_key: [u8; 32],
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().expect("mem state");
        let queue = state
            .by_rcv
            .get_mut(&(server.clone(), rcv_id.value.clone()))
            .ok_or(TransportError::Smp(SmpErrorKind::Auth))?;
        queue.sender_key = Some(sender_key);
        Ok(())
    }

    async fn send(
        &self,
        server: &ServerRef,
        snd_id: &QueueId,
        auth: Option<SendAuth>,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().expect("mem state");
        if state.fail_sends_remaining > 0 {
            state.fail_sends_remaining -= 1;
            return Err(TransportError::Broker(BrokerErrorKind::Host));
        }
        if state
            .quota_snd_ids
            .contains(&(server.clone(), snd_id.value.clone()))
        {
            return Err(TransportError::Smp(SmpErrorKind::Quota));
        }
        let rcv_id = state
            .snd_to_rcv
            .get(&(server.clone(), snd_id.value.clone()))
            .cloned()
            .ok_or(TransportError::Smp(SmpErrorKind::Auth))?;
        let queue = state
            .by_rcv
            .get_mut(&(server.clone(), rcv_id))
            .ok_or(TransportError::Smp(SmpErrorKind::Auth))?;
        if queue.suspended {
            return Err(TransportError::Smp(SmpErrorKind::Auth));
        }
        match (&queue.sender_key, auth) {
            (Some(expected), Some(auth)) => {
                if auth.verify_key != *expected
                    || !verify_signature(expected, &body, &auth.signature)
                {
                    return Err(TransportError::Smp(SmpErrorKind::Auth));
                }
            }
            // a secured queue requires a signature; an unsecured queue
            // accepts only the unsigned confirmation
            (Some(_), None) => return Err(TransportError::Smp(SmpErrorKind::Auth)),
            (None, Some(_)) => return Err(TransportError::Smp(SmpErrorKind::Auth)),
            (None, None) => {}
        }
        let broker_id = Uuid::new_v4().to_string();
        queue.messages.push_back((broker_id.clone(), body.clone()));
        if let Some((session_id, sink)) = queue.subscriber.as_ref() {
            let _ = sink.send(InboundEvent {
                server: queue.server.clone(),
                session_id: *session_id,
                rcv_id: queue.rcv_id.clone(),
                event: BrokerEvent::Msg { broker_id, body },
            });
        }
        Ok(())
    }

    async fn ack(
        &self,
        server: &ServerRef,
        rcv_id: &QueueId,
        broker_id: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().expect("mem state");
        let queue = state
            .by_rcv
            .get_mut(&(server.clone(), rcv_id.value.clone()))
            .ok_or(TransportError::Smp(SmpErrorKind::Auth))?;
        let before = queue.messages.len();
        queue.messages.retain(|(id, _)| id != broker_id);
        if queue.messages.len() == before {
            return Err(TransportError::Smp(SmpErrorKind::NoMsg));
        }
        Ok(())
    }

    async fn suspend_queue(
        &self,
        server: &ServerRef,
        rcv_id: &QueueId,
    ) -> Result<u64, TransportError> {
        let mut state = self.state.lock().expect("mem state");
        let queue = state
            .by_rcv
            .get_mut(&(server.clone(), rcv_id.value.clone()))
            .ok_or(TransportError::Smp(SmpErrorKind::Auth))?;
        queue.suspended = true;
        Ok(queue.messages.len() as u64)
    }

    async fn delete_queue(
        &self,
        server: &ServerRef,
        rcv_id: &QueueId,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().expect("mem state");
        let queue = state
            .by_rcv
            .remove(&(server.clone(), rcv_id.value.clone()))
            .ok_or(TransportError::Smp(SmpErrorKind::Auth))?;
        state
            .snd_to_rcv
            .remove(&(server.clone(), queue.snd_id.value.clone()));
        Ok(())
    }

    async fn subscribe_queue(
        &self,
        server: &ServerRef,
        rcv_id: &QueueId,
        session_id: Uuid,
        sink: mpsc::UnboundedSender<InboundEvent>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().expect("mem state");
        let queue = state
            .by_rcv
            .get_mut(&(server.clone(), rcv_id.value.clone()))
            .ok_or(TransportError::Smp(SmpErrorKind::Auth))?;
        for (broker_id, body) in queue.messages.iter() {
            let _ = sink.send(InboundEvent {
                server: queue.server.clone(),
                session_id,
                rcv_id: queue.rcv_id.clone(),
                event: BrokerEvent::Msg {
                    broker_id: broker_id.clone(),
                    body: body.clone(),
                },
            });
        }
        queue.subscriber = Some((session_id, sink));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerRef {
        ServerRef::new("relay.test", 5223, "fp")
    }

    #[tokio::test]
    async fn unsigned_send_rejected_after_securing() {
        let network = InMemorySmpNetwork::new();
        let sign = SignKeyPair::generate();
        let ids = network
            .create_queue(&server(), sign.verify_key())
            .await
            .expect("create");
        let sender = SignKeyPair::generate();
        network
            .secure_queue(&server(), &ids.rcv_id, sender.verify_key())
            .await
            .expect("secure");
        let err = network
            .send(&server(), &ids.snd_id, None, b"x".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Smp(SmpErrorKind::Auth));
        let auth = SendAuth {
            verify_key: sender.verify_key(),
            signature: sender.sign(b"x"),
        };
        network
            .send(&server(), &ids.snd_id, Some(auth), b"x".to_vec())
            .await
            .expect("signed send");
    }

    #[tokio::test]
    async fn subscribe_flushes_pending_and_ack_removes() {
        let network = InMemorySmpNetwork::new();
        let sign = SignKeyPair::generate();
        let ids = network
            .create_queue(&server(), sign.verify_key())
            .await
            .expect("create");
        network
            .send(&server(), &ids.snd_id, None, b"pending".to_vec())
            .await
            .expect("send");
        let (tx, mut rx) = mpsc::unbounded_channel();
        network
            .subscribe_queue(&server(), &ids.rcv_id, Uuid::new_v4(), tx)
            .await
            .expect("subscribe");
        let event = rx.recv().await.expect("event");
        let BrokerEvent::Msg { broker_id, body } = event.event else {
            panic!("expected msg");
        };
        assert_eq!(body, b"pending");
        network
            .ack(&server(), &ids.rcv_id, &broker_id)
            .await
            .expect("ack");
        let err = network
            .ack(&server(), &ids.rcv_id, &broker_id)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Smp(SmpErrorKind::NoMsg));
    }

    #[tokio::test]
    async fn suspend_reports_remaining() {
        let network = InMemorySmpNetwork::new();
        let sign = SignKeyPair::generate();
        let ids = network
            .create_queue(&server(), sign.verify_key())
            .await
            .expect("create");
        network
            .send(&server(), &ids.snd_id, None, b"one".to_vec())
            .await
            .expect("send");
        let remaining = network
            .suspend_queue(&server(), &ids.rcv_id)
            .await
            .expect("suspend");
        assert_eq!(remaining, 1);
        let err = network
            .send(&server(), &ids.snd_id, None, b"two".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Smp(SmpErrorKind::Auth));
    }
}
