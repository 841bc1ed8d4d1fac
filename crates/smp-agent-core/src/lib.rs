pub mod config;
pub mod connection;
pub mod crypto;
mod delivery;
pub mod event;
pub mod gate;
pub mod ids;
pub mod ntf;
mod receive;
pub mod relay;
pub mod store;
pub mod time;

use config::{AgentConfig, NetworkConfig};
use connection::{ConnRecord, ConnVariant, RcvQueueStatus, RotationAction, SndQueue};
use crypto::ratchet::RatchetState;
use crypto::x3dh::{self, X3dhKeys};
use delivery::{DeliveryPool, QueuedSnd};
use event::{EventBus, EventReceiver};
use gate::{OpClass, OperationGate};
use ids::{new_conn_id, RcvQueueKey, SndWorkerKey};
use ntf::{NtfSupCommand, NtfSupervisor, NtfTransport};
use relay::{SmpClientPool, SmpTransport};
use smp_agent_api::envelope::{AgentMsgPayload, ConnInfoPayload};
use smp_agent_api::error::{AgentError, CmdErrorKind, ConnErrorKind};
use smp_agent_api::types::{
    AgentEvent, ConnId, ConnectionMode, ConnectionRequest, ConnectionStats, DeviceToken, MsgFlags,
    MsgMeta, NtfMode, NtfTknStatus, ServerRef, SwitchPhase,
};
use smp_agent_api::validation::negotiate_versions;
use smp_agent_store::key_provider::KeyProvider;
use smp_agent_store::EncryptedStore;
use store::{MsgKind, NtfTokenRec, Store};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

pub use event::EventReceiver as AgentEventReceiver;

/// A message decrypted on a next queue during rotation, held back until the
/// queue becomes current.
#[derive(Clone, Debug)]
pub(crate) struct BufferedMsg {
    pub meta: MsgMeta,
    pub flags: MsgFlags,
    pub body: Vec<u8>,
}

/// The SMP messaging agent. External collaborators (relay transport,
/// notification transport, store key provider) are injected at init; all
/// state-machine effects serialize on the agent-wide lock.
#[derive(Clone)]
pub struct Agent {
    pub(crate) config: AgentConfig,
    pub(crate) net_config: Arc<StdMutex<NetworkConfig>>,
    pub(crate) store: Store,
    pub(crate) pool: SmpClientPool,
    pub(crate) ntf: NtfSupervisor,
    pub(crate) events: EventBus,
    pub(crate) gate: OperationGate,
    pub(crate) state_lock: Arc<Mutex<()>>,
    pub(crate) delivery: DeliveryPool,
    pub(crate) rotation_buffer: Arc<StdMutex<HashMap<RcvQueueKey, Vec<BufferedMsg>>>>,
    pub(crate) subscribed: Arc<StdMutex<HashSet<ConnId>>>,
    pub(crate) smp_servers: Arc<StdMutex<Vec<ServerRef>>>,
    pub(crate) ntf_servers: Arc<StdMutex<Vec<ServerRef>>>,
    ntf_transport: Arc<dyn NtfTransport>,
}

impl Agent {
    pub async fn init(
        config: AgentConfig,
        key_provider: Arc<dyn KeyProvider>,
        smp_transport: Arc<dyn SmpTransport>,
        ntf_transport: Arc<dyn NtfTransport>,
    ) -> Result<Self, AgentError> {
        let kv = EncryptedStore::open(
            &config.storage_path,
            &config.namespace,
            key_provider.as_ref(),
        )
        .map_err(|e| AgentError::Internal(format!("store open: {e}")))?;
        let store = Store::new(kv);
        let (pool, inbound_rx) = SmpClientPool::new(smp_transport);
        let ntf = NtfSupervisor::new();
        let gate = OperationGate::new();
        let event_buffer = config.event_buffer;
        let agent = Self {
            smp_servers: Arc::new(StdMutex::new(config.smp_servers.clone())),
            ntf_servers: Arc::new(StdMutex::new(config.ntf_servers.clone())),
            config,
            net_config: Arc::new(StdMutex::new(NetworkConfig::default())),
            store: store.clone(),
            pool,
            ntf: ntf.clone(),
            events: EventBus::new(event_buffer),
            gate: gate.clone(),
            state_lock: Arc::new(Mutex::new(())),
            delivery: DeliveryPool::new(),
            rotation_buffer: Arc::new(StdMutex::new(HashMap::new())),
            subscribed: Arc::new(StdMutex::new(HashSet::new())),
            ntf_transport: ntf_transport.clone(),
        };
        tokio::spawn(receive::run_dispatcher(agent.clone(), inbound_rx));
        ntf.spawn(store, ntf_transport, gate);
        Ok(agent)
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    // -- connection setup --

    pub async fn create_connection(
        &self,
        mode: ConnectionMode,
    ) -> Result<(ConnId, String), AgentError> {
        self.gate.check_command()?;
        let _guard = self.state_lock.lock().await;
        self.create_connection_inner(mode).await
    }

    async fn create_connection_inner(
        &self,
        mode: ConnectionMode,
    ) -> Result<(ConnId, String), AgentError> {
        let server = self.pick_server(None)?;
        let _lease = self.rcv_lease()?;
        let queue = self
            .pool
            .create_rcv_queue(&server, self.config.smp_client_vrange.max_version)
            .await?;
        let x3dh = match mode {
            ConnectionMode::Invitation => Some(X3dhKeys::generate()),
            ConnectionMode::Contact => None,
        };
        let conn_id = new_conn_id();
        let conn_req = ConnectionRequest {
            mode,
            queue_uri: queue.uri(self.config.smp_client_vrange),
            e2e: x3dh
                .as_ref()
                .map(|keys| keys.params(smp_agent_api::validation::E2E_VERSION_RANGE.max_version)),
            agent_version_range: self.config.smp_agent_vrange,
        };
        let rec = ConnRecord {
            conn_id: conn_id.clone(),
            variant: match mode {
                ConnectionMode::Invitation => ConnVariant::Rcv,
                ConnectionMode::Contact => ConnVariant::Contact,
            },
            initiator: true,
            agent_version: self.config.smp_agent_vrange.max_version,
            enable_ntfs: false,
            duplex_handshake: None,
            rcv_queues: vec![queue.clone()],
            snd_queues: Vec::new(),
            x3dh,
            pending_conn_info: None,
        };
        self.store.create_conn(&rec).await?;
        self.pool.subscribe_queue(&queue).await.map_err(AgentError::from)?;
        self.subscribed
            .lock()
            .expect("subscribed set")
            .insert(conn_id.clone());
        let uri = conn_req.encode()?;
        self.emit(conn_id.clone(), AgentEvent::Inv { conn_req: uri.clone() });
        Ok((conn_id, uri))
    }

    pub async fn join_connection(
        &self,
        uri: &str,
        conn_info: Vec<u8>,
    ) -> Result<ConnId, AgentError> {
        self.gate.check_command()?;
        let _guard = self.state_lock.lock().await;
        self.join_connection_inner(uri, conn_info).await
    }

    async fn join_connection_inner(
        &self,
        uri: &str,
        conn_info: Vec<u8>,
    ) -> Result<ConnId, AgentError> {
        let req = ConnectionRequest::decode(uri)?;
        let negotiated = negotiate_versions(
            &req,
            self.config.smp_agent_vrange,
            self.config.smp_client_vrange,
        )?;
        match req.mode {
            ConnectionMode::Contact => {
                // open a fresh invitation connection and offer it to the
                // contact address
                let (conn_id, own_uri) =
                    self.create_connection_inner(ConnectionMode::Invitation).await?;
                let own_req = ConnectionRequest::decode(&own_uri)?;
                self.pool
                    .send_invitation(&req.queue_uri, own_req, conn_info)
                    .await
                    .map_err(AgentError::from)?;
                Ok(conn_id)
            }
            ConnectionMode::Invitation => {
                let peer_e2e = req
                    .e2e
                    .as_ref()
                    .ok_or(AgentError::Agent(
                        smp_agent_api::error::AgentErrorKind::Message,
                    ))?;
                let own = X3dhKeys::generate();
                let root = x3dh::snd_side(&own, peer_e2e);
                let ratchet =
                    RatchetState::init_snd(root, own.ratchet.clone(), peer_e2e.ratchet_key);
                let snd = SndQueue::from_uri(&req.queue_uri);
                let sender_key = snd.sign_key.verify_key();
                let duplex = negotiated.duplex_handshake();
                let conn_id = new_conn_id();
                let mut rcv_queues = Vec::new();
                if duplex {
                    let server = self.pick_server(None)?;
                    let _lease = self.rcv_lease()?;
                    let queue = self
                        .pool
                        .create_rcv_queue(&server, negotiated.client_version)
                        .await?;
                    rcv_queues.push(queue);
                }
                let rec = ConnRecord {
                    conn_id: conn_id.clone(),
                    variant: if duplex {
                        ConnVariant::Duplex
                    } else {
                        ConnVariant::Snd
                    },
                    initiator: false,
                    agent_version: negotiated.agent_version,
                    enable_ntfs: false,
                    duplex_handshake: Some(duplex),
                    rcv_queues: rcv_queues.clone(),
                    snd_queues: vec![snd],
                    x3dh: Some(own.clone()),
                    pending_conn_info: None,
                };
                self.store.create_conn(&rec).await?;
                self.store.init_ratchet(&conn_id, ratchet).await?;
                let payload = if duplex {
                    ConnInfoPayload::Reply {
                        queues: rcv_queues
                            .iter()
                            .map(|q| q.uri(self.config.smp_client_vrange))
                            .collect(),
                        conn_info,
                    }
                } else {
                    ConnInfoPayload::Info { conn_info }
                };
                self.stage_confirmation_current(
                    &conn_id,
                    MsgKind::ConnInfo,
                    &payload,
                    Some(own.params(peer_e2e.version)),
                    Some(sender_key),
                )
                .await?;
                for queue in &rcv_queues {
                    self.pool.subscribe_queue(queue).await.map_err(AgentError::from)?;
                }
                self.subscribed
                    .lock()
                    .expect("subscribed set")
                    .insert(conn_id.clone());
                Ok(conn_id)
            }
        }
    }

    /// Accepts a staged confirmation: secures the queue with the joiner's
    /// key, persists the ratchet, and connects the reply queues.
    pub async fn allow_connection(
        &self,
        conf_id: &str,
        conn_info: Vec<u8>,
    ) -> Result<(), AgentError> {
        self.gate.check_command()?;
        let _guard = self.state_lock.lock().await;
        let staged = self.store.get_confirmation(conf_id).await?;
        let conn_id = staged.conn_id.clone();
        let conn = self.store.get_conn(&conn_id).await?;
        if conn.variant != ConnVariant::Rcv {
            return Err(AgentError::Cmd(CmdErrorKind::Prohibited));
        }
        self.store.init_ratchet(&conn_id, staged.ratchet.clone()).await?;
        let queue = conn
            .current_rcv()
            .cloned()
            .ok_or(AgentError::Cmd(CmdErrorKind::Prohibited))?;
        if let Some(key) = staged.sender_key {
            self.store
                .set_rcv_peer_verify_key(&conn_id, &queue.rcv_id, key)
                .await?;
            match self.pool.secure_queue(&queue, key).await {
                Ok(()) => {
                    self.store
                        .set_rcv_status(&conn_id, &queue.rcv_id, RcvQueueStatus::Secured)
                        .await?;
                }
                // transient: stays Confirmed, re-secured on next subscribe
                Err(e) => warn!("secure queue failed on {conn_id}: {e}"),
            }
        }
        // reload so the queue updates above are not overwritten
        let mut conn = self.store.get_conn(&conn_id).await?;
        conn.agent_version = staged.agent_version;
        conn.duplex_handshake = Some(staged.agent_version >= 2);
        if let Some(reply_uri) = staged.reply_queues.first() {
            let snd = SndQueue::from_uri(reply_uri);
            let reply_sender_key = snd.sign_key.verify_key();
            conn.snd_queues.push(snd);
            conn.variant = ConnVariant::Duplex;
            self.store.put_conn(&conn).await?;
            self.stage_confirmation_current(
                &conn_id,
                MsgKind::ConnInfoReply,
                &ConnInfoPayload::Info { conn_info },
                None,
                Some(reply_sender_key),
            )
            .await?;
        } else {
            // legacy: our info travels in the reply confirmation once the
            // REPLY message arrives
            conn.pending_conn_info = Some(conn_info);
            self.store.put_conn(&conn).await?;
        }
        self.store.delete_confirmation(conf_id).await?;
        Ok(())
    }

    pub async fn accept_contact(
        &self,
        inv_id: &str,
        conn_info: Vec<u8>,
    ) -> Result<ConnId, AgentError> {
        self.gate.check_command()?;
        let _guard = self.state_lock.lock().await;
        let inv = self.store.get_invitation(inv_id).await?;
        if inv.accepted {
            return Err(AgentError::Cmd(CmdErrorKind::Prohibited));
        }
        self.store.mark_invitation_accepted(inv_id).await?;
        self.join_connection_inner(&inv.conn_req, conn_info).await
    }

    pub async fn reject_contact(&self, inv_id: &str) -> Result<(), AgentError> {
        self.gate.check_command()?;
        let _guard = self.state_lock.lock().await;
        self.store.delete_invitation(inv_id).await?;
        Ok(())
    }

    // -- subscriptions --

    pub async fn subscribe_connection(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        self.gate.check_command()?;
        let _guard = self.state_lock.lock().await;
        self.subscribe_connection_inner(conn_id).await
    }

    pub async fn subscribe_connections(
        &self,
        conn_ids: &[ConnId],
    ) -> Vec<(ConnId, Result<(), AgentError>)> {
        let mut results = Vec::with_capacity(conn_ids.len());
        for conn_id in conn_ids {
            results.push((conn_id.clone(), self.subscribe_connection(conn_id).await));
        }
        results
    }

    pub async fn resubscribe_connection(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        if self
            .subscribed
            .lock()
            .expect("subscribed set")
            .contains(conn_id)
        {
            return Ok(());
        }
        self.subscribe_connection(conn_id).await
    }

    pub async fn resubscribe_connections(
        &self,
        conn_ids: &[ConnId],
    ) -> Vec<(ConnId, Result<(), AgentError>)> {
        let mut results = Vec::with_capacity(conn_ids.len());
        for conn_id in conn_ids {
            results.push((conn_id.clone(), self.resubscribe_connection(conn_id).await));
        }
        results
    }

    async fn subscribe_connection_inner(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        let conn = self.store.get_conn(conn_id).await?;
        {
            let _lease = self.rcv_lease()?;
            for queue in &conn.rcv_queues {
                self.pool.subscribe_queue(queue).await.map_err(AgentError::from)?;
                // re-secure a queue left Confirmed by a transient failure
                if queue.status == RcvQueueStatus::Confirmed {
                    if let Some(key) = queue.peer_verify_key {
                        match self.pool.secure_queue(queue, key).await {
                            Ok(()) => {
                                self.store
                                    .set_rcv_status(
                                        conn_id,
                                        &queue.rcv_id,
                                        RcvQueueStatus::Secured,
                                    )
                                    .await?;
                            }
                            Err(e) => warn!("re-secure failed on {conn_id}: {e}"),
                        }
                    }
                }
            }
        }
        // resume pending deliveries
        let pending = self.store.pending_snd_ids(conn_id).await?;
        if !pending.is_empty() {
            if let Some(queue) = conn.current_snd() {
                let key = SndWorkerKey {
                    server: queue.server.clone(),
                    snd_id: queue.snd_id.clone(),
                };
                let items = pending
                    .into_iter()
                    .map(|internal_id| QueuedSnd {
                        conn_id: conn_id.clone(),
                        internal_id,
                    })
                    .collect();
                self.delivery.kick(self, key, items);
            }
        }
        self.resume_rotation(&conn).await?;
        if conn.enable_ntfs {
            self.ntf.enqueue(NtfSupCommand::CreateSub(conn_id.clone()));
        }
        self.subscribed
            .lock()
            .expect("subscribed set")
            .insert(conn_id.clone());
        Ok(())
    }

    /// Continues an interrupted rotation from the persisted action.
    async fn resume_rotation(&self, conn: &ConnRecord) -> Result<(), AgentError> {
        let Some(current) = conn.current_rcv() else {
            return Ok(());
        };
        match current.rotation {
            Some(RotationAction::SecureNext) => {
                let Some(next) = conn.next_rcv() else {
                    return Ok(());
                };
                if next.status < RcvQueueStatus::Secured {
                    if let Some(key) = next.peer_verify_key {
                        let _lease = self.rcv_lease()?;
                        if self.pool.secure_queue(next, key).await.is_ok() {
                            self.store
                                .set_rcv_status(
                                    &conn.conn_id,
                                    &next.rcv_id,
                                    RcvQueueStatus::Secured,
                                )
                                .await?;
                            self.stage_current(
                                &conn.conn_id,
                                MsgKind::QReady,
                                MsgFlags::default(),
                                &AgentMsgPayload::QReady { addr: next.addr() },
                            )
                            .await?;
                        }
                    }
                }
            }
            Some(RotationAction::SuspendCurrent) | Some(RotationAction::DeleteCurrent) => {
                let _lease = self.rcv_lease()?;
                let remaining = self.pool.suspend_queue(current).await.unwrap_or(u64::MAX);
                if remaining == 0 {
                    receive::complete_rotation(self, &conn.conn_id).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    // -- messaging --

    pub async fn send_message(
        &self,
        conn_id: &ConnId,
        flags: MsgFlags,
        body: Vec<u8>,
    ) -> Result<u64, AgentError> {
        self.gate.check_command()?;
        let _guard = self.state_lock.lock().await;
        let conn = self.store.get_conn(conn_id).await?;
        match conn.variant {
            ConnVariant::Contact => return Err(AgentError::Cmd(CmdErrorKind::Prohibited)),
            ConnVariant::Rcv => return Err(AgentError::Conn(ConnErrorKind::Simplex)),
            _ => {}
        }
        self.stage_current(conn_id, MsgKind::AMsg, flags, &AgentMsgPayload::Msg { body })
            .await
    }

    pub async fn ack_message(&self, conn_id: &ConnId, internal_id: u64) -> Result<(), AgentError> {
        self.gate.check_command()?;
        let _guard = self.state_lock.lock().await;
        let conn = self.store.get_conn(conn_id).await?;
        let Some(broker_id) = self.store.mark_user_acked(conn_id, internal_id).await? else {
            return Ok(()); // already acked: no network effect
        };
        if let Some(queue) = conn.current_rcv() {
            let _lease = self.rcv_lease()?;
            self.pool
                .send_ack(queue, &broker_id)
                .await
                .map_err(AgentError::from)?;
        }
        self.store.delete_rcv_msg(conn_id, internal_id).await?;
        // a rotation waiting on drain may now be able to finish
        let fresh = self.store.get_conn(conn_id).await?;
        if let Some(current) = fresh.current_rcv() {
            if current.rotation == Some(RotationAction::SuspendCurrent) {
                let remaining = self.pool.suspend_queue(current).await.unwrap_or(u64::MAX);
                if remaining == 0 {
                    self.store
                        .set_rotation(conn_id, &current.rcv_id, RotationAction::DeleteCurrent)
                        .await?;
                    receive::complete_rotation(self, conn_id).await?;
                }
            }
        }
        Ok(())
    }

    // -- rotation --

    /// Starts queue rotation: only valid on an established duplex connection
    /// with no rotation already in flight.
    pub async fn switch_connection(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        self.gate.check_command()?;
        let _guard = self.state_lock.lock().await;
        let conn = self.store.get_conn(conn_id).await?;
        if conn.variant != ConnVariant::Duplex {
            return Err(AgentError::Cmd(CmdErrorKind::Prohibited));
        }
        let current = conn
            .current_rcv()
            .ok_or(AgentError::Cmd(CmdErrorKind::Prohibited))?;
        if current.rotation.is_some() || conn.next_rcv().is_some() {
            return Err(AgentError::Cmd(CmdErrorKind::Prohibited));
        }
        let server = self.pick_server(Some(&current.server))?;
        let _lease = self.rcv_lease()?;
        let mut next = self
            .pool
            .create_rcv_queue(&server, current.client_version)
            .await?;
        next.current = false;
        let next_uri = next.uri(self.config.smp_client_vrange);
        self.store.add_next_rcv_queue(conn_id, next.clone()).await?;
        self.store
            .set_rotation(conn_id, &current.rcv_id, RotationAction::CreateNext)
            .await?;
        self.pool.subscribe_queue(&next).await.map_err(AgentError::from)?;
        self.emit(
            conn_id.clone(),
            AgentEvent::Switch {
                phase: SwitchPhase::Started,
                stats: self.connection_stats(conn_id).await,
            },
        );
        self.stage_current(
            conn_id,
            MsgKind::QNew,
            MsgFlags::default(),
            &AgentMsgPayload::QNew {
                current: current.addr(),
                next_uri,
            },
        )
        .await?;
        Ok(())
    }

    // -- lifecycle --

    pub async fn suspend_connection(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        self.gate.check_command()?;
        let _guard = self.state_lock.lock().await;
        let conn = self.store.get_conn(conn_id).await?;
        if let Some(queue) = conn.current_rcv() {
            let _lease = self.rcv_lease()?;
            self.pool
                .suspend_queue(queue)
                .await
                .map_err(AgentError::from)?;
        }
        self.emit(
            conn_id.clone(),
            AgentEvent::Stat {
                stats: self.connection_stats(conn_id).await,
            },
        );
        Ok(())
    }

    /// Idempotent: deleting an unknown connection is not an error.
    pub async fn delete_connection(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        self.gate.check_command()?;
        let _guard = self.state_lock.lock().await;
        let conn = match self.store.get_conn(conn_id).await {
            Ok(conn) => conn,
            Err(store::StoreError::NotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for queue in &conn.rcv_queues {
            if let Err(e) = self.pool.delete_queue(queue).await {
                warn!("queue delete failed on {conn_id}: {e}");
            }
            self.rotation_buffer
                .lock()
                .expect("rotation buffer")
                .remove(&RcvQueueKey {
                    server: queue.server.clone(),
                    rcv_id: queue.rcv_id.clone(),
                });
        }
        for queue in &conn.snd_queues {
            self.delivery.drop_worker(&SndWorkerKey {
                server: queue.server.clone(),
                snd_id: queue.snd_id.clone(),
            });
        }
        self.store.delete_conn(conn_id).await?;
        self.subscribed
            .lock()
            .expect("subscribed set")
            .remove(conn_id);
        self.ntf.enqueue(NtfSupCommand::DeleteSub(conn_id.clone()));
        self.emit(conn_id.clone(), AgentEvent::Ok);
        Ok(())
    }

    // -- queries and configuration --

    pub async fn get_connection_servers(
        &self,
        conn_id: &ConnId,
    ) -> Result<Vec<ServerRef>, AgentError> {
        let conn = self.store.get_conn(conn_id).await?;
        Ok(conn.servers())
    }

    pub fn set_smp_servers(&self, servers: Vec<ServerRef>) {
        *self.smp_servers.lock().expect("smp servers") = servers;
    }

    pub fn set_ntf_servers(&self, servers: Vec<ServerRef>) {
        *self.ntf_servers.lock().expect("ntf servers") = servers;
    }

    pub fn set_network_config(&self, config: NetworkConfig) {
        *self.net_config.lock().expect("net config") = config;
    }

    pub fn get_network_config(&self) -> NetworkConfig {
        self.net_config.lock().expect("net config").clone()
    }

    // -- notification tokens --

    pub async fn register_ntf_token(
        &self,
        token: DeviceToken,
        mode: NtfMode,
    ) -> Result<String, AgentError> {
        self.gate.check_command()?;
        let server = self.pick_ntf_server()?;
        let existing = self.store.load_ntf_token().await?;
        let lease = self
            .gate
            .begin_op(OpClass::NtfNetwork)
            .ok_or(AgentError::Cmd(CmdErrorKind::Prohibited))?;
        let (rec, tkn_id) = match existing {
            Some(mut rec) if rec.tkn_id.is_some() && rec.device_token != token => {
                let tkn_id = rec.tkn_id.clone().unwrap_or_default();
                self.ntf_transport
                    .replace(&rec.server, &tkn_id, &token)
                    .await?;
                rec.device_token = token;
                rec.status = NtfTknStatus::Registered;
                rec.mode = mode;
                (rec, tkn_id)
            }
            _ => {
                let tkn_id = self.ntf_transport.register(&server, &token).await?;
                let rec = NtfTokenRec {
                    device_token: token,
                    server,
                    tkn_id: Some(tkn_id.clone()),
                    status: NtfTknStatus::Registered,
                    mode,
                };
                (rec, tkn_id)
            }
        };
        drop(lease);
        self.store.store_ntf_token(&rec).await?;
        Ok(tkn_id)
    }

    pub async fn verify_ntf_token(&self, code: &str) -> Result<(), AgentError> {
        self.gate.check_command()?;
        let mut rec = self
            .store
            .load_ntf_token()
            .await?
            .ok_or(AgentError::Cmd(CmdErrorKind::Prohibited))?;
        let tkn_id = rec
            .tkn_id
            .clone()
            .ok_or(AgentError::Cmd(CmdErrorKind::Prohibited))?;
        let _lease = self
            .gate
            .begin_op(OpClass::NtfNetwork)
            .ok_or(AgentError::Cmd(CmdErrorKind::Prohibited))?;
        self.ntf_transport.verify(&rec.server, &tkn_id, code).await?;
        rec.status = NtfTknStatus::Confirmed;
        self.store.store_ntf_token(&rec).await?;
        Ok(())
    }

    pub async fn check_ntf_token(&self) -> Result<NtfTknStatus, AgentError> {
        self.gate.check_command()?;
        let mut rec = self
            .store
            .load_ntf_token()
            .await?
            .ok_or(AgentError::Cmd(CmdErrorKind::Prohibited))?;
        let tkn_id = rec
            .tkn_id
            .clone()
            .ok_or(AgentError::Cmd(CmdErrorKind::Prohibited))?;
        let _lease = self
            .gate
            .begin_op(OpClass::NtfNetwork)
            .ok_or(AgentError::Cmd(CmdErrorKind::Prohibited))?;
        let status = self.ntf_transport.check(&rec.server, &tkn_id).await?;
        rec.status = status;
        self.store.store_ntf_token(&rec).await?;
        Ok(status)
    }

    /// Marks the token expired and broadcasts the delete, cancelling any
    /// pending subscription work.
    pub async fn delete_ntf_token(&self) -> Result<(), AgentError> {
        self.gate.check_command()?;
        if let Some(mut rec) = self.store.load_ntf_token().await? {
            rec.status = NtfTknStatus::Expired;
            self.store.store_ntf_token(&rec).await?;
        }
        self.ntf.flush_then_enqueue(NtfSupCommand::DeleteToken);
        Ok(())
    }

    pub async fn toggle_connection_ntfs(
        &self,
        conn_id: &ConnId,
        enable: bool,
    ) -> Result<(), AgentError> {
        self.gate.check_command()?;
        let _guard = self.state_lock.lock().await;
        let mut conn = self.store.get_conn(conn_id).await?;
        conn.enable_ntfs = enable;
        self.store.put_conn(&conn).await?;
        self.ntf.enqueue(if enable {
            NtfSupCommand::CreateSub(conn_id.clone())
        } else {
            NtfSupCommand::DeleteSub(conn_id.clone())
        });
        Ok(())
    }

    // -- agent lifecycle --

    pub fn activate_agent(&self) {
        self.gate.activate();
    }

    pub async fn suspend_agent(&self, max_delay: Duration) {
        self.gate.suspend(max_delay).await;
    }

    // -- internal helpers --

    pub(crate) fn emit(&self, conn_id: ConnId, event: AgentEvent) {
        self.events.publish(conn_id, event);
    }

    pub(crate) fn net_config(&self) -> NetworkConfig {
        self.net_config.lock().expect("net config").clone()
    }

    fn rcv_lease(&self) -> Result<gate::OpLease, AgentError> {
        self.gate
            .begin_op(OpClass::RcvNetwork)
            .ok_or(AgentError::Cmd(CmdErrorKind::Prohibited))
    }

    fn pick_server(&self, avoid: Option<&ServerRef>) -> Result<ServerRef, AgentError> {
        let servers = self.smp_servers.lock().expect("smp servers");
        if servers.is_empty() {
            return Err(AgentError::Internal("no SMP servers configured".to_string()));
        }
        if let Some(avoid) = avoid {
            if let Some(other) = servers.iter().find(|s| *s != avoid) {
                return Ok(other.clone());
            }
        }
        Ok(servers[0].clone())
    }

    fn pick_ntf_server(&self) -> Result<ServerRef, AgentError> {
        let servers = self.ntf_servers.lock().expect("ntf servers");
        servers
            .first()
            .cloned()
            .ok_or_else(|| AgentError::Ntf("no notification servers configured".to_string()))
    }

    pub(crate) async fn connection_stats(&self, conn_id: &ConnId) -> ConnectionStats {
        let Ok(conn) = self.store.get_conn(conn_id).await else {
            return ConnectionStats::default();
        };
        let pending = self
            .store
            .pending_snd_ids(conn_id)
            .await
            .map(|ids| ids.len())
            .unwrap_or(0);
        ConnectionStats {
            rcv_queues: conn.rcv_queues.len(),
            snd_queues: conn.snd_queues.len(),
            pending_snd_msgs: pending,
        }
    }

    /// Stages a ratcheted agent message on the current send queue and wakes
    /// its worker.
    pub(crate) async fn stage_current(
        &self,
        conn_id: &ConnId,
        kind: MsgKind,
        flags: MsgFlags,
        payload: &AgentMsgPayload,
    ) -> Result<u64, AgentError> {
        let conn = self.store.get_conn(conn_id).await?;
        let queue = conn
            .current_snd()
            .cloned()
            .ok_or(AgentError::Conn(ConnErrorKind::Simplex))?;
        self.stage_on(&conn, queue, kind, flags, payload).await
    }

    /// Stages on the next send queue; only `QTEST` travels this path before
    /// the swap.
    pub(crate) async fn stage_next(
        &self,
        conn_id: &ConnId,
        kind: MsgKind,
        flags: MsgFlags,
        payload: &AgentMsgPayload,
    ) -> Result<u64, AgentError> {
        let conn = self.store.get_conn(conn_id).await?;
        let queue = conn
            .next_snd()
            .cloned()
            .ok_or(AgentError::Cmd(CmdErrorKind::Prohibited))?;
        self.stage_on(&conn, queue, kind, flags, payload).await
    }

    async fn stage_on(
        &self,
        conn: &ConnRecord,
        queue: SndQueue,
        kind: MsgKind,
        flags: MsgFlags,
        payload: &AgentMsgPayload,
    ) -> Result<u64, AgentError> {
        let staged = self
            .store
            .stage_agent_msg(
                &conn.conn_id,
                kind,
                flags,
                payload,
                conn.agent_version,
                &queue.e2e_public,
                self.config.e2e_enc_user_msg_length,
            )
            .await?;
        self.delivery.kick(
            self,
            SndWorkerKey {
                server: queue.server.clone(),
                snd_id: queue.snd_id.clone(),
            },
            vec![QueuedSnd {
                conn_id: conn.conn_id.clone(),
                internal_id: staged.internal_id,
            }],
        );
        Ok(staged.internal_id)
    }

    pub(crate) async fn stage_confirmation_current(
        &self,
        conn_id: &ConnId,
        kind: MsgKind,
        payload: &ConnInfoPayload,
        e2e: Option<smp_agent_api::types::E2eParams>,
        sender_key: Option<[u8; 32]>,
    ) -> Result<(), AgentError> {
        let conn = self.store.get_conn(conn_id).await?;
        let queue = conn
            .current_snd()
            .cloned()
            .ok_or(AgentError::Conn(ConnErrorKind::Simplex))?;
        let staged = self
            .store
            .stage_confirmation_msg(
                conn_id,
                kind,
                payload,
                e2e,
                sender_key,
                conn.agent_version,
                &queue.e2e_public,
                self.config.e2e_enc_conn_info_length,
            )
            .await?;
        self.delivery.kick(
            self,
            SndWorkerKey {
                server: queue.server.clone(),
                snd_id: queue.snd_id.clone(),
            },
            vec![QueuedSnd {
                conn_id: conn_id.clone(),
                internal_id: staged.internal_id,
            }],
        );
        Ok(())
    }

    /// Legacy joiner without a receive queue: create one after HELLO and
    /// offer it via REPLY.
    pub(crate) async fn create_legacy_reply_queue(
        &self,
        conn_id: &ConnId,
    ) -> Result<(), AgentError> {
        let server = self.pick_server(None)?;
        let _lease = self.rcv_lease()?;
        let queue = self
            .pool
            .create_rcv_queue(&server, self.config.smp_client_vrange.max_version)
            .await?;
        self.store.add_rcv_queue(conn_id, queue.clone()).await?;
        let mut conn = self.store.get_conn(conn_id).await?;
        conn.variant = ConnVariant::Duplex;
        self.store.put_conn(&conn).await?;
        self.pool.subscribe_queue(&queue).await.map_err(AgentError::from)?;
        self.stage_current(
            conn_id,
            MsgKind::Reply,
            MsgFlags::default(),
            &AgentMsgPayload::Reply {
                queues: vec![queue.uri(self.config.smp_client_vrange)],
            },
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
