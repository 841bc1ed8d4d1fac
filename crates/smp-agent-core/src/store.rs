use crate::connection::{
    ConnRecord, RcvQueue, RcvQueueStatus, RotationAction, SndQueue, SndQueueStatus,
};
use crate::crypto::ratchet::{
    encode_msg, RatchetState, SkippedDiff, SkippedEntry, SkippedKeys,
};
use crate::crypto::{boxes, sha256};
use crate::time::now_ms;
use serde::{Deserialize, Serialize};
use smp_agent_api::envelope::{
    encode_agent_message, encode_conn_info, encode_envelope, AgentEnvelope, AgentMessage,
    AgentMsgPayload, ConnInfoPayload, PrivHeader,
};
use smp_agent_api::types::{
    ConnId, DeviceToken, E2eParams, MsgFlags, MsgIntegrity, NtfMode, NtfTknStatus, QueueId,
    ServerRef,
};
use smp_agent_store::EncryptedStore;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("duplicate")]
    Duplicate,
    #[error("integrity: {0}")]
    Integrity(String),
    #[error("bad version")]
    BadVersion,
    #[error("internal: {0}")]
    Internal(String),
}

fn backend(e: smp_agent_store::StoreBackendError) -> StoreError {
    StoreError::Internal(format!("store backend: {e}"))
}

/// A missing foreign key surfaces as `CMD PROHIBITED` at the API boundary;
/// everything else is internal.
impl From<StoreError> for smp_agent_api::error::AgentError {
    fn from(e: StoreError) -> Self {
        use smp_agent_api::error::{AgentError, CmdErrorKind};
        match e {
            StoreError::NotFound => AgentError::Cmd(CmdErrorKind::Prohibited),
            other => AgentError::Internal(format!("store: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum MsgKind {
    ConnInfo,
    ConnInfoReply,
    Hello,
    Reply,
    AMsg,
    QNew,
    QKeys,
    QReady,
    QTest,
    QSwitch,
    QHello,
}

/// Outbox record: staged before the first send attempt, deleted on terminal
/// resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SndMsgRec {
    pub internal_id: u64,
    pub snd_msg_id: u64,
    pub ts_ms: u64,
    pub kind: MsgKind,
    pub flags: MsgFlags,
    pub body: Vec<u8>,
    pub wire: Vec<u8>,
    pub hash: [u8; 32],
    pub prev_hash: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RcvMsgRec {
    pub internal_id: u64,
    pub ext_snd_id: u64,
    pub broker_id: String,
    pub ts_ms: u64,
    pub hash: [u8; 32],
    pub prev_hash: [u8; 32],
    pub user_acked: bool,
}

/// Remembers a relay message id after the record itself is gone, so redelivery
/// can be re-acked instead of re-emitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerIdx {
    pub internal_id: u64,
    pub acked: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConnMeta {
    next_internal_id: u64,
    next_snd_msg_id: u64,
    last_snd_hash: [u8; 32],
    last_rcv_ext_id: u64,
    last_rcv_hash: [u8; 32],
}

impl Default for ConnMeta {
    fn default() -> Self {
        Self {
            next_internal_id: 1,
            next_snd_msg_id: 1,
            last_snd_hash: [0; 32],
            last_rcv_ext_id: 0,
            last_rcv_hash: [0; 32],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoredRatchet {
    state: RatchetState,
    skipped: Vec<SkippedEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagedConfirmation {
    pub conf_id: String,
    pub conn_id: ConnId,
    pub agent_version: u16,
    pub sender_key: Option<[u8; 32]>,
    pub reply_queues: Vec<smp_agent_api::types::SmpQueueUri>,
    pub conn_info: Vec<u8>,
    pub ratchet: RatchetState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagedInvitation {
    pub inv_id: String,
    pub contact_conn_id: ConnId,
    pub conn_req: String,
    pub conn_info: Vec<u8>,
    pub accepted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NtfTokenRec {
    pub device_token: DeviceToken,
    pub server: ServerRef,
    pub tkn_id: Option<String>,
    pub status: NtfTknStatus,
    pub mode: NtfMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagedSnd {
    pub internal_id: u64,
    pub snd_msg_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RcvApplied {
    pub internal_id: u64,
    pub integrity: MsgIntegrity,
}

/// Typed transactional gateway over the encrypted KV store. Every method
/// performs its reads and writes under one store guard.
#[derive(Clone)]
pub struct Store {
    kv: Arc<Mutex<EncryptedStore>>,
}

fn conn_key(id: &ConnId) -> String {
    format!("conn:{}", id.value)
}

fn meta_key(id: &ConnId) -> String {
    format!("meta:{}", id.value)
}

fn outbox_key(id: &ConnId, internal_id: u64) -> String {
    format!("outbox:{}:{:020}", id.value, internal_id)
}

fn rcvmsg_key(id: &ConnId, internal_id: u64) -> String {
    format!("rcvmsg:{}:{:020}", id.value, internal_id)
}

fn brk_key(id: &ConnId, broker_id: &str) -> String {
    format!("brk:{}:{}", id.value, broker_id)
}

fn ratchet_key(id: &ConnId) -> String {
    format!("ratchet:{}", id.value)
}

fn rcv_idx_key(server: &ServerRef, rcv_id: &QueueId) -> String {
    format!("idx:rcv:{}:{}", server, rcv_id.value)
}

fn conf_key(conf_id: &str) -> String {
    format!("conf:{conf_id}")
}

fn inv_key(inv_id: &str) -> String {
    format!("inv:{inv_id}")
}

const NTF_TOKEN_KEY: &str = "ntf:token";

fn get_decoded<T: serde::de::DeserializeOwned>(
    kv: &EncryptedStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match kv.get(key) {
        None => Ok(None),
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|_| StoreError::BadVersion),
    }
}

fn put_encoded<T: Serialize>(
    kv: &mut EncryptedStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes =
        serde_json::to_vec(value).map_err(|e| StoreError::Internal(format!("encode: {e}")))?;
    kv.put(key, &bytes).map_err(backend)
}

/// Client-envelope boxes pad to the next KiB boundary; the fixed-length
/// discipline lives at the e2e layer.
fn box_len(len: usize) -> usize {
    ((len + 2).div_ceil(1024)) * 1024
}

impl Store {
    pub fn new(kv: EncryptedStore) -> Self {
        Self {
            kv: Arc::new(Mutex::new(kv)),
        }
    }

    // -- connections --

    pub async fn create_conn(&self, rec: &ConnRecord) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        let key = conn_key(&rec.conn_id);
        if kv.get(&key).is_some() {
            return Err(StoreError::Duplicate);
        }
        put_encoded(&mut kv, &key, rec)?;
        put_encoded(&mut kv, &meta_key(&rec.conn_id), &ConnMeta::default())?;
        for rq in &rec.rcv_queues {
            put_encoded(&mut kv, &rcv_idx_key(&rq.server, &rq.rcv_id), &rec.conn_id)?;
        }
        Ok(())
    }

    pub async fn get_conn(&self, conn_id: &ConnId) -> Result<ConnRecord, StoreError> {
        let kv = self.kv.lock().await;
        get_decoded(&kv, &conn_key(conn_id))?.ok_or(StoreError::NotFound)
    }

    pub async fn put_conn(&self, rec: &ConnRecord) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        if kv.get(&conn_key(&rec.conn_id)).is_none() {
            return Err(StoreError::NotFound);
        }
        put_encoded(&mut kv, &conn_key(&rec.conn_id), rec)
    }

    pub async fn delete_conn(&self, conn_id: &ConnId) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        let rec: Option<ConnRecord> = get_decoded(&kv, &conn_key(conn_id))?;
        let Some(rec) = rec else {
            return Err(StoreError::NotFound);
        };
        for rq in &rec.rcv_queues {
            kv.delete(&rcv_idx_key(&rq.server, &rq.rcv_id)).map_err(backend)?;
        }
        for prefix in [
            format!("outbox:{}:", conn_id.value),
            format!("rcvmsg:{}:", conn_id.value),
            format!("brk:{}:", conn_id.value),
        ] {
            for key in kv.keys_with_prefix(&prefix) {
                kv.delete(&key).map_err(backend)?;
            }
        }
        kv.delete(&ratchet_key(conn_id)).map_err(backend)?;
        kv.delete(&meta_key(conn_id)).map_err(backend)?;
        kv.delete(&conn_key(conn_id)).map_err(backend)?;
        Ok(())
    }

    pub async fn resolve_rcv_queue(
        &self,
        server: &ServerRef,
        rcv_id: &QueueId,
    ) -> Result<Option<ConnId>, StoreError> {
        let kv = self.kv.lock().await;
        get_decoded(&kv, &rcv_idx_key(server, rcv_id))
    }

    async fn update_conn<T>(
        &self,
        conn_id: &ConnId,
        f: impl FnOnce(&mut ConnRecord) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut kv = self.kv.lock().await;
        let mut rec: ConnRecord =
            get_decoded(&kv, &conn_key(conn_id))?.ok_or(StoreError::NotFound)?;
        let out = f(&mut rec)?;
        put_encoded(&mut kv, &conn_key(conn_id), &rec)?;
        Ok(out)
    }

    // -- queue setters --

    pub async fn set_rcv_status(
        &self,
        conn_id: &ConnId,
        rcv_id: &QueueId,
        status: RcvQueueStatus,
    ) -> Result<(), StoreError> {
        self.update_conn(conn_id, |rec| {
            let queue = rec
                .rcv_queues
                .iter_mut()
                .find(|q| &q.rcv_id == rcv_id)
                .ok_or(StoreError::NotFound)?;
            if status < queue.status {
                return Err(StoreError::Integrity(format!(
                    "rcv status regression {:?} -> {:?}",
                    queue.status, status
                )));
            }
            queue.status = status;
            Ok(())
        })
        .await
    }

    pub async fn set_snd_status(
        &self,
        conn_id: &ConnId,
        snd_id: &QueueId,
        status: SndQueueStatus,
    ) -> Result<(), StoreError> {
        self.update_conn(conn_id, |rec| {
            let queue = rec
                .snd_queues
                .iter_mut()
                .find(|q| &q.snd_id == snd_id)
                .ok_or(StoreError::NotFound)?;
            if status < queue.status {
                return Err(StoreError::Integrity(format!(
                    "snd status regression {:?} -> {:?}",
                    queue.status, status
                )));
            }
            queue.status = status;
            Ok(())
        })
        .await
    }

    pub async fn set_rcv_peer_verify_key(
        &self,
        conn_id: &ConnId,
        rcv_id: &QueueId,
        key: [u8; 32],
    ) -> Result<(), StoreError> {
        self.update_conn(conn_id, |rec| {
            let queue = rec
                .rcv_queues
                .iter_mut()
                .find(|q| &q.rcv_id == rcv_id)
                .ok_or(StoreError::NotFound)?;
            queue.peer_verify_key = Some(key);
            Ok(())
        })
        .await
    }

    pub async fn set_rotation(
        &self,
        conn_id: &ConnId,
        rcv_id: &QueueId,
        action: RotationAction,
    ) -> Result<(), StoreError> {
        self.update_conn(conn_id, |rec| {
            let queue = rec
                .rcv_queues
                .iter_mut()
                .find(|q| &q.rcv_id == rcv_id)
                .ok_or(StoreError::NotFound)?;
            queue.rotation = Some(action);
            queue.rotation_started_ms.get_or_insert(now_ms());
            Ok(())
        })
        .await
    }

    pub async fn clear_rotation(
        &self,
        conn_id: &ConnId,
        rcv_id: &QueueId,
    ) -> Result<(), StoreError> {
        self.update_conn(conn_id, |rec| {
            if let Some(queue) = rec.rcv_queues.iter_mut().find(|q| &q.rcv_id == rcv_id) {
                queue.rotation = None;
                queue.rotation_started_ms = None;
            }
            Ok(())
        })
        .await
    }

    /// Adds a receive queue without rotation linkage (legacy reply queue).
    pub async fn add_rcv_queue(
        &self,
        conn_id: &ConnId,
        queue: RcvQueue,
    ) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        let mut rec: ConnRecord =
            get_decoded(&kv, &conn_key(conn_id))?.ok_or(StoreError::NotFound)?;
        put_encoded(&mut kv, &rcv_idx_key(&queue.server, &queue.rcv_id), conn_id)?;
        rec.rcv_queues.push(queue);
        put_encoded(&mut kv, &conn_key(conn_id), &rec)
    }

    pub async fn add_next_rcv_queue(
        &self,
        conn_id: &ConnId,
        queue: RcvQueue,
    ) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        let mut rec: ConnRecord =
            get_decoded(&kv, &conn_key(conn_id))?.ok_or(StoreError::NotFound)?;
        if rec.rcv_queues.iter().any(|q| !q.current) {
            return Err(StoreError::Duplicate);
        }
        put_encoded(&mut kv, &rcv_idx_key(&queue.server, &queue.rcv_id), conn_id)?;
        if let Some(current) = rec.rcv_queues.iter_mut().find(|q| q.current) {
            current.next_link = Some(queue.rcv_id.clone());
        }
        rec.rcv_queues.push(queue);
        put_encoded(&mut kv, &conn_key(conn_id), &rec)
    }

    pub async fn add_next_snd_queue(
        &self,
        conn_id: &ConnId,
        queue: SndQueue,
    ) -> Result<(), StoreError> {
        self.update_conn(conn_id, |rec| {
            if rec.snd_queues.iter().any(|q| !q.current) {
                return Err(StoreError::Duplicate);
            }
            if let Some(current) = rec.snd_queues.iter_mut().find(|q| q.current) {
                current.next_link = Some(queue.snd_id.clone());
            }
            rec.snd_queues.push(queue);
            Ok(())
        })
        .await
    }

    pub async fn get_next_rcv_queue(&self, conn_id: &ConnId) -> Result<Option<RcvQueue>, StoreError> {
        let rec = self.get_conn(conn_id).await?;
        Ok(rec.next_rcv().cloned())
    }

    /// Promotes the next receive queue to current and removes the old one,
    /// including its inbound routing index entry. Returns the retired queue.
    pub async fn switch_curr_rcv_queue(&self, conn_id: &ConnId) -> Result<RcvQueue, StoreError> {
        let mut kv = self.kv.lock().await;
        let mut rec: ConnRecord =
            get_decoded(&kv, &conn_key(conn_id))?.ok_or(StoreError::NotFound)?;
        let old_pos = rec
            .rcv_queues
            .iter()
            .position(|q| q.current)
            .ok_or(StoreError::NotFound)?;
        if !rec.rcv_queues.iter().any(|q| !q.current) {
            return Err(StoreError::NotFound);
        }
        let old = rec.rcv_queues.remove(old_pos);
        for queue in rec.rcv_queues.iter_mut() {
            queue.current = true;
            queue.rotation = None;
            queue.rotation_started_ms = None;
        }
        kv.delete(&rcv_idx_key(&old.server, &old.rcv_id)).map_err(backend)?;
        put_encoded(&mut kv, &conn_key(conn_id), &rec)?;
        Ok(old)
    }

    pub async fn switch_curr_snd_queue(&self, conn_id: &ConnId) -> Result<SndQueue, StoreError> {
        self.update_conn(conn_id, |rec| {
            let old_pos = rec
                .snd_queues
                .iter()
                .position(|q| q.current)
                .ok_or(StoreError::NotFound)?;
            if !rec.snd_queues.iter().any(|q| !q.current) {
                return Err(StoreError::NotFound);
            }
            let old = rec.snd_queues.remove(old_pos);
            for queue in rec.snd_queues.iter_mut() {
                queue.current = true;
            }
            Ok(old)
        })
        .await
    }

    pub async fn drop_next_snd_queue(&self, conn_id: &ConnId) -> Result<(), StoreError> {
        self.update_conn(conn_id, |rec| {
            rec.snd_queues.retain(|q| q.current);
            for queue in rec.snd_queues.iter_mut() {
                queue.next_link = None;
            }
            Ok(())
        })
        .await
    }

    // -- outbox --

    /// Stages a ratchet-protected agent message: header assembly, hash-chain
    /// update, internal-id assignment, ratchet advance and envelope sealing
    /// all happen under one store guard.
    #[allow(clippy::too_many_arguments)]
    pub async fn stage_agent_msg(
        &self,
        conn_id: &ConnId,
        kind: MsgKind,
        flags: MsgFlags,
        payload: &AgentMsgPayload,
        agent_version: u16,
        queue_dh: &[u8; 32],
        ratchet_pad: usize,
    ) -> Result<StagedSnd, StoreError> {
        let mut kv = self.kv.lock().await;
        let mut meta: ConnMeta =
            get_decoded(&kv, &meta_key(conn_id))?.ok_or(StoreError::NotFound)?;
        let mut stored: StoredRatchet =
            get_decoded(&kv, &ratchet_key(conn_id))?.ok_or(StoreError::NotFound)?;
        let header = PrivHeader {
            snd_msg_id: meta.next_snd_msg_id,
            prev_msg_hash: meta.last_snd_hash,
        };
        let msg = AgentMessage {
            header,
            payload: payload.clone(),
        };
        let body =
            encode_agent_message(&msg).map_err(|e| StoreError::Internal(format!("{e}")))?;
        let hash = sha256(&body);
        let ratcheted = stored
            .state
            .encrypt(ratchet_pad, &body)
            .map_err(|e| StoreError::Internal(format!("ratchet: {e}")))?;
        let enc_agent_message =
            encode_msg(&ratcheted).map_err(|e| StoreError::Internal(format!("{e}")))?;
        let envelope = AgentEnvelope::Msg {
            agent_version,
            enc_agent_message,
        };
        let env_bytes =
            encode_envelope(&envelope).map_err(|e| StoreError::Internal(format!("{e}")))?;
        let sealed = boxes::seal(queue_dh, &env_bytes, box_len(env_bytes.len()))
            .map_err(|e| StoreError::Internal(format!("box: {e}")))?;
        let wire = boxes::encode(&sealed).map_err(|e| StoreError::Internal(format!("{e}")))?;
        let rec = SndMsgRec {
            internal_id: meta.next_internal_id,
            snd_msg_id: meta.next_snd_msg_id,
            ts_ms: now_ms(),
            kind,
            flags,
            body,
            wire,
            hash,
            prev_hash: meta.last_snd_hash,
        };
        put_encoded(&mut kv, &outbox_key(conn_id, rec.internal_id), &rec)?;
        let staged = StagedSnd {
            internal_id: rec.internal_id,
            snd_msg_id: rec.snd_msg_id,
        };
        meta.next_internal_id += 1;
        meta.next_snd_msg_id += 1;
        meta.last_snd_hash = hash;
        put_encoded(&mut kv, &meta_key(conn_id), &meta)?;
        put_encoded(&mut kv, &ratchet_key(conn_id), &stored)?;
        Ok(staged)
    }

    /// Stages a confirmation envelope (conn-info or conn-info-reply). These
    /// precede the hash chain: the chain covers ratcheted agent messages.
    #[allow(clippy::too_many_arguments)]
    pub async fn stage_confirmation_msg(
        &self,
        conn_id: &ConnId,
        kind: MsgKind,
        payload: &ConnInfoPayload,
        e2e: Option<E2eParams>,
        sender_key: Option<[u8; 32]>,
        agent_version: u16,
        queue_dh: &[u8; 32],
        conn_info_pad: usize,
    ) -> Result<StagedSnd, StoreError> {
        let mut kv = self.kv.lock().await;
        let mut meta: ConnMeta =
            get_decoded(&kv, &meta_key(conn_id))?.ok_or(StoreError::NotFound)?;
        let mut stored: StoredRatchet =
            get_decoded(&kv, &ratchet_key(conn_id))?.ok_or(StoreError::NotFound)?;
        let plain =
            encode_conn_info(payload).map_err(|e| StoreError::Internal(format!("{e}")))?;
        let ratcheted = stored
            .state
            .encrypt(conn_info_pad, &plain)
            .map_err(|e| StoreError::Internal(format!("ratchet: {e}")))?;
        let enc_conn_info =
            encode_msg(&ratcheted).map_err(|e| StoreError::Internal(format!("{e}")))?;
        let envelope = AgentEnvelope::Confirmation {
            agent_version,
            e2e,
            sender_key,
            enc_conn_info,
        };
        let env_bytes =
            encode_envelope(&envelope).map_err(|e| StoreError::Internal(format!("{e}")))?;
        let sealed = boxes::seal(queue_dh, &env_bytes, box_len(env_bytes.len()))
            .map_err(|e| StoreError::Internal(format!("box: {e}")))?;
        let wire = boxes::encode(&sealed).map_err(|e| StoreError::Internal(format!("{e}")))?;
        let rec = SndMsgRec {
            internal_id: meta.next_internal_id,
            snd_msg_id: 0,
            ts_ms: now_ms(),
            kind,
            flags: MsgFlags::default(),
            body: env_bytes,
            wire,
            hash: [0; 32],
            prev_hash: [0; 32],
        };
        put_encoded(&mut kv, &outbox_key(conn_id, rec.internal_id), &rec)?;
        let staged = StagedSnd {
            internal_id: rec.internal_id,
            snd_msg_id: 0,
        };
        meta.next_internal_id += 1;
        put_encoded(&mut kv, &meta_key(conn_id), &meta)?;
        put_encoded(&mut kv, &ratchet_key(conn_id), &stored)?;
        Ok(staged)
    }

    pub async fn pending_snd_ids(&self, conn_id: &ConnId) -> Result<Vec<u64>, StoreError> {
        let kv = self.kv.lock().await;
        let prefix = format!("outbox:{}:", conn_id.value);
        let mut ids = Vec::new();
        for key in kv.keys_with_prefix(&prefix) {
            if let Some(rec) = get_decoded::<SndMsgRec>(&kv, &key)? {
                ids.push(rec.internal_id);
            }
        }
        Ok(ids)
    }

    pub async fn get_snd_msg(
        &self,
        conn_id: &ConnId,
        internal_id: u64,
    ) -> Result<Option<SndMsgRec>, StoreError> {
        let kv = self.kv.lock().await;
        get_decoded(&kv, &outbox_key(conn_id, internal_id))
    }

    pub async fn delete_snd_msg(
        &self,
        conn_id: &ConnId,
        internal_id: u64,
    ) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        kv.delete(&outbox_key(conn_id, internal_id)).map_err(backend)
    }

    // -- received messages --

    /// Applies one decrypted inbound message: internal-id assignment,
    /// integrity classification against the receive chain, ratchet state and
    /// skipped-key diff, all under one store guard.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_rcv_msg(
        &self,
        conn_id: &ConnId,
        broker_id: &str,
        ext_snd_id: u64,
        received_prev_hash: [u8; 32],
        body_hash: [u8; 32],
        state: &RatchetState,
        diff: &SkippedDiff,
    ) -> Result<RcvApplied, StoreError> {
        let mut kv = self.kv.lock().await;
        let mut meta: ConnMeta =
            get_decoded(&kv, &meta_key(conn_id))?.ok_or(StoreError::NotFound)?;
        let mut stored: StoredRatchet =
            get_decoded(&kv, &ratchet_key(conn_id))?.ok_or(StoreError::NotFound)?;
        stored.state = state.clone();
        stored
            .skipped
            .retain(|e| !diff.consumed.contains(&(e.header_key, e.msg_n)));
        stored.skipped.extend(diff.added.iter().cloned());
        put_encoded(&mut kv, &ratchet_key(conn_id), &stored)?;

        let expected = meta.last_rcv_ext_id + 1;
        let integrity = if ext_snd_id == expected {
            if received_prev_hash == meta.last_rcv_hash {
                MsgIntegrity::Ok
            } else {
                MsgIntegrity::BadHash
            }
        } else if ext_snd_id > expected {
            MsgIntegrity::Skipped {
                from_id: expected,
                to_id: ext_snd_id - 1,
            }
        } else {
            MsgIntegrity::BadId
        };
        let internal_id = meta.next_internal_id;
        let rec = RcvMsgRec {
            internal_id,
            ext_snd_id,
            broker_id: broker_id.to_string(),
            ts_ms: now_ms(),
            hash: body_hash,
            prev_hash: received_prev_hash,
            user_acked: false,
        };
        put_encoded(&mut kv, &rcvmsg_key(conn_id, internal_id), &rec)?;
        put_encoded(
            &mut kv,
            &brk_key(conn_id, broker_id),
            &BrokerIdx {
                internal_id,
                acked: false,
            },
        )?;
        meta.next_internal_id += 1;
        if !matches!(integrity, MsgIntegrity::BadId | MsgIntegrity::Duplicate) {
            meta.last_rcv_ext_id = ext_snd_id;
            meta.last_rcv_hash = body_hash;
        }
        put_encoded(&mut kv, &meta_key(conn_id), &meta)?;
        Ok(RcvApplied {
            internal_id,
            integrity,
        })
    }

    pub async fn find_broker_msg(
        &self,
        conn_id: &ConnId,
        broker_id: &str,
    ) -> Result<Option<BrokerIdx>, StoreError> {
        let kv = self.kv.lock().await;
        get_decoded(&kv, &brk_key(conn_id, broker_id))
    }

    /// Marks a received message user-acked. Returns the broker id on the
    /// first ack, `None` on repeats or when the record is already gone.
    pub async fn mark_user_acked(
        &self,
        conn_id: &ConnId,
        internal_id: u64,
    ) -> Result<Option<String>, StoreError> {
        let mut kv = self.kv.lock().await;
        let rec: Option<RcvMsgRec> = get_decoded(&kv, &rcvmsg_key(conn_id, internal_id))?;
        let Some(mut rec) = rec else {
            return Ok(None);
        };
        if rec.user_acked {
            return Ok(None);
        }
        rec.user_acked = true;
        put_encoded(&mut kv, &rcvmsg_key(conn_id, internal_id), &rec)?;
        let idx: Option<BrokerIdx> = get_decoded(&kv, &brk_key(conn_id, &rec.broker_id))?;
        if let Some(mut idx) = idx {
            idx.acked = true;
            put_encoded(&mut kv, &brk_key(conn_id, &rec.broker_id), &idx)?;
        }
        Ok(Some(rec.broker_id))
    }

    pub async fn delete_rcv_msg(
        &self,
        conn_id: &ConnId,
        internal_id: u64,
    ) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        kv.delete(&rcvmsg_key(conn_id, internal_id)).map_err(backend)
    }

    // -- ratchets --

    pub async fn init_ratchet(
        &self,
        conn_id: &ConnId,
        state: RatchetState,
    ) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        put_encoded(
            &mut kv,
            &ratchet_key(conn_id),
            &StoredRatchet {
                state,
                skipped: Vec::new(),
            },
        )
    }

    /// Replaces the ratchet state and applies a skipped-keys diff in one
    /// write, for decrypts outside the received-message transaction.
    pub async fn store_ratchet(
        &self,
        conn_id: &ConnId,
        state: &RatchetState,
        diff: &SkippedDiff,
    ) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        let mut stored: StoredRatchet =
            get_decoded(&kv, &ratchet_key(conn_id))?.ok_or(StoreError::NotFound)?;
        stored.state = state.clone();
        stored
            .skipped
            .retain(|e| !diff.consumed.contains(&(e.header_key, e.msg_n)));
        stored.skipped.extend(diff.added.iter().cloned());
        put_encoded(&mut kv, &ratchet_key(conn_id), &stored)
    }

    pub async fn load_ratchet(
        &self,
        conn_id: &ConnId,
    ) -> Result<(RatchetState, SkippedKeys), StoreError> {
        let kv = self.kv.lock().await;
        let stored: StoredRatchet =
            get_decoded(&kv, &ratchet_key(conn_id))?.ok_or(StoreError::NotFound)?;
        Ok((stored.state, SkippedKeys::from_entries(stored.skipped)))
    }

    // -- confirmations --

    pub async fn stage_confirmation(
        &self,
        mut staged: StagedConfirmation,
    ) -> Result<String, StoreError> {
        let mut kv = self.kv.lock().await;
        let conf_id = Uuid::new_v4().to_string();
        staged.conf_id = conf_id.clone();
        put_encoded(&mut kv, &conf_key(&conf_id), &staged)?;
        Ok(conf_id)
    }

    pub async fn get_confirmation(
        &self,
        conf_id: &str,
    ) -> Result<StagedConfirmation, StoreError> {
        let kv = self.kv.lock().await;
        get_decoded(&kv, &conf_key(conf_id))?.ok_or(StoreError::NotFound)
    }

    pub async fn delete_confirmation(&self, conf_id: &str) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        kv.delete(&conf_key(conf_id)).map_err(backend)
    }

    // -- invitations --

    pub async fn stage_invitation(
        &self,
        mut staged: StagedInvitation,
    ) -> Result<String, StoreError> {
        let mut kv = self.kv.lock().await;
        let inv_id = Uuid::new_v4().to_string();
        staged.inv_id = inv_id.clone();
        put_encoded(&mut kv, &inv_key(&inv_id), &staged)?;
        Ok(inv_id)
    }

    pub async fn get_invitation(&self, inv_id: &str) -> Result<StagedInvitation, StoreError> {
        let kv = self.kv.lock().await;
        get_decoded(&kv, &inv_key(inv_id))?.ok_or(StoreError::NotFound)
    }

    pub async fn mark_invitation_accepted(&self, inv_id: &str) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        let mut staged: StagedInvitation =
            get_decoded(&kv, &inv_key(inv_id))?.ok_or(StoreError::NotFound)?;
        if staged.accepted {
            return Err(StoreError::Duplicate);
        }
        staged.accepted = true;
        put_encoded(&mut kv, &inv_key(inv_id), &staged)
    }

    pub async fn delete_invitation(&self, inv_id: &str) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        kv.delete(&inv_key(inv_id)).map_err(backend)
    }

    // -- notification token --

    pub async fn load_ntf_token(&self) -> Result<Option<NtfTokenRec>, StoreError> {
        let kv = self.kv.lock().await;
        get_decoded(&kv, NTF_TOKEN_KEY)
    }

    pub async fn store_ntf_token(&self, rec: &NtfTokenRec) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        put_encoded(&mut kv, NTF_TOKEN_KEY, rec)
    }

    pub async fn delete_ntf_token(&self) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        kv.delete(NTF_TOKEN_KEY).map_err(backend)
    }
}
