use crate::gate::{OpClass, OperationGate};
use crate::store::Store;
use async_trait::async_trait;
use smp_agent_api::error::AgentError;
use smp_agent_api::types::{ConnId, DeviceToken, NtfMode, NtfTknStatus, ServerRef};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Notification-server surface, injected at agent init.
#[async_trait]
pub trait NtfTransport: Send + Sync {
    async fn register(
        &self,
        server: &ServerRef,
        token: &DeviceToken,
    ) -> Result<String, AgentError>;

    async fn verify(
        &self,
        server: &ServerRef,
        tkn_id: &str,
        code: &str,
    ) -> Result<(), AgentError>;

    async fn check(&self, server: &ServerRef, tkn_id: &str) -> Result<NtfTknStatus, AgentError>;

    async fn replace(
        &self,
        server: &ServerRef,
        tkn_id: &str,
        token: &DeviceToken,
    ) -> Result<(), AgentError>;

    async fn delete(&self, server: &ServerRef, tkn_id: &str) -> Result<(), AgentError>;

    async fn create_subscription(
        &self,
        server: &ServerRef,
        tkn_id: &str,
        conn_id: &ConnId,
    ) -> Result<(), AgentError>;

    async fn delete_subscription(
        &self,
        server: &ServerRef,
        tkn_id: &str,
        conn_id: &ConnId,
    ) -> Result<(), AgentError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NtfSupCommand {
    CreateSub(ConnId),
    DeleteSub(ConnId),
    DeleteToken,
}

/// Mirrors connection lifecycle into notification subscriptions. Owns its
/// command queue; the loop drains it one command at a time.
#[derive(Clone)]
pub struct NtfSupervisor {
    queue: Arc<Mutex<VecDeque<NtfSupCommand>>>,
    notify: Arc<Notify>,
    subs: Arc<Mutex<HashSet<ConnId>>>,
}

impl NtfSupervisor {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            subs: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn enqueue(&self, cmd: NtfSupCommand) {
        self.queue.lock().expect("ntf queue").push_back(cmd);
        self.notify.notify_one();
    }

    /// Drops all pending per-connection work and enqueues `cmd` under the
    /// same lock, so a token delete cancels outstanding subscription commands
    /// atomically.
    pub fn flush_then_enqueue(&self, cmd: NtfSupCommand) {
        let mut queue = self.queue.lock().expect("ntf queue");
        queue.clear();
        queue.push_back(cmd);
        self.notify.notify_one();
    }

    pub fn is_subscribed(&self, conn_id: &ConnId) -> bool {
        self.subs.lock().expect("ntf subs").contains(conn_id)
    }

    fn pop(&self) -> Option<NtfSupCommand> {
        self.queue.lock().expect("ntf queue").pop_front()
    }

    pub(crate) fn spawn(
        &self,
        store: Store,
        transport: Arc<dyn NtfTransport>,
        gate: OperationGate,
    ) {
        let sup = self.clone();
        tokio::spawn(async move {
            loop {
                let notified = sup.notify.notified();
                if let Some(cmd) = sup.pop() {
                    sup.handle(&store, transport.as_ref(), &gate, cmd).await;
                    continue;
                }
                notified.await;
            }
        });
    }

    async fn handle(
        &self,
        store: &Store,
        transport: &dyn NtfTransport,
        gate: &OperationGate,
        cmd: NtfSupCommand,
    ) {
        let token = match store.load_ntf_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!("ntf token load failed: {e}");
                return;
            }
        };
        match cmd {
            NtfSupCommand::CreateSub(conn_id) => {
                let Some(rec) = token else { return };
                if rec.status != NtfTknStatus::Active || rec.mode != NtfMode::Instant {
                    return;
                }
                let Some(tkn_id) = rec.tkn_id.as_deref() else {
                    return;
                };
                if self.is_subscribed(&conn_id) {
                    return;
                }
                let Some(_lease) = gate.begin_op(OpClass::NtfNetwork) else {
                    return;
                };
                match transport
                    .create_subscription(&rec.server, tkn_id, &conn_id)
                    .await
                {
                    Ok(()) => {
                        self.subs.lock().expect("ntf subs").insert(conn_id.clone());
                        debug!("ntf subscription created for {conn_id}");
                    }
                    Err(e) => warn!("ntf create subscription failed for {conn_id}: {e}"),
                }
            }
            NtfSupCommand::DeleteSub(conn_id) => {
                let was_subscribed = self.subs.lock().expect("ntf subs").remove(&conn_id);
                if !was_subscribed {
                    return;
                }
                let Some(rec) = token else { return };
                let Some(tkn_id) = rec.tkn_id.as_deref() else {
                    return;
                };
                let Some(_lease) = gate.begin_op(OpClass::NtfNetwork) else {
                    return;
                };
                if let Err(e) = transport
                    .delete_subscription(&rec.server, tkn_id, &conn_id)
                    .await
                {
                    warn!("ntf delete subscription failed for {conn_id}: {e}");
                }
            }
            NtfSupCommand::DeleteToken => {
                self.subs.lock().expect("ntf subs").clear();
                let Some(rec) = token else { return };
                if let Some(tkn_id) = rec.tkn_id.as_deref() {
                    let lease = gate.begin_op(OpClass::NtfNetwork);
                    if lease.is_some() {
                        if let Err(e) = transport.delete(&rec.server, tkn_id).await {
                            warn!("ntf token delete failed: {e}");
                        }
                    }
                }
                if let Err(e) = store.delete_ntf_token().await {
                    warn!("ntf token record delete failed: {e}");
                }
            }
        }
    }
}

impl Default for NtfSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

pub use self::mem::{InMemoryNtfServer, VERIFY_CODE};

mod mem {
    use super::*;
    use crate::ids::random_id;
    use std::collections::HashMap;

    #[derive(Default)]
    struct NtfState {
        tokens: HashMap<String, (DeviceToken, bool)>,
        subs: HashSet<(String, ConnId)>,
        create_count: usize,
    }

    /// Notification server double; verification code is fixed.
    #[derive(Clone, Default)]
    pub struct InMemoryNtfServer {
        state: Arc<Mutex<NtfState>>,
    }

    pub const VERIFY_CODE: &str = "123456";

    impl InMemoryNtfServer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn subscription_creates(&self) -> usize {
            self.state.lock().expect("ntf state").create_count
        }

        pub fn has_subscription(&self, conn_id: &ConnId) -> bool {
            self.state
                .lock()
                .expect("ntf state")
                .subs
                .iter()
                .any(|(_, c)| c == conn_id)
        }
    }

    #[async_trait]
    impl NtfTransport for InMemoryNtfServer {
        async fn register(
            &self,
            _server: &ServerRef,
            token: &DeviceToken,
        ) -> Result<String, AgentError> {
            let mut state = self.state.lock().expect("ntf state");
            let tkn_id = random_id(8);
            state.tokens.insert(tkn_id.clone(), (token.clone(), false));
            Ok(tkn_id)
        }

        async fn verify(
            &self,
            _server: &ServerRef,
            tkn_id: &str,
            code: &str,
        ) -> Result<(), AgentError> {
            let mut state = self.state.lock().expect("ntf state");
            let entry = state
                .tokens
                .get_mut(tkn_id)
                .ok_or_else(|| AgentError::Ntf("unknown token".to_string()))?;
            if code != VERIFY_CODE {
                return Err(AgentError::Ntf("bad code".to_string()));
            }
            entry.1 = true;
            Ok(())
        }

        async fn check(
            &self,
            _server: &ServerRef,
            tkn_id: &str,
        ) -> Result<NtfTknStatus, AgentError> {
            let state = self.state.lock().expect("ntf state");
            match state.tokens.get(tkn_id) {
                Some((_, true)) => Ok(NtfTknStatus::Active),
                Some((_, false)) => Ok(NtfTknStatus::Registered),
                None => Ok(NtfTknStatus::Expired),
            }
        }

        async fn replace(
            &self,
            _server: &ServerRef,
            tkn_id: &str,
            token: &DeviceToken,
        ) -> Result<(), AgentError> {
            let mut state = self.state.lock().expect("ntf state");
            let entry = state
                .tokens
                .get_mut(tkn_id)
                .ok_or_else(|| AgentError::Ntf("unknown token".to_string()))?;
            *entry = (token.clone(), false);
            Ok(())
        }

        async fn delete(&self, _server: &ServerRef, tkn_id: &str) -> Result<(), AgentError> {
            let mut state = self.state.lock().expect("ntf state");
            state.tokens.remove(tkn_id);
            state.subs.retain(|(t, _)| t != tkn_id);
            Ok(())
        }

        async fn create_subscription(
            &self,
            _server: &ServerRef,
            tkn_id: &str,
            conn_id: &ConnId,
        ) -> Result<(), AgentError> {
            let mut state = self.state.lock().expect("ntf state");
            if !state.tokens.contains_key(tkn_id) {
                return Err(AgentError::Ntf("unknown token".to_string()));
            }
            if state.subs.insert((tkn_id.to_string(), conn_id.clone())) {
                state.create_count += 1;
            }
            Ok(())
        }

        async fn delete_subscription(
            &self,
            _server: &ServerRef,
            tkn_id: &str,
            conn_id: &ConnId,
        ) -> Result<(), AgentError> {
            let mut state = self.state.lock().expect("ntf state");
            state.subs.remove(&(tkn_id.to_string(), conn_id.clone()));
            Ok(())
        }
    }
}
