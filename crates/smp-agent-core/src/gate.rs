use smp_agent_api::error::{AgentError, CmdErrorKind};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpClass {
    RcvNetwork,
    SndNetwork,
    MsgDelivery,
    NtfNetwork,
}

const CLASS_COUNT: usize = 4;

impl OpClass {
    fn index(self) -> usize {
        match self {
            OpClass::RcvNetwork => 0,
            OpClass::SndNetwork => 1,
            OpClass::MsgDelivery => 2,
            OpClass::NtfNetwork => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentPhase {
    Active,
    Suspending,
    Suspended,
}

struct GateInner {
    phase: AgentPhase,
    leases: [usize; CLASS_COUNT],
    op_suspended: [bool; CLASS_COUNT],
    db_writable: bool,
}

/// Counted-lease gate over the four operation classes. In-flight work holds
/// an `OpLease`; a class is quiescent when its lease count reaches zero.
#[derive(Clone)]
pub struct OperationGate {
    inner: Arc<Mutex<GateInner>>,
    changed: Arc<Notify>,
}

impl OperationGate {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(GateInner {
                phase: AgentPhase::Active,
                leases: [0; CLASS_COUNT],
                op_suspended: [false; CLASS_COUNT],
                db_writable: true,
            })),
            changed: Arc::new(Notify::new()),
        }
    }

    pub fn phase(&self) -> AgentPhase {
        self.inner.lock().expect("gate lock").phase
    }

    pub fn db_writable(&self) -> bool {
        self.inner.lock().expect("gate lock").db_writable
    }

    /// Commands issued while fully suspended fail fast.
    pub fn check_command(&self) -> Result<(), AgentError> {
        match self.phase() {
            AgentPhase::Suspended => Err(AgentError::Cmd(CmdErrorKind::Prohibited)),
            _ => Ok(()),
        }
    }

    /// Takes a lease on `class`; refused once the class is suspended so that
    /// no new network work starts while draining.
    pub fn begin_op(&self, class: OpClass) -> Option<OpLease> {
        let mut inner = self.inner.lock().expect("gate lock");
        if inner.phase != AgentPhase::Active || inner.op_suspended[class.index()] {
            return None;
        }
        inner.leases[class.index()] += 1;
        Some(OpLease {
            gate: self.clone(),
            class,
        })
    }

    pub fn lease_count(&self, class: OpClass) -> usize {
        self.inner.lock().expect("gate lock").leases[class.index()]
    }

    /// Transition to `Suspending`, await SndNetwork and MsgDelivery
    /// quiescence up to `max_delay`, then force `Suspended`.
    pub async fn suspend(&self, max_delay: Duration) {
        {
            let mut inner = self.inner.lock().expect("gate lock");
            inner.phase = AgentPhase::Suspending;
            inner.op_suspended[OpClass::SndNetwork.index()] = true;
            inner.op_suspended[OpClass::MsgDelivery.index()] = true;
        }
        self.changed.notify_waiters();
        let deadline = Instant::now() + max_delay;
        loop {
            let notified = self.changed.notified();
            let drained = {
                let inner = self.inner.lock().expect("gate lock");
                inner.leases[OpClass::SndNetwork.index()] == 0
                    && inner.leases[OpClass::MsgDelivery.index()] == 0
            };
            if drained {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        {
            let mut inner = self.inner.lock().expect("gate lock");
            inner.phase = AgentPhase::Suspended;
            inner.op_suspended = [true; CLASS_COUNT];
            inner.db_writable = false;
        }
        self.changed.notify_waiters();
    }

    /// Clears suspension per class in reverse order so upstream classes
    /// resume after their sinks are ready.
    pub fn activate(&self) {
        let mut inner = self.inner.lock().expect("gate lock");
        for class in [
            OpClass::NtfNetwork,
            OpClass::MsgDelivery,
            OpClass::SndNetwork,
            OpClass::RcvNetwork,
        ] {
            inner.op_suspended[class.index()] = false;
        }
        inner.phase = AgentPhase::Active;
        inner.db_writable = true;
        drop(inner);
        self.changed.notify_waiters();
    }

    /// Parks a worker until its class may run again.
    pub async fn wait_resumed(&self, class: OpClass) {
        loop {
            let notified = self.changed.notified();
            {
                let inner = self.inner.lock().expect("gate lock");
                if inner.phase == AgentPhase::Active && !inner.op_suspended[class.index()] {
                    return;
                }
            }
            notified.await;
        }
    }

    fn release(&self, class: OpClass) {
        let mut inner = self.inner.lock().expect("gate lock");
        inner.leases[class.index()] = inner.leases[class.index()].saturating_sub(1);
        drop(inner);
        self.changed.notify_waiters();
    }
}

impl Default for OperationGate {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OpLease {
    gate: OperationGate,
    class: OpClass,
}

impl Drop for OpLease {
    fn drop(&mut self) {
        self.gate.release(self.class);
    }
}
