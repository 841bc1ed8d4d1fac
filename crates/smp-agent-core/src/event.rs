use smp_agent_api::types::{AgentEvent, ConnId, ConnNotice};
use tokio::sync::broadcast;

pub type EventReceiver = broadcast::Receiver<ConnNotice>;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConnNotice>,
}

impl EventBus {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size);
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, conn_id: ConnId, event: AgentEvent) {
        let _ = self.tx.send(ConnNotice {
            corr_id: None,
            conn_id,
            event,
        });
    }
}
