//! Out-of-band notifications about the session lease.

use tokio::sync::broadcast;
use tracing::trace;

use crate::backend::LeaseId;
use crate::error::BackendError;
use crate::lease::Lease;

/// Buffered events per subscriber before the slowest one starts lagging.
pub(crate) const EVENT_CAPACITY: usize = 64;

/// Events published by the [`CoordinationClient`](crate::CoordinationClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationEvent {
    /// The keepalive gave up on the session lease. Locks and campaign
    /// entries bound to it are gone.
    LeaseLost { lease_id: LeaseId, cause: BackendError },
    /// A replacement lease was granted after a loss. Sent once per
    /// successful reconnection, carrying the error that triggered it.
    LeaseReconnect { lease: Lease, cause: BackendError },
}

#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: broadcast::Sender<CoordinationEvent>,
}

impl EventSender {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers; having none is fine.
    pub(crate) fn emit(&self, event: CoordinationEvent) {
        if self.tx.send(event).is_err() {
            trace!("no subscribers for coordination event");
        }
    }
}
