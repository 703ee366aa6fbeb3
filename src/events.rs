//! # Lifecycle Event Bus
//!
//! Fan-out of connection lifecycle events to any number of observers.
//! Emission never blocks: observers subscribe to a broadcast channel and
//! slow ones lose oldest events rather than stalling the connection.

use tokio::sync::broadcast;
use tracing::debug;

use crate::connection::ConnectionState;

/// Buffered events per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 64;

/// Everything a connection reports about its own lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        old: ConnectionState,
        new: ConnectionState,
    },
    HealthCheckSuccess,
    HealthCheckFailure {
        cause: String,
    },
    ReconnectionAttempt {
        attempt: u32,
    },
    ReconnectionSuccess,
    ReconnectionFailure {
        cause: String,
    },
    ReconnectionExhausted,
}

/// Clonable fan-out handle.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        EventBus { tx }
    }

    /// Register an observer. Events emitted before subscription are not
    /// replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    /// Emit to all current observers. A send with no observers is fine.
    pub fn emit(&self, event: ConnectionEvent) {
        debug!(?event, "connection event");
        let _ = self.tx.send(event);
    }
}
