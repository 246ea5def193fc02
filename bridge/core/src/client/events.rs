//! Client Event Hub
//!
//! Status and event fan-out owned by exactly one client instance. Observers
//! register by subscribing and unregister by dropping their receiver, so any
//! number of them can coexist.

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::messages::{BootstrapFailure, ClientEvent, LastUpdateSnapshot};
use crate::status::ConnectionStatus;

/// Default capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 256;

/// Status value plus event broadcast for one client
#[derive(Debug)]
pub struct EventHub {
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ClientEvent>,
    failure: Mutex<Option<BootstrapFailure>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(ConnectionStatus::NOT_CONNECTED)
    }
}

impl EventHub {
    /// Create a hub starting at `initial`
    pub fn new(initial: ConnectionStatus) -> Self {
        let (status, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            status,
            events,
            failure: Mutex::new(None),
        }
    }

    /// Current status
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Watch the status value
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Set the status, emitting change and connect/disconnect edges
    pub fn set_status(&self, new: ConnectionStatus) {
        let old = self.status.send_replace(new);
        if old == new {
            return;
        }

        tracing::debug!(from = %old, to = %new, "Status changed");
        self.emit(ClientEvent::StatusChanged(new));

        if !old.is_ready() && new.is_ready() {
            self.emit(ClientEvent::Connected);
        } else if old.is_ready() && !new.is_ready() {
            self.emit(ClientEvent::Disconnected);
        }
    }

    /// Move the status forward only; lower codes are ignored
    ///
    /// Returns whether the status changed.
    pub fn advance_status(&self, new: ConnectionStatus) -> bool {
        if new <= self.status() {
            return false;
        }
        self.set_status(new);
        true
    }

    /// Publish a snapshot
    pub fn publish_snapshot(&self, snapshot: LastUpdateSnapshot) {
        self.emit(ClientEvent::Snapshot(snapshot));
    }

    /// Record a terminal bootstrap failure
    pub fn fail(&self, failure: BootstrapFailure) {
        tracing::warn!(phase = %failure.phase, reason = %failure.reason, "Bootstrap failed");
        *self.failure.lock() = Some(failure.clone());
        self.emit(ClientEvent::BootstrapFailed(failure));
    }

    /// Terminal bootstrap failure, if any
    pub fn failure(&self) -> Option<BootstrapFailure> {
        self.failure.lock().clone()
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_connect_disconnect_edges() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();

        hub.set_status(ConnectionStatus::SOCKET_CONNECTING);
        hub.set_status(ConnectionStatus::READY);
        hub.set_status(ConnectionStatus::READY);
        hub.set_status(ConnectionStatus::NOT_CONNECTED);

        assert_eq!(
            drain(&mut rx),
            vec![
                ClientEvent::StatusChanged(ConnectionStatus::SOCKET_CONNECTING),
                ClientEvent::StatusChanged(ConnectionStatus::READY),
                ClientEvent::Connected,
                ClientEvent::StatusChanged(ConnectionStatus::NOT_CONNECTED),
                ClientEvent::Disconnected,
            ]
        );
    }

    #[test]
    fn test_multiple_subscribers_coexist() {
        let hub = EventHub::default();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        hub.publish_snapshot(LastUpdateSnapshot::default());

        assert_eq!(drain(&mut first).len(), 1);
        assert_eq!(drain(&mut second).len(), 1);
    }

    #[test]
    fn test_advance_status_is_monotonic() {
        let hub = EventHub::new(ConnectionStatus::COLD);
        assert!(hub.advance_status(ConnectionStatus::RUNTIME_LOADING));
        assert!(!hub.advance_status(ConnectionStatus::COLD));
        assert_eq!(hub.status(), ConnectionStatus::RUNTIME_LOADING);
    }

    #[test]
    fn test_failure_recorded() {
        let hub = EventHub::new(ConnectionStatus::RUNTIME_LOADING);
        let mut rx = hub.subscribe();
        let failure = BootstrapFailure {
            phase: ConnectionStatus::RUNTIME_LOADING,
            reason: "unreachable".into(),
        };
        hub.fail(failure.clone());

        assert_eq!(hub.failure(), Some(failure.clone()));
        assert_eq!(drain(&mut rx), vec![ClientEvent::BootstrapFailed(failure)]);
        assert_eq!(hub.status(), ConnectionStatus::RUNTIME_LOADING);
    }
}
