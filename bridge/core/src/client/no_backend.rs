//! No-Backend Client
//!
//! Placeholder used before the user selects a backend. Reports not-connected
//! and rejects every call immediately.

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::capability::{BackendKind, Capabilities, SessionCall};
use crate::client::events::EventHub;
use crate::client::traits::CapabilityClient;
use crate::error::CallError;
use crate::marshal::Marshalled;
use crate::messages::ClientEvent;
use crate::status::ConnectionStatus;

/// Client that has no backend behind it
#[derive(Debug, Default)]
pub struct NoBackendClient {
    events: EventHub,
}

impl NoBackendClient {
    /// Create the placeholder client
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CapabilityClient for NoBackendClient {
    fn kind(&self) -> BackendKind {
        BackendKind::None
    }

    fn status(&self) -> ConnectionStatus {
        self.events.status()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.events.watch()
    }

    async fn invoke(&self, _call: SessionCall) -> Result<Marshalled, CallError> {
        Err(CallError::NoBackend)
    }

    async fn run_code(&self, _code: &str) -> Result<String, CallError> {
        Err(CallError::NoBackend)
    }

    async fn request_snapshot(&self) -> Result<(), CallError> {
        Err(CallError::NoBackend)
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::NodeId;

    #[tokio::test]
    async fn test_rejects_everything() {
        let client = NoBackendClient::new();

        assert_eq!(client.status(), ConnectionStatus::NOT_CONNECTED);
        assert_eq!(client.kind(), BackendKind::None);
        assert!(!client.capabilities().allows_run_code);

        assert_eq!(client.remove_node(NodeId(1)).await, Err(CallError::NoBackend));
        assert_eq!(client.run_code("1").await, Err(CallError::NoBackend));
        assert_eq!(client.request_snapshot().await, Err(CallError::NoBackend));
        assert!(matches!(
            client.stage_files(Default::default()).await,
            Err(CallError::Unsupported(_))
        ));
    }
}
