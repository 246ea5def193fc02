//! Transport Factory
//!
//! Builds the capability client selected by a [`BackendSettings`] value.

use std::sync::Arc;

use super::config::BackendSettings;
use super::embedded::EmbeddedTransportClient;
use super::socket::SocketTransportClient;
use crate::client::{CapabilityClient, NoBackendClient};
use crate::error::TransportError;

/// Create a capability client for the given settings
///
/// A socket client is returned even when its first connection attempt fails;
/// it then reports [`crate::status::ConnectionStatus::NOT_CONNECTED`] and can
/// be reconnected by applying settings again. An embedded client is returned
/// while its bootstrap is still running.
///
/// # Errors
///
/// Returns an error only if the embedded worker thread cannot be spawned.
pub async fn create_client(
    settings: &BackendSettings,
) -> Result<Arc<dyn CapabilityClient>, TransportError> {
    match settings {
        BackendSettings::None => Ok(Arc::new(NoBackendClient::new())),

        BackendSettings::Socket(socket) => {
            let client = SocketTransportClient::new(socket.clone());
            if let Err(e) = client.connect().await {
                tracing::warn!(address = %socket.address, error = %e, "Engine unreachable, client left disconnected");
            }
            Ok(Arc::new(client))
        }

        BackendSettings::Embedded(embedded) => {
            Ok(Arc::new(EmbeddedTransportClient::start(embedded)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::BackendKind;
    use crate::status::ConnectionStatus;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_create_no_backend() {
        let client = create_client(&BackendSettings::None).await.unwrap();
        assert_eq!(client.kind(), BackendKind::None);
        assert_eq!(client.status(), ConnectionStatus::NOT_CONNECTED);
    }

    #[tokio::test]
    async fn test_unreachable_socket_still_yields_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = create_client(&BackendSettings::socket(address)).await.unwrap();
        assert_eq!(client.kind(), BackendKind::Socket);
        assert_eq!(client.status(), ConnectionStatus::NOT_CONNECTED);
    }

    #[tokio::test]
    async fn test_create_embedded() {
        let client = create_client(&BackendSettings::embedded()).await.unwrap();
        assert_eq!(client.kind(), BackendKind::Embedded);
        assert!(client.capabilities().allows_run_code);
        client.shutdown().await;
    }
}
