//! Engine Server
//!
//! TCP front of a computation engine. Every accepted connection must open
//! with `hello`; after the `welcome` answer its requests are forwarded to the
//! engine client, each awaited on its own task so replies can overtake one
//! another. Snapshots published by the engine go to every connection.
//!
//! ```text
//!                  EngineServer
//!                       │
//!        ┌──────────────┼──────────────┐
//!     editor A       editor B       editor C
//!     (conn_…)       (conn_…)       (conn_…)
//!        └──────────────┼──────────────┘
//!                       │
//!          CapabilityClient (embedded worker)
//! ```

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::Instrument;

use crate::client::CapabilityClient;
use crate::error::{CallError, TransportError};
use crate::marshal::ReturnValue;
use crate::messages::ClientEvent;
use crate::transport::frame::{write_frame, FrameReader};
use crate::transport::socket::protocol::{ClientFrame, ReplyOutcome, ServerFrame, PROTOCOL_VERSION};

/// Unique id of one accepted connection
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Random 128-bit id
    #[must_use]
    pub fn new() -> Self {
        use rand::Rng;
        let bytes: [u8; 16] = rand::thread_rng().gen();
        Self(format!("conn_{}", hex::encode(bytes)))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server behaviour switches
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Accept run_code requests
    pub allows_run_code: bool,
    /// Connections beyond this are closed immediately
    pub max_connections: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            allows_run_code: true,
            max_connections: 64,
        }
    }
}

struct ConnectionState {
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<ServerFrame>,
}

/// Listening engine server
pub struct EngineServer {
    listener: TcpListener,
    engine: Arc<dyn CapabilityClient>,
    options: ServerOptions,
    connections: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl fmt::Debug for EngineServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("options", &self.options)
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl EngineServer {
    /// Bind the listening socket
    pub async fn bind(
        address: &str,
        engine: Arc<dyn CapabilityClient>,
        options: ServerOptions,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("bind {address}: {e}")))?;
        tracing::info!(address = %listener.local_addr()?, "Engine server listening");
        Ok(Self {
            listener,
            engine,
            options,
            connections: Arc::new(DashMap::new()),
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()>,
    {
        let broadcaster = tokio::spawn(broadcast_snapshots(
            self.engine.subscribe(),
            Arc::clone(&self.connections),
        ));
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            if self.connection_count() >= self.options.max_connections {
                tracing::warn!(peer = %peer, "Connection limit reached, rejecting");
                drop(stream);
                continue;
            }

            let conn_id = ConnectionId::new();
            tracing::info!(
                conn_id = %conn_id,
                peer = %peer,
                active_connections = self.connection_count() + 1,
                "Connection accepted"
            );

            tokio::spawn(
                handle_connection(
                    conn_id.clone(),
                    stream,
                    peer,
                    Arc::clone(&self.engine),
                    self.options.clone(),
                    Arc::clone(&self.connections),
                )
                .instrument(tracing::info_span!("connection", %conn_id)),
            );
        }

        broadcaster.abort();
        tracing::info!(connections = self.connection_count(), "Engine server stopped");
        self.connections.clear();
        Ok(())
    }
}

async fn broadcast_snapshots(
    mut events: broadcast::Receiver<ClientEvent>,
    connections: Arc<DashMap<ConnectionId, ConnectionState>>,
) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::Snapshot(snapshot)) => {
                for entry in connections.iter() {
                    let _ = entry.outbound.send(ServerFrame::Snapshot { snapshot });
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Snapshot broadcaster lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn handle_connection(
    conn_id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<dyn CapabilityClient>,
    options: ServerOptions,
    connections: Arc<DashMap<ConnectionId, ConnectionState>>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    match reader.next::<ClientFrame>().await {
        Ok(Some(ClientFrame::Hello {
            protocol_version,
            client,
        })) if protocol_version == PROTOCOL_VERSION => {
            tracing::debug!(client = %client, "Hello received");
        }
        Ok(Some(ClientFrame::Hello {
            protocol_version, ..
        })) => {
            tracing::warn!(protocol_version, "Unsupported protocol version");
            return;
        }
        Ok(other) => {
            tracing::warn!(frame = ?other, "Expected hello");
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Handshake read failed");
            return;
        }
    }

    let welcome = ServerFrame::Welcome {
        protocol_version: PROTOCOL_VERSION,
        allows_run_code: options.allows_run_code,
    };
    if let Err(e) = write_frame(&mut write_half, &welcome).await {
        tracing::warn!(error = %e, "Handshake write failed");
        return;
    }

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &frame).await {
                tracing::warn!(error = %e, "Write error");
                break;
            }
        }
    });

    connections.insert(
        conn_id.clone(),
        ConnectionState {
            peer,
            connected_at: Utc::now(),
            outbound: outbound.clone(),
        },
    );

    loop {
        let frame = match reader.next::<ClientFrame>().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Read error");
                break;
            }
        };

        match frame {
            ClientFrame::Invoke { id, call } => {
                let engine = Arc::clone(&engine);
                let outbound = outbound.clone();
                tokio::spawn(
                    async move {
                        let outcome = match engine.invoke(call).await {
                            Ok(result) => ReplyOutcome::Return(ReturnValue::from(result)),
                            Err(err) => ReplyOutcome::Error(err),
                        };
                        let _ = outbound.send(ServerFrame::Reply { id, outcome });
                    }
                    .in_current_span(),
                );
            }
            ClientFrame::RunCode { id, code } => {
                if !options.allows_run_code {
                    let outcome = ReplyOutcome::Error(CallError::Unsupported("run_code".into()));
                    let _ = outbound.send(ServerFrame::Reply { id, outcome });
                    continue;
                }
                let engine = Arc::clone(&engine);
                let outbound = outbound.clone();
                tokio::spawn(
                    async move {
                        let outcome = match engine.run_code(&code).await {
                            Ok(text) => ReplyOutcome::Result(text),
                            Err(err) => ReplyOutcome::Error(err),
                        };
                        let _ = outbound.send(ServerFrame::Reply { id, outcome });
                    }
                    .in_current_span(),
                );
            }
            ClientFrame::RequestSnapshot => {
                if let Err(e) = engine.request_snapshot().await {
                    tracing::debug!(error = %e, "Snapshot request failed");
                }
            }
            ClientFrame::Hello { .. } => tracing::warn!("Repeated hello ignored"),
        }
    }

    if let Some((_, state)) = connections.remove(&conn_id) {
        let duration = Utc::now() - state.connected_at;
        tracing::info!(
            peer = %state.peer,
            duration_ms = duration.num_milliseconds(),
            "Connection closed"
        );
    }
    drop(outbound);
    // Writer drains what in-flight calls still send, then stops
    let _ = writer.await;
}
