//! Socket Transport Client
//!
//! [`CapabilityClient`] over a persistent TCP connection to an engine
//! process. The connection is split into a read task and a write task; calls
//! register a oneshot under a fresh correlation id and the read task
//! completes it when the matching reply arrives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::capability::{BackendKind, Capabilities, SessionCall};
use crate::client::{CapabilityClient, EventHub};
use crate::error::{CallError, TransportError};
use crate::marshal::Marshalled;
use crate::messages::ClientEvent;
use crate::status::ConnectionStatus;
use crate::transport::config::SocketSettings;
use crate::transport::frame::{write_frame, FrameReader};
use crate::transport::socket::protocol::{
    ClientFrame, ReplyOutcome, RequestId, ServerFrame, PROTOCOL_VERSION,
};

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Result<ReplyOutcome, CallError>>>>>;

/// Live connection state
#[derive(Debug)]
struct Connection {
    epoch: u64,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    pending: PendingMap,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Stop both tasks and fail every outstanding call
    fn close(self) {
        for task in &self.tasks {
            task.abort();
        }
        fail_pending(&self.pending);
    }
}

fn fail_pending(pending: &PendingMap) {
    let drained: Vec<_> = pending.lock().drain().collect();
    if !drained.is_empty() {
        tracing::debug!(count = drained.len(), "Failing in-flight calls");
    }
    for (_, waiter) in drained {
        let _ = waiter.send(Err(CallError::TransportLost));
    }
}

#[derive(Debug)]
struct Shared {
    events: EventHub,
    connection: Mutex<Option<Connection>>,
    capabilities: Mutex<Capabilities>,
    epoch: AtomicU64,
}

impl Shared {
    /// Drop the connection if it is still the one identified by `epoch`
    fn connection_lost(&self, epoch: u64) {
        let lost = {
            let mut guard = self.connection.lock();
            match guard.as_ref() {
                Some(conn) if conn.epoch == epoch => guard.take(),
                _ => None,
            }
        };
        if let Some(conn) = lost {
            tracing::info!("Connection to engine lost");
            fail_pending(&conn.pending);
            self.events.set_status(ConnectionStatus::NOT_CONNECTED);
        }
    }
}

/// Client of a remote engine process
#[derive(Debug)]
pub struct SocketTransportClient {
    id: Uuid,
    settings: Mutex<SocketSettings>,
    shared: Arc<Shared>,
    next_request: AtomicU64,
    disposed: AtomicBool,
    connecting: tokio::sync::Mutex<()>,
}

impl SocketTransportClient {
    /// Create a disconnected client
    pub fn new(settings: SocketSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            settings: Mutex::new(settings),
            shared: Arc::new(Shared {
                events: EventHub::default(),
                connection: Mutex::new(None),
                capabilities: Mutex::new(Capabilities::none()),
                epoch: AtomicU64::new(0),
            }),
            next_request: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a client and connect it
    pub async fn connect_with(settings: SocketSettings) -> Result<Self, TransportError> {
        let client = Self::new(settings);
        client.connect().await?;
        Ok(client)
    }

    /// Current settings
    pub fn settings(&self) -> SocketSettings {
        self.settings.lock().clone()
    }

    /// Replace the settings, tear down the connection and reconnect
    pub async fn apply_settings(&self, settings: SocketSettings) -> Result<(), TransportError> {
        let _guard = self.connecting.lock().await;
        *self.settings.lock() = settings;
        self.disconnect();
        self.connect_serialized().await
    }

    /// Open the connection and perform the handshake
    pub async fn connect(&self) -> Result<(), TransportError> {
        let _guard = self.connecting.lock().await;
        self.connect_serialized().await
    }

    /// Caller holds `connecting`
    async fn connect_serialized(&self) -> Result<(), TransportError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidState("client disposed".into()));
        }
        if self.shared.connection.lock().is_some() {
            return Err(TransportError::InvalidState("Already connected".into()));
        }

        let settings = self.settings();
        let events = &self.shared.events;
        events.set_status(ConnectionStatus::SOCKET_CONNECTING);

        let result = tokio::time::timeout(settings.connect_timeout(), self.open(&settings)).await;
        let result = result.unwrap_or_else(|_| {
            Err(TransportError::ConnectionFailed(format!(
                "timed out after {} ms",
                settings.connect_timeout_ms
            )))
        });

        match result {
            Ok(()) => {
                events.set_status(ConnectionStatus::READY);
                tracing::info!(client = %self.id, address = %settings.address, "Connected to engine");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(client = %self.id, address = %settings.address, error = %err, "Connection failed");
                events.set_status(ConnectionStatus::NOT_CONNECTED);
                Err(err)
            }
        }
    }

    async fn open(&self, settings: &SocketSettings) -> Result<(), TransportError> {
        let stream = TcpStream::connect(&settings.address).await.map_err(|e| {
            TransportError::ConnectionFailed(format!("{}: {e}", settings.address))
        })?;
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();

        write_frame(
            &mut write_half,
            &ClientFrame::Hello {
                protocol_version: PROTOCOL_VERSION,
                client: format!("flowbridge/{}", self.id),
            },
        )
        .await?;
        self.shared.events.set_status(ConnectionStatus::SOCKET_HANDSHAKING);

        let mut reader = FrameReader::new(read_half);
        let allows_run_code = match reader.next::<ServerFrame>().await? {
            Some(ServerFrame::Welcome {
                protocol_version,
                allows_run_code,
            }) if protocol_version == PROTOCOL_VERSION => allows_run_code,
            Some(ServerFrame::Welcome {
                protocol_version, ..
            }) => {
                return Err(TransportError::HandshakeFailed(format!(
                    "unsupported protocol version {protocol_version}"
                )))
            }
            Some(other) => {
                return Err(TransportError::HandshakeFailed(format!(
                    "expected welcome, got {other:?}"
                )))
            }
            None => return Err(TransportError::ConnectionClosed),
        };

        *self.shared.capabilities.lock() = Capabilities {
            allows_run_code,
            ..Capabilities::none()
        };

        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let pending: PendingMap = Arc::default();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let read_task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&self.shared),
            epoch,
        ));
        let write_task = tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            Arc::clone(&self.shared),
            epoch,
        ));

        let replaced = self.shared.connection.lock().replace(Connection {
            epoch,
            outbound,
            pending,
            tasks: vec![read_task, write_task],
        });
        if let Some(stale) = replaced {
            tracing::warn!(client = %self.id, epoch = stale.epoch, "Closing superseded connection");
            stale.close();
        }
        Ok(())
    }

    /// Close the connection, failing in-flight calls
    pub fn disconnect(&self) {
        let conn = self.shared.connection.lock().take();
        if let Some(conn) = conn {
            conn.close();
            tracing::info!(client = %self.id, "Disconnected from engine");
        }
        self.shared.events.set_status(ConnectionStatus::NOT_CONNECTED);
    }

    async fn request(&self, build: impl FnOnce(RequestId) -> ClientFrame) -> Result<ReplyOutcome, CallError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(CallError::Disposed);
        }
        let status = self.shared.events.status();
        if !status.is_ready() {
            return Err(CallError::NotReady(status));
        }

        let id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let pending = {
            let guard = self.shared.connection.lock();
            let conn = guard.as_ref().ok_or(CallError::NotReady(status))?;
            conn.pending.lock().insert(id, tx);
            if conn.outbound.send(build(id)).is_err() {
                conn.pending.lock().remove(&id);
                return Err(CallError::TransportLost);
            }
            Arc::clone(&conn.pending)
        };

        let timeout = self.settings.lock().request_timeout();
        let reply = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    pending.lock().remove(&id);
                    tracing::debug!(id, "Request timed out");
                    return Err(CallError::Timeout(limit.as_millis() as u64));
                }
            },
            None => rx.await,
        };
        reply.map_err(|_| CallError::TransportLost)?
    }
}

async fn read_loop(
    mut reader: FrameReader<OwnedReadHalf>,
    pending: PendingMap,
    shared: Arc<Shared>,
    epoch: u64,
) {
    loop {
        match reader.next::<ServerFrame>().await {
            Ok(Some(ServerFrame::Reply { id, outcome })) => {
                let waiter = pending.lock().remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(outcome));
                    }
                    None => tracing::debug!(id, "Reply for unknown or expired request"),
                }
            }
            Ok(Some(ServerFrame::Snapshot { snapshot })) => shared.events.publish_snapshot(snapshot),
            Ok(Some(ServerFrame::Welcome { .. })) => {
                tracing::warn!("Unexpected welcome after handshake");
            }
            Ok(None) => {
                tracing::debug!("Connection closed by engine");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Read error");
                break;
            }
        }
    }
    shared.connection_lost(epoch);
}

async fn write_loop(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    shared: Arc<Shared>,
    epoch: u64,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            tracing::warn!(error = %e, "Write error");
            shared.connection_lost(epoch);
            return;
        }
    }
}

#[async_trait]
impl CapabilityClient for SocketTransportClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Socket
    }

    fn status(&self) -> ConnectionStatus {
        self.shared.events.status()
    }

    fn capabilities(&self) -> Capabilities {
        *self.shared.capabilities.lock()
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.events.watch()
    }

    async fn invoke(&self, call: SessionCall) -> Result<Marshalled, CallError> {
        match self.request(|id| ClientFrame::Invoke { id, call }).await? {
            ReplyOutcome::Return(value) => Ok(value.into()),
            ReplyOutcome::Error(err) => Err(err),
            ReplyOutcome::Result(_) => Err(CallError::InvalidResult(
                "text result for invoke".into(),
            )),
        }
    }

    async fn run_code(&self, code: &str) -> Result<String, CallError> {
        if !self.capabilities().allows_run_code {
            return Err(CallError::Unsupported("run_code".into()));
        }
        let code = code.to_string();
        match self.request(|id| ClientFrame::RunCode { id, code }).await? {
            ReplyOutcome::Result(text) => Ok(text),
            ReplyOutcome::Error(err) => Err(err),
            ReplyOutcome::Return(_) => Err(CallError::InvalidResult(
                "return value for run_code".into(),
            )),
        }
    }

    async fn request_snapshot(&self) -> Result<(), CallError> {
        let status = self.status();
        if !status.is_ready() {
            return Err(CallError::NotReady(status));
        }
        let guard = self.shared.connection.lock();
        let conn = guard.as_ref().ok_or(CallError::NotReady(status))?;
        conn.outbound
            .send(ClientFrame::RequestSnapshot)
            .map_err(|_| CallError::TransportLost)
    }

    async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect();
    }
}

impl Drop for SocketTransportClient {
    fn drop(&mut self) {
        if let Some(conn) = self.shared.connection.lock().take() {
            conn.close();
        }
    }
}
