//! Backend Manager
//!
//! Owns the capability client the editor talks to and replaces it when the
//! backend settings change. A switch is a hard boundary:
//!
//! 1. the generation counter moves forward and published status and snapshot
//!    are reset in one step, so anything still in flight from the old client
//!    is recognisably stale and can no longer write
//! 2. the old client's event forwarder is aborted
//! 3. the old client is shut down
//! 4. only then is the new client installed and its events forwarded
//!
//! Observers subscribe to the manager rather than to individual clients, so
//! their subscriptions survive switches.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::client::{CapabilityClient, NoBackendClient};
use crate::error::TransportError;
use crate::messages::{ClientEvent, LastUpdateSnapshot};
use crate::status::ConnectionStatus;
use crate::transport::{create_client, BackendSettings};

const EVENT_CAPACITY: usize = 256;

/// Client event tagged with the generation of the client that produced it
#[derive(Clone, Debug, PartialEq)]
pub struct ManagerEvent {
    /// Generation of the emitting client
    pub generation: u64,
    /// The event itself
    pub event: ClientEvent,
}

/// Generation and snapshot guarded together, so a stale-generation check and
/// the write it allows cannot straddle a switch
#[derive(Debug, Default)]
struct PublishedState {
    generation: u64,
    snapshot: Option<LastUpdateSnapshot>,
}

/// State published to observers, shared with the forwarder task
#[derive(Debug)]
struct Published {
    state: Mutex<PublishedState>,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ManagerEvent>,
}

impl Published {
    fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    fn emit(&self, generation: u64, event: ClientEvent) {
        let _ = self.events.send(ManagerEvent { generation, event });
    }

    /// Publish a status, emitting change and connect/disconnect edges
    fn set_status(&self, generation: u64, new: ConnectionStatus) {
        let state = self.state.lock();
        if state.generation == generation {
            self.publish_status(generation, new);
        }
    }

    /// Caller holds the state lock for `generation`
    fn publish_status(&self, generation: u64, new: ConnectionStatus) {
        let old = self.status.send_replace(new);
        if old == new {
            return;
        }
        self.emit(generation, ClientEvent::StatusChanged(new));
        if !old.is_ready() && new.is_ready() {
            self.emit(generation, ClientEvent::Connected);
        } else if old.is_ready() && !new.is_ready() {
            self.emit(generation, ClientEvent::Disconnected);
        }
    }

    /// Forward a non-status event
    fn forward(&self, generation: u64, event: ClientEvent) {
        let mut state = self.state.lock();
        if state.generation != generation {
            tracing::trace!(generation, "Dropping event from replaced backend");
            return;
        }
        match event {
            // Status travels through the watch channel
            ClientEvent::StatusChanged(_) | ClientEvent::Connected | ClientEvent::Disconnected => {}
            ClientEvent::Snapshot(snapshot) => {
                state.snapshot = Some(snapshot);
                self.emit(generation, ClientEvent::Snapshot(snapshot));
            }
            other @ ClientEvent::BootstrapFailed(_) => self.emit(generation, other),
        }
    }

    /// Move to the next generation and clear what the old one published
    fn advance(&self) -> u64 {
        let mut state = self.state.lock();
        state.generation += 1;
        state.snapshot = None;
        let generation = state.generation;
        self.publish_status(generation, ConnectionStatus::NOT_CONNECTED);
        generation
    }
}

/// Owner of the active capability client
pub struct BackendManager {
    active: RwLock<Arc<dyn CapabilityClient>>,
    published: Arc<Published>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    switching: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for BackendManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendManager")
            .field("kind", &self.active.read().kind())
            .field("generation", &self.generation())
            .field("status", &self.status())
            .finish()
    }
}

impl Default for BackendManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendManager {
    /// Manager with no backend selected
    pub fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::NOT_CONNECTED);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            active: RwLock::new(Arc::new(NoBackendClient::new())),
            published: Arc::new(Published {
                state: Mutex::new(PublishedState::default()),
                status,
                events,
            }),
            forwarder: Mutex::new(None),
            switching: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the active client with one built from `settings`
    ///
    /// The previous client is fully shut down before the new one is created.
    /// If creation fails the manager is left with no backend.
    pub async fn switch_to(&self, settings: &BackendSettings) -> Result<u64, TransportError> {
        let _guard = self.switching.lock().await;
        let generation = self.retire().await;
        tracing::info!(generation, backend = ?settings.kind(), "Switching backend");
        let client = create_client(settings).await?;
        self.activate(client, generation);
        Ok(generation)
    }

    /// Replace the active client with an already built one
    pub async fn install(&self, client: Arc<dyn CapabilityClient>) -> u64 {
        let _guard = self.switching.lock().await;
        let generation = self.retire().await;
        tracing::info!(generation, backend = ?client.kind(), "Installing backend");
        self.activate(client, generation);
        generation
    }

    /// Shut the active client down and fall back to no backend
    pub async fn clear(&self) -> u64 {
        self.install(Arc::new(NoBackendClient::new())).await
    }

    /// Tear down the current client; returns the next generation
    async fn retire(&self) -> u64 {
        let generation = self.published.advance();

        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
        let old = std::mem::replace(
            &mut *self.active.write(),
            Arc::new(NoBackendClient::new()),
        );

        tracing::debug!(generation, backend = ?old.kind(), "Shutting down previous backend");
        old.shutdown().await;
        generation
    }

    fn activate(&self, client: Arc<dyn CapabilityClient>, generation: u64) {
        let mut events = BroadcastStream::new(client.subscribe());
        let mut status = client.watch_status();
        let initial = *status.borrow_and_update();
        self.published.set_status(generation, initial);

        let published = Arc::clone(&self.published);
        let forwarder = tokio::spawn(async move {
            loop {
                // Events first: a client pushes its snapshot before the
                // status that makes it ready
                tokio::select! {
                    biased;
                    event = events.next() => match event {
                        Some(Ok(event)) => published.forward(generation, event),
                        Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                            tracing::warn!(skipped, "Backend event forwarder lagged");
                        }
                        None => break,
                    },
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = *status.borrow_and_update();
                        published.set_status(generation, current);
                    }
                }
                if !published.is_current(generation) {
                    break;
                }
            }
        });

        *self.active.write() = client;
        *self.forwarder.lock() = Some(forwarder);
    }

    /// The active client
    pub fn client(&self) -> Arc<dyn CapabilityClient> {
        Arc::clone(&self.active.read())
    }

    /// Generation of the active client
    pub fn generation(&self) -> u64 {
        self.published.generation()
    }

    /// Status of the active client as last published
    pub fn status(&self) -> ConnectionStatus {
        *self.published.status.borrow()
    }

    /// Watch the published status
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.published.status.subscribe()
    }

    /// Last snapshot of the active client
    pub fn snapshot(&self) -> Option<LastUpdateSnapshot> {
        self.published.state.lock().snapshot
    }

    /// Subscribe to events of whichever client is active
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.published.events.subscribe()
    }
}

impl Drop for BackendManager {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
    }
}
