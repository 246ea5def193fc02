//! Embedded Transport Client
//!
//! [`CapabilityClient`] backed by one [`InterpreterWorker`]. The client posts
//! load-runtime on construction, mirrors the worker's phase pushes into its
//! status, and gives every call its own oneshot reply channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::capability::{BackendKind, Capabilities, PackageInstall, SessionCall};
use crate::client::{CapabilityClient, EventHub};
use crate::error::{CallError, TransportError};
use crate::marshal::Marshalled;
use crate::messages::{BootstrapFailure, ClientEvent};
use crate::runtime::{MemoryRuntimeLoader, RuntimeLoader};
use crate::status::ConnectionStatus;
use crate::transport::config::EmbeddedSettings;
use crate::transport::embedded::messages::{Reply, WorkerPush, WorkerRequest};
use crate::transport::embedded::worker::InterpreterWorker;

/// Client owning a worker-hosted interpreter
#[derive(Debug)]
pub struct EmbeddedTransportClient {
    id: Uuid,
    worker: InterpreterWorker,
    events: Arc<EventHub>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    disposed: watch::Sender<bool>,
}

impl EmbeddedTransportClient {
    /// Start a worker on the in-memory runtime and begin bootstrapping
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(settings: &EmbeddedSettings) -> Result<Self, TransportError> {
        let loader = MemoryRuntimeLoader::from_dir(settings.runtime_dir.clone());
        Self::with_loader(Arc::new(loader), settings)
    }

    /// Start a worker on any runtime loader and begin bootstrapping
    pub fn with_loader(
        loader: Arc<dyn RuntimeLoader>,
        settings: &EmbeddedSettings,
    ) -> Result<Self, TransportError> {
        let id = Uuid::new_v4();
        let (worker, pushes) = InterpreterWorker::spawn(loader)?;
        let events = Arc::new(EventHub::new(ConnectionStatus::COLD));
        let forwarder = tokio::spawn(forward_pushes(pushes, Arc::clone(&events)));
        let (disposed, _) = watch::channel(false);

        worker
            .post(WorkerRequest::LoadRuntime {
                manifest: settings.manifest(),
                session_selector: settings.session_selector.clone(),
            })
            .map_err(|e| TransportError::InvalidState(e.to_string()))?;

        tracing::info!(client = %id, selector = %settings.session_selector, "Embedded backend starting");

        Ok(Self {
            id,
            worker,
            events,
            forwarder: Mutex::new(Some(forwarder)),
            disposed,
        })
    }

    /// Instance id used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait until the bootstrap settles
    ///
    /// Resolves with the ready status, or with the failure report if the
    /// bootstrap halted.
    pub async fn wait_ready(&self) -> Result<ConnectionStatus, BootstrapFailure> {
        let mut events = self.events.subscribe();
        loop {
            if let Some(failure) = self.events.failure() {
                return Err(failure);
            }
            let status = self.events.status();
            if status.is_ready() {
                return Ok(status);
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(BootstrapFailure {
                        phase: self.events.status(),
                        reason: "client disposed".into(),
                    });
                }
            }
        }
    }

    fn is_disposed(&self) -> bool {
        *self.disposed.borrow()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> WorkerRequest,
    ) -> Result<T, CallError> {
        if self.is_disposed() {
            return Err(CallError::Disposed);
        }
        let status = self.events.status();
        if !status.is_ready() {
            return Err(CallError::NotReady(status));
        }

        let (tx, rx) = oneshot::channel();
        let disposed = self.disposed.subscribe();
        self.worker.post(build(tx))?;

        tokio::select! {
            reply = rx => reply.map_err(|_| CallError::Disposed)?,
            () = disposal(disposed) => Err(CallError::Disposed),
        }
    }

    fn dispose(&self) {
        if self.disposed.send_replace(true) {
            return;
        }
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
        self.worker.terminate();
        tracing::info!(client = %self.id, "Embedded backend disposed");
    }
}

/// Resolves once the client is disposed
async fn disposal(mut disposed: watch::Receiver<bool>) {
    while !*disposed.borrow_and_update() {
        if disposed.changed().await.is_err() {
            return;
        }
    }
}

async fn forward_pushes(mut pushes: mpsc::UnboundedReceiver<WorkerPush>, events: Arc<EventHub>) {
    while let Some(push) = pushes.recv().await {
        match push {
            WorkerPush::Status { status } => {
                events.advance_status(status);
            }
            WorkerPush::Snapshot { snapshot } => events.publish_snapshot(snapshot),
            WorkerPush::Failed(failure) => events.fail(failure),
        }
    }
}

#[async_trait]
impl CapabilityClient for EmbeddedTransportClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    fn status(&self) -> ConnectionStatus {
        self.events.status()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::embedded()
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.events.watch()
    }

    fn bootstrap_failure(&self) -> Option<BootstrapFailure> {
        self.events.failure()
    }

    async fn invoke(&self, call: SessionCall) -> Result<Marshalled, CallError> {
        let reply = self
            .request(|reply| WorkerRequest::Invoke { call, reply })
            .await?;
        Ok(Marshalled::from(reply))
    }

    async fn run_code(&self, code: &str) -> Result<String, CallError> {
        let code = code.to_string();
        self.request(|reply| WorkerRequest::RunCode { code, reply }).await
    }

    async fn request_snapshot(&self) -> Result<(), CallError> {
        if self.is_disposed() {
            return Err(CallError::Disposed);
        }
        self.worker.post(WorkerRequest::RequestSnapshot)
    }

    async fn stage_files(&self, files: BTreeMap<String, Vec<u8>>) -> Result<(), CallError> {
        self.request(|reply| WorkerRequest::StageFiles { files, reply }).await
    }

    async fn load_packages(&self, packages: Vec<String>) -> Result<(), CallError> {
        self.request(|reply| WorkerRequest::LoadPackages { packages, reply })
            .await
    }

    async fn install_packages(&self, request: PackageInstall) -> Result<(), CallError> {
        self.request(|reply| WorkerRequest::InstallPackages { request, reply })
            .await
    }

    async fn shutdown(&self) {
        self.dispose();
    }
}

impl Drop for EmbeddedTransportClient {
    fn drop(&mut self) {
        self.dispose();
    }
}
