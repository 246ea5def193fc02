//! Interpreter Worker
//!
//! Hosts one interpreter runtime on a dedicated OS thread. The worker is
//! message driven: it takes one [`WorkerRequest`] at a time, runs it to
//! completion and answers on the request's private reply channel. Status,
//! snapshots and bootstrap failures flow back as [`WorkerPush`] messages.
//!
//! # Bootstrap
//!
//! ```text
//! cold(100) ─► runtime-loading(101) ─► runtime-ready(102)
//!           ─► packages-installing(103) ─► packages-ready(104)
//!           ─► session-ready(200)
//! ```
//!
//! Any failure halts the sequence for good and pushes
//! [`WorkerPush::Failed`]; the status stays at the last phase reached.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::capability::{PackageInstall, SessionCall, SessionMethod};
use crate::error::{BootstrapError, CallError, TransportError};
use crate::marshal::{NativeValue, ReturnValue, DEFERRED_HANDLE_ATTRIBUTES};
use crate::messages::BootstrapFailure;
use crate::runtime::{InterpreterRuntime, PackageManifest, RuntimeLoader, ENGINE_MODULE};
use crate::status::ConnectionStatus;
use crate::transport::embedded::messages::{WorkerPush, WorkerRequest};

/// Handle to a worker thread
///
/// Dropping the handle terminates the worker.
#[derive(Debug)]
pub struct InterpreterWorker {
    requests: Mutex<Option<mpsc::UnboundedSender<WorkerRequest>>>,
    terminated: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl InterpreterWorker {
    /// Start a cold worker thread
    ///
    /// Returns the handle and the receiver of the worker's pushes.
    pub fn spawn(
        loader: Arc<dyn RuntimeLoader>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerPush>), TransportError> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let terminated = Arc::new(AtomicBool::new(false));

        let state = WorkerState {
            loader,
            runtime: None,
            status: ConnectionStatus::COLD,
            failed: false,
            pushes: push_tx,
            terminated: Arc::clone(&terminated),
        };

        let thread = std::thread::Builder::new()
            .name("interpreter-worker".into())
            .spawn(move || state.run(request_rx))?;

        Ok((
            Self {
                requests: Mutex::new(Some(request_tx)),
                terminated,
                thread: Mutex::new(Some(thread)),
            },
            push_rx,
        ))
    }

    /// Post a request
    pub fn post(&self, request: WorkerRequest) -> Result<(), CallError> {
        if self.is_terminated() {
            return Err(CallError::Disposed);
        }
        self.requests
            .lock()
            .as_ref()
            .ok_or(CallError::Disposed)?
            .send(request)
            .map_err(|_| CallError::Disposed)
    }

    /// Whether the worker has been terminated
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Terminate unconditionally
    ///
    /// The worker delivers no further replies or pushes. A request already
    /// executing runs to completion on the worker thread, which then exits.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        // Closing the queue drops queued requests and their reply channels
        self.requests.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            tracing::debug!(thread = ?thread.thread().id(), "Worker terminated");
        }
    }
}

impl Drop for InterpreterWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}

struct WorkerState {
    loader: Arc<dyn RuntimeLoader>,
    runtime: Option<Box<dyn InterpreterRuntime>>,
    status: ConnectionStatus,
    failed: bool,
    pushes: mpsc::UnboundedSender<WorkerPush>,
    terminated: Arc<AtomicBool>,
}

impl WorkerState {
    fn run(mut self, mut requests: mpsc::UnboundedReceiver<WorkerRequest>) {
        tracing::debug!("Worker started");
        while let Some(request) = requests.blocking_recv() {
            if self.is_terminated() {
                break;
            }
            tracing::trace!(request = request.name(), status = %self.status, "Worker request");
            self.handle(request);
        }
        requests.close();
        tracing::debug!("Worker stopped");
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn push(&self, push: WorkerPush) {
        if self.is_terminated() {
            return;
        }
        let _ = self.pushes.send(push);
    }

    fn reply<T>(&self, reply: oneshot::Sender<Result<T, CallError>>, result: Result<T, CallError>) {
        if self.is_terminated() {
            return;
        }
        // Caller may have stopped waiting
        let _ = reply.send(result);
    }

    fn advance(&mut self, status: ConnectionStatus) {
        self.status = status;
        self.push(WorkerPush::Status { status });
    }

    fn handle(&mut self, request: WorkerRequest) {
        if let WorkerRequest::LoadRuntime {
            manifest,
            session_selector,
        } = request
        {
            self.load_runtime(&manifest, &session_selector);
            return;
        }

        let status = self.status;
        let Some(runtime) = self.runtime.as_mut().filter(|_| status.is_ready()) else {
            self.reject_not_ready(request);
            return;
        };

        match request {
            WorkerRequest::Invoke { call, reply } => {
                let result = invoke(runtime.as_mut(), call);
                if !matches!(result, Err(CallError::UnknownMethod(_))) {
                    self.push_snapshot();
                }
                self.reply(reply, result);
            }
            WorkerRequest::RunCode { code, reply } => {
                let result = run_code(runtime.as_mut(), &code);
                self.push_snapshot();
                self.reply(reply, result);
            }
            WorkerRequest::StageFiles { files, reply } => {
                let result = stage_files(runtime.as_mut(), files);
                self.reply(reply, result);
            }
            WorkerRequest::LoadPackages { packages, reply } => {
                let result = runtime.load_packages(&packages).map_err(CallError::from);
                self.reply(reply, result);
            }
            WorkerRequest::InstallPackages { request, reply } => {
                let result = runtime.install_packages(&request).map_err(CallError::from);
                self.reply(reply, result);
            }
            WorkerRequest::RequestSnapshot => self.push_snapshot(),
            WorkerRequest::LoadRuntime { .. } => {}
        }
    }

    fn reject_not_ready(&self, request: WorkerRequest) {
        let err = CallError::NotReady(self.status);
        tracing::debug!(request = request.name(), status = %self.status, "Request before session-ready");
        match request {
            WorkerRequest::Invoke { reply, .. } => self.reply(reply, Err(err)),
            WorkerRequest::RunCode { reply, .. } => self.reply(reply, Err(err)),
            WorkerRequest::StageFiles { reply, .. }
            | WorkerRequest::LoadPackages { reply, .. }
            | WorkerRequest::InstallPackages { reply, .. } => self.reply(reply, Err(err)),
            WorkerRequest::RequestSnapshot | WorkerRequest::LoadRuntime { .. } => {}
        }
    }

    fn push_snapshot(&self) {
        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };
        match runtime.session_snapshot() {
            Ok(snapshot) => self.push(WorkerPush::Snapshot { snapshot }),
            Err(err) => tracing::warn!(error = %err, "Snapshot unavailable"),
        }
    }

    fn load_runtime(&mut self, manifest: &PackageManifest, selector: &str) {
        if self.failed || self.status != ConnectionStatus::COLD {
            tracing::warn!(status = %self.status, failed = self.failed, "Ignoring repeated load-runtime");
            return;
        }

        match self.bootstrap(manifest, selector) {
            Ok(()) => tracing::info!(selector, "Session ready"),
            Err(err) => {
                self.failed = true;
                tracing::error!(error = %err, "Bootstrap failed");
                self.push(WorkerPush::Failed(BootstrapFailure {
                    phase: err.phase,
                    reason: err.source.to_string(),
                }));
            }
        }
    }

    fn bootstrap(&mut self, manifest: &PackageManifest, selector: &str) -> Result<(), BootstrapError> {
        self.advance(ConnectionStatus::RUNTIME_LOADING);
        let mut runtime = self
            .loader
            .load()
            .map_err(|e| BootstrapError::new(ConnectionStatus::RUNTIME_LOADING, e))?;
        self.advance(ConnectionStatus::RUNTIME_READY);

        self.advance(ConnectionStatus::PACKAGES_INSTALLING);
        let installing = |e| BootstrapError::new(ConnectionStatus::PACKAGES_INSTALLING, e);
        let packages = manifest.resolved_packages();
        tracing::debug!(?packages, "Loading packages");
        runtime.load_packages(&packages).map_err(installing)?;
        let extensions = PackageInstall::new(manifest.resolved_extension_packages());
        tracing::debug!(packages = ?extensions.packages, "Installing extension packages");
        runtime.install_packages(&extensions).map_err(installing)?;
        self.advance(ConnectionStatus::PACKAGES_READY);

        let init = |e| BootstrapError::new(ConnectionStatus::PACKAGES_READY, e);
        runtime.import_module(ENGINE_MODULE).map_err(init)?;
        for attribute in DEFERRED_HANDLE_ATTRIBUTES {
            runtime
                .neutralize_attribute(ENGINE_MODULE, attribute)
                .map_err(init)?;
        }
        runtime.create_session(selector).map_err(init)?;
        let snapshot = runtime.session_snapshot().map_err(init)?;

        self.runtime = Some(runtime);
        self.push(WorkerPush::Snapshot { snapshot });
        self.advance(ConnectionStatus::READY);
        Ok(())
    }
}

fn invoke(runtime: &mut dyn InterpreterRuntime, call: SessionCall) -> Result<ReturnValue, CallError> {
    let method = SessionMethod::lookup(&call.method_name)?;
    let args = call.args.iter().map(NativeValue::from_boundary).collect();
    let kwargs = call
        .kwargs
        .iter()
        .map(|(key, value)| (key.clone(), NativeValue::from_boundary(value)))
        .collect();

    let value = runtime.call_session(method, args, kwargs).map_err(|err| {
        tracing::debug!(method = %method, error = %err, "Session method raised");
        CallError::from(err)
    })?;
    Ok(ReturnValue::from(value.to_boundary()))
}

fn run_code(runtime: &mut dyn InterpreterRuntime, code: &str) -> Result<String, CallError> {
    let missing = runtime.packages_from_imports(code);
    if !missing.is_empty() {
        tracing::debug!(packages = ?missing, "Loading packages referenced by imports");
        runtime.load_packages(&missing)?;
    }
    let value = runtime.run_code(code)?;
    Ok(match value {
        NativeValue::Str(text) => text,
        other => other.to_string(),
    })
}

fn stage_files(
    runtime: &mut dyn InterpreterRuntime,
    files: BTreeMap<String, Vec<u8>>,
) -> Result<(), CallError> {
    for (name, contents) in &files {
        runtime.write_file(name, contents)?;
    }
    tracing::debug!(count = files.len(), "Files staged");
    Ok(())
}
