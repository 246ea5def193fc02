//! Error Types
//!
//! Errors are split by how far they propagate:
//!
//! - [`BootstrapError`] and [`TransportError`] affect a whole client instance
//!   and surface through its status.
//! - [`CallError`] rejects a single capability call and nothing else.
//! - [`MarshalError`] never leaves the marshalling layer; the fallback chain
//!   turns it into [`crate::marshal::Marshalled::Unrepresentable`].
//! - [`RuntimeError`] is what interpreter runtimes report back to the worker.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::ConnectionStatus;

/// Errors that can occur on a transport connection
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection to peer failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// Connection was closed
    #[error("Connection closed")]
    ConnectionClosed,
    /// Message serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
    /// Peer did not complete the handshake
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    /// IO error from underlying transport
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    /// Transport not in expected state
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Frame checksum mismatch - data corruption detected
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum value
        expected: u32,
        /// Actual checksum value received
        actual: u32,
    },
}

/// Errors reported by an interpreter runtime
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RuntimeError {
    /// The runtime distribution could not be reached
    #[error("runtime source unreachable: {0}")]
    SourceUnreachable(String),
    /// Package is not in the package index
    #[error("package not found: {0}")]
    PackageNotFound(String),
    /// Module is not importable
    #[error("module not found: {0}")]
    ModuleNotFound(String),
    /// No session instantiated yet
    #[error("no session has been created")]
    NoSession,
    /// Session selector does not name a known session kind
    #[error("unknown session selector: {0}")]
    UnknownSelector(String),
    /// Arguments did not bind to the method's parameters
    #[error("bad arguments for {method}: {reason}")]
    BadArguments {
        /// Method being called
        method: String,
        /// What was wrong
        reason: String,
    },
    /// Engine code raised
    #[error("{0}")]
    Raised(String),
    /// File missing from the virtual filesystem
    #[error("file not found: {0}")]
    FileNotFound(String),
    /// Script could not be parsed
    #[error("syntax error on line {line}: {reason}")]
    Syntax {
        /// 1-based line number
        line: usize,
        /// What was wrong
        reason: String,
    },
}

/// Fatal bootstrap failure of one worker instance
#[derive(Clone, Debug, Error, PartialEq)]
#[error("bootstrap failed at {phase}: {source}")]
pub struct BootstrapError {
    /// Last phase reached
    pub phase: ConnectionStatus,
    /// Underlying runtime error
    #[source]
    pub source: RuntimeError,
}

impl BootstrapError {
    /// Create a bootstrap error for a phase
    #[must_use]
    pub fn new(phase: ConnectionStatus, source: RuntimeError) -> Self {
        Self { phase, source }
    }
}

/// Error rejecting a single capability call
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CallError {
    /// No backend has been selected
    #[error("no backend selected")]
    NoBackend,
    /// Backend has not reached the ready status
    #[error("backend not ready: {0}")]
    NotReady(ConnectionStatus),
    /// Method name is not part of the capability table
    #[error("unknown session method: {0}")]
    UnknownMethod(String),
    /// The engine raised while executing the call
    #[error("engine error: {0}")]
    Engine(String),
    /// Connection went away before the reply arrived
    #[error("transport lost before reply")]
    TransportLost,
    /// The owning client was disposed
    #[error("backend disposed")]
    Disposed,
    /// Caller stopped waiting
    #[error("no reply within {0} ms")]
    Timeout(u64),
    /// Result could not be represented across the boundary
    #[error("result could not be represented across the boundary")]
    Unrepresentable,
    /// Result did not have the expected shape
    #[error("invalid result: {0}")]
    InvalidResult(String),
    /// Backend does not offer this capability
    #[error("not supported by this backend: {0}")]
    Unsupported(String),
}

impl From<RuntimeError> for CallError {
    fn from(err: RuntimeError) -> Self {
        Self::Engine(err.to_string())
    }
}

/// Failure of one stage of the outbound conversion chain
#[derive(Clone, Debug, Error, PartialEq)]
pub enum MarshalError {
    /// Value type has no direct boundary form
    #[error("{0} has no direct boundary form")]
    NoDirectForm(&'static str),
    /// Dictionary key is not a string
    #[error("dictionary key is not a string")]
    NonStringKey,
    /// NaN or infinity
    #[error("non-finite float {0}")]
    NonFiniteFloat(f64),
    /// Object carries an attribute the host would treat as a deferred handle
    #[error("object of class {class} exposes deferred handle attribute {attribute}")]
    DeferredHandle {
        /// Object class
        class: String,
        /// Offending attribute
        attribute: String,
    },
    /// Foreign handle with no data representation
    #[error("opaque handle {0}")]
    OpaqueHandle(String),
}
