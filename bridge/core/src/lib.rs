//! flowbridge Core - Backend Bridge for a Node-Graph Editor
//!
//! A node-graph editor never executes its graph. It talks to a computation
//! engine through a [`CapabilityClient`], and this crate provides everything
//! behind that trait: the transports, the worker that hosts an interpreter,
//! and the marshalling of values across the interpreter boundary.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Editor                              │
//! │                 BackendManager (switching)                   │
//! └───────────────────────────┬──────────────────────────────────┘
//!                             │ CapabilityClient
//!        ┌────────────────────┼─────────────────────┐
//!        │                    │                     │
//! ┌──────┴──────┐   ┌─────────┴─────────┐   ┌───────┴──────────┐
//! │  NoBackend  │   │ SocketTransport   │   │ EmbeddedTransport│
//! │             │   │  (TCP frames)     │   │  (worker thread) │
//! └─────────────┘   └─────────┬─────────┘   └───────┬──────────┘
//!                             │                     │
//!                   ┌─────────┴─────────┐   ┌───────┴──────────┐
//!                   │   EngineServer    │   │ InterpreterWorker│
//!                   │  (engine daemon)  │   │  runtime+Session │
//!                   └───────────────────┘   └──────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`CapabilityClient`]: the uniform async surface the editor calls
//! - [`ConnectionStatus`]: banded integer status shared by every backend
//! - [`BackendManager`]: owns the active client and replaces it on demand
//! - [`Marshalled`]: tagged result of converting an interpreter value
//!
//! # Quick Start
//!
//! ```ignore
//! use flowbridge_core::{BackendManager, BackendSettings};
//!
//! let manager = BackendManager::new();
//! manager.switch_to(&BackendSettings::embedded()).await?;
//!
//! let client = manager.client();
//! let node = client.create_node("Constant", Default::default(), Default::default()).await?;
//! ```

#![deny(missing_docs)]

pub mod capability;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod marshal;
pub mod messages;
pub mod runtime;
pub mod status;
pub mod transport;

// Re-exports for convenience
pub use capability::{
    BackendKind, Capabilities, InputMode, Node, NodeId, PackageInstall, SessionCall, SessionMethod,
};
pub use client::{CapabilityClient, EventHub, NoBackendClient};
pub use config::{load_config, BridgeConfig, ConfigError, ConfigSource};
pub use error::{BootstrapError, CallError, MarshalError, RuntimeError, TransportError};
pub use manager::{BackendManager, ManagerEvent};
pub use marshal::{Conversion, Marshalled, NativeValue, ReturnValue};
pub use messages::{BootstrapFailure, ClientEvent, LastUpdateSnapshot};
pub use status::{ConnectionStatus, StatusBand};
pub use transport::{
    create_client, BackendSettings, EmbeddedSettings, EmbeddedTransportClient, EngineServer,
    ServerOptions, SocketSettings, SocketTransportClient,
};
