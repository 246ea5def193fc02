//! Transport Layer
//!
//! Concrete [`crate::client::CapabilityClient`] implementations:
//! - `socket`: remote engine process over TCP
//! - `embedded`: interpreter hosted on a background worker thread
//!
//! # Design Philosophy
//!
//! The editor only ever sees the capability contract. Which transport sits
//! behind it is decided by [`BackendSettings`] and may change at runtime;
//! each change builds a fresh client through [`create_client`].

pub mod config;
pub mod embedded;
pub mod factory;
pub mod frame;
pub mod socket;

// Re-exports for convenience
pub use config::{BackendSettings, EmbeddedSettings, SocketSettings, DEFAULT_ENGINE_ADDRESS};
pub use embedded::EmbeddedTransportClient;
pub use factory::create_client;
pub use frame::{FrameDecoder, FrameReader};
pub use socket::{EngineServer, ServerOptions, SocketTransportClient};
