//! Socket Transport
//!
//! Remote engine over a persistent TCP connection speaking length-prefixed,
//! checksummed JSON frames. Both ends live here: the editor-side
//! [`SocketTransportClient`] and the engine-side [`EngineServer`].

pub mod client;
pub mod protocol;
pub mod server;

pub use client::SocketTransportClient;
pub use protocol::{ClientFrame, ReplyOutcome, RequestId, ServerFrame, PROTOCOL_VERSION};
pub use server::{ConnectionId, EngineServer, ServerOptions};
