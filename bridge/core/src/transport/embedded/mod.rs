//! Embedded Transport
//!
//! An interpreter hosted on a background worker thread, reached through
//! request messages with private reply channels.

pub mod client;
pub mod messages;
pub mod worker;

pub use client::EmbeddedTransportClient;
pub use messages::{WorkerPush, WorkerRequest};
pub use worker::InterpreterWorker;
