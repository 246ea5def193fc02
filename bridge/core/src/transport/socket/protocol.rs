//! Socket Protocol
//!
//! Frames exchanged between a [`super::SocketTransportClient`] and an
//! [`super::EngineServer`]. Requests carry a correlation id; replies echo it
//! and may arrive in any order.
//!
//! ```text
//! client                          server
//!   │── hello ──────────────────────►│
//!   │◄──────────────────── welcome ──│
//!   │── invoke{id:1} ───────────────►│
//!   │── run_code{id:2} ─────────────►│
//!   │◄─────────────── reply{id:2} ───│
//!   │◄─────────────── reply{id:1} ───│
//!   │◄──────────────────  snapshot ──│
//! ```

use serde::{Deserialize, Serialize};

use crate::capability::SessionCall;
use crate::error::CallError;
use crate::marshal::ReturnValue;
use crate::messages::LastUpdateSnapshot;

/// Protocol revision spoken by this crate
pub const PROTOCOL_VERSION: u32 = 1;

/// Correlation id of one request
pub type RequestId = u64;

/// Frame sent by the editor side
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Opens the session
    Hello {
        /// Client protocol revision
        protocol_version: u32,
        /// Free-form client name for logs
        client: String,
    },
    /// invoke-session-method
    Invoke {
        /// Correlation id
        id: RequestId,
        /// Method and arguments
        call: SessionCall,
    },
    /// run-arbitrary-code
    RunCode {
        /// Correlation id
        id: RequestId,
        /// Source text
        code: String,
    },
    /// Ask for a snapshot push
    RequestSnapshot,
}

/// Frame sent by the engine side
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Answer to hello
    Welcome {
        /// Server protocol revision
        protocol_version: u32,
        /// Whether run_code is accepted
        allows_run_code: bool,
    },
    /// Answer to one request
    Reply {
        /// Correlation id of the request
        id: RequestId,
        /// What happened
        outcome: ReplyOutcome,
    },
    /// Unsolicited state fingerprint
    Snapshot {
        /// Current fingerprint
        snapshot: LastUpdateSnapshot,
    },
}

/// Body of a reply frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyOutcome {
    /// invoke-session-method result
    Return(ReturnValue),
    /// run-arbitrary-code result
    Result(String),
    /// The request failed
    Error(CallError),
}
