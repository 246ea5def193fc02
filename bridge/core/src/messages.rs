//! Client Messages
//!
//! Everything a backend tells the editor without being asked: status changes,
//! connect/disconnect edges, state fingerprints and bootstrap failures.
//!
//! The editor never inspects the engine's Session. It only learns that
//! something changed through [`LastUpdateSnapshot`] and re-fetches what it needs.

use serde::{Deserialize, Serialize};

use crate::status::ConnectionStatus;

/// Coarse state fingerprint pushed after every mutating call
///
/// Each field is the engine's last modification time of that part of the
/// session. Values only ever grow; comparing against the previous snapshot
/// tells the editor what to re-fetch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LastUpdateSnapshot {
    /// Last change to the node table
    pub nodes: f64,
    /// Last change to the flow table
    pub flows: f64,
    /// Last change to the node class registry
    pub node_classes: f64,
}

impl LastUpdateSnapshot {
    /// Whether every field is a finite number
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.nodes.is_finite() && self.flows.is_finite() && self.node_classes.is_finite()
    }

    /// Sections that changed compared to an older snapshot
    #[must_use]
    pub fn changed_since(&self, older: &Self) -> ChangedSections {
        ChangedSections {
            nodes: self.nodes > older.nodes,
            flows: self.flows > older.flows,
            node_classes: self.node_classes > older.node_classes,
        }
    }
}

/// Which sections of a snapshot moved forward
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChangedSections {
    /// Nodes changed
    pub nodes: bool,
    /// Flows changed
    pub flows: bool,
    /// Node classes changed
    pub node_classes: bool,
}

impl ChangedSections {
    /// Whether anything changed at all
    #[must_use]
    pub fn any(&self) -> bool {
        self.nodes || self.flows || self.node_classes
    }
}

/// Terminal bootstrap failure report
///
/// The numeric status stays at `phase`; this report is what distinguishes a
/// failed bootstrap from one that is still progressing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapFailure {
    /// Last phase reached before the failure
    pub phase: ConnectionStatus,
    /// Error description
    pub reason: String,
}

/// Events broadcast by a capability client to its subscribers
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// Status code changed
    StatusChanged(ConnectionStatus),
    /// Status entered the ready band
    Connected,
    /// Status left the ready band
    Disconnected,
    /// Fresh state fingerprint from the engine
    Snapshot(LastUpdateSnapshot),
    /// Bootstrap halted for good
    BootstrapFailed(BootstrapFailure),
}
