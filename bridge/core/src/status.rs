//! Connection Status
//!
//! Integer status codes shared by every backend. Codes are partitioned into
//! three bands so the editor can reason about them without knowing which
//! transport produced them:
//!
//! ```text
//!   0 ..  99   not connected
//! 100 .. 199   connecting (ordered sub-phases)
//! 200 ..       ready
//! ```
//!
//! Within one bootstrap attempt the status only ever moves upward.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse classification of a [`ConnectionStatus`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusBand {
    /// No usable backend
    NotConnected,
    /// Somewhere between cold start and ready
    Connecting,
    /// Calls may be issued
    Ready,
}

/// Numeric backend status code
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionStatus(u16);

impl ConnectionStatus {
    /// No backend, or the connection was lost
    pub const NOT_CONNECTED: Self = Self(0);

    /// Worker created, bootstrap not started
    pub const COLD: Self = Self(100);
    /// Interpreter runtime is being initialized
    pub const RUNTIME_LOADING: Self = Self(101);
    /// Interpreter runtime initialized
    pub const RUNTIME_READY: Self = Self(102);
    /// Baseline and caller packages are being installed
    pub const PACKAGES_INSTALLING: Self = Self(103);
    /// All bootstrap packages installed
    pub const PACKAGES_READY: Self = Self(104);

    /// TCP connection being established
    pub const SOCKET_CONNECTING: Self = Self(120);
    /// Connection open, waiting for the engine's welcome
    pub const SOCKET_HANDSHAKING: Self = Self(121);

    /// Session available, calls may be issued
    pub const READY: Self = Self(200);

    const CONNECTING_START: u16 = 100;
    const READY_START: u16 = 200;

    /// Wrap a raw status code
    #[must_use]
    pub const fn from_code(code: u16) -> Self {
        Self(code)
    }

    /// Raw status code
    #[must_use]
    pub const fn code(self) -> u16 {
        self.0
    }

    /// Band this code falls into
    #[must_use]
    pub fn band(self) -> StatusBand {
        if self.0 >= Self::READY_START {
            StatusBand::Ready
        } else if self.0 >= Self::CONNECTING_START {
            StatusBand::Connecting
        } else {
            StatusBand::NotConnected
        }
    }

    /// Whether calls may be issued
    #[must_use]
    pub fn is_ready(self) -> bool {
        self.band() == StatusBand::Ready
    }

    /// Human readable label for settings panels
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::NOT_CONNECTED => "Not connected",
            Self::COLD => "Worker created",
            Self::RUNTIME_LOADING => "Loading runtime",
            Self::RUNTIME_READY => "Runtime loaded",
            Self::PACKAGES_INSTALLING => "Installing packages",
            Self::PACKAGES_READY => "Packages installed",
            Self::SOCKET_CONNECTING => "Connecting",
            Self::SOCKET_HANDSHAKING => "Handshaking",
            Self::READY => "Ready",
            other => match other.band() {
                StatusBand::NotConnected => "Not connected",
                StatusBand::Connecting => "Connecting",
                StatusBand::Ready => "Ready",
            },
        }
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::NOT_CONNECTED
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.0)
    }
}
