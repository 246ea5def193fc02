//! Backend Settings
//!
//! What the editor selects: no backend, a remote engine reached over a
//! socket, or an interpreter hosted in a background worker. Applying new
//! settings always replaces the client (see [`crate::manager::BackendManager`]).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::BackendKind;
use crate::runtime::{PackageManifest, DEFAULT_SESSION_SELECTOR};

/// Default remote engine address
pub const DEFAULT_ENGINE_ADDRESS: &str = "127.0.0.1:7878";

/// Settings of the socket transport
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketSettings {
    /// `host:port` of the engine process
    pub address: String,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Per-call reply timeout in milliseconds (0 = wait forever)
    pub request_timeout_ms: u64,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_ENGINE_ADDRESS.to_string(),
            connect_timeout_ms: 5000,
            request_timeout_ms: 0,
        }
    }
}

impl SocketSettings {
    /// Settings for an address with default timeouts
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Connection timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-call timeout, if any
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

/// Settings of the embedded transport
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedSettings {
    /// Runtime distribution packages added to the baseline
    pub packages: Vec<String>,

    /// Index packages added to the baseline
    pub extension_packages: Vec<String>,

    /// Which Session to instantiate
    pub session_selector: String,

    /// Runtime distribution directory (None = bundled)
    pub runtime_dir: Option<PathBuf>,
}

impl Default for EmbeddedSettings {
    fn default() -> Self {
        Self {
            packages: Vec::new(),
            extension_packages: Vec::new(),
            session_selector: DEFAULT_SESSION_SELECTOR.to_string(),
            runtime_dir: None,
        }
    }
}

impl EmbeddedSettings {
    /// Package manifest posted with load-runtime
    pub fn manifest(&self) -> PackageManifest {
        PackageManifest::new(self.packages.clone(), self.extension_packages.clone())
    }
}

/// Backend selection
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendSettings {
    /// No backend
    #[default]
    None,
    /// Remote engine over TCP
    Socket(SocketSettings),
    /// Worker-hosted interpreter
    Embedded(EmbeddedSettings),
}

impl BackendSettings {
    /// Socket backend at `address`
    pub fn socket(address: impl Into<String>) -> Self {
        Self::Socket(SocketSettings::new(address))
    }

    /// Embedded backend with default settings
    pub fn embedded() -> Self {
        Self::Embedded(EmbeddedSettings::default())
    }

    /// Which transport these settings select
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::None => BackendKind::None,
            Self::Socket(_) => BackendKind::Socket,
            Self::Embedded(_) => BackendKind::Embedded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_timeout_zero_means_none() {
        let mut settings = SocketSettings::new("10.0.0.1:9000");
        assert_eq!(settings.request_timeout(), None);
        settings.request_timeout_ms = 250;
        assert_eq!(settings.request_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_tagged_form() {
        let settings: BackendSettings = serde_json::from_value(json!({
            "backend": "embedded",
            "extension_packages": ["sisl"]
        }))
        .unwrap();
        let BackendSettings::Embedded(embedded) = &settings else {
            panic!("expected embedded settings");
        };
        assert_eq!(embedded.session_selector, "default");
        assert_eq!(
            embedded.manifest().resolved_extension_packages(),
            vec!["graph-engine", "sisl"]
        );
        assert_eq!(settings.kind(), BackendKind::Embedded);
    }
}
