//! Worker Messages
//!
//! Requests carry their own single-use reply channel, so a reply can only
//! ever reach the caller that posted the request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::capability::{PackageInstall, SessionCall};
use crate::error::CallError;
use crate::marshal::ReturnValue;
use crate::messages::{BootstrapFailure, LastUpdateSnapshot};
use crate::runtime::PackageManifest;
use crate::status::ConnectionStatus;

/// Private reply destination of one request
pub type Reply<T> = oneshot::Sender<Result<T, CallError>>;

/// Message posted to the worker
#[derive(Debug)]
pub enum WorkerRequest {
    /// Start the bootstrap; accepted once
    LoadRuntime {
        /// Packages to install
        manifest: PackageManifest,
        /// Session to instantiate
        session_selector: String,
    },
    /// invoke-session-method
    Invoke {
        /// Method and arguments
        call: SessionCall,
        /// Reply channel
        reply: Reply<ReturnValue>,
    },
    /// run-arbitrary-code
    RunCode {
        /// Source text
        code: String,
        /// Reply channel
        reply: Reply<String>,
    },
    /// stage-files
    StageFiles {
        /// File name to contents
        files: BTreeMap<String, Vec<u8>>,
        /// Reply channel
        reply: Reply<()>,
    },
    /// load-packages
    LoadPackages {
        /// Distribution packages
        packages: Vec<String>,
        /// Reply channel
        reply: Reply<()>,
    },
    /// install-extra-packages
    InstallPackages {
        /// Index packages and options
        request: PackageInstall,
        /// Reply channel
        reply: Reply<()>,
    },
    /// request-snapshot
    RequestSnapshot,
}

impl WorkerRequest {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadRuntime { .. } => "load-runtime",
            Self::Invoke { .. } => "invoke-session-method",
            Self::RunCode { .. } => "run-arbitrary-code",
            Self::StageFiles { .. } => "stage-files",
            Self::LoadPackages { .. } => "load-packages",
            Self::InstallPackages { .. } => "install-extra-packages",
            Self::RequestSnapshot => "request-snapshot",
        }
    }
}

/// Unsolicited message from the worker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerPush {
    /// Bootstrap phase reached
    Status {
        /// New status
        status: ConnectionStatus,
    },
    /// Session fingerprint
    Snapshot {
        /// Current fingerprint
        snapshot: LastUpdateSnapshot,
    },
    /// Bootstrap halted
    Failed(BootstrapFailure),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_wire_shape() {
        let push = WorkerPush::Failed(BootstrapFailure {
            phase: ConnectionStatus::PACKAGES_INSTALLING,
            reason: "package not found: nope".into(),
        });
        assert_eq!(
            serde_json::to_value(&push).unwrap(),
            json!({"kind": "failed", "phase": 103, "reason": "package not found: nope"})
        );

        let push = WorkerPush::Status {
            status: ConnectionStatus::RUNTIME_READY,
        };
        assert_eq!(
            serde_json::to_value(&push).unwrap(),
            json!({"kind": "status", "status": 102})
        );
    }
}
