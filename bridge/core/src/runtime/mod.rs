//! Interpreter Runtime Seam
//!
//! The worker never talks to an interpreter directly. It drives an
//! [`InterpreterRuntime`] obtained from a [`RuntimeLoader`], which lets the
//! same bootstrap and call protocol host any interpreter. The engine-owned
//! Session lives inside the runtime and is only ever reached by method name.
//!
//! [`memory::MemoryRuntime`] is the in-process reference implementation.

pub mod memory;
pub mod script;

use crate::capability::{PackageInstall, SessionMethod};
use crate::error::RuntimeError;
use crate::marshal::NativeValue;
use crate::messages::LastUpdateSnapshot;

pub use memory::{MemoryRuntime, MemoryRuntimeLoader, PackageIndex, RuntimeSource};

/// Module the init step imports to obtain the graph engine
pub const ENGINE_MODULE: &str = "graph_engine";

/// Packages loaded on every bootstrap, before caller packages
pub const BASELINE_PACKAGES: &[&str] = &["micropip"];

/// Packages installed on every bootstrap, before caller extension packages
pub const BASELINE_EXTENSION_PACKAGES: &[&str] = &["graph-engine"];

/// Session selector used when none is configured
pub const DEFAULT_SESSION_SELECTOR: &str = "default";

/// Packages a bootstrap installs
///
/// The baseline sets are always included; caller lists only ever add to them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PackageManifest {
    /// Packages from the runtime's own distribution
    pub packages: Vec<String>,
    /// Packages installed from the package index
    pub extension_packages: Vec<String>,
}

impl PackageManifest {
    /// Create a manifest from caller lists
    pub fn new(packages: Vec<String>, extension_packages: Vec<String>) -> Self {
        Self {
            packages,
            extension_packages,
        }
    }

    /// Baseline plus caller packages, de-duplicated, baseline first
    pub fn resolved_packages(&self) -> Vec<String> {
        merge(BASELINE_PACKAGES, &self.packages)
    }

    /// Baseline plus caller extension packages, de-duplicated, baseline first
    pub fn resolved_extension_packages(&self) -> Vec<String> {
        merge(BASELINE_EXTENSION_PACKAGES, &self.extension_packages)
    }
}

fn merge(baseline: &[&str], extra: &[String]) -> Vec<String> {
    let mut out: Vec<String> = baseline.iter().map(|s| (*s).to_string()).collect();
    for package in extra {
        if !out.contains(package) {
            out.push(package.clone());
        }
    }
    out
}

/// Module name a package provides (`graph-engine` → `graph_engine`)
pub fn module_name(package: &str) -> String {
    package.replace('-', "_")
}

/// An initialized interpreter instance
///
/// Owned exclusively by one worker; never shared across workers.
pub trait InterpreterRuntime: Send {
    /// Load packages from the runtime's own distribution
    fn load_packages(&mut self, packages: &[String]) -> Result<(), RuntimeError>;

    /// Install packages from the package index
    fn install_packages(&mut self, request: &PackageInstall) -> Result<(), RuntimeError>;

    /// Import a module into the interpreter's globals
    fn import_module(&mut self, module: &str) -> Result<(), RuntimeError>;

    /// Remove an attribute from everything a module produces
    fn neutralize_attribute(&mut self, module: &str, attribute: &str) -> Result<(), RuntimeError>;

    /// Instantiate the Session for `selector`
    fn create_session(&mut self, selector: &str) -> Result<(), RuntimeError>;

    /// Invoke a Session method
    fn call_session(
        &mut self,
        method: SessionMethod,
        args: Vec<NativeValue>,
        kwargs: Vec<(String, NativeValue)>,
    ) -> Result<NativeValue, RuntimeError>;

    /// The Session's current last-update fingerprint
    fn session_snapshot(&self) -> Result<LastUpdateSnapshot, RuntimeError>;

    /// Packages referenced by imports in `code` that are not loaded yet
    fn packages_from_imports(&self, code: &str) -> Vec<String>;

    /// Execute code, returning the value of the last statement
    fn run_code(&mut self, code: &str) -> Result<NativeValue, RuntimeError>;

    /// Write a file into the virtual filesystem
    fn write_file(&mut self, name: &str, contents: &[u8]) -> Result<(), RuntimeError>;
}

/// Produces initialized runtimes; called once per bootstrap
pub trait RuntimeLoader: Send + Sync {
    /// Initialize a fresh runtime
    fn load(&self) -> Result<Box<dyn InterpreterRuntime>, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_is_additive() {
        let manifest = PackageManifest::new(
            vec!["numpy".into(), "micropip".into()],
            vec!["sisl".into()],
        );
        assert_eq!(manifest.resolved_packages(), vec!["micropip", "numpy"]);
        assert_eq!(
            manifest.resolved_extension_packages(),
            vec!["graph-engine", "sisl"]
        );
    }

    #[test]
    fn test_empty_manifest_keeps_baseline() {
        let manifest = PackageManifest::default();
        assert_eq!(manifest.resolved_packages(), vec!["micropip"]);
        assert_eq!(manifest.resolved_extension_packages(), vec!["graph-engine"]);
    }

    #[test]
    fn test_module_name() {
        assert_eq!(module_name("graph-engine"), ENGINE_MODULE);
        assert_eq!(module_name("numpy"), "numpy");
    }
}
