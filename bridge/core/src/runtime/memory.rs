//! In-Memory Runtime
//!
//! Reference [`InterpreterRuntime`]: a package index, a virtual filesystem,
//! the graph engine module and the line evaluator from [`super::script`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::capability::{PackageInstall, SessionMethod};
use crate::engine::GraphSession;
use crate::error::RuntimeError;
use crate::marshal::NativeValue;
use crate::messages::LastUpdateSnapshot;
use crate::runtime::script::{self, ScriptContext};
use crate::runtime::{module_name, InterpreterRuntime, RuntimeLoader, ENGINE_MODULE};

/// Modules importable without installing anything
const STDLIB_MODULES: &[&str] = &["json", "math", "os", "sys"];

/// Where the runtime distribution comes from
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RuntimeSource {
    /// Distribution compiled into the binary
    #[default]
    Bundled,
    /// Distribution unpacked in a directory
    Directory(PathBuf),
}

/// Installable packages and their dependencies
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageIndex {
    packages: BTreeMap<String, Vec<String>>,
}

impl Default for PackageIndex {
    fn default() -> Self {
        Self::empty()
            .with_package("micropip", &[])
            .with_package("graph-engine", &[])
            .with_package("numpy", &[])
            .with_package("scipy", &["numpy"])
            .with_package("sisl", &["numpy", "scipy"])
    }
}

impl PackageIndex {
    /// Index with no packages
    pub fn empty() -> Self {
        Self {
            packages: BTreeMap::new(),
        }
    }

    /// Add a package
    #[must_use]
    pub fn with_package(mut self, name: &str, deps: &[&str]) -> Self {
        self.packages.insert(
            name.to_string(),
            deps.iter().map(|d| (*d).to_string()).collect(),
        );
        self
    }

    /// Whether the index knows a package
    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    /// Package providing a module
    pub fn provider(&self, module: &str) -> Option<&str> {
        self.packages
            .keys()
            .find(|name| module_name(name) == module)
            .map(String::as_str)
    }

    /// `name` followed by its transitive dependencies when `deps` is set
    fn resolve(&self, name: &str, deps: bool) -> Result<Vec<String>, RuntimeError> {
        let mut out = Vec::new();
        let mut pending = vec![name.to_string()];
        while let Some(next) = pending.pop() {
            if out.contains(&next) {
                continue;
            }
            let requires = self
                .packages
                .get(&next)
                .ok_or_else(|| RuntimeError::PackageNotFound(next.clone()))?;
            if deps {
                pending.extend(requires.iter().cloned());
            }
            out.push(next);
        }
        Ok(out)
    }
}

/// Loads [`MemoryRuntime`] instances
#[derive(Clone, Debug, Default)]
pub struct MemoryRuntimeLoader {
    source: RuntimeSource,
    index: PackageIndex,
}

impl MemoryRuntimeLoader {
    /// Create a loader
    pub fn new(source: RuntimeSource, index: PackageIndex) -> Self {
        Self { source, index }
    }

    /// Loader for a distribution directory, or the bundled one
    pub fn from_dir(dir: Option<PathBuf>) -> Self {
        let source = dir.map_or(RuntimeSource::Bundled, RuntimeSource::Directory);
        Self::new(source, PackageIndex::default())
    }
}

impl RuntimeLoader for MemoryRuntimeLoader {
    fn load(&self) -> Result<Box<dyn InterpreterRuntime>, RuntimeError> {
        if let RuntimeSource::Directory(dir) = &self.source {
            if !dir.is_dir() {
                return Err(RuntimeError::SourceUnreachable(dir.display().to_string()));
            }
            tracing::debug!(dir = %dir.display(), "Loading runtime from directory");
        }
        Ok(Box::new(MemoryRuntime::new(self.index.clone())))
    }
}

/// In-memory interpreter instance
#[derive(Debug)]
pub struct MemoryRuntime {
    index: PackageIndex,
    installed: BTreeSet<String>,
    modules: BTreeSet<String>,
    neutralized: BTreeMap<String, BTreeSet<String>>,
    files: BTreeMap<String, Vec<u8>>,
    session: Option<GraphSession>,
}

impl MemoryRuntime {
    /// Fresh runtime with nothing installed
    pub fn new(index: PackageIndex) -> Self {
        Self {
            index,
            installed: BTreeSet::new(),
            modules: BTreeSet::new(),
            neutralized: BTreeMap::new(),
            files: BTreeMap::new(),
            session: None,
        }
    }

    /// Installed packages
    pub fn installed(&self) -> impl Iterator<Item = &str> {
        self.installed.iter().map(String::as_str)
    }

    fn install(&mut self, name: &str, deps: bool) -> Result<(), RuntimeError> {
        for package in self.index.resolve(name, deps)? {
            if self.installed.insert(package.clone()) {
                tracing::trace!(package = %package, "Package installed");
            }
        }
        Ok(())
    }

    fn session(&self) -> Result<&GraphSession, RuntimeError> {
        self.session.as_ref().ok_or(RuntimeError::NoSession)
    }
}

impl InterpreterRuntime for MemoryRuntime {
    fn load_packages(&mut self, packages: &[String]) -> Result<(), RuntimeError> {
        for package in packages {
            self.install(package, true)?;
        }
        Ok(())
    }

    fn install_packages(&mut self, request: &PackageInstall) -> Result<(), RuntimeError> {
        for package in &request.packages {
            match self.install(package, request.deps) {
                Ok(()) => {}
                Err(err) if request.keep_going => {
                    tracing::warn!(package = %package, error = %err, "Skipping package");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn import_module(&mut self, module: &str) -> Result<(), RuntimeError> {
        let root = module.split('.').next().unwrap_or_default();
        let available = STDLIB_MODULES.contains(&root)
            || self
                .index
                .provider(root)
                .is_some_and(|package| self.installed.contains(package));
        if !available {
            return Err(RuntimeError::ModuleNotFound(module.to_string()));
        }
        self.modules.insert(root.to_string());
        Ok(())
    }

    fn neutralize_attribute(&mut self, module: &str, attribute: &str) -> Result<(), RuntimeError> {
        if !self.modules.contains(module) {
            return Err(RuntimeError::ModuleNotFound(module.to_string()));
        }
        self.neutralized
            .entry(module.to_string())
            .or_default()
            .insert(attribute.to_string());
        if module == ENGINE_MODULE {
            if let Some(session) = self.session.as_mut() {
                session.hide_attribute(attribute);
            }
        }
        Ok(())
    }

    fn create_session(&mut self, selector: &str) -> Result<(), RuntimeError> {
        if !self.modules.contains(ENGINE_MODULE) {
            return Err(RuntimeError::ModuleNotFound(ENGINE_MODULE.to_string()));
        }
        let mut session = GraphSession::new(selector)?;
        for attribute in self.neutralized.get(ENGINE_MODULE).into_iter().flatten() {
            session.hide_attribute(attribute);
        }
        self.session = Some(session);
        Ok(())
    }

    fn call_session(
        &mut self,
        method: SessionMethod,
        args: Vec<NativeValue>,
        kwargs: Vec<(String, NativeValue)>,
    ) -> Result<NativeValue, RuntimeError> {
        self.session
            .as_mut()
            .ok_or(RuntimeError::NoSession)?
            .call(method, args, kwargs)
    }

    fn session_snapshot(&self) -> Result<LastUpdateSnapshot, RuntimeError> {
        self.session().map(GraphSession::last_update)
    }

    fn packages_from_imports(&self, code: &str) -> Vec<String> {
        script::imported_modules(code)
            .iter()
            .filter_map(|module| self.index.provider(module))
            .filter(|package| !self.installed.contains(*package))
            .map(str::to_string)
            .collect()
    }

    fn run_code(&mut self, code: &str) -> Result<NativeValue, RuntimeError> {
        script::evaluate(code, self)
    }

    fn write_file(&mut self, name: &str, contents: &[u8]) -> Result<(), RuntimeError> {
        self.files.insert(name.to_string(), contents.to_vec());
        Ok(())
    }
}

impl ScriptContext for MemoryRuntime {
    fn import(&mut self, module: &str) -> Result<(), RuntimeError> {
        self.import_module(module)
    }

    fn read_file(&self, name: &str) -> Result<Vec<u8>, RuntimeError> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::FileNotFound(name.to_string()))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    fn file_names(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    fn node_count(&self) -> Result<usize, RuntimeError> {
        self.session().map(GraphSession::node_count)
    }
}
