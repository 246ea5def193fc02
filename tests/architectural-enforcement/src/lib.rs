//! Architectural Enforcement Integration Tests
//!
//! Source-level rules every production file in the workspace must follow:
//! - No `unwrap()` / `expect()` outside tests; errors are propagated
//! - No blocking `std::thread::sleep` in async code paths
//! - No stdout printing; output goes through `tracing`
//! - No placeholder macros (`todo!`, `unimplemented!`)
//!
//! Helpers here collect the production part of each source file; the rules
//! themselves live under `tests/`.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Production portion of one source file
#[derive(Debug)]
pub struct SourceFile {
    /// Path relative to the workspace root
    pub path: PathBuf,
    /// Lines before the first `#[cfg(test)]`, paired with 1-based numbers
    pub lines: Vec<(usize, String)>,
}

/// A rule violation
#[derive(Debug)]
pub struct Violation {
    /// File containing the violation
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Offending line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.path.display(), self.line, self.text)
    }
}

/// Workspace root, two levels above this crate
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Production sources under the given workspace-relative directories
///
/// Test modules are assumed to sit at the end of a file behind
/// `#[cfg(test)]`; everything from that attribute on is skipped. Comment
/// lines are dropped.
pub fn production_sources(dirs: &[&str]) -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in dirs {
        for entry in WalkDir::new(root.join(dir))
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        {
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };
            let lines = content
                .lines()
                .enumerate()
                .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
                .filter(|(_, line)| !line.trim_start().starts_with("//"))
                .map(|(i, line)| (i + 1, line.to_string()))
                .collect();
            let path = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_path_buf();
            files.push(SourceFile { path, lines });
        }
    }
    files
}

/// Lines in `files` containing any of `needles`
pub fn find_violations(files: &[SourceFile], needles: &[&str]) -> Vec<Violation> {
    files
        .iter()
        .flat_map(|file| {
            file.lines
                .iter()
                .filter(|(_, line)| needles.iter().any(|needle| line.contains(needle)))
                .map(|(number, line)| Violation {
                    path: file.path.clone(),
                    line: *number,
                    text: line.trim().to_string(),
                })
        })
        .collect()
}
