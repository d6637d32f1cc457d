//! Project discovery: which directories under the configured roots look like
//! projects a task could run in.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::debug;

/// A child directory containing any of these is a project.
const PROJECT_MARKERS: &[&str] = &[
    ".git",
    "Cargo.toml",
    "package.json",
    "go.mod",
    "pyproject.toml",
];

/// Immediate child directories of `roots` that carry a project marker.
/// Sorted, no duplicates. Unreadable roots are skipped.
pub fn discover_projects(roots: &[PathBuf]) -> Vec<String> {
    let mut found = BTreeSet::new();
    for root in roots {
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(root = %root.display(), error = %e, "Skipping project root");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && is_project(&path) {
                found.insert(path.to_string_lossy().into_owned());
            }
        }
    }
    found.into_iter().collect()
}

fn is_project(dir: &Path) -> bool {
    PROJECT_MARKERS.iter().any(|m| dir.join(m).exists())
}
