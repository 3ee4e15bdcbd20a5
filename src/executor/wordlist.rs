//! Wordlist path resolution against the read-only SecLists mount.
//!
//! Wordlist parameters reference container paths under the mount root.
//! When the referenced file does not exist on the host side of the mount,
//! the resolver searches for a file with the same basename, then falls
//! back to a category-appropriate default, so a planner that guessed a
//! plausible-but-wrong SecLists path still gets a usable scan.

use std::path::{Path, PathBuf};

/// Outcome of resolving one wordlist reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The referenced file exists; keep the parameter as-is.
    Unchanged,
    /// The file was absent; use this container path instead.
    Substituted(String),
    /// No candidate exists on the host mount at all.
    Unresolvable,
}

/// Fallback candidates for API-flavoured wordlists, relative to the root.
const API_CANDIDATES: [&str; 2] = [
    "Discovery/Web-Content/api/objects.txt",
    "Discovery/Web-Content/api/api-endpoints.txt",
];

/// Fallback candidates for generic content discovery.
const GENERIC_CANDIDATES: [&str; 3] = [
    "Discovery/Web-Content/common.txt",
    "Discovery/Web-Content/directory-list-2.3-small.txt",
    "Discovery/Web-Content/raft-small-words.txt",
];

/// Directory recursion bound for the basename search.
const MAX_SEARCH_DEPTH: usize = 6;

/// Maps container wordlist paths to the host mount and back.
#[derive(Debug, Clone)]
pub struct WordlistResolver {
    mount_root: String,
    host_root: PathBuf,
}

impl WordlistResolver {
    /// Create a resolver for a container mount root backed by a host dir.
    pub fn new(mount_root: impl Into<String>, host_root: impl Into<PathBuf>) -> Self {
        let mut mount_root = mount_root.into();
        while mount_root.len() > 1 && mount_root.ends_with('/') {
            mount_root.pop();
        }
        Self {
            mount_root,
            host_root: host_root.into(),
        }
    }

    /// The container mount root all wordlist parameters must start with.
    pub fn mount_root(&self) -> &str {
        &self.mount_root
    }

    /// The host directory backing the mount.
    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    /// Resolve a requested container path.
    ///
    /// Paths outside the mount root are left untouched (the planner
    /// pipeline already rejects them; at this layer they simply fail in
    /// the container).
    pub fn resolve(&self, requested: &str) -> Resolution {
        let Some(relative) = self.relative_of(requested) else {
            return Resolution::Unchanged;
        };

        if self.host_root.join(&relative).is_file() {
            return Resolution::Unchanged;
        }

        // Same basename anywhere under the host mount.
        if let Some(found) = Path::new(&relative)
            .file_name()
            .and_then(|name| search_basename(&self.host_root, name.to_string_lossy().as_ref()))
        {
            if let Some(container) = self.container_path_of(&found) {
                return Resolution::Substituted(container);
            }
        }

        // Category fallback: api wordlists vs generic content lists.
        let candidates: &[&str] = if requested.to_lowercase().contains("api") {
            &API_CANDIDATES
        } else {
            &GENERIC_CANDIDATES
        };
        for candidate in candidates {
            if self.host_root.join(candidate).is_file() {
                return Resolution::Substituted(format!("{}/{candidate}", self.mount_root));
            }
        }

        Resolution::Unresolvable
    }

    /// Strip the mount root, returning the relative container path.
    fn relative_of(&self, requested: &str) -> Option<String> {
        let stripped = requested.strip_prefix(&self.mount_root)?;
        Some(stripped.trim_start_matches('/').to_owned())
    }

    /// Map a host path back to its container path.
    fn container_path_of(&self, host_path: &Path) -> Option<String> {
        let relative = host_path.strip_prefix(&self.host_root).ok()?;
        Some(format!(
            "{}/{}",
            self.mount_root,
            relative.to_string_lossy()
        ))
    }
}

/// Depth-bounded search for a file with the given basename.
fn search_basename(dir: &Path, basename: &str) -> Option<PathBuf> {
    search_basename_at(dir, basename, 0)
}

fn search_basename_at(dir: &Path, basename: &str, depth: usize) -> Option<PathBuf> {
    if depth > MAX_SEARCH_DEPTH {
        return None;
    }
    let entries = std::fs::read_dir(dir).ok()?;
    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            if path
                .file_name()
                .is_some_and(|name| name.to_string_lossy() == basename)
            {
                return Some(path);
            }
        } else if path.is_dir() {
            subdirs.push(path);
        }
    }
    // Files first at each level, then recurse; keeps the common layouts fast.
    subdirs.sort();
    for subdir in subdirs {
        if let Some(found) = search_basename_at(&subdir, basename, depth.saturating_add(1)) {
            return Some(found);
        }
    }
    None
}
