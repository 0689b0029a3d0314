//! Scanner for agent directories
//!
//! Walks the immediate subdirectories of each scan root and loads their
//! `agent.json`. Nothing here writes to disk.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::SKIP_DIRS;
use crate::models::{ICON_FILE, MANIFEST_FILE};

/// A manifest that could not be loaded
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("{dir}/ has no agent.json")]
    Missing { dir: String, path: PathBuf },

    #[error("Could not read {}: {source}", .path.display())]
    Read {
        dir: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{dir}/agent.json is invalid JSON: {source}")]
    Parse {
        dir: String,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl LoadError {
    pub fn dir(&self) -> &str {
        match self {
            LoadError::Missing { dir, .. }
            | LoadError::Read { dir, .. }
            | LoadError::Parse { dir, .. } => dir,
        }
    }

    /// Malformed manifests fail a build; a directory without one does not
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LoadError::Missing { .. })
    }
}

/// A manifest as read from disk
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    /// Name of the containing directory
    pub dir: String,
    pub dir_path: PathBuf,
    pub path: PathBuf,
    /// Raw document, key order preserved
    pub raw: Value,
}

impl LoadedManifest {
    /// `<dir>/icon.svg` if it exists
    pub fn icon_path(&self) -> Option<PathBuf> {
        let path = self.dir_path.join(ICON_FILE);
        path.is_file().then_some(path)
    }

    /// The declared `id`, if it is a string
    pub fn declared_id(&self) -> Option<&str> {
        self.raw.get("id").and_then(Value::as_str)
    }
}

/// Result of scanning one or more roots
#[derive(Debug, Default)]
pub struct ScanResult {
    pub manifests: Vec<LoadedManifest>,
    pub errors: Vec<LoadError>,
}

fn is_skipped(name: &str) -> bool {
    name.starts_with('.') || SKIP_DIRS.contains(&name)
}

/// Load `agent.json` from a single directory
pub fn load_manifest(dir_path: &Path) -> Result<LoadedManifest, LoadError> {
    let dir = dir_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let path = dir_path.join(MANIFEST_FILE);

    if !path.is_file() {
        return Err(LoadError::Missing { dir, path });
    }

    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(source) => return Err(LoadError::Read { dir, path, source }),
    };

    match serde_json::from_str(&content) {
        Ok(raw) => Ok(LoadedManifest {
            dir,
            dir_path: dir_path.to_path_buf(),
            path,
            raw,
        }),
        Err(source) => Err(LoadError::Parse { dir, path, source }),
    }
}

/// Scan the immediate subdirectories of every root
///
/// Directories listed in `exclude` are not entries (holding areas for
/// agents that are not published). Roots that cannot be listed are logged
/// and skipped.
pub fn scan(roots: &[PathBuf], exclude: &[PathBuf]) -> ScanResult {
    let mut result = ScanResult::default();

    for root in roots {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "cannot list scan root");
                continue;
            }
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .filter(|path| {
                path.file_name()
                    .map(|n| !is_skipped(&n.to_string_lossy()))
                    .unwrap_or(false)
            })
            .collect();
        dirs.sort();

        for dir_path in dirs {
            // Nested scan roots live inside the primary root
            if roots.contains(&dir_path) || exclude.contains(&dir_path) {
                continue;
            }
            match load_manifest(&dir_path) {
                Ok(manifest) => {
                    tracing::debug!(dir = %manifest.dir, "loaded manifest");
                    result.manifests.push(manifest);
                }
                Err(e) => result.errors.push(e),
            }
        }
    }

    result
}
