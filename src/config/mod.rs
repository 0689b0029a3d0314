//! Configuration for the registry tools
//!
//! Handles the registry directory layout, the optional `registry.toml`
//! and environment overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Icon URL prefix used when nothing else is configured
pub const DEFAULT_BASE_URL: &str =
    "https://github.com/agentclientprotocol/registry/releases/latest/download";

/// Directories never treated as agent entries
pub const SKIP_DIRS: &[&str] = &[
    ".claude",
    ".git",
    ".github",
    ".idea",
    "__pycache__",
    "dist",
    ".sandbox",
    ".sparkle-space",
    ".ruff_cache",
];

pub const ENV_BASE_URL: &str = "REGISTRY_BASE_URL";
pub const ENV_SKIP_URL_VALIDATION: &str = "SKIP_URL_VALIDATION";
pub const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";

/// Upstream endpoints; overridable for mirrors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub npm_base: String,
    pub pypi_base: String,
    pub github_api_base: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            npm_base: "https://registry.npmjs.org".to_string(),
            pypi_base: "https://pypi.org".to_string(),
            github_api_base: "https://api.github.com".to_string(),
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

/// Contents of `registry.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    /// Extra roots scanned by `update`, relative to the registry root
    pub extra_scan_dirs: Vec<PathBuf>,
    pub accessibility_concurrency: usize,
    pub upstream_concurrency: usize,
    pub upstream: UpstreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            extra_scan_dirs: vec![PathBuf::from("_not_yet_unsupported")],
            accessibility_concurrency: 8,
            upstream_concurrency: 8,
            upstream: UpstreamConfig::default(),
        }
    }
}

impl Config {
    /// Set the icon URL prefix, without a trailing `/`
    pub fn set_base_url(&mut self, base_url: &str) {
        self.base_url = base_url.trim_end_matches('/').to_string();
    }
}

/// Paths inside a registry checkout
#[derive(Debug, Clone)]
pub struct RegistryPaths {
    pub root: PathBuf,
    pub dist: PathBuf,
    pub config: PathBuf,
    pub quarantine: PathBuf,
}

impl RegistryPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            dist: root.join("dist"),
            config: root.join("registry.toml"),
            quarantine: root.join("quarantine.json"),
            root,
        }
    }

    /// Configured extra roots that exist on disk
    pub fn extra_roots(&self, config: &Config) -> Vec<PathBuf> {
        config
            .extra_scan_dirs
            .iter()
            .map(|d| self.root.join(d))
            .filter(|p| p.is_dir())
            .collect()
    }

    /// Every root `update` scans: the registry root plus configured extras
    pub fn scan_roots(&self, config: &Config) -> Vec<PathBuf> {
        std::iter::once(self.root.clone())
            .chain(self.extra_roots(config))
            .collect()
    }
}

/// Load `registry.toml` if present and normalize it
pub fn load_config(paths: &RegistryPaths) -> Result<Config> {
    let mut config = if paths.config.exists() {
        let content = fs::read_to_string(&paths.config)
            .with_context(|| format!("Failed to read {}", paths.config.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", paths.config.display()))?
    } else {
        Config::default()
    };

    let base_url = config.base_url.clone();
    config.set_base_url(&base_url);
    config.accessibility_concurrency = config.accessibility_concurrency.max(1);
    config.upstream_concurrency = config.upstream_concurrency.max(1);

    Ok(config)
}

pub fn github_token() -> Option<String> {
    std::env::var(ENV_GITHUB_TOKEN).ok().filter(|t| !t.is_empty())
}

/// Load `quarantine.json` (agent id -> reason)
///
/// A missing file means nothing is quarantined; an unreadable one is
/// logged and treated the same way.
pub fn load_quarantine(path: &Path) -> BTreeMap<String, String> {
    if !path.exists() {
        return BTreeMap::new();
    }
    let parsed = fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|content| serde_json::from_str(&content).map_err(anyhow::Error::from));
    match parsed {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not read quarantine list");
            BTreeMap::new()
        }
    }
}
