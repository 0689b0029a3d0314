//! Upstream sources: npm, PyPI and GitHub releases
//!
//! The traits here are the seam between the registry logic and the
//! network. [`HttpUpstream`] talks to the real services; tests plug in
//! in-memory fakes.

use async_trait::async_trait;
use serde::Serialize;

use crate::models::PackageIndex;

pub mod http;

pub use http::HttpUpstream;

/// Failures talking to an upstream service
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Unexpected response from {url}: {message}")]
    Malformed { url: String, message: String },
}

/// Latest GitHub release of a repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Release {
    pub tag: String,
    /// Tag normalized to `x.y.z`
    pub version: String,
    /// Asset file names
    pub assets: Vec<String>,
}

/// Where the latest published versions come from
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn npm_latest(&self, name: &str) -> Result<String, UpstreamError>;

    async fn pypi_latest(&self, name: &str) -> Result<String, UpstreamError>;

    async fn github_latest_release(&self, owner: &str, repo: &str) -> Result<Release, UpstreamError>;

    /// Latest version of a package on its index
    async fn package_latest(&self, index: PackageIndex, name: &str) -> Result<String, UpstreamError> {
        match index {
            PackageIndex::Npm => self.npm_latest(name).await,
            PackageIndex::PyPi => self.pypi_latest(name).await,
        }
    }
}

/// Liveness checks for referenced artifacts
#[async_trait]
pub trait Prober: Send + Sync {
    /// `Ok` when the URL answers with a success status
    async fn url_exists(&self, url: &str) -> Result<(), UpstreamError>;

    /// `Ok` when the package (and version, if given) is published
    async fn package_exists(
        &self,
        index: PackageIndex,
        name: &str,
        version: Option<&str>,
    ) -> Result<(), UpstreamError>;
}

/// `owner/repo` on GitHub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubRepo {
    pub owner: String,
    pub repo: String,
}

impl std::fmt::Display for GithubRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Extract `owner/repo` from a github.com URL
///
/// Accepts repository URLs (with or without `.git`) as well as release
/// download URLs.
pub fn parse_github_repo(url: &str) -> Option<GithubRepo> {
    let rest = url
        .trim()
        .strip_prefix("https://")
        .or_else(|| url.trim().strip_prefix("http://"))
        .unwrap_or(url.trim());
    let rest = rest.strip_prefix("www.").unwrap_or(rest);
    let path = rest
        .strip_prefix("github.com/")
        .or_else(|| rest.strip_prefix("git@github.com:"))?;

    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let owner = segments.next()?;
    let repo = segments.next()?;
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if owner.is_empty() || repo.is_empty() {
        return None;
    }

    Some(GithubRepo {
        owner: owner.to_string(),
        repo: repo.to_string(),
    })
}
