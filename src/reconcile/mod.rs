//! Version reconciliation against upstream channels
//!
//! For each agent every distribution channel it declares is asked for its
//! latest version. The candidate is the lowest of those (every channel must
//! already publish it) and is proposed only when strictly newer than the
//! manifest version. Apply mode rewrites the manifest through the same
//! token functions validation uses.

use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

mod patch;

use crate::config::{load_quarantine, Config, RegistryPaths};
use crate::models::{AgentManifest, DistributionKind, PackageKind};
use crate::scanner::{scan, LoadedManifest};
use crate::upstream::{parse_github_repo, GithubRepo, Release, UpstreamError, VersionSource};
use crate::version::{
    normalize_version, parse_version, rewrite_archive_url, rewrite_package_spec, split_package_spec,
    url_file_name,
};

/// Per-agent reconciliation failures
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Manifest cannot be reconciled: {0}")]
    InvalidManifest(String),

    #[error("{channel} lookup for {name} failed: {source}")]
    Lookup {
        channel: String,
        name: String,
        #[source]
        source: UpstreamError,
    },

    #[error("{channel} reports '{version}', which is not a semantic version")]
    InvalidUpstreamVersion { channel: String, version: String },

    #[error("Release {tag} of {repo} has no asset named {asset}")]
    MissingAsset { repo: String, tag: String, asset: String },

    #[error("Manifest version changed on disk (expected {expected}, found {found})")]
    Stale { expected: String, found: String },

    #[error("Failed to rewrite {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A newer version found upstream
#[derive(Debug, Clone, Serialize)]
pub struct VersionUpdate {
    pub agent_id: String,
    pub path: PathBuf,
    pub current: String,
    pub candidate: String,
    /// Latest version reported by each channel
    pub channels: BTreeMap<String, String>,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentError {
    pub agent_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedAgent {
    pub agent_id: String,
    pub reason: String,
}

/// Result of a reconciliation run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub updates: Vec<VersionUpdate>,
    pub errors: Vec<AgentError>,
    pub up_to_date: Vec<String>,
    pub skipped: Vec<SkippedAgent>,
}

impl ReconcileReport {
    /// 1 on any error, 2 when updates are pending, otherwise 0
    pub fn exit_code(&self) -> i32 {
        if !self.errors.is_empty() {
            1
        } else if self.updates.iter().any(|u| !u.applied) {
            2
        } else {
            0
        }
    }

    fn error(&mut self, agent_id: impl Into<String>, message: impl Into<String>) {
        self.errors.push(AgentError {
            agent_id: agent_id.into(),
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Restrict the run to these ids
    pub agents: Option<Vec<String>>,
    pub apply: bool,
    pub concurrency: usize,
}

/// What checking one agent concluded
#[derive(Debug)]
pub enum Outcome {
    UpToDate,
    Update {
        candidate: String,
        channels: BTreeMap<String, String>,
    },
    Skipped(String),
}

fn parse_upstream(channel: &str, raw: &str) -> Result<semver::Version, ReconcileError> {
    parse_version(&normalize_version(raw)).map_err(|_| ReconcileError::InvalidUpstreamVersion {
        channel: channel.to_string(),
        version: raw.to_string(),
    })
}

/// GitHub repository a binary distribution is released from
pub fn binary_repository(manifest: &AgentManifest) -> Option<GithubRepo> {
    manifest
        .repository
        .as_deref()
        .and_then(parse_github_repo)
        .or_else(|| {
            manifest
                .distribution
                .binary()?
                .values()
                .filter_map(|t| t.archive.as_deref())
                .find_map(parse_github_repo)
        })
}

/// Every rewritten release-download asset must exist in the release
fn check_release_assets(
    manifest: &AgentManifest,
    repo: &GithubRepo,
    release: &Release,
    candidate: &str,
) -> Result<(), ReconcileError> {
    let Some(targets) = manifest.distribution.binary() else {
        return Ok(());
    };
    let assets: BTreeSet<&str> = release.assets.iter().map(String::as_str).collect();

    for archive in targets.values().filter_map(|t| t.archive.as_deref()) {
        let hosted_here = archive.contains("/releases/download/")
            && parse_github_repo(archive).as_ref() == Some(repo);
        if !hosted_here {
            continue;
        }
        let rewritten = rewrite_archive_url(archive, &manifest.version, candidate);
        let asset = url_file_name(&rewritten);
        if !assets.contains(asset) {
            return Err(ReconcileError::MissingAsset {
                repo: repo.to_string(),
                tag: release.tag.clone(),
                asset: asset.to_string(),
            });
        }
    }
    Ok(())
}

/// Ask every channel of one agent for its latest version
pub async fn check_agent(
    source: &dyn VersionSource,
    manifest: &AgentManifest,
) -> Result<Outcome, ReconcileError> {
    let current = parse_version(&manifest.version).map_err(|e| {
        ReconcileError::InvalidManifest(format!("version '{}': {}", manifest.version, e))
    })?;

    let mut latest: BTreeMap<String, semver::Version> = BTreeMap::new();
    let mut release: Option<(GithubRepo, Release)> = None;

    for (kind, pkg) in manifest.distribution.packages() {
        let spec = pkg.package.as_deref().unwrap_or_default();
        let name = split_package_spec(kind.index(), spec).name;
        if name.is_empty() {
            return Err(ReconcileError::InvalidManifest(format!(
                "distribution '{}' has no package name",
                kind.as_str()
            )));
        }
        let channel = kind.index().to_string();
        let raw = source
            .package_latest(kind.index(), name)
            .await
            .map_err(|source| ReconcileError::Lookup {
                channel: channel.clone(),
                name: name.to_string(),
                source,
            })?;
        latest.insert(kind.as_str().to_string(), parse_upstream(&channel, &raw)?);
    }

    if manifest.distribution.binary().is_some() {
        match binary_repository(manifest) {
            Some(repo) => {
                let found = source
                    .github_latest_release(&repo.owner, &repo.repo)
                    .await
                    .map_err(|source| ReconcileError::Lookup {
                        channel: "GitHub".to_string(),
                        name: repo.to_string(),
                        source,
                    })?;
                latest.insert(
                    DistributionKind::Binary.as_str().to_string(),
                    parse_upstream("GitHub", &found.version)?,
                );
                release = Some((repo, found));
            }
            None => tracing::info!(agent = %manifest.id, "binary distribution has no GitHub repository"),
        }
    }

    let Some(candidate) = latest.values().min().cloned() else {
        return Ok(Outcome::Skipped("no distribution with a queryable upstream".to_string()));
    };
    if candidate <= current {
        return Ok(Outcome::UpToDate);
    }

    let candidate = candidate.to_string();
    if let Some((repo, release)) = &release {
        if release.version == candidate {
            check_release_assets(manifest, repo, release, &candidate)?;
        } else {
            tracing::debug!(
                agent = %manifest.id,
                release = %release.version,
                %candidate,
                "latest release is ahead of other channels, asset check skipped"
            );
        }
    }

    Ok(Outcome::Update {
        candidate,
        channels: latest.into_iter().map(|(k, v)| (k, v.to_string())).collect(),
    })
}

/// Rewrite `version` and every token of the old version in place
///
/// Only archive URLs and package specifiers that carry `old` change;
/// everything else in the document (including key order) is untouched.
pub fn rewrite_manifest(raw: &mut Value, old: &str, new: &str) {
    let Some(object) = raw.as_object_mut() else {
        return;
    };
    object.insert("version".to_string(), Value::String(new.to_string()));

    let Some(distribution) = object.get_mut("distribution").and_then(Value::as_object_mut) else {
        return;
    };

    for (key, entry) in distribution.iter_mut() {
        match key.parse::<DistributionKind>().ok().and_then(|k| k.package_kind()) {
            Some(kind) => rewrite_package_entry(kind, entry, old, new),
            None if key == DistributionKind::Binary.as_str() => {
                let Some(targets) = entry.as_object_mut() else {
                    continue;
                };
                for target in targets.values_mut() {
                    if let Some(Value::String(archive)) = target.get_mut("archive") {
                        *archive = rewrite_archive_url(archive, old, new);
                    }
                }
            }
            None => {}
        }
    }
}

fn rewrite_package_entry(kind: PackageKind, entry: &mut Value, old: &str, new: &str) {
    if let Some(Value::String(spec)) = entry.get_mut("package") {
        let pins_old = split_package_spec(kind.index(), spec).version == Some(old);
        if pins_old {
            if let Some(rewritten) = rewrite_package_spec(kind.index(), spec, new) {
                *spec = rewritten;
            }
        }
    }
}

/// Atomically replace a file: temp file in the same directory, then rename
fn write_atomic(path: &Path, content: &str) -> Result<(), ReconcileError> {
    let io_err = |source: std::io::Error| ReconcileError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(content.as_bytes()).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Apply one update to a manifest on disk
pub fn apply_update(path: &Path, old: &str, new: &str) -> Result<(), ReconcileError> {
    let content = fs::read_to_string(path).map_err(|source| ReconcileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut raw: Value = serde_json::from_str(&content).map_err(|source| ReconcileError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let found = raw.get("version").and_then(Value::as_str).unwrap_or_default();
    if found != old {
        return Err(ReconcileError::Stale {
            expected: old.to_string(),
            found: found.to_string(),
        });
    }

    let before = raw.clone();
    rewrite_manifest(&mut raw, old, new);

    let out = match patch::patch_source(&content, &before, &raw) {
        Some(patched) => patched,
        None => {
            tracing::warn!(path = %path.display(), "could not patch in place, reformatting manifest");
            let mut out = serde_json::to_string_pretty(&raw).map_err(|source| ReconcileError::Json {
                path: path.to_path_buf(),
                source,
            })?;
            out.push('\n');
            out
        }
    };
    write_atomic(path, &out)?;

    tracing::info!(path = %path.display(), old, new, "manifest updated");
    Ok(())
}

fn manifest_id(manifest: &LoadedManifest) -> String {
    manifest
        .declared_id()
        .map(str::to_string)
        .unwrap_or_else(|| manifest.dir.clone())
}

/// Check (and optionally apply) updates for the selected agents
pub async fn reconcile(
    paths: &RegistryPaths,
    config: &Config,
    source: &dyn VersionSource,
    options: &ReconcileOptions,
) -> Result<ReconcileReport> {
    let scanned = scan(&paths.scan_roots(config), &[]);
    let quarantine = load_quarantine(&paths.quarantine);
    let mut report = ReconcileReport::default();

    let wanted: Option<BTreeSet<&str>> = options
        .agents
        .as_ref()
        .map(|ids| ids.iter().map(String::as_str).collect());
    let selected = |id: &str| wanted.as_ref().map_or(true, |w| w.contains(id));

    for error in scanned.errors.iter().filter(|e| e.is_fatal()) {
        if selected(error.dir()) {
            report.error(error.dir(), error.to_string());
        }
    }

    let mut targets: Vec<(String, PathBuf, AgentManifest)> = Vec::new();
    for loaded in &scanned.manifests {
        let id = manifest_id(loaded);
        if !selected(&id) {
            continue;
        }
        if let Some(reason) = quarantine.get(&id) {
            tracing::info!(agent = %id, %reason, "skipping quarantined agent");
            report.skipped.push(SkippedAgent {
                agent_id: id,
                reason: format!("quarantined: {}", reason),
            });
            continue;
        }
        match AgentManifest::from_value(&loaded.raw) {
            Ok(manifest) => targets.push((id, loaded.path.clone(), manifest)),
            Err(e) => report.error(id, format!("Invalid manifest: {}", e)),
        }
    }

    if let Some(wanted) = &wanted {
        let known: BTreeSet<String> = scanned.manifests.iter().map(manifest_id).collect();
        for missing in wanted.iter().filter(|id| !known.contains(**id)) {
            report.error(*missing, "Agent not found");
        }
    }

    let mut results: Vec<(String, PathBuf, String, Result<Outcome, ReconcileError>)> =
        stream::iter(targets)
            .map(move |(id, path, manifest)| async move {
                let outcome = check_agent(source, &manifest).await;
                (id, path, manifest.version, outcome)
            })
            .buffer_unordered(options.concurrency.max(1))
            .collect()
            .await;
    results.sort_by(|a, b| a.0.cmp(&b.0));

    for (id, path, current, outcome) in results {
        match outcome {
            Ok(Outcome::UpToDate) => report.up_to_date.push(id),
            Ok(Outcome::Skipped(reason)) => report.skipped.push(SkippedAgent { agent_id: id, reason }),
            Ok(Outcome::Update { candidate, channels }) => report.updates.push(VersionUpdate {
                agent_id: id,
                path,
                current,
                candidate,
                channels,
                applied: false,
            }),
            Err(e) => {
                tracing::warn!(agent = %id, error = %e, "reconciliation failed");
                report.error(id, e.to_string());
            }
        }
    }

    if options.apply {
        let mut failures = Vec::new();
        for update in &mut report.updates {
            match apply_update(&update.path, &update.current, &update.candidate) {
                Ok(()) => update.applied = true,
                Err(e) => failures.push((update.agent_id.clone(), e.to_string())),
            }
        }
        for (id, message) in failures {
            report.error(id, message);
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PackageIndex;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeSource {
        npm: BTreeMap<String, String>,
        pypi: BTreeMap<String, String>,
        releases: BTreeMap<String, Release>,
    }

    #[async_trait]
    impl VersionSource for FakeSource {
        async fn npm_latest(&self, name: &str) -> Result<String, UpstreamError> {
            self.npm
                .get(name)
                .cloned()
                .ok_or_else(|| UpstreamError::NotFound(name.to_string()))
        }

        async fn pypi_latest(&self, name: &str) -> Result<String, UpstreamError> {
            self.pypi
                .get(name)
                .cloned()
                .ok_or_else(|| UpstreamError::NotFound(name.to_string()))
        }

        async fn github_latest_release(&self, owner: &str, repo: &str) -> Result<Release, UpstreamError> {
            let key = format!("{}/{}", owner, repo);
            self.releases
                .get(&key)
                .cloned()
                .ok_or(UpstreamError::NotFound(key))
        }
    }

    fn npx_manifest(version: &str) -> AgentManifest {
        AgentManifest::from_value(&json!({
            "id": "agent",
            "name": "Agent",
            "version": version,
            "description": "Test",
            "distribution": { "npx": { "package": format!("@acme/agent@{}", version) } }
        }))
        .unwrap()
    }

    fn npm(version: &str) -> FakeSource {
        FakeSource {
            npm: [("@acme/agent".to_string(), version.to_string())].into_iter().collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_same_version_is_up_to_date() {
        let outcome = check_agent(&npm("0.9.0"), &npx_manifest("0.9.0")).await.unwrap();
        assert!(matches!(outcome, Outcome::UpToDate));
    }

    #[tokio::test]
    async fn test_newer_version_is_a_candidate() {
        let outcome = check_agent(&npm("0.10.0"), &npx_manifest("0.9.0")).await.unwrap();
        match outcome {
            Outcome::Update { candidate, channels } => {
                assert_eq!(candidate, "0.10.0");
                assert_eq!(channels["npx"], "0.10.0");
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_older_upstream_is_not_a_downgrade() {
        let outcome = check_agent(&npm("0.8.0"), &npx_manifest("0.9.0")).await.unwrap();
        assert!(matches!(outcome, Outcome::UpToDate));
    }

    #[tokio::test]
    async fn test_candidate_is_lowest_channel() {
        let manifest = AgentManifest::from_value(&json!({
            "id": "agent",
            "name": "Agent",
            "version": "1.0.0",
            "description": "Test",
            "distribution": {
                "npx": { "package": "agent@1.0.0" },
                "uvx": { "package": "agent==1.0.0" }
            }
        }))
        .unwrap();
        let source = FakeSource {
            npm: [("agent".to_string(), "1.2.0".to_string())].into_iter().collect(),
            pypi: [("agent".to_string(), "1.1".to_string())].into_iter().collect(),
            ..Default::default()
        };

        match check_agent(&source, &manifest).await.unwrap() {
            Outcome::Update { candidate, .. } => assert_eq!(candidate, "1.1.0"),
            other => panic!("expected update, got {:?}", other),
        }
    }

    fn binary_manifest() -> AgentManifest {
        AgentManifest::from_value(&json!({
            "id": "agent",
            "name": "Agent",
            "version": "1.0.0",
            "description": "Test",
            "repository": "https://github.com/acme/agent.git",
            "distribution": {
                "binary": {
                    "linux-x86_64": {
                        "archive": "https://github.com/acme/agent/releases/download/v1.0.0/agent-1.0.0-linux.tar.gz",
                        "cmd": "./agent"
                    }
                }
            }
        }))
        .unwrap()
    }

    fn release(tag: &str, assets: &[&str]) -> FakeSource {
        FakeSource {
            releases: [(
                "acme/agent".to_string(),
                Release {
                    tag: tag.to_string(),
                    version: normalize_version(tag),
                    assets: assets.iter().map(|a| a.to_string()).collect(),
                },
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_binary_release_requires_assets() {
        let ok = release("v1.1", &["agent-1.1.0-linux.tar.gz"]);
        match check_agent(&ok, &binary_manifest()).await.unwrap() {
            Outcome::Update { candidate, .. } => assert_eq!(candidate, "1.1.0"),
            other => panic!("expected update, got {:?}", other),
        }

        let missing = release("v1.1.0", &["agent-1.1.0-darwin.tar.gz"]);
        let err = check_agent(&missing, &binary_manifest()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::MissingAsset { .. }));
    }

    #[tokio::test]
    async fn test_binary_without_repository_is_skipped() {
        let manifest = AgentManifest::from_value(&json!({
            "id": "agent",
            "name": "Agent",
            "version": "1.0.0",
            "description": "Test",
            "distribution": {
                "binary": { "linux-x86_64": { "archive": "https://cdn.acme.dev/1.0.0/agent.zip", "cmd": "agent" } }
            }
        }))
        .unwrap();
        let outcome = check_agent(&FakeSource::default(), &manifest).await.unwrap();
        assert!(matches!(outcome, Outcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_lookup_failure_is_an_error() {
        let err = check_agent(&FakeSource::default(), &npx_manifest("1.0.0")).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Lookup { .. }));
        assert!(err.to_string().contains("@acme/agent"));
    }

    #[test]
    fn test_rewrite_manifest_touches_only_version_tokens() {
        let mut raw = json!({
            "id": "agent",
            "name": "Agent 0.9.0 edition",
            "version": "0.9.0",
            "description": "Test",
            "distribution": {
                "binary": {
                    "linux-x86_64": {
                        "archive": "https://github.com/acme/agent/releases/download/v0.9.0/agent_0.9.0_linux.tar.gz",
                        "cmd": "./agent",
                        "args": ["--compat", "0.9.0"]
                    }
                },
                "npx": { "package": "@acme/agent@0.9.0", "args": ["--acp"] },
                "uvx": { "package": "acme-agent==0.9.0" }
            }
        });

        rewrite_manifest(&mut raw, "0.9.0", "0.10.0");

        assert_eq!(raw["version"], "0.10.0");
        assert_eq!(raw["name"], "Agent 0.9.0 edition");
        assert_eq!(
            raw["distribution"]["binary"]["linux-x86_64"]["archive"],
            "https://github.com/acme/agent/releases/download/v0.10.0/agent_0.10.0_linux.tar.gz"
        );
        assert_eq!(raw["distribution"]["binary"]["linux-x86_64"]["args"][1], "0.9.0");
        assert_eq!(raw["distribution"]["npx"]["package"], "@acme/agent@0.10.0");
        assert_eq!(raw["distribution"]["uvx"]["package"], "acme-agent==0.10.0");

        let keys: Vec<_> = raw.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["id", "name", "version", "description", "distribution"]);
    }

    #[test]
    fn test_apply_update_is_stale_safe() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("agent.json");
        fs::write(&path, r#"{"id": "agent", "version": "1.0.0"}"#).unwrap();

        let err = apply_update(&path, "0.9.0", "1.1.0").unwrap_err();
        assert!(matches!(err, ReconcileError::Stale { .. }));

        apply_update(&path, "1.0.0", "1.1.0").unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, r#"{"id": "agent", "version": "1.1.0"}"#);
    }

    #[test]
    fn test_apply_update_keeps_hand_formatting() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("agent.json");
        let before = concat!(
            "{\n",
            "    \"id\": \"agent\",\n",
            "    \"version\": \"0.9.0\",\n",
            "    \"authors\": [\"Ren\\u00e9\", \"Acme\"],\n",
            "    \"distribution\": {\n",
            "        \"uvx\": { \"package\": \"agent[cli]==0.9.0\", \"args\": [\"--acp\"] }\n",
            "    }\n",
            "}\n"
        );
        fs::write(&path, before).unwrap();

        apply_update(&path, "0.9.0", "0.10.0").unwrap();

        let expected = before
            .replace("\"version\": \"0.9.0\"", "\"version\": \"0.10.0\"")
            .replace("agent[cli]==0.9.0", "agent[cli]==0.10.0");
        assert_eq!(fs::read_to_string(&path).unwrap(), expected);
    }

    #[test]
    fn test_exit_codes() {
        let mut report = ReconcileReport::default();
        assert_eq!(report.exit_code(), 0);

        report.updates.push(VersionUpdate {
            agent_id: "agent".to_string(),
            path: PathBuf::from("agent/agent.json"),
            current: "1.0.0".to_string(),
            candidate: "1.1.0".to_string(),
            channels: BTreeMap::new(),
            applied: false,
        });
        assert_eq!(report.exit_code(), 2);

        report.updates[0].applied = true;
        assert_eq!(report.exit_code(), 0);

        report.error("other", "boom");
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_package_index_channel_names() {
        assert_eq!(PackageIndex::Npm.to_string(), "npm");
        assert_eq!(PackageIndex::PyPi.to_string(), "PyPI");
    }
}
