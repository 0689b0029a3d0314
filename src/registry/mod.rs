//! Registry build: validate every entry and publish the aggregated index
//!
//! The build is one pass over an immutable scan. Per-entry findings are
//! collected fail-slow; id uniqueness is decided over the full scanned set.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::accessibility::check_accessibility;
use crate::config::{load_quarantine, Config, RegistryPaths};
use crate::icon::validate_icon;
use crate::models::{AgentManifest, RegistryIndex};
use crate::scanner::{scan, LoadError, LoadedManifest};
use crate::upstream::Prober;
use crate::validation::{find_duplicate_ids, validate_manifest, DuplicateId, Findings};

/// Published index file name inside `dist/`
pub const INDEX_FILE: &str = "registry.json";

/// Build behavior switches
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Publish the valid subset even when violations exist
    pub lenient: bool,
    /// Probe archive URLs and packages upstream
    pub check_accessibility: bool,
}

/// Outcome for one scanned directory
#[derive(Debug)]
pub struct EntryReport {
    pub manifest: LoadedManifest,
    pub findings: Findings,
    /// Quarantine reason, when the agent is withheld
    pub quarantined: Option<String>,
    /// Declares an id some other directory also declares
    pub duplicate: bool,
}

impl EntryReport {
    pub fn dir(&self) -> &str {
        &self.manifest.dir
    }

    pub fn is_publishable(&self) -> bool {
        self.findings.is_valid() && self.quarantined.is_none() && !self.duplicate
    }
}

/// Everything a build found, in scan order
#[derive(Debug, Default)]
pub struct BuildReport {
    pub load_errors: Vec<LoadError>,
    pub entries: Vec<EntryReport>,
    pub duplicates: Vec<DuplicateId>,
    /// Index that was (or, in strict mode with failures, would have been) published
    pub index: Option<RegistryIndex>,
    /// `true` once `dist/` has been written
    pub published: bool,
}

impl BuildReport {
    pub fn violation_count(&self) -> usize {
        self.load_errors.iter().filter(|e| e.is_fatal()).count()
            + self.duplicates.len()
            + self
                .entries
                .iter()
                .map(|e| e.findings.violations.len())
                .sum::<usize>()
    }

    pub fn warning_count(&self) -> usize {
        self.load_errors.iter().filter(|e| !e.is_fatal()).count()
            + self.entries.iter().map(|e| e.findings.warnings.len()).sum::<usize>()
    }

    /// The build fails whenever any violation exists, in either mode
    pub fn has_failures(&self) -> bool {
        self.violation_count() > 0
    }

    pub fn publishable(&self) -> impl Iterator<Item = &EntryReport> {
        self.entries.iter().filter(|e| e.is_publishable())
    }
}

/// Validate every scanned manifest and its icon
///
/// Pure apart from reading icon files.
pub fn validate_entries(
    manifests: Vec<LoadedManifest>,
    quarantine: &BTreeMap<String, String>,
) -> (Vec<EntryReport>, Vec<DuplicateId>) {
    let duplicates = find_duplicate_ids(&manifests);
    let duplicate_ids: BTreeSet<&str> = duplicates.iter().map(|d| d.id.as_str()).collect();

    let entries = manifests
        .into_iter()
        .map(|manifest| {
            let mut findings = validate_manifest(&manifest.raw, &manifest.dir);
            findings.extend(validate_icon(manifest.icon_path().as_deref()));

            let id = manifest.declared_id();
            let duplicate = id.map_or(false, |id| duplicate_ids.contains(id));
            let quarantined = id.and_then(|id| quarantine.get(id)).cloned();
            if let Some(reason) = &quarantined {
                tracing::info!(dir = %manifest.dir, %reason, "agent is quarantined");
            }

            EntryReport {
                manifest,
                findings,
                quarantined,
                duplicate,
            }
        })
        .collect();

    (entries, duplicates)
}

/// Aggregate publishable manifests into the index, sorted by `id`
///
/// Agents with an icon get `icon` pointing at `<base_url>/<id>.svg`.
pub fn aggregate<'a>(entries: impl IntoIterator<Item = &'a LoadedManifest>, base_url: &str) -> RegistryIndex {
    let mut agents: Vec<(String, Value)> = entries
        .into_iter()
        .map(|manifest| {
            let id = manifest.declared_id().unwrap_or(&manifest.dir).to_string();
            let mut agent = manifest.raw.clone();
            if manifest.icon_path().is_some() {
                if let Some(object) = agent.as_object_mut() {
                    object.insert(
                        "icon".to_string(),
                        Value::String(format!("{}/{}.svg", base_url.trim_end_matches('/'), id)),
                    );
                }
            }
            (id, agent)
        })
        .collect();
    agents.sort_by(|a, b| a.0.cmp(&b.0));

    RegistryIndex::new(agents.into_iter().map(|(_, agent)| agent).collect())
}

/// Render the index exactly as published: 2-space indent, trailing newline
pub fn render_index(index: &RegistryIndex) -> Result<String> {
    let mut out = serde_json::to_string_pretty(index).context("Failed to serialize registry index")?;
    out.push('\n');
    Ok(out)
}

/// Write `registry.json` and copy each icon to `<id>.svg`
pub fn publish(index: &RegistryIndex, icons: &[(String, PathBuf)], dist: &Path) -> Result<()> {
    fs::create_dir_all(dist).with_context(|| format!("Failed to create {}", dist.display()))?;

    let index_path = dist.join(INDEX_FILE);
    fs::write(&index_path, render_index(index)?)
        .with_context(|| format!("Failed to write {}", index_path.display()))?;

    remove_stale_icons(icons, dist)?;

    for (id, src) in icons {
        let dst = dist.join(format!("{}.svg", id));
        fs::copy(src, &dst)
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    }

    tracing::info!(agents = index.agents.len(), dist = %dist.display(), "published registry");
    Ok(())
}

/// Delete published icons of agents no longer in the index
fn remove_stale_icons(icons: &[(String, PathBuf)], dist: &Path) -> Result<()> {
    let current: BTreeSet<&str> = icons.iter().map(|(id, _)| id.as_str()).collect();
    let listing = fs::read_dir(dist).with_context(|| format!("Failed to list {}", dist.display()))?;

    for entry in listing {
        let path = entry.with_context(|| format!("Failed to list {}", dist.display()))?.path();
        let stale = path.extension().is_some_and(|ext| ext == "svg")
            && path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map_or(true, |stem| !current.contains(stem));
        if stale && path.is_file() {
            fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
            tracing::debug!(path = %path.display(), "removed stale icon");
        }
    }
    Ok(())
}

/// Run the full build for a registry checkout
///
/// `prober` is consulted only when accessibility checks are enabled.
pub async fn build(
    paths: &RegistryPaths,
    config: &Config,
    options: BuildOptions,
    prober: Option<&dyn Prober>,
) -> Result<BuildReport> {
    let excluded = paths.extra_roots(config);
    let scanned = scan(std::slice::from_ref(&paths.root), &excluded);
    let quarantine = load_quarantine(&paths.quarantine);

    let (mut entries, duplicates) = validate_entries(scanned.manifests, &quarantine);

    if let (true, Some(prober)) = (options.check_accessibility, prober) {
        let targets: Vec<(String, AgentManifest)> = entries
            .iter()
            .filter(|e| e.is_publishable())
            .filter_map(|e| {
                AgentManifest::from_value(&e.manifest.raw)
                    .ok()
                    .map(|m| (e.manifest.dir.clone(), m))
            })
            .collect();

        let mut failures = check_accessibility(prober, &targets, config.accessibility_concurrency).await;
        for entry in &mut entries {
            if let Some(violations) = failures.remove(&entry.manifest.dir) {
                entry.findings.violations.extend(violations);
            }
        }
    }

    let mut report = BuildReport {
        load_errors: scanned.errors,
        entries,
        duplicates,
        index: None,
        published: false,
    };

    let index = aggregate(report.publishable().map(|e| &e.manifest), &config.base_url);

    if report.has_failures() && !options.lenient {
        tracing::warn!(
            violations = report.violation_count(),
            "violations found, not writing dist/"
        );
    } else {
        let icons: Vec<(String, PathBuf)> = report
            .publishable()
            .filter_map(|e| {
                let id = e.manifest.declared_id()?.to_string();
                e.manifest.icon_path().map(|icon| (id, icon))
            })
            .collect();
        publish(&index, &icons, &paths.dist)?;
        report.published = true;
    }

    report.index = Some(index);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const ICON: &str = r#"<svg xmlns="http://www.w3.org/2000/svg" width="16" height="16"><path fill="currentColor" d="M0 0h16v16H0z"/></svg>"#;

    fn write_agent(root: &Path, dir: &str, raw: &Value) {
        let path = root.join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("agent.json"), serde_json::to_string_pretty(raw).unwrap()).unwrap();
    }

    fn agent(id: &str) -> Value {
        json!({
            "id": id,
            "name": "Agent",
            "version": "1.0.0",
            "description": "Test agent",
            "distribution": { "npx": { "package": format!("{}@1.0.0", id) } }
        })
    }

    fn offline() -> BuildOptions {
        BuildOptions {
            lenient: false,
            check_accessibility: false,
        }
    }

    #[tokio::test]
    async fn test_build_sorts_and_sets_icon_urls() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write_agent(root, "zeta", &agent("zeta"));
        write_agent(root, "alpha", &agent("alpha"));
        fs::write(root.join("alpha/icon.svg"), ICON).unwrap();

        let paths = RegistryPaths::new(root);
        let config = Config::default();
        let report = build(&paths, &config, offline(), None).await.unwrap();

        assert!(!report.has_failures());
        assert!(report.published);

        let written: Value =
            serde_json::from_str(&fs::read_to_string(paths.dist.join(INDEX_FILE)).unwrap()).unwrap();
        assert_eq!(written["version"], "1.0.0");
        assert_eq!(written["agents"][0]["id"], "alpha");
        assert_eq!(written["agents"][1]["id"], "zeta");
        assert_eq!(
            written["agents"][0]["icon"],
            format!("{}/alpha.svg", config.base_url)
        );
        assert!(written["agents"][1].get("icon").is_none());
        assert!(paths.dist.join("alpha.svg").is_file());
    }

    #[tokio::test]
    async fn test_icons_of_removed_agents_are_deleted() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write_agent(root, "alpha", &agent("alpha"));
        fs::write(root.join("alpha/icon.svg"), ICON).unwrap();
        write_agent(root, "beta", &agent("beta"));
        fs::write(root.join("beta/icon.svg"), ICON).unwrap();

        let paths = RegistryPaths::new(root);
        build(&paths, &Config::default(), offline(), None).await.unwrap();
        assert!(paths.dist.join("beta.svg").is_file());

        fs::remove_dir_all(root.join("beta")).unwrap();
        fs::write(paths.dist.join("notes.txt"), "kept").unwrap();
        build(&paths, &Config::default(), offline(), None).await.unwrap();

        assert!(paths.dist.join("alpha.svg").is_file());
        assert!(!paths.dist.join("beta.svg").exists());
        assert!(paths.dist.join("notes.txt").is_file());
    }

    #[tokio::test]
    async fn test_build_output_is_byte_identical_on_rerun() {
        let temp = TempDir::new().unwrap();
        write_agent(temp.path(), "beta", &agent("beta"));
        write_agent(temp.path(), "alpha", &agent("alpha"));
        let paths = RegistryPaths::new(temp.path());
        let config = Config::default();

        build(&paths, &config, offline(), None).await.unwrap();
        let first = fs::read(paths.dist.join(INDEX_FILE)).unwrap();
        build(&paths, &config, offline(), None).await.unwrap();
        let second = fs::read(paths.dist.join(INDEX_FILE)).unwrap();

        assert_eq!(first, second);
        assert!(first.ends_with(b"}\n"));
    }

    #[tokio::test]
    async fn test_strict_mode_writes_nothing_on_violation() {
        let temp = TempDir::new().unwrap();
        write_agent(temp.path(), "alpha", &agent("alpha"));
        write_agent(temp.path(), "broken", &agent("Broken"));
        let paths = RegistryPaths::new(temp.path());

        let report = build(&paths, &Config::default(), offline(), None).await.unwrap();

        assert!(report.has_failures());
        assert!(!report.published);
        assert!(!paths.dist.exists());
    }

    #[tokio::test]
    async fn test_lenient_mode_publishes_valid_subset() {
        let temp = TempDir::new().unwrap();
        write_agent(temp.path(), "alpha", &agent("alpha"));
        write_agent(temp.path(), "broken", &agent("Broken"));
        let paths = RegistryPaths::new(temp.path());
        let options = BuildOptions {
            lenient: true,
            check_accessibility: false,
        };

        let report = build(&paths, &Config::default(), options, None).await.unwrap();

        assert!(report.has_failures());
        assert!(report.published);
        let index = report.index.unwrap();
        assert_eq!(index.agents.len(), 1);
        assert_eq!(index.agents[0]["id"], "alpha");
    }

    #[tokio::test]
    async fn test_duplicates_and_quarantine_are_withheld() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write_agent(root, "alpha", &agent("alpha"));
        write_agent(root, "alpha-copy", &agent("alpha"));
        write_agent(root, "held", &agent("held"));
        write_agent(root, "ok", &agent("ok"));
        fs::write(root.join("quarantine.json"), r#"{"held": "broken auth"}"#).unwrap();
        let options = BuildOptions {
            lenient: true,
            check_accessibility: false,
        };

        let report = build(&RegistryPaths::new(root), &Config::default(), options, None)
            .await
            .unwrap();

        assert_eq!(report.duplicates.len(), 1);
        let ids: Vec<_> = report.publishable().map(|e| e.dir().to_string()).collect();
        assert_eq!(ids, vec!["ok".to_string()]);
        let held = report.entries.iter().find(|e| e.dir() == "held").unwrap();
        assert_eq!(held.quarantined.as_deref(), Some("broken auth"));
        assert!(held.findings.is_valid());
    }

    #[tokio::test]
    async fn test_missing_manifest_is_only_a_warning() {
        let temp = TempDir::new().unwrap();
        write_agent(temp.path(), "alpha", &agent("alpha"));
        fs::create_dir_all(temp.path().join("notes")).unwrap();

        let report = build(&RegistryPaths::new(temp.path()), &Config::default(), offline(), None)
            .await
            .unwrap();

        assert!(!report.has_failures());
        assert_eq!(report.warning_count(), 1);
    }

    #[tokio::test]
    async fn test_extra_scan_dirs_are_not_published() {
        let temp = TempDir::new().unwrap();
        write_agent(temp.path(), "alpha", &agent("alpha"));
        write_agent(&temp.path().join("_not_yet_unsupported"), "later", &agent("later"));

        let report = build(&RegistryPaths::new(temp.path()), &Config::default(), offline(), None)
            .await
            .unwrap();

        assert!(!report.has_failures());
        assert_eq!(report.entries.len(), 1);
    }
}
