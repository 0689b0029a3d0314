//! Live existence checks for everything a manifest references
//!
//! Each archive URL and package reference is probed once; probes run
//! concurrently with a bounded degree of parallelism.

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;

use crate::models::{AgentManifest, PackageIndex, PackageKind};
use crate::upstream::Prober;
use crate::validation::{Violation, ViolationKind};
use crate::version::split_package_spec;

/// Something a manifest points at that must exist upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Archive {
        platform: String,
        url: String,
    },
    Package {
        kind: PackageKind,
        name: String,
        version: Option<String>,
    },
}

impl Reference {
    fn index(&self) -> Option<PackageIndex> {
        match self {
            Reference::Archive { .. } => None,
            Reference::Package { kind, .. } => Some(kind.index()),
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reference::Archive { platform, url } => write!(f, "Platform {} archive {}", platform, url),
            Reference::Package {
                kind,
                name,
                version: Some(version),
            } => write!(f, "{} package {}@{}", kind.as_str(), name, version),
            Reference::Package { kind, name, .. } => write!(f, "{} package {}", kind.as_str(), name),
        }
    }
}

/// Every archive URL and package reference in a manifest
pub fn collect_references(manifest: &AgentManifest) -> Vec<Reference> {
    let mut refs = Vec::new();

    if let Some(targets) = manifest.distribution.binary() {
        for (platform, target) in targets {
            if let Some(url) = target.archive.as_deref().filter(|u| !u.is_empty()) {
                refs.push(Reference::Archive {
                    platform: platform.clone(),
                    url: url.to_string(),
                });
            }
        }
    }

    for (kind, pkg) in manifest.distribution.packages() {
        let Some(spec) = pkg.package.as_deref() else {
            continue;
        };
        let split = split_package_spec(kind.index(), spec);
        if split.name.is_empty() {
            continue;
        }
        refs.push(Reference::Package {
            kind,
            name: split.name.to_string(),
            version: split.version.map(str::to_string),
        });
    }

    refs
}

async fn probe(prober: &dyn Prober, reference: &Reference) -> Result<(), String> {
    let result = match reference {
        Reference::Archive { url, .. } => prober.url_exists(url).await,
        Reference::Package { name, version, .. } => {
            let index = reference.index().unwrap_or(PackageIndex::Npm);
            prober.package_exists(index, name, version.as_deref()).await
        }
    };
    result.map_err(|e| e.to_string())
}

/// Probe every reference of every entry
///
/// `entries` pairs an entry key (its directory name) with its manifest.
/// Returns the accessibility violations per key; keys with no failures are
/// absent.
pub async fn check_accessibility(
    prober: &dyn Prober,
    entries: &[(String, AgentManifest)],
    concurrency: usize,
) -> BTreeMap<String, Vec<Violation>> {
    let jobs: Vec<(&str, Reference)> = entries
        .iter()
        .flat_map(|(key, manifest)| {
            collect_references(manifest)
                .into_iter()
                .map(move |r| (key.as_str(), r))
        })
        .collect();

    tracing::info!(references = jobs.len(), concurrency, "checking accessibility");

    let results: Vec<(&str, Reference, Result<(), String>)> = stream::iter(jobs)
        .map(move |(key, reference)| async move {
            let result = probe(prober, &reference).await;
            (key, reference, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut failures: BTreeMap<String, Vec<Violation>> = BTreeMap::new();
    for (key, reference, result) in results {
        if let Err(reason) = result {
            tracing::debug!(entry = key, %reference, %reason, "reference not accessible");
            failures.entry(key.to_string()).or_default().push(Violation::new(
                ViolationKind::Accessibility,
                format!("{} is not accessible: {}", reference, reason),
            ));
        }
    }
    // Completion order is nondeterministic
    for violations in failures.values_mut() {
        violations.sort_by(|a, b| a.message.cmp(&b.message));
    }
    failures
}
