//! Structural validation for agent manifests
//!
//! Rules are applied fail-slow: every rule runs and every problem is
//! returned, so contributors see the full list in one pass.

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{BinaryTarget, Distributions, OsFamily, PackageKind, Platform};
use crate::scanner::LoadedManifest;
use crate::version::{self, UrlVersion, LATEST_ALIAS};

pub const REQUIRED_FIELDS: &[&str] = &["id", "name", "version", "description", "distribution"];

/// Archive and raw-binary suffixes accepted for `binary.*.archive`
pub const ARCHIVE_SUFFIXES: &[&str] = &[
    ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz", ".tar", ".zip", ".exe",
];

/// Installer packages, rejected outright
pub const INSTALLER_SUFFIXES: &[&str] = &[
    ".dmg", ".pkg", ".msi", ".deb", ".rpm", ".appimage", ".snap", ".flatpak",
];

static ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9-]*$").expect("static regex"));

static AGENT_SCHEMA: Lazy<Result<JSONSchema, String>> = Lazy::new(|| {
    let schema: Value = serde_json::from_str(include_str!("../../schemas/agent.schema.json"))
        .map_err(|e| format!("Failed to parse agent schema: {}", e))?;
    JSONSchema::compile(&schema).map_err(|e| format!("Failed to compile agent schema: {}", e))
});

/// Kinds of rule violations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    MissingField,
    Schema,
    IdFormat,
    IdMismatch,
    DuplicateId,
    InvalidVersion,
    EmptyDistribution,
    UnknownDistribution,
    UnknownPlatform,
    MissingArchive,
    MissingCmd,
    ArchiveType,
    MissingPackage,
    VersionMismatch,
    LatestAlias,
    Icon,
    Accessibility,
}

/// A broken rule; blocks publication
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub message: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Informational finding; never blocks publication
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub message: String,
}

/// Everything found while checking one manifest
#[derive(Debug, Clone, Default, Serialize)]
pub struct Findings {
    pub violations: Vec<Violation>,
    pub warnings: Vec<Warning>,
}

impl Findings {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violation(&mut self, kind: ViolationKind, message: impl Into<String>) {
        self.violations.push(Violation::new(kind, message));
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(Warning {
            message: message.into(),
        });
    }

    pub fn extend(&mut self, other: Findings) {
        self.violations.extend(other.violations);
        self.warnings.extend(other.warnings);
    }
}

/// How an archive URL's file name is classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveType {
    Archive(&'static str),
    RawBinary,
    Installer(&'static str),
    Unsupported(String),
}

pub fn classify_archive(url: &str) -> ArchiveType {
    let file_name = version::url_file_name(url).to_lowercase();

    if let Some(suffix) = INSTALLER_SUFFIXES.iter().copied().find(|s| file_name.ends_with(s)) {
        return ArchiveType::Installer(suffix);
    }
    if let Some(suffix) = ARCHIVE_SUFFIXES.iter().copied().find(|s| file_name.ends_with(s)) {
        return ArchiveType::Archive(suffix);
    }

    // Anything after the last dot that looks like a file extension
    match file_name.rsplit_once('.') {
        Some((_, ext))
            if !ext.is_empty()
                && ext.len() <= 10
                && ext.starts_with(|c: char| c.is_ascii_alphabetic())
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ArchiveType::Unsupported(format!(".{}", ext))
        }
        _ => ArchiveType::RawBinary,
    }
}

/// Validate one manifest against every per-entry rule
///
/// The cross-manifest `id` uniqueness rule lives in [`find_duplicate_ids`].
pub fn validate_manifest(raw: &Value, dir: &str) -> Findings {
    let mut findings = Findings::default();

    let Some(object) = raw.as_object() else {
        findings.violation(ViolationKind::Schema, "Manifest must be a JSON object");
        return findings;
    };

    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|f| !object.contains_key(*f))
        .collect();
    if !missing.is_empty() {
        findings.violation(
            ViolationKind::MissingField,
            format!("Missing required fields: {}", missing.join(", ")),
        );
    }

    let schema_violations = validate_against_schema(raw);
    let schema_clean = schema_violations.is_empty();
    findings.violations.extend(schema_violations);

    // Later rules run on whatever fields are usable
    if let Some(id) = object.get("id").and_then(Value::as_str) {
        validate_id(id, dir, &mut findings);
    }

    let declared = object.get("version").and_then(Value::as_str);
    if let Some(bad) = declared.filter(|v| !version::is_semver(v)) {
        findings.violation(
            ViolationKind::InvalidVersion,
            format!("Field 'version' ({}) must be semantic version (e.g., 1.0.0)", bad),
        );
    }
    let version = declared.filter(|v| version::is_semver(v));

    if let Some(raw_dist) = object.get("distribution") {
        match Distributions::deserialize(raw_dist) {
            Ok(dist) => validate_distribution(&dist, version, &mut findings),
            Err(e) if schema_clean => findings.violation(
                ViolationKind::Schema,
                format!("Field 'distribution' does not match schema: {}", e),
            ),
            // Already reported by the schema pass
            Err(_) => {}
        }
    }

    findings
}

fn validate_id(id: &str, dir: &str, findings: &mut Findings) {
    if id.is_empty() {
        findings.violation(ViolationKind::IdFormat, "Field 'id' cannot be empty");
    } else if !id.starts_with(|c: char| c.is_ascii_alphabetic()) {
        findings.violation(ViolationKind::IdFormat, "Field 'id' must start with a letter");
    } else if !ID_PATTERN.is_match(id) {
        findings.violation(
            ViolationKind::IdFormat,
            format!("Field 'id' ({}) must be lowercase letters, digits and hyphens only", id),
        );
    }

    if id != dir {
        findings.violation(
            ViolationKind::IdMismatch,
            format!("Field 'id' ({}) must match directory name ({})", id, dir),
        );
    }
}

fn validate_distribution(dist: &Distributions, version: Option<&str>, findings: &mut Findings) {

    if dist.is_empty() {
        findings.violation(
            ViolationKind::EmptyDistribution,
            "Field 'distribution' must be a non-empty object",
        );
        return;
    }
    if !dist.unknown.is_empty() {
        findings.violation(
            ViolationKind::UnknownDistribution,
            format!("Unknown distribution types: {}", dist.unknown.join(", ")),
        );
    }
    if dist.entries.is_empty() {
        findings.violation(
            ViolationKind::EmptyDistribution,
            "Field 'distribution' has no recognized distribution type",
        );
    }

    if let Some(targets) = dist.binary() {
        validate_binary(targets, version, findings);
    }
    for (kind, pkg) in dist.packages() {
        validate_package(kind, pkg.package.as_deref(), version, findings);
    }
}

fn validate_binary(
    targets: &BTreeMap<String, BinaryTarget>,
    version: Option<&str>,
    findings: &mut Findings,
) {
    if targets.is_empty() {
        findings.violation(
            ViolationKind::EmptyDistribution,
            "Field 'distribution.binary' must be a non-empty object",
        );
        return;
    }

    let mut covered = BTreeSet::new();

    for (name, target) in targets {
        match name.parse::<Platform>() {
            Ok(platform) => {
                covered.insert(platform.os());
            }
            Err(_) => {
                findings.violation(ViolationKind::UnknownPlatform, format!("Unknown platform: {}", name));
                continue;
            }
        }

        if target.cmd.as_deref().map_or(true, str::is_empty) {
            findings.violation(ViolationKind::MissingCmd, format!("Platform {} missing 'cmd' field", name));
        }

        let Some(archive) = target.archive.as_deref() else {
            findings.violation(
                ViolationKind::MissingArchive,
                format!("Platform {} missing 'archive' field", name),
            );
            continue;
        };

        match classify_archive(archive) {
            ArchiveType::Archive(_) | ArchiveType::RawBinary => {}
            ArchiveType::Installer(suffix) => findings.violation(
                ViolationKind::ArchiveType,
                format!("Platform {}: installer packages ({}) are not allowed: {}", name, suffix, archive),
            ),
            ArchiveType::Unsupported(suffix) => findings.violation(
                ViolationKind::ArchiveType,
                format!("Platform {}: unsupported archive type ({}): {}", name, suffix, archive),
            ),
        }

        if version::url_has_latest_alias(archive) {
            findings.violation(
                ViolationKind::LatestAlias,
                format!("Platform {}: archive URL must not use a 'latest' alias: {}", name, archive),
            );
        }

        if let Some(version) = version {
            if let UrlVersion::Mismatch(found) = version::archive_url_version(archive, version) {
                findings.violation(
                    ViolationKind::VersionMismatch,
                    format!(
                        "Platform {}: archive URL version ({}) does not match version {}",
                        name,
                        found.join(", "),
                        version
                    ),
                );
            }
        }
    }

    let missing: Vec<String> = OsFamily::ALL
        .iter()
        .filter(|os| !covered.contains(*os))
        .map(|os| os.to_string())
        .collect();
    if !covered.is_empty() && !missing.is_empty() {
        findings.warning(format!(
            "Binary distribution has no build for: {}",
            missing.join(", ")
        ));
    }
}

fn validate_package(kind: PackageKind, package: Option<&str>, version: Option<&str>, findings: &mut Findings) {
    let Some(spec) = package.filter(|p| !p.trim().is_empty()) else {
        findings.violation(
            ViolationKind::MissingPackage,
            format!("Distribution '{}' missing 'package' field", kind.as_str()),
        );
        return;
    };

    let split = version::split_package_spec(kind.index(), spec);
    if split.name.is_empty() {
        findings.violation(
            ViolationKind::MissingPackage,
            format!("Distribution '{}' has no package name in '{}'", kind.as_str(), spec),
        );
    }

    match split.version {
        Some(pinned) if pinned.eq_ignore_ascii_case(LATEST_ALIAS) => findings.violation(
            ViolationKind::LatestAlias,
            format!("Distribution '{}' must pin a version, not '{}'", kind.as_str(), spec),
        ),
        Some(pinned) => {
            if let Some(version) = version {
                if pinned != version {
                    findings.violation(
                        ViolationKind::VersionMismatch,
                        format!(
                            "Distribution '{}' package version ({}) does not match version {}",
                            kind.as_str(),
                            pinned,
                            version
                        ),
                    );
                }
            }
        }
        None => {}
    }
}

/// Validate a manifest against the embedded JSON schema
fn validate_against_schema(raw: &Value) -> Vec<Violation> {
    let compiled = match AGENT_SCHEMA.as_ref() {
        Ok(compiled) => compiled,
        Err(e) => return vec![Violation::new(ViolationKind::Schema, e.clone())],
    };

    match compiled.validate(raw) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|e| {
                let path = e.instance_path.to_string();
                let location = if path.is_empty() { "/".to_string() } else { path };
                Violation::new(ViolationKind::Schema, format!("Schema: {} (at {})", e, location))
            })
            .collect(),
    }
}

/// An `id` declared by more than one directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateId {
    pub id: String,
    pub dirs: Vec<String>,
}

impl DuplicateId {
    pub fn violation(&self) -> Violation {
        Violation::new(
            ViolationKind::DuplicateId,
            format!("Duplicate agent ID '{}' in: {}", self.id, self.dirs.join(", ")),
        )
    }
}

/// Find ids declared by more than one manifest in the full scanned set
pub fn find_duplicate_ids(manifests: &[LoadedManifest]) -> Vec<DuplicateId> {
    let mut by_id: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for manifest in manifests {
        if let Some(id) = manifest.declared_id() {
            by_id
                .entry(id)
                .or_default()
                .push(manifest.dir_path.display().to_string());
        }
    }

    by_id
        .into_iter()
        .filter(|(_, dirs)| dirs.len() > 1)
        .map(|(id, dirs)| DuplicateId {
            id: id.to_string(),
            dirs,
        })
        .collect()
}
