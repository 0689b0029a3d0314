//! Data models for agent manifests
//!
//! These mirror the `agent.json` documents contributors check in and the
//! aggregated `registry.json` clients download. Field names are a
//! compatibility contract and must not be renamed.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Schema version written into every registry index
pub const REGISTRY_VERSION: &str = "1.0.0";

/// Manifest file name inside each agent directory
pub const MANIFEST_FILE: &str = "agent.json";

/// Icon file name inside each agent directory
pub const ICON_FILE: &str = "icon.svg";

/// Supported target platforms for binary distributions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "darwin-aarch64")]
    DarwinAarch64,
    #[serde(rename = "darwin-x86_64")]
    DarwinX86_64,
    #[serde(rename = "linux-aarch64")]
    LinuxAarch64,
    #[serde(rename = "linux-x86_64")]
    LinuxX86_64,
    #[serde(rename = "windows-aarch64")]
    WindowsAarch64,
    #[serde(rename = "windows-x86_64")]
    WindowsX86_64,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::DarwinAarch64,
        Platform::DarwinX86_64,
        Platform::LinuxAarch64,
        Platform::LinuxX86_64,
        Platform::WindowsAarch64,
        Platform::WindowsX86_64,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::DarwinAarch64 => "darwin-aarch64",
            Platform::DarwinX86_64 => "darwin-x86_64",
            Platform::LinuxAarch64 => "linux-aarch64",
            Platform::LinuxX86_64 => "linux-x86_64",
            Platform::WindowsAarch64 => "windows-aarch64",
            Platform::WindowsX86_64 => "windows-x86_64",
        }
    }

    pub fn os(&self) -> OsFamily {
        match self {
            Platform::DarwinAarch64 | Platform::DarwinX86_64 => OsFamily::Darwin,
            Platform::LinuxAarch64 | Platform::LinuxX86_64 => OsFamily::Linux,
            Platform::WindowsAarch64 | Platform::WindowsX86_64 => OsFamily::Windows,
        }
    }

    /// Platform of the machine running this binary, if it is one we publish for
    pub fn current() -> Option<Platform> {
        match (std::env::consts::OS, std::env::consts::ARCH) {
            ("macos", "aarch64") => Some(Platform::DarwinAarch64),
            ("macos", "x86_64") => Some(Platform::DarwinX86_64),
            ("linux", "aarch64") => Some(Platform::LinuxAarch64),
            ("linux", "x86_64") => Some(Platform::LinuxX86_64),
            ("windows", "aarch64") => Some(Platform::WindowsAarch64),
            ("windows", "x86_64") => Some(Platform::WindowsX86_64),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("Unknown platform: {}", s))
    }
}

/// Operating system family, used for coverage warnings
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OsFamily {
    Darwin,
    Linux,
    Windows,
}

impl OsFamily {
    pub const ALL: [OsFamily; 3] = [OsFamily::Darwin, OsFamily::Linux, OsFamily::Windows];
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OsFamily::Darwin => write!(f, "darwin"),
            OsFamily::Linux => write!(f, "linux"),
            OsFamily::Windows => write!(f, "windows"),
        }
    }
}

/// Upstream package index a package distribution resolves against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageIndex {
    Npm,
    PyPi,
}

impl std::fmt::Display for PackageIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageIndex::Npm => write!(f, "npm"),
            PackageIndex::PyPi => write!(f, "PyPI"),
        }
    }
}

/// Package runners a manifest can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Npx,
    Bunx,
    Uvx,
}

impl PackageKind {
    pub fn index(&self) -> PackageIndex {
        match self {
            PackageKind::Npx | PackageKind::Bunx => PackageIndex::Npm,
            PackageKind::Uvx => PackageIndex::PyPi,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageKind::Npx => "npx",
            PackageKind::Bunx => "bunx",
            PackageKind::Uvx => "uvx",
        }
    }
}

/// Distribution kinds recognized in the `distribution` map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionKind {
    Binary,
    Npx,
    Bunx,
    Uvx,
}

impl DistributionKind {
    pub const ALL: [DistributionKind; 4] = [
        DistributionKind::Binary,
        DistributionKind::Npx,
        DistributionKind::Bunx,
        DistributionKind::Uvx,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionKind::Binary => "binary",
            DistributionKind::Npx => "npx",
            DistributionKind::Bunx => "bunx",
            DistributionKind::Uvx => "uvx",
        }
    }

    pub fn package_kind(&self) -> Option<PackageKind> {
        match self {
            DistributionKind::Binary => None,
            DistributionKind::Npx => Some(PackageKind::Npx),
            DistributionKind::Bunx => Some(PackageKind::Bunx),
            DistributionKind::Uvx => Some(PackageKind::Uvx),
        }
    }
}

impl std::fmt::Display for DistributionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DistributionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DistributionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("Unknown distribution type: {}", s))
    }
}

/// One platform entry of a binary distribution
///
/// `archive` and `cmd` are optional here so that a missing field surfaces
/// as a validation violation instead of a parse failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BinaryTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}

/// Package reference resolved through npm or PyPI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageDistribution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}

/// A single distribution method
#[derive(Debug, Clone)]
pub enum Distribution {
    /// Per-platform archives; keys stay raw so unknown platforms can be reported
    Binary(BTreeMap<String, BinaryTarget>),
    Package(PackageKind, PackageDistribution),
}

impl Distribution {
    pub fn kind(&self) -> DistributionKind {
        match self {
            Distribution::Binary(_) => DistributionKind::Binary,
            Distribution::Package(PackageKind::Npx, _) => DistributionKind::Npx,
            Distribution::Package(PackageKind::Bunx, _) => DistributionKind::Bunx,
            Distribution::Package(PackageKind::Uvx, _) => DistributionKind::Uvx,
        }
    }

    fn parse(kind: DistributionKind, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind.package_kind() {
            None => Distribution::Binary(serde_json::from_value(value)?),
            Some(pkg) => Distribution::Package(pkg, serde_json::from_value(value)?),
        })
    }
}

/// The `distribution` map, split into recognized and unrecognized kinds
#[derive(Debug, Clone, Default)]
pub struct Distributions {
    pub entries: Vec<Distribution>,
    pub unknown: Vec<String>,
}

impl Distributions {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.unknown.is_empty()
    }

    pub fn get(&self, kind: DistributionKind) -> Option<&Distribution> {
        self.entries.iter().find(|d| d.kind() == kind)
    }

    pub fn binary(&self) -> Option<&BTreeMap<String, BinaryTarget>> {
        self.entries.iter().find_map(|d| match d {
            Distribution::Binary(targets) => Some(targets),
            _ => None,
        })
    }

    pub fn packages(&self) -> impl Iterator<Item = (PackageKind, &PackageDistribution)> {
        self.entries.iter().filter_map(|d| match d {
            Distribution::Package(kind, pkg) => Some((*kind, pkg)),
            _ => None,
        })
    }
}

impl<'de> Deserialize<'de> for Distributions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Map::<String, Value>::deserialize(deserializer)?;
        let mut out = Distributions::default();
        for (key, value) in raw {
            match key.parse::<DistributionKind>() {
                Ok(kind) => {
                    let dist = Distribution::parse(kind, value)
                        .map_err(|e| D::Error::custom(format!("distribution.{}: {}", key, e)))?;
                    out.entries.push(dist);
                }
                Err(_) => out.unknown.push(key),
            }
        }
        Ok(out)
    }
}

/// Typed view of an `agent.json` document
#[derive(Debug, Clone, Deserialize)]
pub struct AgentManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    pub distribution: Distributions,
}

impl AgentManifest {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        AgentManifest::deserialize(value)
    }
}

/// Aggregated index published as `registry.json`
///
/// Agents are kept as raw JSON so unknown fields and key order survive
/// into the published artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryIndex {
    pub version: String,
    pub agents: Vec<Value>,
}

impl RegistryIndex {
    pub fn new(agents: Vec<Value>) -> Self {
        Self {
            version: REGISTRY_VERSION.to_string(),
            agents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parses_mixed_distributions() {
        let value = json!({
            "id": "demo",
            "name": "Demo",
            "version": "1.0.0",
            "description": "Demo agent",
            "distribution": {
                "npx": { "package": "demo@1.0.0", "args": ["--acp"] },
                "binary": {
                    "linux-x86_64": { "archive": "https://example.com/v1.0.0/demo.tar.gz", "cmd": "./demo" }
                },
                "snap": {}
            }
        });

        let manifest = AgentManifest::from_value(&value).unwrap();
        assert_eq!(manifest.distribution.entries.len(), 2);
        assert_eq!(manifest.distribution.unknown, vec!["snap".to_string()]);
        assert_eq!(manifest.distribution.entries[0].kind(), DistributionKind::Npx);
        assert!(manifest.distribution.binary().unwrap().contains_key("linux-x86_64"));
    }

    #[test]
    fn test_missing_archive_is_not_a_parse_error() {
        let value = json!({
            "id": "demo",
            "name": "Demo",
            "version": "1.0.0",
            "description": "Demo agent",
            "distribution": { "binary": { "linux-x86_64": { "cmd": "./demo" } } }
        });

        let manifest = AgentManifest::from_value(&value).unwrap();
        let targets = manifest.distribution.binary().unwrap();
        assert!(targets["linux-x86_64"].archive.is_none());
    }

    #[test]
    fn test_package_kind_indexes() {
        assert_eq!(PackageKind::Npx.index(), PackageIndex::Npm);
        assert_eq!(PackageKind::Bunx.index(), PackageIndex::Npm);
        assert_eq!(PackageKind::Uvx.index(), PackageIndex::PyPi);
    }

    #[test]
    fn test_platform_round_trip_names() {
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
        assert!("linux-riscv64".parse::<Platform>().is_err());
    }
}
