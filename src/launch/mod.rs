//! Launch plans and auth-method checks
//!
//! A launch plan is what an external verifier needs to start an agent:
//! command line, environment and, for binaries, the archive to unpack.
//! Spawning processes and speaking the ACP handshake are the verifier's
//! business; this module only builds plans and judges the reply.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::models::{AgentManifest, Distribution, DistributionKind, PackageKind, Platform};

/// Auth method types a client can drive
pub const SUPPORTED_AUTH_TYPES: &[&str] = &["agent", "terminal"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("Agent has no '{0}' distribution")]
    NotDeclared(DistributionKind),

    #[error("Host platform is not a published target; pass --platform")]
    UnknownHost,

    #[error("Binary distribution has no build for {0}")]
    NoTarget(Platform),

    #[error("Distribution '{kind}' is missing '{field}'")]
    MissingField {
        kind: DistributionKind,
        field: &'static str,
    },
}

/// Everything needed to start one distribution of an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchPlan {
    pub agent_id: String,
    pub kind: DistributionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Archive to download and unpack before running `command`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

fn runner(kind: PackageKind) -> Vec<String> {
    match kind {
        PackageKind::Npx => vec!["npx".to_string(), "--yes".to_string()],
        PackageKind::Bunx => vec!["bunx".to_string()],
        PackageKind::Uvx => vec!["uvx".to_string()],
    }
}

/// Build the plan for one distribution kind
///
/// `platform` selects the binary target; `None` means the host platform.
pub fn plan_launch(
    manifest: &AgentManifest,
    kind: DistributionKind,
    platform: Option<Platform>,
) -> Result<LaunchPlan, LaunchError> {
    let dist = manifest
        .distribution
        .get(kind)
        .ok_or(LaunchError::NotDeclared(kind))?;

    match dist {
        Distribution::Package(pkg_kind, pkg) => {
            let package = pkg
                .package
                .clone()
                .filter(|p| !p.is_empty())
                .ok_or(LaunchError::MissingField { kind, field: "package" })?;
            let mut command = runner(*pkg_kind);
            command.push(package);
            command.extend(pkg.args.iter().cloned());

            Ok(LaunchPlan {
                agent_id: manifest.id.clone(),
                kind,
                platform: None,
                command,
                env: pkg.env.clone().unwrap_or_default(),
                archive: None,
            })
        }
        Distribution::Binary(targets) => {
            let platform = platform.or_else(Platform::current).ok_or(LaunchError::UnknownHost)?;
            let target = targets
                .get(platform.as_str())
                .ok_or(LaunchError::NoTarget(platform))?;
            let cmd = target
                .cmd
                .clone()
                .filter(|c| !c.is_empty())
                .ok_or(LaunchError::MissingField { kind, field: "cmd" })?;

            let mut command = vec![cmd];
            command.extend(target.args.iter().cloned());

            Ok(LaunchPlan {
                agent_id: manifest.id.clone(),
                kind,
                platform: Some(platform),
                command,
                env: target.env.clone().unwrap_or_default(),
                archive: target.archive.clone(),
            })
        }
    }
}

/// Plans for every declared distribution, in declaration order
pub fn plan_all(
    manifest: &AgentManifest,
    platform: Option<Platform>,
) -> Vec<(DistributionKind, Result<LaunchPlan, LaunchError>)> {
    manifest
        .distribution
        .entries
        .iter()
        .map(|d| (d.kind(), plan_launch(manifest, d.kind(), platform)))
        .collect()
}

/// One entry of the handshake's `authMethods`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthMethod {
    pub id: String,
    pub name: Option<String>,
    /// Explicit `type`, else inferred from `_meta`, else `agent`
    #[serde(rename = "type")]
    pub method_type: String,
}

/// Parse `authMethods` from an initialize result
pub fn parse_auth_methods(raw: &Value) -> Vec<AuthMethod> {
    let Some(methods) = raw.as_array() else {
        return Vec::new();
    };

    methods
        .iter()
        .filter_map(Value::as_object)
        .map(|method| {
            let explicit = method
                .get("type")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty());
            let from_meta = || {
                let meta = method.get("_meta")?.as_object()?;
                if meta.contains_key("terminal-auth") {
                    Some("terminal")
                } else if meta.contains_key("agent-auth") {
                    Some("agent")
                } else {
                    None
                }
            };

            AuthMethod {
                id: method
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: method.get("name").and_then(Value::as_str).map(str::to_string),
                method_type: explicit.or_else(from_meta).unwrap_or("agent").to_string(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthRejection {
    #[error("No authMethods in response")]
    NoMethods,

    #[error("No auth method with type 'agent' or 'terminal'. Found types: {}", .0.join(", "))]
    Unsupported(Vec<String>),

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// At least one method must be of a supported type
pub fn validate_auth_methods(methods: &[AuthMethod]) -> Result<usize, AuthRejection> {
    if methods.is_empty() {
        return Err(AuthRejection::NoMethods);
    }
    let supported = methods
        .iter()
        .filter(|m| SUPPORTED_AUTH_TYPES.contains(&m.method_type.as_str()))
        .count();
    if supported == 0 {
        return Err(AuthRejection::Unsupported(
            methods.iter().map(|m| m.method_type.clone()).collect(),
        ));
    }
    Ok(supported)
}

/// Runs an agent from a plan and returns its initialize result
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn initialize(&self, plan: &LaunchPlan) -> anyhow::Result<Value>;
}

/// Drive a verifier and judge the auth methods it reports
pub async fn verify_auth(
    verifier: &dyn AuthVerifier,
    plan: &LaunchPlan,
) -> Result<Vec<AuthMethod>, AuthRejection> {
    let result = verifier
        .initialize(plan)
        .await
        .map_err(|e| AuthRejection::Handshake(format!("{:#}", e)))?;

    let methods = parse_auth_methods(result.get("authMethods").unwrap_or(&Value::Null));
    validate_auth_methods(&methods)?;
    tracing::debug!(agent = %plan.agent_id, kind = %plan.kind, methods = methods.len(), "auth methods accepted");
    Ok(methods)
}
