//! CLI commands for acp-registry
//!
//! Each command returns the process exit code; hard failures (unreadable
//! config, unwritable `dist/`) surface as errors instead.

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::path::Path;

use crate::config::{github_token, load_config, RegistryPaths};
use crate::launch::plan_all;
use crate::models::{AgentManifest, Platform};
use crate::reconcile::{reconcile, ReconcileOptions, ReconcileReport};
use crate::registry::{build, BuildOptions, BuildReport, INDEX_FILE};
use crate::scanner::scan;
use crate::upstream::{HttpUpstream, Prober};

/// Validate every agent and publish `dist/`
pub async fn build_command(
    root: &Path,
    lenient: bool,
    skip_accessibility: bool,
    base_url: Option<String>,
) -> Result<i32> {
    let paths = RegistryPaths::new(root);
    let mut config = load_config(&paths)?;
    if let Some(base_url) = base_url.filter(|u| !u.is_empty()) {
        config.set_base_url(&base_url);
    }

    let check_accessibility = !skip_accessibility;
    // Probes hit manifest-supplied hosts, so no credentials
    let upstream = if check_accessibility {
        Some(HttpUpstream::new(config.upstream.clone(), None)?)
    } else {
        println!("⚠ Accessibility checks disabled");
        None
    };
    let prober = upstream.as_ref().map(|u| u as &dyn Prober);

    println!("Building registry from {}", paths.root.display());
    println!();

    let options = BuildOptions {
        lenient,
        check_accessibility,
    };
    let report = build(&paths, &config, options, prober).await?;
    print_build_report(&report, &paths);

    Ok(if report.has_failures() { 1 } else { 0 })
}

fn print_build_report(report: &BuildReport, paths: &RegistryPaths) {
    for entry in &report.entries {
        let findings = &entry.findings;
        if !findings.is_valid() {
            println!("✗ {}/", entry.dir());
            for violation in &findings.violations {
                println!("    ✗ {}", violation);
            }
        } else if let Some(reason) = &entry.quarantined {
            println!("⚠ {}/ quarantined: {}", entry.dir(), reason);
        } else if entry.duplicate {
            println!("✗ {}/ (duplicate id)", entry.dir());
        } else {
            println!("✓ {}/", entry.dir());
        }
        for warning in &findings.warnings {
            println!("    ⚠ {}", warning.message);
        }
    }

    for error in &report.load_errors {
        let marker = if error.is_fatal() { "✗" } else { "⚠" };
        println!("{} {}", marker, error);
    }

    for duplicate in &report.duplicates {
        println!("✗ {}", duplicate.violation());
    }

    println!();
    let published = report.index.as_ref().map_or(0, |i| i.agents.len());
    let violations = report.violation_count();
    let warnings = report.warning_count();

    if report.published {
        println!(
            "✓ Wrote {} with {} agent(s)",
            paths.dist.join(INDEX_FILE).display(),
            published
        );
    } else {
        println!("✗ Nothing written to {}", paths.dist.display());
    }

    if violations > 0 {
        println!("✗ {} violation(s), {} warning(s)", violations, warnings);
    } else if warnings > 0 {
        println!("⚠ {} warning(s)", warnings);
    } else {
        println!("✓ All agents valid");
    }
}

/// Report (and optionally apply) upstream version updates
pub async fn update_command(
    root: &Path,
    apply: bool,
    agents: Option<Vec<String>>,
    json_output: bool,
) -> Result<i32> {
    let paths = RegistryPaths::new(root);
    let config = load_config(&paths)?;
    let upstream = HttpUpstream::new(config.upstream.clone(), github_token())?;

    let options = ReconcileOptions {
        agents,
        apply,
        concurrency: config.upstream_concurrency,
    };
    let report = reconcile(&paths, &config, &upstream, &options).await?;

    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize update report")?
        );
    } else {
        print_update_report(&report, apply);
    }

    Ok(report.exit_code())
}

fn print_update_report(report: &ReconcileReport, apply: bool) {
    if report.updates.is_empty() {
        println!("✓ No updates available ({} agent(s) up to date)", report.up_to_date.len());
    } else {
        println!("Updates available:");
        for update in &report.updates {
            let marker = if update.applied { "✓" } else { "⚠" };
            println!(
                "  {} {}: {} -> {}",
                marker, update.agent_id, update.current, update.candidate
            );
        }
        if !apply {
            println!();
            println!("Run with --apply to update the manifests.");
        }
    }

    for skipped in &report.skipped {
        println!("  ⚠ {} skipped: {}", skipped.agent_id, skipped.reason);
    }

    if !report.errors.is_empty() {
        println!();
        println!("Errors:");
        for error in &report.errors {
            println!("  ✗ {}: {}", error.agent_id, error.message);
        }
    }
}

/// Print the launch plans for one agent as JSON
pub fn launch_plan_command(root: &Path, id: &str, platform: Option<Platform>) -> Result<i32> {
    let paths = RegistryPaths::new(root);
    let config = load_config(&paths)?;

    let scanned = scan(&paths.scan_roots(&config), &[]);
    let Some(loaded) = scanned.manifests.iter().find(|m| m.declared_id() == Some(id)) else {
        bail!("Agent not found: {}", id);
    };
    let manifest = AgentManifest::from_value(&loaded.raw)
        .with_context(|| format!("Failed to parse {}", loaded.path.display()))?;

    let plans = plan_all(&manifest, platform);
    let any_ok = plans.iter().any(|(_, plan)| plan.is_ok());

    let rendered: Vec<serde_json::Value> = plans
        .into_iter()
        .map(|(kind, plan)| match plan {
            Ok(plan) => json!(plan),
            Err(e) => json!({ "agent_id": id, "kind": kind, "error": e.to_string() }),
        })
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&rendered).context("Failed to serialize launch plans")?
    );

    Ok(if any_ok { 0 } else { 1 })
}
