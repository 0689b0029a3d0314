//! acp-registry - catalog tooling for ACP agents
//!
//! Validates agent manifests, publishes the aggregated registry and keeps
//! manifest versions in step with upstream releases.

use std::path::PathBuf;

use acp_registry::commands;
use acp_registry::config::{ENV_BASE_URL, ENV_SKIP_URL_VALIDATION};
use acp_registry::models::Platform;
use clap::builder::FalseyValueParser;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "acp-registry")]
#[command(author, version, about = "Validate, publish and version-reconcile a catalog of ACP agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate every agent and write dist/registry.json
    Build {
        /// Registry root directory
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Publish the valid agents even when some entries fail
        #[arg(long)]
        lenient: bool,

        /// Do not probe archive URLs and packages upstream
        #[arg(long, env = ENV_SKIP_URL_VALIDATION, value_parser = FalseyValueParser::new())]
        skip_accessibility: bool,

        /// Prefix for published icon URLs (overrides registry.toml)
        #[arg(long, env = ENV_BASE_URL)]
        base_url: Option<String>,
    },

    /// Check npm, PyPI and GitHub for newer agent versions
    Update {
        /// Registry root directory
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Rewrite manifests to the new versions
        #[arg(long)]
        apply: bool,

        /// Comma-separated agent ids (default: all)
        #[arg(long, value_delimiter = ',')]
        agents: Option<Vec<String>>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the launch plans for an agent as JSON
    LaunchPlan {
        /// Agent id
        id: String,

        /// Registry root directory
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Target platform for binaries (default: this machine)
        #[arg(long)]
        platform: Option<Platform>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Build {
            root,
            lenient,
            skip_accessibility,
            base_url,
        } => commands::build_command(&root, lenient, skip_accessibility, base_url).await?,
        Commands::Update {
            root,
            apply,
            agents,
            json,
        } => commands::update_command(&root, apply, agents, json).await?,
        Commands::LaunchPlan { id, root, platform } => {
            commands::launch_plan_command(&root, &id, platform)?
        }
    };

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_build_switches_read_environment() {
        std::env::set_var(ENV_SKIP_URL_VALIDATION, "1");
        std::env::set_var(ENV_BASE_URL, "https://cdn.example.com/acp");
        let cli = Cli::try_parse_from(["acp-registry", "build"]).unwrap();
        match cli.command {
            Commands::Build {
                skip_accessibility,
                base_url,
                ..
            } => {
                assert!(skip_accessibility);
                assert_eq!(base_url.as_deref(), Some("https://cdn.example.com/acp"));
            }
            _ => panic!("expected build"),
        }

        std::env::set_var(ENV_SKIP_URL_VALIDATION, "false");
        let cli = Cli::try_parse_from(["acp-registry", "build", "--base-url", "https://other.dev"]).unwrap();
        match cli.command {
            Commands::Build {
                skip_accessibility,
                base_url,
                ..
            } => {
                assert!(!skip_accessibility);
                assert_eq!(base_url.as_deref(), Some("https://other.dev"));
            }
            _ => panic!("expected build"),
        }

        std::env::remove_var(ENV_SKIP_URL_VALIDATION);
        std::env::remove_var(ENV_BASE_URL);
    }
}
