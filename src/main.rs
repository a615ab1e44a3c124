//! Test App Harness CLI
//!
//! Brings a test app described in YAML up in a namespace, tears it down,
//! or reports on its pods.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use testapp_harness::{k8s::KubeClusterClient, AppDescription, AppManager, HarnessConfig};

/// Lifecycle manager for end-to-end test apps
#[derive(Parser)]
#[command(name = "testapp-harness")]
#[command(author, version, about = "Lifecycle manager for end-to-end test apps", long_about = None)]
struct Cli {
    /// Namespace the app lives in
    #[arg(long, short, default_value = "testapp-e2e")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy the app and wait until it is ready
    Up {
        /// App description (YAML)
        app: PathBuf,
    },

    /// Capture container logs and delete the app
    Down {
        /// App description (YAML)
        app: PathBuf,

        /// Return without waiting for the resources to be gone
        #[arg(long)]
        no_wait: bool,
    },

    /// Print pods, restarts, and resource peaks
    Status {
        /// App description (YAML)
        app: PathBuf,
    },
}

impl Commands {
    fn app_file(&self) -> &Path {
        match self {
            Commands::Up { app } | Commands::Down { app, .. } | Commands::Status { app } => app,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = HarnessConfig::load()?;
    tracing::info!("Configuration loaded");

    let app = load_app(cli.command.app_file())?;
    let namespace = cli.namespace.as_str();

    let client = KubeClusterClient::new(namespace).await?;
    tracing::info!(namespace, app = %app.app_name, "Connected to Kubernetes cluster");

    let mut manager = AppManager::new(Arc::new(client), namespace, app, config);

    match cli.command {
        Commands::Up { .. } => {
            manager.init().await?;
            if manager.app().ingress_enabled {
                match manager.acquire_external_url().await {
                    Some(url) => println!("{}", url),
                    None => tracing::warn!("No external address for the app"),
                }
            }
        }
        Commands::Down { no_wait, .. } => {
            manager.dispose(!no_wait).await?;
            tracing::info!(app = %manager.name(), "App removed");
        }
        Commands::Status { .. } => {
            for pod in manager.get_host_details().await? {
                println!("{}\t{}", pod.name, pod.ip);
            }
            println!("restarts\t{}", manager.get_total_restarts().await?);

            let (cpu, memory) = manager.get_cpu_and_memory(false).await?;
            println!("app\t{}m\t{:.2}MB", cpu, memory);
            let (cpu, memory) = manager.get_cpu_and_memory(true).await?;
            println!("sidecar\t{}m\t{:.2}MB", cpu, memory);
        }
    }

    Ok(())
}

fn load_app(path: &Path) -> Result<AppDescription> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    AppDescription::from_yaml(&yaml)
        .with_context(|| format!("invalid app description in {}", path.display()))
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
    fn test_namespace_defaults() {
        let cli = Cli::try_parse_from(["testapp-harness", "up", "app.yaml"]).unwrap();
        assert_eq!(cli.namespace, "testapp-e2e");
        assert_eq!(cli.command.app_file(), Path::new("app.yaml"));
    }

    #[test]
    fn test_down_options() {
        let cli = Cli::try_parse_from([
            "testapp-harness",
            "--namespace",
            "e2e",
            "down",
            "app.yaml",
            "--no-wait",
        ])
        .unwrap();
        assert_eq!(cli.namespace, "e2e");
        assert!(matches!(cli.command, Commands::Down { no_wait: true, .. }));
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Cli::try_parse_from(["testapp-harness", "restart", "app.yaml"]).is_err());
        assert!(Cli::try_parse_from(["testapp-harness", "up"]).is_err());
    }

    #[test]
    fn test_load_app() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.yaml");
        std::fs::write(&path, "appName: echo\nimageName: e2e-echo\n").unwrap();

        assert_eq!(load_app(&path).unwrap().app_name, "echo");
        assert!(load_app(&dir.path().join("missing.yaml")).is_err());
    }
}
