use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use k3sbox::Cluster;
use k3sbox::config::{self, ClusterConfig, ExistingPolicy};
use k3sbox::docker::{DockerCli, ensure_available};
use k3sbox::image::{ImageRequests, ImportOutcome};
use k3sbox::restart::RestartOutcome;

#[derive(Parser)]
#[command(author, version, about = "Throwaway k3s clusters in Docker", long_about = None)]
struct Cli {
    /// Configuration file (default: ./.k3sbox.yaml if present)
    #[arg(long, global = true, env = "K3SBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Host directory shared with the cluster container
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    /// Log progress at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create (or reuse) and start the cluster, then wait until it is ready
    Up {
        /// What to do when a cluster container already exists
        #[arg(long, value_enum)]
        on_existing: Option<ExistingPolicy>,
    },
    /// Remove the cluster container and its cache volume
    Down,
    /// Import images into the cluster
    Images {
        /// Image the cluster pulls from its registry
        #[arg(long = "registry", value_name = "IMAGE")]
        registry: Vec<String>,
        /// Image tar archive on this host
        #[arg(long = "archive", value_name = "PATH")]
        archives: Vec<PathBuf>,
        /// Image taken from the local Docker daemon
        #[arg(long = "daemon", value_name = "IMAGE")]
        daemon: Vec<String>,
        /// Pull daemon images even if already present locally
        #[arg(long)]
        always_pull: bool,
    },
    /// Apply the manifests staged in <workdir>/manifests
    Apply,
    /// Wait until pods, deployments and statefulsets are ready
    Wait,
    /// Rollout-restart workloads given as kind[/namespace]/name
    Restart {
        #[arg(required = true)]
        resources: Vec<String>,
    },
    /// Run a command inside the cluster container
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "k3sbox=debug" } else { "k3sbox=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<ClusterConfig> {
    let mut config = match &cli.config {
        Some(path) => config::load_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let cwd = std::env::current_dir().context("resolving working directory")?;
            config::load(&cwd).context("loading configuration")?
        }
    };
    if let Some(workdir) = &cli.workdir {
        config.workdir = workdir.clone();
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(&cli)?;
    match &cli.command {
        Command::Up {
            on_existing: Some(policy),
        } => config.on_existing = *policy,
        Command::Images {
            always_pull: true, ..
        } => config.always_pull = true,
        _ => {}
    }

    ensure_available(&config.docker_binary).context("docker is not usable")?;
    let engine = Arc::new(DockerCli::new(config.docker_binary.clone()));
    let cluster = Cluster::new(engine, config);

    match cli.command {
        Command::Up { .. } => {
            let handle = cluster.up().context("bringing the cluster up")?;
            info!(
                id = %handle.id,
                kubeconfig = %cluster.config().kubeconfig_path().display(),
                "ready"
            );
        }
        Command::Down => cluster.down().context("tearing the cluster down")?,
        Command::Images {
            registry,
            archives,
            daemon,
            ..
        } => {
            let requests = ImageRequests {
                registry,
                archives,
                daemon,
            };
            if requests.is_empty() {
                bail!("no images given; use --registry, --archive or --daemon");
            }
            for report in cluster.load_images(&requests).context("importing images")? {
                let outcome = match report.outcome {
                    ImportOutcome::Imported => "imported",
                    ImportOutcome::SkippedAlreadyPresent => "already present",
                    ImportOutcome::Failed => "failed",
                };
                info!(source = %report.source, "{outcome}");
            }
        }
        Command::Apply => {
            cluster.apply_manifests().context("applying manifests")?;
        }
        Command::Wait => cluster.wait_pods().context("waiting for workloads")?,
        Command::Restart { resources } => match cluster.restart(&resources)? {
            RestartOutcome::Skipped => info!("skipped, cluster was just created"),
            RestartOutcome::Restarted(n) => info!(count = n, "restarted"),
        },
        Command::Exec { command } => {
            let result = cluster.exec(command).context("running command in cluster")?;
            for line in result.messages {
                println!("{line}");
            }
        }
    }
    Ok(())
}
