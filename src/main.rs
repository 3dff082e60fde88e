//! Keel - declarative multi-node Kubernetes provisioning over SSH

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use keel::config::{cluster_schema, load_cluster_spec, RunConfig};
use keel::defaults::normalize;
use keel::install::Installer;
use keel::machinedeployment::render_manifest;
use keel::phases::RunStatus;
use keel::telemetry::{init_tracing, LogFormat};

/// Keel - provision Kubernetes clusters over SSH from a single document
#[derive(Parser, Debug)]
#[command(name = "keel", version, about, long_about = None)]
struct Cli {
    /// Log format (text or json)
    #[arg(long, global = true, env = "KEEL_LOG_FORMAT", default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision the cluster described by the document
    ///
    /// Prepares every host, bootstraps the control plane with kubeadm, joins
    /// the remaining hosts and applies MachineDeployments for dynamic worker
    /// pools. Re-running against a provisioned cluster is safe.
    Install(RunArgs),

    /// Tear down Kubernetes on every static host
    ///
    /// MachineDeployments and the machines they created are left untouched.
    Reset(RunArgs),

    /// Inspect the cluster document
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Print the MachineDeployments generated for dynamic worker pools
    Machinedeployments(DocumentArgs),
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the document with every default filled in
    Print(DocumentArgs),

    /// Print the JSON schema of the cluster document
    Schema,
}

/// Arguments naming the cluster document
#[derive(Parser, Debug)]
struct DocumentArgs {
    /// Path to the KeelCluster document
    #[arg(short = 'f', long = "config")]
    config_file: PathBuf,
}

/// Arguments of install and reset runs
#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    document: DocumentArgs,

    /// Hosts worked on at once (overrides KEEL_CONCURRENCY)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Limit for a single remote command, in seconds (overrides KEEL_COMMAND_TIMEOUT_SECS)
    #[arg(long)]
    command_timeout_secs: Option<u64>,

    /// Attempts per host operation (overrides KEEL_RETRY_ATTEMPTS)
    #[arg(long)]
    retry_attempts: Option<u32>,
}

impl RunArgs {
    fn run_config(&self) -> anyhow::Result<RunConfig> {
        let mut config = RunConfig::from_env()?;
        if let Some(n) = self.concurrency {
            config.concurrency = n.max(1);
        }
        if let Some(secs) = self.command_timeout_secs {
            config.command_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = self.retry_attempts {
            config.retry_attempts = n.max(1);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(LogFormat::parse(Some(&cli.log_format)));

    match cli.command {
        Commands::Install(args) => run(args, Operation::Install).await,
        Commands::Reset(args) => run(args, Operation::Reset).await,
        Commands::Config(ConfigCommands::Print(args)) => print_config(&args.config_file).await,
        Commands::Config(ConfigCommands::Schema) => {
            println!("{}", cluster_schema()?);
            Ok(())
        }
        Commands::Machinedeployments(args) => print_machine_deployments(&args.config_file).await,
    }
}

#[derive(Clone, Copy, Debug)]
enum Operation {
    Install,
    Reset,
}

async fn run(args: RunArgs, operation: Operation) -> anyhow::Result<()> {
    let config = args.run_config()?;
    let mut installer = Installer::from_file(&args.document.config_file, &config).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing running commands before stopping");
            on_signal.cancel();
        }
    });

    let status = match operation {
        Operation::Install => installer.install(&cancel).await,
        Operation::Reset => installer.reset(&cancel).await,
    };

    match status {
        RunStatus::Succeeded => {
            info!(cluster = %installer.spec().name, ?operation, "Done");
            Ok(())
        }
        RunStatus::Failed(failure) => Err(anyhow::anyhow!("{}", failure)),
        RunStatus::Cancelled { phase } => Err(anyhow::anyhow!("cancelled before completing phase {}", phase)),
    }
}

async fn print_config(path: &Path) -> anyhow::Result<()> {
    let mut spec = load_cluster_spec(path).await?;
    normalize(&mut spec);
    let yaml = serde_yaml::to_string(&spec)
        .map_err(|e| anyhow::anyhow!("Failed to serialize cluster document: {}", e))?;
    print!("{yaml}");
    Ok(())
}

async fn print_machine_deployments(path: &Path) -> anyhow::Result<()> {
    let mut spec = load_cluster_spec(path).await?;
    normalize(&mut spec);
    spec.validate()?;
    print!("{}", render_manifest(&spec)?);
    Ok(())
}
