//! Keel installer - drives install and reset runs
//!
//! The installer is the thin layer between the CLI and the orchestrator:
//!
//! 1. Load the cluster document
//! 2. Normalize it and validate the result
//! 3. Build the per-run [`State`]
//! 4. Run the install (or reset) phase catalogue through the [`Orchestrator`]
//!
//! Validation happens before any host is contacted, so configuration
//! defects never leave a half-provisioned cluster behind.
//!
//! # Example
//!
//! ```no_run
//! use keel::config::RunConfig;
//! use keel::install::Installer;
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), keel::Error> {
//!     let config = RunConfig::from_env()?;
//!     let mut installer = Installer::from_file(Path::new("cluster.yaml"), &config).await?;
//!     let status = installer.install(&CancellationToken::new()).await;
//!     println!("{status:?}");
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{load_cluster_spec, RunConfig};
use crate::crd::ClusterSpec;
use crate::defaults::normalize;
use crate::machinedeployment::FleetClient;
use crate::phases::{install_phases, reset_phases, Orchestrator, Phase, RunStatus};
use crate::ssh::OpenSshConnector;
use crate::state::State;
use crate::Error;

/// Provisions or resets the cluster described by one document
pub struct Installer {
    state: State,
    orchestrator: Orchestrator,
}

impl Installer {
    /// Normalize and validate `spec`, then prepare a run over SSH
    pub fn new(mut spec: ClusterSpec, config: &RunConfig) -> Result<Self, Error> {
        normalize(&mut spec);
        spec.validate()?;

        let connector = Arc::new(OpenSshConnector::new(config.ssh_options()));
        let orchestrator = Orchestrator::new(connector)
            .with_retry(config.retry_policy())
            .with_concurrency(config.concurrency);

        info!(
            cluster = %spec.name,
            hosts = spec.host_count(),
            pools = spec.dynamic_workers.len(),
            "Cluster document validated"
        );

        Ok(Self {
            state: State::new(spec),
            orchestrator,
        })
    }

    /// Load the document at `path` and prepare a run
    pub async fn from_file(path: &Path, config: &RunConfig) -> Result<Self, Error> {
        let spec = load_cluster_spec(path).await?;
        Self::new(spec, config)
    }

    /// Replace the orchestrator (custom connector or retry policy)
    pub fn with_orchestrator(mut self, orchestrator: Orchestrator) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    /// Use an existing fleet client instead of building one from the kubeconfig
    pub fn with_fleet(mut self, fleet: Arc<dyn FleetClient>) -> Self {
        self.state.fleet = Some(fleet);
        self
    }

    /// The normalized cluster document
    pub fn spec(&self) -> &ClusterSpec {
        &self.state.spec
    }

    /// Run state, including outputs of completed phases
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Provision the cluster
    pub async fn install(&mut self, cancel: &CancellationToken) -> RunStatus {
        let phases = install_phases(&self.state.spec);
        self.run("install", &phases, cancel).await
    }

    /// Tear the cluster down on every static host
    pub async fn reset(&mut self, cancel: &CancellationToken) -> RunStatus {
        let phases = reset_phases(&self.state.spec);
        self.run("reset", &phases, cancel).await
    }

    async fn run(&mut self, operation: &str, phases: &[Phase], cancel: &CancellationToken) -> RunStatus {
        let start = Instant::now();
        info!(cluster = %self.state.spec.name, operation, phases = phases.len(), "Starting run");

        let status = self.orchestrator.run(&mut self.state, phases, cancel).await;
        let elapsed = start.elapsed().as_secs();
        match &status {
            RunStatus::Succeeded => {
                info!(cluster = %self.state.spec.name, operation, elapsed_secs = elapsed, "Run completed")
            }
            RunStatus::Failed(failure) => error!(
                cluster = %self.state.spec.name,
                operation,
                phase = %failure.phase,
                host = failure.host.as_deref().unwrap_or("-"),
                error = %failure.error,
                "Run failed"
            ),
            RunStatus::Cancelled { phase } => {
                warn!(cluster = %self.state.spec.name, operation, phase = %phase, "Run cancelled")
            }
        }
        status
    }
}
