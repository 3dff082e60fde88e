//! Per-run orchestration context
//!
//! A [`State`] is created once per install or reset run, passed by reference
//! to the orchestrator, and dropped when the run ends. The normalized spec is
//! shared read-only; everything else is filled in as phases complete.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::crd::ClusterSpec;
use crate::machinedeployment::FleetClient;
use crate::pki::{CertificateAuthority, PkiBundle};

/// What a host task produced
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskOutput {
    /// Command output worth keeping (join command, kubeconfig, ...)
    pub stdout: String,
    /// Files fetched from the host, keyed by remote path
    pub files: BTreeMap<String, Vec<u8>>,
}

impl TaskOutput {
    /// Output carrying only stdout
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            files: BTreeMap::new(),
        }
    }
}

/// Results recorded for one host, keyed by phase name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostResult {
    /// Output of every phase that succeeded on the host
    pub outputs: BTreeMap<String, TaskOutput>,
}

/// Orchestration context for a single run
pub struct State {
    /// Normalized cluster document
    pub spec: Arc<ClusterSpec>,
    /// Client for the cluster's machine API, available once a kubeconfig was fetched
    pub fleet: Option<Arc<dyn FleetClient>>,
    /// Cluster CA, loaded once after the PKI bundle is fetched
    pub ca: Option<Arc<CertificateAuthority>>,
    /// PKI files fetched from the leader
    pub pki: PkiBundle,
    /// Admin kubeconfig fetched from the leader
    pub kubeconfig: Option<String>,
    /// Per-host results, indexed by host ID
    pub results: Vec<HostResult>,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("cluster", &self.spec.name)
            .field("fleet", &self.fleet.is_some())
            .field("ca", &self.ca.is_some())
            .field("pki_entries", &self.pki.len())
            .field("results", &self.results)
            .finish()
    }
}

impl State {
    /// Create a context for a normalized spec
    pub fn new(spec: ClusterSpec) -> Self {
        let slots = spec.hosts().map(|h| h.id + 1).max().unwrap_or(0);
        Self {
            spec: Arc::new(spec),
            fleet: None,
            ca: None,
            pki: PkiBundle::new(),
            kubeconfig: None,
            results: vec![HostResult::default(); slots],
        }
    }

    /// Use an existing fleet client instead of building one from the kubeconfig
    pub fn with_fleet(mut self, fleet: Arc<dyn FleetClient>) -> Self {
        self.fleet = Some(fleet);
        self
    }

    /// Output of `phase` on host `host_id`
    pub fn output(&self, host_id: usize, phase: &str) -> Option<&TaskOutput> {
        self.results.get(host_id)?.outputs.get(phase)
    }

    /// Output of `phase` on the leader
    pub fn leader_output(&self, phase: &str) -> Option<&TaskOutput> {
        let leader = self.spec.leader()?;
        self.output(leader.id, phase)
    }

    /// Record the output of `phase` on host `host_id`
    pub fn record(&mut self, host_id: usize, phase: &str, output: TaskOutput) {
        if host_id >= self.results.len() {
            self.results.resize_with(host_id + 1, HostResult::default);
        }
        self.results[host_id]
            .outputs
            .insert(phase.to_string(), output);
    }
}
