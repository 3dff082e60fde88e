//! Phase orchestration
//!
//! An install or reset run is an ordered list of [`Phase`]s. Each phase runs
//! one [`HostTask`] on a set of hosts picked by its [`HostSelector`], with
//! the fan-out shape given by its [`Ordering`]. The [`Orchestrator`] executes
//! phases strictly one after another and stops at the first phase that fails
//! on any host, unless that phase is best-effort.
//!
//! Tasks receive read-only access to the run [`State`] while the phase is in
//! flight. Their outputs are collected per host and committed to the state
//! by the control task once the whole phase has finished, followed by the
//! task's [`HostTask::finalize`] hook.

mod install;
mod orchestrator;
mod script;

use std::sync::Arc;

use async_trait::async_trait;

use crate::crd::{ClusterSpec, HostConfig};
use crate::ssh::Executor;
use crate::state::{State, TaskOutput};
use crate::Error;

pub use install::{
    install_phases, reset_phases, FetchKubeconfigTask, FetchPkiTask, JoinTokenTask,
    MachineDeploymentsTask, ServiceCertificatesTask, UploadPkiTask, ADMIN_KUBECONFIG, PKI_FILES,
};
pub use orchestrator::{Orchestrator, DEFAULT_CONCURRENCY};
pub use script::{render, HostView, JoinView, ScriptContext, ScriptTask, TemplateError};

/// Which hosts a phase runs on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostSelector {
    /// The control-plane leader only
    Leader,
    /// Every control-plane host
    ControlPlane,
    /// Control-plane hosts other than the leader
    Followers,
    /// Hosts in the static worker group
    StaticWorkers,
    /// Every static host
    Everyone,
}

impl HostSelector {
    /// Hosts matched by this selector, leader first, then in ID order
    pub fn select<'a>(&self, spec: &'a ClusterSpec) -> Vec<&'a HostConfig> {
        let mut hosts: Vec<&HostConfig> = match self {
            Self::Leader => spec.leader().into_iter().collect(),
            Self::ControlPlane => spec.control_plane.hosts.iter().collect(),
            Self::Followers => spec.followers().collect(),
            Self::StaticWorkers => spec.static_workers.hosts.iter().collect(),
            Self::Everyone => spec.hosts().collect(),
        };
        hosts.sort_by_key(|h| (!h.is_leader, h.id));
        hosts
    }
}

/// How the selected hosts are scheduled within a phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Ordering {
    /// All hosts concurrently, bounded by the orchestrator's concurrency
    #[default]
    Parallel,
    /// First selected host to completion, then the rest concurrently
    LeaderFirst,
    /// One host at a time, first selected host first
    Serial,
}

/// Per-host view handed to a running task
pub struct TaskContext<'a> {
    /// Host the task runs on
    pub host: &'a HostConfig,
    /// Run state as of the start of the phase
    pub state: &'a State,
    /// Name of the running phase
    pub phase: &'a str,
}

impl TaskContext<'_> {
    /// The normalized cluster document
    pub fn spec(&self) -> &ClusterSpec {
        &self.state.spec
    }
}

/// Unit of work executed on each host of a phase
#[async_trait]
pub trait HostTask: Send + Sync {
    /// Run on one host
    async fn run(&self, ctx: &TaskContext<'_>, exec: &dyn Executor) -> Result<TaskOutput, Error>;

    /// Runs on the control task after every host succeeded and outputs
    /// were committed
    async fn finalize(&self, _state: &mut State) -> Result<(), Error> {
        Ok(())
    }
}

/// A named step of an install or reset run
#[derive(Clone)]
pub struct Phase {
    /// Phase name, used in logs, errors and as the key of recorded outputs
    pub name: String,
    /// Hosts the phase runs on
    pub selector: HostSelector,
    /// Scheduling of the selected hosts
    pub ordering: Ordering,
    /// Failures are logged and do not abort the run
    pub best_effort: bool,
    /// Work done on each host
    pub task: Arc<dyn HostTask>,
}

impl Phase {
    /// Parallel, fail-fast phase
    pub fn new(name: impl Into<String>, selector: HostSelector, task: impl HostTask + 'static) -> Self {
        Self {
            name: name.into(),
            selector,
            ordering: Ordering::Parallel,
            best_effort: false,
            task: Arc::new(task),
        }
    }

    /// Use the given ordering
    pub fn ordered(mut self, ordering: Ordering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Do not abort the run when this phase fails
    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }
}

impl std::fmt::Debug for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase")
            .field("name", &self.name)
            .field("selector", &self.selector)
            .field("ordering", &self.ordering)
            .field("best_effort", &self.best_effort)
            .finish()
    }
}

/// Details of the phase that stopped a run
#[derive(Debug)]
pub struct PhaseFailure {
    /// Phase that failed
    pub phase: String,
    /// ID of the first failed host; `None` when finalization failed
    pub host_id: Option<usize>,
    /// Address of the first failed host
    pub host: Option<String>,
    /// IDs of every host that failed in the phase
    pub failed_hosts: Vec<usize>,
    /// Error of the first failed host
    pub error: Error,
}

impl std::fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.host {
            Some(host) => write!(f, "phase {} failed on {}: {}", self.phase, host, self.error),
            None => write!(f, "phase {} failed: {}", self.phase, self.error),
        }
    }
}

/// Terminal status of a run
#[derive(Debug)]
pub enum RunStatus {
    /// Every phase completed
    Succeeded,
    /// A phase failed on at least one host
    Failed(PhaseFailure),
    /// Cancellation was requested before or during the named phase
    Cancelled {
        /// First phase that did not complete
        phase: String,
    },
}

impl RunStatus {
    /// Whether the run completed
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}
