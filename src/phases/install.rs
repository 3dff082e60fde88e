//! Install and reset phase catalogues
//!
//! The install run brings a set of bare hosts to a working cluster:
//!
//! 1. host preparation (preflight, container runtime, Kubernetes packages)
//! 2. `kubeadm init` on the leader
//! 3. PKI fetched from the leader and pushed to the other control-plane hosts
//! 4. followers join one at a time, then static workers join in parallel
//! 5. cluster-side objects (service certificates, MachineDeployments)
//! 6. node labels and taints, best effort
//!
//! Every script is written to be re-runnable on a host where it already
//! succeeded.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::script::{ScriptTask, JOIN_TOKEN_PHASE};
use super::{HostSelector, HostTask, Ordering, Phase, TaskContext};
use crate::crd::ClusterSpec;
use crate::machinedeployment::{apply_machine_deployments, KubeFleetClient};
use crate::pki::{CertificateAuthority, PkiBundle};
use crate::ssh::Executor;
use crate::state::{State, TaskOutput};
use crate::Error;

/// PKI files copied from the leader to the other control-plane hosts
pub const PKI_FILES: &[&str] = &[
    "/etc/kubernetes/pki/ca.crt",
    "/etc/kubernetes/pki/ca.key",
    "/etc/kubernetes/pki/sa.key",
    "/etc/kubernetes/pki/sa.pub",
    "/etc/kubernetes/pki/front-proxy-ca.crt",
    "/etc/kubernetes/pki/front-proxy-ca.key",
    "/etc/kubernetes/pki/etcd/ca.crt",
    "/etc/kubernetes/pki/etcd/ca.key",
];

/// Admin kubeconfig written by `kubeadm init`
pub const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";

const KUBEADM_CONFIG_PATH: &str = "/etc/keel/kubeadm-config.yaml";
const METRICS_SERVER_SECRET_PATH: &str = "/etc/keel/metrics-server-serving-cert.yaml";

const FETCH_PKI_PHASE: &str = "fetch-pki";
const FETCH_KUBECONFIG_PHASE: &str = "fetch-kubeconfig";

const PREFLIGHT: &str = include_str!("../../templates/scripts/preflight.sh");
const CONTAINER_RUNTIME: &str = include_str!("../../templates/scripts/container-runtime.sh");
const KUBERNETES_BINARIES: &str = include_str!("../../templates/scripts/kubernetes-binaries.sh");
const KUBEADM_INIT: &str = include_str!("../../templates/scripts/kubeadm-init.sh");
const KUBEADM_CONFIG: &str = include_str!("../../templates/kubeadm-config.yaml");
const JOIN_CONTROL_PLANE: &str = include_str!("../../templates/scripts/join-control-plane.sh");
const JOIN_WORKER: &str = include_str!("../../templates/scripts/join-worker.sh");
const NODE_TAINTS: &str = include_str!("../../templates/scripts/node-taints.sh");
const RESET: &str = include_str!("../../templates/scripts/reset.sh");

/// Ordered install phases for a normalized cluster document
pub fn install_phases(spec: &ClusterSpec) -> Vec<Phase> {
    let mut phases = vec![
        Phase::new("preflight", HostSelector::Everyone, ScriptTask::new("preflight", PREFLIGHT)),
        Phase::new(
            "container-runtime",
            HostSelector::Everyone,
            ScriptTask::new("container-runtime", CONTAINER_RUNTIME),
        ),
        Phase::new(
            "kubernetes-binaries",
            HostSelector::Everyone,
            ScriptTask::new("kubernetes-binaries", KUBERNETES_BINARIES),
        ),
        Phase::new(
            "kubeadm-init",
            HostSelector::Leader,
            ScriptTask::new("kubeadm-init", KUBEADM_INIT).with_upload(
                KUBEADM_CONFIG_PATH,
                KUBEADM_CONFIG,
                0o600,
            ),
        ),
        Phase::new(FETCH_PKI_PHASE, HostSelector::Leader, FetchPkiTask),
        Phase::new("distribute-pki", HostSelector::Followers, UploadPkiTask),
        Phase::new(JOIN_TOKEN_PHASE, HostSelector::Leader, JoinTokenTask),
        Phase::new(
            "join-control-plane",
            HostSelector::Followers,
            ScriptTask::new("join-control-plane", JOIN_CONTROL_PLANE),
        )
        .ordered(Ordering::Serial),
        Phase::new(
            "join-static-workers",
            HostSelector::StaticWorkers,
            ScriptTask::new("join-static-workers", JOIN_WORKER),
        ),
        Phase::new(FETCH_KUBECONFIG_PHASE, HostSelector::Leader, FetchKubeconfigTask),
    ];

    if spec.metrics_server_enabled() {
        phases.push(Phase::new(
            "service-certificates",
            HostSelector::Leader,
            ServiceCertificatesTask,
        ));
    }

    if applies_machine_deployments(spec) {
        phases.push(Phase::new(
            "machine-deployments",
            HostSelector::Leader,
            MachineDeploymentsTask,
        ));
    }

    phases.push(
        Phase::new("node-taints", HostSelector::Leader, ScriptTask::new("node-taints", NODE_TAINTS))
            .best_effort(),
    );

    phases
}

/// Ordered reset phases
///
/// MachineDeployments are not removed; deleting worker machines is left to
/// the operator.
pub fn reset_phases(_spec: &ClusterSpec) -> Vec<Phase> {
    vec![Phase::new("kubeadm-reset", HostSelector::Everyone, ScriptTask::new("kubeadm-reset", RESET))]
}

fn applies_machine_deployments(spec: &ClusterSpec) -> bool {
    spec.machine_controller_enabled() && !spec.dynamic_workers.is_empty()
}

// =============================================================================
// PKI
// =============================================================================

/// Downloads the cluster PKI from the leader and loads the CA
pub struct FetchPkiTask;

#[async_trait]
impl HostTask for FetchPkiTask {
    async fn run(&self, ctx: &TaskContext<'_>, exec: &dyn Executor) -> Result<TaskOutput, Error> {
        let mut output = TaskOutput::default();
        for path in PKI_FILES {
            let content = exec.download(path).await?;
            debug!(host = %ctx.host.display_name(), path = %path, bytes = content.len(), "Fetched PKI file");
            output.files.insert((*path).to_string(), content);
        }
        Ok(output)
    }

    async fn finalize(&self, state: &mut State) -> Result<(), Error> {
        let bundle: PkiBundle = state
            .leader_output(FETCH_PKI_PHASE)
            .map(|o| o.files.clone())
            .ok_or_else(|| Error::internal("leader PKI was not recorded"))?;
        let ca = CertificateAuthority::from_bundle(&bundle)?;
        state.pki = bundle;
        state.ca = Some(Arc::new(ca));
        info!("Loaded cluster certificate authority");
        Ok(())
    }
}

/// Uploads the fetched PKI to a host
pub struct UploadPkiTask;

#[async_trait]
impl HostTask for UploadPkiTask {
    async fn run(&self, ctx: &TaskContext<'_>, exec: &dyn Executor) -> Result<TaskOutput, Error> {
        if ctx.state.pki.is_empty() {
            return Err(Error::internal("PKI has not been fetched from the leader"));
        }
        for (path, content) in &ctx.state.pki {
            let mode = if path.ends_with(".key") { 0o600 } else { 0o644 };
            exec.upload(path, content, mode).await?;
        }
        Ok(TaskOutput::default())
    }
}

// =============================================================================
// Join material
// =============================================================================

/// Creates a bootstrap token and records the join command
pub struct JoinTokenTask;

#[async_trait]
impl HostTask for JoinTokenTask {
    async fn run(&self, _ctx: &TaskContext<'_>, exec: &dyn Executor) -> Result<TaskOutput, Error> {
        let output = exec
            .run("kubeadm token create --ttl 1h --print-join-command")
            .await?;
        let command = output.stdout.trim();
        if !command.starts_with("kubeadm join") {
            return Err(Error::serialization(format!(
                "unexpected join command output: {command}"
            )));
        }
        Ok(TaskOutput::stdout(command))
    }
}

// =============================================================================
// Cluster access
// =============================================================================

/// Downloads the admin kubeconfig and builds the fleet client
pub struct FetchKubeconfigTask;

#[async_trait]
impl HostTask for FetchKubeconfigTask {
    async fn run(&self, _ctx: &TaskContext<'_>, exec: &dyn Executor) -> Result<TaskOutput, Error> {
        let content = exec.download(ADMIN_KUBECONFIG).await?;
        let kubeconfig = String::from_utf8(content)
            .map_err(|e| Error::serialization(format!("admin kubeconfig is not UTF-8: {e}")))?;
        Ok(TaskOutput::stdout(kubeconfig))
    }

    async fn finalize(&self, state: &mut State) -> Result<(), Error> {
        let raw = state
            .leader_output(FETCH_KUBECONFIG_PHASE)
            .map(|o| o.stdout.clone())
            .ok_or_else(|| Error::internal("admin kubeconfig was not recorded"))?;

        let endpoint = &state.spec.api_endpoint;
        let server = format!("https://{}:{}", endpoint.host, endpoint.port);
        let kubeconfig = crate::machinedeployment::kubeconfig_with_server(&raw, Some(server.clone()))?;
        let rewritten = serde_yaml::to_string(&kubeconfig)
            .map_err(|e| Error::serialization(format!("failed to encode kubeconfig: {e}")))?;
        state.kubeconfig = Some(rewritten);

        if state.fleet.is_none() && applies_machine_deployments(&state.spec) {
            let client = KubeFleetClient::from_kubeconfig(&raw, Some(server)).await?;
            state.fleet = Some(Arc::new(client));
        }
        Ok(())
    }
}

/// Issues service serving certificates and stores them as Secrets
pub struct ServiceCertificatesTask;

#[async_trait]
impl HostTask for ServiceCertificatesTask {
    async fn run(&self, ctx: &TaskContext<'_>, exec: &dyn Executor) -> Result<TaskOutput, Error> {
        let ca = ctx
            .state
            .ca
            .as_ref()
            .ok_or_else(|| Error::internal("certificate authority has not been loaded"))?;

        let domain = &ctx.spec().cluster_network.service_domain_name;
        let certificate = ca.issue_service_certificate("metrics-server", "kube-system", domain)?;
        let secret = certificate.to_secret("metrics-server-serving-cert", "kube-system");
        let manifest = serde_yaml::to_string(&secret)
            .map_err(|e| Error::serialization(format!("failed to encode secret: {e}")))?;

        exec.upload(METRICS_SERVER_SECRET_PATH, manifest.as_bytes(), 0o600)
            .await?;
        let output = exec
            .run(&format!(
                "kubectl --kubeconfig {ADMIN_KUBECONFIG} apply -f {METRICS_SERVER_SECRET_PATH}"
            ))
            .await?;
        info!(secret = "metrics-server-serving-cert", "Applied service certificate");
        Ok(TaskOutput::stdout(output.stdout))
    }
}

/// Applies the MachineDeployment of every dynamic worker pool
pub struct MachineDeploymentsTask;

#[async_trait]
impl HostTask for MachineDeploymentsTask {
    async fn run(&self, ctx: &TaskContext<'_>, _exec: &dyn Executor) -> Result<TaskOutput, Error> {
        let fleet = ctx
            .state
            .fleet
            .as_ref()
            .ok_or_else(|| Error::internal("fleet client has not been built"))?;
        apply_machine_deployments(ctx.spec(), fleet.as_ref()).await?;
        Ok(TaskOutput::default())
    }
}
