//! KeelCluster document
//!
//! The KeelCluster document declares everything Keel needs to provision a
//! cluster: the static hosts it reaches over SSH, the dynamic worker pools it
//! hands to the machine-controller, and cluster-wide settings. It is loaded
//! once, normalized by [`crate::defaults::normalize`], validated, and then
//! treated as read-only for the rest of the run.

use std::collections::{BTreeSet, HashSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Addons, ApiEndpoint, AssetConfiguration, CloudProviderSpec, ClusterNetworkConfig,
    ContainerRuntime, Features, HostConfig, HostGroup, MachineControllerConfig, ProxyConfig,
    RegistryConfiguration, SystemPackages, VersionConfig,
};
use super::workers::DynamicWorkerConfig;
use crate::Error;

/// API version of the cluster document
pub const API_VERSION: &str = "keel.dev/v1beta1";

/// Kind of the cluster document
pub const KIND: &str = "KeelCluster";

/// Specification for a KeelCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Document API version
    #[serde(default)]
    pub api_version: String,

    /// Document kind
    #[serde(default)]
    pub kind: String,

    /// Cluster name
    #[serde(default)]
    pub name: String,

    /// Control-plane hosts
    #[serde(default)]
    pub control_plane: HostGroup,

    /// Worker hosts provisioned over SSH
    #[serde(default)]
    pub static_workers: HostGroup,

    /// Worker pools managed by the machine-controller
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dynamic_workers: Vec<DynamicWorkerConfig>,

    /// Kubernetes API endpoint
    #[serde(default)]
    pub api_endpoint: ApiEndpoint,

    /// Cloud provider integration
    #[serde(default)]
    pub cloud_provider: CloudProviderSpec,

    /// Component versions
    #[serde(default)]
    pub versions: VersionConfig,

    /// Container runtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_runtime: Option<ContainerRuntime>,

    /// Cluster network
    #[serde(default)]
    pub cluster_network: ClusterNetworkConfig,

    /// HTTP proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Optional features
    #[serde(default)]
    pub features: Features,

    /// machine-controller toggle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_controller: Option<MachineControllerConfig>,

    /// Host package management toggle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_packages: Option<SystemPackages>,

    /// Registry overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_configuration: Option<RegistryConfiguration>,

    /// Image overrides
    #[serde(default)]
    pub asset_configuration: AssetConfiguration,

    /// Addon manifests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addons: Option<Addons>,
}

impl ClusterSpec {
    /// Create an empty document with the given cluster name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// All static hosts, control plane first
    pub fn hosts(&self) -> impl Iterator<Item = &HostConfig> {
        self.control_plane
            .hosts
            .iter()
            .chain(self.static_workers.hosts.iter())
    }

    /// Host with the given ID
    pub fn host(&self, id: usize) -> Option<&HostConfig> {
        self.hosts().find(|h| h.id == id)
    }

    /// Number of static hosts
    pub fn host_count(&self) -> usize {
        self.control_plane.hosts.len() + self.static_workers.hosts.len()
    }

    /// Control-plane host that initializes the cluster
    pub fn leader(&self) -> Option<&HostConfig> {
        self.control_plane.hosts.iter().find(|h| h.is_leader)
    }

    /// Control-plane hosts other than the leader
    pub fn followers(&self) -> impl Iterator<Item = &HostConfig> {
        self.control_plane.hosts.iter().filter(|h| !h.is_leader)
    }

    /// Whether metrics-server is deployed
    pub fn metrics_server_enabled(&self) -> bool {
        self.features
            .metrics_server
            .as_ref()
            .map(|m| m.enable)
            .unwrap_or(false)
    }

    /// Whether the machine-controller is deployed
    pub fn machine_controller_enabled(&self) -> bool {
        self.machine_controller
            .as_ref()
            .map(|m| m.deploy)
            .unwrap_or(false)
    }

    /// Check for configuration defects that defaulting cannot repair
    ///
    /// Intended to run after normalization and before any remote side
    /// effect.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("cluster name must not be empty"));
        }

        if self.control_plane.hosts.is_empty() {
            return Err(Error::validation(
                "at least one control plane host is required",
            ));
        }

        let leaders = self
            .control_plane
            .hosts
            .iter()
            .filter(|h| h.is_leader)
            .count();
        if leaders > 1 {
            return Err(Error::validation(format!(
                "more than one control plane host is marked as leader ({leaders} found)"
            )));
        }

        let mut addresses = HashSet::new();
        for host in self.hosts() {
            if host.public_address.is_empty() {
                return Err(Error::validation(format!(
                    "host {} has neither a public nor a private address",
                    host.id
                )));
            }
            if !addresses.insert(host.public_address.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate host address: {}",
                    host.public_address
                )));
            }
            if host.ssh_private_key_file.is_empty() && host.ssh_agent_socket.is_empty() {
                return Err(Error::validation(format!(
                    "host {} has no SSH private key file or agent socket",
                    host.public_address
                )));
            }
        }

        let mut pools = BTreeSet::new();
        for pool in &self.dynamic_workers {
            if pool.name.is_empty() {
                return Err(Error::validation("dynamic worker pool name must not be empty"));
            }
            if !pools.insert(pool.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate dynamic worker pool name: {}",
                    pool.name
                )));
            }
            match pool.replicas {
                None => {
                    return Err(Error::validation(format!(
                        "dynamic worker pool {} has no replica count",
                        pool.name
                    )))
                }
                Some(n) if n < 0 => {
                    return Err(Error::validation(format!(
                        "dynamic worker pool {} has negative replica count {n}",
                        pool.name
                    )))
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}
