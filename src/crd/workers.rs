//! Dynamic worker pool types
//!
//! A dynamic worker pool is a group of machines created and scaled by the
//! machine-controller running inside the cluster. Keel only describes the
//! pool; see [`crate::machinedeployment`] for the generated objects.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Taint;

/// DNS servers for a statically addressed machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DnsConfig {
    /// Nameserver addresses
    #[serde(default)]
    pub servers: Vec<String>,
}

/// Static network block for machines that do not use DHCP
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ProviderStaticNetworkConfig {
    /// Machine address in CIDR notation
    pub cidr: String,
    /// Default gateway
    pub gateway: String,
    /// DNS settings
    #[serde(default)]
    pub dns: DnsConfig,
}

/// Machine template of a worker pool
///
/// `cloud_provider_spec` is the provider-specific machine payload. It stays
/// opaque here and is decoded by the descriptor generator.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Cloud-specific machine settings (instance type, image, region, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_provider_spec: Option<serde_json::Value>,

    /// Annotations on the MachineDeployment object
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Annotations on every created Machine
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub machine_annotations: BTreeMap<String, String>,

    /// Labels on every created Machine and Node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Taints on every created Node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,

    /// SSH public keys authorized on created machines
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_public_keys: Vec<String>,

    /// Operating system of created machines
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operating_system: String,

    /// Operating-system-specific settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_system_spec: Option<serde_json::Value>,

    /// Static network configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<ProviderStaticNetworkConfig>,
}

/// A named, autoscaled worker pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DynamicWorkerConfig {
    /// Pool name, used as the MachineDeployment name and `workerset` label
    pub name: String,

    /// Desired machine count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Machine template
    #[serde(default)]
    pub provider_spec: ProviderSpec,
}

impl DynamicWorkerConfig {
    /// Whether machines of this pool use a static network block
    pub fn has_static_network(&self) -> bool {
        self.provider_spec.network.is_some()
    }
}
