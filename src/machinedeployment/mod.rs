//! Worker-fleet descriptors for the machine-controller
//!
//! Every dynamic worker pool becomes a `cluster.k8s.io/v1alpha1`
//! MachineDeployment in `kube-system`. The machine-controller running in the
//! cluster reconciles those objects into cloud instances; Keel only generates
//! and applies them.
//!
//! Generation is pure ([`generate`], [`render_manifest`]); applying goes
//! through the [`FleetClient`] seam so it can be mocked.

mod client;
mod provider;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::crd::{ClusterSpec, DynamicWorkerConfig, Taint};

pub use client::{kubeconfig_with_server, FleetClient, KubeFleetClient};
#[cfg(test)]
pub use client::MockFleetClient;
pub use provider::{AwsSpec, ProviderPayload};

/// API version of generated MachineDeployments
pub const API_VERSION: &str = "cluster.k8s.io/v1alpha1";
/// Kind of generated objects
pub const KIND: &str = "MachineDeployment";
/// Namespace the machine-controller watches
pub const NAMESPACE: &str = "kube-system";
/// Label tying machines to their pool
pub const WORKERSET_LABEL: &str = "workerset";

/// Descriptor generation errors, each naming the pool
#[derive(Debug, Error)]
pub enum MachineDeploymentError {
    /// Pool has no `cloudProviderSpec`
    #[error("worker pool {pool}: cloudProviderSpec is missing")]
    MissingPayload {
        /// Pool name
        pool: String,
    },

    /// `cloudProviderSpec` does not match the provider's schema
    #[error("worker pool {pool}: failed to decode cloudProviderSpec: {message}")]
    Decode {
        /// Pool name
        pool: String,
        /// Decoder message
        message: String,
    },

    /// Provider spec could not be serialized
    #[error("worker pool {pool}: failed to encode provider spec: {message}")]
    Encode {
        /// Pool name
        pool: String,
        /// Encoder message
        message: String,
    },

    /// Replica count missing or negative
    #[error("worker pool {pool}: {message}")]
    Replicas {
        /// Pool name
        pool: String,
        /// What is wrong with the count
        message: String,
    },
}

/// MachineDeployment object
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeployment {
    /// Always [`API_VERSION`]
    pub api_version: String,
    /// Always [`KIND`]
    pub kind: String,
    /// Object metadata
    pub metadata: ObjectMeta,
    /// Desired state
    pub spec: MachineDeploymentSpec,
}

/// MachineDeployment spec
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentSpec {
    /// Reconciliation paused
    pub paused: bool,
    /// Desired machine count
    pub replicas: i32,
    /// Machines owned by this deployment
    pub selector: LabelSelector,
    /// Replacement strategy
    pub strategy: MachineDeploymentStrategy,
    /// Seconds a machine must be ready before it counts as available
    pub min_ready_seconds: i32,
    /// Machine template
    pub template: MachineTemplateSpec,
}

/// Replacement strategy
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentStrategy {
    /// Strategy type, always `RollingUpdate`
    #[serde(rename = "type")]
    pub type_: String,
    /// Rolling update bounds
    pub rolling_update: MachineRollingUpdate,
}

/// Rolling update bounds
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineRollingUpdate {
    /// Extra machines allowed during an update
    pub max_surge: IntOrString,
    /// Machines allowed to be missing during an update
    pub max_unavailable: IntOrString,
}

/// Machine template
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MachineTemplateSpec {
    /// Template metadata
    pub metadata: ObjectMeta,
    /// Machine spec
    pub spec: MachineSpec,
}

/// Machine spec
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Metadata applied to the Machine and its Node
    pub metadata: ObjectMeta,
    /// Component versions
    pub versions: MachineVersionInfo,
    /// Embedded provider spec
    pub provider_spec: MachineProviderSpec,
    /// Node taints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
}

/// Component versions of a machine
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MachineVersionInfo {
    /// kubelet version
    pub kubelet: String,
}

/// Provider spec wrapper
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MachineProviderSpec {
    /// Encoded pool provider spec plus `cloudProvider`
    pub value: Value,
}

/// Generate the MachineDeployment for one worker pool
pub fn generate(
    cluster: &ClusterSpec,
    pool: &DynamicWorkerConfig,
) -> Result<MachineDeployment, MachineDeploymentError> {
    let encode_err = |e: serde_json::Error| MachineDeploymentError::Encode {
        pool: pool.name.clone(),
        message: e.to_string(),
    };

    let raw = pool
        .provider_spec
        .cloud_provider_spec
        .as_ref()
        .ok_or_else(|| MachineDeploymentError::MissingPayload {
            pool: pool.name.clone(),
        })?;

    let mut payload = ProviderPayload::decode(cluster.cloud_provider.name, raw).map_err(|e| {
        MachineDeploymentError::Decode {
            pool: pool.name.clone(),
            message: e.to_string(),
        }
    })?;
    payload.tag_for_cluster(&cluster.name);

    let mut provider_spec = pool.provider_spec.clone();
    provider_spec.cloud_provider_spec = Some(payload.encode().map_err(encode_err)?);

    let mut value = serde_json::to_value(&provider_spec).map_err(encode_err)?;
    if let Value::Object(map) = &mut value {
        map.insert(
            "cloudProvider".to_string(),
            Value::String(cluster.cloud_provider.name.to_string()),
        );
    }

    let replicas = match pool.replicas {
        Some(n) if n >= 0 => n,
        Some(n) => {
            return Err(MachineDeploymentError::Replicas {
                pool: pool.name.clone(),
                message: format!("replica count {n} is negative"),
            })
        }
        None => {
            return Err(MachineDeploymentError::Replicas {
                pool: pool.name.clone(),
                message: "replica count is not set".to_string(),
            })
        }
    };

    // Static addressing cannot hand out an extra address during a rollout
    let (max_surge, max_unavailable) = if pool.has_static_network() {
        (0, 1)
    } else {
        (1, 0)
    };

    let selector_labels = BTreeMap::from([(WORKERSET_LABEL.to_string(), pool.name.clone())]);
    let mut machine_labels = pool.provider_spec.labels.clone();
    machine_labels.extend(selector_labels.clone());

    let non_empty = |m: &BTreeMap<String, String>| (!m.is_empty()).then(|| m.clone());

    Ok(MachineDeployment {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        metadata: ObjectMeta {
            name: Some(pool.name.clone()),
            namespace: Some(NAMESPACE.to_string()),
            annotations: non_empty(&pool.provider_spec.annotations),
            ..Default::default()
        },
        spec: MachineDeploymentSpec {
            paused: false,
            replicas,
            selector: LabelSelector {
                match_labels: Some(selector_labels),
                ..Default::default()
            },
            strategy: MachineDeploymentStrategy {
                type_: "RollingUpdate".to_string(),
                rolling_update: MachineRollingUpdate {
                    max_surge: IntOrString::Int(max_surge),
                    max_unavailable: IntOrString::Int(max_unavailable),
                },
            },
            min_ready_seconds: 0,
            template: MachineTemplateSpec {
                metadata: ObjectMeta {
                    labels: Some(machine_labels.clone()),
                    namespace: Some(NAMESPACE.to_string()),
                    ..Default::default()
                },
                spec: MachineSpec {
                    metadata: ObjectMeta {
                        annotations: non_empty(&pool.provider_spec.machine_annotations),
                        labels: Some(machine_labels),
                        ..Default::default()
                    },
                    versions: MachineVersionInfo {
                        kubelet: cluster.versions.kubernetes.clone(),
                    },
                    provider_spec: MachineProviderSpec { value },
                    taints: pool.provider_spec.taints.clone(),
                },
            },
        },
    })
}

/// Generate MachineDeployments for every pool of the cluster
pub fn generate_all(
    cluster: &ClusterSpec,
) -> Result<Vec<MachineDeployment>, MachineDeploymentError> {
    cluster
        .dynamic_workers
        .iter()
        .map(|pool| generate(cluster, pool))
        .collect()
}

/// Render every pool as a multi-document YAML stream
///
/// Returns an empty string when the cluster has no dynamic worker pools.
pub fn render_manifest(cluster: &ClusterSpec) -> Result<String, MachineDeploymentError> {
    let mut documents = Vec::with_capacity(cluster.dynamic_workers.len());
    for deployment in generate_all(cluster)? {
        let yaml = serde_yaml::to_string(&deployment).map_err(|e| {
            MachineDeploymentError::Encode {
                pool: deployment.metadata.name.clone().unwrap_or_default(),
                message: e.to_string(),
            }
        })?;
        documents.push(yaml);
    }
    Ok(documents.join("---\n"))
}

/// Create or replace the MachineDeployment of every pool
pub async fn apply_machine_deployments(
    cluster: &ClusterSpec,
    fleet: &dyn FleetClient,
) -> Result<(), crate::Error> {
    for deployment in generate_all(cluster)? {
        fleet.apply(&deployment).await?;
        info!(
            pool = deployment.metadata.name.as_deref().unwrap_or_default(),
            replicas = deployment.spec.replicas,
            "Applied MachineDeployment"
        );
    }
    Ok(())
}
