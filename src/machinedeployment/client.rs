//! Applying MachineDeployments to a running cluster

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::{Client, Config};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use super::{MachineDeployment, NAMESPACE};
use crate::Error;

/// Write access to the cluster's machine API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FleetClient: Send + Sync {
    /// Create the deployment if absent, otherwise replace it
    async fn apply(&self, deployment: &MachineDeployment) -> Result<(), Error>;
}

/// [`FleetClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeFleetClient {
    client: Client,
}

impl KubeFleetClient {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from an admin kubeconfig
    ///
    /// When `server` is given it replaces the server URL of every cluster
    /// entry, which is needed when the kubeconfig names an address only
    /// reachable from inside the cluster network.
    pub async fn from_kubeconfig(yaml: &str, server: Option<String>) -> Result<Self, Error> {
        let kubeconfig = kubeconfig_with_server(yaml, server)?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::serialization(format!("invalid kubeconfig: {e}")))?;
        Ok(Self::new(Client::try_from(config)?))
    }

    fn api(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("cluster.k8s.io", "v1alpha1", super::KIND);
        let resource = ApiResource::from_gvk_with_plural(&gvk, "machinedeployments");
        Api::namespaced_with(self.client.clone(), NAMESPACE, &resource)
    }
}

#[async_trait]
impl FleetClient for KubeFleetClient {
    async fn apply(&self, deployment: &MachineDeployment) -> Result<(), Error> {
        let name = deployment
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::internal("MachineDeployment has no name"))?;

        let value = serde_json::to_value(deployment)
            .map_err(|e| Error::serialization(format!("failed to encode {name}: {e}")))?;
        let mut object: DynamicObject = serde_json::from_value(value)
            .map_err(|e| Error::serialization(format!("failed to encode {name}: {e}")))?;

        let api = self.api();
        let params = PostParams::default();
        match api.get_opt(&name).await? {
            Some(existing) => {
                debug!(pool = %name, "Replacing MachineDeployment");
                object.metadata.resource_version = existing.metadata.resource_version;
                api.replace(&name, &params, &object).await?;
            }
            None => {
                debug!(pool = %name, "Creating MachineDeployment");
                api.create(&params, &object).await?;
            }
        }
        Ok(())
    }
}

/// Parse a kubeconfig, optionally pointing every cluster entry at `server`
pub fn kubeconfig_with_server(yaml: &str, server: Option<String>) -> Result<Kubeconfig, Error> {
    let mut kubeconfig = Kubeconfig::from_yaml(yaml)
        .map_err(|e| Error::serialization(format!("invalid kubeconfig: {e}")))?;
    if let Some(server) = server {
        for named in &mut kubeconfig.clusters {
            if let Some(cluster) = named.cluster.as_mut() {
                cluster.server = Some(server.clone());
            }
        }
    }
    Ok(kubeconfig)
}
