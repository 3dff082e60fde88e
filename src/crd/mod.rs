//! Cluster document types
//!
//! This module contains the declarative KeelCluster document and the types
//! it is built from.

mod cluster;
mod types;
mod workers;

pub use cluster::{ClusterSpec, API_VERSION, KIND};
pub use types::{
    Addons, ApiEndpoint, AssetConfiguration, CanalSpec, CiliumSpec, CloudProviderSpec,
    ClusterNetworkConfig, CniConfig, ContainerRuntime, ExternalCniSpec, Features, HostConfig,
    HostGroup, ImageAsset, KubeProxyReplacement, MachineControllerConfig, MetricsServerFeature,
    OpenIdConnectConfig, OpenIdConnectFeature, ProviderName, ProxyConfig, RegistryConfiguration,
    StaticAuditLogConfig, StaticAuditLogFeature, SystemPackages, Taint, TaintEffect,
    VersionConfig, WeaveNetSpec,
};
pub use workers::{DnsConfig, DynamicWorkerConfig, ProviderSpec, ProviderStaticNetworkConfig};
