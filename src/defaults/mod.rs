//! Cluster document normalization
//!
//! [`normalize`] turns a user-written [`ClusterSpec`] into a fully resolved
//! plan by filling every unset field with its default. It never fails:
//! malformed input causes the dependent default to be skipped and is left
//! for [`ClusterSpec::validate`] to report.
//!
//! Defaulting runs as a fixed, ordered pipeline ([`DEFAULTING_STEPS`]).
//! Order matters:
//! - host IDs and addresses are resolved before the API endpoint, which
//!   defaults to the first control-plane address
//! - the Kubernetes version is sanitized before the container runtime is
//!   picked from it
//! - the cluster network is resolved before the proxy exclusion list, which
//!   embeds the pod and service subnets
//!
//! Every step only writes fields that are unset, so running the pipeline on
//! its own output changes nothing.

use tracing::debug;

use crate::crd::{
    CanalSpec, ClusterSpec, CniConfig, ContainerRuntime, HostConfig, KubeProxyReplacement,
    MachineControllerConfig, MetricsServerFeature, SystemPackages, Taint,
};

/// Default pod CIDR
pub const DEFAULT_POD_SUBNET: &str = "10.244.0.0/16";
/// Default service CIDR
pub const DEFAULT_SERVICE_SUBNET: &str = "10.96.0.0/12";
/// Default cluster DNS domain
pub const DEFAULT_SERVICE_DNS: &str = "cluster.local";
/// Default NodePort range
pub const DEFAULT_NODE_PORT_RANGE: &str = "30000-32767";
/// Proxy exclusions always present when a proxy is configured
pub const DEFAULT_STATIC_NO_PROXY: &[&str] = &["127.0.0.1/8", "localhost"];
/// Default SSH and bastion port
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default SSH user
pub const DEFAULT_SSH_USERNAME: &str = "root";
/// Agent socket reference used when no private key file is given
pub const DEFAULT_SSH_AGENT_SOCKET: &str = "env:SSH_AUTH_SOCK";
/// Default Kubernetes API port
pub const DEFAULT_API_PORT: u16 = 6443;
/// First Kubernetes minor release that defaults to containerd
pub const CONTAINERD_MIN_VERSION: (u64, u64) = (1, 22);
/// Default audit log path
pub const DEFAULT_AUDIT_LOG_PATH: &str = "/var/log/kubernetes/audit.log";
/// Default addon manifest directory
pub const DEFAULT_ADDONS_PATH: &str = "./addons";

/// A named normalization step
pub struct DefaultingStep {
    /// Step name, used in logs
    pub name: &'static str,
    /// Applies the step's defaults in place
    pub apply: fn(&mut ClusterSpec),
}

/// Normalization pipeline, in execution order
pub const DEFAULTING_STEPS: &[DefaultingStep] = &[
    DefaultingStep { name: "hosts", apply: default_hosts },
    DefaultingStep { name: "host-connection", apply: default_host_connections },
    DefaultingStep { name: "api-endpoint", apply: default_api_endpoint },
    DefaultingStep { name: "versions", apply: default_versions },
    DefaultingStep { name: "container-runtime", apply: default_container_runtime },
    DefaultingStep { name: "cluster-network", apply: default_cluster_network },
    DefaultingStep { name: "proxy", apply: default_proxy },
    DefaultingStep { name: "machine-controller", apply: default_machine_controller },
    DefaultingStep { name: "system-packages", apply: default_system_packages },
    DefaultingStep { name: "asset-configuration", apply: default_asset_configuration },
    DefaultingStep { name: "features", apply: default_features },
    DefaultingStep { name: "addons", apply: default_addons },
];

/// Fill every unset field of the cluster document with its default
pub fn normalize(spec: &mut ClusterSpec) {
    for step in DEFAULTING_STEPS {
        debug!(step = step.name, cluster = %spec.name, "applying defaults");
        (step.apply)(spec);
    }
}

fn set_if_empty(field: &mut String, value: &str) {
    if field.is_empty() {
        *field = value.to_string();
    }
}

fn set_if_zero<T: Default + PartialEq>(field: &mut T, value: T) {
    if *field == T::default() {
        *field = value;
    }
}

fn default_hosts(spec: &mut ClusterSpec) {
    if spec.control_plane.hosts.is_empty() {
        return;
    }

    for (idx, host) in spec.control_plane.hosts.iter_mut().enumerate() {
        host.id = idx;
        host.taints.get_or_insert_with(|| vec![Taint::control_plane()]);
    }

    if !spec.control_plane.hosts.iter().any(|h| h.is_leader) {
        spec.control_plane.hosts[0].is_leader = true;
    }

    let offset = spec.control_plane.hosts.len();
    for (idx, host) in spec.static_workers.hosts.iter_mut().enumerate() {
        host.id = offset + idx;
        host.taints.get_or_insert_with(Vec::new);
    }
}

fn default_host_connections(spec: &mut ClusterSpec) {
    spec.control_plane
        .hosts
        .iter_mut()
        .chain(spec.static_workers.hosts.iter_mut())
        .for_each(default_host_connection);
}

fn default_host_connection(host: &mut HostConfig) {
    if host.public_address.is_empty() && !host.private_address.is_empty() {
        host.public_address = host.private_address.clone();
    }
    if host.private_address.is_empty() && !host.public_address.is_empty() {
        host.private_address = host.public_address.clone();
    }
    if host.ssh_private_key_file.is_empty() {
        set_if_empty(&mut host.ssh_agent_socket, DEFAULT_SSH_AGENT_SOCKET);
    }
    set_if_empty(&mut host.ssh_username, DEFAULT_SSH_USERNAME);
    set_if_zero(&mut host.ssh_port, DEFAULT_SSH_PORT);
    set_if_zero(&mut host.bastion_port, DEFAULT_SSH_PORT);
    if host.bastion_user.is_empty() {
        host.bastion_user = host.ssh_username.clone();
    }
}

fn default_api_endpoint(spec: &mut ClusterSpec) {
    if spec.api_endpoint.host.is_empty() {
        let Some(first) = spec.control_plane.hosts.first() else {
            return;
        };
        spec.api_endpoint.host = first.public_address.clone();
    }
    set_if_zero(&mut spec.api_endpoint.port, DEFAULT_API_PORT);
}

fn default_versions(spec: &mut ClusterSpec) {
    let stripped = spec.versions.kubernetes.trim_start_matches('v');
    if stripped.len() != spec.versions.kubernetes.len() {
        spec.versions.kubernetes = stripped.to_string();
    }
}

fn default_container_runtime(spec: &mut ClusterSpec) {
    if spec.container_runtime.is_some() {
        return;
    }
    let Some(version) = parse_version(&spec.versions.kubernetes) else {
        return;
    };
    if (version.0, version.1) >= CONTAINERD_MIN_VERSION {
        spec.container_runtime = Some(ContainerRuntime::Containerd);
    }
}

/// Parse a `major[.minor[.patch]]` release version
///
/// Build metadata (`+...`) is ignored. Pre-release suffixes are rejected:
/// a release candidate does not satisfy a `>= 1.22` threshold.
pub fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let version = version.strip_prefix('v').unwrap_or(version);
    let version = version.split_once('+').map_or(version, |(release, _)| release);
    if version.is_empty() {
        return None;
    }

    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() > 3 {
        return None;
    }

    let mut numbers = [0u64; 3];
    for (slot, part) in numbers.iter_mut().zip(&parts) {
        *slot = part.parse().ok()?;
    }
    Some((numbers[0], numbers[1], numbers[2]))
}

fn default_cluster_network(spec: &mut ClusterSpec) {
    let mtu = spec.cloud_provider.name.canal_mtu();
    let network = &mut spec.cluster_network;

    set_if_empty(&mut network.pod_subnet, DEFAULT_POD_SUBNET);
    set_if_empty(&mut network.service_subnet, DEFAULT_SERVICE_SUBNET);
    set_if_empty(&mut network.service_domain_name, DEFAULT_SERVICE_DNS);
    set_if_empty(&mut network.node_port_range, DEFAULT_NODE_PORT_RANGE);

    let cni = network.cni.get_or_insert_with(|| CniConfig {
        canal: Some(CanalSpec { mtu }),
        ..Default::default()
    });

    if let Some(canal) = cni.canal.as_mut() {
        set_if_zero(&mut canal.mtu, mtu);
    }

    if let Some(cilium) = cni.cilium.as_mut() {
        cilium
            .kube_proxy_replacement
            .get_or_insert(KubeProxyReplacement::Disabled);
    }
}

fn default_proxy(spec: &mut ClusterSpec) {
    if !spec.proxy.is_configured() {
        return;
    }

    let network = &spec.cluster_network;
    let mut entries: Vec<&str> = DEFAULT_STATIC_NO_PROXY.to_vec();
    entries.extend([
        network.service_domain_name.as_str(),
        network.pod_subnet.as_str(),
        network.service_subnet.as_str(),
    ]);
    entries.extend(spec.proxy.no_proxy.split(',').map(str::trim));

    let mut seen = std::collections::HashSet::new();
    let no_proxy = entries
        .into_iter()
        .filter(|e| !e.is_empty() && seen.insert(*e))
        .collect::<Vec<_>>()
        .join(",");

    spec.proxy.no_proxy = no_proxy;
}

fn default_machine_controller(spec: &mut ClusterSpec) {
    spec.machine_controller
        .get_or_insert(MachineControllerConfig { deploy: true });
}

fn default_system_packages(spec: &mut ClusterSpec) {
    spec.system_packages.get_or_insert(SystemPackages {
        configure_repositories: true,
    });
}

fn default_asset_configuration(spec: &mut ClusterSpec) {
    let Some(registry) = spec
        .registry_configuration
        .as_ref()
        .map(|r| r.overwrite_registry.clone())
        .filter(|r| !r.is_empty())
    else {
        return;
    };

    let assets = &mut spec.asset_configuration;
    for asset in [
        &mut assets.kubernetes,
        &mut assets.core_dns,
        &mut assets.etcd,
        &mut assets.metrics_server,
    ] {
        set_if_empty(&mut asset.image_repository, &registry);
    }
}

fn default_features(spec: &mut ClusterSpec) {
    let features = &mut spec.features;

    features
        .metrics_server
        .get_or_insert(MetricsServerFeature { enable: true });

    if let Some(audit) = features.static_audit_log.as_mut().filter(|a| a.enable) {
        let config = &mut audit.config;
        set_if_empty(&mut config.log_path, DEFAULT_AUDIT_LOG_PATH);
        set_if_zero(&mut config.log_max_age, 30);
        set_if_zero(&mut config.log_max_backup, 3);
        set_if_zero(&mut config.log_max_size, 100);
    }

    if let Some(oidc) = features.open_id_connect.as_mut().filter(|o| o.enable) {
        let config = &mut oidc.config;
        set_if_empty(&mut config.client_id, "kubernetes");
        set_if_empty(&mut config.username_claim, "sub");
        set_if_empty(&mut config.username_prefix, "oidc:");
        set_if_empty(&mut config.groups_claim, "groups");
        set_if_empty(&mut config.groups_prefix, "oidc:");
        set_if_empty(&mut config.signing_algs, "RS256");
    }
}

fn default_addons(spec: &mut ClusterSpec) {
    if let Some(addons) = spec.addons.as_mut().filter(|a| a.enable) {
        set_if_empty(&mut addons.path, DEFAULT_ADDONS_PATH);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        Addons, CiliumSpec, OpenIdConnectFeature, ProviderName, RegistryConfiguration,
        StaticAuditLogFeature, TaintEffect,
    };

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn spec_with_hosts(control_plane: usize, workers: usize) -> ClusterSpec {
        let mut spec = ClusterSpec::new("demo");
        spec.versions.kubernetes = "1.24.3".to_string();
        spec.control_plane.hosts = (0..control_plane)
            .map(|i| HostConfig::new(format!("10.0.0.{}", i + 1)))
            .collect();
        spec.static_workers.hosts = (0..workers)
            .map(|i| HostConfig::new(format!("10.0.1.{}", i + 1)))
            .collect();
        spec
    }

    fn normalized(mut spec: ClusterSpec) -> ClusterSpec {
        normalize(&mut spec);
        spec
    }

    // =========================================================================
    // Host Defaulting Stories
    // =========================================================================

    /// Story: IDs are contiguous, control plane first, workers continue
    #[test]
    fn story_host_ids_are_contiguous_across_roles() {
        let spec = normalized(spec_with_hosts(3, 2));

        let ids: Vec<_> = spec.hosts().map(|h| h.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    /// Story: without an explicit leader the first control-plane host leads
    #[test]
    fn story_first_control_plane_host_becomes_leader() {
        let spec = normalized(spec_with_hosts(3, 0));

        assert_eq!(spec.leader().map(|h| h.id), Some(0));
        assert_eq!(spec.control_plane.hosts.iter().filter(|h| h.is_leader).count(), 1);
    }

    /// Story: an explicitly flagged leader is respected
    #[test]
    fn story_explicit_leader_is_kept() {
        let mut spec = spec_with_hosts(3, 0);
        spec.control_plane.hosts[2].is_leader = true;
        let spec = normalized(spec);

        assert_eq!(spec.leader().map(|h| h.id), Some(2));
        assert!(!spec.control_plane.hosts[0].is_leader);
    }

    /// Story: control-plane hosts are tainted, workers are not
    #[test]
    fn story_role_default_taints() {
        let mut spec = spec_with_hosts(2, 2);
        spec.control_plane.hosts[1].taints = Some(vec![]);
        let spec = normalized(spec);

        let cp0 = spec.control_plane.hosts[0].taints.as_ref().unwrap();
        assert_eq!(cp0.len(), 1);
        assert_eq!(cp0[0].key, "node-role.kubernetes.io/master");
        assert_eq!(cp0[0].effect, TaintEffect::NoSchedule);

        // Explicit empty list means "no taints"
        assert_eq!(spec.control_plane.hosts[1].taints, Some(vec![]));
        assert_eq!(spec.static_workers.hosts[0].taints, Some(vec![]));
    }

    /// Story: connection defaults fill in everything SSH needs
    #[test]
    fn story_host_connection_defaults() {
        let mut spec = spec_with_hosts(1, 1);
        spec.control_plane.hosts[0].ssh_username = "ubuntu".to_string();
        spec.static_workers.hosts[0] = HostConfig {
            private_address: "10.0.1.9".to_string(),
            ssh_private_key_file: "/keys/id_rsa".to_string(),
            ..Default::default()
        };
        let spec = normalized(spec);

        let cp = &spec.control_plane.hosts[0];
        assert_eq!(cp.private_address, "10.0.0.1");
        assert_eq!(cp.ssh_port, 22);
        assert_eq!(cp.bastion_port, 22);
        assert_eq!(cp.bastion_user, "ubuntu");
        assert_eq!(cp.ssh_agent_socket, "env:SSH_AUTH_SOCK");

        let worker = &spec.static_workers.hosts[0];
        assert_eq!(worker.public_address, "10.0.1.9");
        assert_eq!(worker.ssh_username, "root");
        assert!(worker.ssh_agent_socket.is_empty());
    }

    /// Story: an empty document is left alone rather than panicking
    #[test]
    fn story_no_hosts_skips_host_defaults() {
        let spec = normalized(ClusterSpec::new("empty"));

        assert_eq!(spec.host_count(), 0);
        assert!(spec.api_endpoint.host.is_empty());
        assert_eq!(spec.api_endpoint.port, 0);
    }

    // =========================================================================
    // Endpoint and Version Stories
    // =========================================================================

    #[test]
    fn api_endpoint_defaults_to_first_control_plane_address() {
        let spec = normalized(spec_with_hosts(2, 0));
        assert_eq!(spec.api_endpoint.host, "10.0.0.1");
        assert_eq!(spec.api_endpoint.port, 6443);
    }

    #[test]
    fn explicit_api_endpoint_is_kept() {
        let mut spec = spec_with_hosts(1, 0);
        spec.api_endpoint.host = "lb.example.com".to_string();
        spec.api_endpoint.port = 443;
        let spec = normalized(spec);
        assert_eq!(spec.api_endpoint.host, "lb.example.com");
        assert_eq!(spec.api_endpoint.port, 443);
    }

    /// Story: a leading `v` breaks kubeadm, so it is stripped
    #[test]
    fn story_version_prefix_is_stripped() {
        let mut spec = spec_with_hosts(1, 0);
        spec.versions.kubernetes = "v1.24.3".to_string();
        let spec = normalized(spec);
        assert_eq!(spec.versions.kubernetes, "1.24.3");
    }

    /// Story: the documented version examples pick their runtime
    #[test]
    fn story_documented_versions_normalize() {
        let mut spec = spec_with_hosts(1, 0);
        spec.versions.kubernetes = "v1.23.0".to_string();
        let spec = normalized(spec);
        assert_eq!(spec.versions.kubernetes, "1.23.0");
        assert_eq!(spec.container_runtime, Some(ContainerRuntime::Containerd));

        let mut spec = spec_with_hosts(1, 0);
        spec.versions.kubernetes = "v1.20.5".to_string();
        let spec = normalized(spec);
        assert_eq!(spec.versions.kubernetes, "1.20.5");
        assert_eq!(spec.container_runtime, None);
    }

    /// Story: containerd is the default from Kubernetes 1.22 on
    #[test]
    fn story_container_runtime_threshold() {
        let runtime_for = |version: &str| {
            let mut spec = spec_with_hosts(1, 0);
            spec.versions.kubernetes = version.to_string();
            normalized(spec).container_runtime
        };

        assert_eq!(runtime_for("1.22.0"), Some(ContainerRuntime::Containerd));
        assert_eq!(runtime_for("v1.25.1"), Some(ContainerRuntime::Containerd));
        assert_eq!(runtime_for("2.0"), Some(ContainerRuntime::Containerd));
        assert_eq!(runtime_for("1.21.9"), None);
        assert_eq!(runtime_for("1.22.0+build"), Some(ContainerRuntime::Containerd));
        assert_eq!(runtime_for("1.21.0+build.7"), None);
        assert_eq!(runtime_for("not-a-version"), None);
        assert_eq!(runtime_for(""), None);
    }

    #[test]
    fn explicit_container_runtime_is_kept() {
        let mut spec = spec_with_hosts(1, 0);
        spec.container_runtime = Some(ContainerRuntime::Docker);
        let spec = normalized(spec);
        assert_eq!(spec.container_runtime, Some(ContainerRuntime::Docker));
    }

    #[test]
    fn parse_version_accepts_release_forms_only() {
        assert_eq!(parse_version("1.22.4"), Some((1, 22, 4)));
        assert_eq!(parse_version("v1.22"), Some((1, 22, 0)));
        assert_eq!(parse_version("1"), Some((1, 0, 0)));
        assert_eq!(parse_version("1.22.0-rc.1"), None);
        assert_eq!(parse_version("1.22.0+build"), Some((1, 22, 0)));
        assert_eq!(parse_version("v1.23.1+k3s1"), Some((1, 23, 1)));
        assert_eq!(parse_version("+build"), None);
        assert_eq!(parse_version("1.2.3.4"), None);
        assert_eq!(parse_version("1..2"), None);
    }

    // =========================================================================
    // Network Stories
    // =========================================================================

    #[test]
    fn cluster_network_defaults() {
        let spec = normalized(spec_with_hosts(1, 0));
        let network = &spec.cluster_network;
        assert_eq!(network.pod_subnet, "10.244.0.0/16");
        assert_eq!(network.service_subnet, "10.96.0.0/12");
        assert_eq!(network.service_domain_name, "cluster.local");
        assert_eq!(network.node_port_range, "30000-32767");
    }

    /// Story: Canal gets an MTU matching the provider's underlay network
    #[test]
    fn story_canal_mtu_follows_provider() {
        let mtu_for = |provider: ProviderName| {
            let mut spec = spec_with_hosts(1, 0);
            spec.cloud_provider.name = provider;
            normalized(spec)
                .cluster_network
                .cni
                .and_then(|c| c.canal)
                .map(|c| c.mtu)
        };

        assert_eq!(mtu_for(ProviderName::Aws), Some(8951));
        assert_eq!(mtu_for(ProviderName::Gce), Some(1410));
        assert_eq!(mtu_for(ProviderName::Hetzner), Some(1400));
        assert_eq!(mtu_for(ProviderName::Openstack), Some(1400));
        assert_eq!(mtu_for(ProviderName::Vsphere), Some(1450));
        assert_eq!(mtu_for(ProviderName::None), Some(1450));
    }

    #[test]
    fn explicit_canal_mtu_is_kept() {
        let mut spec = spec_with_hosts(1, 0);
        spec.cloud_provider.name = ProviderName::Aws;
        spec.cluster_network.cni = Some(CniConfig {
            canal: Some(CanalSpec { mtu: 1300 }),
            ..Default::default()
        });
        let spec = normalized(spec);
        assert_eq!(spec.cluster_network.cni.unwrap().canal.unwrap().mtu, 1300);
    }

    #[test]
    fn cilium_is_not_replaced_by_canal() {
        let mut spec = spec_with_hosts(1, 0);
        spec.cluster_network.cni = Some(CniConfig {
            cilium: Some(CiliumSpec::default()),
            ..Default::default()
        });
        let cni = normalized(spec).cluster_network.cni.unwrap();
        assert!(cni.canal.is_none());
        assert_eq!(
            cni.cilium.unwrap().kube_proxy_replacement,
            Some(KubeProxyReplacement::Disabled)
        );
    }

    /// Story: cluster-internal traffic bypasses the proxy
    #[test]
    fn story_no_proxy_includes_cluster_ranges() {
        let mut spec = spec_with_hosts(1, 0);
        spec.proxy.https = "http://proxy:3128".to_string();
        spec.proxy.no_proxy = "internal.example.com".to_string();
        let spec = normalized(spec);

        assert_eq!(
            spec.proxy.no_proxy,
            "127.0.0.1/8,localhost,cluster.local,10.244.0.0/16,10.96.0.0/12,internal.example.com"
        );
    }

    #[test]
    fn no_proxy_untouched_without_proxy() {
        let mut spec = spec_with_hosts(1, 0);
        spec.proxy.no_proxy = "internal.example.com".to_string();
        let spec = normalized(spec);
        assert_eq!(spec.proxy.no_proxy, "internal.example.com");
    }

    // =========================================================================
    // Toggle and Feature Stories
    // =========================================================================

    #[test]
    fn toggles_default_to_enabled() {
        let spec = normalized(spec_with_hosts(1, 0));
        assert!(spec.machine_controller_enabled());
        assert!(spec.metrics_server_enabled());
        assert!(spec.system_packages.unwrap().configure_repositories);
    }

    #[test]
    fn explicit_toggles_are_kept() {
        let mut spec = spec_with_hosts(1, 0);
        spec.machine_controller = Some(MachineControllerConfig { deploy: false });
        spec.features.metrics_server = Some(MetricsServerFeature { enable: false });
        let spec = normalized(spec);
        assert!(!spec.machine_controller_enabled());
        assert!(!spec.metrics_server_enabled());
    }

    /// Story: a registry override redirects every component image
    #[test]
    fn story_registry_override_propagates_to_assets() {
        let mut spec = spec_with_hosts(1, 0);
        spec.registry_configuration = Some(RegistryConfiguration {
            overwrite_registry: "registry.internal".to_string(),
            insecure_registry: false,
        });
        spec.asset_configuration.etcd.image_repository = "quay.io/coreos".to_string();
        let assets = normalized(spec).asset_configuration;

        assert_eq!(assets.kubernetes.image_repository, "registry.internal");
        assert_eq!(assets.core_dns.image_repository, "registry.internal");
        assert_eq!(assets.metrics_server.image_repository, "registry.internal");
        assert_eq!(assets.etcd.image_repository, "quay.io/coreos");
    }

    #[test]
    fn enabled_features_get_defaults() {
        let mut spec = spec_with_hosts(1, 0);
        spec.features.static_audit_log = Some(StaticAuditLogFeature {
            enable: true,
            ..Default::default()
        });
        spec.features.open_id_connect = Some(OpenIdConnectFeature {
            enable: true,
            ..Default::default()
        });
        spec.addons = Some(Addons {
            enable: true,
            path: String::new(),
        });
        let spec = normalized(spec);

        let audit = spec.features.static_audit_log.unwrap().config;
        assert_eq!(audit.log_path, "/var/log/kubernetes/audit.log");
        assert_eq!(
            (audit.log_max_age, audit.log_max_backup, audit.log_max_size),
            (30, 3, 100)
        );

        let oidc = spec.features.open_id_connect.unwrap().config;
        assert_eq!(oidc.client_id, "kubernetes");
        assert_eq!(oidc.username_claim, "sub");
        assert_eq!(oidc.groups_claim, "groups");
        assert_eq!(oidc.username_prefix, "oidc:");
        assert_eq!(oidc.groups_prefix, "oidc:");
        assert_eq!(oidc.signing_algs, "RS256");

        assert_eq!(spec.addons.unwrap().path, "./addons");
    }

    #[test]
    fn disabled_features_are_left_alone() {
        let mut spec = spec_with_hosts(1, 0);
        spec.features.open_id_connect = Some(OpenIdConnectFeature::default());
        spec.addons = Some(Addons::default());
        let spec = normalized(spec);

        assert!(spec.features.open_id_connect.unwrap().config.client_id.is_empty());
        assert!(spec.addons.unwrap().path.is_empty());
    }

    // =========================================================================
    // Idempotence
    // =========================================================================

    /// Story: normalizing a normalized plan is a no-op
    #[test]
    fn story_normalize_is_idempotent() {
        let mut spec = spec_with_hosts(3, 2);
        spec.proxy.http = "http://proxy:3128".to_string();
        spec.proxy.no_proxy = "a.example.com,localhost".to_string();
        spec.cloud_provider.name = ProviderName::Gce;
        spec.versions.kubernetes = "v1.23.0".to_string();

        let once = normalized(spec);
        let twice = normalized(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn pipeline_order_is_fixed() {
        let names: Vec<_> = DEFAULTING_STEPS.iter().map(|s| s.name).collect();
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();

        assert_eq!(names.len(), 12);
        assert!(pos("host-connection") < pos("api-endpoint"));
        assert!(pos("versions") < pos("container-runtime"));
        assert!(pos("cluster-network") < pos("proxy"));
    }
}
