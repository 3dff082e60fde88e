//! Supporting types for the KeelCluster document

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

// =============================================================================
// Hosts
// =============================================================================

/// Effect of a node taint
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TaintEffect {
    /// Pods that do not tolerate the taint are not scheduled
    #[default]
    NoSchedule,
    /// Scheduler tries to avoid the node
    PreferNoSchedule,
    /// Running pods that do not tolerate the taint are evicted
    NoExecute,
}

impl std::fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSchedule => write!(f, "NoSchedule"),
            Self::PreferNoSchedule => write!(f, "PreferNoSchedule"),
            Self::NoExecute => write!(f, "NoExecute"),
        }
    }
}

/// Node taint applied at join time
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Taint {
    /// Taint key
    pub key: String,
    /// Optional taint value
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// Taint effect
    pub effect: TaintEffect,
}

impl Taint {
    /// Taint carried by control-plane nodes unless overridden
    pub fn control_plane() -> Self {
        Self {
            key: "node-role.kubernetes.io/master".to_string(),
            value: String::new(),
            effect: TaintEffect::NoSchedule,
        }
    }
}

impl std::fmt::Display for Taint {
    /// Renders `key[=value]:Effect`, the form kubectl and kubelet accept
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}:{}", self.key, self.effect)
        } else {
            write!(f, "{}={}:{}", self.key, self.value, self.effect)
        }
    }
}

/// Connection and identity parameters of a statically provisioned machine
///
/// Empty strings and zero ports mean "unset"; the normalizer fills them in.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Position in the combined host list (control plane first)
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub id: usize,

    /// Address used to reach the host over SSH
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_address: String,

    /// Address used for intra-cluster traffic
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_address: String,

    /// Node hostname
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    /// SSH port
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub ssh_port: u16,

    /// SSH login user
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_username: String,

    /// Path to the SSH private key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_private_key_file: String,

    /// SSH agent socket path, or `env:VAR` naming the variable that holds it
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_agent_socket: String,

    /// Bastion (jump host) address
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bastion: String,

    /// Bastion SSH port
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub bastion_port: u16,

    /// Bastion login user
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bastion_user: String,

    /// Whether this control-plane host initializes the cluster
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_leader: bool,

    /// Node taints; `None` means "use the role default", `Some([])` means none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taints: Option<Vec<Taint>>,

    /// Operating system hint (ubuntu, centos, flatcar, ...)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operating_system: String,
}

impl HostConfig {
    /// Create a host reachable at the given address
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            public_address: address.into(),
            ..Default::default()
        }
    }

    /// Whether the host is reached through a bastion
    pub fn has_bastion(&self) -> bool {
        !self.bastion.is_empty()
    }

    /// Name used in logs: hostname if known, otherwise the public address
    pub fn display_name(&self) -> &str {
        if self.hostname.is_empty() {
            &self.public_address
        } else {
            &self.hostname
        }
    }
}

/// A group of hosts with a common role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HostGroup {
    /// Hosts in the group
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

// =============================================================================
// API endpoint, provider, versions
// =============================================================================

/// Address clients use to reach the Kubernetes API
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    /// Host name or address
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,

    /// Port
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub port: u16,

    /// Additional API server certificate SANs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_names: Vec<String>,
}

/// Supported cloud providers
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ProviderName {
    /// Amazon Web Services
    Aws,
    /// Microsoft Azure
    Azure,
    /// DigitalOcean
    Digitalocean,
    /// Google Compute Engine
    Gce,
    /// Hetzner Cloud
    Hetzner,
    /// OpenStack
    Openstack,
    /// Equinix Metal (Packet)
    Packet,
    /// VMware vSphere
    Vsphere,
    /// Bare metal or unmanaged infrastructure
    #[default]
    None,
}

impl ProviderName {
    /// VXLAN MTU for Canal on this provider's network
    ///
    /// Provider jumbo/underlay frame size minus the 50 byte VXLAN overhead.
    pub fn canal_mtu(&self) -> u32 {
        match self {
            Self::Aws => 8951,
            Self::Gce => 1410,
            Self::Hetzner | Self::Openstack => 1400,
            _ => 1450,
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Digitalocean => "digitalocean",
            Self::Gce => "gce",
            Self::Hetzner => "hetzner",
            Self::Openstack => "openstack",
            Self::Packet => "packet",
            Self::Vsphere => "vsphere",
            Self::None => "none",
        };
        write!(f, "{s}")
    }
}

/// Cloud provider integration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudProviderSpec {
    /// Which provider the cluster runs on
    #[serde(default)]
    pub name: ProviderName,

    /// Use the external (out-of-tree) cloud controller manager
    #[serde(default, skip_serializing_if = "is_false")]
    pub external: bool,

    /// Raw cloud-config passed to the cloud controller
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cloud_config: String,
}

/// Component versions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct VersionConfig {
    /// Kubernetes version (`1.22.4`; a leading `v` is stripped)
    #[serde(default)]
    pub kubernetes: String,
}

/// Container runtime installed on every host
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    /// Docker engine (legacy default)
    Docker,
    /// containerd
    Containerd,
}

impl std::fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Containerd => write!(f, "containerd"),
        }
    }
}

// =============================================================================
// Networking
// =============================================================================

/// Canal (Calico + Flannel) settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CanalSpec {
    /// VXLAN MTU; zero means "derive from the cloud provider"
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub mtu: u32,
}

/// Cilium kube-proxy replacement mode
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KubeProxyReplacement {
    /// kube-proxy stays in charge
    #[default]
    Disabled,
    /// Cilium replaces selected kube-proxy features
    Partial,
    /// Cilium fully replaces kube-proxy
    Strict,
}

/// Cilium settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumSpec {
    /// kube-proxy replacement mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_proxy_replacement: Option<KubeProxyReplacement>,
}

/// WeaveNet settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct WeaveNetSpec {
    /// Encrypt pod traffic
    #[serde(default, skip_serializing_if = "is_false")]
    pub encrypted: bool,
}

/// CNI installed and managed outside of Keel
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ExternalCniSpec {}

/// CNI plugin selection; exactly one field is expected to be set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CniConfig {
    /// Canal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canal: Option<CanalSpec>,
    /// Cilium
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cilium: Option<CiliumSpec>,
    /// WeaveNet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weave_net: Option<WeaveNetSpec>,
    /// Externally managed CNI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalCniSpec>,
}

impl CniConfig {
    /// Short name of the selected plugin
    pub fn plugin_name(&self) -> &'static str {
        if self.canal.is_some() {
            "canal"
        } else if self.cilium.is_some() {
            "cilium"
        } else if self.weave_net.is_some() {
            "weave-net"
        } else if self.external.is_some() {
            "external"
        } else {
            "none"
        }
    }
}

/// Cluster-wide network configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetworkConfig {
    /// Pod CIDR
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_subnet: String,
    /// Service CIDR
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_subnet: String,
    /// Cluster DNS domain
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_domain_name: String,
    /// NodePort range (`low-high`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_port_range: String,
    /// CNI plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cni: Option<CniConfig>,
}

/// HTTP proxy settings propagated to hosts
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// HTTP proxy URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http: String,
    /// HTTPS proxy URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub https: String,
    /// Comma-separated proxy exclusions
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub no_proxy: String,
}

impl ProxyConfig {
    /// Whether any proxy is configured
    pub fn is_configured(&self) -> bool {
        !self.http.is_empty() || !self.https.is_empty()
    }
}

// =============================================================================
// Features
// =============================================================================

/// metrics-server deployment toggle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct MetricsServerFeature {
    /// Deploy metrics-server
    #[serde(default)]
    pub enable: bool,
}

/// Static API server audit log settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StaticAuditLogConfig {
    /// Audit policy file on the control-plane hosts
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_file_path: String,
    /// Audit log destination
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_path: String,
    /// Days to retain old log files
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub log_max_age: u32,
    /// Number of rotated files to retain
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub log_max_backup: u32,
    /// Megabytes before rotation
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub log_max_size: u32,
}

/// Static audit log toggle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct StaticAuditLogFeature {
    /// Enable audit logging
    #[serde(default)]
    pub enable: bool,
    /// Audit log settings
    #[serde(default)]
    pub config: StaticAuditLogConfig,
}

/// OpenID Connect authentication settings for the API server
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenIdConnectConfig {
    /// Issuer URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issuer_url: String,
    /// OAuth client ID
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    /// JWT claim used as the user name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username_claim: String,
    /// Prefix added to user names
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username_prefix: String,
    /// JWT claim used as the group list
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub groups_claim: String,
    /// Prefix added to group names
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub groups_prefix: String,
    /// Required `key=value` claim
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub required_claim: String,
    /// Accepted signing algorithms (comma-separated)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signing_algs: String,
    /// CA bundle for the issuer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_file: String,
}

/// OpenID Connect toggle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct OpenIdConnectFeature {
    /// Enable OIDC authentication
    #[serde(default)]
    pub enable: bool,
    /// OIDC settings
    #[serde(default)]
    pub config: OpenIdConnectConfig,
}

/// Optional cluster features
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    /// metrics-server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_server: Option<MetricsServerFeature>,
    /// Static audit logging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_audit_log: Option<StaticAuditLogFeature>,
    /// OpenID Connect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_id_connect: Option<OpenIdConnectFeature>,
}

// =============================================================================
// Toggles and assets
// =============================================================================

/// machine-controller deployment toggle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct MachineControllerConfig {
    /// Deploy the machine-controller and apply MachineDeployments
    #[serde(default)]
    pub deploy: bool,
}

/// Host package management toggle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemPackages {
    /// Configure upstream package repositories on hosts
    #[serde(default)]
    pub configure_repositories: bool,
}

/// Image registry overrides
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfiguration {
    /// Registry replacing every upstream image registry
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub overwrite_registry: String,
    /// Allow plain-HTTP access to the registry
    #[serde(default, skip_serializing_if = "is_false")]
    pub insecure_registry: bool,
}

/// Image location override for one component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageAsset {
    /// Image repository
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_repository: String,
    /// Image tag
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_tag: String,
}

/// Image overrides for cluster components
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssetConfiguration {
    /// Control-plane images
    #[serde(default)]
    pub kubernetes: ImageAsset,
    /// CoreDNS image
    #[serde(default, rename = "coreDNS")]
    pub core_dns: ImageAsset,
    /// etcd image
    #[serde(default)]
    pub etcd: ImageAsset,
    /// metrics-server image
    #[serde(default)]
    pub metrics_server: ImageAsset,
}

/// User-supplied addon manifests
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Addons {
    /// Apply addons after installation
    #[serde(default)]
    pub enable: bool,
    /// Directory holding the addon manifests
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taint_display_matches_kubectl_format() {
        assert_eq!(
            Taint::control_plane().to_string(),
            "node-role.kubernetes.io/master:NoSchedule"
        );

        let taint = Taint {
            key: "dedicated".to_string(),
            value: "gpu".to_string(),
            effect: TaintEffect::NoExecute,
        };
        assert_eq!(taint.to_string(), "dedicated=gpu:NoExecute");
    }

    #[test]
    fn canal_mtu_follows_provider_network() {
        assert_eq!(ProviderName::Aws.canal_mtu(), 8951);
        assert_eq!(ProviderName::Gce.canal_mtu(), 1410);
        assert_eq!(ProviderName::Hetzner.canal_mtu(), 1400);
        assert_eq!(ProviderName::Openstack.canal_mtu(), 1400);
        assert_eq!(ProviderName::Azure.canal_mtu(), 1450);
        assert_eq!(ProviderName::None.canal_mtu(), 1450);
    }

    #[test]
    fn provider_name_parses_lowercase() {
        let spec: CloudProviderSpec = serde_yaml::from_str("name: hetzner").unwrap();
        assert_eq!(spec.name, ProviderName::Hetzner);
        assert_eq!(spec.name.to_string(), "hetzner");

        let spec: CloudProviderSpec = serde_yaml::from_str("{}").unwrap();
        assert_eq!(spec.name, ProviderName::None);
    }

    #[test]
    fn host_fields_use_camel_case() {
        let yaml = r#"
publicAddress: 203.0.113.10
privateAddress: 10.0.0.10
sshUsername: ubuntu
sshPrivateKeyFile: ~/.ssh/id_ed25519
bastion: 203.0.113.1
isLeader: true
taints:
  - key: dedicated
    effect: NoSchedule
"#;
        let host: HostConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(host.public_address, "203.0.113.10");
        assert_eq!(host.private_address, "10.0.0.10");
        assert_eq!(host.ssh_username, "ubuntu");
        assert!(host.is_leader);
        assert!(host.has_bastion());
        assert_eq!(host.taints.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn unset_and_empty_taints_are_distinguished() {
        let unset: HostConfig = serde_yaml::from_str("publicAddress: a").unwrap();
        assert_eq!(unset.taints, None);

        let empty: HostConfig = serde_yaml::from_str("publicAddress: a\ntaints: []").unwrap();
        assert_eq!(empty.taints, Some(vec![]));
    }

    #[test]
    fn cni_plugin_name_reflects_selection() {
        let cni = CniConfig {
            cilium: Some(CiliumSpec::default()),
            ..Default::default()
        };
        assert_eq!(cni.plugin_name(), "cilium");
        assert_eq!(CniConfig::default().plugin_name(), "none");

        let cni: CniConfig = serde_yaml::from_str("weaveNet:\n  encrypted: true").unwrap();
        assert_eq!(cni.plugin_name(), "weave-net");
    }

    #[test]
    fn display_name_prefers_hostname() {
        let mut host = HostConfig::new("203.0.113.10");
        assert_eq!(host.display_name(), "203.0.113.10");
        host.hostname = "cp-0".to_string();
        assert_eq!(host.display_name(), "cp-0");
    }
}
