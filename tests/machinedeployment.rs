//! Worker pool descriptors generated from a complete cluster document

use keel::config::parse_cluster_spec;
use keel::defaults::normalize;
use keel::machinedeployment::{generate_all, render_manifest, MachineDeployment};

const DOCUMENT: &str = r#"
apiVersion: keel.dev/v1beta1
kind: KeelCluster
name: prod
versions:
  kubernetes: v1.24.3
cloudProvider:
  name: aws
controlPlane:
  hosts:
  - publicAddress: 203.0.113.10
    privateAddress: 10.0.0.10
    sshPrivateKeyFile: ~/.ssh/id_ed25519
dynamicWorkers:
- name: general
  replicas: 3
  providerSpec:
    operatingSystem: ubuntu
    labels:
      tier: general
    cloudProviderSpec:
      region: eu-west-1
      instanceType: t3.large
      subnetID: subnet-123
      tags:
        team: platform
- name: gpu
  replicas: 0
  providerSpec:
    operatingSystem: ubuntu
    taints:
    - key: nvidia.com/gpu
      effect: NoSchedule
    cloudProviderSpec:
      region: eu-west-1
      instanceType: p3.2xlarge
"#;

fn normalized() -> keel::crd::ClusterSpec {
    let mut spec = parse_cluster_spec(DOCUMENT).unwrap();
    normalize(&mut spec);
    spec.validate().unwrap();
    spec
}

/// Story: every pool of a document becomes one MachineDeployment
#[test]
fn story_document_pools_become_machine_deployments() {
    let spec = normalized();
    let deployments = generate_all(&spec).unwrap();

    assert_eq!(deployments.len(), 2);
    let general = &deployments[0];
    assert_eq!(general.metadata.name.as_deref(), Some("general"));
    assert_eq!(general.spec.replicas, 3);
    assert_eq!(general.spec.template.spec.versions.kubelet, "1.24.3");

    let payload = &general.spec.template.spec.provider_spec.value;
    assert_eq!(payload["cloudProvider"], "aws");
    assert_eq!(payload["cloudProviderSpec"]["subnetID"], "subnet-123");
    assert_eq!(payload["cloudProviderSpec"]["tags"]["team"], "platform");
    assert_eq!(
        payload["cloudProviderSpec"]["tags"]["kubernetes.io/cluster/prod"],
        "shared"
    );

    let gpu = &deployments[1];
    assert_eq!(gpu.spec.replicas, 0);
    assert_eq!(gpu.spec.template.spec.taints.len(), 1);
}

/// Story: the rendered manifest parses back into the same descriptors
#[test]
fn story_rendered_manifest_round_trips() {
    let spec = normalized();
    let manifest = render_manifest(&spec).unwrap();

    let parsed: Vec<MachineDeployment> = manifest
        .split("---\n")
        .map(|doc| serde_yaml::from_str(doc).unwrap())
        .collect();
    assert_eq!(parsed, generate_all(&spec).unwrap());
}

#[test]
fn document_without_pools_renders_nothing() {
    let mut spec = normalized();
    spec.dynamic_workers.clear();
    assert_eq!(render_manifest(&spec).unwrap(), "");
}
