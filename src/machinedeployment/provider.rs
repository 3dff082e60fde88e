//! Cloud provider payloads embedded in MachineDeployments
//!
//! Worker pools carry an opaque `cloudProviderSpec`. It is decoded here,
//! at the generator edge, into a [`ProviderPayload`] so provider-specific
//! rules (AWS cluster tagging) operate on typed data.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::crd::ProviderName;

/// AWS machine settings understood by the machine-controller
///
/// Fields Keel does not need to touch are kept verbatim in `extra`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsSpec {
    /// AMI ID
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ami: String,
    /// Availability zone
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub availability_zone: String,
    /// Instance type
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_type: String,
    /// IAM instance profile
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_profile: String,
    /// Region
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    /// Security group IDs
    #[serde(
        default,
        rename = "securityGroupIDs",
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub security_group_ids: Vec<String>,
    /// Subnet ID
    #[serde(default, rename = "subnetID", skip_serializing_if = "String::is_empty")]
    pub subnet_id: String,
    /// VPC ID
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vpc_id: String,
    /// Root disk size in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<i64>,
    /// Root disk type
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub disk_type: String,
    /// Instance tags
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: BTreeMap<String, String>,
    /// Remaining provider fields, passed through unchanged
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Treat an explicit `null` like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Decoded cloud provider payload
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderPayload {
    /// Amazon Web Services
    Aws(AwsSpec),
    /// Any provider without Keel-side rules
    Generic {
        /// Provider the payload belongs to
        provider: ProviderName,
        /// Payload object
        spec: Map<String, Value>,
    },
}

impl ProviderPayload {
    /// Decode a raw payload for `provider`; the payload must be an object
    pub fn decode(provider: ProviderName, raw: &Value) -> Result<Self, serde_json::Error> {
        match provider {
            ProviderName::Aws => Ok(Self::Aws(AwsSpec::deserialize(raw)?)),
            _ => Ok(Self::Generic {
                provider,
                spec: Map::deserialize(raw)?,
            }),
        }
    }

    /// Apply per-cluster provider rules
    ///
    /// AWS instances get `kubernetes.io/cluster/<cluster>=shared` so the
    /// cloud controller can find them; existing tags are kept.
    pub fn tag_for_cluster(&mut self, cluster: &str) {
        if let Self::Aws(spec) = self {
            spec.tags
                .insert(format!("kubernetes.io/cluster/{cluster}"), "shared".to_string());
        }
    }

    /// Encode back into a JSON object
    pub fn encode(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Aws(spec) => serde_json::to_value(spec),
            Self::Generic { spec, .. } => Ok(Value::Object(spec.clone())),
        }
    }

    /// Provider the payload belongs to
    pub fn provider(&self) -> ProviderName {
        match self {
            Self::Aws(_) => ProviderName::Aws,
            Self::Generic { provider, .. } => *provider,
        }
    }
}
