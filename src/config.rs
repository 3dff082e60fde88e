//! Loading the cluster document and run settings
//!
//! The cluster document is YAML (JSON is accepted as a YAML subset) with
//! `apiVersion: keel.dev/v1beta1` and `kind: KeelCluster`. Run settings
//! come from built-in defaults, then `KEEL_*` environment variables, then
//! command-line flags.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::crd::{ClusterSpec, API_VERSION, KIND};
use crate::phases::DEFAULT_CONCURRENCY;
use crate::retry::RetryPolicy;
use crate::ssh::SshOptions;
use crate::Error;

/// Environment variable overriding [`RunConfig::concurrency`]
pub const ENV_CONCURRENCY: &str = "KEEL_CONCURRENCY";
/// Environment variable overriding [`RunConfig::command_timeout`], in seconds
pub const ENV_COMMAND_TIMEOUT: &str = "KEEL_COMMAND_TIMEOUT_SECS";
/// Environment variable overriding [`RunConfig::connect_timeout`], in seconds
pub const ENV_CONNECT_TIMEOUT: &str = "KEEL_CONNECT_TIMEOUT_SECS";
/// Environment variable overriding [`RunConfig::retry_attempts`]
pub const ENV_RETRY_ATTEMPTS: &str = "KEEL_RETRY_ATTEMPTS";

/// Settings of one install or reset run
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    /// Hosts worked on at once
    pub concurrency: usize,
    /// Limit for a single remote command
    pub command_timeout: Duration,
    /// SSH connect timeout
    pub connect_timeout: Duration,
    /// Attempts per host operation, including the first
    pub retry_attempts: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        let ssh = SshOptions::default();
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            command_timeout: ssh.command_timeout,
            connect_timeout: ssh.connect_timeout,
            retry_attempts: RetryPolicy::default().config.max_attempts,
        }
    }
}

impl RunConfig {
    /// Defaults overridden by `KEEL_*` environment variables
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by values from `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::default();
        if let Some(n) = parse_var::<usize>(&lookup, ENV_CONCURRENCY)? {
            config.concurrency = n.max(1);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_COMMAND_TIMEOUT)? {
            config.command_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_CONNECT_TIMEOUT)? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<u32>(&lookup, ENV_RETRY_ATTEMPTS)? {
            config.retry_attempts = n.max(1);
        }
        Ok(config)
    }

    /// SSH client options for this run
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            connect_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
            ..SshOptions::default()
        }
    }

    /// Retry policy for this run
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.retry_attempts)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, Error>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::validation(format!("{name}={raw}: {e}"))),
    }
}

/// Parse a cluster document
pub fn parse_cluster_spec(content: &str) -> Result<ClusterSpec, Error> {
    let spec: ClusterSpec = serde_yaml::from_str(content)
        .map_err(|e| Error::serialization(format!("invalid cluster document: {e}")))?;

    if spec.api_version != API_VERSION {
        return Err(Error::validation(format!(
            "unsupported apiVersion {:?}, expected {API_VERSION}",
            spec.api_version
        )));
    }
    if spec.kind != KIND {
        return Err(Error::validation(format!(
            "unsupported kind {:?}, expected {KIND}",
            spec.kind
        )));
    }
    Ok(spec)
}

/// Read and parse a cluster document from disk
pub async fn load_cluster_spec(path: &Path) -> Result<ClusterSpec, Error> {
    debug!(path = %path.display(), "Loading cluster document");
    let content = tokio::fs::read_to_string(path).await?;
    parse_cluster_spec(&content)
}

/// JSON schema of the cluster document
pub fn cluster_schema() -> Result<String, Error> {
    let schema = schemars::schema_for!(ClusterSpec);
    serde_json::to_string_pretty(&schema)
        .map_err(|e| Error::serialization(format!("failed to encode schema: {e}")))
}

/// Resolve an `env:VAR` reference to the variable's value
///
/// Plain values are returned unchanged. Returns `None` when the referenced
/// variable is unset.
pub fn resolve_env_reference(value: &str) -> Option<String> {
    match value.strip_prefix("env:") {
        Some(var) => std::env::var(var).ok(),
        None => Some(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const DOCUMENT: &str = r#"
apiVersion: keel.dev/v1beta1
kind: KeelCluster
name: prod
versions:
  kubernetes: v1.24.3
controlPlane:
  hosts:
  - publicAddress: 10.0.0.1
    sshPrivateKeyFile: ~/.ssh/id_ed25519
"#;

    // =========================================================================
    // Cluster Document Stories
    // =========================================================================

    /// Story: an operator's document is read from disk
    #[tokio::test]
    async fn story_document_is_loaded_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DOCUMENT.as_bytes()).unwrap();

        let spec = load_cluster_spec(file.path()).await.unwrap();
        assert_eq!(spec.name, "prod");
        assert_eq!(spec.control_plane.hosts.len(), 1);
        assert_eq!(spec.versions.kubernetes, "v1.24.3");
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let err = load_cluster_spec(Path::new("/nonexistent/keel/cluster.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn json_documents_are_accepted() {
        let spec = parse_cluster_spec(
            r#"{"apiVersion": "keel.dev/v1beta1", "kind": "KeelCluster", "name": "json"}"#,
        )
        .unwrap();
        assert_eq!(spec.name, "json");
    }

    /// Story: documents for another tool or version are rejected up front
    #[test]
    fn story_wrong_api_version_or_kind_is_rejected() {
        let err = parse_cluster_spec("apiVersion: v1\nkind: KeelCluster\nname: x\n").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("apiVersion"));

        let err =
            parse_cluster_spec("apiVersion: keel.dev/v1beta1\nkind: Cluster\nname: x\n").unwrap_err();
        assert!(err.to_string().contains("kind"));
    }

    #[test]
    fn malformed_yaml_is_a_serialization_error() {
        let err = parse_cluster_spec("controlPlane: [unterminated").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn schema_describes_the_document() {
        let schema = cluster_schema().unwrap();
        assert!(schema.contains("controlPlane"));
        assert!(schema.contains("dynamicWorkers"));
    }

    // =========================================================================
    // Run Settings Stories
    // =========================================================================

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    /// Story: environment variables override run defaults
    #[test]
    fn story_env_overrides_defaults() {
        let config = RunConfig::from_lookup(lookup(&[
            (ENV_CONCURRENCY, "4"),
            (ENV_COMMAND_TIMEOUT, "120"),
            (ENV_RETRY_ATTEMPTS, "5"),
        ]))
        .unwrap();

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.command_timeout, Duration::from_secs(120));
        assert_eq!(config.retry_attempts, 5);
        assert_eq!(config.connect_timeout, RunConfig::default().connect_timeout);
        assert_eq!(config.retry_policy().config.max_attempts, 5);
        assert_eq!(config.ssh_options().command_timeout, Duration::from_secs(120));
    }

    #[test]
    fn invalid_env_values_are_rejected() {
        let err = RunConfig::from_lookup(lookup(&[(ENV_CONCURRENCY, "many")])).unwrap_err();
        assert!(err.to_string().contains(ENV_CONCURRENCY));
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let config = RunConfig::from_lookup(lookup(&[(ENV_CONCURRENCY, "0")])).unwrap();
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn env_references_resolve() {
        std::env::set_var("KEEL_TEST_REFERENCE", "/tmp/agent");
        assert_eq!(
            resolve_env_reference("env:KEEL_TEST_REFERENCE").as_deref(),
            Some("/tmp/agent")
        );
        assert_eq!(resolve_env_reference("env:KEEL_TEST_UNSET_REFERENCE"), None);
        assert_eq!(resolve_env_reference("/run/agent").as_deref(), Some("/run/agent"));
    }
}
