//! Remote command execution
//!
//! Phases never talk to hosts directly: they receive a `&dyn Executor`
//! produced by a [`Connector`]. The production implementation drives the
//! system OpenSSH client ([`OpenSshConnector`]); tests substitute mocks.
//!
//! Executors do not reconnect or retry on their own. Failures are classified
//! by [`SshError::is_transient`] and retried by the orchestrator's policy.

mod openssh;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::config::resolve_env_reference;
use crate::crd::HostConfig;

pub use openssh::{OpenSshChannel, OpenSshConnector, SshOptions};

/// stderr fragments that indicate a dropped connection rather than a failed command
const TRANSIENT_MARKERS: &[&str] = &[
    "connection reset",
    "connection closed",
    "broken pipe",
    "connection timed out",
    "no route to host",
];

/// Remote execution errors
#[derive(Debug, Error)]
pub enum SshError {
    /// No usable credentials for the host
    #[error("authentication failed for {host}: {message}")]
    Auth {
        /// Target address
        host: String,
        /// Reason
        message: String,
    },

    /// Connection could not be established or was lost
    #[error("failed to connect to {host}: {message}")]
    Connect {
        /// Target address
        host: String,
        /// Client error output
        message: String,
    },

    /// Remote command exited non-zero
    #[error("command failed on {host} with exit code {exit_code}: {stderr}")]
    CommandFailed {
        /// Target address
        host: String,
        /// Exit code (-1 when killed by a signal)
        exit_code: i32,
        /// Remote error output
        stderr: String,
    },

    /// Remote command did not finish in time
    #[error("command on {host} timed out after {timeout:?}")]
    Timeout {
        /// Target address
        host: String,
        /// Configured limit
        timeout: Duration,
    },

    /// Local process error (ssh binary missing, pipe failure)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SshError {
    /// Whether the failure may go away on retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::Timeout { .. } => true,
            Self::CommandFailed { stderr, .. } => {
                let stderr = stderr.to_lowercase();
                TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m))
            }
            Self::Auth { .. } | Self::Io(_) => false,
        }
    }
}

/// Output of a successful remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit code (always 0 for returned outputs)
    pub exit_code: i32,
}

impl CommandOutput {
    /// Output with the given stdout and exit code 0
    pub fn from_stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }
}

/// Command channel to one host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a shell command; non-zero exit is an error
    async fn run(&self, command: &str) -> Result<CommandOutput, SshError>;

    /// Run a multi-line script with bash
    async fn run_script(&self, script: &str) -> Result<CommandOutput, SshError>;

    /// Write `content` to `path` with the given permission bits, creating parent directories
    async fn upload(&self, path: &str, content: &[u8], mode: u32) -> Result<(), SshError>;

    /// Read the file at `path`
    async fn download(&self, path: &str) -> Result<Vec<u8>, SshError>;
}

/// Opens command channels to hosts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel to `host`, failing early if it is unreachable
    async fn connect(&self, host: &HostConfig) -> Result<Box<dyn Executor>, SshError>;
}

/// Credentials used for one SSH hop
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SshAuth {
    /// Private key file
    KeyFile(PathBuf),
    /// ssh-agent socket
    Agent(PathBuf),
}

/// Resolve the credentials configured for `host`
///
/// A key file takes precedence and must exist. Otherwise the agent socket
/// (possibly an `env:VAR` reference) must resolve to a non-empty path.
pub async fn resolve_auth(host: &HostConfig) -> Result<SshAuth, SshError> {
    let address = host.public_address.clone();

    if !host.ssh_private_key_file.is_empty() {
        let path = expand_home(&host.ssh_private_key_file);
        return match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(SshAuth::KeyFile(path)),
            Ok(_) => Err(SshError::Auth {
                host: address,
                message: format!("private key {} is not a file", path.display()),
            }),
            Err(e) => Err(SshError::Auth {
                host: address,
                message: format!("private key {}: {e}", path.display()),
            }),
        };
    }

    if host.ssh_agent_socket.is_empty() {
        return Err(SshError::Auth {
            host: address,
            message: "no private key file or agent socket configured".to_string(),
        });
    }

    match resolve_env_reference(&host.ssh_agent_socket) {
        Some(socket) if !socket.is_empty() => Ok(SshAuth::Agent(expand_home(&socket))),
        _ => Err(SshError::Auth {
            host: address,
            message: format!("agent socket {} is not set", host.ssh_agent_socket),
        }),
    }
}

/// Expand a leading `~/` to the current user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Error Classification Stories
    // =========================================================================

    /// Story: a dropped connection mid-command is worth retrying
    #[test]
    fn story_connection_markers_in_stderr_are_transient() {
        let reset = SshError::CommandFailed {
            host: "10.0.0.1".to_string(),
            exit_code: 1,
            stderr: "Connection reset by peer".to_string(),
        };
        assert!(reset.is_transient());

        let failed = SshError::CommandFailed {
            host: "10.0.0.1".to_string(),
            exit_code: 1,
            stderr: "E: Unable to locate package kubeadm".to_string(),
        };
        assert!(!failed.is_transient());
    }

    #[test]
    fn connect_and_timeout_are_transient_auth_is_not() {
        let connect = SshError::Connect {
            host: "h".to_string(),
            message: "refused".to_string(),
        };
        let timeout = SshError::Timeout {
            host: "h".to_string(),
            timeout: Duration::from_secs(1),
        };
        let auth = SshError::Auth {
            host: "h".to_string(),
            message: "no key".to_string(),
        };
        assert!(connect.is_transient());
        assert!(timeout.is_transient());
        assert!(!auth.is_transient());
        assert!(timeout.to_string().contains("timed out"));
    }

    // =========================================================================
    // Credential Resolution Stories
    // =========================================================================

    /// Story: a configured key file is used when it exists
    #[tokio::test]
    async fn story_existing_key_file_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, "key").unwrap();

        let host = HostConfig {
            ssh_private_key_file: key.to_string_lossy().to_string(),
            ssh_agent_socket: "env:SSH_AUTH_SOCK".to_string(),
            ..HostConfig::new("10.0.0.1")
        };
        assert_eq!(resolve_auth(&host).await.unwrap(), SshAuth::KeyFile(key));
    }

    #[tokio::test]
    async fn missing_key_file_is_an_auth_error() {
        let host = HostConfig {
            ssh_private_key_file: "/nonexistent/keel/id_rsa".to_string(),
            ..HostConfig::new("10.0.0.1")
        };
        let err = resolve_auth(&host).await.unwrap_err();
        assert!(matches!(err, SshError::Auth { .. }));
        assert!(err.to_string().contains("/nonexistent/keel/id_rsa"));
    }

    /// Story: `env:VAR` agent references resolve through the environment
    #[tokio::test]
    async fn story_agent_socket_reference_is_resolved() {
        std::env::set_var("KEEL_TEST_AGENT_SOCK", "/run/user/1000/agent.sock");
        let host = HostConfig {
            ssh_agent_socket: "env:KEEL_TEST_AGENT_SOCK".to_string(),
            ..HostConfig::new("10.0.0.1")
        };
        assert_eq!(
            resolve_auth(&host).await.unwrap(),
            SshAuth::Agent(PathBuf::from("/run/user/1000/agent.sock"))
        );

        let unset = HostConfig {
            ssh_agent_socket: "env:KEEL_TEST_AGENT_SOCK_UNSET".to_string(),
            ..HostConfig::new("10.0.0.1")
        };
        assert!(matches!(
            resolve_auth(&unset).await,
            Err(SshError::Auth { .. })
        ));
    }

    #[tokio::test]
    async fn no_credentials_is_an_auth_error() {
        let host = HostConfig::new("10.0.0.1");
        assert!(matches!(
            resolve_auth(&host).await,
            Err(SshError::Auth { .. })
        ));
    }

    #[test]
    fn expand_home_only_touches_tilde_prefix() {
        assert_eq!(expand_home("/etc/key"), PathBuf::from("/etc/key"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expand_home("~/.ssh/id"), PathBuf::from(home).join(".ssh/id"));
        }
    }
}
