//! Error types for Keel
//!
//! Lower-level modules own their own error enums ([`PkiError`], [`SshError`],
//! [`MachineDeploymentError`]); this type aggregates them so the phase
//! orchestrator can wrap any failure with the phase and host it happened on.

use thiserror::Error;

use crate::machinedeployment::MachineDeploymentError;
use crate::pki::PkiError;
use crate::ssh::SshError;

/// Main error type for Keel operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration defect that survived normalization
    #[error("validation error: {0}")]
    Validation(String),

    /// Certificate authority or certificate issuance failure
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// Remote execution failure
    #[error("remote execution error: {0}")]
    Ssh(#[from] SshError),

    /// Worker-fleet descriptor generation failure
    #[error("machine deployment error: {0}")]
    MachineDeployment(#[from] MachineDeploymentError),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Script or config template could not be rendered
    #[error("template error: {0}")]
    Template(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Local I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Orchestration state was not in the shape a phase expected
    #[error("internal error: {0}")]
    Internal(String),

    /// A phase operation failed on a specific host
    #[error("phase {phase} failed on host {host_id}: {source}")]
    Phase {
        /// Name of the phase that failed
        phase: String,
        /// ID of the host the operation ran on
        host_id: usize,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a template error with the given message
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap an error with the phase and host it occurred on
    pub fn phase(phase: impl Into<String>, host_id: usize, source: Error) -> Self {
        Self::Phase {
            phase: phase.into(),
            host_id,
            source: Box::new(source),
        }
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Only remote-execution connection problems and timeouts qualify, plus
    /// transport-level Kubernetes API failures. Everything else is fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Ssh(e) => e.is_transient(),
            Self::Kube(kube::Error::HyperError(_)) | Self::Kube(kube::Error::Service(_)) => true,
            Self::Phase { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation Through a Provisioning Run
    // ==========================================================================

    /// Story: configuration defects are caught before anything touches a host
    #[test]
    fn story_validation_errors_describe_the_defect() {
        let err = Error::validation("more than one control plane host is marked as leader");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("leader"));

        match Error::validation("any message") {
            Error::Validation(msg) => assert_eq!(msg, "any message"),
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: the orchestrator wraps host failures with phase context
    #[test]
    fn story_phase_errors_carry_phase_and_host() {
        let cause = SshError::CommandFailed {
            host: "10.0.0.2".to_string(),
            exit_code: 1,
            stderr: "kubeadm: command not found".to_string(),
        };
        let err = Error::phase("kubeadm-init", 2, cause.into());

        let msg = err.to_string();
        assert!(msg.contains("kubeadm-init"));
        assert!(msg.contains("host 2"));
        assert!(msg.contains("command not found"));

        match err {
            Error::Phase { phase, host_id, .. } => {
                assert_eq!(phase, "kubeadm-init");
                assert_eq!(host_id, 2);
            }
            _ => panic!("Expected Phase variant"),
        }
    }

    /// Story: only connection-level problems are worth retrying
    #[test]
    fn story_transient_classification() {
        let connect: Error = SshError::Connect {
            host: "10.0.0.1".to_string(),
            message: "Connection timed out".to_string(),
        }
        .into();
        assert!(connect.is_transient());

        // Wrapping keeps the classification of the cause
        assert!(Error::phase("preflight", 0, connect).is_transient());

        let failed: Error = SshError::CommandFailed {
            host: "10.0.0.1".to_string(),
            exit_code: 2,
            stderr: "permission denied".to_string(),
        }
        .into();
        assert!(!failed.is_transient());

        assert!(!Error::validation("bad config").is_transient());
        assert!(!Error::from(PkiError::EmptyCertificate("ca.crt".to_string())).is_transient());
    }

    #[test]
    fn error_helpers_accept_str_and_string() {
        let pool = "workers-a";
        let err = Error::serialization(format!("failed to encode pool {}", pool));
        assert!(err.to_string().contains("workers-a"));

        let err = Error::template("undefined value");
        assert!(err.to_string().contains("template error"));

        let err = Error::internal("CA not loaded");
        assert!(err.to_string().contains("CA not loaded"));
    }
}
