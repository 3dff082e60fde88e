//! Keel - declarative multi-node Kubernetes provisioning over SSH
//!
//! Keel turns a single cluster document into a running cluster. It reaches
//! control-plane and worker hosts over SSH, bootstraps them with kubeadm,
//! and hands autoscaled worker pools to the machine-controller as
//! MachineDeployment objects.
//!
//! # Architecture
//!
//! A run is a straight pipeline with one shared, per-run [`state::State`]:
//! - the document is normalized ([`defaults`]) and validated ([`crd`])
//! - the [`phases::Orchestrator`] executes ordered phases on hosts reached
//!   through [`ssh`], retrying transient failures per [`retry`]
//! - PKI fetched from the leader feeds [`pki`] certificate issuance
//! - [`machinedeployment`] describes dynamic worker pools for the cluster
//!
//! # Modules
//!
//! - [`crd`] - Cluster document types (KeelCluster, hosts, worker pools)
//! - [`defaults`] - Ordered normalization pipeline
//! - [`config`] - Document loading, run settings, schema
//! - [`pki`] - Cluster CA loading and service certificate issuance
//! - [`ssh`] - Remote execution over the OpenSSH client
//! - [`phases`] - Phase model, orchestrator and install/reset catalogues
//! - [`machinedeployment`] - MachineDeployment generation and apply
//! - [`install`] - Installer driving install and reset runs
//! - [`state`] - Per-run orchestration context
//! - [`retry`] - Exponential backoff with jitter
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod defaults;
pub mod error;
pub mod install;
pub mod machinedeployment;
pub mod phases;
pub mod pki;
pub mod retry;
pub mod ssh;
pub mod state;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
