//! Templated shell scripts run on hosts
//!
//! Scripts and uploaded files are minijinja templates rendered per host
//! against a [`ScriptContext`]. Undefined values are an error when printed
//! but may be tested in `{% if %}` blocks.

use async_trait::async_trait;
use minijinja::{Environment, UndefinedBehavior, Value};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::{HostTask, TaskContext};
use crate::crd::{ClusterSpec, HostConfig, Taint};
use crate::pki::certificate_sans;
use crate::ssh::Executor;
use crate::state::{State, TaskOutput};
use crate::Error;

/// Phase whose leader output holds the join command
pub const JOIN_TOKEN_PHASE: &str = "create-join-token";

/// Template rendering errors
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Template failed to parse or render
    #[error("failed to render {name}: {source}")]
    Render {
        /// Template name
        name: String,
        /// minijinja error
        #[source]
        source: minijinja::Error,
    },
}

impl From<TemplateError> for Error {
    fn from(e: TemplateError) -> Self {
        Error::template(e.to_string())
    }
}

/// Host fields exposed to templates, every field always present
#[derive(Debug, Serialize)]
pub struct HostView {
    /// Host ID
    pub id: usize,
    /// SSH address
    pub address: String,
    /// Intra-cluster address
    pub private_address: String,
    /// Node name (hostname, or the private address when unknown)
    pub node_name: String,
    /// Whether the host is the control-plane leader
    pub is_leader: bool,
    /// Whether the host is part of the control plane
    pub control_plane: bool,
    /// Taints rendered as `key[=value]:Effect`
    pub taints: Vec<String>,
    /// Taints as structured values
    pub node_taints: Vec<Taint>,
    /// Operating system hint
    pub operating_system: String,
}

impl HostView {
    fn new(spec: &ClusterSpec, host: &HostConfig) -> Self {
        let node_name = if host.hostname.is_empty() {
            host.private_address.clone()
        } else {
            host.hostname.clone()
        };
        Self {
            id: host.id,
            address: host.public_address.clone(),
            private_address: host.private_address.clone(),
            node_name,
            is_leader: host.is_leader,
            control_plane: spec.control_plane.hosts.iter().any(|h| h.id == host.id),
            taints: host
                .taints
                .iter()
                .flatten()
                .map(ToString::to_string)
                .collect(),
            node_taints: host.taints.clone().unwrap_or_default(),
            operating_system: host.operating_system.clone(),
        }
    }
}

/// Join material produced on the leader
#[derive(Debug, Default, Serialize)]
pub struct JoinView {
    /// `kubeadm join ...` command, empty before the token phase ran
    pub command: String,
}

/// Values available to script templates
#[derive(Debug, Serialize)]
pub struct ScriptContext<'a> {
    /// Full normalized cluster document (camelCase keys)
    pub cluster: &'a ClusterSpec,
    /// Host being rendered for
    pub host: HostView,
    /// Control-plane leader
    pub leader: Option<HostView>,
    /// Every static host, leader first
    pub hosts: Vec<HostView>,
    /// Join material from the leader
    pub join: JoinView,
    /// API server certificate SANs
    pub api_sans: Vec<String>,
    /// Container runtime name (`containerd` or `docker`)
    pub container_runtime: String,
    /// CNI plugin name
    pub cni: &'static str,
    /// Running phase
    pub phase: &'a str,
}

impl<'a> ScriptContext<'a> {
    /// Build the context for `host` from the run state
    pub fn new(state: &'a State, host: &HostConfig, phase: &'a str) -> Self {
        let spec: &ClusterSpec = &state.spec;
        let mut hosts: Vec<&HostConfig> = spec.hosts().collect();
        hosts.sort_by_key(|h| (!h.is_leader, h.id));

        let join = state
            .leader_output(JOIN_TOKEN_PHASE)
            .map(|o| JoinView {
                command: o.stdout.trim().to_string(),
            })
            .unwrap_or_default();

        Self {
            cluster: spec,
            host: HostView::new(spec, host),
            leader: spec.leader().map(|l| HostView::new(spec, l)),
            hosts: hosts.into_iter().map(|h| HostView::new(spec, h)).collect(),
            join,
            api_sans: certificate_sans(
                &spec.api_endpoint.host,
                &spec.api_endpoint.alternative_names,
            ),
            container_runtime: spec
                .container_runtime
                .map(|r| r.to_string())
                .unwrap_or_else(|| "docker".to_string()),
            cni: spec
                .cluster_network
                .cni
                .as_ref()
                .map(|c| c.plugin_name())
                .unwrap_or("none"),
            phase,
        }
    }
}

/// Render `source` against `ctx`
pub fn render(name: &str, source: &str, ctx: &ScriptContext<'_>) -> Result<String, TemplateError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::SemiStrict);
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.render_str(source, Value::from_serialize(ctx))
        .map_err(|source| TemplateError::Render {
            name: name.to_string(),
            source,
        })
}

struct Upload {
    path: String,
    template: &'static str,
    mode: u32,
}

/// Runs a rendered bash script, optionally uploading rendered files first
pub struct ScriptTask {
    name: String,
    template: &'static str,
    uploads: Vec<Upload>,
}

impl ScriptTask {
    /// Script rendered from `template`
    pub fn new(name: impl Into<String>, template: &'static str) -> Self {
        Self {
            name: name.into(),
            template,
            uploads: Vec::new(),
        }
    }

    /// Render `template` to `path` on the host before the script runs
    pub fn with_upload(mut self, path: impl Into<String>, template: &'static str, mode: u32) -> Self {
        self.uploads.push(Upload {
            path: path.into(),
            template,
            mode,
        });
        self
    }

    /// Render the script for one host
    pub fn render(&self, ctx: &ScriptContext<'_>) -> Result<String, TemplateError> {
        render(&self.name, self.template, ctx)
    }
}

#[async_trait]
impl HostTask for ScriptTask {
    async fn run(&self, ctx: &TaskContext<'_>, exec: &dyn Executor) -> Result<TaskOutput, Error> {
        let script_ctx = ScriptContext::new(ctx.state, ctx.host, ctx.phase);

        for upload in &self.uploads {
            let content = render(&upload.path, upload.template, &script_ctx)?;
            debug!(host = %ctx.host.display_name(), path = %upload.path, "Uploading rendered file");
            exec.upload(&upload.path, content.as_bytes(), upload.mode)
                .await?;
        }

        let script = self.render(&script_ctx)?;
        let output = exec.run_script(&script).await?;
        Ok(TaskOutput::stdout(output.stdout))
    }
}
