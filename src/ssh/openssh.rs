//! Executor backed by the system OpenSSH client
//!
//! Each command spawns `ssh` through `tokio::process`. Connection reuse,
//! host key handling and agent forwarding are left to the client; Keel only
//! passes non-interactive options so a missing key or unknown host never
//! blocks on a prompt.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{resolve_auth, CommandOutput, Connector, Executor, SshAuth, SshError};
use crate::crd::HostConfig;

/// Exit status OpenSSH reserves for its own errors
const SSH_CLIENT_ERROR: i32 = 255;

/// Options shared by every channel
#[derive(Clone, Debug)]
pub struct SshOptions {
    /// ssh client binary
    pub program: PathBuf,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Limit on a single remote command
    pub command_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ssh"),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(600),
        }
    }
}

/// Creates [`OpenSshChannel`]s
#[derive(Clone, Debug, Default)]
pub struct OpenSshConnector {
    options: SshOptions,
}

impl OpenSshConnector {
    /// Create a connector with the given options
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for OpenSshConnector {
    async fn connect(&self, host: &HostConfig) -> Result<Box<dyn Executor>, SshError> {
        let channel = OpenSshChannel::connect(host, self.options.clone()).await?;
        Ok(Box::new(channel))
    }
}

/// Raw result of one ssh invocation
struct RawOutput {
    stdout: Vec<u8>,
    stderr: String,
}

/// Command channel to a single host
#[derive(Debug)]
pub struct OpenSshChannel {
    address: String,
    port: u16,
    user: String,
    auth: SshAuth,
    bastion: Option<Bastion>,
    options: SshOptions,
}

#[derive(Debug)]
struct Bastion {
    address: String,
    port: u16,
    user: String,
}

impl OpenSshChannel {
    /// Resolve credentials for `host` and verify it answers
    pub async fn connect(host: &HostConfig, options: SshOptions) -> Result<Self, SshError> {
        let auth = resolve_auth(host).await?;

        let bastion = host.has_bastion().then(|| Bastion {
            address: host.bastion.clone(),
            port: non_zero_port(host.bastion_port),
            user: if host.bastion_user.is_empty() {
                host.ssh_username.clone()
            } else {
                host.bastion_user.clone()
            },
        });

        let channel = Self {
            address: host.public_address.clone(),
            port: non_zero_port(host.ssh_port),
            user: if host.ssh_username.is_empty() {
                "root".to_string()
            } else {
                host.ssh_username.clone()
            },
            auth,
            bastion,
            options,
        };

        debug!(host = %channel.address, bastion = ?channel.bastion.as_ref().map(|b| &b.address), "probing ssh connection");
        channel.exec("true", None).await?;
        Ok(channel)
    }

    /// Address the channel connects to
    pub fn address(&self) -> &str {
        &self.address
    }

    fn needs_sudo(&self) -> bool {
        self.user != "root"
    }

    /// Wrap a command so it runs with root privileges
    fn privileged(&self, command: &str) -> String {
        if self.needs_sudo() {
            format!("sudo -n bash -c {}", shell_quote(command))
        } else {
            command.to_string()
        }
    }

    /// Client options common to the target and the bastion hop
    fn common_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "BatchMode=yes",
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
            "LogLevel=ERROR",
        ]
        .iter()
        .flat_map(|o| ["-o".to_string(), o.to_string()])
        .collect();
        args.push("-o".to_string());
        args.push(format!(
            "ConnectTimeout={}",
            self.options.connect_timeout.as_secs().max(1)
        ));
        if let SshAuth::KeyFile(key) = &self.auth {
            args.extend([
                "-i".to_string(),
                key.display().to_string(),
                "-o".to_string(),
                "IdentitiesOnly=yes".to_string(),
            ]);
        }
        args
    }

    /// Full argument list for running `remote` on the target
    pub(crate) fn ssh_args(&self, remote: &str) -> Vec<String> {
        let mut args = self.common_args();

        if let Some(bastion) = &self.bastion {
            let hop = self
                .common_args()
                .into_iter()
                .map(|a| shell_quote(&a))
                .collect::<Vec<_>>()
                .join(" ");
            args.push("-o".to_string());
            args.push(format!(
                "ProxyCommand={} {hop} -p {} -W %h:%p {}@{}",
                self.options.program.display(),
                bastion.port,
                bastion.user,
                bastion.address
            ));
        }

        args.extend([
            "-p".to_string(),
            self.port.to_string(),
            format!("{}@{}", self.user, self.address),
            "--".to_string(),
            remote.to_string(),
        ]);
        args
    }

    async fn exec(&self, remote: &str, stdin: Option<&[u8]>) -> Result<RawOutput, SshError> {
        let mut command = Command::new(&self.options.program);
        command
            .args(self.ssh_args(remote))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let SshAuth::Agent(socket) = &self.auth {
            command.env("SSH_AUTH_SOCK", socket);
        }

        let mut child = command.spawn()?;
        let input = child.stdin.take();

        let run = async move {
            let write = async {
                if let (Some(mut pipe), Some(bytes)) = (input, stdin) {
                    pipe.write_all(bytes).await?;
                    pipe.shutdown().await?;
                }
                Ok::<_, std::io::Error>(())
            };
            let (_, output) = tokio::try_join!(write, child.wait_with_output())?;
            Ok::<_, std::io::Error>(output)
        };

        let output = tokio::time::timeout(self.options.command_timeout, run)
            .await
            .map_err(|_| SshError::Timeout {
                host: self.address.clone(),
                timeout: self.options.command_timeout,
            })??;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => Ok(RawOutput {
                stdout: output.stdout,
                stderr,
            }),
            Some(code) => Err(classify_exit(&self.address, code, stderr)),
            None => Err(SshError::CommandFailed {
                host: self.address.clone(),
                exit_code: -1,
                stderr,
            }),
        }
    }
}

#[async_trait]
impl Executor for OpenSshChannel {
    async fn run(&self, command: &str) -> Result<CommandOutput, SshError> {
        debug!(host = %self.address, command = %command, "running remote command");
        let raw = self.exec(&self.privileged(command), None).await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&raw.stdout).to_string(),
            stderr: raw.stderr,
            exit_code: 0,
        })
    }

    async fn run_script(&self, script: &str) -> Result<CommandOutput, SshError> {
        debug!(host = %self.address, bytes = script.len(), "running remote script");
        let shell = if self.needs_sudo() {
            "sudo -n bash -s"
        } else {
            "bash -s"
        };
        let raw = self.exec(shell, Some(script.as_bytes())).await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&raw.stdout).to_string(),
            stderr: raw.stderr,
            exit_code: 0,
        })
    }

    async fn upload(&self, path: &str, content: &[u8], mode: u32) -> Result<(), SshError> {
        debug!(host = %self.address, path = %path, bytes = content.len(), "uploading file");
        let target = shell_quote(path);
        let dir = Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| ".".to_string());
        let command = format!(
            "mkdir -p {} && cat > {target} && chmod {mode:o} {target}",
            shell_quote(&dir)
        );
        self.exec(&self.privileged(&command), Some(content)).await?;
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, SshError> {
        debug!(host = %self.address, path = %path, "downloading file");
        let raw = self
            .exec(&self.privileged(&format!("cat {}", shell_quote(path))), None)
            .await?;
        Ok(raw.stdout)
    }
}

fn non_zero_port(port: u16) -> u16 {
    if port == 0 {
        22
    } else {
        port
    }
}

/// Map a non-zero ssh exit status to an error
///
/// 255 is the client's own failure: refused or dropped connections are
/// [`SshError::Connect`], rejected credentials are [`SshError::Auth`].
fn classify_exit(host: &str, code: i32, stderr: String) -> SshError {
    if code == SSH_CLIENT_ERROR {
        if stderr.contains("Permission denied") {
            return SshError::Auth {
                host: host.to_string(),
                message: stderr,
            };
        }
        return SshError::Connect {
            host: host.to_string(),
            message: stderr,
        };
    }
    SshError::CommandFailed {
        host: host.to_string(),
        exit_code: code,
        stderr,
    }
}

/// Quote a string for a POSIX shell
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
