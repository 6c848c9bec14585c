//! az / kubectl / helm CLI wrapper
//!
//! Every Azure and Kubernetes call goes through a [`CommandRunner`] so the
//! provisioner can be exercised against scripted output.

use crate::error::{AzureError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Runs one external command and returns its stdout
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        token: &CancellationToken,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<String>;
}

/// Runs commands as child processes
///
/// A child still running when the token is cancelled is killed.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        token: &CancellationToken,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<String> {
        let command_line = format!("{} {}", program, args.join(" "));
        tracing::debug!("Running: {}", command_line);

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AzureError::CliNotFound(program.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
        }

        let output = tokio::select! {
            _ = token.cancelled() => return Err(AzureError::Cancelled),
            output = child.wait_with_output() => output?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AzureError::CommandFailed {
                command: command_line,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Typed access to the three CLIs used by the provisioner
#[derive(Clone)]
pub struct AzureCli {
    runner: std::sync::Arc<dyn CommandRunner>,
    subscription_id: String,
}

impl AzureCli {
    pub fn new(runner: std::sync::Arc<dyn CommandRunner>, subscription_id: impl Into<String>) -> Self {
        Self {
            runner,
            subscription_id: subscription_id.into(),
        }
    }

    /// Run `az` against the configured subscription
    pub async fn az(&self, token: &CancellationToken, args: &[&str]) -> Result<String> {
        let mut args = owned(args);
        if !self.subscription_id.is_empty() {
            args.push("--subscription".to_string());
            args.push(self.subscription_id.clone());
        }
        args.push("--output".to_string());
        args.push("json".to_string());
        self.runner.run(token, "az", &args, None).await
    }

    pub async fn az_json<T: DeserializeOwned>(
        &self,
        token: &CancellationToken,
        args: &[&str],
    ) -> Result<T> {
        let output = self.az(token, args).await?;
        Ok(serde_json::from_str(&output)?)
    }

    /// Like [`AzureCli::az_json`], but a missing resource is `None`
    pub async fn az_show<T: DeserializeOwned>(
        &self,
        token: &CancellationToken,
        args: &[&str],
    ) -> Result<Option<T>> {
        match self.az_json(token, args).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn kubectl(
        &self,
        token: &CancellationToken,
        kubeconfig: &Path,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<String> {
        let mut full = vec!["--kubeconfig".to_string(), kubeconfig.display().to_string()];
        full.extend(owned(args));
        self.runner.run(token, "kubectl", &full, stdin).await
    }

    /// Render a `kubectl create` command client-side and apply it
    ///
    /// `kubectl create` fails on existing objects; applying the rendered
    /// manifest does not.
    pub async fn kubectl_create_or_update(
        &self,
        token: &CancellationToken,
        kubeconfig: &Path,
        create_args: &[&str],
    ) -> Result<()> {
        let mut render = vec!["create"];
        render.extend_from_slice(create_args);
        render.extend_from_slice(&["--dry-run=client", "--output", "yaml"]);
        let manifest = self.kubectl(token, kubeconfig, &render, None).await?;
        self.kubectl_apply(token, kubeconfig, &manifest).await
    }

    /// Apply a YAML or JSON manifest fed through stdin
    pub async fn kubectl_apply(
        &self,
        token: &CancellationToken,
        kubeconfig: &Path,
        manifest: &str,
    ) -> Result<()> {
        self.kubectl(token, kubeconfig, &["apply", "--filename", "-"], Some(manifest))
            .await?;
        Ok(())
    }

    pub async fn helm(
        &self,
        token: &CancellationToken,
        kubeconfig: &Path,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<String> {
        let mut full = vec!["--kubeconfig".to_string(), kubeconfig.display().to_string()];
        full.extend(owned(args));
        self.runner.run(token, "helm", &full, stdin).await
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}
