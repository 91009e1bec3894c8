//! Command adapter: drives an external tool through a subprocess.
//!
//! The configured executable is spawned once per operation. The stage
//! input is written to stdin as JSON and described again in `SHIPYARD_*`
//! environment variables for shell-script wrappers around terraform,
//! docker, kubectl, ansible and friends. The last non-empty stdout line
//! is the operation's result. A non-zero exit is a failure of the
//! adapter's capability; a cancellation kills the child.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::debug;

use super::{
    AdapterError, BuildSpec, Builder, CancelSignal, Capability, ConfigReport, Configurator,
    Deployer, ManifestSpec, PlanInput, PlaybookSpec, Provisioner, ResourceSet, RollbackRequest,
    RolloutStatus, StageInput,
};
use crate::core::safety::Secret;
use crate::domain::ArtifactRef;

/// Subprocess-backed adapter for any capability
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    capability: Capability,
    program: String,
    args: Vec<String>,
    endpoint: Option<String>,
    credential: Option<Secret>,
    timeout: Option<Duration>,
    permits: Option<Arc<Semaphore>>,
}

impl CommandAdapter {
    /// Create an adapter that runs `program` for the given capability
    pub fn new(capability: Capability, program: impl Into<String>) -> Self {
        Self {
            capability,
            program: program.into(),
            args: Vec::new(),
            endpoint: None,
            credential: None,
            timeout: None,
            permits: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_credential(mut self, credential: Secret) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Bound concurrent invocations of this adapter
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.permits = Some(Arc::new(Semaphore::new(limit.max(1))));
        self
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run one operation and return the last non-empty stdout line, if any
    async fn invoke(
        &self,
        operation: &str,
        payload: String,
        mut env: BTreeMap<String, String>,
        cancel: &CancelSignal,
    ) -> Result<Option<String>, AdapterError> {
        let _permit = match &self.permits {
            Some(permits) => Some(permits.clone().acquire_owned().await.map_err(|e| {
                AdapterError::failure(self.capability, format!("adapter semaphore closed: {e}"))
            })?),
            None => None,
        };

        if cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }

        env.insert("SHIPYARD_OPERATION".into(), operation.to_string());
        if let Some(ref endpoint) = self.endpoint {
            env.insert("SHIPYARD_ENDPOINT".into(), endpoint.clone());
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref credential) = self.credential {
            command.env("SHIPYARD_CREDENTIAL", credential.expose());
        }

        debug!(program = %self.program, operation, "Spawning adapter command");

        let mut child = command.spawn().map_err(|e| {
            AdapterError::failure(
                self.capability,
                format!("failed to spawn '{}' for {}: {}", self.program, operation, e),
            )
        })?;

        // Feeding stdin counts against the timeout: a tool that never reads
        // it must not stall the adapter once the pipe buffer fills
        let stdin = child.stdin.take();
        let exchange = async {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    // The tool may legitimately ignore stdin and exit early
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(AdapterError::failure(
                            self.capability,
                            format!("failed to write stdin of '{}': {}", self.program, e),
                        ));
                    }
                }
                // Dropping stdin signals EOF
            }
            Ok(child.wait_with_output().await)
        };

        let waited = match self.timeout {
            Some(limit) => tokio::select! {
                result = tokio::time::timeout(limit, exchange) => match result {
                    Ok(output) => output?,
                    Err(_) => return Err(AdapterError::Timeout(limit)),
                },
                _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
            },
            None => tokio::select! {
                output = exchange => output?,
                _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
            },
        };

        let output = waited.map_err(|e| {
            AdapterError::failure(
                self.capability,
                format!("failed to wait for '{}': {}", self.program, e),
            )
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(AdapterError::failure(
                self.capability,
                format!(
                    "'{}' {} exited with code {}: {}",
                    self.program,
                    operation,
                    exit_code,
                    stderr.trim()
                ),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(str::to_string))
    }

    async fn invoke_stage(
        &self,
        operation: &str,
        input: &StageInput,
        extra: &[(&str, String)],
        cancel: &CancelSignal,
    ) -> Result<String, AdapterError> {
        let payload = serde_json::to_string(input).map_err(|e| {
            AdapterError::failure(self.capability, format!("failed to encode stage input: {e}"))
        })?;

        let mut env = stage_env(input);
        for (key, value) in extra {
            env.insert((*key).to_string(), value.clone());
        }

        self.invoke(operation, payload, env, cancel)
            .await?
            .ok_or_else(|| {
                AdapterError::failure(
                    self.capability,
                    format!("'{}' {} produced no result on stdout", self.program, operation),
                )
            })
    }

    async fn invoke_rollback(
        &self,
        request: &RollbackRequest,
        cancel: &CancelSignal,
    ) -> Result<(), AdapterError> {
        let payload = serde_json::to_string(request).map_err(|e| {
            AdapterError::failure(self.capability, format!("failed to encode rollback: {e}"))
        })?;

        let mut env = param_env(&request.params);
        env.insert("SHIPYARD_RUN_ID".into(), request.run_id.to_string());
        env.insert("SHIPYARD_STAGE".into(), request.stage.clone());
        env.insert("SHIPYARD_KIND".into(), request.kind.to_string());
        env.insert("SHIPYARD_ACTION".into(), request.action.clone());
        if let Some(ref artifact) = request.artifact {
            env.insert("SHIPYARD_ARTIFACT".into(), artifact.to_string());
        }

        // Rollback result text is informational only
        self.invoke("rollback", payload, env, cancel).await.map(|_| ())
    }
}

fn stage_env(input: &StageInput) -> BTreeMap<String, String> {
    let mut env = param_env(&input.params);
    env.insert("SHIPYARD_RUN_ID".into(), input.run_id.to_string());
    env.insert("SHIPYARD_STAGE".into(), input.stage.clone());
    env.insert("SHIPYARD_KIND".into(), input.kind.to_string());
    env.insert("SHIPYARD_ACTION".into(), input.action.clone());
    env.insert("SHIPYARD_ATTEMPT".into(), input.attempt.to_string());
    env.insert("SHIPYARD_COMMIT".into(), input.trigger.commit.clone());
    env
}

fn param_env(params: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    params
        .iter()
        .map(|(key, value)| (format!("SHIPYARD_PARAM_{}", env_key(key)), value.clone()))
        .collect()
}

/// Uppercase, with anything outside [A-Z0-9] turned into '_'
fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl Provisioner for CommandAdapter {
    async fn apply(
        &self,
        plan: &PlanInput,
        cancel: &CancelSignal,
    ) -> Result<ResourceSet, AdapterError> {
        let handle = self.invoke_stage("apply", plan, &[], cancel).await?;
        Ok(ResourceSet {
            resources: vec![handle.clone()],
            handle,
        })
    }

    async fn rollback(
        &self,
        request: &RollbackRequest,
        cancel: &CancelSignal,
    ) -> Result<(), AdapterError> {
        self.invoke_rollback(request, cancel).await
    }
}

#[async_trait]
impl Builder for CommandAdapter {
    async fn build(
        &self,
        spec: &BuildSpec,
        cancel: &CancelSignal,
    ) -> Result<ArtifactRef, AdapterError> {
        self.invoke_stage("build", spec, &[], cancel)
            .await
            .map(ArtifactRef::from)
    }

    async fn push(
        &self,
        artifact: &ArtifactRef,
        spec: &BuildSpec,
        cancel: &CancelSignal,
    ) -> Result<ArtifactRef, AdapterError> {
        self.invoke_stage("push", spec, &[("SHIPYARD_ARTIFACT", artifact.to_string())], cancel)
            .await
            .map(ArtifactRef::from)
    }

    async fn rollback(
        &self,
        request: &RollbackRequest,
        cancel: &CancelSignal,
    ) -> Result<(), AdapterError> {
        self.invoke_rollback(request, cancel).await
    }
}

#[async_trait]
impl Deployer for CommandAdapter {
    async fn deploy(
        &self,
        artifact: &ArtifactRef,
        manifest: &ManifestSpec,
        cancel: &CancelSignal,
    ) -> Result<RolloutStatus, AdapterError> {
        let revision = self
            .invoke_stage(
                "deploy",
                manifest,
                &[("SHIPYARD_ARTIFACT", artifact.to_string())],
                cancel,
            )
            .await?;

        Ok(RolloutStatus {
            message: format!("rolled out {}", artifact),
            revision,
        })
    }

    async fn rollback(
        &self,
        request: &RollbackRequest,
        cancel: &CancelSignal,
    ) -> Result<(), AdapterError> {
        self.invoke_rollback(request, cancel).await
    }
}

#[async_trait]
impl Configurator for CommandAdapter {
    async fn configure(
        &self,
        targets: &[String],
        playbook: &PlaybookSpec,
        cancel: &CancelSignal,
    ) -> Result<ConfigReport, AdapterError> {
        let summary = self
            .invoke_stage(
                "configure",
                playbook,
                &[("SHIPYARD_TARGETS", targets.join(","))],
                cancel,
            )
            .await?;

        Ok(ConfigReport {
            targets: targets.to_vec(),
            summary,
        })
    }

    async fn rollback(
        &self,
        request: &RollbackRequest,
        cancel: &CancelSignal,
    ) -> Result<(), AdapterError> {
        self.invoke_rollback(request, cancel).await
    }
}
