//! Adapter interfaces for external tools.
//!
//! Each externally-owned tool (infrastructure provisioner, image
//! builder/registry, orchestration platform, configuration manager) sits
//! behind one capability trait. Every operation receives a
//! [`CancelSignal`] and must return [`AdapterError::Cancelled`] promptly
//! once it fires. Operations must be safe to repeat with the same input:
//! the engine retries them.

pub mod command;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::core::pipeline::{AdapterKind, PipelineDefinition};
use crate::domain::{ArtifactRef, TriggerContext};

// Re-export the command adapter
pub use command::CommandAdapter;

/// The four external capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Provisioner,
    Builder,
    Deployer,
    Configurator,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provisioner => "provisioner",
            Self::Builder => "builder",
            Self::Deployer => "deployer",
            Self::Configurator => "configurator",
        };
        f.write_str(s)
    }
}

/// Adapter failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("build failed: {0}")]
    Build(String),

    #[error("deploy failed: {0}")]
    Deploy(String),

    #[error("configuration failed: {0}")]
    Config(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{capability} does not support {operation}")]
    Unsupported {
        capability: Capability,
        operation: String,
    },

    #[error("missing input: {0}")]
    MissingInput(String),
}

impl AdapterError {
    /// Whether the engine may retry after this error
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled | Self::Unsupported { .. } | Self::MissingInput(_)
        )
    }

    /// The capability-specific failure variant for `capability`
    pub fn failure(capability: Capability, message: impl Into<String>) -> Self {
        let message = message.into();
        match capability {
            Capability::Provisioner => Self::Provision(message),
            Capability::Builder => Self::Build(message),
            Capability::Deployer => Self::Deploy(message),
            Capability::Configurator => Self::Config(message),
        }
    }
}

/// Sending half of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal; idempotent
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// A receiver for this handle
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: Some(self.tx.subscribe()),
        }
    }
}

/// Receiving half of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map_or(false, |rx| *rx.borrow())
    }

    /// Resolves once the signal fires; pends forever if it never can
    pub async fn cancelled(&self) {
        let Some(rx) = self.rx.as_ref() else {
            return std::future::pending().await;
        };

        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

/// Everything an adapter gets to know about the stage it runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInput {
    pub run_id: Uuid,
    pub stage: String,
    pub kind: AdapterKind,
    /// Plan, build spec, manifest or playbook reference
    pub action: String,
    pub params: BTreeMap<String, String>,
    pub trigger: TriggerContext,
    /// Artifacts of direct upstream stages, by stage name
    pub upstream: BTreeMap<String, ArtifactRef>,
    /// 1-indexed attempt number
    pub attempt: u32,
}

/// Provisioner input
pub type PlanInput = StageInput;
/// Builder input
pub type BuildSpec = StageInput;
/// Deployer input
pub type ManifestSpec = StageInput;
/// Configurator input
pub type PlaybookSpec = StageInput;

/// A compensating action for a previously succeeded stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub run_id: Uuid,
    pub stage: String,
    pub kind: AdapterKind,
    pub action: String,
    pub params: BTreeMap<String, String>,
    /// What the stage produced when it succeeded
    pub artifact: Option<ArtifactRef>,
}

/// Provisioned resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSet {
    /// Handle downstream stages refer to (state id, inventory name, ...)
    pub handle: String,
    pub resources: Vec<String>,
}

/// Result of a rollout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutStatus {
    pub revision: String,
    pub message: String,
}

/// Result of a configuration run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigReport {
    pub targets: Vec<String>,
    pub summary: String,
}

/// Infrastructure provisioner
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn apply(&self, plan: &PlanInput, cancel: &CancelSignal)
        -> Result<ResourceSet, AdapterError>;

    async fn rollback(
        &self,
        request: &RollbackRequest,
        cancel: &CancelSignal,
    ) -> Result<(), AdapterError> {
        let _ = (request, cancel);
        Err(AdapterError::Unsupported {
            capability: Capability::Provisioner,
            operation: "rollback".into(),
        })
    }
}

/// Image builder and registry
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, spec: &BuildSpec, cancel: &CancelSignal)
        -> Result<ArtifactRef, AdapterError>;

    /// Push a built artifact; returns its registry location
    async fn push(
        &self,
        artifact: &ArtifactRef,
        spec: &BuildSpec,
        cancel: &CancelSignal,
    ) -> Result<ArtifactRef, AdapterError>;

    async fn build_and_push(
        &self,
        spec: &BuildSpec,
        cancel: &CancelSignal,
    ) -> Result<ArtifactRef, AdapterError> {
        let built = self.build(spec, cancel).await?;
        self.push(&built, spec, cancel).await
    }

    async fn rollback(
        &self,
        request: &RollbackRequest,
        cancel: &CancelSignal,
    ) -> Result<(), AdapterError> {
        let _ = (request, cancel);
        Err(AdapterError::Unsupported {
            capability: Capability::Builder,
            operation: "rollback".into(),
        })
    }
}

/// Orchestration platform
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(
        &self,
        artifact: &ArtifactRef,
        manifest: &ManifestSpec,
        cancel: &CancelSignal,
    ) -> Result<RolloutStatus, AdapterError>;

    async fn rollback(
        &self,
        request: &RollbackRequest,
        cancel: &CancelSignal,
    ) -> Result<(), AdapterError> {
        let _ = (request, cancel);
        Err(AdapterError::Unsupported {
            capability: Capability::Deployer,
            operation: "rollback".into(),
        })
    }
}

/// Configuration manager
#[async_trait]
pub trait Configurator: Send + Sync {
    async fn configure(
        &self,
        targets: &[String],
        playbook: &PlaybookSpec,
        cancel: &CancelSignal,
    ) -> Result<ConfigReport, AdapterError>;

    async fn rollback(
        &self,
        request: &RollbackRequest,
        cancel: &CancelSignal,
    ) -> Result<(), AdapterError> {
        let _ = (request, cancel);
        Err(AdapterError::Unsupported {
            capability: Capability::Configurator,
            operation: "rollback".into(),
        })
    }
}

/// Adapter bindings for a pipeline
#[derive(Clone, Default)]
pub struct AdapterSet {
    pub provisioner: Option<Arc<dyn Provisioner>>,
    pub builder: Option<Arc<dyn Builder>>,
    pub deployer: Option<Arc<dyn Deployer>>,
    pub configurator: Option<Arc<dyn Configurator>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provisioner(mut self, adapter: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(adapter);
        self
    }

    pub fn with_builder(mut self, adapter: Arc<dyn Builder>) -> Self {
        self.builder = Some(adapter);
        self
    }

    pub fn with_deployer(mut self, adapter: Arc<dyn Deployer>) -> Self {
        self.deployer = Some(adapter);
        self
    }

    pub fn with_configurator(mut self, adapter: Arc<dyn Configurator>) -> Self {
        self.configurator = Some(adapter);
        self
    }

    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Provisioner => self.provisioner.is_some(),
            Capability::Builder => self.builder.is_some(),
            Capability::Deployer => self.deployer.is_some(),
            Capability::Configurator => self.configurator.is_some(),
        }
    }

    /// Capabilities the definition needs but that have no binding
    pub fn missing_for(&self, definition: &PipelineDefinition) -> Vec<Capability> {
        let mut missing: Vec<Capability> = definition
            .stages()
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.adapter.capability())
            .filter(|c| !self.has(*c))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}

impl fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterSet")
            .field("provisioner", &self.provisioner.is_some())
            .field("builder", &self.builder.is_some())
            .field("deployer", &self.deployer.is_some())
            .field("configurator", &self.configurator.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::StageSpec;
    use std::sync::Mutex;

    #[test]
    fn test_retriable_classification() {
        assert!(AdapterError::Build("oom".into()).is_retriable());
        assert!(AdapterError::Timeout(Duration::from_secs(30)).is_retriable());
        assert!(!AdapterError::Cancelled.is_retriable());
        assert!(!AdapterError::MissingInput("artifact".into()).is_retriable());
        assert!(!AdapterError::Unsupported {
            capability: Capability::Deployer,
            operation: "rollback".into()
        }
        .is_retriable());
    }

    #[test]
    fn test_timeout_message_keeps_subsecond_limits() {
        assert_eq!(
            AdapterError::Timeout(Duration::from_millis(250)).to_string(),
            "operation timed out after 250ms"
        );
        assert_eq!(
            AdapterError::Timeout(Duration::from_secs(30)).to_string(),
            "operation timed out after 30s"
        );
    }

    /// Records operations; `build` fails when `broken` is set
    #[derive(Default)]
    struct RecordingBuilder {
        broken: bool,
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Builder for RecordingBuilder {
        async fn build(
            &self,
            spec: &BuildSpec,
            _cancel: &CancelSignal,
        ) -> Result<ArtifactRef, AdapterError> {
            self.log.lock().unwrap().push("build".into());
            if self.broken {
                return Err(AdapterError::Build("compile error".into()));
            }
            Ok(ArtifactRef::new(format!("app:{}", spec.trigger.commit)))
        }

        async fn push(
            &self,
            artifact: &ArtifactRef,
            _spec: &BuildSpec,
            _cancel: &CancelSignal,
        ) -> Result<ArtifactRef, AdapterError> {
            self.log.lock().unwrap().push(format!("push {}", artifact));
            Ok(ArtifactRef::new(format!("registry.local/{}", artifact)))
        }
    }

    fn build_spec() -> BuildSpec {
        StageInput {
            run_id: Uuid::new_v4(),
            stage: "image".into(),
            kind: AdapterKind::Build,
            action: "Dockerfile".into(),
            params: BTreeMap::new(),
            trigger: TriggerContext::new("abc123", "release.yaml"),
            upstream: BTreeMap::new(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_build_and_push_pushes_what_was_built() {
        let builder = RecordingBuilder::default();

        let pushed = builder
            .build_and_push(&build_spec(), &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(pushed, ArtifactRef::new("registry.local/app:abc123"));
        assert_eq!(
            *builder.log.lock().unwrap(),
            vec!["build".to_string(), "push app:abc123".to_string()]
        );
    }

    #[tokio::test]
    async fn test_build_and_push_stops_on_build_failure() {
        let builder = RecordingBuilder {
            broken: true,
            ..Default::default()
        };

        let err = builder
            .build_and_push(&build_spec(), &CancelSignal::never())
            .await
            .unwrap_err();

        assert_eq!(err, AdapterError::Build("compile error".into()));
        assert_eq!(*builder.log.lock().unwrap(), vec!["build".to_string()]);
    }

    #[test]
    fn test_failure_maps_capability() {
        assert_eq!(
            AdapterError::failure(Capability::Configurator, "host down"),
            AdapterError::Config("host down".into())
        );
    }

    #[tokio::test]
    async fn test_cancel_signal_fires() {
        let handle = CancelHandle::new();
        let signal = handle.signal();
        assert!(!signal.is_cancelled());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.cancelled().await }
        });

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_never_signal_pends() {
        let signal = CancelSignal::never();
        let result =
            tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_bindings() {
        let definition = PipelineDefinition::new(
            "release",
            vec![
                StageSpec::new("build", AdapterKind::Build),
                StageSpec::new("push", AdapterKind::Push).depends_on(["build"]),
                StageSpec::new("deploy", AdapterKind::Deploy).depends_on(["push"]),
                StageSpec::new("configure", AdapterKind::Configure).disabled(),
            ],
        )
        .unwrap();

        let adapters = AdapterSet::new();
        assert_eq!(
            adapters.missing_for(&definition),
            vec![Capability::Builder, Capability::Deployer]
        );
    }
}
