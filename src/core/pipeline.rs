//! Pipeline definitions and loading.
//!
//! Pipelines are declared in versioned YAML documents listing stages,
//! each bound to one adapter kind, with dependencies, retry policy and
//! an optional rollback action. A [`PipelineDefinition`] only exists
//! once its document has passed schema validation and its stage graph
//! has been built, so an invalid definition never reaches the engine.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::adapters::Capability;

use super::error::LoadError;
use super::graph::StageGraph;
use super::safety::ExecutionLimits;

/// The only definition document version this build understands
pub const DEFINITION_VERSION: u32 = 1;

/// Raw definition document (matches the YAML structure)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDocument {
    /// Document format version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Pipeline name
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Run-wide limits declared by the pipeline
    #[serde(default)]
    pub limits: ExecutionLimits,

    /// Stages in declaration order
    pub stages: Vec<StageSpec>,
}

fn default_version() -> u32 {
    DEFINITION_VERSION
}

impl PipelineDocument {
    pub fn new(name: impl Into<String>, stages: Vec<StageSpec>) -> Self {
        Self {
            version: DEFINITION_VERSION,
            name: name.into(),
            description: String::new(),
            limits: ExecutionLimits::default(),
            stages,
        }
    }

    /// Check everything that does not need the graph
    fn validate_schema(&self) -> Result<(), LoadError> {
        if self.version != DEFINITION_VERSION {
            return Err(LoadError::UnsupportedVersion {
                found: self.version,
                supported: DEFINITION_VERSION,
            });
        }

        if self.name.trim().is_empty() {
            return Err(LoadError::Schema("pipeline name cannot be empty".into()));
        }

        if self.stages.is_empty() {
            return Err(LoadError::Schema(
                "pipeline must have at least one stage".into(),
            ));
        }

        self.limits.validate().map_err(LoadError::Schema)?;

        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(LoadError::Schema(format!("stage {} has an empty name", i)));
            }

            stage
                .retry_policy
                .validate()
                .map_err(|e| LoadError::Schema(format!("stage '{}': {}", stage.name, e)))?;

            if let Some(ref upstream) = stage.artifact_from {
                if !stage.depends_on.contains(upstream) {
                    return Err(LoadError::Schema(format!(
                        "stage '{}' takes its artifact from '{}', which is not one of its dependencies",
                        stage.name, upstream
                    )));
                }
            }

            if let Some(ref rollback) = stage.rollback {
                if rollback.action.trim().is_empty() {
                    return Err(LoadError::Schema(format!(
                        "stage '{}' declares a rollback with an empty action",
                        stage.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Short content digest (first 16 hex chars of SHA-256 over canonical JSON)
    fn digest(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let hash = Sha256::digest(canonical.as_bytes());
        hex::encode(&hash[..8])
    }
}

/// A validated, immutable pipeline definition
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    document: PipelineDocument,
    graph: StageGraph,
    version: String,
}

impl PipelineDefinition {
    /// Load a definition from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate a definition from YAML content
    pub fn from_yaml(content: &str) -> Result<Self, LoadError> {
        let document: PipelineDocument = serde_yaml::from_str(content)?;
        Self::from_document(document)
    }

    /// Validate a document and build its stage graph
    pub fn from_document(document: PipelineDocument) -> Result<Self, LoadError> {
        document.validate_schema()?;
        let graph = StageGraph::build(&document.stages)?;
        let version = format!("v{}:{}", document.version, document.digest());

        Ok(Self {
            document,
            graph,
            version,
        })
    }

    /// Convenience constructor for programmatic definitions
    pub fn new(name: impl Into<String>, stages: Vec<StageSpec>) -> Result<Self, LoadError> {
        Self::from_document(PipelineDocument::new(name, stages))
    }

    pub fn name(&self) -> &str {
        &self.document.name
    }

    pub fn description(&self) -> &str {
        &self.document.description
    }

    /// Version string recorded on runs: `v{format}:{digest}`
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.document.limits
    }

    /// Stages in declaration order
    pub fn stages(&self) -> &[StageSpec] {
        &self.document.stages
    }

    /// Get a stage by name
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.document.stages.iter().find(|s| s.name == name)
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn document(&self) -> &PipelineDocument {
        &self.document
    }
}

/// A single stage in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageSpec {
    /// Stage name (unique within the pipeline)
    pub name: String,

    /// Which adapter operation this stage invokes
    pub adapter: AdapterKind,

    /// Plan, build spec, manifest or playbook reference for the adapter
    #[serde(default)]
    pub action: String,

    /// Upstream stages that must finish first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Retry policy for this stage
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Compensating action invoked when a later stage fails permanently
    #[serde(default)]
    pub rollback: Option<RollbackAction>,

    /// Stage parameters handed to the adapter
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// Upstream stage whose artifact this stage consumes
    #[serde(default)]
    pub artifact_from: Option<String>,

    /// Per-attempt timeout
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Disabled stages are skipped and count as satisfied
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl StageSpec {
    pub fn new(name: impl Into<String>, adapter: AdapterKind) -> Self {
        Self {
            name: name.into(),
            adapter,
            action: String::new(),
            depends_on: Vec::new(),
            retry_policy: RetryPolicy::default(),
            rollback: None,
            params: BTreeMap::new(),
            artifact_from: None,
            timeout_seconds: None,
            enabled: true,
        }
    }

    pub fn depends_on<I, S>(mut self, upstream: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = upstream.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_rollback(mut self, action: impl Into<String>) -> Self {
        self.rollback = Some(RollbackAction {
            action: action.into(),
            params: BTreeMap::new(),
        });
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Per-attempt timeout, if configured
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

/// Stage kinds, one per external adapter operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Infrastructure provisioner apply
    Provision,

    /// Container image build
    Build,

    /// Registry push of a built image
    Push,

    /// Orchestration-platform rollout
    Deploy,

    /// Configuration-manager playbook run
    Configure,
}

impl AdapterKind {
    /// The adapter capability that serves this kind
    pub fn capability(self) -> Capability {
        match self {
            Self::Provision => Capability::Provisioner,
            Self::Build | Self::Push => Capability::Builder,
            Self::Deploy => Capability::Deployer,
            Self::Configure => Capability::Configurator,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Build => "build",
            Self::Push => "push",
            Self::Deploy => "deploy",
            Self::Configure => "configure",
        }
    }
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a compensating action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollbackAction {
    /// Action name passed to the adapter's rollback operation
    pub action: String,

    /// Extra parameters for the rollback
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Retry policy for failed stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Fraction of each delay that may be randomly shaved off
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Retry up to `max_attempts` times with no delay
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
            ..Default::default()
        }
    }

    /// Single attempt, never retried
    pub fn no_retry() -> Self {
        Self::immediate(1)
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry_policy.max_attempts must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("retry_policy.jitter must be between 0 and 1".into());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("retry_policy.backoff_multiplier must be at least 1".into());
        }
        Ok(())
    }

    /// Calculate delay for a specific attempt (1-indexed), without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Delay for an attempt with up to `jitter` of it randomly removed
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }

        // The low 62 bits of a v4 id are random; 53 of them make a uniform fraction
        let bits = Uuid::new_v4().as_u128() as u64 & ((1u64 << 53) - 1);
        let unit = bits as f64 / (1u64 << 53) as f64;
        let shave = unit * self.jitter.min(1.0);
        delay.mul_f64(1.0 - shave)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::GraphError;

    const RELEASE_YAML: &str = r#"
version: 1
name: release
description: Release pipeline

limits:
  concurrency_limit: 2

stages:
  - name: provision
    adapter: provision
    action: plans/prod.tfplan
    rollback:
      action: destroy

  - name: build
    adapter: build
    action: Dockerfile
    retry_policy:
      max_attempts: 5
      initial_delay_ms: 10

  - name: push
    adapter: push
    depends_on: [build]

  - name: deploy
    adapter: deploy
    depends_on: [provision, push]
    artifact_from: push
    timeout_seconds: 120
"#;

    #[test]
    fn test_definition_parsing() {
        let def = PipelineDefinition::from_yaml(RELEASE_YAML).unwrap();

        assert_eq!(def.name(), "release");
        assert_eq!(def.stages().len(), 4);
        assert_eq!(def.limits().concurrency_limit, Some(2));
        assert_eq!(def.stage("build").unwrap().retry_policy.max_attempts, 5);
        assert_eq!(
            def.stage("provision").unwrap().rollback.as_ref().unwrap().action,
            "destroy"
        );
        assert_eq!(def.stage("deploy").unwrap().timeout(), Some(Duration::from_secs(120)));
        assert!(def.version().starts_with("v1:"));
    }

    #[test]
    fn test_version_is_stable_and_content_sensitive() {
        let a = PipelineDefinition::from_yaml(RELEASE_YAML).unwrap();
        let b = PipelineDefinition::from_yaml(RELEASE_YAML).unwrap();
        assert_eq!(a.version(), b.version());

        let changed = RELEASE_YAML.replace("plans/prod.tfplan", "plans/staging.tfplan");
        let c = PipelineDefinition::from_yaml(&changed).unwrap();
        assert_ne!(a.version(), c.version());
    }

    #[test]
    fn test_unknown_adapter_kind_is_load_error() {
        let yaml = r#"
name: bad
stages:
  - name: first
    adapter: teleport
"#;
        let err = PipelineDefinition::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, LoadError::Parse(_)));
    }

    #[test]
    fn test_missing_dependency_is_load_error() {
        let yaml = r#"
name: bad
stages:
  - name: deploy
    adapter: deploy
    depends_on: [nonexistent]
"#;
        let err = PipelineDefinition::from_yaml(yaml).unwrap_err();
        assert!(matches!(
            err,
            LoadError::Graph(GraphError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let yaml = r#"
version: 7
name: future
stages:
  - name: a
    adapter: build
"#;
        let err = PipelineDefinition::from_yaml(yaml).unwrap_err();
        assert!(matches!(
            err,
            LoadError::UnsupportedVersion { found: 7, supported: 1 }
        ));
    }

    #[test]
    fn test_schema_violations() {
        let empty = PipelineDefinition::new("empty", vec![]).unwrap_err();
        assert!(matches!(empty, LoadError::Schema(_)));

        let zero_attempts = PipelineDefinition::new(
            "zero",
            vec![StageSpec::new("a", AdapterKind::Build).with_retry(RetryPolicy::immediate(0))],
        )
        .unwrap_err();
        assert!(matches!(zero_attempts, LoadError::Schema(_)));

        let mut stray = StageSpec::new("deploy", AdapterKind::Deploy);
        stray.artifact_from = Some("build".into());
        let err = PipelineDefinition::new(
            "stray",
            vec![StageSpec::new("build", AdapterKind::Build), stray],
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::Schema(_)));
    }

    #[test]
    fn test_unknown_stage_field_rejected() {
        let yaml = r#"
name: typo
stages:
  - name: a
    adapter: build
    depend_on: [b]
"#;
        assert!(matches!(
            PipelineDefinition::from_yaml(yaml),
            Err(LoadError::Parse(_))
        ));
    }

    #[test]
    fn test_adapter_kind_capabilities() {
        assert_eq!(AdapterKind::Build.capability(), Capability::Builder);
        assert_eq!(AdapterKind::Push.capability(), Capability::Builder);
        assert_eq!(AdapterKind::Configure.capability(), Capability::Configurator);
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_jittered_delay_stays_within_bounds() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            jitter: 0.5,
            ..Default::default()
        };

        for _ in 0..50 {
            let delay = policy.jittered_delay(2);
            assert!(delay <= Duration::from_millis(2000));
            assert!(delay >= Duration::from_millis(1000));
        }

        assert_eq!(RetryPolicy::immediate(3).jittered_delay(2), Duration::ZERO);
    }
}
