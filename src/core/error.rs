//! Error taxonomy for definition loading and run storage.
//!
//! Adapter failures live in [`crate::adapters::AdapterError`]; they are
//! contained by the engine and never surface from it as errors.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// A dependency cycle among stages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle detected: {}", path.join(" -> "))]
pub struct CycleError {
    /// Stages on the cycle; the first stage is repeated at the end
    pub path: Vec<String>,
}

/// Structural problems found while building the stage graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },
}

/// A pipeline definition could not be loaded. Fatal: no run is created.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read pipeline definition {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse pipeline definition: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unsupported definition version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("invalid pipeline definition: {0}")]
    Schema(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl LoadError {
    /// The cycle, if this load failed because of one
    pub fn as_cycle(&self) -> Option<&CycleError> {
        match self {
            Self::Graph(GraphError::Cycle(cycle)) => Some(cycle),
            _ => None,
        }
    }
}

/// Run state store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {0} not found")]
    NotFound(Uuid),

    #[error("run {0} already exists")]
    AlreadyExists(Uuid),

    #[error("run {0} is locked by another engine")]
    Locked(Uuid),

    #[error("corrupt run log {}: line {line}: {message}", path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
