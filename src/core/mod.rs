//! Core orchestration logic.
//!
//! This module contains:
//! - Pipeline: definition loading and validation
//! - Graph: stage dependency graph and ready-set computation
//! - RunStore: durable, append-only run state
//! - Engine: concurrent stage execution with retry and rollback
//! - Notifier: lifecycle event sinks
//! - Safety: execution limits and secret redaction

pub mod engine;
pub mod error;
pub mod graph;
pub mod notifier;
pub mod pipeline;
pub mod run_store;
pub mod safety;

// Re-export commonly used types
pub use engine::{Engine, EngineOptions, RunResult, StageReport};
pub use error::{CycleError, GraphError, LoadError, StoreError};
pub use graph::{StageGraph, StageNode};
pub use notifier::{CollectingNotifier, FanoutNotifier, JsonlNotifier, Notifier, TracingNotifier};
pub use pipeline::{
    AdapterKind, PipelineDefinition, PipelineDocument, RetryPolicy, RollbackAction, StageSpec,
};
pub use run_store::{RunFilter, RunLease, RunStore};
pub use safety::{ExecutionLimits, Redactor, Secret};
