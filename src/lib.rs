//! shipyard - Release pipeline orchestrator
//!
//! Sequences and supervises the tools of a release workflow
//! (infrastructure provisioner, image builder and registry, orchestration
//! platform, configuration manager) as one pipeline of dependent stages.
//!
//! # Architecture
//!
//! - A pipeline definition is a DAG of stages, validated and cycle-checked
//!   at load time
//! - The engine runs ready stages concurrently, retries failed attempts
//!   with backoff, and rolls back succeeded stages in reverse order when a
//!   stage fails for good
//! - Every stage transition is appended to a per-run log before the engine
//!   acts on it, so an interrupted run can be resumed
//!
//! # Modules
//!
//! - `adapters`: Capability traits for external tools, plus a command adapter
//! - `core`: Definitions, stage graph, run store, engine, notifiers
//! - `domain`: Data structures (Run, StageExecution, events)
//! - `config`: Layered configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline
//! shipyard run release.yaml --commit "$(git rev-parse HEAD)"
//!
//! # Check run status
//! shipyard status <run-id>
//!
//! # Resume an interrupted run
//! shipyard resume <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{AdapterError, AdapterSet, CancelHandle, CancelSignal, Capability};
pub use core::{Engine, EngineOptions, PipelineDefinition, RunResult, RunStore};
pub use domain::{LifecycleEvent, Run, RunStatus, StageStatus, TriggerContext};
