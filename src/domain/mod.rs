//! Domain types for the shipyard orchestrator.
//!
//! This module contains the core data structures:
//! - Run: Pipeline execution state and stage executions
//! - Events: Persisted run records and lifecycle notifications
//! - Artifact: Opaque stage outputs
//! - Trigger: The event that starts a run

pub mod artifact;
pub mod events;
pub mod run;
pub mod trigger;

// Re-export commonly used types
pub use artifact::ArtifactRef;
pub use events::{LifecycleEvent, RunChange, RunEvent};
pub use run::{HaltCause, RollbackOutcome, Run, RunStatus, RunSummary, StageExecution, StageStatus};
pub use trigger::TriggerContext;
