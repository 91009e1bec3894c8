//! Event types for the run log and lifecycle notifications.
//!
//! [`RunEvent`]s are the persisted source of truth: one JSON line per
//! state change, replayed to rebuild a [`Run`]. [`LifecycleEvent`]s are
//! what external sinks (logs, audit files, chat hooks) get told.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ArtifactRef;
use super::run::{HaltCause, RollbackOutcome, Run, RunStatus, StageExecution};

/// A single record in the append-only run log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event was recorded (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// What changed
    #[serde(flatten)]
    pub change: RunChange,
}

impl RunEvent {
    /// Create an event with the current timestamp
    pub fn new(run_id: Uuid, change: RunChange) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            change,
        }
    }

    /// Creation record carrying the full initial run
    pub fn created(run: &Run) -> Self {
        Self::new(
            run.id,
            RunChange::RunCreated {
                run: Box::new(run.clone()),
            },
        )
    }

    /// Full snapshot of one stage execution
    pub fn stage_updated(run_id: Uuid, execution: &StageExecution) -> Self {
        Self::new(
            run_id,
            RunChange::StageUpdated {
                execution: execution.clone(),
            },
        )
    }

    /// Overall status transition
    pub fn status_changed(run_id: Uuid, status: RunStatus, rollback: RollbackOutcome) -> Self {
        Self::new(run_id, RunChange::StatusChanged { status, rollback })
    }

    /// The run stopped dispatching
    pub fn halted(run_id: Uuid, cause: &HaltCause) -> Self {
        Self::new(
            run_id,
            RunChange::Halted {
                cause: cause.clone(),
            },
        )
    }

    /// Stage name, for stage-level records
    pub fn stage(&self) -> Option<&str> {
        match &self.change {
            RunChange::StageUpdated { execution } => Some(&execution.stage),
            _ => None,
        }
    }
}

/// The state change a [`RunEvent`] records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunChange {
    /// A new run was created
    RunCreated { run: Box<Run> },

    /// A stage execution changed (full snapshot, last one wins)
    StageUpdated { execution: StageExecution },

    /// The run's overall status changed
    StatusChanged {
        status: RunStatus,
        rollback: RollbackOutcome,
    },

    /// The run stopped dispatching; recorded before any stage is skipped
    Halted { cause: HaltCause },
}

/// Ordered lifecycle notifications emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    RunStarted {
        run_id: Uuid,
        pipeline: String,
    },
    RunResumed {
        run_id: Uuid,
        /// Stages found Running from a previous engine
        interrupted: Vec<String>,
    },
    StageStarted {
        run_id: Uuid,
        stage: String,
        attempt: u32,
    },
    StageSucceeded {
        run_id: Uuid,
        stage: String,
        artifact: Option<ArtifactRef>,
    },
    StageRetrying {
        run_id: Uuid,
        stage: String,
        attempt: u32,
        delay_ms: u64,
    },
    StageFailed {
        run_id: Uuid,
        stage: String,
        error: String,
    },
    StageSkipped {
        run_id: Uuid,
        stage: String,
        reason: String,
    },
    StageRolledBack {
        run_id: Uuid,
        stage: String,
    },
    RollbackFailed {
        run_id: Uuid,
        stage: String,
        error: String,
    },
    RunSucceeded {
        run_id: Uuid,
    },
    RunRolledBack {
        run_id: Uuid,
        compensated: Vec<String>,
    },
    RunFailed {
        run_id: Uuid,
        failing: Vec<String>,
    },
}

impl LifecycleEvent {
    /// The run this notification is about
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::RunResumed { run_id, .. }
            | Self::StageStarted { run_id, .. }
            | Self::StageSucceeded { run_id, .. }
            | Self::StageRetrying { run_id, .. }
            | Self::StageFailed { run_id, .. }
            | Self::StageSkipped { run_id, .. }
            | Self::StageRolledBack { run_id, .. }
            | Self::RollbackFailed { run_id, .. }
            | Self::RunSucceeded { run_id }
            | Self::RunRolledBack { run_id, .. }
            | Self::RunFailed { run_id, .. } => *run_id,
        }
    }

    /// The stage this notification is about, if stage-level
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::StageStarted { stage, .. }
            | Self::StageSucceeded { stage, .. }
            | Self::StageRetrying { stage, .. }
            | Self::StageFailed { stage, .. }
            | Self::StageSkipped { stage, .. }
            | Self::StageRolledBack { stage, .. }
            | Self::RollbackFailed { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{StageStatus, TriggerContext};

    #[test]
    fn test_run_event_serialization() {
        let mut execution = StageExecution::new("deploy");
        execution.status = StageStatus::Running;
        execution.attempts = 2;

        let event = RunEvent::stage_updated(Uuid::new_v4(), &execution);
        let json = serde_json::to_string(&event).unwrap();

        assert!(json.contains("\"type\":\"stage_updated\""));

        let parsed: RunEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.stage(), Some("deploy"));
    }

    #[test]
    fn test_created_event_carries_run() {
        let run = Run::new("release", "v1:0", TriggerContext::default(), ["a"]);
        let event = RunEvent::created(&run);

        let json = serde_json::to_string(&event).unwrap();
        let parsed: RunEvent = serde_json::from_str(&json).unwrap();

        match parsed.change {
            RunChange::RunCreated { run: parsed_run } => assert_eq!(*parsed_run, run),
            other => panic!("unexpected change: {:?}", other),
        }
    }

    #[test]
    fn test_halted_record_format() {
        let cause = HaltCause::StageFailed {
            stage: "deploy".to_string(),
        };
        let event = RunEvent::halted(Uuid::new_v4(), &cause);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"halted\""));
        assert!(json.contains("\"cause\":{\"kind\":\"stage_failed\",\"stage\":\"deploy\"}"));

        let parsed: RunEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.change, RunChange::Halted { cause });
    }

    #[test]
    fn test_lifecycle_event_tagging() {
        let run_id = Uuid::new_v4();
        let event = LifecycleEvent::StageRetrying {
            run_id,
            stage: "build".to_string(),
            attempt: 2,
            delay_ms: 1500,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "stage_retrying");
        assert_eq!(json["delay_ms"], 1500);
        assert_eq!(event.run_id(), run_id);
        assert_eq!(event.stage(), Some("build"));
    }
}
