//! Run state and reconstruction from persisted events.
//!
//! A Run is one execution of a pipeline definition. It exclusively owns
//! its stage executions; only the engine mutates them, and every mutation
//! is persisted as a [`RunEvent`] so the run can be rebuilt by replay.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ArtifactRef;
use super::events::{RunChange, RunEvent};
use super::trigger::TriggerContext;

/// A pipeline execution run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// When the run was created
    pub created_at: DateTime<Utc>,

    /// Name of the pipeline being executed
    pub pipeline_name: String,

    /// Version digest of the definition this run was created from
    pub definition_version: String,

    /// The trigger that started the run
    pub trigger: TriggerContext,

    /// Overall status
    pub status: RunStatus,

    /// Stage names in declaration order
    pub stage_order: Vec<String>,

    /// Execution record per stage
    pub stages: BTreeMap<String, StageExecution>,

    /// Outcome of the rollback phase
    #[serde(default)]
    pub rollback: RollbackOutcome,

    /// Why the run stopped dispatching, once it has
    #[serde(default)]
    pub halt: Option<HaltCause>,

    /// When the run reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a pending run with one pending execution per stage
    pub fn new<I, S>(
        pipeline_name: impl Into<String>,
        definition_version: impl Into<String>,
        trigger: TriggerContext,
        stage_names: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let stage_order: Vec<String> = stage_names.into_iter().map(Into::into).collect();
        let stages = stage_order
            .iter()
            .map(|name| (name.clone(), StageExecution::new(name.clone())))
            .collect();

        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            pipeline_name: pipeline_name.into(),
            definition_version: definition_version.into(),
            trigger,
            status: RunStatus::Pending,
            stage_order,
            stages,
            rollback: RollbackOutcome::NotAttempted,
            halt: None,
            completed_at: None,
        }
    }

    /// Reconstruct run state from a sequence of events.
    ///
    /// The first event must be the creation record; anything else means
    /// the log is not a run log.
    pub fn from_events(events: &[RunEvent]) -> Option<Self> {
        let (first, rest) = events.split_first()?;

        let mut run = match &first.change {
            RunChange::RunCreated { run } => run.as_ref().clone(),
            _ => return None,
        };

        for event in rest {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &RunEvent) {
        match &event.change {
            RunChange::RunCreated { run } => {
                *self = run.as_ref().clone();
            }
            RunChange::StageUpdated { execution } => {
                self.stages
                    .insert(execution.stage.clone(), execution.clone());
            }
            RunChange::StatusChanged { status, rollback } => {
                self.status = *status;
                self.rollback = *rollback;
                if status.is_terminal() {
                    self.completed_at = Some(event.timestamp);
                }
            }
            RunChange::Halted { cause } => {
                self.halt = Some(cause.clone());
            }
        }
    }

    /// Check if the run has reached a terminal status
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Look up a stage execution
    pub fn stage(&self, name: &str) -> Option<&StageExecution> {
        self.stages.get(name)
    }

    /// Status of a stage (Pending if unknown)
    pub fn stage_status(&self, name: &str) -> StageStatus {
        self.stages
            .get(name)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    /// Consistent snapshot of every stage status
    pub fn status_snapshot(&self) -> HashMap<String, StageStatus> {
        self.stages
            .iter()
            .map(|(name, exec)| (name.clone(), exec.status))
            .collect()
    }

    /// Stages that failed, with their last error, in declaration order
    pub fn failed_stages(&self) -> Vec<(String, String)> {
        self.ordered_stages()
            .filter(|exec| exec.status == StageStatus::Failed)
            .map(|exec| {
                (
                    exec.stage.clone(),
                    exec.last_error.clone().unwrap_or_default(),
                )
            })
            .collect()
    }

    /// Why this run stopped dispatching, if it has.
    ///
    /// Falls back to what the stages show when no halt record exists: a
    /// Failed stage, or a stage Skipped because the run was cancelled or
    /// timed out.
    pub fn halt_cause(&self) -> Option<HaltCause> {
        if let Some(ref cause) = self.halt {
            return Some(cause.clone());
        }
        if let Some((stage, _)) = self.failed_stages().into_iter().next() {
            return Some(HaltCause::StageFailed { stage });
        }
        [HaltCause::Cancelled, HaltCause::TimedOut]
            .into_iter()
            .find(|cause| {
                self.stages
                    .values()
                    .any(|exec| exec.skip_reason.as_deref() == Some(cause.reason()))
            })
    }

    /// Stage executions in declaration order
    pub fn ordered_stages(&self) -> impl Iterator<Item = &StageExecution> + '_ {
        self.stage_order
            .iter()
            .filter_map(move |name| self.stages.get(name))
    }

    /// True when every stage Succeeded or was Skipped
    pub fn all_stages_satisfied(&self) -> bool {
        self.stages.values().all(|s| s.status.satisfies_dependents())
    }

    /// Compact view for listings
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id,
            pipeline_name: self.pipeline_name.clone(),
            status: self.status,
            created_at: self.created_at,
            completed_at: self.completed_at,
            stages: self
                .ordered_stages()
                .map(|exec| (exec.stage.clone(), exec.status))
                .collect(),
        }
    }
}

/// Queryable summary of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// (stage, status) in declaration order
    pub stages: Vec<(String, StageStatus)>,
}

/// Overall status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet driven
    Pending,

    /// Being driven by an engine (or interrupted while it was)
    Running,

    /// Every stage Succeeded or was Skipped
    Succeeded,

    /// A stage failed and rollback did not fully compensate
    Failed,

    /// A stage failed and every executed rollback action succeeded
    RolledBack,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::RolledBack)
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "rolled_back" | "rolledback" => Ok(Self::RolledBack),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// Outcome of the rollback phase of a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOutcome {
    /// No rollback action was executed
    NotAttempted,

    /// Every executed rollback action succeeded
    Succeeded,

    /// Some rollback actions succeeded, some failed
    Partial,

    /// Every executed rollback action failed
    Failed,
}

impl RollbackOutcome {
    /// Derive the outcome from counts of compensated and failed actions
    pub fn from_counts(compensated: usize, failed: usize) -> Self {
        match (compensated, failed) {
            (0, 0) => Self::NotAttempted,
            (_, 0) => Self::Succeeded,
            (0, _) => Self::Failed,
            _ => Self::Partial,
        }
    }
}

impl Default for RollbackOutcome {
    fn default() -> Self {
        Self::NotAttempted
    }
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotAttempted => "not attempted",
            Self::Succeeded => "succeeded",
            Self::Partial => "partially succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a run stopped dispatching new stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltCause {
    /// A stage failed for good
    StageFailed { stage: String },
    Cancelled,
    TimedOut,
}

impl HaltCause {
    /// Skip reason given to stages that never started
    pub fn reason(&self) -> &'static str {
        match self {
            Self::StageFailed { .. } => "run halted",
            Self::Cancelled => "run cancelled",
            Self::TimedOut => "run timed out",
        }
    }
}

/// Execution record of one stage within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    /// Stage name
    pub stage: String,

    /// Current status
    pub status: StageStatus,

    /// Number of attempts started so far
    pub attempts: u32,

    /// When the first attempt started
    pub started_at: Option<DateTime<Utc>>,

    /// When the stage reached a terminal status
    pub ended_at: Option<DateTime<Utc>>,

    /// Artifact produced on success
    pub artifact: Option<ArtifactRef>,

    /// Error from the most recent failed attempt
    pub last_error: Option<String>,

    /// Why the stage was skipped
    #[serde(default)]
    pub skip_reason: Option<String>,

    /// Error from the rollback action, if it failed
    #[serde(default)]
    pub rollback_error: Option<String>,
}

impl StageExecution {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Pending,
            attempts: 0,
            started_at: None,
            ended_at: None,
            artifact: None,
            last_error: None,
            skip_reason: None,
            rollback_error: None,
        }
    }
}

/// Status of a stage execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not yet started
    Pending,

    /// Dependencies satisfied, waiting for a dispatch slot
    Ready,

    /// Adapter call in progress
    Running,

    /// Completed successfully
    Succeeded,

    /// Failed permanently
    Failed,

    /// Failed an attempt, waiting out the backoff delay
    Retrying,

    /// Not executed
    Skipped,

    /// Succeeded, then compensated by its rollback action
    RolledBack,
}

impl StageStatus {
    /// Terminal statuses are never left again within a run
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::RolledBack
        )
    }

    /// Whether a dependent stage may start
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    /// Not yet started in this run
    pub fn is_waiting(self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Skipped => "skipped",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::RunEvent;

    fn sample_run() -> Run {
        Run::new(
            "release",
            "v1:abc",
            TriggerContext::new("deadbeef", "release.yaml"),
            ["provision", "build"],
        )
    }

    #[test]
    fn test_run_creation() {
        let run = sample_run();

        assert_eq!(run.pipeline_name, "release");
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.stage_order, vec!["provision", "build"]);
        assert_eq!(run.stage_status("build"), StageStatus::Pending);
        assert!(!run.is_finished());
    }

    #[test]
    fn test_run_from_events() {
        let run = sample_run();
        let run_id = run.id;

        let mut provision = StageExecution::new("provision");
        provision.status = StageStatus::Succeeded;
        provision.attempts = 1;
        provision.artifact = Some(ArtifactRef::new("rs-1"));

        let mut build = StageExecution::new("build");
        build.status = StageStatus::Failed;
        build.attempts = 3;
        build.last_error = Some("build failed: compiler exploded".to_string());

        let events = vec![
            RunEvent::created(&run),
            RunEvent::stage_updated(run_id, &provision),
            RunEvent::stage_updated(run_id, &build),
            RunEvent::status_changed(run_id, RunStatus::Failed, RollbackOutcome::NotAttempted),
        ];

        let rebuilt = Run::from_events(&events).unwrap();

        assert_eq!(rebuilt.id, run_id);
        assert_eq!(rebuilt.status, RunStatus::Failed);
        assert!(rebuilt.completed_at.is_some());
        assert_eq!(rebuilt.stage("provision").unwrap().artifact, Some(ArtifactRef::new("rs-1")));
        assert_eq!(
            rebuilt.failed_stages(),
            vec![("build".to_string(), "build failed: compiler exploded".to_string())]
        );
    }

    #[test]
    fn test_from_events_requires_creation_record() {
        let run = sample_run();
        let events = vec![RunEvent::stage_updated(run.id, &StageExecution::new("build"))];
        assert!(Run::from_events(&events).is_none());
        assert!(Run::from_events(&[]).is_none());
    }

    #[test]
    fn test_halt_cause_prefers_record_then_stages() {
        let mut run = sample_run();
        assert_eq!(run.halt_cause(), None);

        let mut build = StageExecution::new("build");
        build.status = StageStatus::Skipped;
        build.skip_reason = Some("run cancelled".to_string());
        run.apply_event(&RunEvent::stage_updated(run.id, &build));
        assert_eq!(run.halt_cause(), Some(HaltCause::Cancelled));

        let mut provision = StageExecution::new("provision");
        provision.status = StageStatus::Failed;
        run.apply_event(&RunEvent::stage_updated(run.id, &provision));
        assert_eq!(
            run.halt_cause(),
            Some(HaltCause::StageFailed {
                stage: "provision".to_string()
            })
        );

        run.apply_event(&RunEvent::halted(run.id, &HaltCause::TimedOut));
        assert_eq!(run.halt, Some(HaltCause::TimedOut));
        assert_eq!(run.halt_cause(), Some(HaltCause::TimedOut));
    }

    #[test]
    fn test_disabled_skip_is_not_a_halt() {
        let mut run = sample_run();
        let mut build = StageExecution::new("build");
        build.status = StageStatus::Skipped;
        build.skip_reason = Some("disabled".to_string());
        run.apply_event(&RunEvent::stage_updated(run.id, &build));

        assert_eq!(run.halt_cause(), None);
    }

    #[test]
    fn test_rollback_outcome_from_counts() {
        assert_eq!(RollbackOutcome::from_counts(0, 0), RollbackOutcome::NotAttempted);
        assert_eq!(RollbackOutcome::from_counts(3, 0), RollbackOutcome::Succeeded);
        assert_eq!(RollbackOutcome::from_counts(2, 1), RollbackOutcome::Partial);
        assert_eq!(RollbackOutcome::from_counts(0, 2), RollbackOutcome::Failed);
    }

    #[test]
    fn test_run_status_parsing() {
        assert_eq!("failed".parse::<RunStatus>(), Ok(RunStatus::Failed));
        assert_eq!("rolled-back".parse::<RunStatus>(), Ok(RunStatus::RolledBack));
        assert!("exploded".parse::<RunStatus>().is_err());
    }
}
