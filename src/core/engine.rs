//! Execution engine for pipeline runs.
//!
//! One engine call drives one Run. The control loop is the only writer of
//! run state: adapter calls and retry timers run as tasks in a `JoinSet`
//! and report back, and every transition is persisted through the
//! [`RunStore`] before the loop acts on it. Ready stages are computed from
//! a snapshot of all stage statuses, so a stage is never dispatched before
//! its dependencies' completions are on disk.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    AdapterError, AdapterSet, CancelHandle, CancelSignal, Capability, RollbackRequest, StageInput,
};
use crate::domain::{
    ArtifactRef, HaltCause, LifecycleEvent, RollbackOutcome, Run, RunStatus, StageExecution,
    StageStatus, TriggerContext,
};

use super::notifier::{Notifier, TracingNotifier};
use super::pipeline::{AdapterKind, PipelineDefinition, StageSpec};
use super::run_store::RunStore;
use super::safety::{ExecutionLimits, Redactor};

/// Error recorded on a stage whose engine died mid-attempt
pub const INTERRUPTED: &str = "interrupted";

/// Engine-wide limits, combined with each definition's own limits
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Maximum concurrently running stages
    pub concurrency_limit: Option<usize>,

    /// Wall-clock limit for one drive of a run
    pub run_timeout: Option<Duration>,
}

/// Drives pipeline runs
pub struct Engine {
    store: Arc<RunStore>,
    adapters: AdapterSet,
    notifier: Arc<dyn Notifier>,
    options: EngineOptions,
    redactor: Redactor,
}

impl Engine {
    pub fn new(store: Arc<RunStore>, adapters: AdapterSet) -> Self {
        Self {
            store,
            adapters,
            notifier: Arc::new(TracingNotifier),
            options: EngineOptions::default(),
            redactor: Redactor::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    /// Create a run for `definition` and drive it to a terminal status
    pub async fn run(
        &self,
        definition: &PipelineDefinition,
        trigger: TriggerContext,
    ) -> Result<RunResult> {
        self.run_with_cancel(definition, trigger, CancelSignal::never())
            .await
    }

    /// Like [`Engine::run`], aborting when `cancel` fires
    #[instrument(skip(self, definition, trigger, cancel), fields(pipeline = %definition.name()))]
    pub async fn run_with_cancel(
        &self,
        definition: &PipelineDefinition,
        trigger: TriggerContext,
        cancel: CancelSignal,
    ) -> Result<RunResult> {
        self.check_bindings(definition)?;

        let run = Run::new(
            definition.name(),
            definition.version(),
            trigger,
            definition.stages().iter().map(|s| s.name.clone()),
        );
        self.store.create(&run).await?;
        let _lease = self.store.acquire(run.id).await?;

        info!(run_id = %run.id, "Starting pipeline run");
        self.notifier
            .notify(&LifecycleEvent::RunStarted {
                run_id: run.id,
                pipeline: run.pipeline_name.clone(),
            })
            .await;

        RunDriver::new(self, definition, run).drive(cancel).await
    }

    /// Continue a stored run after a restart
    pub async fn resume(&self, run_id: Uuid, definition: &PipelineDefinition) -> Result<RunResult> {
        self.resume_with_cancel(run_id, definition, CancelSignal::never())
            .await
    }

    /// Like [`Engine::resume`], aborting when `cancel` fires.
    ///
    /// A run already in a terminal status is returned as stored. Stages
    /// found Running were interrupted: each counts as a failed attempt and
    /// is retried if its policy allows. Succeeded stages are never re-run.
    #[instrument(skip(self, definition, cancel), fields(run_id = %run_id))]
    pub async fn resume_with_cancel(
        &self,
        run_id: Uuid,
        definition: &PipelineDefinition,
        cancel: CancelSignal,
    ) -> Result<RunResult> {
        let run = self.store.get(run_id).await?;
        if run.is_finished() {
            info!(status = %run.status, "Run already finished, nothing to resume");
            return Ok(RunResult::from_run(&run));
        }

        if run.definition_version != definition.version() {
            bail!(
                "Run {} was created from definition {} but {} was supplied",
                run_id,
                run.definition_version,
                definition.version()
            );
        }
        self.check_bindings(definition)?;

        let _lease = self.store.acquire(run_id).await?;
        // Re-read under the lease; another engine may have moved it on
        let run = self.store.get(run_id).await?;
        if run.is_finished() {
            return Ok(RunResult::from_run(&run));
        }

        let mut driver = RunDriver::new(self, definition, run);
        driver.recover().await?;
        driver.drive(cancel).await
    }

    fn check_bindings(&self, definition: &PipelineDefinition) -> Result<()> {
        let missing = self.adapters.missing_for(definition);
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(Capability::to_string).collect();
            bail!(
                "Pipeline '{}' needs adapters that are not configured: {}",
                definition.name(),
                names.join(", ")
            );
        }
        Ok(())
    }
}

/// What a finished drive reports to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub pipeline: String,
    pub status: RunStatus,
    /// Per-stage outcome in declaration order
    pub stages: Vec<StageReport>,
    /// Failed stages with their last error
    pub failed: Vec<(String, String)>,
    pub rollback: RollbackOutcome,
}

impl RunResult {
    pub fn from_run(run: &Run) -> Self {
        Self {
            run_id: run.id,
            pipeline: run.pipeline_name.clone(),
            status: run.status,
            stages: run.ordered_stages().map(StageReport::from).collect(),
            failed: run.failed_stages(),
            rollback: run.rollback,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == name)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Outcome of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub status: StageStatus,
    pub attempts: u32,
    pub artifact: Option<ArtifactRef>,
    pub error: Option<String>,
    pub skip_reason: Option<String>,
    pub rollback_error: Option<String>,
}

impl From<&StageExecution> for StageReport {
    fn from(exec: &StageExecution) -> Self {
        Self {
            stage: exec.stage.clone(),
            status: exec.status,
            attempts: exec.attempts,
            artifact: exec.artifact.clone(),
            error: exec.last_error.clone(),
            skip_reason: exec.skip_reason.clone(),
            rollback_error: exec.rollback_error.clone(),
        }
    }
}

/// Result of a background task, consumed by the control loop
enum TaskOutcome {
    /// An adapter call returned
    Finished {
        stage: String,
        result: Result<Option<ArtifactRef>, AdapterError>,
    },
    /// A retry delay elapsed
    RetryDue { stage: String },
    /// A retry delay was cut short by a halt
    RetryAbandoned { stage: String },
}

enum LoopEvent {
    Task(Option<Result<TaskOutcome, tokio::task::JoinError>>),
    Cancelled,
    TimedOut,
}

/// State of one drive of one run
struct RunDriver<'a> {
    engine: &'a Engine,
    definition: &'a PipelineDefinition,
    run: Run,
    tasks: JoinSet<TaskOutcome>,
    /// Adapter calls in flight (retry timers excluded)
    running: usize,
    limits: ExecutionLimits,
    run_timeout: Option<Duration>,
    /// Reaches every adapter call
    cancel: CancelHandle,
    /// Wakes retry timers once the run stops dispatching
    halt: CancelHandle,
    halted: Option<HaltCause>,
}

impl<'a> RunDriver<'a> {
    fn new(engine: &'a Engine, definition: &'a PipelineDefinition, run: Run) -> Self {
        let engine_limits = ExecutionLimits {
            concurrency_limit: engine.options.concurrency_limit,
            run_timeout_seconds: None,
        };
        let limits = engine_limits.stricter(definition.limits());
        let run_timeout = match (engine.options.run_timeout, definition.limits().run_timeout()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        Self {
            engine,
            definition,
            run,
            tasks: JoinSet::new(),
            running: 0,
            limits,
            run_timeout,
            cancel: CancelHandle::new(),
            halt: CancelHandle::new(),
            halted: None,
        }
    }

    fn run_id(&self) -> Uuid {
        self.run.id
    }

    async fn notify(&self, event: LifecycleEvent) {
        self.engine.notifier.notify(&event).await;
    }

    /// Persist a stage transition, then adopt it
    async fn record(&mut self, exec: StageExecution) -> Result<()> {
        self.engine.store.update(self.run.id, &exec).await?;
        self.run.stages.insert(exec.stage.clone(), exec);
        Ok(())
    }

    async fn set_status(&mut self, status: RunStatus, rollback: RollbackOutcome) -> Result<()> {
        self.engine
            .store
            .set_status(self.run.id, status, rollback)
            .await?;
        self.run.status = status;
        self.run.rollback = rollback;
        if status.is_terminal() {
            self.run.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    fn execution(&self, stage: &str) -> Result<StageExecution> {
        self.run
            .stage(stage)
            .cloned()
            .ok_or_else(|| anyhow!("Run {} has no stage '{}'", self.run.id, stage))
    }

    fn spec(&self, stage: &str) -> Result<&'a StageSpec> {
        let definition: &'a PipelineDefinition = self.definition;
        definition
            .stage(stage)
            .ok_or_else(|| anyhow!("Definition has no stage '{}'", stage))
    }

    /// Settle stages a dead engine left mid-flight
    async fn recover(&mut self) -> Result<()> {
        let interrupted: Vec<String> = self
            .run
            .ordered_stages()
            .filter(|exec| exec.status == StageStatus::Running)
            .map(|exec| exec.stage.clone())
            .collect();

        warn!(run_id = %self.run_id(), ?interrupted, "Recovering run");
        self.notify(LifecycleEvent::RunResumed {
            run_id: self.run_id(),
            interrupted: interrupted.clone(),
        })
        .await;

        for name in &interrupted {
            let spec = self.spec(name)?;
            let mut exec = self.execution(name)?;
            exec.last_error = Some(INTERRUPTED.to_string());

            if spec.retry_policy.should_retry(exec.attempts) {
                exec.status = StageStatus::Ready;
                self.record(exec).await?;
            } else {
                exec.status = StageStatus::Failed;
                exec.ended_at = Some(Utc::now());
                self.record(exec).await?;
                self.notify(LifecycleEvent::StageFailed {
                    run_id: self.run_id(),
                    stage: name.clone(),
                    error: INTERRUPTED.to_string(),
                })
                .await;
            }
        }

        // Retry timers died with the old engine
        let waiting: Vec<String> = self
            .run
            .ordered_stages()
            .filter(|exec| exec.status == StageStatus::Retrying)
            .map(|exec| exec.stage.clone())
            .collect();
        for name in waiting {
            let mut exec = self.execution(&name)?;
            exec.status = StageStatus::Ready;
            self.record(exec).await?;
        }

        Ok(())
    }

    async fn drive(mut self, external: CancelSignal) -> Result<RunResult> {
        if self.run.status != RunStatus::Running {
            self.set_status(RunStatus::Running, RollbackOutcome::NotAttempted)
                .await?;
        }

        self.skip_disabled().await?;

        // A halt persisted before a crash stays in force
        if let Some(cause) = self.run.halt_cause() {
            self.halt_run(cause).await?;
        }

        let deadline = self.run_timeout.map(|limit| Instant::now() + limit);

        loop {
            if self.halted.is_none() && external.is_cancelled() {
                self.abort(HaltCause::Cancelled).await?;
            }
            if self.halted.is_none() {
                self.dispatch_ready().await?;
            }
            if self.tasks.is_empty() {
                break;
            }

            let aborting = self.cancel.is_cancelled();
            let event = tokio::select! {
                joined = self.tasks.join_next() => LoopEvent::Task(joined),
                _ = external.cancelled(), if !aborting => LoopEvent::Cancelled,
                _ = deadline_reached(deadline), if !aborting => LoopEvent::TimedOut,
            };

            match event {
                LoopEvent::Task(Some(Ok(outcome))) => self.handle(outcome).await?,
                LoopEvent::Task(Some(Err(e))) => {
                    return Err(anyhow!("Stage task failed for run {}: {}", self.run_id(), e));
                }
                LoopEvent::Task(None) => break,
                LoopEvent::Cancelled => {
                    warn!(run_id = %self.run_id(), "Run cancelled");
                    self.abort(HaltCause::Cancelled).await?;
                }
                LoopEvent::TimedOut => {
                    warn!(run_id = %self.run_id(), timeout = ?self.run_timeout, "Run timed out");
                    self.abort(HaltCause::TimedOut).await?;
                }
            }
        }

        self.finish().await
    }

    async fn skip_disabled(&mut self) -> Result<()> {
        let disabled: Vec<String> = self
            .definition
            .stages()
            .iter()
            .filter(|spec| !spec.enabled && self.run.stage_status(&spec.name).is_waiting())
            .map(|spec| spec.name.clone())
            .collect();

        for name in disabled {
            self.skip(&name, "disabled").await?;
        }
        Ok(())
    }

    /// Start every ready stage the concurrency limit admits
    async fn dispatch_ready(&mut self) -> Result<()> {
        let ready = self
            .definition
            .graph()
            .ready(&self.run.status_snapshot());

        for name in ready {
            if self.limits.has_capacity(self.running) {
                self.start_stage(&name).await?;
            } else if self.run.stage_status(&name) == StageStatus::Pending {
                let mut exec = self.execution(&name)?;
                exec.status = StageStatus::Ready;
                self.record(exec).await?;
            }
        }
        Ok(())
    }

    async fn start_stage(&mut self, name: &str) -> Result<()> {
        let spec = self.spec(name)?;
        let mut exec = self.execution(name)?;
        exec.status = StageStatus::Running;
        exec.attempts += 1;
        exec.started_at.get_or_insert_with(Utc::now);
        let attempt = exec.attempts;
        self.record(exec).await?;

        debug!(
            stage = %name,
            attempt,
            params = ?self.engine.redactor.redact_params(&spec.params),
            "Dispatching stage"
        );
        self.notify(LifecycleEvent::StageStarted {
            run_id: self.run_id(),
            stage: name.to_string(),
            attempt,
        })
        .await;

        let upstream: BTreeMap<String, ArtifactRef> = spec
            .depends_on
            .iter()
            .filter_map(|dep| {
                self.run
                    .stage(dep)
                    .and_then(|e| e.artifact.clone())
                    .map(|artifact| (dep.clone(), artifact))
            })
            .collect();

        // Explicit source, else the first upstream artifact in declaration order
        let source = spec.artifact_from.clone().or_else(|| {
            spec.depends_on
                .iter()
                .find(|dep| upstream.contains_key(*dep))
                .cloned()
        });

        let input = StageInput {
            run_id: self.run_id(),
            stage: name.to_string(),
            kind: spec.adapter,
            action: spec.action.clone(),
            params: spec.params.clone(),
            trigger: self.run.trigger.clone(),
            upstream,
            attempt,
        };

        let adapters = self.engine.adapters.clone();
        let cancel = self.cancel.signal();
        let timeout = spec.timeout();
        let stage = name.to_string();
        self.tasks.spawn(async move {
            let result = invoke(&adapters, &input, source.as_deref(), &cancel, timeout).await;
            TaskOutcome::Finished { stage, result }
        });
        self.running += 1;

        Ok(())
    }

    async fn handle(&mut self, outcome: TaskOutcome) -> Result<()> {
        match outcome {
            TaskOutcome::Finished { stage, result } => {
                self.running = self.running.saturating_sub(1);
                match result {
                    Ok(artifact) => self.stage_succeeded(&stage, artifact).await,
                    Err(e) => self.stage_attempt_failed(&stage, e).await,
                }
            }
            TaskOutcome::RetryDue { stage } => {
                if let Some(cause) = self.halted.clone() {
                    return self.skip(&stage, cause.reason()).await;
                }
                let mut exec = self.execution(&stage)?;
                exec.status = StageStatus::Ready;
                self.record(exec).await
            }
            TaskOutcome::RetryAbandoned { stage } => {
                let reason = self
                    .halted
                    .as_ref()
                    .map_or("run halted", HaltCause::reason);
                self.skip(&stage, reason).await
            }
        }
    }

    async fn stage_succeeded(&mut self, name: &str, artifact: Option<ArtifactRef>) -> Result<()> {
        let mut exec = self.execution(name)?;
        exec.status = StageStatus::Succeeded;
        exec.artifact = artifact.clone();
        exec.last_error = None;
        exec.ended_at = Some(Utc::now());
        self.record(exec).await?;

        self.notify(LifecycleEvent::StageSucceeded {
            run_id: self.run_id(),
            stage: name.to_string(),
            artifact,
        })
        .await;
        Ok(())
    }

    async fn stage_attempt_failed(&mut self, name: &str, error: AdapterError) -> Result<()> {
        let spec = self.spec(name)?;
        let mut exec = self.execution(name)?;
        exec.last_error = Some(error.to_string());

        let retry = error.is_retriable()
            && self.halted.is_none()
            && spec.retry_policy.should_retry(exec.attempts);

        if retry {
            let attempt = exec.attempts;
            let delay = spec.retry_policy.jittered_delay(attempt);
            exec.status = StageStatus::Retrying;
            self.record(exec).await?;

            warn!(
                stage = %name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Stage attempt failed, retrying"
            );
            self.notify(LifecycleEvent::StageRetrying {
                run_id: self.run_id(),
                stage: name.to_string(),
                attempt,
                delay_ms: delay.as_millis() as u64,
            })
            .await;

            let cancel = self.cancel.signal();
            let halt = self.halt.signal();
            let stage = name.to_string();
            self.tasks.spawn(async move {
                let due = tokio::select! {
                    _ = tokio::time::sleep(delay) => true,
                    _ = cancel.cancelled() => false,
                    _ = halt.cancelled() => false,
                };
                if due {
                    TaskOutcome::RetryDue { stage }
                } else {
                    TaskOutcome::RetryAbandoned { stage }
                }
            });
            return Ok(());
        }

        exec.status = StageStatus::Failed;
        exec.ended_at = Some(Utc::now());
        self.record(exec).await?;

        self.notify(LifecycleEvent::StageFailed {
            run_id: self.run_id(),
            stage: name.to_string(),
            error: error.to_string(),
        })
        .await;

        self.halt_run(HaltCause::StageFailed {
            stage: name.to_string(),
        })
        .await
    }

    async fn skip(&mut self, name: &str, reason: &str) -> Result<()> {
        let mut exec = self.execution(name)?;
        exec.status = StageStatus::Skipped;
        exec.skip_reason = Some(reason.to_string());
        exec.ended_at = Some(Utc::now());
        self.record(exec).await?;

        self.notify(LifecycleEvent::StageSkipped {
            run_id: self.run_id(),
            stage: name.to_string(),
            reason: reason.to_string(),
        })
        .await;
        Ok(())
    }

    /// Cancel in-flight adapter calls, then stop dispatching
    async fn abort(&mut self, cause: HaltCause) -> Result<()> {
        self.cancel.cancel();
        self.halt_run(cause).await
    }

    /// Stop dispatching and skip every stage that has not started.
    ///
    /// In-flight attempts run to completion but are not retried.
    async fn halt_run(&mut self, cause: HaltCause) -> Result<()> {
        if self.halted.is_some() {
            return Ok(());
        }
        if self.run.halt.as_ref() != Some(&cause) {
            self.engine.store.halt(self.run.id, &cause).await?;
            self.run.halt = Some(cause.clone());
        }
        self.halted = Some(cause.clone());
        self.halt.cancel();

        let definition: &'a PipelineDefinition = self.definition;
        let graph = definition.graph();
        if let HaltCause::StageFailed { stage: ref failed } = cause {
            for name in graph.transitive_dependents(failed) {
                if self.run.stage_status(&name).is_waiting() {
                    self.skip(&name, &format!("upstream stage '{}' failed", failed))
                        .await?;
                }
            }
        }

        let remaining: Vec<String> = graph
            .topological_order()
            .iter()
            .filter(|name| self.run.stage_status(name).is_waiting())
            .cloned()
            .collect();
        for name in remaining {
            self.skip(&name, cause.reason()).await?;
        }

        Ok(())
    }

    async fn finish(mut self) -> Result<RunResult> {
        if self.halted.is_none() && self.run.all_stages_satisfied() {
            self.set_status(RunStatus::Succeeded, RollbackOutcome::NotAttempted)
                .await?;
            info!(run_id = %self.run_id(), "Run succeeded");
            self.notify(LifecycleEvent::RunSucceeded {
                run_id: self.run_id(),
            })
            .await;
            return Ok(RunResult::from_run(&self.run));
        }

        let failures = self.roll_back().await?;
        let compensated: Vec<String> = self
            .definition
            .graph()
            .rollback_order()
            .filter(|name| self.run.stage_status(name) == StageStatus::RolledBack)
            .map(str::to_string)
            .collect();

        let outcome = RollbackOutcome::from_counts(compensated.len(), failures);
        let status = if outcome == RollbackOutcome::Succeeded {
            RunStatus::RolledBack
        } else {
            RunStatus::Failed
        };
        self.set_status(status, outcome).await?;

        if status == RunStatus::RolledBack {
            self.notify(LifecycleEvent::RunRolledBack {
                run_id: self.run_id(),
                compensated,
            })
            .await;
        } else {
            let failing = self
                .run
                .failed_stages()
                .into_iter()
                .map(|(stage, _)| stage)
                .collect();
            self.notify(LifecycleEvent::RunFailed {
                run_id: self.run_id(),
                failing,
            })
            .await;
        }

        Ok(RunResult::from_run(&self.run))
    }

    /// Run rollback actions of succeeded stages in reverse topological
    /// order. Best effort: a failed rollback is recorded and the next one
    /// still runs. Returns the number of failed rollback actions.
    async fn roll_back(&mut self) -> Result<usize> {
        let mut failures = 0;
        let order: Vec<String> = self
            .definition
            .graph()
            .rollback_order()
            .map(str::to_string)
            .collect();

        for name in order {
            let spec = self.spec(&name)?;
            let mut exec = self.execution(&name)?;
            if exec.status != StageStatus::Succeeded {
                continue;
            }
            let Some(ref action) = spec.rollback else {
                continue;
            };
            // Attempted by an earlier drive; never run twice
            if let Some(ref error) = exec.rollback_error {
                warn!(stage = %name, error = %error, "Rollback already failed, not retrying");
                failures += 1;
                continue;
            }

            let request = RollbackRequest {
                run_id: self.run_id(),
                stage: name.clone(),
                kind: spec.adapter,
                action: action.action.clone(),
                params: action.params.clone(),
                artifact: exec.artifact.clone(),
            };

            info!(stage = %name, action = %action.action, "Rolling back stage");
            match rollback(&self.engine.adapters, &request, &CancelSignal::never()).await {
                Ok(()) => {
                    exec.status = StageStatus::RolledBack;
                    exec.rollback_error = None;
                    self.record(exec).await?;
                    self.notify(LifecycleEvent::StageRolledBack {
                        run_id: self.run_id(),
                        stage: name,
                    })
                    .await;
                }
                Err(e) => {
                    failures += 1;
                    exec.rollback_error = Some(e.to_string());
                    self.record(exec).await?;
                    self.notify(LifecycleEvent::RollbackFailed {
                        run_id: self.run_id(),
                        stage: name,
                        error: e.to_string(),
                    })
                    .await;
                }
            }
        }

        Ok(failures)
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// One attempt of a stage, bounded by its timeout and the run's cancel signal
async fn invoke(
    adapters: &AdapterSet,
    input: &StageInput,
    source: Option<&str>,
    cancel: &CancelSignal,
    timeout: Option<Duration>,
) -> Result<Option<ArtifactRef>, AdapterError> {
    if cancel.is_cancelled() {
        return Err(AdapterError::Cancelled);
    }

    let call = call_adapter(adapters, input, source, cancel);
    let bounded = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(AdapterError::Timeout(limit))),
            None => call.await,
        }
    };

    tokio::select! {
        result = bounded => result,
        _ = cancel.cancelled() => Err(AdapterError::Cancelled),
    }
}

async fn call_adapter(
    adapters: &AdapterSet,
    input: &StageInput,
    source: Option<&str>,
    cancel: &CancelSignal,
) -> Result<Option<ArtifactRef>, AdapterError> {
    let unbound = || AdapterError::Unsupported {
        capability: input.kind.capability(),
        operation: input.kind.as_str().to_string(),
    };

    match input.kind {
        AdapterKind::Provision => {
            let provisioner = adapters.provisioner.as_ref().ok_or_else(unbound)?;
            let resources = provisioner.apply(input, cancel).await?;
            Ok(Some(ArtifactRef::new(resources.handle)))
        }
        AdapterKind::Build => {
            let builder = adapters.builder.as_ref().ok_or_else(unbound)?;
            builder.build(input, cancel).await.map(Some)
        }
        AdapterKind::Push => {
            let builder = adapters.builder.as_ref().ok_or_else(unbound)?;
            let artifact = upstream_artifact(input, source)?;
            builder.push(&artifact, input, cancel).await.map(Some)
        }
        AdapterKind::Deploy => {
            let deployer = adapters.deployer.as_ref().ok_or_else(unbound)?;
            let artifact = upstream_artifact(input, source)?;
            let rollout = deployer.deploy(&artifact, input, cancel).await?;
            Ok(Some(ArtifactRef::new(rollout.revision)))
        }
        AdapterKind::Configure => {
            let configurator = adapters.configurator.as_ref().ok_or_else(unbound)?;
            let targets = config_targets(input);
            configurator.configure(&targets, input, cancel).await?;
            Ok(None)
        }
    }
}

async fn rollback(
    adapters: &AdapterSet,
    request: &RollbackRequest,
    cancel: &CancelSignal,
) -> Result<(), AdapterError> {
    let unbound = || AdapterError::Unsupported {
        capability: request.kind.capability(),
        operation: "rollback".to_string(),
    };

    match request.kind.capability() {
        Capability::Provisioner => {
            let provisioner = adapters.provisioner.as_ref().ok_or_else(unbound)?;
            provisioner.rollback(request, cancel).await
        }
        Capability::Builder => {
            let builder = adapters.builder.as_ref().ok_or_else(unbound)?;
            builder.rollback(request, cancel).await
        }
        Capability::Deployer => {
            let deployer = adapters.deployer.as_ref().ok_or_else(unbound)?;
            deployer.rollback(request, cancel).await
        }
        Capability::Configurator => {
            let configurator = adapters.configurator.as_ref().ok_or_else(unbound)?;
            configurator.rollback(request, cancel).await
        }
    }
}

fn upstream_artifact(input: &StageInput, source: Option<&str>) -> Result<ArtifactRef, AdapterError> {
    match source {
        Some(stage) => input.upstream.get(stage).cloned().ok_or_else(|| {
            AdapterError::MissingInput(format!("no artifact from upstream stage '{}'", stage))
        }),
        None => Err(AdapterError::MissingInput(format!(
            "stage '{}' has no upstream artifact",
            input.stage
        ))),
    }
}

/// Comma-separated `targets` param, else every upstream artifact
fn config_targets(input: &StageInput) -> Vec<String> {
    match input.params.get("targets") {
        Some(targets) => targets
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        None => input
            .upstream
            .values()
            .map(|artifact| artifact.as_str().to_string())
            .collect(),
    }
}
