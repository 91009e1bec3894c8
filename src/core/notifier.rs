//! Lifecycle notification sinks.
//!
//! The engine calls [`Notifier::notify`] sequentially from its control
//! loop, so every sink sees events in the order they happened.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::domain::LifecycleEvent;

/// Receives ordered lifecycle events
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &LifecycleEvent);
}

/// Mirrors lifecycle events into the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::RunStarted { run_id, pipeline } => {
                info!(%run_id, pipeline = %pipeline, "Run started");
            }
            LifecycleEvent::RunResumed { run_id, interrupted } => {
                info!(%run_id, ?interrupted, "Run resumed");
            }
            LifecycleEvent::StageStarted { stage, attempt, .. } => {
                info!(stage = %stage, attempt, "Stage started");
            }
            LifecycleEvent::StageSucceeded { stage, artifact, .. } => {
                info!(stage = %stage, artifact = ?artifact.as_ref().map(|a| a.as_str()), "Stage succeeded");
            }
            LifecycleEvent::StageRetrying {
                stage,
                attempt,
                delay_ms,
                ..
            } => {
                warn!(stage = %stage, attempt, delay_ms, "Stage retrying");
            }
            LifecycleEvent::StageFailed { stage, error, .. } => {
                error!(stage = %stage, error = %error, "Stage failed");
            }
            LifecycleEvent::StageSkipped { stage, reason, .. } => {
                info!(stage = %stage, reason = %reason, "Stage skipped");
            }
            LifecycleEvent::StageRolledBack { stage, .. } => {
                info!(stage = %stage, "Stage rolled back");
            }
            LifecycleEvent::RollbackFailed { stage, error, .. } => {
                error!(stage = %stage, error = %error, "Rollback failed");
            }
            LifecycleEvent::RunSucceeded { run_id } => {
                info!(%run_id, "Run succeeded");
            }
            LifecycleEvent::RunRolledBack {
                run_id,
                compensated,
            } => {
                warn!(%run_id, ?compensated, "Run rolled back");
            }
            LifecycleEvent::RunFailed { run_id, failing } => {
                error!(%run_id, ?failing, "Run failed");
            }
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default, Clone)]
pub struct CollectingNotifier {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far, in order
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn notify(&self, event: &LifecycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Appends timestamped events to a JSONL audit file
#[derive(Debug, Clone)]
pub struct JsonlNotifier {
    path: PathBuf,
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a LifecycleEvent,
}

impl JsonlNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, event: &LifecycleEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create audit directory: {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open audit file: {}", self.path.display()))?;

        let record = AuditRecord {
            timestamp: Utc::now(),
            event,
        };
        let json = serde_json::to_string(&record).context("Failed to serialize audit event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write audit event")?;
        file.flush().await.context("Failed to flush audit event")?;

        Ok(())
    }
}

#[async_trait]
impl Notifier for JsonlNotifier {
    async fn notify(&self, event: &LifecycleEvent) {
        // An audit sink failure must not fail the run
        if let Err(e) = self.append(event).await {
            warn!(error = %e, "Failed to write audit event");
        }
    }
}

/// Forwards each event to several sinks in order
#[derive(Default, Clone)]
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, event: &LifecycleEvent) {
        for sink in &self.sinks {
            sink.notify(event).await;
        }
    }
}
