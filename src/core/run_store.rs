//! Durable run state store.
//!
//! Each run lives in its own directory holding an append-only JSONL log
//! (`events.jsonl`) and a lock file (`run.lock`). Every stage transition
//! is one line, written and fsynced before the engine moves on, so a
//! crash loses at most the line being written. Appends to a run are
//! serialized in-process; the lock file keeps a second engine process
//! from driving the same run.

use std::collections::HashMap;
use std::fs::File as StdFile;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use fs2::FileExt;
use glob::Pattern;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::StoreError;
use crate::domain::{
    HaltCause, RollbackOutcome, Run, RunChange, RunEvent, RunStatus, RunSummary, StageExecution,
};

const EVENTS_FILE: &str = "events.jsonl";
const LOCK_FILE: &str = "run.lock";

/// File-based run store
#[derive(Debug)]
pub struct RunStore {
    /// Directory containing one subdirectory per run
    root: PathBuf,

    /// Per-run append serialization
    writers: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl RunStore {
    /// Open a store rooted at `root` (created on first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// Open the store under the configured home ($SHIPYARD_HOME/runs)
    pub fn open_default() -> anyhow::Result<Self> {
        Ok(Self::new(crate::config::runs_dir()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a run
    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn events_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join(EVENTS_FILE)
    }

    fn writer(&self, run_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut writers = self
            .writers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writers.entry(run_id).or_default().clone()
    }

    /// Persist a new run
    pub async fn create(&self, run: &Run) -> Result<Uuid, StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create runs directory: {}", self.root.display()))?;

        let run_dir = self.run_dir(run.id);
        match fs::create_dir(&run_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(run.id));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to create run directory: {}", run_dir.display()))
                    .into());
            }
        }

        self.append(run.id, &RunEvent::created(run)).await?;
        debug!(run_id = %run.id, "Run created");
        Ok(run.id)
    }

    /// Persist one stage execution snapshot
    pub async fn update(&self, run_id: Uuid, execution: &StageExecution) -> Result<(), StoreError> {
        self.ensure_exists(run_id).await?;
        self.append(run_id, &RunEvent::stage_updated(run_id, execution))
            .await
    }

    /// Persist an overall status transition
    pub async fn set_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        rollback: RollbackOutcome,
    ) -> Result<(), StoreError> {
        self.ensure_exists(run_id).await?;
        self.append(run_id, &RunEvent::status_changed(run_id, status, rollback))
            .await
    }

    /// Persist that a run stopped dispatching, and why
    pub async fn halt(&self, run_id: Uuid, cause: &HaltCause) -> Result<(), StoreError> {
        self.ensure_exists(run_id).await?;
        self.append(run_id, &RunEvent::halted(run_id, cause)).await
    }

    /// Rebuild a run from its log
    pub async fn get(&self, run_id: Uuid) -> Result<Run, StoreError> {
        let events = self.history(run_id).await?;
        if events.is_empty() {
            return Err(StoreError::NotFound(run_id));
        }

        Run::from_events(&events).ok_or_else(|| StoreError::Corrupt {
            path: self.events_path(run_id),
            line: 1,
            message: "log does not start with a run_created record".into(),
        })
    }

    /// Every persisted record of a run, in write order
    pub async fn history(&self, run_id: Uuid) -> Result<Vec<RunEvent>, StoreError> {
        let path = self.events_path(run_id);
        if !path.exists() {
            return Err(StoreError::NotFound(run_id));
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read run log: {}", path.display()))?;

        parse_log(&path, &content)
    }

    /// Summaries of stored runs matching `filter`, newest first
    pub async fn list(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let pipeline_pattern = match filter.pipeline {
            Some(ref pattern) => Some(
                Pattern::new(pattern)
                    .with_context(|| format!("Invalid pipeline pattern: {}", pattern))?,
            ),
            None => None,
        };

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to list runs: {}", self.root.display()))?;

        while let Some(entry) = entries.next_entry().await.context("Failed to list runs")? {
            if !entry.file_type().await.context("Failed to list runs")?.is_dir() {
                continue;
            }
            let Some(run_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            else {
                continue;
            };

            match self.get(run_id).await {
                Ok(run) => {
                    if filter.status.map_or(true, |s| s == run.status)
                        && pipeline_pattern
                            .as_ref()
                            .map_or(true, |p| p.matches(&run.pipeline_name))
                    {
                        runs.push(run.summary());
                    }
                }
                Err(e) => warn!(%run_id, error = %e, "Skipping unreadable run"),
            }
        }

        // Most recent first
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            runs.truncate(limit);
        }

        Ok(runs)
    }

    /// Take the exclusive lease on a run.
    ///
    /// The lease is an advisory file lock, released when the holder
    /// drops it or its process dies. Holding it is the engine's liveness
    /// signal: a stage persisted as Running while nobody holds the lease
    /// was interrupted. A torn trailing line left by a crash is removed
    /// here, since the leaseholder is the only writer.
    pub async fn acquire(&self, run_id: Uuid) -> Result<RunLease, StoreError> {
        self.ensure_exists(run_id).await?;

        let lock_path = self.run_dir(run_id).join(LOCK_FILE);
        let file = StdFile::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(StoreError::Locked(run_id));
            }
            return Err(anyhow::Error::new(e)
                .context(format!("Failed to lock {}", lock_path.display()))
                .into());
        }

        self.repair_tail(run_id).await?;

        Ok(RunLease { run_id, file })
    }

    async fn ensure_exists(&self, run_id: Uuid) -> Result<(), StoreError> {
        if fs::metadata(self.events_path(run_id)).await.is_ok() {
            Ok(())
        } else {
            Err(StoreError::NotFound(run_id))
        }
    }

    /// Append one record, flushed and synced to disk
    async fn append(&self, run_id: Uuid, event: &RunEvent) -> Result<(), StoreError> {
        let writer = self.writer(run_id);
        let _guard = writer.lock().await;

        let path = self.events_path(run_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open run log: {}", path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize run event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write run event")?;
        file.flush().await.context("Failed to flush run event")?;
        file.sync_data().await.context("Failed to sync run log")?;

        Ok(())
    }

    /// Drop a partial last line so the next append starts clean
    async fn repair_tail(&self, run_id: Uuid) -> Result<(), StoreError> {
        let path = self.events_path(run_id);
        let content = fs::read(&path)
            .await
            .with_context(|| format!("Failed to read run log: {}", path.display()))?;

        if content.is_empty() || content.ends_with(b"\n") {
            return Ok(());
        }

        let keep = content
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1);
        warn!(%run_id, dropped_bytes = content.len() - keep, "Discarding torn run log tail");

        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open run log: {}", path.display()))?;
        file.set_len(keep as u64)
            .await
            .context("Failed to truncate run log")?;
        file.sync_all().await.context("Failed to sync run log")?;

        Ok(())
    }
}

fn parse_log(path: &Path, content: &str) -> Result<Vec<RunEvent>, StoreError> {
    let lines: Vec<(usize, &str)> = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .collect();

    let mut events = Vec::with_capacity(lines.len());
    for (pos, (index, line)) in lines.iter().enumerate() {
        match serde_json::from_str::<RunEvent>(line) {
            Ok(event) => events.push(event),
            // A torn final line is what a crash mid-append leaves behind
            Err(e) if pos + 1 == lines.len() && !content.ends_with('\n') => {
                warn!(path = %path.display(), error = %e, "Ignoring torn final record");
            }
            Err(e) => {
                return Err(StoreError::Corrupt {
                    path: path.to_path_buf(),
                    line: index + 1,
                    message: e.to_string(),
                });
            }
        }
    }

    Ok(events)
}

/// Exclusive right to drive a run; released on drop
#[derive(Debug)]
pub struct RunLease {
    run_id: Uuid,
    file: StdFile,
}

impl RunLease {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Selection criteria for [`RunStore::list`]
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    /// Glob over pipeline names
    pub pipeline: Option<String>,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_pipeline(mut self, pattern: impl Into<String>) -> Self {
        self.pipeline = Some(pattern.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

// Check whether a record is a stage transition into `status`
pub(crate) fn is_transition(event: &RunEvent, status: crate::domain::StageStatus) -> bool {
    matches!(&event.change, RunChange::StageUpdated { execution } if execution.status == status)
}
