// SPDX-License-Identifier: MIT

//! Run records and their in-memory slots

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard, RwLock};

use super::checkpoint::Checkpoint;
use super::error::CheckpointError;
use super::state::StateRecord;
use super::types::{RouteInput, RunId, StepName, StepRef, ERROR_FIELD};

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    /// No further steps will ever execute
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution instance of a workflow
#[derive(Debug, Clone)]
pub struct Run<S> {
    pub run_id: RunId,
    pub state: StateRecord,
    /// Work dispatched but not yet merged
    pub pending_steps: Vec<StepRef<S>>,
    /// Batch the pending steps belong to
    pub pending_batch: Option<u64>,
    /// Active checkpoint, set only while suspended
    pub suspended_at: Option<S>,
    pub loop_counters: BTreeMap<String, u32>,
    pub status: RunStatus,
    /// Last minted batch id
    pub batch_seq: u64,
    /// Sequence number of the last persisted checkpoint
    pub checkpoint_seq: u64,
}

impl<S: StepName> Run<S> {
    pub fn new(run_id: RunId, state: StateRecord) -> Self {
        Self {
            run_id,
            state,
            pending_steps: Vec::new(),
            pending_batch: None,
            suspended_at: None,
            loop_counters: BTreeMap::new(),
            status: RunStatus::Running,
            batch_seq: 0,
            checkpoint_seq: 0,
        }
    }

    /// Router view of the current post-merge state
    pub fn view(&self) -> RouteInput<'_> {
        RouteInput {
            state: &self.state,
            loop_counters: &self.loop_counters,
        }
    }

    /// Snapshot the run for persistence, advancing the checkpoint sequence
    pub fn checkpoint(&mut self) -> Checkpoint {
        self.checkpoint_seq += 1;
        Checkpoint {
            run_id: self.run_id.clone(),
            sequence: self.checkpoint_seq,
            status: self.status,
            state_record: self.state.clone(),
            active_checkpoint: self.suspended_at.map(|s| s.name().to_string()),
            loop_counters: self.loop_counters.clone(),
            batch_seq: self.batch_seq,
            error: self.state.get(ERROR_FIELD).cloned(),
            created_at: Utc::now(),
        }
    }

    /// Rebuild a run from a persisted checkpoint
    pub fn from_checkpoint(checkpoint: Checkpoint) -> Result<Self, CheckpointError> {
        let suspended_at = match checkpoint.active_checkpoint.as_deref() {
            Some(name) => Some(S::from_name(name).ok_or_else(|| {
                CheckpointError::Corrupted(format!(
                    "run {} names unknown checkpoint '{}'",
                    checkpoint.run_id, name
                ))
            })?),
            None => None,
        };
        if checkpoint.status == RunStatus::Suspended && suspended_at.is_none() {
            return Err(CheckpointError::Corrupted(format!(
                "run {} is suspended without an active checkpoint",
                checkpoint.run_id
            )));
        }

        Ok(Self {
            run_id: checkpoint.run_id,
            state: checkpoint.state_record,
            pending_steps: Vec::new(),
            pending_batch: None,
            suspended_at,
            loop_counters: checkpoint.loop_counters,
            status: checkpoint.status,
            batch_seq: checkpoint.batch_seq,
            checkpoint_seq: checkpoint.sequence,
        })
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            run_id: self.run_id.clone(),
            status: self.status,
            suspended_at: self.suspended_at.map(|s| s.name().to_string()),
            pending_steps: self
                .pending_steps
                .iter()
                .map(|r| r.step.name().to_string())
                .collect(),
            loop_counters: self.loop_counters.clone(),
            error: self.state.get(ERROR_FIELD).cloned(),
            state: self.state.clone(),
        }
    }
}

/// Caller-facing summary of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub suspended_at: Option<String>,
    #[serde(default)]
    pub pending_steps: Vec<String>,
    pub loop_counters: BTreeMap<String, u32>,
    pub error: Option<Value>,
    pub state: StateRecord,
}

impl From<&Checkpoint> for RunReport {
    fn from(cp: &Checkpoint) -> Self {
        Self {
            run_id: cp.run_id.clone(),
            status: cp.status,
            suspended_at: cp.active_checkpoint.clone(),
            pending_steps: Vec::new(),
            loop_counters: cp.loop_counters.clone(),
            error: cp.state_record.get(ERROR_FIELD).cloned(),
            state: cp.state_record.clone(),
        }
    }
}

/// Shared handle on a resident run
///
/// `driver` is held by whoever is advancing the run (start, resume, abort of a
/// suspended run); everyone else only reads the published snapshot.
pub struct RunSlot<S> {
    snapshot: RwLock<Run<S>>,
    driver: Mutex<()>,
    abort: AtomicBool,
}

impl<S: StepName> RunSlot<S> {
    pub fn new(run: Run<S>) -> Self {
        Self {
            snapshot: RwLock::new(run),
            driver: Mutex::new(()),
            abort: AtomicBool::new(false),
        }
    }

    /// Clone of the last published state of the run
    pub async fn snapshot(&self) -> Run<S> {
        self.snapshot.read().await.clone()
    }

    pub async fn publish(&self, run: &Run<S>) {
        *self.snapshot.write().await = run.clone();
    }

    /// Become the single writer, failing immediately if someone else is
    pub fn try_drive(&self) -> Option<MutexGuard<'_, ()>> {
        self.driver.try_lock().ok()
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Gate {
        Approve,
    }

    impl StepName for Gate {
        const ALL: &'static [Self] = &[Gate::Approve];

        fn name(&self) -> &'static str {
            "approve"
        }
    }

    #[test]
    fn test_checkpoint_roundtrip_restores_run() {
        let mut run: Run<Gate> = Run::new(
            RunId::from("run-1"),
            StateRecord::from_json(json!({"topic": "A", "sources": ["x"]})),
        );
        run.status = RunStatus::Suspended;
        run.suspended_at = Some(Gate::Approve);
        run.loop_counters.insert("search".into(), 2);
        run.batch_seq = 3;

        let cp = run.checkpoint();
        assert_eq!(cp.sequence, 1);
        assert_eq!(cp.active_checkpoint.as_deref(), Some("approve"));

        let json = serde_json::to_string(&cp).unwrap();
        let parsed: Checkpoint = serde_json::from_str(&json).unwrap();
        let restored = Run::<Gate>::from_checkpoint(parsed).unwrap();

        assert_eq!(restored.state, run.state);
        assert_eq!(restored.suspended_at, Some(Gate::Approve));
        assert_eq!(restored.loop_counters, run.loop_counters);
        assert_eq!(restored.batch_seq, 3);
        assert_eq!(restored.checkpoint_seq, 1);
    }

    #[test]
    fn test_unknown_checkpoint_name_is_corrupted() {
        let mut run: Run<Gate> = Run::new(RunId::from("run-1"), StateRecord::empty());
        run.status = RunStatus::Suspended;
        run.suspended_at = Some(Gate::Approve);
        let mut cp = run.checkpoint();
        cp.active_checkpoint = Some("await_nothing".into());

        let err = Run::<Gate>::from_checkpoint(cp).unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupted(_)));
    }

    #[tokio::test]
    async fn test_slot_single_driver() {
        let slot = RunSlot::new(Run::<Gate>::new(RunId::from("r"), StateRecord::empty()));

        let guard = slot.try_drive();
        assert!(guard.is_some());
        assert!(slot.try_drive().is_none());
        drop(guard);
        assert!(slot.try_drive().is_some());
    }

    #[test]
    fn test_status_is_final() {
        assert!(!RunStatus::Running.is_final());
        assert!(!RunStatus::Suspended.is_final());
        assert!(RunStatus::Completed.is_final());
        assert!(RunStatus::Failed.is_final());
        assert!(RunStatus::Aborted.is_final());
    }
}
