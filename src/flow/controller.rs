// SPDX-License-Identifier: MIT

//! Suspend/resume controller and run-control API
//!
//! `Engine` owns the resident runs. Every call that advances a run first takes
//! that run's driver lock with `try_lock`, so a run has exactly one writer and
//! a second resume of the same checkpoint is turned away as stale. Engines
//! sharing one checkpoint store are arbitrated by the store instead: resume
//! persists a RUNNING claim before any step runs, and only one claim per
//! sequence can be stored.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::checkpoint::{Checkpoint, CheckpointStore};
use super::error::{CheckpointError, EngineError, MergeError};
use super::executor::{Cursor, EngineConfig, Executor};
use super::merge::merge_one;
use super::registry::StepTable;
use super::run::{Run, RunReport, RunSlot, RunStatus};
use super::state::StateRecord;
use super::types::{
    is_reserved, Decision, DecisionAction, RecordedDecision, RunId, StepName, DECISION_FIELD,
};

pub struct Engine<S: StepName, D> {
    executor: Executor<S, D>,
    store: Arc<dyn CheckpointStore>,
    runs: RwLock<HashMap<RunId, Arc<RunSlot<S>>>>,
}

impl<S: StepName, D: Send + Sync + 'static> Engine<S, D> {
    pub fn new(
        table: StepTable<S, D>,
        deps: Arc<D>,
        store: Arc<dyn CheckpointStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            executor: Executor::new(Arc::new(table), deps, config),
            store,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        self.executor.config()
    }

    /// Start a run under a freshly minted id
    pub async fn start_run(&self, initial: StateRecord) -> Result<RunReport, EngineError> {
        self.start_run_with_id(RunId::new(), initial).await
    }

    /// Start a run and drive it until it suspends, completes or fails
    pub async fn start_run_with_id(
        &self,
        run_id: RunId,
        initial: StateRecord,
    ) -> Result<RunReport, EngineError> {
        if let Some(field) = initial.keys().find(|k| is_reserved(k)) {
            return Err(EngineError::Merge {
                run_id,
                source: MergeError::ReservedField(field.clone()),
            });
        }
        if self.store.latest(&run_id).await?.is_some() {
            return Err(EngineError::DuplicateRun(run_id));
        }

        let state = StateRecord::seeded(self.executor.table().schema(), initial);
        let mut run = Run::new(run_id.clone(), state);
        let slot = Arc::new(RunSlot::new(run.clone()));
        let Some(_driver) = slot.try_drive() else {
            return Err(EngineError::DuplicateRun(run_id));
        };

        {
            let mut runs = self.runs.write().await;
            if runs.contains_key(&run_id) {
                return Err(EngineError::DuplicateRun(run_id));
            }
            runs.insert(run_id.clone(), Arc::clone(&slot));
        }

        log::info!("Starting run {}", run_id);
        self.drive(&slot, &mut run, Cursor::Entry).await
    }

    /// Answer the active checkpoint of a suspended run and continue it
    ///
    /// Fails with `StaleResume`, leaving the run untouched, when `checkpoint`
    /// is not the active one or another call (or engine) is already advancing
    /// the run. An abort that arrived while the run was suspending is honored
    /// here: the run is archived as ABORTED and `RunNotActive` is returned.
    pub async fn resume(
        &self,
        run_id: &RunId,
        checkpoint: S,
        decision: Decision,
    ) -> Result<RunReport, EngineError> {
        let slot = match self.slot(run_id).await {
            Some(slot) => slot,
            None => self.rehydrate(run_id, checkpoint).await?,
        };
        let Some(_driver) = slot.try_drive() else {
            log::warn!(
                "Run {}: resume of '{}' rejected, run is busy",
                run_id,
                checkpoint.name()
            );
            return Err(self.stale(run_id, checkpoint, None));
        };

        let mut run = slot.snapshot().await;
        if run.status != RunStatus::Suspended || run.suspended_at != Some(checkpoint) {
            log::warn!(
                "Run {}: resume of '{}' rejected, run is {} at {:?}",
                run_id,
                checkpoint.name(),
                run.status,
                run.suspended_at.map(|s| s.name())
            );
            return Err(self.stale(run_id, checkpoint, run.suspended_at));
        }

        if slot.abort_requested() {
            log::warn!(
                "Run {}: resume of '{}' refused, abort is pending",
                run_id,
                checkpoint.name()
            );
            let report = self.archive_aborted(&slot, &mut run).await?;
            return Err(EngineError::RunNotActive {
                run_id: run_id.clone(),
                status: report.status.to_string(),
            });
        }

        if decision.action == DecisionAction::Edit {
            if let Some(edits) = decision.edits {
                run.state = merge_one(&run.state, edits, self.executor.table().schema())
                    .map_err(|source| EngineError::Merge {
                        run_id: run_id.clone(),
                        source,
                    })?;
            }
        }

        let recorded = RecordedDecision {
            checkpoint: checkpoint.name().to_string(),
            action: decision.action,
            feedback: decision.feedback,
        };
        let recorded = serde_json::to_value(&recorded).map_err(CheckpointError::from)?;
        run.state.insert(DECISION_FIELD, recorded);
        run.suspended_at = None;
        run.status = RunStatus::Running;

        let claim = run.checkpoint();
        match self.store.save(&claim).await {
            Ok(()) => {}
            Err(CheckpointError::SequenceConflict { last, .. }) => {
                log::warn!(
                    "Run {}: resume of '{}' lost to checkpoint {} written elsewhere",
                    run_id,
                    checkpoint.name(),
                    last
                );
                self.runs.write().await.remove(run_id);
                return Err(self.stale(run_id, checkpoint, None));
            }
            Err(e) => return Err(e.into()),
        }
        slot.publish(&run).await;

        log::info!(
            "Run {}: resumed at '{}' with {:?}",
            run_id,
            checkpoint.name(),
            decision.action
        );
        self.drive(&slot, &mut run, Cursor::After(checkpoint)).await
    }

    /// Abort a suspended run, or flag a running one to stop at its next step
    pub async fn abort_run(&self, run_id: &RunId) -> Result<RunReport, EngineError> {
        let slot = match self.slot(run_id).await {
            Some(slot) => slot,
            None => {
                let latest = self
                    .store
                    .latest(run_id)
                    .await?
                    .ok_or_else(|| EngineError::RunNotFound(run_id.clone()))?;
                match latest.status {
                    RunStatus::Aborted => return Ok(RunReport::from(&latest)),
                    RunStatus::Suspended => self.install(Run::from_checkpoint(latest)?).await,
                    other => {
                        return Err(EngineError::RunNotActive {
                            run_id: run_id.clone(),
                            status: other.to_string(),
                        })
                    }
                }
            }
        };

        let Some(_driver) = slot.try_drive() else {
            log::info!("Run {}: abort requested while running", run_id);
            slot.request_abort();
            return Ok(slot.snapshot().await.report());
        };

        let mut run = slot.snapshot().await;
        match run.status {
            RunStatus::Suspended => self.archive_aborted(&slot, &mut run).await,
            RunStatus::Aborted => Ok(run.report()),
            other => Err(EngineError::RunNotActive {
                run_id: run_id.clone(),
                status: other.to_string(),
            }),
        }
    }

    /// Current state of a run, resident or archived
    pub async fn get_state(&self, run_id: &RunId) -> Result<StateRecord, EngineError> {
        Ok(self.get_run(run_id).await?.state)
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<RunReport, EngineError> {
        if let Some(slot) = self.slot(run_id).await {
            return Ok(slot.snapshot().await.report());
        }
        self.store
            .latest(run_id)
            .await?
            .map(|cp| RunReport::from(&cp))
            .ok_or_else(|| EngineError::RunNotFound(run_id.clone()))
    }

    /// Load a run from its latest checkpoint, making it resident if suspended
    pub async fn recover(&self, run_id: &RunId) -> Result<RunReport, EngineError> {
        if let Some(slot) = self.slot(run_id).await {
            return Ok(slot.snapshot().await.report());
        }
        let latest = self
            .store
            .latest(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.clone()))?;

        match latest.status {
            RunStatus::Suspended => {
                log::info!(
                    "Recovered run {} at checkpoint {} ({:?})",
                    run_id,
                    latest.sequence,
                    latest.active_checkpoint
                );
                let slot = self.install(Run::from_checkpoint(latest)?).await;
                Ok(slot.snapshot().await.report())
            }
            // Claimed by a resume, possibly on another engine.
            _ => Ok(RunReport::from(&latest)),
        }
    }

    /// Stored checkpoints of a run, oldest first
    pub async fn history(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, EngineError> {
        Ok(self.store.history(run_id).await?)
    }

    /// Ids of the runs currently held in memory
    pub async fn active_runs(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.runs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn slot(&self, run_id: &RunId) -> Option<Arc<RunSlot<S>>> {
        self.runs.read().await.get(run_id).cloned()
    }

    /// Make `run` resident; a concurrent install of the same run wins
    async fn install(&self, run: Run<S>) -> Arc<RunSlot<S>> {
        let mut runs = self.runs.write().await;
        Arc::clone(
            runs.entry(run.run_id.clone())
                .or_insert_with(|| Arc::new(RunSlot::new(run))),
        )
    }

    async fn rehydrate(
        &self,
        run_id: &RunId,
        checkpoint: S,
    ) -> Result<Arc<RunSlot<S>>, EngineError> {
        let latest = self
            .store
            .latest(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.clone()))?;
        if latest.status != RunStatus::Suspended {
            return Err(EngineError::StaleResume {
                run_id: run_id.clone(),
                supplied: checkpoint.name().to_string(),
                active: None,
            });
        }
        log::info!(
            "Run {}: rehydrating from checkpoint {}",
            run_id,
            latest.sequence
        );
        Ok(self.install(Run::from_checkpoint(latest)?).await)
    }

    /// Persist a suspended run as ABORTED and retire it; caller holds the driver
    async fn archive_aborted(
        &self,
        slot: &RunSlot<S>,
        run: &mut Run<S>,
    ) -> Result<RunReport, EngineError> {
        run.status = RunStatus::Aborted;
        run.suspended_at = None;
        let checkpoint = run.checkpoint();
        slot.publish(run).await;
        self.store.save(&checkpoint).await?;
        self.runs.write().await.remove(&run.run_id);
        log::warn!("Run {} aborted while suspended", run.run_id);
        Ok(run.report())
    }

    fn stale(&self, run_id: &RunId, supplied: S, active: Option<S>) -> EngineError {
        EngineError::StaleResume {
            run_id: run_id.clone(),
            supplied: supplied.name().to_string(),
            active: active.map(|s| s.name().to_string()),
        }
    }

    /// Drive the run, persist where it stopped and retire it if it is final
    async fn drive(
        &self,
        slot: &RunSlot<S>,
        run: &mut Run<S>,
        cursor: Cursor<S>,
    ) -> Result<RunReport, EngineError> {
        let outcome = self.executor.drive(run, cursor, slot).await;
        if run.status == RunStatus::Suspended && slot.abort_requested() {
            log::warn!("Run {} aborted as it suspended", run.run_id);
            run.status = RunStatus::Aborted;
            run.suspended_at = None;
        }

        let checkpoint = run.checkpoint();
        slot.publish(run).await;
        let persisted = self.store.save(&checkpoint).await;

        if run.status.is_final() {
            self.runs.write().await.remove(&run.run_id);
        }

        match (outcome, persisted) {
            (Err(err), Err(save_err)) => {
                log::error!(
                    "Run {}: failed to persist checkpoint {}: {}",
                    run.run_id,
                    checkpoint.sequence,
                    save_err
                );
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(()), Err(save_err)) => Err(save_err.into()),
            (Ok(()), Ok(())) => Ok(run.report()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::checkpoint::MemoryCheckpointStore;
    use crate::flow::error::StepError;
    use crate::flow::state::{PartialUpdate, StateSchema};
    use crate::flow::types::{StepInput, StepOutput, Transition};
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Draft {
        Write,
        Review,
        Publish,
    }

    impl StepName for Draft {
        const ALL: &'static [Self] = &[Draft::Write, Draft::Review, Draft::Publish];

        fn name(&self) -> &'static str {
            match self {
                Draft::Write => "write",
                Draft::Review => "review",
                Draft::Publish => "publish",
            }
        }
    }

    fn write(input: &StepInput, _: &()) -> Result<StepOutput<Draft>, StepError> {
        let topic = input
            .get("topic")
            .and_then(|v| v.as_str())
            .ok_or("missing topic")?;
        Ok(PartialUpdate::new()
            .set("drafts", json!([format!("draft about {}", topic)]))
            .into())
    }

    fn publish(_: &StepInput, _: &()) -> Result<StepOutput<Draft>, StepError> {
        Ok(PartialUpdate::new().set("published", json!(true)).into())
    }

    fn engine() -> Engine<Draft, ()> {
        let table = StepTable::builder()
            .schema(StateSchema::new().append("drafts"))
            .entry(|_| Ok(Transition::to(Draft::Write)))
            .step_fn(Draft::Write, write)
            .step_fn(Draft::Publish, publish)
            .checkpoint(Draft::Review)
            .edge(Draft::Write, Draft::Review)
            .route(Draft::Review, |input| match input.decision() {
                Some(d) if d.action == DecisionAction::Reject => Ok(Transition::to(Draft::Write)),
                _ => Ok(Transition::to(Draft::Publish)),
            })
            .finish(Draft::Publish)
            .build()
            .unwrap();
        Engine::new(
            table,
            Arc::new(()),
            Arc::new(MemoryCheckpointStore::new()),
            EngineConfig::default(),
        )
    }

    fn initial() -> StateRecord {
        StateRecord::from_json(json!({"topic": "rust"}))
    }

    #[tokio::test]
    async fn test_suspend_then_resume_completes() {
        let engine = engine();
        let report = engine.start_run(initial()).await.unwrap();
        assert_eq!(report.status, RunStatus::Suspended);
        assert_eq!(report.suspended_at.as_deref(), Some("review"));

        let done = engine
            .resume(&report.run_id, Draft::Review, Decision::proceed())
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.state.get("published"), Some(&json!(true)));
        assert_eq!(
            done.state.get(DECISION_FIELD).unwrap()["action"],
            json!("proceed")
        );
        assert!(engine.active_runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_resume_wrong_checkpoint_is_stale_and_harmless() {
        let engine = engine();
        let report = engine.start_run(initial()).await.unwrap();
        let before = engine.get_state(&report.run_id).await.unwrap();

        let err = engine
            .resume(&report.run_id, Draft::Publish, Decision::proceed())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::StaleResume { ref active, .. } if active.as_deref() == Some("review")
        ));
        assert_eq!(engine.get_state(&report.run_id).await.unwrap(), before);
        assert_eq!(
            engine.get_run(&report.run_id).await.unwrap().status,
            RunStatus::Suspended
        );
    }

    #[tokio::test]
    async fn test_reject_loops_back_and_suspends_again() {
        let engine = engine();
        let report = engine.start_run(initial()).await.unwrap();

        let again = engine
            .resume(&report.run_id, Draft::Review, Decision::reject("too short"))
            .await
            .unwrap();
        assert_eq!(again.status, RunStatus::Suspended);
        assert_eq!(
            again.state.get("drafts"),
            Some(&json!(["draft about rust", "draft about rust"]))
        );
        assert_eq!(
            again.state.get(DECISION_FIELD).unwrap()["feedback"],
            json!("too short")
        );
    }

    #[tokio::test]
    async fn test_edit_is_merged_before_routing() {
        let engine = engine();
        let report = engine.start_run(initial()).await.unwrap();

        let done = engine
            .resume(
                &report.run_id,
                Draft::Review,
                Decision::edit(PartialUpdate::new().set("topic", json!("tokio"))),
            )
            .await
            .unwrap();
        assert_eq!(done.state.get("topic"), Some(&json!("tokio")));
    }

    #[tokio::test]
    async fn test_edit_touching_reserved_field_is_rejected() {
        let engine = engine();
        let report = engine.start_run(initial()).await.unwrap();

        let err = engine
            .resume(
                &report.run_id,
                Draft::Review,
                Decision::edit(PartialUpdate::new().set("_error", json!("x"))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Merge { .. }));
        assert_eq!(
            engine.get_run(&report.run_id).await.unwrap().status,
            RunStatus::Suspended
        );
    }

    #[tokio::test]
    async fn test_abort_suspended_run() {
        let engine = engine();
        let report = engine.start_run(initial()).await.unwrap();

        let aborted = engine.abort_run(&report.run_id).await.unwrap();
        assert_eq!(aborted.status, RunStatus::Aborted);

        // Archived: still readable, no longer resumable.
        assert_eq!(
            engine.get_run(&report.run_id).await.unwrap().status,
            RunStatus::Aborted
        );
        let err = engine
            .resume(&report.run_id, Draft::Review, Decision::proceed())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StaleResume { .. }));

        // A second abort is a no-op.
        assert_eq!(
            engine.abort_run(&report.run_id).await.unwrap().status,
            RunStatus::Aborted
        );
    }

    #[tokio::test]
    async fn test_duplicate_and_reserved_start() {
        let engine = engine();
        let run_id = RunId::from("fixed");
        engine
            .start_run_with_id(run_id.clone(), initial())
            .await
            .unwrap();

        let err = engine
            .start_run_with_id(run_id, initial())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateRun(_)));

        let err = engine
            .start_run(StateRecord::from_json(json!({"_decision": {}})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Merge { .. }));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let engine = engine();
        let missing = RunId::from("missing");
        assert!(matches!(
            engine.get_run(&missing).await,
            Err(EngineError::RunNotFound(_))
        ));
        assert!(matches!(
            engine.abort_run(&missing).await,
            Err(EngineError::RunNotFound(_))
        ));
        assert!(matches!(
            engine.resume(&missing, Draft::Review, Decision::proceed()).await,
            Err(EngineError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_history_records_stops_and_resume_claims() {
        let engine = engine();
        let report = engine.start_run(initial()).await.unwrap();
        engine
            .resume(&report.run_id, Draft::Review, Decision::proceed())
            .await
            .unwrap();

        let history = engine.history(&report.run_id).await.unwrap();
        let statuses: Vec<RunStatus> = history.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                RunStatus::Suspended,
                RunStatus::Running,
                RunStatus::Completed
            ]
        );
        assert_eq!(history[0].active_checkpoint.as_deref(), Some("review"));
        // The claim already carries the decision, but no step output.
        assert_eq!(history[1].active_checkpoint, None);
        assert_eq!(
            history[1].state_record.get(DECISION_FIELD).unwrap()["action"],
            json!("proceed")
        );
        assert_eq!(history[1].state_record.get("published"), None);
        assert_eq!(history[2].sequence, 3);
    }

    #[tokio::test]
    async fn test_late_abort_is_honored_by_next_resume() {
        let engine = engine();
        let report = engine.start_run(initial()).await.unwrap();
        // An abort that raced the suspension leaves only the flag behind.
        engine.slot(&report.run_id).await.unwrap().request_abort();

        let err = engine
            .resume(&report.run_id, Draft::Review, Decision::proceed())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::RunNotActive { ref status, .. } if status == "aborted"
        ));

        let run = engine.get_run(&report.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Aborted);
        assert_eq!(run.state.get("published"), None);
        assert_eq!(run.state.get(DECISION_FIELD), None);
        assert!(engine.active_runs().await.is_empty());
        let history = engine.history(&report.run_id).await.unwrap();
        assert_eq!(history.last().unwrap().status, RunStatus::Aborted);
    }

    #[tokio::test]
    async fn test_recover_reports_claimed_run() {
        let first = engine();
        let report = first.start_run(initial()).await.unwrap();
        let mut claimed = first.history(&report.run_id).await.unwrap().remove(0);
        claimed.sequence = 2;
        claimed.status = RunStatus::Running;
        claimed.active_checkpoint = None;

        let other = engine();
        other.store().save(&claimed).await.unwrap();
        let recovered = other.recover(&report.run_id).await.unwrap();
        assert_eq!(recovered.status, RunStatus::Running);
        assert!(other.active_runs().await.is_empty());
    }
}
