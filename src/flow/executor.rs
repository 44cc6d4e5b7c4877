// SPDX-License-Identifier: MIT

//! Scheduler/executor
//!
//! Advances one run at a time: invoke, merge, route, repeat. Fan-out batches
//! run every branch as its own tokio task behind a join barrier and are merged
//! in branch order once all of them have returned.

use futures::future::join_all;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::error::{EngineError, RoutingError, StepError};
use super::merge::{merge, merge_one};
use super::registry::StepTable;
use super::run::{Run, RunSlot, RunStatus};
use super::state::PartialUpdate;
use super::step::Step;
use super::types::{Branch, StepInput, StepName, StepOutput, StepRef, Transition, ERROR_FIELD};

/// Engine-wide execution limits
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Upper bound on waiting for a fan-out batch; `None` waits forever
    pub join_timeout: Option<Duration>,
    /// Branches of one batch allowed to run at once; `None` is unbounded
    pub max_parallel_branches: Option<usize>,
    /// Transitions allowed within a single start or resume call
    pub max_transitions: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            join_timeout: None,
            max_parallel_branches: None,
            max_transitions: 1000,
        }
    }
}

/// Where a drive picks up
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cursor<S> {
    /// Evaluate the entry router
    Entry,
    /// Evaluate the router of a step (or checkpoint) that has just finished
    After(S),
}

pub struct Executor<S: StepName, D> {
    table: Arc<StepTable<S, D>>,
    deps: Arc<D>,
    config: EngineConfig,
}

impl<S: StepName, D: Send + Sync + 'static> Executor<S, D> {
    pub fn new(table: Arc<StepTable<S, D>>, deps: Arc<D>, config: EngineConfig) -> Self {
        Self {
            table,
            deps,
            config,
        }
    }

    pub fn table(&self) -> &StepTable<S, D> {
        &self.table
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Advance `run` until it completes, suspends, is aborted or fails
    ///
    /// A failure is recorded on the run (status FAILED, detail under `_error`)
    /// before being returned.
    pub async fn drive(
        &self,
        run: &mut Run<S>,
        cursor: Cursor<S>,
        slot: &RunSlot<S>,
    ) -> Result<(), EngineError> {
        match self.advance(run, cursor, slot).await {
            Ok(()) => Ok(()),
            Err(err) => {
                log::error!("Run {} failed: {}", run.run_id, err);
                record_failure(run, &err);
                slot.publish(run).await;
                Err(err)
            }
        }
    }

    async fn advance(
        &self,
        run: &mut Run<S>,
        cursor: Cursor<S>,
        slot: &RunSlot<S>,
    ) -> Result<(), EngineError> {
        let mut transition = match cursor {
            Cursor::Entry => self.table.route_entry(&run.view()),
            Cursor::After(step) => self.table.route(step, &run.view()),
        }
        .map_err(|source| routing_error(run, source))?;

        let mut transitions = 0u32;
        loop {
            if slot.abort_requested() {
                self.mark_aborted(run, slot).await;
                return Ok(());
            }
            log::debug!(
                "Run {}: next transition {}",
                run.run_id,
                transition.describe()
            );

            let next = match transition {
                Transition::Terminal => {
                    log::info!("Run {} completed", run.run_id);
                    run.status = RunStatus::Completed;
                    slot.publish(run).await;
                    return Ok(());
                }
                Transition::Checkpoint(checkpoint) => {
                    log::info!("Run {} suspended at '{}'", run.run_id, checkpoint.name());
                    run.status = RunStatus::Suspended;
                    run.suspended_at = Some(checkpoint);
                    slot.publish(run).await;
                    return Ok(());
                }
                Transition::Next(step_ref) => {
                    self.count_transition(run, &mut transitions)?;
                    self.run_single(run, step_ref, slot).await?
                }
                Transition::FanOut(refs) => {
                    self.count_transition(run, &mut transitions)?;
                    self.run_batch(run, refs, slot).await?
                }
            };

            match next {
                Some(t) => transition = t,
                None => {
                    self.mark_aborted(run, slot).await;
                    return Ok(());
                }
            }
        }
    }

    fn count_transition(&self, run: &Run<S>, transitions: &mut u32) -> Result<(), EngineError> {
        *transitions += 1;
        if *transitions > self.config.max_transitions {
            return Err(EngineError::TransitionLimit {
                run_id: run.run_id.clone(),
                limit: self.config.max_transitions,
            });
        }
        Ok(())
    }

    async fn mark_aborted(&self, run: &mut Run<S>, slot: &RunSlot<S>) {
        log::warn!("Run {} aborted", run.run_id);
        run.status = RunStatus::Aborted;
        run.pending_steps.clear();
        run.pending_batch = None;
        run.suspended_at = None;
        slot.publish(run).await;
    }

    fn count_loop(&self, run: &mut Run<S>, step: S) {
        if let Some(spec) = self.table.loop_for(step) {
            let count = run.loop_counters.entry(spec.name.clone()).or_insert(0);
            *count += 1;
            log::debug!(
                "Run {}: loop '{}' evaluation {}",
                run.run_id,
                spec.name,
                count
            );
        }
    }

    fn step_impl(&self, run: &Run<S>, step: S) -> Result<Arc<dyn Step<S, D>>, EngineError> {
        self.table.step(step).ok_or_else(|| {
            routing_error(
                run,
                RoutingError::unmatched(step.name(), "no step implementation registered"),
            )
        })
    }

    /// Run one step; `None` means the run was aborted while it ran
    async fn run_single(
        &self,
        run: &mut Run<S>,
        step_ref: StepRef<S>,
        slot: &RunSlot<S>,
    ) -> Result<Option<Transition<S>>, EngineError> {
        let id = step_ref.step;
        let step = self.step_impl(run, id)?;
        self.count_loop(run, id);

        let input = StepInput {
            run_id: run.run_id.clone(),
            state: Arc::new(run.state.clone()),
            branch_input: step_ref.branch_input.clone(),
            branch: None,
            loop_counters: run.loop_counters.clone(),
        };
        run.pending_steps = vec![step_ref];
        slot.publish(run).await;

        log::info!("Run {}: executing step '{}'", run.run_id, id.name());
        let output = step.invoke(&input, self.deps.as_ref()).await;
        run.pending_steps.clear();

        if slot.abort_requested() {
            log::info!(
                "Run {}: discarding output of '{}' after abort",
                run.run_id,
                id.name()
            );
            return Ok(None);
        }

        let output = output.map_err(|source| EngineError::Step {
            run_id: run.run_id.clone(),
            step: id.name().to_string(),
            branch: None,
            source,
        })?;

        let transition = match output {
            StepOutput::Update(update) => {
                run.state = merge_one(&run.state, update, self.table.schema())
                    .map_err(|source| EngineError::Merge {
                        run_id: run.run_id.clone(),
                        source,
                    })?;
                slot.publish(run).await;
                self.table.route(id, &run.view())
            }
            StepOutput::FanOut(refs) => {
                let directive = Transition::FanOut(refs);
                self.table.resolve(id, directive, &run.view())
            }
        }
        .map_err(|source| routing_error(run, source))?;

        log::debug!(
            "Run {}: '{}' routed to {}",
            run.run_id,
            id.name(),
            transition.describe()
        );
        Ok(Some(transition))
    }

    /// Run a fan-out batch behind a join barrier; `None` means aborted
    async fn run_batch(
        &self,
        run: &mut Run<S>,
        refs: Vec<StepRef<S>>,
        slot: &RunSlot<S>,
    ) -> Result<Option<Transition<S>>, EngineError> {
        run.batch_seq += 1;
        let batch_id = run.batch_seq;

        let mut steps = Vec::with_capacity(refs.len());
        for step_ref in &refs {
            steps.push(self.step_impl(run, step_ref.step)?);
            self.count_loop(run, step_ref.step);
        }

        let snapshot = Arc::new(run.state.clone());
        let counters = run.loop_counters.clone();
        run.pending_steps = refs.clone();
        run.pending_batch = Some(batch_id);
        slot.publish(run).await;

        log::info!(
            "Run {}: batch {} dispatching {} branches of {}",
            run.run_id,
            batch_id,
            refs.len(),
            Transition::FanOut(refs.clone()).describe()
        );

        let limiter = self
            .config
            .max_parallel_branches
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        let finished: Arc<Vec<AtomicBool>> =
            Arc::new(refs.iter().map(|_| AtomicBool::new(false)).collect());

        let mut handles = Vec::with_capacity(refs.len());
        for (index, (step_ref, step)) in refs.iter().zip(steps).enumerate() {
            let input = StepInput {
                run_id: run.run_id.clone(),
                state: Arc::clone(&snapshot),
                branch_input: step_ref.branch_input.clone(),
                branch: Some(Branch { batch_id, index }),
                loop_counters: counters.clone(),
            };
            let deps = Arc::clone(&self.deps);
            let limiter = limiter.clone();
            let finished = Arc::clone(&finished);

            handles.push(tokio::spawn(async move {
                let _permit = match limiter {
                    Some(limiter) => match limiter.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => return Err(StepError::new("branch limiter closed")),
                    },
                    None => None,
                };
                let result = step.invoke(&input, deps.as_ref()).await;
                finished[index].store(true, Ordering::SeqCst);
                result
            }));
        }

        let joined = match self.config.join_timeout {
            Some(limit) => {
                let outcome = tokio::time::timeout(limit, join_all(handles.iter_mut())).await;
                match outcome {
                    Ok(results) => results,
                    Err(_) => {
                        for handle in &handles {
                            handle.abort();
                        }
                        let pending: Vec<usize> = finished
                            .iter()
                            .enumerate()
                            .filter(|(_, done)| !done.load(Ordering::SeqCst))
                            .map(|(index, _)| index)
                            .collect();
                        run.pending_steps.clear();
                        run.pending_batch = None;
                        return Err(EngineError::JoinTimeout {
                            run_id: run.run_id.clone(),
                            batch_id,
                            timeout: limit,
                            pending,
                        });
                    }
                }
            }
            None => join_all(handles.iter_mut()).await,
        };
        run.pending_steps.clear();
        run.pending_batch = None;

        if slot.abort_requested() {
            log::info!(
                "Run {}: discarding {} branch results of batch {} after abort",
                run.run_id,
                joined.len(),
                batch_id
            );
            return Ok(None);
        }

        let mut order = Vec::with_capacity(joined.len());
        let mut updates: Vec<PartialUpdate> = Vec::with_capacity(joined.len());
        let mut failures: Vec<(usize, StepError)> = Vec::new();
        for (index, result) in joined.into_iter().enumerate() {
            match result {
                Ok(Ok(StepOutput::Update(update))) => {
                    order.push(index);
                    updates.push(update);
                }
                Ok(Ok(StepOutput::FanOut(_))) => failures.push((
                    index,
                    StepError::new("a branch of a fan-out cannot issue another fan-out"),
                )),
                Ok(Err(err)) => failures.push((index, err)),
                Err(join_err) => failures.push((
                    index,
                    StepError::new(format!("branch task failed: {}", join_err)),
                )),
            }
        }

        if let Some((index, first)) = failures.first() {
            for (i, err) in &failures {
                log::error!(
                    "Run {}: batch {} branch {} ('{}') failed: {}",
                    run.run_id,
                    batch_id,
                    i,
                    refs[*i].step.name(),
                    err
                );
            }
            let message = if failures.len() == 1 {
                first.message.clone()
            } else {
                let others: Vec<String> = failures[1..]
                    .iter()
                    .map(|(i, err)| format!("branch {}: {}", i, err))
                    .collect();
                format!("{} (also failed: {})", first.message, others.join("; "))
            };
            return Err(EngineError::Step {
                run_id: run.run_id.clone(),
                step: refs[*index].step.name().to_string(),
                branch: Some(*index),
                source: StepError::new(message),
            });
        }

        run.state = merge(&run.state, &updates, &order, self.table.schema())
            .map_err(|source| EngineError::Merge {
                run_id: run.run_id.clone(),
                source,
            })?;
        slot.publish(run).await;
        log::info!(
            "Run {}: batch {} joined {} branches",
            run.run_id,
            batch_id,
            updates.len()
        );

        self.route_after_batch(run, batch_id, &refs).map(Some)
    }

    /// Routers of the distinct branch steps must agree on one successor
    fn route_after_batch(
        &self,
        run: &Run<S>,
        batch_id: u64,
        refs: &[StepRef<S>],
    ) -> Result<Transition<S>, EngineError> {
        let mut distinct: Vec<S> = Vec::new();
        for step_ref in refs {
            if !distinct.contains(&step_ref.step) {
                distinct.push(step_ref.step);
            }
        }

        let mut chosen: Option<Transition<S>> = None;
        for step in &distinct {
            let transition = self
                .table
                .route(*step, &run.view())
                .map_err(|source| routing_error(run, source))?;
            match &chosen {
                None => chosen = Some(transition),
                Some(previous) if *previous == transition => {}
                Some(_) => {
                    return Err(routing_error(
                        run,
                        RoutingError::DivergentJoin {
                            batch_id,
                            steps: distinct.iter().map(|s| s.name().to_string()).collect(),
                        },
                    ))
                }
            }
        }

        chosen.ok_or_else(|| {
            routing_error(
                run,
                RoutingError::EmptyFanOut {
                    after: format!("batch {}", batch_id),
                },
            )
        })
    }
}

fn routing_error<S>(run: &Run<S>, source: RoutingError) -> EngineError {
    EngineError::Routing {
        run_id: run.run_id.clone(),
        source,
    }
}

/// Move `run` to FAILED and store the failure detail under `_error`
fn record_failure<S>(run: &mut Run<S>, err: &EngineError) {
    let detail = match err {
        EngineError::Step {
            step,
            branch,
            source,
            ..
        } => json!({
            "kind": "step",
            "step": step,
            "branch": branch,
            "message": source.message,
        }),
        EngineError::Routing { source, .. } => json!({
            "kind": "routing",
            "message": source.to_string(),
        }),
        EngineError::JoinTimeout {
            batch_id, pending, ..
        } => json!({
            "kind": "join_timeout",
            "batch_id": batch_id,
            "pending": pending,
            "message": err.to_string(),
        }),
        EngineError::TransitionLimit { limit, .. } => json!({
            "kind": "transition_limit",
            "limit": limit,
            "message": err.to_string(),
        }),
        EngineError::Merge { source, .. } => json!({
            "kind": "merge",
            "message": source.to_string(),
        }),
        other => json!({
            "kind": "engine",
            "message": other.to_string(),
        }),
    };

    run.status = RunStatus::Failed;
    run.suspended_at = None;
    run.pending_steps.clear();
    run.pending_batch = None;
    run.state.insert(ERROR_FIELD, detail);
}
