// SPDX-License-Identifier: MIT

//! Step registry and transition table
//!
//! Built once per engine through `StepTable::builder()` and immutable after.
//! `build()` walks every variant of the step enum, so a variant without an
//! implementation or router is rejected before any run starts.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::error::{GraphError, RoutingError, StepError};
use super::state::{StateRecord, StateSchema};
use super::step::{FnStep, Step};
use super::types::{RouteInput, StepInput, StepName, StepOutput, Transition};

/// Routing function evaluated after a step's output has been merged
pub type Router<S> =
    Arc<dyn Fn(&RouteInput<'_>) -> Result<Transition<S>, RoutingError> + Send + Sync>;

/// Bound on a reducer-driven research loop
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSpec<S> {
    /// Key in `loop_counters`
    pub name: String,
    /// Fallback upper bound on reducer evaluations
    pub max_loops: u32,
    /// Optional state field overriding `max_loops` per run
    pub max_loops_field: Option<String>,
    /// Successor forced once the bound is reached
    pub exit: S,
}

impl<S: StepName> LoopSpec<S> {
    pub fn new(name: impl Into<String>, max_loops: u32, exit: S) -> Self {
        Self {
            name: name.into(),
            max_loops,
            max_loops_field: None,
            exit,
        }
    }

    /// Read the bound from `field` when the run sets it
    pub fn max_from_field(mut self, field: impl Into<String>) -> Self {
        self.max_loops_field = Some(field.into());
        self
    }

    /// Effective bound for the given state
    pub fn limit(&self, state: &StateRecord) -> u32 {
        self.max_loops_field
            .as_deref()
            .and_then(|f| state.get(f))
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(self.max_loops)
    }
}

/// Immutable mapping from step identifiers to implementations and routers
pub struct StepTable<S: StepName, D> {
    schema: StateSchema,
    entry: Router<S>,
    steps: HashMap<S, Arc<dyn Step<S, D>>>,
    routers: HashMap<S, Router<S>>,
    checkpoints: HashSet<S>,
    loops: HashMap<S, LoopSpec<S>>,
}

impl<S: StepName, D: Send + Sync + 'static> StepTable<S, D> {
    pub fn builder() -> StepTableBuilder<S, D> {
        StepTableBuilder::new()
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    pub fn step(&self, id: S) -> Option<Arc<dyn Step<S, D>>> {
        self.steps.get(&id).cloned()
    }

    pub fn is_checkpoint(&self, id: S) -> bool {
        self.checkpoints.contains(&id)
    }

    /// Loop whose reducer is `id`
    pub fn loop_for(&self, id: S) -> Option<&LoopSpec<S>> {
        self.loops.get(&id)
    }

    /// Resolve the first transition of a run
    pub fn route_entry(&self, input: &RouteInput<'_>) -> Result<Transition<S>, RoutingError> {
        let transition = (self.entry)(input)?;
        self.normalize("entry", transition)
    }

    /// Resolve the successor of `after`, applying its loop bound if any
    ///
    /// An exhausted loop exits without consulting the router at all.
    pub fn route(&self, after: S, input: &RouteInput<'_>) -> Result<Transition<S>, RoutingError> {
        if let Some(spec) = self.loops.get(&after) {
            let count = input.loop_count(&spec.name);
            let limit = spec.limit(input.state);
            if count >= limit {
                log::info!(
                    "Loop '{}' reached {}/{} evaluations, exiting to '{}'",
                    spec.name,
                    count,
                    limit,
                    spec.exit.name()
                );
                return self.normalize(after.name(), Transition::to(spec.exit));
            }
        }

        let router = self
            .routers
            .get(&after)
            .ok_or_else(|| RoutingError::unmatched(after.name(), "no router registered"))?;
        let transition = router(input)?;
        self.resolve(after, transition, input)
    }

    /// Apply the loop bound of `after` to `transition`, then normalize it
    ///
    /// Used for router output and for fan-out directives returned by steps.
    pub fn resolve(
        &self,
        after: S,
        mut transition: Transition<S>,
        input: &RouteInput<'_>,
    ) -> Result<Transition<S>, RoutingError> {
        if let Some(spec) = self.loops.get(&after) {
            let count = input.loop_count(&spec.name);
            let limit = spec.limit(input.state);
            let exit = Transition::to(spec.exit);
            if count >= limit && transition != exit {
                log::info!(
                    "Loop '{}' reached {}/{} evaluations, forcing '{}' instead of {}",
                    spec.name,
                    count,
                    limit,
                    spec.exit.name(),
                    transition.describe()
                );
                transition = exit;
            }
        }

        self.normalize(after.name(), transition)
    }

    /// Validate a transition and turn `Next(checkpoint)` into `Checkpoint`
    pub fn normalize(
        &self,
        after: &str,
        transition: Transition<S>,
    ) -> Result<Transition<S>, RoutingError> {
        match transition {
            Transition::Next(r) if self.is_checkpoint(r.step) => Ok(Transition::Checkpoint(r.step)),
            Transition::Checkpoint(s) if !self.is_checkpoint(s) => {
                Err(RoutingError::NotACheckpoint(s.name().to_string()))
            }
            Transition::FanOut(refs) if refs.is_empty() => Err(RoutingError::EmptyFanOut {
                after: after.to_string(),
            }),
            Transition::FanOut(refs) => {
                if let Some(r) = refs.iter().find(|r| self.is_checkpoint(r.step)) {
                    return Err(RoutingError::unmatched(
                        after,
                        format!("fan-out cannot target checkpoint '{}'", r.step.name()),
                    ));
                }
                Ok(Transition::FanOut(refs))
            }
            other => Ok(other),
        }
    }
}

/// Builder for `StepTable`
pub struct StepTableBuilder<S: StepName, D> {
    schema: StateSchema,
    entry: Option<Router<S>>,
    steps: HashMap<S, Arc<dyn Step<S, D>>>,
    routers: HashMap<S, Router<S>>,
    checkpoints: HashSet<S>,
    loops: HashMap<S, LoopSpec<S>>,
}

impl<S: StepName, D: Send + Sync + 'static> StepTableBuilder<S, D> {
    pub fn new() -> Self {
        Self {
            schema: StateSchema::default(),
            entry: None,
            steps: HashMap::new(),
            routers: HashMap::new(),
            checkpoints: HashSet::new(),
            loops: HashMap::new(),
        }
    }

    /// Per-field merge policies for every run of this table
    pub fn schema(mut self, schema: StateSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn entry<F>(mut self, router: F) -> Self
    where
        F: Fn(&RouteInput<'_>) -> Result<Transition<S>, RoutingError> + Send + Sync + 'static,
    {
        self.entry = Some(Arc::new(router));
        self
    }

    pub fn step(mut self, id: S, step: impl Step<S, D> + 'static) -> Self {
        self.steps.insert(id, Arc::new(step));
        self
    }

    /// Register a synchronous closure as a step
    pub fn step_fn<F>(self, id: S, f: F) -> Self
    where
        F: Fn(&StepInput, &D) -> Result<StepOutput<S>, StepError> + Send + Sync + 'static,
    {
        self.step(id, FnStep::new(f))
    }

    pub fn route<F>(mut self, after: S, router: F) -> Self
    where
        F: Fn(&RouteInput<'_>) -> Result<Transition<S>, RoutingError> + Send + Sync + 'static,
    {
        self.routers.insert(after, Arc::new(router));
        self
    }

    /// Route `after` unconditionally to `next`
    pub fn edge(self, after: S, next: S) -> Self {
        self.route(after, move |_| Ok(Transition::to(next)))
    }

    /// Route `after` to the terminal signal
    pub fn finish(self, after: S) -> Self {
        self.route(after, |_| Ok(Transition::Terminal))
    }

    /// Declare `id` as a human checkpoint; its router runs after resume
    pub fn checkpoint(mut self, id: S) -> Self {
        self.checkpoints.insert(id);
        self
    }

    /// Bound the loop whose reducer is `reducer`
    pub fn bounded_loop(mut self, reducer: S, spec: LoopSpec<S>) -> Self {
        self.loops.insert(reducer, spec);
        self
    }

    pub fn build(self) -> Result<StepTable<S, D>, GraphError> {
        let entry = self.entry.ok_or(GraphError::MissingEntry)?;

        for id in S::ALL {
            let is_checkpoint = self.checkpoints.contains(id);
            let has_step = self.steps.contains_key(id);
            if is_checkpoint && has_step {
                return Err(GraphError::CheckpointConflict(id.name().to_string()));
            }
            if !is_checkpoint && !has_step {
                return Err(GraphError::MissingStep(id.name().to_string()));
            }
            if !self.routers.contains_key(id) {
                return Err(GraphError::MissingRouter(id.name().to_string()));
            }
        }

        let mut names = HashSet::new();
        for (reducer, spec) in &self.loops {
            if self.checkpoints.contains(reducer) {
                return Err(GraphError::InvalidLoop {
                    name: spec.name.clone(),
                    reason: format!("reducer '{}' is a checkpoint", reducer.name()),
                });
            }
            if !names.insert(spec.name.as_str()) {
                return Err(GraphError::InvalidLoop {
                    name: spec.name.clone(),
                    reason: "name used by more than one loop".to_string(),
                });
            }
        }

        Ok(StepTable {
            schema: self.schema,
            entry,
            steps: self.steps,
            routers: self.routers,
            checkpoints: self.checkpoints,
            loops: self.loops,
        })
    }
}

impl<S: StepName, D: Send + Sync + 'static> Default for StepTableBuilder<S, D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::state::PartialUpdate;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Research {
        Search,
        Reflect,
        Review,
        Write,
    }

    impl StepName for Research {
        const ALL: &'static [Self] = &[
            Research::Search,
            Research::Reflect,
            Research::Review,
            Research::Write,
        ];

        fn name(&self) -> &'static str {
            match self {
                Research::Search => "search",
                Research::Reflect => "reflect",
                Research::Review => "review",
                Research::Write => "write",
            }
        }
    }

    fn noop(_: &StepInput, _: &()) -> Result<StepOutput<Research>, StepError> {
        Ok(StepOutput::Update(PartialUpdate::new()))
    }

    fn complete_builder() -> StepTableBuilder<Research, ()> {
        StepTable::builder()
            .entry(|_| Ok(Transition::fan_out(Research::Search, vec![json!("q")])))
            .step_fn(Research::Search, noop)
            .step_fn(Research::Reflect, noop)
            .step_fn(Research::Write, noop)
            .checkpoint(Research::Review)
            .edge(Research::Search, Research::Reflect)
            .route(Research::Reflect, |input| {
                if input.flag("sufficient") {
                    Ok(Transition::to(Research::Write))
                } else {
                    Ok(Transition::fan_out(Research::Search, vec![json!("more")]))
                }
            })
            .edge(Research::Write, Research::Review)
            .finish(Research::Review)
    }

    #[test]
    fn test_build_complete_table() {
        let table = complete_builder().build().unwrap();
        assert!(table.is_checkpoint(Research::Review));
        assert!(table.step(Research::Search).is_some());
        assert!(table.step(Research::Review).is_none());
    }

    #[test]
    fn test_missing_step_rejected() {
        let result = StepTable::<Research, ()>::builder()
            .entry(|_| Ok(Transition::Terminal))
            .step_fn(Research::Search, noop)
            .finish(Research::Search)
            .build();
        assert!(matches!(result, Err(GraphError::MissingStep(ref s)) if s == "reflect"));
    }

    #[test]
    fn test_missing_router_rejected() {
        let result = StepTable::<Research, ()>::builder()
            .entry(|_| Ok(Transition::Terminal))
            .step_fn(Research::Search, noop)
            .step_fn(Research::Reflect, noop)
            .step_fn(Research::Write, noop)
            .checkpoint(Research::Review)
            .finish(Research::Search)
            .build();
        assert!(matches!(result, Err(GraphError::MissingRouter(ref s)) if s == "reflect"));
    }

    #[test]
    fn test_missing_entry_rejected() {
        let result = StepTable::<Research, ()>::builder().build();
        assert!(matches!(result, Err(GraphError::MissingEntry)));
    }

    #[test]
    fn test_checkpoint_conflict_rejected() {
        let result = complete_builder().step_fn(Research::Review, noop).build();
        assert!(matches!(result, Err(GraphError::CheckpointConflict(_))));
    }

    #[test]
    fn test_next_to_checkpoint_is_normalized() {
        let table = complete_builder().build().unwrap();
        let state = StateRecord::empty();
        let counters = BTreeMap::new();
        let input = RouteInput {
            state: &state,
            loop_counters: &counters,
        };

        let t = table.route(Research::Write, &input).unwrap();
        assert_eq!(t, Transition::Checkpoint(Research::Review));
    }

    #[test]
    fn test_checkpoint_transition_requires_declaration() {
        let table = complete_builder()
            .route(Research::Write, |_| Ok(Transition::Checkpoint(Research::Search)))
            .build()
            .unwrap();
        let state = StateRecord::empty();
        let counters = BTreeMap::new();
        let input = RouteInput {
            state: &state,
            loop_counters: &counters,
        };

        let err = table.route(Research::Write, &input).unwrap_err();
        assert_eq!(err, RoutingError::NotACheckpoint("search".to_string()));
    }

    #[test]
    fn test_empty_fan_out_rejected() {
        let table = complete_builder()
            .entry(|_| Ok(Transition::FanOut(vec![])))
            .build()
            .unwrap();
        let state = StateRecord::empty();
        let counters = BTreeMap::new();
        let input = RouteInput {
            state: &state,
            loop_counters: &counters,
        };

        let err = table.route_entry(&input).unwrap_err();
        assert_eq!(
            err,
            RoutingError::EmptyFanOut {
                after: "entry".to_string()
            }
        );
    }

    #[test]
    fn test_loop_bound_overrides_router() {
        let table = complete_builder()
            .bounded_loop(
                Research::Reflect,
                LoopSpec::new("search", 3, Research::Write),
            )
            .build()
            .unwrap();
        let state = StateRecord::empty();

        let mut counters = BTreeMap::new();
        counters.insert("search".to_string(), 2);
        let input = RouteInput {
            state: &state,
            loop_counters: &counters,
        };
        assert!(matches!(
            table.route(Research::Reflect, &input).unwrap(),
            Transition::FanOut(_)
        ));

        counters.insert("search".to_string(), 3);
        let input = RouteInput {
            state: &state,
            loop_counters: &counters,
        };
        assert_eq!(
            table.route(Research::Reflect, &input).unwrap(),
            Transition::to(Research::Write)
        );
    }

    #[test]
    fn test_exhausted_loop_exits_even_if_router_fails() {
        let table = complete_builder()
            .route(Research::Reflect, |input| match input.get("sufficient") {
                Some(_) => Ok(Transition::to(Research::Write)),
                None => Err(RoutingError::unmatched("reflect", "sufficient is not set")),
            })
            .bounded_loop(
                Research::Reflect,
                LoopSpec::new("search", 2, Research::Write),
            )
            .build()
            .unwrap();
        let state = StateRecord::empty();

        let mut counters = BTreeMap::new();
        counters.insert("search".to_string(), 1);
        let input = RouteInput {
            state: &state,
            loop_counters: &counters,
        };
        assert!(matches!(
            table.route(Research::Reflect, &input),
            Err(RoutingError::Unmatched { .. })
        ));

        counters.insert("search".to_string(), 2);
        let input = RouteInput {
            state: &state,
            loop_counters: &counters,
        };
        assert_eq!(
            table.route(Research::Reflect, &input).unwrap(),
            Transition::to(Research::Write)
        );
    }

    #[test]
    fn test_loop_limit_from_state_field() {
        let spec = LoopSpec::new("search", 3, Research::Write).max_from_field("max_loops");
        assert_eq!(spec.limit(&StateRecord::empty()), 3);

        let state = StateRecord::from_json(json!({"max_loops": 1}));
        assert_eq!(spec.limit(&state), 1);
    }

    #[test]
    fn test_duplicate_loop_name_rejected() {
        let result = complete_builder()
            .bounded_loop(Research::Reflect, LoopSpec::new("l", 1, Research::Write))
            .bounded_loop(Research::Search, LoopSpec::new("l", 1, Research::Write))
            .build();
        assert!(matches!(result, Err(GraphError::InvalidLoop { .. })));
    }
}
