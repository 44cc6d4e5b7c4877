// SPDX-License-Identifier: MIT

//! Typed error handling for the flow engine
//!
//! Every failure a run can hit has its own type here. `EngineError` is what
//! the run-control API returns; the narrower types are produced by steps,
//! routers, the merge engine and the checkpoint store and convert into it.

use std::time::Duration;
use thiserror::Error;

use super::types::RunId;

/// Error returned by a step implementation
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for StepError {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepError {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("invalid step payload: {}", err))
    }
}

/// A router could not classify the state it was given
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RoutingError {
    /// No routing rule matched the state
    #[error("Router after '{after}' has no successor for this state: {detail}")]
    Unmatched { after: String, detail: String },

    /// A fan-out directive carried no branches
    #[error("Fan-out issued after '{after}' has no branches")]
    EmptyFanOut { after: String },

    /// A checkpoint transition named a step not declared as a checkpoint
    #[error("'{0}' is not a registered checkpoint")]
    NotACheckpoint(String),

    /// Routers of a heterogeneous batch disagreed on the successor
    #[error("Routers after batch {batch_id} disagree: {steps:?}")]
    DivergentJoin { batch_id: u64, steps: Vec<String> },
}

impl RoutingError {
    pub fn unmatched(after: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Unmatched {
            after: after.into(),
            detail: detail.into(),
        }
    }
}

/// Errors raised while folding partial updates into a state record
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MergeError {
    /// `order` must carry one entry per update
    #[error("Got {updates} updates but {order} order keys")]
    OrderLength { updates: usize, order: usize },

    /// Steps may not write engine-owned fields
    #[error("Field '{0}' is reserved for the engine")]
    ReservedField(String),

    /// The existing value cannot take the declared reducer
    #[error("Field '{field}' holds {found}, expected {expected}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: String,
    },
}

/// Construction-time defects in a transition table
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GraphError {
    /// Step variant has neither an implementation nor a checkpoint declaration
    #[error("Step '{0}' has no implementation")]
    MissingStep(String),

    /// Step variant has no router for its successor
    #[error("Step '{0}' has no router")]
    MissingRouter(String),

    /// Entry router was never set
    #[error("Transition table has no entry router")]
    MissingEntry,

    /// Step registered both as a checkpoint and as an executable step
    #[error("Step '{0}' is registered both as a checkpoint and as a step")]
    CheckpointConflict(String),

    /// Two loops share a name or a loop names a checkpoint reducer
    #[error("Invalid loop '{name}': {reason}")]
    InvalidLoop { name: String, reason: String },
}

/// Checkpoint persistence errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Checkpoint corrupted: {0}")]
    Corrupted(String),

    /// Another writer already stored this sequence (or a later one)
    #[error("Run {run_id}: checkpoint {sequence} conflicts with stored checkpoint {last}")]
    SequenceConflict {
        run_id: RunId,
        sequence: u64,
        last: u64,
    },

    /// Run id cannot be used as a storage key
    #[error("Invalid run id for storage: {0}")]
    InvalidRunId(String),
}

/// Top-level error returned by the run-control API
#[derive(Debug, Error)]
pub enum EngineError {
    /// A step failed; the run is now FAILED
    #[error("Run {run_id}: step '{step}' failed: {source}")]
    Step {
        run_id: RunId,
        step: String,
        branch: Option<usize>,
        #[source]
        source: StepError,
    },

    /// A router could not classify the state; the run is now FAILED
    #[error("Run {run_id}: {source}")]
    Routing {
        run_id: RunId,
        #[source]
        source: RoutingError,
    },

    /// Resume named a checkpoint that is not active
    #[error("Run {run_id}: stale resume for '{supplied}', active checkpoint is {active:?}")]
    StaleResume {
        run_id: RunId,
        supplied: String,
        active: Option<String>,
    },

    /// A fan-out batch did not join in time; the run is now FAILED
    #[error("Run {run_id}: batch {batch_id} timed out after {timeout:?}, pending branches {pending:?}")]
    JoinTimeout {
        run_id: RunId,
        batch_id: u64,
        timeout: Duration,
        pending: Vec<usize>,
    },

    /// Safety cap on transitions per drive
    #[error("Run {run_id}: exceeded {limit} transitions")]
    TransitionLimit { run_id: RunId, limit: u32 },

    #[error("Run {0} not found")]
    RunNotFound(RunId),

    /// Run exists but is not in a state that allows the call
    #[error("Run {run_id} is {status}")]
    RunNotActive { run_id: RunId, status: String },

    /// A run with this id already exists
    #[error("Run {0} already exists")]
    DuplicateRun(RunId),

    #[error("Run {run_id}: {source}")]
    Merge {
        run_id: RunId,
        #[source]
        source: MergeError,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl EngineError {
    /// Run the error refers to, when there is one
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::Step { run_id, .. }
            | Self::Routing { run_id, .. }
            | Self::StaleResume { run_id, .. }
            | Self::JoinTimeout { run_id, .. }
            | Self::TransitionLimit { run_id, .. }
            | Self::RunNotActive { run_id, .. }
            | Self::Merge { run_id, .. } => Some(run_id),
            Self::RunNotFound(run_id) | Self::DuplicateRun(run_id) => Some(run_id),
            Self::Checkpoint(_) | Self::Graph(_) => None,
        }
    }
}
