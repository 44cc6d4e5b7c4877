// SPDX-License-Identifier: MIT

//! Durable workflow engine: state, merge, registry, executor and controller

pub mod checkpoint;
pub mod controller;
pub mod error;
pub mod executor;
pub mod merge;
pub mod registry;
pub mod run;
pub mod state;
pub mod step;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use controller::Engine;
pub use error::{CheckpointError, EngineError, GraphError, MergeError, RoutingError, StepError};
pub use executor::EngineConfig;
pub use registry::{LoopSpec, StepTable, StepTableBuilder};
pub use run::{RunReport, RunStatus};
pub use state::{PartialUpdate, ReducerType, StateRecord, StateSchema};
pub use step::{FnStep, Step};
pub use types::{
    Decision, DecisionAction, RouteInput, RunId, StepInput, StepName, StepOutput, StepRef,
    Transition,
};
