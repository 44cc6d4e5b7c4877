// SPDX-License-Identifier: MIT

//! Step interface
//!
//! A step receives the post-merge state snapshot (plus its branch input when
//! it runs inside a fan-out) and the collaborator bundle the engine was built
//! with. The engine never retries a step; any retry a step needs is internal.

use async_trait::async_trait;
use std::marker::PhantomData;

use super::error::StepError;
use super::types::{StepInput, StepName, StepOutput};

/// Core step trait for all step implementations
#[async_trait]
pub trait Step<S: StepName, D>: Send + Sync {
    async fn invoke(&self, input: &StepInput, deps: &D) -> Result<StepOutput<S>, StepError>;
}

/// Adapter turning a synchronous closure into a `Step`
pub struct FnStep<S, D, F> {
    f: F,
    _marker: PhantomData<fn(S, &D)>,
}

impl<S, D, F> FnStep<S, D, F>
where
    S: StepName,
    F: Fn(&StepInput, &D) -> Result<StepOutput<S>, StepError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<S, D, F> Step<S, D> for FnStep<S, D, F>
where
    S: StepName,
    D: Send + Sync,
    F: Fn(&StepInput, &D) -> Result<StepOutput<S>, StepError> + Send + Sync,
{
    async fn invoke(&self, input: &StepInput, deps: &D) -> Result<StepOutput<S>, StepError> {
        (self.f)(input, deps)
    }
}
