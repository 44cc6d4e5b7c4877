// SPDX-License-Identifier: MIT

//! State management for workflow runs
//!
//! This module provides:
//! - `StateSchema` - per-field merge policy table
//! - `StateRecord` - runtime key/value record of a run
//! - `PartialUpdate` - the values one step invocation contributes

mod record;
mod schema;

pub use record::{PartialUpdate, StateRecord};
pub use schema::{FieldType, ReducerType, StateFieldDef, StateSchema};
