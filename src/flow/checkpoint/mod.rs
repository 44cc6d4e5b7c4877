// SPDX-License-Identifier: MIT

//! Checkpoint snapshot format and persistence

mod store;

pub use store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::run::RunStatus;
use super::state::StateRecord;
use super::types::RunId;

/// Immutable snapshot of a run
///
/// Written before every suspension and when a run reaches a final status, so
/// the per-run history doubles as an archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,
    /// 1-based, strictly increasing per run
    pub sequence: u64,
    pub status: RunStatus,
    pub state_record: StateRecord,
    pub active_checkpoint: Option<String>,
    #[serde(default)]
    pub loop_counters: BTreeMap<String, u32>,
    #[serde(default)]
    pub batch_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
