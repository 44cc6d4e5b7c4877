// SPDX-License-Identifier: MIT

//! Core type definitions shared by the engine
//!
//! Step identifiers are a closed enum supplied by the workflow author through
//! the `StepName` trait; everything else here is generic over it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use super::state::{PartialUpdate, StateRecord};

/// Reserved field holding the failure detail of a FAILED run
pub const ERROR_FIELD: &str = "_error";
/// Reserved field holding the last accepted checkpoint decision
pub const DECISION_FIELD: &str = "_decision";

/// Fields only the engine may write
pub const RESERVED_FIELDS: [&str; 2] = [ERROR_FIELD, DECISION_FIELD];

pub fn is_reserved(field: &str) -> bool {
    RESERVED_FIELDS.contains(&field)
}

/// Closed set of step identifiers for one workflow
pub trait StepName: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Every variant, in declaration order
    const ALL: &'static [Self];

    /// Stable name used in logs and checkpoints
    fn name(&self) -> &'static str;

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.name() == name)
    }
}

/// Identifier of one run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Mint a fresh random run id
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An addressable unit of pending work
#[derive(Debug, Clone, PartialEq)]
pub struct StepRef<S> {
    pub step: S,
    /// Per-branch input of a fan-out; `None` for plain steps
    pub branch_input: Option<Value>,
}

impl<S: StepName> StepRef<S> {
    pub fn new(step: S) -> Self {
        Self {
            step,
            branch_input: None,
        }
    }

    pub fn with_input(step: S, input: Value) -> Self {
        Self {
            step,
            branch_input: Some(input),
        }
    }
}

/// Successor chosen by a router
#[derive(Debug, Clone, PartialEq)]
pub enum Transition<S> {
    /// Run one step next
    Next(StepRef<S>),
    /// Run every branch in parallel, then join
    FanOut(Vec<StepRef<S>>),
    /// Suspend until a resume call answers this checkpoint
    Checkpoint(S),
    /// The run is complete
    Terminal,
}

impl<S: StepName> Transition<S> {
    /// Shorthand for `Next` without branch input
    pub fn to(step: S) -> Self {
        Self::Next(StepRef::new(step))
    }

    /// Fan `step` out over `inputs`, one branch per element, in order
    pub fn fan_out<I>(step: S, inputs: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Self::FanOut(
            inputs
                .into_iter()
                .map(|input| StepRef::with_input(step, input))
                .collect(),
        )
    }

    /// Short description used in log lines
    pub fn describe(&self) -> String {
        match self {
            Self::Next(r) => r.step.name().to_string(),
            Self::FanOut(refs) => {
                let names: Vec<&str> = refs.iter().map(|r| r.step.name()).collect();
                format!("fan-out[{}]", names.join(", "))
            }
            Self::Checkpoint(s) => format!("checkpoint({})", s.name()),
            Self::Terminal => "terminal".to_string(),
        }
    }
}

/// What a step hands back to the executor
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput<S> {
    Update(PartialUpdate),
    FanOut(Vec<StepRef<S>>),
}

impl<S> From<PartialUpdate> for StepOutput<S> {
    fn from(update: PartialUpdate) -> Self {
        Self::Update(update)
    }
}

/// Position of a step invocation inside a fan-out batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    pub batch_id: u64,
    pub index: usize,
}

/// Everything a step may observe
#[derive(Debug, Clone)]
pub struct StepInput {
    pub run_id: RunId,
    /// Post-merge snapshot; never contains in-flight branch output
    pub state: Arc<StateRecord>,
    /// Input attached to the `StepRef`, if any
    pub branch_input: Option<Value>,
    pub branch: Option<Branch>,
    pub loop_counters: BTreeMap<String, u32>,
}

impl StepInput {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.state.get(field)
    }

    pub fn branch_input(&self) -> Option<&Value> {
        self.branch_input.as_ref()
    }

    pub fn loop_count(&self, name: &str) -> u32 {
        self.loop_counters.get(name).copied().unwrap_or(0)
    }
}

/// Everything a router may observe
#[derive(Debug, Clone, Copy)]
pub struct RouteInput<'a> {
    pub state: &'a StateRecord,
    pub loop_counters: &'a BTreeMap<String, u32>,
}

impl<'a> RouteInput<'a> {
    pub fn get(&self, field: &str) -> Option<&'a Value> {
        self.state.get(field)
    }

    /// Truthiness of a field: missing, null, false, 0, "" and [] are false
    pub fn flag(&self, field: &str) -> bool {
        self.state.flag(field)
    }

    pub fn loop_count(&self, name: &str) -> u32 {
        self.loop_counters.get(name).copied().unwrap_or(0)
    }

    /// Last decision recorded by the controller
    pub fn decision(&self) -> Option<RecordedDecision> {
        self.state
            .get(DECISION_FIELD)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Action taken at a human checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    /// Continue as-is
    #[serde(alias = "approve")]
    Proceed,
    /// Continue after applying the supplied edits
    Edit,
    /// Loop back for a revision
    Reject,
}

/// Structured payload of a resume call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edits: Option<PartialUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl Decision {
    pub fn proceed() -> Self {
        Self {
            action: DecisionAction::Proceed,
            edits: None,
            feedback: None,
        }
    }

    pub fn edit(edits: PartialUpdate) -> Self {
        Self {
            action: DecisionAction::Edit,
            edits: Some(edits),
            feedback: None,
        }
    }

    pub fn reject(feedback: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Reject,
            edits: None,
            feedback: Some(feedback.into()),
        }
    }
}

/// Decision as stored under `_decision`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedDecision {
    pub checkpoint: String,
    pub action: DecisionAction,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Demo {
        Search,
        Review,
    }

    impl StepName for Demo {
        const ALL: &'static [Self] = &[Demo::Search, Demo::Review];

        fn name(&self) -> &'static str {
            match self {
                Demo::Search => "search",
                Demo::Review => "review",
            }
        }
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Demo::from_name("review"), Some(Demo::Review));
        assert_eq!(Demo::from_name("publish"), None);
    }

    #[test]
    fn test_fan_out_preserves_input_order() {
        let t = Transition::fan_out(Demo::Search, vec![json!("a"), json!("b")]);
        match t {
            Transition::FanOut(refs) => {
                assert_eq!(refs.len(), 2);
                assert_eq!(refs[0].branch_input, Some(json!("a")));
                assert_eq!(refs[1].branch_input, Some(json!("b")));
            }
            other => panic!("Expected FanOut, got {:?}", other),
        }
    }

    #[test]
    fn test_decision_accepts_approve_alias() {
        let d: Decision = serde_json::from_value(json!({"action": "approve"})).unwrap();
        assert_eq!(d.action, DecisionAction::Proceed);

        let d: Decision = serde_json::from_value(json!({"action": "proceed"})).unwrap();
        assert_eq!(d, Decision::proceed());
    }

    #[test]
    fn test_reserved_fields() {
        assert!(is_reserved("_error"));
        assert!(is_reserved("_decision"));
        assert!(!is_reserved("sources"));
    }

    #[test]
    fn test_describe() {
        assert_eq!(Transition::to(Demo::Review).describe(), "review");
        assert_eq!(Transition::<Demo>::Terminal.describe(), "terminal");
        assert_eq!(
            Transition::Checkpoint(Demo::Review).describe(),
            "checkpoint(review)"
        );
    }
}
