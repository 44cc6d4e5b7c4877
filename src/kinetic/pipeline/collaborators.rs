// SPDX-License-Identifier: MIT

//! External collaborators of the content pipeline
//!
//! Everything that talks to a model, a search backend, an image service or a
//! social network lives behind this trait. The pipeline steps only move data
//! between the run state and these calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::error::StepError;
use crate::flow::state::StateRecord;

/// Result of analysing the tweets found for a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpinionAnalysis {
    pub opinion_summary: String,
    pub overall_sentiment: String,
    pub topic_from_opinion_analysis: String,
}

/// Output of one web research branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchResult {
    pub summary: String,
    #[serde(default)]
    pub sources: Vec<Value>,
}

/// Verdict of the research reflection step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub is_sufficient: bool,
    #[serde(default)]
    pub knowledge_gap: String,
    #[serde(default)]
    pub follow_up_queries: Vec<String>,
}

/// Final research report with the sources it cites
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchReport {
    pub report: String,
    #[serde(default)]
    pub sources: Vec<Value>,
}

/// Post text plus the prompts for its illustrations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentDraft {
    pub content: String,
    #[serde(default)]
    pub image_prompts: Vec<String>,
}

/// Injected bundle of external calls
#[async_trait]
pub trait Collaborators: Send + Sync {
    /// Fetch the currently trending topics
    async fn harvest_trends(&self, state: &StateRecord) -> Result<Vec<Value>, StepError>;

    async fn search_tweets(&self, topic: &str) -> Result<Vec<Value>, StepError>;

    async fn analyze_opinions(
        &self,
        topic: &str,
        tweets: &[Value],
    ) -> Result<OpinionAnalysis, StepError>;

    /// Produce up to `count` initial search queries
    async fn generate_queries(&self, topic: &str, count: u32) -> Result<Vec<String>, StepError>;

    async fn web_research(&self, query: &str, id: u64) -> Result<ResearchResult, StepError>;

    async fn reflect(
        &self,
        topic: &str,
        summaries: &[String],
        loop_count: u32,
    ) -> Result<Reflection, StepError>;

    async fn finalize_report(
        &self,
        topic: &str,
        summaries: &[String],
        sources: &[Value],
    ) -> Result<ResearchReport, StepError>;

    /// Draft the post; `feedback` is set when a reviewer rejected the last draft
    async fn write_content(
        &self,
        state: &StateRecord,
        feedback: Option<&str>,
    ) -> Result<ContentDraft, StepError>;

    async fn review_content(
        &self,
        draft: &ContentDraft,
        state: &StateRecord,
    ) -> Result<ContentDraft, StepError>;

    async fn generate_images(
        &self,
        prompts: &[String],
        feedback: Option<&str>,
    ) -> Result<Vec<Value>, StepError>;

    /// Publish and return the publication id
    async fn publish(&self, content: &str, images: &[Value]) -> Result<String, StepError>;
}
