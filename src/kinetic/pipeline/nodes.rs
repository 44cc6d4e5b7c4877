// SPDX-License-Identifier: MIT

//! Step implementations of the content pipeline
//!
//! Each step reads what it needs from the post-merge state, calls one
//! collaborator and returns the fields it produced.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::collaborators::{Collaborators, ContentDraft};
use super::{fields, ContentStep, RESEARCH_LOOP};
use crate::flow::error::StepError;
use crate::flow::state::{PartialUpdate, StateRecord};
use crate::flow::step::Step;
use crate::flow::types::{
    DecisionAction, RecordedDecision, StepInput, StepName, StepOutput, DECISION_FIELD,
};

type Output = Result<StepOutput<ContentStep>, StepError>;

/// Topic name from either a plain string or a trend object
fn topic_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map.get("name").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Topic chosen by the caller or the topic selection step
fn chosen_topic(state: &StateRecord) -> Option<String> {
    [fields::USER_PROVIDED_TOPIC, fields::SELECTED_TOPIC]
        .iter()
        .filter_map(|f| state.get(f))
        .find_map(topic_name)
}

/// Topic the research loop works on
fn research_topic(state: &StateRecord) -> Result<String, StepError> {
    state
        .get(fields::TOPIC_FROM_OPINION_ANALYSIS)
        .and_then(topic_name)
        .or_else(|| chosen_topic(state))
        .ok_or_else(|| StepError::new("no research topic in state"))
}

fn strings(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn values(value: Option<&Value>) -> Vec<Value> {
    value.and_then(Value::as_array).cloned().unwrap_or_default()
}

/// Reviewer feedback when the last decision rejected `checkpoint`
fn rejection_feedback(state: &StateRecord, checkpoint: ContentStep) -> Option<String> {
    let decision: RecordedDecision = state
        .get(DECISION_FIELD)
        .and_then(|v| serde_json::from_value(v.clone()).ok())?;
    if decision.action == DecisionAction::Reject && decision.checkpoint == checkpoint.name() {
        Some(decision.feedback.unwrap_or_default())
    } else {
        None
    }
}

pub struct TrendHarvesterStep;

#[async_trait]
impl<C: Collaborators> Step<ContentStep, C> for TrendHarvesterStep {
    async fn invoke(&self, input: &StepInput, deps: &C) -> Output {
        let trends = deps.harvest_trends(&input.state).await?;
        log::info!(
            "Run {}: harvested {} trending topics",
            input.run_id,
            trends.len()
        );
        Ok(PartialUpdate::new()
            .set(fields::TRENDING_TOPICS, Value::Array(trends))
            .into())
    }
}

/// Picks the top trend in autonomous mode
pub struct AutoSelectTopicStep;

#[async_trait]
impl<C: Collaborators> Step<ContentStep, C> for AutoSelectTopicStep {
    async fn invoke(&self, input: &StepInput, _deps: &C) -> Output {
        let top = input
            .get(fields::TRENDING_TOPICS)
            .and_then(Value::as_array)
            .and_then(|trends| trends.first())
            .cloned();
        match top {
            Some(topic) => {
                log::info!("Run {}: auto-selected topic {}", input.run_id, topic);
                Ok(PartialUpdate::new()
                    .set(fields::SELECTED_TOPIC, topic)
                    .into())
            }
            None => {
                log::warn!("Run {}: no trending topic to select", input.run_id);
                Ok(PartialUpdate::new().into())
            }
        }
    }
}

pub struct TweetSearcherStep;

#[async_trait]
impl<C: Collaborators> Step<ContentStep, C> for TweetSearcherStep {
    async fn invoke(&self, input: &StepInput, deps: &C) -> Output {
        let topic = chosen_topic(&input.state)
            .ok_or_else(|| StepError::new("no topic selected for tweet search"))?;
        let tweets = deps.search_tweets(&topic).await?;
        log::info!(
            "Run {}: found {} tweets about '{}'",
            input.run_id,
            tweets.len(),
            topic
        );
        Ok(PartialUpdate::new()
            .set(fields::TWEET_SEARCH_RESULTS, Value::Array(tweets))
            .into())
    }
}

pub struct OpinionAnalyzerStep;

#[async_trait]
impl<C: Collaborators> Step<ContentStep, C> for OpinionAnalyzerStep {
    async fn invoke(&self, input: &StepInput, deps: &C) -> Output {
        let topic = chosen_topic(&input.state)
            .ok_or_else(|| StepError::new("no topic selected for opinion analysis"))?;
        let tweets = values(input.get(fields::TWEET_SEARCH_RESULTS));
        let analysis = deps.analyze_opinions(&topic, &tweets).await?;
        Ok(PartialUpdate::new()
            .set(fields::OPINION_SUMMARY, json!(analysis.opinion_summary))
            .set(fields::OVERALL_SENTIMENT, json!(analysis.overall_sentiment))
            .set(
                fields::TOPIC_FROM_OPINION_ANALYSIS,
                json!(analysis.topic_from_opinion_analysis),
            )
            .into())
    }
}

/// Generates the initial research queries
pub struct QueryGeneratorStep {
    default_count: u32,
}

impl QueryGeneratorStep {
    pub fn new(default_count: u32) -> Self {
        Self { default_count }
    }
}

#[async_trait]
impl<C: Collaborators> Step<ContentStep, C> for QueryGeneratorStep {
    async fn invoke(&self, input: &StepInput, deps: &C) -> Output {
        let topic = research_topic(&input.state)?;
        let count = input
            .get(fields::INITIAL_SEARCH_QUERY_COUNT)
            .and_then(Value::as_u64)
            .filter(|n| *n > 0)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(self.default_count);

        let queries = deps.generate_queries(&topic, count).await?;
        log::info!(
            "Run {}: generated {} research queries for '{}'",
            input.run_id,
            queries.len(),
            topic
        );
        Ok(PartialUpdate::new()
            .set(fields::QUERY_LIST, json!(queries))
            .set(fields::INITIAL_SEARCH_QUERY_COUNT, json!(count))
            .into())
    }
}

/// One branch of the research fan-out
pub struct WebResearchStep;

#[async_trait]
impl<C: Collaborators> Step<ContentStep, C> for WebResearchStep {
    async fn invoke(&self, input: &StepInput, deps: &C) -> Output {
        let branch = input
            .branch_input()
            .ok_or_else(|| StepError::new("web research runs only as a fan-out branch"))?;
        let query = branch
            .get("search_query")
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::new("branch input has no search_query"))?;
        let id = branch.get("id").and_then(Value::as_u64).unwrap_or(0);

        let result = deps.web_research(query, id).await?;
        log::debug!(
            "Run {}: research query {} returned {} sources",
            input.run_id,
            id,
            result.sources.len()
        );
        Ok(PartialUpdate::new()
            .set(fields::SOURCES_GATHERED, Value::Array(result.sources))
            .set(fields::SEARCH_QUERY, json!([query]))
            .set(fields::WEB_RESEARCH_RESULT, json!([result.summary]))
            .into())
    }
}

/// Reducer of the research loop
pub struct ReflectionStep;

#[async_trait]
impl<C: Collaborators> Step<ContentStep, C> for ReflectionStep {
    async fn invoke(&self, input: &StepInput, deps: &C) -> Output {
        let topic = research_topic(&input.state)?;
        let summaries = strings(input.get(fields::WEB_RESEARCH_RESULT));
        let ran_queries = input
            .get(fields::SEARCH_QUERY)
            .and_then(Value::as_array)
            .map(|q| q.len())
            .unwrap_or(0);
        let loop_count = input.loop_count(RESEARCH_LOOP);

        let reflection = deps.reflect(&topic, &summaries, loop_count).await?;
        log::info!(
            "Run {}: reflection {} sufficient={} follow-ups={}",
            input.run_id,
            loop_count,
            reflection.is_sufficient,
            reflection.follow_up_queries.len()
        );
        Ok(PartialUpdate::new()
            .set(fields::IS_SUFFICIENT, json!(reflection.is_sufficient))
            .set(fields::KNOWLEDGE_GAP, json!(reflection.knowledge_gap))
            .set(
                fields::FOLLOW_UP_QUERIES,
                json!(reflection.follow_up_queries),
            )
            .set(fields::RESEARCH_LOOP_COUNT, json!(loop_count))
            .set(fields::NUMBER_OF_RAN_QUERIES, json!(ran_queries))
            .into())
    }
}

pub struct FinalizeAnswerStep;

#[async_trait]
impl<C: Collaborators> Step<ContentStep, C> for FinalizeAnswerStep {
    async fn invoke(&self, input: &StepInput, deps: &C) -> Output {
        let topic = research_topic(&input.state)?;
        let summaries = strings(input.get(fields::WEB_RESEARCH_RESULT));
        let sources = values(input.get(fields::SOURCES_GATHERED));

        let report = deps.finalize_report(&topic, &summaries, &sources).await?;
        log::info!(
            "Run {}: research report ready, citing {} sources",
            input.run_id,
            report.sources.len()
        );
        Ok(PartialUpdate::new()
            .set(fields::FINAL_DEEP_RESEARCH_REPORT, json!(report.report))
            .set(fields::REPORT_SOURCES, Value::Array(report.sources))
            .into())
    }
}

pub struct WriterStep;

#[async_trait]
impl<C: Collaborators> Step<ContentStep, C> for WriterStep {
    async fn invoke(&self, input: &StepInput, deps: &C) -> Output {
        let feedback = rejection_feedback(&input.state, ContentStep::AwaitContentValidation);
        if feedback.is_some() {
            log::info!("Run {}: rewriting after rejected draft", input.run_id);
        }

        let draft = deps
            .write_content(&input.state, feedback.as_deref())
            .await?;
        Ok(PartialUpdate::new()
            .set(fields::CONTENT_DRAFT, json!(draft.content))
            .set(fields::IMAGE_PROMPTS, json!(draft.image_prompts))
            .into())
    }
}

pub struct QualityAssurerStep;

#[async_trait]
impl<C: Collaborators> Step<ContentStep, C> for QualityAssurerStep {
    async fn invoke(&self, input: &StepInput, deps: &C) -> Output {
        let content = input
            .state
            .get_str(fields::CONTENT_DRAFT)
            .ok_or_else(|| StepError::new("no content draft to review"))?;
        let draft = ContentDraft {
            content: content.to_string(),
            image_prompts: strings(input.get(fields::IMAGE_PROMPTS)),
        };

        let reviewed = deps.review_content(&draft, &input.state).await?;
        Ok(PartialUpdate::new()
            .set(fields::FINAL_CONTENT, json!(reviewed.content))
            .set(fields::FINAL_IMAGE_PROMPTS, json!(reviewed.image_prompts))
            .into())
    }
}

pub struct ImageGeneratorStep;

#[async_trait]
impl<C: Collaborators> Step<ContentStep, C> for ImageGeneratorStep {
    async fn invoke(&self, input: &StepInput, deps: &C) -> Output {
        let prompts = strings(input.get(fields::FINAL_IMAGE_PROMPTS));
        if prompts.is_empty() {
            return Ok(PartialUpdate::new()
                .set(fields::GENERATED_IMAGES, json!([]))
                .into());
        }

        let feedback = rejection_feedback(&input.state, ContentStep::AwaitImageValidation);
        let images = deps.generate_images(&prompts, feedback.as_deref()).await?;
        log::info!("Run {}: generated {} images", input.run_id, images.len());
        Ok(PartialUpdate::new()
            .set(fields::GENERATED_IMAGES, Value::Array(images))
            .into())
    }
}

pub struct PublicatorStep;

#[async_trait]
impl<C: Collaborators> Step<ContentStep, C> for PublicatorStep {
    async fn invoke(&self, input: &StepInput, deps: &C) -> Output {
        let content = input
            .state
            .get_str(fields::FINAL_CONTENT)
            .ok_or_else(|| StepError::new("no final content to publish"))?;
        let images = values(input.get(fields::GENERATED_IMAGES));

        let publication_id = deps.publish(content, &images).await?;
        log::info!("Run {}: published as {}", input.run_id, publication_id);
        Ok(PartialUpdate::new()
            .set(fields::PUBLICATION_ID, json!(publication_id))
            .into())
    }
}
