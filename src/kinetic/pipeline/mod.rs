// SPDX-License-Identifier: MIT

//! Content pipeline topology
//!
//! Trend discovery, tweet search and opinion analysis feed a bounded deep
//! research loop, whose report drives drafting, review, image generation and
//! publishing. Three human checkpoints sit on the way; autonomous runs skip
//! all of them.

pub mod collaborators;
pub mod nodes;
pub mod routing;

pub use collaborators::{
    Collaborators, ContentDraft, OpinionAnalysis, Reflection, ResearchReport, ResearchResult,
};

use serde::{Deserialize, Serialize};

use crate::flow::error::GraphError;
use crate::flow::registry::{LoopSpec, StepTable};
use crate::flow::state::StateSchema;
use crate::flow::types::StepName;

/// State field names shared by steps and routers
pub mod fields {
    pub const HAS_USER_PROVIDED_TOPIC: &str = "has_user_provided_topic";
    pub const USER_PROVIDED_TOPIC: &str = "user_provided_topic";
    pub const IS_AUTONOMOUS_MODE: &str = "is_autonomous_mode";
    pub const TRENDING_TOPICS: &str = "trending_topics";
    pub const SELECTED_TOPIC: &str = "selected_topic";
    pub const TWEET_SEARCH_RESULTS: &str = "tweet_search_results";
    pub const OPINION_SUMMARY: &str = "opinion_summary";
    pub const OVERALL_SENTIMENT: &str = "overall_sentiment";
    pub const TOPIC_FROM_OPINION_ANALYSIS: &str = "topic_from_opinion_analysis";
    pub const INITIAL_SEARCH_QUERY_COUNT: &str = "initial_search_query_count";
    pub const QUERY_LIST: &str = "query_list";
    pub const SEARCH_QUERY: &str = "search_query";
    pub const WEB_RESEARCH_RESULT: &str = "web_research_result";
    pub const SOURCES_GATHERED: &str = "sources_gathered";
    pub const IS_SUFFICIENT: &str = "is_sufficient";
    pub const KNOWLEDGE_GAP: &str = "knowledge_gap";
    pub const FOLLOW_UP_QUERIES: &str = "follow_up_queries";
    pub const RESEARCH_LOOP_COUNT: &str = "research_loop_count";
    pub const NUMBER_OF_RAN_QUERIES: &str = "number_of_ran_queries";
    pub const MAX_RESEARCH_LOOPS: &str = "max_research_loops";
    pub const FINAL_DEEP_RESEARCH_REPORT: &str = "final_deep_research_report";
    pub const REPORT_SOURCES: &str = "report_sources";
    pub const CONTENT_DRAFT: &str = "content_draft";
    pub const IMAGE_PROMPTS: &str = "image_prompts";
    pub const FINAL_CONTENT: &str = "final_content";
    pub const FINAL_IMAGE_PROMPTS: &str = "final_image_prompts";
    pub const GENERATED_IMAGES: &str = "generated_images";
    pub const PUBLICATION_ID: &str = "publication_id";
}

/// Name of the research loop in `loop_counters`
pub const RESEARCH_LOOP: &str = "research";

/// Every step of the content pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStep {
    TrendHarvester,
    AutoSelectTopic,
    AwaitTopicSelection,
    TweetSearcher,
    OpinionAnalyzer,
    QueryGenerator,
    WebResearch,
    Reflection,
    FinalizeAnswer,
    Writer,
    QualityAssurer,
    AwaitContentValidation,
    ImageGenerator,
    AwaitImageValidation,
    Publicator,
}

impl StepName for ContentStep {
    const ALL: &'static [Self] = &[
        ContentStep::TrendHarvester,
        ContentStep::AutoSelectTopic,
        ContentStep::AwaitTopicSelection,
        ContentStep::TweetSearcher,
        ContentStep::OpinionAnalyzer,
        ContentStep::QueryGenerator,
        ContentStep::WebResearch,
        ContentStep::Reflection,
        ContentStep::FinalizeAnswer,
        ContentStep::Writer,
        ContentStep::QualityAssurer,
        ContentStep::AwaitContentValidation,
        ContentStep::ImageGenerator,
        ContentStep::AwaitImageValidation,
        ContentStep::Publicator,
    ];

    fn name(&self) -> &'static str {
        match self {
            ContentStep::TrendHarvester => "trend_harvester",
            ContentStep::AutoSelectTopic => "auto_select_topic",
            ContentStep::AwaitTopicSelection => "await_topic_selection",
            ContentStep::TweetSearcher => "tweet_searcher",
            ContentStep::OpinionAnalyzer => "opinion_analyzer",
            ContentStep::QueryGenerator => "query_generator",
            ContentStep::WebResearch => "web_research",
            ContentStep::Reflection => "reflection",
            ContentStep::FinalizeAnswer => "finalize_answer",
            ContentStep::Writer => "writer",
            ContentStep::QualityAssurer => "quality_assurer",
            ContentStep::AwaitContentValidation => "await_content_validation",
            ContentStep::ImageGenerator => "image_generator",
            ContentStep::AwaitImageValidation => "await_image_validation",
            ContentStep::Publicator => "publicator",
        }
    }
}

/// Pipeline knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Research loop bound when the run does not set `max_research_loops`
    pub max_research_loops: u32,
    /// Initial queries when the run does not set `initial_search_query_count`
    pub initial_queries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_research_loops: 2,
            initial_queries: 3,
        }
    }
}

/// Merge policies of the pipeline state
pub fn pipeline_schema() -> StateSchema {
    StateSchema::new()
        .append(fields::TRENDING_TOPICS)
        .append(fields::SEARCH_QUERY)
        .append(fields::WEB_RESEARCH_RESULT)
        .append(fields::SOURCES_GATHERED)
        .with_default(fields::HAS_USER_PROVIDED_TOPIC, false.into())
        .with_default(fields::IS_AUTONOMOUS_MODE, false.into())
}

/// Build the transition table of the content pipeline
///
/// `extra` declares additional state fields; it cannot change the policies of
/// the pipeline's own fields.
pub fn build_pipeline<C>(
    config: &PipelineConfig,
    extra: StateSchema,
) -> Result<StepTable<ContentStep, C>, GraphError>
where
    C: Collaborators + 'static,
{
    StepTable::builder()
        .schema(pipeline_schema().extend(extra))
        .entry(routing::initial)
        .step(ContentStep::TrendHarvester, nodes::TrendHarvesterStep)
        .step(ContentStep::AutoSelectTopic, nodes::AutoSelectTopicStep)
        .step(ContentStep::TweetSearcher, nodes::TweetSearcherStep)
        .step(ContentStep::OpinionAnalyzer, nodes::OpinionAnalyzerStep)
        .step(
            ContentStep::QueryGenerator,
            nodes::QueryGeneratorStep::new(config.initial_queries),
        )
        .step(ContentStep::WebResearch, nodes::WebResearchStep)
        .step(ContentStep::Reflection, nodes::ReflectionStep)
        .step(ContentStep::FinalizeAnswer, nodes::FinalizeAnswerStep)
        .step(ContentStep::Writer, nodes::WriterStep)
        .step(ContentStep::QualityAssurer, nodes::QualityAssurerStep)
        .step(ContentStep::ImageGenerator, nodes::ImageGeneratorStep)
        .step(ContentStep::Publicator, nodes::PublicatorStep)
        .checkpoint(ContentStep::AwaitTopicSelection)
        .checkpoint(ContentStep::AwaitContentValidation)
        .checkpoint(ContentStep::AwaitImageValidation)
        .route(ContentStep::TrendHarvester, routing::after_trend_harvester)
        .edge(ContentStep::AutoSelectTopic, ContentStep::TweetSearcher)
        .route(
            ContentStep::AwaitTopicSelection,
            routing::after_topic_selection,
        )
        .edge(ContentStep::TweetSearcher, ContentStep::OpinionAnalyzer)
        .edge(ContentStep::OpinionAnalyzer, ContentStep::QueryGenerator)
        .route(
            ContentStep::QueryGenerator,
            routing::continue_to_web_research,
        )
        .edge(ContentStep::WebResearch, ContentStep::Reflection)
        .route(ContentStep::Reflection, routing::evaluate_research)
        .bounded_loop(
            ContentStep::Reflection,
            LoopSpec::new(
                RESEARCH_LOOP,
                config.max_research_loops,
                ContentStep::FinalizeAnswer,
            )
            .max_from_field(fields::MAX_RESEARCH_LOOPS),
        )
        .edge(ContentStep::FinalizeAnswer, ContentStep::Writer)
        .edge(ContentStep::Writer, ContentStep::QualityAssurer)
        .route(
            ContentStep::QualityAssurer,
            routing::after_quality_assurance,
        )
        .route(
            ContentStep::AwaitContentValidation,
            routing::after_content_validation,
        )
        .route(ContentStep::ImageGenerator, routing::after_image_generation)
        .route(
            ContentStep::AwaitImageValidation,
            routing::after_image_validation,
        )
        .finish(ContentStep::Publicator)
        .build()
}
