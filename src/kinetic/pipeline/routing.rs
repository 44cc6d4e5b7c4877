// SPDX-License-Identifier: MIT

//! Routers of the content pipeline

use serde_json::{json, Value};

use super::fields;
use super::ContentStep;
use crate::flow::error::RoutingError;
use crate::flow::types::{DecisionAction, RouteInput, StepName, Transition};

type Route = Result<Transition<ContentStep>, RoutingError>;

fn rejected_at(input: &RouteInput<'_>, checkpoint: ContentStep) -> bool {
    input
        .decision()
        .map(|d| d.action == DecisionAction::Reject && d.checkpoint == checkpoint.name())
        .unwrap_or(false)
}

/// Start from tweet search when the caller supplied a topic
pub fn initial(input: &RouteInput<'_>) -> Route {
    if input.flag(fields::HAS_USER_PROVIDED_TOPIC) {
        Ok(Transition::to(ContentStep::TweetSearcher))
    } else {
        Ok(Transition::to(ContentStep::TrendHarvester))
    }
}

pub fn after_trend_harvester(input: &RouteInput<'_>) -> Route {
    if input.flag(fields::IS_AUTONOMOUS_MODE) {
        Ok(Transition::to(ContentStep::AutoSelectTopic))
    } else {
        Ok(Transition::to(ContentStep::AwaitTopicSelection))
    }
}

pub fn after_topic_selection(_input: &RouteInput<'_>) -> Route {
    Ok(Transition::to(ContentStep::TweetSearcher))
}

/// One web research branch per generated query
pub fn continue_to_web_research(input: &RouteInput<'_>) -> Route {
    let queries = input
        .get(fields::QUERY_LIST)
        .and_then(Value::as_array)
        .ok_or_else(|| {
            RoutingError::unmatched(ContentStep::QueryGenerator.name(), "query_list is not set")
        })?;
    Ok(research_branches(queries, 0))
}

/// Finalize once research is sufficient, otherwise chase the follow-ups
pub fn evaluate_research(input: &RouteInput<'_>) -> Route {
    let sufficient = input
        .get(fields::IS_SUFFICIENT)
        .and_then(Value::as_bool)
        .ok_or_else(|| {
            RoutingError::unmatched(ContentStep::Reflection.name(), "is_sufficient is not set")
        })?;
    if sufficient {
        return Ok(Transition::to(ContentStep::FinalizeAnswer));
    }

    let follow_ups = input
        .get(fields::FOLLOW_UP_QUERIES)
        .and_then(Value::as_array)
        .filter(|q| !q.is_empty());
    match follow_ups {
        Some(queries) => {
            let offset = input
                .get(fields::NUMBER_OF_RAN_QUERIES)
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Ok(research_branches(queries, offset))
        }
        None => Ok(Transition::to(ContentStep::FinalizeAnswer)),
    }
}

fn research_branches(queries: &[Value], offset: u64) -> Transition<ContentStep> {
    Transition::fan_out(
        ContentStep::WebResearch,
        queries
            .iter()
            .enumerate()
            .map(|(idx, query)| json!({"search_query": query, "id": offset + idx as u64})),
    )
}

pub fn after_quality_assurance(input: &RouteInput<'_>) -> Route {
    if !input.flag(fields::IS_AUTONOMOUS_MODE) {
        return Ok(Transition::to(ContentStep::AwaitContentValidation));
    }
    Ok(images_or_publish(input))
}

pub fn after_content_validation(input: &RouteInput<'_>) -> Route {
    if rejected_at(input, ContentStep::AwaitContentValidation) {
        return Ok(Transition::to(ContentStep::Writer));
    }
    Ok(images_or_publish(input))
}

fn images_or_publish(input: &RouteInput<'_>) -> Transition<ContentStep> {
    if input.flag(fields::FINAL_IMAGE_PROMPTS) {
        Transition::to(ContentStep::ImageGenerator)
    } else {
        Transition::to(ContentStep::Publicator)
    }
}

pub fn after_image_generation(input: &RouteInput<'_>) -> Route {
    if input.flag(fields::IS_AUTONOMOUS_MODE) || !input.flag(fields::GENERATED_IMAGES) {
        Ok(Transition::to(ContentStep::Publicator))
    } else {
        Ok(Transition::to(ContentStep::AwaitImageValidation))
    }
}

pub fn after_image_validation(input: &RouteInput<'_>) -> Route {
    if rejected_at(input, ContentStep::AwaitImageValidation) {
        Ok(Transition::to(ContentStep::ImageGenerator))
    } else {
        Ok(Transition::to(ContentStep::Publicator))
    }
}
