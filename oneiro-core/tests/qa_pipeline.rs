//! QA tests for the interpretation pipeline against scripted mocks.
//!
//! These tests verify the end-to-end behavior of the service:
//! - Deterministic runs given canned generation output
//! - Tolerant parsing of fenced, quoted, and repaired JSON
//! - Retry, failure, and timeout handling
//! - A full multi-stage persona scenario with fragment citations
//!
//! Run with: `cargo test -p oneiro-core --test qa_pipeline`

use oneiro_core::generation::GenerationError;
use oneiro_core::testing::{
    assert_cited, assert_complete, assert_stage_status, sample_fragment, MockSimilarity,
    PipelineHarness,
};
use oneiro_core::{
    DreamContext, InterpretError, InterpretationResult, OwnerId, ServiceConfig, StageStatus,
};
use serde_json::json;
use std::time::Duration;

fn stage_outline(result: &InterpretationResult) -> Vec<(String, StageStatus)> {
    result
        .stages
        .iter()
        .map(|s| (s.stage.clone(), s.status))
        .collect()
}

// =============================================================================
// BASIC PROPERTIES
// =============================================================================

#[tokio::test]
async fn test_themes_below_floor_yield_empty_knowledge_not_an_error() {
    let harness = PipelineHarness::new();
    harness.expect_reply(r#"{"summary": "A quiet dream, plainly told.", "sources": []}"#);

    let context = DreamContext::new(OwnerId::new(), "I wandered an empty house")
        .with_theme("houses", 0.1)
        .with_theme("dust", 0.2);
    let result = harness
        .interpret_as(context, "mirror")
        .await
        .expect("a run without knowledge context must still complete");

    assert_complete(&result);
    assert!(result.fragments_retrieved.is_empty());
    assert!(result.fragments_used.is_empty());

    // The prompt says so explicitly instead of leaving a dangling header.
    let requests = harness.generator.requests();
    assert!(requests[0].prompt.contains("(no reference material retrieved)"));
}

#[tokio::test]
async fn test_canned_replies_make_runs_structurally_identical() {
    let harness = PipelineHarness::new();
    let reply = r#"{"summary": "The flight is the feeling of release.", "sources": []}"#;
    harness.expect_reply(reply);
    harness.expect_reply(reply);

    let context = DreamContext::new(OwnerId::new(), "I was flying over a vast ocean")
        .with_theme("flying", 0.8);
    let first = harness.interpret_as(context.clone(), "mirror").await.unwrap();
    let second = harness.interpret_as(context, "mirror").await.unwrap();

    assert_eq!(first.payload, second.payload);
    assert_eq!(stage_outline(&first), stage_outline(&second));
    assert_eq!(first.dream_id, second.dream_id);
    // Result identity is still per-run.
    assert_ne!(first.result_id, second.result_id);
}

// =============================================================================
// PARSE TOLERANCE
// =============================================================================

#[tokio::test]
async fn test_fenced_json_with_prose_is_extracted() {
    let harness = PipelineHarness::new();
    harness.expect_reply(
        "Here is the result:\n```json\n{\"summary\": \"A dream of {nested} doors.\", \
         \"sources\": []}\n```\nThanks",
    );

    let result = harness.interpret("I opened door after door").await.unwrap();

    assert_complete(&result);
    assert_eq!(result.payload["summary"], "A dream of {nested} doors.");
}

#[tokio::test]
async fn test_single_quoted_json_with_trailing_comma_is_repaired() {
    let harness = PipelineHarness::new();
    harness.expect_reply("{'summary': 'The stairs kept their own counsel.', 'sources': [],}");

    let result = harness.interpret("I climbed stairs that never ended").await.unwrap();

    assert_complete(&result);
    assert_eq!(result.payload["summary"], "The stairs kept their own counsel.");
}

#[tokio::test]
async fn test_unparseable_output_degrades_instead_of_failing() {
    let harness = PipelineHarness::new();
    harness.expect_reply("I would rather describe this dream in my own words.");

    let result = harness.interpret("I lost my voice in a crowd").await.unwrap();

    assert_eq!(result.status, oneiro_core::RunStatus::Degraded);
    assert_stage_status(&result, "reading", StageStatus::ParseDegraded);
    // The payload still has the declared shape, with raw text standing in.
    assert_eq!(
        result.payload["summary"],
        "I would rather describe this dream in my own words."
    );
    assert_eq!(result.payload["sources"], json!([]));
}

// =============================================================================
// RETRY, FAILURE, AND TIMEOUT
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_two_transient_failures_then_success() {
    let harness = PipelineHarness::new();
    harness.expect_failure(GenerationError::Upstream("overloaded".into()));
    harness.expect_failure(GenerationError::Timeout(Duration::from_secs(30)));
    harness.expect_reply(r#"{"summary": "Third time lucky.", "sources": []}"#);

    let result = harness.interpret("I kept missing the same train").await.unwrap();

    assert_stage_status(&result, "reading", StageStatus::Succeeded);
    assert_eq!(result.stages[0].attempts, 3);
    assert_eq!(harness.generator.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_the_run() {
    let harness = PipelineHarness::new();
    for _ in 0..3 {
        harness.expect_failure(GenerationError::Upstream("down".into()));
    }

    let err = harness
        .interpret("I kept missing the same train")
        .await
        .unwrap_err();

    match err {
        InterpretError::PipelineFailed {
            stage, attempts, ..
        } => {
            assert_eq!(stage, "reading");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected PipelineFailed, got {other}"),
    }
    assert_eq!(harness.generator.call_count(), 3);
    // Nothing is persisted for a failed run.
    assert_eq!(harness.saved_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_generation_hits_the_run_ceiling() {
    let ceiling = Duration::from_secs(3);
    let harness = PipelineHarness::with_parts(
        MockSimilarity::new(),
        ServiceConfig::default().with_run_ceiling(ceiling),
    );
    harness.generator.queue_hang();

    let started = tokio::time::Instant::now();
    let err = harness
        .interpret("I waited for a door that never opened")
        .await
        .unwrap_err();

    match err {
        InterpretError::Timeout { budget, stage } => {
            assert_eq!(budget, ceiling);
            assert_eq!(stage, "reading");
        }
        other => panic!("expected Timeout, got {other}"),
    }
    // The run stopped at the ceiling, not at the stage timeout.
    assert!(started.elapsed() <= ceiling + Duration::from_secs(1));
}

// =============================================================================
// FULL PERSONA SCENARIO
// =============================================================================

#[tokio::test]
async fn test_jung_reads_a_flying_ocean_dream() {
    let flying = sample_fragment(
        "flying",
        "Flight in dreams often carries the wish to rise above a situation.",
    );
    let ocean = sample_fragment("ocean", "The sea is an old image of the unconscious itself.");
    let flying_id = flying.id;
    let ocean_id = ocean.id;
    let similarity = MockSimilarity::new()
        .with_fragments("flying", vec![(flying, 0.9)])
        .with_fragments("ocean", vec![(ocean, 0.85)]);
    let harness = PipelineHarness::with_similarity(similarity);

    harness.expect_reply(
        json!({
            "symbols": [
                {
                    "symbol": "flying",
                    "meaning": "rising above what weighs on you",
                    "archetype": "the spirit"
                },
                {
                    "symbol": "the ocean",
                    "meaning": "the unconscious in its vastness",
                    "archetype": "the great mother"
                }
            ]
        })
        .to_string(),
    );
    harness.expect_reply(
        "The dream answers a waking attitude that has grown too narrow: it \
         lifts you above what you have been circling and shows the water \
         that carries you either way.",
    );
    harness.expect_reply(
        json!({
            "summary": "You are carried above the unconscious, not swallowed by it.",
            "symbols": [
                {
                    "symbol": "flying",
                    "meaning": "rising above what weighs on you",
                    "archetype": "the spirit"
                },
                {
                    "symbol": "the ocean",
                    "meaning": "the unconscious in its vastness"
                }
            ],
            "emotional_tone": {
                "primary": "exhilaration",
                "valence": 0.7,
                "intensity": 0.8
            },
            "reflection": "What in waking life asks to be seen from higher ground?",
            "sources": [flying_id.to_string(), ocean_id.to_string()]
        })
        .to_string(),
    );

    let context = DreamContext::new(OwnerId::new(), "I was flying over a vast ocean")
        .with_theme("flying", 0.8)
        .with_theme("ocean", 0.6);
    let result = harness.interpret_as(context, "jung").await.unwrap();

    assert_complete(&result);
    assert_eq!(result.persona, "jung");
    assert_stage_status(&result, "symbols", StageStatus::Succeeded);
    assert_stage_status(&result, "dynamics", StageStatus::Succeeded);
    assert_stage_status(&result, "synthesis", StageStatus::Succeeded);

    // The final symbol list carries both themes' imagery.
    let symbols = result.payload["symbols"].as_array().unwrap();
    let names: Vec<&str> = symbols.iter().filter_map(|s| s["symbol"].as_str()).collect();
    assert!(names.iter().any(|n| n.contains("flying")));
    assert!(names.iter().any(|n| n.contains("ocean")));

    // Retrieval ranked the heavier theme first; the synthesis cited both.
    assert_eq!(result.fragments_retrieved, vec![flying_id, ocean_id]);
    assert_cited(&result, flying_id);
    assert_cited(&result, ocean_id);
    assert!(result.fragments_used.len() <= 6);

    // Three stages, one call each, with usage accounted per call.
    assert_eq!(harness.generator.call_count(), 3);
    assert_eq!(result.usage.input_tokens, 30);
    assert_eq!(result.usage.output_tokens, 15);

    // The run was persisted once, with the same payload.
    assert_eq!(harness.saved_count(), 1);
    let saved = harness.store.last().unwrap();
    assert_eq!(saved.payload, result.payload);
}
