//! QA tests for knowledge retrieval diversity and degradation.
//!
//! These tests verify the retrieval behavior end to end:
//! - Per-theme and global caps hold against a dense index
//! - Ordering follows combined score, not theme weight alone
//! - Duplicate fragments keep their best-scoring path
//! - A failing theme degrades the context without failing the run
//! - Themes are derived from the dream when the request carries none
//!
//! Run with: `cargo test -p oneiro-core --test qa_retrieval`

use oneiro_core::pipeline::{FragmentRetriever, RetrieverConfig};
use oneiro_core::testing::{sample_fragment, MockSimilarity, PipelineHarness};
use oneiro_core::{DreamContext, OwnerId, RunWarning, ThemeScore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(120)
}

fn retriever(similarity: MockSimilarity) -> FragmentRetriever {
    FragmentRetriever::new(Arc::new(similarity), RetrieverConfig::default())
}

#[tokio::test]
async fn test_dense_index_respects_diversity_caps() {
    // Five themes, ten candidates each, every candidate above the floors.
    let themes = [
        ("water", 0.9f32),
        ("fire", 0.8),
        ("earth", 0.7),
        ("air", 0.6),
        ("aether", 0.5),
    ];
    let mut similarity = MockSimilarity::new();
    for (theme, _) in &themes {
        let hits = (0..10)
            .map(|i| {
                let text = format!("{theme} fragment {i}");
                (sample_fragment(theme, &text), 0.90 - 0.05 * i as f32)
            })
            .collect();
        similarity = similarity.with_fragments(*theme, hits);
    }

    let scored: Vec<ThemeScore> = themes
        .iter()
        .map(|(theme, weight)| ThemeScore::new(*theme, *weight))
        .collect();
    let knowledge = retriever(similarity)
        .retrieve("a dream of the elements", &scored, far_deadline())
        .await;

    assert!(knowledge.warnings.is_empty());
    assert_eq!(knowledge.fragments.len(), 6);

    let mut per_theme: HashMap<&str, usize> = HashMap::new();
    for scored in &knowledge.fragments {
        *per_theme.entry(scored.theme.as_str()).or_insert(0) += 1;
    }
    assert!(per_theme.values().all(|&count| count <= 2));

    // With these weights the heaviest three themes fill the global cap.
    assert_eq!(per_theme.get("water"), Some(&2));
    assert_eq!(per_theme.get("fire"), Some(&2));
    assert_eq!(per_theme.get("earth"), Some(&2));

    let combined: Vec<f32> = knowledge.fragments.iter().map(|s| s.combined()).collect();
    assert!(combined.windows(2).all(|pair| pair[0] >= pair[1]));
}

#[tokio::test]
async fn test_order_follows_combined_score_not_theme_weight() {
    // A weak theme with a near-perfect match outranks a strong theme
    // with a marginal one.
    let similarity = MockSimilarity::new()
        .with_fragments("water", vec![(sample_fragment("water", "marginal"), 0.40)])
        .with_fragments("mirrors", vec![(sample_fragment("mirrors", "exact"), 0.90)]);

    let themes = [ThemeScore::new("water", 0.9), ThemeScore::new("mirrors", 0.5)];
    let knowledge = retriever(similarity)
        .retrieve("a dream", &themes, far_deadline())
        .await;

    assert_eq!(knowledge.fragments.len(), 2);
    assert_eq!(knowledge.fragments[0].fragment.text, "exact");
    assert_eq!(knowledge.fragments[1].fragment.text, "marginal");
}

#[tokio::test]
async fn test_duplicate_fragment_keeps_its_best_path() {
    // The same fragment is indexed under both themes; only the winning
    // combination survives.
    let shared = sample_fragment("flying", "Flight and open water share a horizon.");
    let shared_id = shared.id;
    let similarity = MockSimilarity::new()
        .with_fragments("flying", vec![(shared.clone(), 0.6)])
        .with_fragments("ocean", vec![(shared, 0.9)]);

    let themes = [ThemeScore::new("flying", 0.8), ThemeScore::new("ocean", 0.6)];
    let knowledge = retriever(similarity)
        .retrieve("a dream", &themes, far_deadline())
        .await;

    assert_eq!(knowledge.fragments.len(), 1);
    let kept = &knowledge.fragments[0];
    assert_eq!(kept.fragment.id, shared_id);
    // 0.6 x 0.9 beats 0.8 x 0.6.
    assert_eq!(kept.theme, "ocean");
    assert_eq!(kept.similarity, 0.9);
}

#[tokio::test]
async fn test_failing_theme_degrades_without_losing_the_rest() {
    let similarity = MockSimilarity::new()
        .with_fragments("water", vec![(sample_fragment("water", "the sea"), 0.8)])
        .failing_theme("fire");

    let themes = [ThemeScore::new("water", 0.9), ThemeScore::new("fire", 0.8)];
    let knowledge = retriever(similarity)
        .retrieve("a dream", &themes, far_deadline())
        .await;

    assert_eq!(knowledge.fragments.len(), 1);
    assert_eq!(knowledge.fragments[0].theme, "water");
    assert!(knowledge.warnings.iter().any(|w| matches!(
        w,
        RunWarning::RetrievalDegraded { theme: Some(t), .. } if t == "fire"
    )));
}

#[tokio::test]
async fn test_themes_are_derived_when_the_request_has_none() {
    let fragment = sample_fragment("water", "Deep water often carries what is unexamined.");
    let fragment_id = fragment.id;
    let similarity = MockSimilarity::new()
        .with_themes(vec![("water", 0.7)])
        .with_fragments("water", vec![(fragment, 0.85)]);
    let harness = PipelineHarness::with_similarity(similarity);
    harness.expect_reply(r#"{"summary": "The water holds what you set aside.", "sources": []}"#);

    let context = DreamContext::new(OwnerId::new(), "I sank into a warm dark sea");
    let result = harness.interpret_as(context, "mirror").await.unwrap();

    assert_eq!(result.fragments_retrieved, vec![fragment_id]);
    // The derived theme's material reached the prompt.
    let requests = harness.generator.requests();
    assert!(requests[0].prompt.contains("Deep water often carries"));
}
