//! Testing utilities for the interpretation pipeline.
//!
//! This module provides tools for integration testing:
//! - `MockGenerator` for deterministic runs without API calls
//! - `MockSimilarity` for a scripted knowledge index
//! - `MemoryStore` and `FailingStore` for persistence behavior
//! - `PipelineHarness` for end-to-end scenarios
//! - Assertion helpers for verifying results

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::context::DreamContext;
use crate::error::Result;
use crate::fragment::{FragmentKind, KnowledgeFragment};
use crate::generation::{
    GenerationClient, GenerationError, GenerationOutput, GenerationRequest, TokenUsage,
};
use crate::id::{FragmentId, OwnerId};
use crate::persona::{FieldSpec, OutputSchema, Persona, PersonaRegistry, StageDefinition};
use crate::result::{InterpretationResult, RunStatus, StageStatus};
use crate::service::{InterpretationService, ServiceConfig};
use crate::similarity::{FragmentHit, SimilarityError, SimilaritySource, ThemeHit};
use crate::store::{ResultStore, StoreError};

/// One scripted generation reply.
#[derive(Debug, Clone)]
enum MockReply {
    Text { text: String, truncated: bool },
    Fail(GenerationError),
    /// Never resolves; the caller's timeout has to fire.
    Hang,
}

/// A mock generation client that returns scripted replies in order.
///
/// Use this for deterministic pipeline tests without API calls. When the
/// script runs out, further calls get an empty JSON object.
pub struct MockGenerator {
    script: Mutex<VecDeque<MockReply>>,
    /// Every request made, in call order.
    requests: Mutex<Vec<GenerationRequest>>,
    calls: AtomicUsize,
    fail_all: bool,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            fail_all: false,
        }
    }

    /// A client where every call fails with a retryable upstream error.
    pub fn always_failing() -> Self {
        let mut mock = Self::new();
        mock.fail_all = true;
        mock
    }

    /// Queue a successful text reply.
    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.queue(MockReply::Text {
            text: text.into(),
            truncated: false,
        });
        self
    }

    /// Queue a reply that stopped at the token limit.
    pub fn then_truncated(self, text: impl Into<String>) -> Self {
        self.queue(MockReply::Text {
            text: text.into(),
            truncated: true,
        });
        self
    }

    /// Queue a failed call.
    pub fn then_fail(self, error: GenerationError) -> Self {
        self.queue(MockReply::Fail(error));
        self
    }

    /// Queue a call that never returns.
    pub fn then_hang(self) -> Self {
        self.queue(MockReply::Hang);
        self
    }

    /// Append a text reply to the script after construction.
    pub fn queue_text(&self, text: impl Into<String>) {
        self.queue(MockReply::Text {
            text: text.into(),
            truncated: false,
        });
    }

    /// Append a failure to the script after construction.
    pub fn queue_failure(&self, error: GenerationError) {
        self.queue(MockReply::Fail(error));
    }

    /// Append a call that never returns.
    pub fn queue_hang(&self) {
        self.queue(MockReply::Hang);
    }

    /// How many generation calls were made.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request made so far, in call order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn queue(&self, reply: MockReply) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reply);
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationClient for MockGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> std::result::Result<GenerationOutput, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        if self.fail_all {
            return Err(GenerationError::Upstream("scripted failure".to_string()));
        }

        let reply = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match reply {
            Some(MockReply::Hang) => std::future::pending().await,
            Some(MockReply::Fail(error)) => Err(error),
            Some(MockReply::Text { text, truncated }) => Ok(scripted_output(text, truncated)),
            None => Ok(scripted_output("{}".to_string(), false)),
        }
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }
}

fn scripted_output(text: String, truncated: bool) -> GenerationOutput {
    GenerationOutput {
        text,
        model: "mock-model".to_string(),
        usage: TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        },
        truncated,
    }
}

/// A scripted knowledge index.
///
/// Seed it with themes and fragments before handing it to a service or
/// retriever; queries are answered from the seeded data, best score first.
pub struct MockSimilarity {
    themes: Vec<ThemeHit>,
    fragments: HashMap<String, Vec<FragmentHit>>,
    failing_themes: HashSet<String>,
    fail_all: bool,
    latency: Option<Duration>,
    queries: AtomicUsize,
}

impl MockSimilarity {
    pub fn new() -> Self {
        Self {
            themes: Vec::new(),
            fragments: HashMap::new(),
            failing_themes: HashSet::new(),
            fail_all: false,
            latency: None,
            queries: AtomicUsize::new(0),
        }
    }

    /// Themes suggested for any transcription, in the given order.
    pub fn with_themes<S: Into<String>>(mut self, themes: Vec<(S, f32)>) -> Self {
        self.themes = themes
            .into_iter()
            .map(|(theme, score)| ThemeHit {
                theme: theme.into(),
                score,
            })
            .collect();
        self
    }

    /// Index fragments under a theme with their similarity scores.
    pub fn with_fragments(
        mut self,
        theme: impl Into<String>,
        hits: Vec<(KnowledgeFragment, f32)>,
    ) -> Self {
        let entry = self.fragments.entry(theme.into()).or_default();
        entry.extend(
            hits.into_iter()
                .map(|(fragment, score)| FragmentHit { fragment, score }),
        );
        self
    }

    /// Fragment queries for this theme fail.
    pub fn failing_theme(mut self, theme: impl Into<String>) -> Self {
        self.failing_themes.insert(theme.into());
        self
    }

    /// Every query fails.
    pub fn failing(mut self) -> Self {
        self.fail_all = true;
        self
    }

    /// Every query takes this long to answer.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// How many queries of either kind were made.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    async fn observe_query(&self) {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for MockSimilarity {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SimilaritySource for MockSimilarity {
    async fn similar_themes(
        &self,
        _text: &str,
        limit: usize,
    ) -> std::result::Result<Vec<ThemeHit>, SimilarityError> {
        self.observe_query().await;
        if self.fail_all {
            return Err(SimilarityError::Unavailable(
                "scripted outage".to_string(),
            ));
        }
        Ok(self.themes.iter().take(limit).cloned().collect())
    }

    async fn similar_fragments(
        &self,
        theme: &str,
        _text: &str,
        limit: usize,
    ) -> std::result::Result<Vec<FragmentHit>, SimilarityError> {
        self.observe_query().await;
        if self.fail_all || self.failing_themes.contains(theme) {
            return Err(SimilarityError::Query(format!(
                "scripted failure for theme '{theme}'"
            )));
        }
        let mut hits = self
            .fragments
            .get(theme)
            .cloned()
            .unwrap_or_default();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }
}

/// An in-memory [`ResultStore`] that remembers every saved result.
#[derive(Default)]
pub struct MemoryStore {
    results: Mutex<Vec<InterpretationResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recently saved result.
    pub fn last(&self) -> Option<InterpretationResult> {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn save(&self, result: &InterpretationResult) -> std::result::Result<(), StoreError> {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result.clone());
        Ok(())
    }
}

/// A [`ResultStore`] whose every save fails.
pub struct FailingStore;

impl FailingStore {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultStore for FailingStore {
    async fn save(&self, _result: &InterpretationResult) -> std::result::Result<(), StoreError> {
        Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "scripted store failure",
        )))
    }
}

/// A minimal single-stage persona for pipeline tests: one structured
/// stage producing a summary and its cited sources.
pub fn sample_persona() -> Persona {
    Persona::new(
        "mirror",
        "Mirror",
        1,
        "Reflects the dream back as a brief reading.",
        "You restate the dream's imagery plainly and briefly.",
    )
    .with_stage(StageDefinition::structured(
        "reading",
        "produce the reading",
        "Dream:\n{transcription}\n\nReference material:\n{knowledge}",
        OutputSchema::new(vec![
            FieldSpec::text("summary", "the reading in two or three sentences"),
            FieldSpec::string_list("sources", "fragment ids drawn on")
                .optional()
                .with_default(serde_json::json!([])),
        ]),
    ))
}

/// A fragment indexed under a single theme.
pub fn sample_fragment(theme: &str, text: &str) -> KnowledgeFragment {
    KnowledgeFragment::new(FragmentKind::Symbol, text).with_themes(vec![theme.to_string()])
}

/// Test harness for running interpretation scenarios end to end.
///
/// Bundles a service wired to scripted mocks and an in-memory store. The
/// registry holds the builtin personas plus [`sample_persona`].
pub struct PipelineHarness {
    /// The scripted generation client behind the service.
    pub generator: Arc<MockGenerator>,
    /// The in-memory store attached to the service.
    pub store: Arc<MemoryStore>,
    /// The service under test.
    pub service: InterpretationService,
    owner: OwnerId,
}

impl PipelineHarness {
    /// A harness with an empty knowledge index.
    pub fn new() -> Self {
        Self::with_similarity(MockSimilarity::new())
    }

    /// A harness over a seeded knowledge index.
    pub fn with_similarity(similarity: MockSimilarity) -> Self {
        Self::with_parts(similarity, ServiceConfig::default())
    }

    /// Full control over the index and service configuration.
    pub fn with_parts(similarity: MockSimilarity, config: ServiceConfig) -> Self {
        let mut registry = PersonaRegistry::with_builtins();
        // The sample code never collides with a builtin.
        let _ = registry.register(sample_persona());

        let generator = Arc::new(MockGenerator::new());
        let store = Arc::new(MemoryStore::new());
        let service = InterpretationService::new(
            registry,
            Arc::clone(&generator) as Arc<dyn GenerationClient>,
            Arc::new(similarity),
            config,
        )
        .with_store(Arc::clone(&store) as Arc<dyn ResultStore>);

        Self {
            generator,
            store,
            service,
            owner: OwnerId::new(),
        }
    }

    /// Queue a reply for the next generation call.
    pub fn expect_reply(&self, text: impl Into<String>) -> &Self {
        self.generator.queue_text(text);
        self
    }

    /// Queue a failure for the next generation call.
    pub fn expect_failure(&self, error: GenerationError) -> &Self {
        self.generator.queue_failure(error);
        self
    }

    /// Interpret a transcription with the sample persona.
    pub async fn interpret(&self, transcription: &str) -> Result<InterpretationResult> {
        let context = DreamContext::new(self.owner, transcription);
        self.service.interpret_dream(context, "mirror").await
    }

    /// Interpret a prepared context with any registered persona.
    pub async fn interpret_as(
        &self,
        context: DreamContext,
        persona_code: &str,
    ) -> Result<InterpretationResult> {
        self.service.interpret_dream(context, persona_code).await
    }

    /// How many results the store has accepted.
    pub fn saved_count(&self) -> usize {
        self.store.len()
    }
}

impl Default for PipelineHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert the run completed with no degradation at all.
#[track_caller]
pub fn assert_complete(result: &InterpretationResult) {
    assert_eq!(
        result.status,
        RunStatus::Complete,
        "Expected a complete run, got {:?} with warnings: {:?}",
        result.status,
        result.warnings
    );
    assert!(
        result.warnings.is_empty(),
        "Expected no warnings, got: {:?}",
        result.warnings
    );
}

/// Assert the run finished degraded.
#[track_caller]
pub fn assert_degraded(result: &InterpretationResult) {
    assert_eq!(
        result.status,
        RunStatus::Degraded,
        "Expected a degraded run, got {:?}",
        result.status
    );
}

/// Assert a named stage finished with the given status.
#[track_caller]
pub fn assert_stage_status(result: &InterpretationResult, stage: &str, status: StageStatus) {
    let found = result
        .stage(stage)
        .unwrap_or_else(|| panic!("Expected stage '{stage}' in result, got {:?}",
            result.stages.iter().map(|s| s.stage.as_str()).collect::<Vec<_>>()));
    assert_eq!(
        found.status, status,
        "Expected stage '{stage}' to be {status}, got {}",
        found.status
    );
}

/// Assert the final output cited the given fragment.
#[track_caller]
pub fn assert_cited(result: &InterpretationResult, fragment_id: FragmentId) {
    assert!(
        result.fragments_used.contains(&fragment_id),
        "Expected fragment {fragment_id} among cited fragments: {:?}",
        result.fragments_used
    );
}
