//! The interpretation service: validate, retrieve, plan, execute, parse,
//! assemble, persist.
//!
//! One call, one owned run. Concurrent runs share only the persona
//! registry (read-only) and the admission semaphore; everything else is
//! request-local, so a cancelled caller simply drops its in-flight state.

use crate::context::{DreamContext, ThemeScore};
use crate::error::{InterpretError, Result};
use crate::generation::{GenerationClient, TokenUsage};
use crate::id::{FragmentId, ResultId};
use crate::persona::{FieldKind, Persona, PersonaMetadata, PersonaRegistry};
use crate::pipeline::executor::{HaltReason, RetryPolicy, StageExecutor};
use crate::pipeline::parser::ResponseParser;
use crate::pipeline::prompt::{PromptBuilder, PromptConfig};
use crate::pipeline::retriever::{FragmentRetriever, RetrievedKnowledge, RetrieverConfig};
use crate::result::{InterpretationResult, RunStatus, RunWarning, StageResult, StageStatus};
use crate::similarity::SimilaritySource;
use crate::store::ResultStore;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Service-wide tuning. Every constant the pipeline depends on lives
/// here with a documented default.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub retriever: RetrieverConfig,
    pub prompt: PromptConfig,
    pub retry: RetryPolicy,
    /// Hard wall-clock budget for one run.
    pub run_ceiling: Duration,
    /// Concurrent runs admitted; further callers queue briefly.
    pub admission_permits: usize,
    /// How long a caller may wait for admission before `Busy`.
    pub admission_wait: Duration,
    /// Themes to derive when the request carries none.
    pub derive_theme_limit: usize,
    /// Finished runs remembered for `fragments_used` lookups.
    pub usage_log_capacity: usize,
    /// Model override applied to every run; `None` uses the client default.
    pub model: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            retriever: RetrieverConfig::default(),
            prompt: PromptConfig::default(),
            retry: RetryPolicy::default(),
            run_ceiling: Duration::from_secs(120),
            admission_permits: 8,
            admission_wait: Duration::from_millis(500),
            derive_theme_limit: 5,
            usage_log_capacity: 256,
            model: None,
        }
    }
}

impl ServiceConfig {
    pub fn with_run_ceiling(mut self, ceiling: Duration) -> Self {
        self.run_ceiling = ceiling;
        self
    }

    pub fn with_admission_permits(mut self, permits: usize) -> Self {
        self.admission_permits = permits;
        self
    }

    pub fn with_admission_wait(mut self, wait: Duration) -> Self {
        self.admission_wait = wait;
        self
    }

    pub fn with_retriever(mut self, retriever: RetrieverConfig) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Per-run overrides a caller may attach to one request.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    /// Model for this run only; wins over the service-wide setting.
    pub model: Option<String>,
}

impl RunOverrides {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

struct UsageRecord {
    result_id: ResultId,
    fragments_used: Vec<FragmentId>,
}

/// The inbound face of the crate.
pub struct InterpretationService {
    registry: PersonaRegistry,
    similarity: Arc<dyn SimilaritySource>,
    generator: Arc<dyn GenerationClient>,
    retriever: FragmentRetriever,
    builder: PromptBuilder,
    executor: StageExecutor,
    store: Option<Arc<dyn ResultStore>>,
    admission: Semaphore,
    usage_log: Mutex<VecDeque<UsageRecord>>,
    config: ServiceConfig,
}

impl InterpretationService {
    pub fn new(
        registry: PersonaRegistry,
        generator: Arc<dyn GenerationClient>,
        similarity: Arc<dyn SimilaritySource>,
        config: ServiceConfig,
    ) -> Self {
        let retriever =
            FragmentRetriever::new(Arc::clone(&similarity), config.retriever.clone());
        let builder = PromptBuilder::new(config.prompt.clone());
        let executor = StageExecutor::new(
            Arc::clone(&generator),
            ResponseParser::default(),
            config.retry.clone(),
        );
        let admission = Semaphore::new(config.admission_permits.max(1));
        Self {
            registry,
            similarity,
            generator,
            retriever,
            builder,
            executor,
            store: None,
            admission,
            usage_log: Mutex::new(VecDeque::new()),
            config,
        }
    }

    /// Attach a persistence backend. Saving is best-effort; a failing
    /// store never changes what callers receive.
    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Metadata for every registered persona.
    pub fn list_personas(&self) -> Vec<PersonaMetadata> {
        self.registry.list()
    }

    /// Which retrieved fragments a finished run's final output actually
    /// referenced. Metadata only, remembered for the most recent runs.
    pub fn fragments_used(&self, result_id: ResultId) -> Option<Vec<FragmentId>> {
        let log = self.usage_log.lock().ok()?;
        log.iter()
            .find(|record| record.result_id == result_id)
            .map(|record| record.fragments_used.clone())
    }

    /// Interpret one dream in the named persona's voice.
    pub async fn interpret_dream(
        &self,
        context: DreamContext,
        persona_code: &str,
    ) -> Result<InterpretationResult> {
        self.interpret_dream_with(context, persona_code, RunOverrides::default())
            .await
    }

    /// [`interpret_dream`](Self::interpret_dream) with per-run overrides.
    pub async fn interpret_dream_with(
        &self,
        context: DreamContext,
        persona_code: &str,
        overrides: RunOverrides,
    ) -> Result<InterpretationResult> {
        // Everything checkable without an external call is checked before
        // admission, so invalid requests cost nothing.
        let persona = self.registry.get(persona_code).ok_or_else(|| {
            InterpretError::Validation(format!("unknown persona '{persona_code}'"))
        })?;
        validate_context(&context)?;

        let _permit = match timeout(self.config.admission_wait, self.admission.acquire()).await
        {
            Ok(Ok(permit)) => permit,
            _ => {
                debug!(persona = %persona_code, "admission rejected; service at capacity");
                return Err(InterpretError::Busy {
                    retry_after: self.config.admission_wait,
                });
            }
        };

        let started = Instant::now();
        let deadline = started + self.config.run_ceiling;
        let created_at = Utc::now();
        info!(
            dream = %context.dream_id,
            persona = %persona_code,
            themes = context.themes.len(),
            "interpretation started"
        );

        let mut warnings: Vec<RunWarning> = Vec::new();
        let themes = self.effective_themes(&context, deadline, &mut warnings).await;

        let mut knowledge = self
            .retriever
            .retrieve(&context.transcription, &themes, deadline)
            .await;
        warnings.append(&mut knowledge.warnings);

        let plan = self.builder.plan(&persona, &context, &knowledge)?;

        let model = overrides
            .model
            .as_deref()
            .or(self.config.model.as_deref());
        let report = self
            .executor
            .execute(&persona, &plan, model, deadline)
            .await;
        warnings.extend(report.warnings);

        match report.halt {
            HaltReason::Completed => {}
            HaltReason::RequiredStageFailed {
                stage,
                attempts,
                reason,
            } => {
                return Err(InterpretError::PipelineFailed {
                    stage,
                    attempts,
                    reason,
                });
            }
            HaltReason::DeadlineExceeded { stage } => {
                return Err(InterpretError::Timeout {
                    budget: self.config.run_ceiling,
                    stage,
                });
            }
        }

        let Some(final_stage) = report.stages.last() else {
            return Err(InterpretError::Validation(format!(
                "persona '{persona_code}' has no stages"
            )));
        };
        let payload = assemble_payload(&persona, final_stage);
        let fragments_used = referenced_fragments(&knowledge, final_stage);
        let usage = report
            .stages
            .iter()
            .fold(TokenUsage::default(), |mut total, stage| {
                total += stage.usage;
                total
            });

        let degraded = !warnings.is_empty()
            || report
                .stages
                .iter()
                .any(|stage| stage.status != StageStatus::Succeeded);
        let status = if degraded {
            RunStatus::Degraded
        } else {
            RunStatus::Complete
        };

        let result = InterpretationResult {
            result_id: ResultId::new(),
            dream_id: context.dream_id,
            persona: persona.code.clone(),
            persona_version: persona.version,
            model: model
                .map(str::to_string)
                .unwrap_or_else(|| self.generator.model_name().to_string()),
            status,
            stages: report.stages,
            payload,
            fragments_retrieved: knowledge.fragment_ids(),
            fragments_used,
            warnings,
            usage,
            elapsed: started.elapsed(),
            created_at,
        };

        self.record_usage(&result);
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&result).await {
                warn!(result = %result.result_id, error = %e, "failed to persist result");
            }
        }

        info!(
            result = %result.result_id,
            status = %match result.status {
                RunStatus::Complete => "complete",
                RunStatus::Degraded => "degraded",
            },
            stages = result.stages.len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "interpretation finished"
        );
        Ok(result)
    }

    /// The request's themes, or themes derived from the transcription
    /// when it carries none. Derivation is best-effort.
    async fn effective_themes(
        &self,
        context: &DreamContext,
        deadline: Instant,
        warnings: &mut Vec<RunWarning>,
    ) -> Vec<ThemeScore> {
        if !context.themes.is_empty() {
            return context.themes.clone();
        }

        let query_deadline =
            deadline.min(Instant::now() + self.config.retriever.query_timeout);
        match timeout_at(
            query_deadline,
            self.similarity
                .similar_themes(&context.transcription, self.config.derive_theme_limit),
        )
        .await
        {
            Ok(Ok(hits)) => {
                debug!(derived = hits.len(), "themes derived from transcription");
                hits.into_iter()
                    .map(|hit| ThemeScore::new(hit.theme, hit.score))
                    .collect()
            }
            Ok(Err(e)) => {
                warn!(error = %e, "theme derivation failed");
                warnings.push(RunWarning::RetrievalDegraded {
                    theme: None,
                    reason: "theme derivation failed".to_string(),
                });
                Vec::new()
            }
            Err(_) => {
                warn!("theme derivation timed out");
                warnings.push(RunWarning::RetrievalDegraded {
                    theme: None,
                    reason: "theme derivation timed out".to_string(),
                });
                Vec::new()
            }
        }
    }

    fn record_usage(&self, result: &InterpretationResult) {
        // A poisoned log loses observability metadata, nothing more.
        let Ok(mut log) = self.usage_log.lock() else {
            return;
        };
        log.push_back(UsageRecord {
            result_id: result.result_id,
            fragments_used: result.fragments_used.clone(),
        });
        while log.len() > self.config.usage_log_capacity.max(1) {
            log.pop_front();
        }
    }
}

fn validate_context(context: &DreamContext) -> Result<()> {
    if context.transcription.trim().is_empty() {
        return Err(InterpretError::Validation(
            "transcription is empty".to_string(),
        ));
    }
    for theme in &context.themes {
        if theme.theme.trim().is_empty() {
            return Err(InterpretError::Validation(
                "theme label is empty".to_string(),
            ));
        }
        if !theme.weight.is_finite() || !(0.0..=1.0).contains(&theme.weight) {
            return Err(InterpretError::Validation(format!(
                "theme '{}' has weight outside [0, 1]",
                theme.theme
            )));
        }
    }
    Ok(())
}

/// The run's final JSON payload, from the last stage's outcome.
///
/// A parse-degraded structured stage still yields the declared shape: the
/// schema skeleton with the cleaned raw text standing in for the first
/// text field.
fn assemble_payload(persona: &Persona, final_stage: &StageResult) -> Value {
    if let Some(parsed) = &final_stage.parsed {
        return parsed.clone();
    }

    match persona.final_stage().and_then(|stage| stage.output.schema()) {
        Some(schema) => {
            let (mut skeleton, _) = schema.validate(json!({}));
            let fallback = final_stage
                .fallback_summary
                .clone()
                .unwrap_or_else(|| final_stage.raw.trim().to_string());
            if let Some(field) = schema
                .fields
                .iter()
                .find(|field| matches!(field.kind, FieldKind::Text))
            {
                skeleton[&field.name] = Value::String(fallback);
            }
            skeleton
        }
        None => json!({ "text": final_stage.raw.trim() }),
    }
}

/// Which retrieved fragments the final output drew on: the cited
/// `sources` entries when present, otherwise identifiers spotted in the
/// raw text. Order follows the retrieval ranking.
fn referenced_fragments(
    knowledge: &RetrievedKnowledge,
    final_stage: &StageResult,
) -> Vec<FragmentId> {
    if knowledge.fragments.is_empty() {
        return Vec::new();
    }

    let cited = final_stage
        .parsed
        .as_ref()
        .and_then(|value| value.get("sources"))
        .and_then(Value::as_array);

    knowledge
        .fragments
        .iter()
        .map(|scored| scored.fragment.id)
        .filter(|id| {
            let id_text = id.to_string();
            match cited {
                Some(sources) => sources
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|s| s.contains(&id_text)),
                None => final_stage.raw.contains(&id_text),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{FragmentKind, KnowledgeFragment};
    use crate::id::OwnerId;
    use crate::persona::{FieldSpec, OutputSchema, StageDefinition};
    use crate::testing::{MockGenerator, MockSimilarity};

    fn test_persona() -> Persona {
        Persona::new("echo", "Echo", 1, "test voice", "You interpret.").with_stage(
            StageDefinition::structured(
                "reading",
                "produce the reading",
                "{transcription}\n{knowledge}",
                OutputSchema::new(vec![
                    FieldSpec::text("summary", "the reading"),
                    FieldSpec::string_list("sources", "fragments cited")
                        .optional()
                        .with_default(json!([])),
                ]),
            ),
        )
    }

    fn registry() -> PersonaRegistry {
        let mut registry = PersonaRegistry::new();
        registry.register(test_persona()).unwrap();
        registry
    }

    fn service_with(
        generator: MockGenerator,
        similarity: MockSimilarity,
        config: ServiceConfig,
    ) -> InterpretationService {
        InterpretationService::new(
            registry(),
            Arc::new(generator),
            Arc::new(similarity),
            config,
        )
    }

    fn dream() -> DreamContext {
        DreamContext::new(OwnerId::new(), "I was flying over a vast ocean")
            .with_theme("flying", 0.8)
    }

    #[tokio::test]
    async fn test_unknown_persona_fails_without_external_calls() {
        let generator = MockGenerator::new();
        let similarity = MockSimilarity::new();
        let service = service_with(generator, similarity, ServiceConfig::default());

        let err = service.interpret_dream(dream(), "lacan").await.unwrap_err();
        assert!(matches!(err, InterpretError::Validation(_)));
        assert!(err.to_string().contains("lacan"));
    }

    #[tokio::test]
    async fn test_empty_transcription_fails_validation() {
        let service = service_with(
            MockGenerator::new(),
            MockSimilarity::new(),
            ServiceConfig::default(),
        );
        let context = DreamContext::new(OwnerId::new(), "   ");
        let err = service.interpret_dream(context, "echo").await.unwrap_err();
        assert!(matches!(err, InterpretError::Validation(_)));
    }

    #[tokio::test]
    async fn test_bad_theme_weight_fails_validation() {
        let service = service_with(
            MockGenerator::new(),
            MockSimilarity::new(),
            ServiceConfig::default(),
        );
        let context =
            DreamContext::new(OwnerId::new(), "a dream").with_theme("flying", f32::NAN);
        let err = service.interpret_dream(context, "echo").await.unwrap_err();
        assert!(matches!(err, InterpretError::Validation(_)));
    }

    #[tokio::test]
    async fn test_clean_run_is_complete_and_remembered() {
        let fragment = KnowledgeFragment::new(FragmentKind::Symbol, "Flight often means escape.");
        let fragment_id = fragment.id;
        let generator = MockGenerator::new().then_text(format!(
            r#"{{"summary": "a reading", "sources": ["{fragment_id}"]}}"#
        ));
        let similarity =
            MockSimilarity::new().with_fragments("flying", vec![(fragment, 0.9)]);
        let service = service_with(generator, similarity, ServiceConfig::default());

        let result = service.interpret_dream(dream(), "echo").await.unwrap();

        assert_eq!(result.status, RunStatus::Complete);
        assert_eq!(result.persona, "echo");
        assert_eq!(result.payload["summary"], json!("a reading"));
        assert_eq!(result.fragments_retrieved, vec![fragment_id]);
        assert_eq!(result.fragments_used, vec![fragment_id]);
        assert_eq!(
            service.fragments_used(result.result_id),
            Some(vec![fragment_id])
        );
    }

    #[tokio::test]
    async fn test_retrieval_failure_degrades_but_completes() {
        let generator = MockGenerator::new().then_text(r#"{"summary": "a reading"}"#);
        let similarity = MockSimilarity::new().failing();
        let service = service_with(generator, similarity, ServiceConfig::default());

        let result = service.interpret_dream(dream(), "echo").await.unwrap();

        assert_eq!(result.status, RunStatus::Degraded);
        assert!(result
            .warnings
            .iter()
            .any(|w| matches!(w, RunWarning::RetrievalDegraded { .. })));
        assert!(result.fragments_retrieved.is_empty());
    }

    #[tokio::test]
    async fn test_empty_theme_list_derives_themes() {
        let fragment = KnowledgeFragment::new(FragmentKind::Symbol, "Water carries feeling.");
        let generator = MockGenerator::new().then_text(r#"{"summary": "a reading"}"#);
        let similarity = MockSimilarity::new()
            .with_themes(vec![("water", 0.7)])
            .with_fragments("water", vec![(fragment, 0.8)]);
        let service = service_with(generator, similarity, ServiceConfig::default());

        let context = DreamContext::new(OwnerId::new(), "I sank into a warm sea");
        let result = service.interpret_dream(context, "echo").await.unwrap();

        assert_eq!(result.fragments_retrieved.len(), 1);
        // Derived themes alone do not degrade the run.
        assert_eq!(result.status, RunStatus::Complete);
    }

    #[tokio::test]
    async fn test_model_override_is_recorded() {
        let generator = MockGenerator::new().then_text(r#"{"summary": "a reading"}"#);
        let service = service_with(
            generator,
            MockSimilarity::new(),
            ServiceConfig::default(),
        );

        let result = service
            .interpret_dream_with(
                dream(),
                "echo",
                RunOverrides::default().with_model("claude-sonnet-4-20250514"),
            )
            .await
            .unwrap();
        assert_eq!(result.model, "claude-sonnet-4-20250514");
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_limit_rejects_with_busy() {
        let generator = MockGenerator::new()
            .then_hang()
            .then_text(r#"{"summary": "late"}"#);
        let similarity = MockSimilarity::new();
        let config = ServiceConfig::default()
            .with_admission_permits(1)
            .with_run_ceiling(Duration::from_secs(5));
        let service = Arc::new(service_with(generator, similarity, config));

        let slow = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.interpret_dream(dream(), "echo").await })
        };
        tokio::task::yield_now().await;

        let err = service.interpret_dream(dream(), "echo").await.unwrap_err();
        assert!(matches!(err, InterpretError::Busy { .. }));

        // The admitted run eventually hits its ceiling.
        let slow_result = slow.await.unwrap();
        assert!(matches!(slow_result, Err(InterpretError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_failing_store_never_changes_the_result() {
        let generator = MockGenerator::new().then_text(r#"{"summary": "a reading"}"#);
        let service = service_with(
            generator,
            MockSimilarity::new(),
            ServiceConfig::default(),
        )
        .with_store(Arc::new(crate::testing::FailingStore::new()));

        let result = service.interpret_dream(dream(), "echo").await.unwrap();
        assert_eq!(result.payload["summary"], json!("a reading"));
    }

    #[tokio::test]
    async fn test_usage_log_is_bounded() {
        let mut config = ServiceConfig::default();
        config.usage_log_capacity = 2;
        let generator = MockGenerator::new()
            .then_text(r#"{"summary": "one"}"#)
            .then_text(r#"{"summary": "two"}"#)
            .then_text(r#"{"summary": "three"}"#);
        let service = service_with(generator, MockSimilarity::new(), config);

        let first = service.interpret_dream(dream(), "echo").await.unwrap();
        let second = service.interpret_dream(dream(), "echo").await.unwrap();
        let third = service.interpret_dream(dream(), "echo").await.unwrap();

        assert!(service.fragments_used(first.result_id).is_none());
        assert!(service.fragments_used(second.result_id).is_some());
        assert!(service.fragments_used(third.result_id).is_some());
    }

    #[test]
    fn test_payload_fallback_fills_first_text_field() {
        let persona = test_persona();
        let final_stage = StageResult {
            stage: "reading".to_string(),
            status: StageStatus::ParseDegraded,
            raw: "nothing parseable".to_string(),
            parsed: None,
            fallback_summary: Some("nothing parseable".to_string()),
            latency: Duration::from_millis(10),
            attempts: 1,
            usage: TokenUsage::default(),
        };
        let payload = assemble_payload(&persona, &final_stage);
        assert_eq!(payload["summary"], json!("nothing parseable"));
        assert_eq!(payload["sources"], json!([]));
    }
}
