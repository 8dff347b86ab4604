//! Sequential stage execution with retry, backoff, and deadlines.
//!
//! Stages run strictly in order; each prompt binds the accepted outputs
//! of the stages before it. Every generation call runs under the smaller
//! of the stage's own timeout and the run deadline, so a stalled upstream
//! can never hold a run past its budget.

use crate::generation::{GenerationClient, GenerationError, GenerationOutput, GenerationRequest, TokenUsage};
use crate::persona::Persona;
use crate::pipeline::parser::ResponseParser;
use crate::pipeline::prompt::PromptPlan;
use crate::result::{RunWarning, StageResult, StageStatus};
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Attempt-level progression of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::Succeeded => "succeeded",
            StageState::Failed => "failed",
            StageState::TimedOut => "timed_out",
        };
        write!(f, "{name}")
    }
}

/// Exponential backoff between generation attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Relative jitter in `[0, 1]`; 0.5 spreads each pause by ±50%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Pause before the next attempt, after `failures` failed ones.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let spread = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + spread * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

/// Why execution stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// Every stage ran (or was skipped as optional).
    Completed,
    /// A required stage exhausted its attempts.
    RequiredStageFailed {
        stage: String,
        attempts: u32,
        reason: String,
    },
    /// The run's wall-clock budget expired.
    DeadlineExceeded { stage: String },
}

/// Everything execution produced, whether or not it completed.
#[derive(Debug)]
pub struct ExecutionReport {
    pub stages: Vec<StageResult>,
    /// Accepted output per completed stage, as bound into later prompts.
    pub outputs: HashMap<String, String>,
    pub warnings: Vec<RunWarning>,
    pub halt: HaltReason,
}

/// Runs a persona's stages against a generation client.
pub struct StageExecutor {
    generator: Arc<dyn GenerationClient>,
    parser: ResponseParser,
    retry: RetryPolicy,
}

impl StageExecutor {
    pub fn new(
        generator: Arc<dyn GenerationClient>,
        parser: ResponseParser,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            generator,
            parser,
            retry,
        }
    }

    /// Execute the planned stages in order, stopping at `deadline`.
    ///
    /// A failed attempt retries with backoff up to the stage's attempt
    /// budget, except for rejections, which cannot succeed on retry. A
    /// required stage with no usable output halts the run; an optional one
    /// is skipped with a warning and later prompts see its slot as absent.
    pub async fn execute(
        &self,
        persona: &Persona,
        plan: &PromptPlan,
        model: Option<&str>,
        deadline: Instant,
    ) -> ExecutionReport {
        let mut stages: Vec<StageResult> = Vec::with_capacity(plan.len());
        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut warnings: Vec<RunWarning> = Vec::new();

        for (stage, prompt) in persona.stages.iter().zip(&plan.prompts) {
            debug_assert_eq!(stage.name, prompt.stage);

            let user_content = prompt.bind(&outputs);
            let started = Instant::now();
            let max_attempts = stage.params.max_attempts.max(1);
            let mut state = StageState::Pending;
            let mut attempts = 0u32;
            let mut usage = TokenUsage::default();
            let mut failure = "no attempt made";
            let mut produced: Option<GenerationOutput> = None;
            let mut out_of_time = false;

            while attempts < max_attempts {
                let now = Instant::now();
                if now >= deadline {
                    out_of_time = true;
                    break;
                }
                attempts += 1;
                advance(&stage.name, attempts, &mut state, StageState::Running);

                let request = GenerationRequest {
                    system: prompt.system.clone(),
                    prompt: user_content.clone(),
                    model: model.map(str::to_string),
                    max_tokens: stage.params.max_tokens,
                    temperature: stage.params.temperature,
                    timeout: stage.params.timeout,
                };
                let call_deadline = deadline.min(now + stage.params.timeout);

                match timeout_at(call_deadline, self.generator.generate(request)).await {
                    Ok(Ok(output)) => {
                        usage += output.usage;
                        advance(&stage.name, attempts, &mut state, StageState::Succeeded);
                        produced = Some(output);
                        break;
                    }
                    Ok(Err(e)) => {
                        advance(&stage.name, attempts, &mut state, StageState::Failed);
                        failure = error_class(&e);
                        warn!(
                            stage = %stage.name,
                            attempt = attempts,
                            error = %e,
                            "generation attempt failed"
                        );
                        if !e.is_retryable() {
                            break;
                        }
                    }
                    Err(_) => {
                        advance(&stage.name, attempts, &mut state, StageState::TimedOut);
                        failure = "generation call timed out";
                        warn!(
                            stage = %stage.name,
                            attempt = attempts,
                            "generation attempt timed out"
                        );
                        if Instant::now() >= deadline {
                            out_of_time = true;
                            break;
                        }
                    }
                }

                if attempts < max_attempts {
                    let pause = self.retry.backoff_for(attempts);
                    debug!(
                        stage = %stage.name,
                        backoff_ms = pause.as_millis() as u64,
                        "backing off before retry"
                    );
                    sleep_until(deadline.min(Instant::now() + pause)).await;
                }
            }

            let latency = started.elapsed();
            match produced {
                Some(output) => {
                    let outcome = self.parser.parse(&stage.name, &output.text, &stage.output);
                    if output.truncated {
                        warn!(stage = %stage.name, "output truncated at max_tokens");
                        warnings.push(RunWarning::OutputTruncated {
                            stage: stage.name.clone(),
                        });
                    }
                    if outcome.status == StageStatus::ParseDegraded {
                        warnings.push(RunWarning::ParseDegraded {
                            stage: stage.name.clone(),
                        });
                    }
                    if !outcome.adjustments.is_empty() {
                        warnings.push(RunWarning::SchemaAdjusted {
                            stage: stage.name.clone(),
                            adjustments: outcome
                                .adjustments
                                .iter()
                                .map(ToString::to_string)
                                .collect(),
                        });
                    }

                    let result = StageResult {
                        stage: stage.name.clone(),
                        status: outcome.status,
                        raw: output.text,
                        parsed: outcome.parsed,
                        fallback_summary: outcome.fallback_summary,
                        latency,
                        attempts,
                        usage,
                    };
                    if result.status.has_output() {
                        outputs.insert(stage.name.clone(), result.content());
                    }
                    info!(
                        stage = %stage.name,
                        status = %result.status,
                        attempts,
                        latency_ms = latency.as_millis() as u64,
                        "stage complete"
                    );
                    stages.push(result);
                }
                None => {
                    stages.push(StageResult {
                        stage: stage.name.clone(),
                        status: StageStatus::Failed,
                        raw: String::new(),
                        parsed: None,
                        fallback_summary: None,
                        latency,
                        attempts,
                        usage,
                    });

                    if out_of_time {
                        warn!(stage = %stage.name, last_state = %state, "run budget exhausted");
                        return ExecutionReport {
                            stages,
                            outputs,
                            warnings,
                            halt: HaltReason::DeadlineExceeded {
                                stage: stage.name.clone(),
                            },
                        };
                    }
                    if stage.is_required() {
                        warn!(
                            stage = %stage.name,
                            attempts,
                            last_state = %state,
                            failure,
                            "required stage failed"
                        );
                        return ExecutionReport {
                            stages,
                            outputs,
                            warnings,
                            halt: HaltReason::RequiredStageFailed {
                                stage: stage.name.clone(),
                                attempts,
                                reason: failure.to_string(),
                            },
                        };
                    }
                    info!(stage = %stage.name, attempts, "optional stage skipped");
                    warnings.push(RunWarning::OptionalStageSkipped {
                        stage: stage.name.clone(),
                        reason: failure.to_string(),
                    });
                }
            }
        }

        ExecutionReport {
            stages,
            outputs,
            warnings,
            halt: HaltReason::Completed,
        }
    }
}

fn advance(stage: &str, attempt: u32, state: &mut StageState, to: StageState) {
    debug!(stage, attempt, from = %*state, to = %to, "stage state");
    *state = to;
}

/// Failure class for run metadata; upstream detail stays in the logs.
fn error_class(e: &GenerationError) -> &'static str {
    match e {
        GenerationError::Timeout(_) => "generation call timed out",
        GenerationError::Upstream(_) => "upstream generation failure",
        GenerationError::Rejected(_) => "request rejected upstream",
    }
}
