//! What an interpretation run produces.
//!
//! One run yields one [`InterpretationResult`]: the ordered per-stage
//! results, the final persona-shaped payload, and metadata about every
//! degradation that happened along the way. The caller owns the result
//! exclusively once it is returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::generation::TokenUsage;
use crate::id::{DreamId, FragmentId, ResultId};

/// Terminal status of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Generation and parsing both succeeded.
    Succeeded,
    /// Generation succeeded but the output never parsed; the raw text and
    /// a fallback summary stand in for the structured value.
    ParseDegraded,
    /// Generation failed terminally (retries exhausted or rejected).
    Failed,
}

impl StageStatus {
    /// True when the stage produced usable output of any quality.
    pub fn has_output(&self) -> bool {
        !matches!(self, StageStatus::Failed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageStatus::Succeeded => "succeeded",
            StageStatus::ParseDegraded => "parse_degraded",
            StageStatus::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// The outcome of one pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name from the persona definition.
    pub stage: String,
    pub status: StageStatus,
    /// Exactly what the model returned, unmodified. Empty for failed stages.
    pub raw: String,
    /// Schema-validated value; `None` for free-text output, degraded
    /// parses, and failed stages.
    pub parsed: Option<Value>,
    /// Cleaned, truncated raw text surfaced when parsing degraded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_summary: Option<String>,
    /// Wall-clock time spent on the stage across all attempts.
    pub latency: Duration,
    /// Generation calls made (1 means no retries were needed).
    pub attempts: u32,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl StageResult {
    /// The stage's accepted output: the parsed value rendered as compact
    /// JSON when available, otherwise the raw text. This is what later
    /// stages see of this stage.
    pub fn content(&self) -> String {
        match &self.parsed {
            Some(value) => value.to_string(),
            None => self.raw.trim().to_string(),
        }
    }
}

/// Overall status of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every stage succeeded cleanly with no repairs.
    Complete,
    /// The run finished, but at least one degradation was recorded.
    Degraded,
}

/// A non-fatal degradation recorded on the result instead of failing the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunWarning {
    /// A similarity query failed or timed out; knowledge context is
    /// partial or empty. `theme` is `None` when theme derivation itself
    /// failed.
    RetrievalDegraded {
        theme: Option<String>,
        reason: String,
    },
    /// A stage's output survived the whole parse fallback chain unparsed.
    ParseDegraded { stage: String },
    /// Schema validation repaired or substituted fields in a stage's output.
    SchemaAdjusted {
        stage: String,
        adjustments: Vec<String>,
    },
    /// An optional stage failed terminally and the run proceeded without it.
    OptionalStageSkipped { stage: String, reason: String },
    /// Generation stopped at the stage's token limit; output may be cut off.
    OutputTruncated { stage: String },
}

impl fmt::Display for RunWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunWarning::RetrievalDegraded { theme: Some(t), reason } => {
                write!(f, "retrieval degraded for theme '{t}': {reason}")
            }
            RunWarning::RetrievalDegraded { theme: None, reason } => {
                write!(f, "retrieval degraded: {reason}")
            }
            RunWarning::ParseDegraded { stage } => {
                write!(f, "stage '{stage}' output could not be parsed")
            }
            RunWarning::SchemaAdjusted { stage, adjustments } => {
                write!(
                    f,
                    "stage '{stage}' output adjusted: {}",
                    adjustments.join("; ")
                )
            }
            RunWarning::OptionalStageSkipped { stage, reason } => {
                write!(f, "optional stage '{stage}' skipped: {reason}")
            }
            RunWarning::OutputTruncated { stage } => {
                write!(f, "stage '{stage}' output truncated at its token limit")
            }
        }
    }
}

/// The complete outcome of interpreting one dream with one persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpretationResult {
    pub result_id: ResultId,
    pub dream_id: DreamId,
    /// Persona code, e.g. "jung".
    pub persona: String,
    pub persona_version: u32,
    /// Model that served the run.
    pub model: String,
    pub status: RunStatus,
    /// Per-stage results in definition order. A run aborted by a required
    /// stage returns an error instead, so every entry here is terminal.
    pub stages: Vec<StageResult>,
    /// Final structured payload, shaped by the persona's last-stage schema.
    pub payload: Value,
    /// Every fragment surfaced into the prompts.
    pub fragments_retrieved: Vec<FragmentId>,
    /// The subset of retrieved fragments the final output actually cited.
    pub fragments_used: Vec<FragmentId>,
    pub warnings: Vec<RunWarning>,
    /// Token usage summed across all stages and attempts.
    pub usage: TokenUsage,
    /// Wall-clock duration of the whole run.
    pub elapsed: Duration,
    pub created_at: DateTime<Utc>,
}

impl InterpretationResult {
    pub fn is_degraded(&self) -> bool {
        self.status == RunStatus::Degraded
    }

    /// Result of the final stage, the one that produced the payload.
    pub fn final_stage(&self) -> Option<&StageResult> {
        self.stages.last()
    }

    /// Look up one stage's result by name.
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == name)
    }
}
