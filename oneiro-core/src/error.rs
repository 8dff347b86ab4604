//! Error types for interpretation runs.
//!
//! Collaborator and module errors (`GenerationError`, `PromptError`,
//! `PersonaError`, `StoreError`) live next to the code that raises them;
//! this module holds the error a caller of the service actually sees.
//! Non-fatal degradations are not errors at all - they surface as
//! [`RunWarning`](crate::result::RunWarning) entries on the result.

use std::time::Duration;
use thiserror::Error;

use crate::pipeline::prompt::PromptError;

/// Errors returned by [`InterpretationService`](crate::service::InterpretationService).
///
/// Messages describe the failure class and never include raw upstream
/// response bodies.
#[derive(Debug, Error)]
pub enum InterpretError {
    /// The request was rejected before any external call was made.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Too many interpretations are in flight; try again later.
    #[error("interpretation service at capacity, retry after {retry_after:?}")]
    Busy { retry_after: Duration },

    /// The run exceeded its wall-clock budget.
    #[error("interpretation exceeded its {budget:?} budget while running stage '{stage}'")]
    Timeout { budget: Duration, stage: String },

    /// A required stage failed terminally and the run could not complete.
    #[error("stage '{stage}' failed after {attempts} attempts: {reason}")]
    PipelineFailed {
        stage: String,
        attempts: u32,
        reason: String,
    },
}

impl From<PromptError> for InterpretError {
    fn from(e: PromptError) -> Self {
        InterpretError::Validation(e.to_string())
    }
}

/// Convenience alias for service results.
pub type Result<T> = std::result::Result<T, InterpretError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_the_stage() {
        let err = InterpretError::PipelineFailed {
            stage: "synthesis".to_string(),
            attempts: 3,
            reason: "upstream service error (API status 500)".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("synthesis"));
        assert!(text.contains("3 attempts"));
    }

    #[test]
    fn test_timeout_display() {
        let err = InterpretError::Timeout {
            budget: Duration::from_secs(120),
            stage: "symbol_survey".to_string(),
        };
        assert!(err.to_string().contains("symbol_survey"));
    }
}
