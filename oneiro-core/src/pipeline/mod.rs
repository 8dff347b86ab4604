//! The interpretation pipeline, one direction only: retrieve knowledge,
//! plan prompts, execute stages, parse what comes back.
//!
//! Each step is independently testable; [`InterpretationService`] wires
//! them together per run.
//!
//! [`InterpretationService`]: crate::service::InterpretationService

pub mod executor;
pub mod parser;
pub mod prompt;
pub mod retriever;

pub use executor::{ExecutionReport, HaltReason, RetryPolicy, StageExecutor};
pub use parser::{ParseOutcome, ResponseParser};
pub use prompt::{PromptBuilder, PromptConfig, PromptError, PromptPlan, StagePrompt};
pub use retriever::{FragmentRetriever, RetrievedKnowledge, RetrieverConfig, ScoredFragment};
