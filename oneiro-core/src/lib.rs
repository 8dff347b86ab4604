//! Persona-driven dream interpretation engine.
//!
//! This crate provides:
//! - Multi-stage interpretation pipelines in configurable personas
//! - Theme-based retrieval of curated knowledge fragments
//! - Tolerant parsing and schema validation of model output
//! - Interpretation persistence and run accounting
//!
//! # Quick Start
//!
//! ```ignore
//! use oneiro_core::{
//!     ClaudeGenerator, DreamContext, InterpretationService, OwnerId,
//!     PersonaRegistry, ServiceConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let generator = Arc::new(ClaudeGenerator::from_env()?);
//!     let similarity = Arc::new(my_vector_index()); // any SimilaritySource
//!     let service = InterpretationService::new(
//!         PersonaRegistry::with_builtins(),
//!         generator,
//!         similarity,
//!         ServiceConfig::default(),
//!     );
//!
//!     let dream = DreamContext::new(OwnerId::new(), "I was flying over a vast ocean")
//!         .with_theme("flying", 0.8);
//!     let result = service.interpret_dream(dream, "jung").await?;
//!     println!("{}", serde_json::to_string_pretty(&result.payload)?);
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod error;
pub mod fragment;
pub mod generation;
pub mod id;
pub mod persona;
pub mod pipeline;
pub mod result;
pub mod service;
pub mod similarity;
pub mod store;
pub mod testing;

// Primary public API
pub use context::{DreamContext, PriorDreamRef, ThemeScore, UserProfile};
pub use error::{InterpretError, Result};
pub use fragment::{FragmentKind, KnowledgeFragment};
pub use generation::{ClaudeGenerator, GenerationClient, TokenUsage};
pub use id::{DreamId, FragmentId, OwnerId, ResultId};
pub use persona::{Persona, PersonaMetadata, PersonaRegistry};
pub use result::{InterpretationResult, RunStatus, RunWarning, StageResult, StageStatus};
pub use service::{InterpretationService, RunOverrides, ServiceConfig};
pub use similarity::{FragmentHit, SimilaritySource, ThemeHit};
pub use store::{JsonFileStore, ResultStore};
pub use testing::{MockGenerator, MockSimilarity, PipelineHarness};
