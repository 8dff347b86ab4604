//! Similarity search seam.
//!
//! The engine never talks to an embedding model or vector index directly;
//! it asks a [`SimilaritySource`] for theme and fragment neighbors and
//! treats every failure as a degradation, not an abort.

use async_trait::async_trait;
use thiserror::Error;

use crate::fragment::KnowledgeFragment;

/// Errors from a similarity backend.
#[derive(Debug, Clone, Error)]
pub enum SimilarityError {
    #[error("similarity backend unavailable: {0}")]
    Unavailable(String),

    #[error("similarity query failed: {0}")]
    Query(String),
}

/// A theme suggested for a piece of text.
#[derive(Debug, Clone)]
pub struct ThemeHit {
    pub theme: String,
    /// Similarity score in `[0.0, 1.0]`.
    pub score: f32,
}

/// A knowledge fragment matched against a theme.
#[derive(Debug, Clone)]
pub struct FragmentHit {
    pub fragment: KnowledgeFragment,
    /// Similarity score in `[0.0, 1.0]`.
    pub score: f32,
}

/// Read-only access to the semantic index of themes and fragments.
#[async_trait]
pub trait SimilaritySource: Send + Sync {
    /// Suggest up to `limit` themes for the given text, best first.
    async fn similar_themes(&self, text: &str, limit: usize)
        -> Result<Vec<ThemeHit>, SimilarityError>;

    /// Return up to `limit` fragments indexed under the given theme, best
    /// first, ranked by similarity to `text`.
    async fn similar_fragments(
        &self,
        theme: &str,
        text: &str,
        limit: usize,
    ) -> Result<Vec<FragmentHit>, SimilarityError>;
}
