//! Theme-driven knowledge retrieval.
//!
//! The retriever turns a dream's themes into a small, diverse set of
//! reference fragments. It is strictly best-effort: a slow or failing
//! similarity backend degrades the knowledge context and records a
//! warning but never fails the run.

use crate::context::ThemeScore;
use crate::fragment::KnowledgeFragment;
use crate::result::RunWarning;
use crate::similarity::SimilaritySource;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Tuning knobs for retrieval.
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    /// Themes scoring below this are not queried at all.
    pub theme_floor: f32,
    /// Fragment hits scoring below this are discarded.
    pub similarity_floor: f32,
    /// How many candidates to request per surviving theme.
    pub per_theme_fetch: usize,
    /// At most this many fragments kept per theme.
    pub per_theme_cap: usize,
    /// At most this many fragments kept overall.
    pub global_cap: usize,
    /// Budget for one similarity query.
    pub query_timeout: Duration,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            theme_floor: 0.30,
            similarity_floor: 0.35,
            per_theme_fetch: 10,
            per_theme_cap: 2,
            global_cap: 6,
            query_timeout: Duration::from_secs(5),
        }
    }
}

impl RetrieverConfig {
    pub fn with_theme_floor(mut self, floor: f32) -> Self {
        self.theme_floor = floor;
        self
    }

    pub fn with_similarity_floor(mut self, floor: f32) -> Self {
        self.similarity_floor = floor;
        self
    }

    pub fn with_per_theme_cap(mut self, cap: usize) -> Self {
        self.per_theme_cap = cap;
        self
    }

    pub fn with_global_cap(mut self, cap: usize) -> Self {
        self.global_cap = cap;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }
}

/// A fragment together with how it earned its place.
#[derive(Debug, Clone)]
pub struct ScoredFragment {
    pub fragment: KnowledgeFragment,
    /// The theme whose query produced the winning score.
    pub theme: String,
    pub theme_weight: f32,
    pub similarity: f32,
}

impl ScoredFragment {
    /// Theme relevance times fragment similarity; the merge order key.
    pub fn combined(&self) -> f32 {
        self.theme_weight * self.similarity
    }
}

/// What retrieval produced for one run.
#[derive(Debug, Clone, Default)]
pub struct RetrievedKnowledge {
    /// Best first: combined score, then theme weight, then similarity.
    pub fragments: Vec<ScoredFragment>,
    /// True when no theme cleared the floor; an empty context, not an error.
    pub no_context: bool,
    pub warnings: Vec<RunWarning>,
}

impl RetrievedKnowledge {
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn fragment_ids(&self) -> Vec<crate::id::FragmentId> {
        self.fragments.iter().map(|s| s.fragment.id).collect()
    }
}

/// Retrieves and ranks knowledge fragments for a dream's themes.
pub struct FragmentRetriever {
    similarity: Arc<dyn SimilaritySource>,
    config: RetrieverConfig,
}

impl FragmentRetriever {
    pub fn new(similarity: Arc<dyn SimilaritySource>, config: RetrieverConfig) -> Self {
        Self { similarity, config }
    }

    /// Retrieve fragments for `themes`, stopping at `deadline`.
    ///
    /// Themes below the floor are skipped; each surviving theme is queried
    /// under its own timeout. Candidates below the similarity floor are
    /// dropped, duplicates keep their best score, and the merged list is
    /// truncated under the per-theme and global caps.
    pub async fn retrieve(
        &self,
        text: &str,
        themes: &[ThemeScore],
        deadline: Instant,
    ) -> RetrievedKnowledge {
        let mut surviving: Vec<&ThemeScore> = themes
            .iter()
            .filter(|t| t.weight >= self.config.theme_floor)
            .collect();
        surviving.sort_by(|a, b| b.weight.total_cmp(&a.weight));

        if surviving.is_empty() {
            debug!(themes = themes.len(), "no themes above floor; empty knowledge context");
            return RetrievedKnowledge {
                fragments: Vec::new(),
                no_context: true,
                warnings: Vec::new(),
            };
        }

        let mut warnings = Vec::new();
        let mut candidates: Vec<ScoredFragment> = Vec::new();

        for theme in surviving {
            let now = Instant::now();
            if now >= deadline {
                warn!(theme = %theme.theme, "run budget exhausted during retrieval");
                warnings.push(RunWarning::RetrievalDegraded {
                    theme: Some(theme.theme.clone()),
                    reason: "run budget exhausted during retrieval".to_string(),
                });
                break;
            }
            let query_deadline = deadline.min(now + self.config.query_timeout);

            let hits = match timeout_at(
                query_deadline,
                self.similarity
                    .similar_fragments(&theme.theme, text, self.config.per_theme_fetch),
            )
            .await
            {
                Ok(Ok(hits)) => hits,
                Ok(Err(e)) => {
                    warn!(theme = %theme.theme, error = %e, "similarity query failed");
                    warnings.push(RunWarning::RetrievalDegraded {
                        theme: Some(theme.theme.clone()),
                        reason: "similarity query failed".to_string(),
                    });
                    continue;
                }
                Err(_) => {
                    warn!(theme = %theme.theme, "similarity query timed out");
                    warnings.push(RunWarning::RetrievalDegraded {
                        theme: Some(theme.theme.clone()),
                        reason: "similarity query timed out".to_string(),
                    });
                    continue;
                }
            };

            for hit in hits {
                if hit.score < self.config.similarity_floor {
                    continue;
                }
                candidates.push(ScoredFragment {
                    fragment: hit.fragment,
                    theme: theme.theme.clone(),
                    theme_weight: theme.weight,
                    similarity: hit.score,
                });
            }
        }

        let fragments = self.merge(candidates);
        debug!(kept = fragments.len(), "retrieval complete");
        RetrievedKnowledge {
            fragments,
            no_context: false,
            warnings,
        }
    }

    /// Deduplicate, order, and truncate candidates under the caps.
    fn merge(&self, candidates: Vec<ScoredFragment>) -> Vec<ScoredFragment> {
        // A fragment reachable through several themes keeps its best score.
        let mut best: HashMap<uuid::Uuid, ScoredFragment> = HashMap::new();
        for candidate in candidates {
            let key = *candidate.fragment.id.as_uuid();
            match best.get(&key) {
                Some(existing) if existing.combined() >= candidate.combined() => {}
                _ => {
                    best.insert(key, candidate);
                }
            }
        }

        let mut merged: Vec<ScoredFragment> = best.into_values().collect();
        merged.sort_by(|a, b| {
            b.combined()
                .total_cmp(&a.combined())
                .then(b.theme_weight.total_cmp(&a.theme_weight))
                .then(b.similarity.total_cmp(&a.similarity))
                .then(a.fragment.id.as_uuid().cmp(b.fragment.id.as_uuid()))
        });

        let mut per_theme: HashMap<String, usize> = HashMap::new();
        let mut kept = Vec::new();
        for candidate in merged {
            if kept.len() >= self.config.global_cap {
                break;
            }
            let count = per_theme.entry(candidate.theme.clone()).or_insert(0);
            if *count >= self.config.per_theme_cap {
                continue;
            }
            *count += 1;
            kept.push(candidate);
        }
        kept
    }
}
