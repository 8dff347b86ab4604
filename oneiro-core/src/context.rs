//! Request-side value types describing the dream to interpret.

use serde::{Deserialize, Serialize};

use crate::id::{DreamId, OwnerId};

/// A theme detected in a dream, with its detection confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeScore {
    /// Short theme label, e.g. "flying" or "water".
    pub theme: String,
    /// Confidence weight in `[0.0, 1.0]`.
    pub weight: f32,
}

impl ThemeScore {
    pub fn new(theme: impl Into<String>, weight: f32) -> Self {
        Self {
            theme: theme.into(),
            weight,
        }
    }
}

/// Optional information about the dreamer, used to personalize prompts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub display_name: Option<String>,
    pub age: Option<u8>,
    /// Free-text notes about the dreamer's waking situation.
    pub life_context: Option<String>,
}

/// A short reference to a previously interpreted dream by the same owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorDreamRef {
    pub dream_id: DreamId,
    pub summary: String,
}

/// Everything the pipeline knows about the dream being interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DreamContext {
    pub dream_id: DreamId,
    pub owner_id: OwnerId,
    /// The dream as told by the dreamer.
    pub transcription: String,
    /// Detected themes; may be empty, in which case the service may
    /// derive themes from the transcription.
    pub themes: Vec<ThemeScore>,
    pub profile: Option<UserProfile>,
    pub prior_dreams: Vec<PriorDreamRef>,
}

impl DreamContext {
    /// Create a context for a new dream with a fresh dream ID.
    pub fn new(owner_id: OwnerId, transcription: impl Into<String>) -> Self {
        Self {
            dream_id: DreamId::new(),
            owner_id,
            transcription: transcription.into(),
            themes: Vec::new(),
            profile: None,
            prior_dreams: Vec::new(),
        }
    }

    pub fn with_dream_id(mut self, dream_id: DreamId) -> Self {
        self.dream_id = dream_id;
        self
    }

    pub fn with_themes(mut self, themes: Vec<ThemeScore>) -> Self {
        self.themes = themes;
        self
    }

    pub fn with_theme(mut self, theme: impl Into<String>, weight: f32) -> Self {
        self.themes.push(ThemeScore::new(theme, weight));
        self
    }

    pub fn with_profile(mut self, profile: UserProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_prior_dream(mut self, dream_id: DreamId, summary: impl Into<String>) -> Self {
        self.prior_dreams.push(PriorDreamRef {
            dream_id,
            summary: summary.into(),
        });
        self
    }
}
