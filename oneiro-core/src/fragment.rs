//! Knowledge fragments: curated source material surfaced into prompts.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::id::FragmentId;

/// What kind of source material a fragment is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    /// A symbol entry, e.g. "water: the unconscious".
    Symbol,
    /// A recurring dream motif with commentary.
    Motif,
    /// An excerpt from an interpretive essay.
    Essay,
    /// An anonymized case note.
    CaseStudy,
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FragmentKind::Symbol => "symbol",
            FragmentKind::Motif => "motif",
            FragmentKind::Essay => "essay",
            FragmentKind::CaseStudy => "case study",
        };
        write!(f, "{name}")
    }
}

/// A unit of curated interpretive knowledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeFragment {
    pub id: FragmentId,
    pub kind: FragmentKind,
    /// Themes this fragment is indexed under.
    pub themes: Vec<String>,
    pub text: String,
    /// Citation label, e.g. the work the excerpt is from.
    pub source: Option<String>,
}

impl KnowledgeFragment {
    pub fn new(kind: FragmentKind, text: impl Into<String>) -> Self {
        Self {
            id: FragmentId::new(),
            kind,
            themes: Vec::new(),
            text: text.into(),
            source: None,
        }
    }

    pub fn with_id(mut self, id: FragmentId) -> Self {
        self.id = id;
        self
    }

    pub fn with_themes(mut self, themes: Vec<String>) -> Self {
        self.themes = themes;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}
