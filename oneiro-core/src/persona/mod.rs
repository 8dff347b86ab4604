//! Interpretive voices as declarative configuration.
//!
//! A [`Persona`] is pure data: an ordered list of stage definitions, each
//! carrying a prompt template and an output contract. The pipeline never
//! branches on persona identity - adding a voice means registering another
//! template/schema pair, in code or from a JSON file.

mod builtin;
pub mod schema;

pub use builtin::{freud, jung};
pub use schema::{FieldKind, FieldSpec, OutputSchema, SchemaAdjustment};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// Errors from persona definition and loading.
#[derive(Debug, Error)]
pub enum PersonaError {
    #[error("invalid persona '{code}': {reason}")]
    Invalid { code: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Whether a stage failure may be survived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Terminal failure of this stage aborts the run.
    #[default]
    Required,
    /// Terminal failure of this stage is recorded and skipped.
    Optional,
}

/// What a stage's raw output is expected to be.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum OutputFormat {
    /// Plain prose; passed through untouched.
    FreeText,
    /// A JSON object matching `schema`; parsed and validated.
    Structured { schema: OutputSchema },
}

impl OutputFormat {
    pub fn is_structured(&self) -> bool {
        matches!(self, OutputFormat::Structured { .. })
    }

    pub fn schema(&self) -> Option<&OutputSchema> {
        match self {
            OutputFormat::Structured { schema } => Some(schema),
            OutputFormat::FreeText => None,
        }
    }
}

/// Generation knobs for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: usize,
    /// Budget for one generation attempt.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Total generation calls allowed, counting the first. 3 means the
    /// initial call plus up to two retries.
    pub max_attempts: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
            timeout: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl GenerationParams {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// One step of a persona's generation chain.
///
/// The template is plain text with named slots in braces:
///
/// - `{transcription}` - the dream text, quoted as opaque data
/// - `{knowledge}` - retrieved fragments, quoted as opaque data
/// - `{profile}` - the dreamer profile
/// - `{prior_dreams}` - summaries of earlier dreams by the same owner
/// - `{stage:<name>}` - the accepted output of an earlier stage
///
/// A trailing `?` (e.g. `{profile?}`) marks the slot optional: absent
/// context renders a placeholder instead of failing the plan. `{{` and
/// `}}` escape literal braces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    /// One line on what the stage contributes, shown in logs.
    pub purpose: String,
    #[serde(default)]
    pub criticality: Criticality,
    pub template: String,
    pub output: OutputFormat,
    #[serde(default)]
    pub params: GenerationParams,
}

impl StageDefinition {
    /// A stage producing prose.
    pub fn free_text(
        name: impl Into<String>,
        purpose: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            purpose: purpose.into(),
            criticality: Criticality::Required,
            template: template.into(),
            output: OutputFormat::FreeText,
            params: GenerationParams::default(),
        }
    }

    /// A stage producing a JSON object validated against `schema`.
    pub fn structured(
        name: impl Into<String>,
        purpose: impl Into<String>,
        template: impl Into<String>,
        schema: OutputSchema,
    ) -> Self {
        Self {
            name: name.into(),
            purpose: purpose.into(),
            criticality: Criticality::Required,
            template: template.into(),
            output: OutputFormat::Structured { schema },
            params: GenerationParams::default(),
        }
    }

    /// Mark the stage survivable: terminal failure skips it instead of
    /// aborting the run.
    pub fn optional(mut self) -> Self {
        self.criticality = Criticality::Optional;
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn is_required(&self) -> bool {
        self.criticality == Criticality::Required
    }
}

/// A configured interpretive voice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    /// Stable lookup code, e.g. "jung".
    pub code: String,
    /// Display name, e.g. "Carl Jung".
    pub name: String,
    /// Bumped whenever templates or schemas change; part of the result key.
    pub version: u32,
    pub description: String,
    /// Voice instruction prepended to every stage's system prompt.
    pub system_prompt: String,
    /// Stages in execution order.
    pub stages: Vec<StageDefinition>,
}

impl Persona {
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        version: u32,
        description: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            version,
            description: description.into(),
            system_prompt: system_prompt.into(),
            stages: Vec::new(),
        }
    }

    pub fn with_stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The stage whose output becomes the run's final payload.
    pub fn final_stage(&self) -> Option<&StageDefinition> {
        self.stages.last()
    }

    pub fn metadata(&self) -> PersonaMetadata {
        PersonaMetadata {
            code: self.code.clone(),
            name: self.name.clone(),
            version: self.version,
            description: self.description.clone(),
            stages: self.stages.iter().map(|s| s.name.clone()).collect(),
        }
    }

    /// Check the definition is internally consistent: non-empty, unique
    /// stage names, every `{stage:..}` slot referencing a strictly earlier
    /// stage. An optional stage's output may be absent at bind time, so
    /// only `{stage:<name>?}` slots may consume it.
    pub fn validate(&self) -> Result<(), PersonaError> {
        let invalid = |reason: String| PersonaError::Invalid {
            code: self.code.clone(),
            reason,
        };

        if self.code.is_empty() || self.code.chars().any(char::is_whitespace) {
            return Err(invalid("persona code must be non-empty with no whitespace".into()));
        }
        if self.stages.is_empty() {
            return Err(invalid("persona has no stages".into()));
        }
        // The final stage produces the run's payload; it cannot be skippable.
        if let Some(last) = self.stages.last() {
            if !last.is_required() {
                return Err(invalid(format!(
                    "final stage '{}' must be required",
                    last.name
                )));
            }
        }

        let mut earlier: HashMap<&str, Criticality> = HashMap::new();
        for stage in &self.stages {
            if stage.name.is_empty() {
                return Err(invalid("stage with empty name".into()));
            }
            if earlier.contains_key(stage.name.as_str()) {
                return Err(invalid(format!("duplicate stage name '{}'", stage.name)));
            }

            let parts = parse_template(&stage.template)
                .map_err(|e| invalid(format!("stage '{}': {e}", stage.name)))?;
            for part in &parts {
                if let TemplatePart::Slot {
                    name: SlotName::StageOutput(referenced),
                    optional,
                } = part
                {
                    match earlier.get(referenced.as_str()) {
                        None => {
                            return Err(invalid(format!(
                                "stage '{}' references '{referenced}', which does not run earlier",
                                stage.name
                            )));
                        }
                        Some(Criticality::Optional) if !optional => {
                            return Err(invalid(format!(
                                "stage '{}' requires output of optional stage '{referenced}'; \
                                 use '{{stage:{referenced}?}}'",
                                stage.name
                            )));
                        }
                        Some(_) => {}
                    }
                }
            }

            earlier.insert(&stage.name, stage.criticality);
        }

        Ok(())
    }
}

/// Summary of a registered persona, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaMetadata {
    pub code: String,
    pub name: String,
    pub version: u32,
    pub description: String,
    /// Stage names in execution order.
    pub stages: Vec<String>,
}

/// The set of personas available to the service.
///
/// Populated at startup and read-only afterwards; [`InterpretationService`]
/// shares personas by reference across concurrent runs.
///
/// [`InterpretationService`]: crate::service::InterpretationService
#[derive(Debug, Default)]
pub struct PersonaRegistry {
    personas: HashMap<String, Arc<Persona>>,
}

impl PersonaRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in voices.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for persona in builtin::builtin_personas() {
            registry.personas.insert(persona.code.clone(), Arc::clone(persona));
        }
        registry
    }

    /// Validate and register a persona. Registering an existing code
    /// replaces the earlier definition.
    pub fn register(&mut self, persona: Persona) -> Result<(), PersonaError> {
        persona.validate()?;
        if self.personas.contains_key(&persona.code) {
            debug!(code = %persona.code, version = persona.version, "replacing persona");
        }
        self.personas.insert(persona.code.clone(), Arc::new(persona));
        Ok(())
    }

    pub fn get(&self, code: &str) -> Option<Arc<Persona>> {
        self.personas.get(code).cloned()
    }

    /// Metadata for every registered persona, ordered by code.
    pub fn list(&self) -> Vec<PersonaMetadata> {
        let mut all: Vec<_> = self.personas.values().map(|p| p.metadata()).collect();
        all.sort_by(|a, b| a.code.cmp(&b.code));
        all
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    /// Load one persona definition from a JSON file.
    pub async fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), PersonaError> {
        let content = fs::read_to_string(path).await?;
        let persona: Persona = serde_json::from_str(&content)?;
        self.register(persona)
    }

    /// Load every `*.json` persona definition in a directory. Returns how
    /// many were registered; a malformed file fails the whole load.
    pub async fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize, PersonaError> {
        let mut loaded = 0;
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                self.load_file(&path).await?;
                loaded += 1;
            }
        }
        Ok(loaded)
    }
}

// ============================================================================
// Template slots
// ============================================================================

/// A context field a template can pull in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotName {
    Transcription,
    Knowledge,
    Profile,
    PriorDreams,
    /// Accepted output of an earlier stage.
    StageOutput(String),
}

impl SlotName {
    /// The spelling used inside braces.
    pub fn label(&self) -> String {
        match self {
            SlotName::Transcription => "transcription".to_string(),
            SlotName::Knowledge => "knowledge".to_string(),
            SlotName::Profile => "profile".to_string(),
            SlotName::PriorDreams => "prior_dreams".to_string(),
            SlotName::StageOutput(stage) => format!("stage:{stage}"),
        }
    }
}

/// One piece of a parsed stage template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    Text(String),
    Slot { name: SlotName, optional: bool },
}

/// Errors from template syntax.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown slot '{{{0}}}'")]
    UnknownSlot(String),

    #[error("unclosed '{{' (escape literal braces as '{{{{')")]
    UnclosedBrace,
}

/// Split a template into literal text and slots.
pub fn parse_template(template: &str) -> Result<Vec<TemplatePart>, TemplateError> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                text.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                text.push('}');
            }
            '{' => {
                let mut inner = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => inner.push(c),
                        None => return Err(TemplateError::UnclosedBrace),
                    }
                }
                let (raw_name, optional) = match inner.strip_suffix('?') {
                    Some(stripped) => (stripped, true),
                    None => (inner.as_str(), false),
                };
                let name = match raw_name {
                    "transcription" => SlotName::Transcription,
                    "knowledge" => SlotName::Knowledge,
                    "profile" => SlotName::Profile,
                    "prior_dreams" => SlotName::PriorDreams,
                    other => match other.strip_prefix("stage:") {
                        Some(stage) if !stage.is_empty() => {
                            SlotName::StageOutput(stage.to_string())
                        }
                        _ => return Err(TemplateError::UnknownSlot(inner.clone())),
                    },
                };
                if !text.is_empty() {
                    parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                }
                parts.push(TemplatePart::Slot { name, optional });
            }
            c => text.push(c),
        }
    }

    if !text.is_empty() {
        parts.push(TemplatePart::Text(text));
    }
    Ok(parts)
}
