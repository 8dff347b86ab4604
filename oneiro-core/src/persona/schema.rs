//! Declarative output schemas for JSON stages.
//!
//! A schema does two jobs: it renders the format instructions appended to
//! a stage prompt, and it validates what came back. Validation is
//! tolerant by design: values are clamped and coerced, declared defaults
//! fill gaps, and a missing required field is substituted with an empty
//! value rather than failing the stage. Every adjustment is reported so
//! the run can record what was repaired.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The declared type of one output field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    /// Free text.
    Text,
    /// A number clamped into `[min, max]`.
    Number { min: f64, max: f64 },
    Boolean,
    /// A list of strings.
    StringList,
    /// A nested object validated against `fields`.
    Object { fields: Vec<FieldSpec> },
    /// A list of objects, each validated against `fields`.
    ObjectList { fields: Vec<FieldSpec> },
}

impl FieldKind {
    /// The value substituted when a required field is missing or unusable.
    fn empty_value(&self) -> Value {
        match self {
            FieldKind::Text => Value::String(String::new()),
            FieldKind::Number { min, .. } => Value::from(*min),
            FieldKind::Boolean => Value::Bool(false),
            FieldKind::StringList | FieldKind::ObjectList { .. } => Value::Array(Vec::new()),
            FieldKind::Object { fields } => {
                // Keep the declared shape; only the parent substitution is
                // recorded, so child adjustments are dropped here.
                let mut adjustments = Vec::new();
                validate_fields(fields, Map::new(), "", &mut adjustments)
            }
        }
    }

    /// A skeleton value for format instructions, e.g. `[{"symbol": "...", "meaning": "..."}]`.
    fn sketch(&self) -> String {
        match self {
            FieldKind::Text => "\"...\"".to_string(),
            FieldKind::Number { .. } => "0.0".to_string(),
            FieldKind::Boolean => "true|false".to_string(),
            FieldKind::StringList => "[\"...\"]".to_string(),
            FieldKind::Object { fields } => {
                let inner = fields
                    .iter()
                    .map(|f| format!("\"{}\": {}", f.name, f.kind.sketch()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{inner}}}")
            }
            FieldKind::ObjectList { fields } => {
                let inner = fields
                    .iter()
                    .map(|f| format!("\"{}\": {}", f.name, f.kind.sketch()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("[{{{inner}}}]")
            }
        }
    }
}

/// One field of a stage's JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Shown to the model in the format instructions.
    pub description: String,
    pub kind: FieldKind,
    /// Fields are required unless a persona file says otherwise.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Value used when the field is absent from the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn text(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, description, FieldKind::Text)
    }

    pub fn number(
        name: impl Into<String>,
        description: impl Into<String>,
        min: f64,
        max: f64,
    ) -> Self {
        Self::new(name, description, FieldKind::Number { min, max })
    }

    pub fn boolean(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, description, FieldKind::Boolean)
    }

    pub fn string_list(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, description, FieldKind::StringList)
    }

    pub fn object(
        name: impl Into<String>,
        description: impl Into<String>,
        fields: Vec<FieldSpec>,
    ) -> Self {
        Self::new(name, description, FieldKind::Object { fields })
    }

    pub fn object_list(
        name: impl Into<String>,
        description: impl Into<String>,
        fields: Vec<FieldSpec>,
    ) -> Self {
        Self::new(name, description, FieldKind::ObjectList { fields })
    }

    fn new(name: impl Into<String>, description: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
            required: true,
            default: None,
        }
    }

    /// Mark the field optional. An absent optional field takes its default
    /// when one is declared, otherwise it is omitted from the output.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Set a default used when the response omits the field.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// The declared shape of a JSON stage output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSchema {
    pub fields: Vec<FieldSpec>,
}

impl OutputSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Render the instructions appended to the stage prompt.
    pub fn format_instructions(&self) -> String {
        let mut out = String::from(
            "Respond with ONLY a JSON object, no markdown fences and no text outside the JSON. \
             Use exactly these fields:\n{\n",
        );
        for field in &self.fields {
            let requirement = if field.required {
                "required"
            } else {
                "optional"
            };
            let range = match &field.kind {
                FieldKind::Number { min, max } => format!(", between {min} and {max}"),
                _ => String::new(),
            };
            out.push_str(&format!(
                "  \"{}\": {}  // {}{}: {}\n",
                field.name,
                field.kind.sketch(),
                requirement,
                range,
                field.description
            ));
        }
        out.push('}');
        out
    }

    /// Validate a parsed value against the schema.
    ///
    /// Returns the canonical value (exactly the declared fields) and the
    /// adjustments that were applied to get there.
    pub fn validate(&self, value: Value) -> (Value, Vec<SchemaAdjustment>) {
        let mut adjustments = Vec::new();
        let obj = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let validated = validate_fields(&self.fields, obj, "", &mut adjustments);
        (validated, adjustments)
    }
}

/// A repair applied while validating stage output against its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaAdjustment {
    /// A number was pulled into its declared range.
    Clamped { field: String },
    /// A value was converted to the declared type.
    Coerced { field: String },
    /// A declared default filled an absent required field.
    Defaulted { field: String },
    /// A required field was missing or unusable and an empty value stands in.
    Substituted { field: String },
    /// A field not in the schema was discarded.
    DroppedUnknown { field: String },
}

impl SchemaAdjustment {
    pub fn field(&self) -> &str {
        match self {
            SchemaAdjustment::Clamped { field }
            | SchemaAdjustment::Coerced { field }
            | SchemaAdjustment::Defaulted { field }
            | SchemaAdjustment::Substituted { field }
            | SchemaAdjustment::DroppedUnknown { field } => field,
        }
    }

    /// True when the adjustment replaced content rather than repairing it.
    pub fn is_substitution(&self) -> bool {
        matches!(self, SchemaAdjustment::Substituted { .. })
    }
}

impl fmt::Display for SchemaAdjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaAdjustment::Clamped { field } => write!(f, "clamped '{field}' into range"),
            SchemaAdjustment::Coerced { field } => {
                write!(f, "coerced '{field}' to its declared type")
            }
            SchemaAdjustment::Defaulted { field } => {
                write!(f, "filled '{field}' with its default")
            }
            SchemaAdjustment::Substituted { field } => {
                write!(f, "substituted an empty value for '{field}'")
            }
            SchemaAdjustment::DroppedUnknown { field } => {
                write!(f, "dropped unknown field '{field}'")
            }
        }
    }
}

fn default_required() -> bool {
    true
}

fn child_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn validate_fields(
    fields: &[FieldSpec],
    mut obj: Map<String, Value>,
    prefix: &str,
    adjustments: &mut Vec<SchemaAdjustment>,
) -> Value {
    let mut out = Map::new();
    for field in fields {
        let path = child_path(prefix, &field.name);
        match obj.remove(&field.name) {
            Some(value) => {
                let coerced = coerce(&field.kind, &path, value, adjustments);
                out.insert(field.name.clone(), coerced);
            }
            None => {
                if let Some(default) = &field.default {
                    // An absent optional field taking its default is the
                    // declared behavior, not a repair.
                    if field.required {
                        adjustments.push(SchemaAdjustment::Defaulted { field: path });
                    }
                    out.insert(field.name.clone(), default.clone());
                } else if field.required {
                    adjustments.push(SchemaAdjustment::Substituted { field: path });
                    out.insert(field.name.clone(), field.kind.empty_value());
                }
            }
        }
    }
    for (name, _) in obj {
        adjustments.push(SchemaAdjustment::DroppedUnknown {
            field: child_path(prefix, &name),
        });
    }
    Value::Object(out)
}

fn coerce(
    kind: &FieldKind,
    path: &str,
    value: Value,
    adjustments: &mut Vec<SchemaAdjustment>,
) -> Value {
    match kind {
        FieldKind::Text => match value {
            Value::String(s) => Value::String(s),
            Value::Null => {
                adjustments.push(SchemaAdjustment::Substituted {
                    field: path.to_string(),
                });
                kind.empty_value()
            }
            other => {
                adjustments.push(SchemaAdjustment::Coerced {
                    field: path.to_string(),
                });
                match other {
                    Value::Number(n) => Value::String(n.to_string()),
                    Value::Bool(b) => Value::String(b.to_string()),
                    nested => Value::String(nested.to_string()),
                }
            }
        },
        FieldKind::Number { min, max } => {
            let parsed = match &value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => {
                    let parsed = s.trim().parse::<f64>().ok();
                    if parsed.is_some() {
                        adjustments.push(SchemaAdjustment::Coerced {
                            field: path.to_string(),
                        });
                    }
                    parsed
                }
                _ => None,
            };
            match parsed.filter(|v| v.is_finite()) {
                Some(v) => {
                    let clamped = v.clamp(*min, *max);
                    if clamped != v {
                        adjustments.push(SchemaAdjustment::Clamped {
                            field: path.to_string(),
                        });
                    }
                    Value::from(clamped)
                }
                None => {
                    adjustments.push(SchemaAdjustment::Substituted {
                        field: path.to_string(),
                    });
                    kind.empty_value()
                }
            }
        }
        FieldKind::Boolean => match value {
            Value::Bool(b) => Value::Bool(b),
            Value::String(s) if s.eq_ignore_ascii_case("true") => {
                adjustments.push(SchemaAdjustment::Coerced {
                    field: path.to_string(),
                });
                Value::Bool(true)
            }
            Value::String(s) if s.eq_ignore_ascii_case("false") => {
                adjustments.push(SchemaAdjustment::Coerced {
                    field: path.to_string(),
                });
                Value::Bool(false)
            }
            _ => {
                adjustments.push(SchemaAdjustment::Substituted {
                    field: path.to_string(),
                });
                kind.empty_value()
            }
        },
        FieldKind::StringList => match value {
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    match item {
                        Value::String(s) => out.push(Value::String(s)),
                        Value::Number(n) => {
                            adjustments.push(SchemaAdjustment::Coerced {
                                field: format!("{path}[{i}]"),
                            });
                            out.push(Value::String(n.to_string()));
                        }
                        _ => {
                            adjustments.push(SchemaAdjustment::Coerced {
                                field: format!("{path}[{i}]"),
                            });
                        }
                    }
                }
                Value::Array(out)
            }
            Value::String(s) => {
                adjustments.push(SchemaAdjustment::Coerced {
                    field: path.to_string(),
                });
                Value::Array(vec![Value::String(s)])
            }
            _ => {
                adjustments.push(SchemaAdjustment::Substituted {
                    field: path.to_string(),
                });
                kind.empty_value()
            }
        },
        FieldKind::Object { fields } => match value {
            Value::Object(map) => validate_fields(fields, map, path, adjustments),
            _ => {
                adjustments.push(SchemaAdjustment::Substituted {
                    field: path.to_string(),
                });
                kind.empty_value()
            }
        },
        FieldKind::ObjectList { fields } => match value {
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    match item {
                        Value::Object(map) => {
                            let element_path = format!("{path}[{i}]");
                            out.push(validate_fields(fields, map, &element_path, adjustments));
                        }
                        _ => {
                            adjustments.push(SchemaAdjustment::Coerced {
                                field: format!("{path}[{i}]"),
                            });
                        }
                    }
                }
                Value::Array(out)
            }
            _ => {
                adjustments.push(SchemaAdjustment::Substituted {
                    field: path.to_string(),
                });
                kind.empty_value()
            }
        },
    }
}
