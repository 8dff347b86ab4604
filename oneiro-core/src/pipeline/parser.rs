//! Turning raw stage output into validated values.
//!
//! Models wrap JSON in prose, fences, single quotes, comments, and
//! trailing commas. The parser works through an ordered fallback chain
//! and only gives up after every repair has been tried; an unparseable
//! stage degrades, it never fails the run.

use crate::persona::{OutputFormat, SchemaAdjustment};
use crate::result::StageStatus;
use serde_json::Value;
use tracing::debug;

/// What the parser made of one stage's raw text.
#[derive(Debug, Clone)]
pub struct ParseOutcome {
    /// `Succeeded` or `ParseDegraded`; parsing never yields `Failed`.
    pub status: StageStatus,
    /// The canonical validated value, for structured stages that parsed.
    pub parsed: Option<Value>,
    /// Cleaned, truncated raw text standing in for an unparseable value.
    pub fallback_summary: Option<String>,
    /// Schema repairs applied to the parsed value.
    pub adjustments: Vec<SchemaAdjustment>,
}

impl ParseOutcome {
    fn succeeded(parsed: Option<Value>, adjustments: Vec<SchemaAdjustment>) -> Self {
        Self {
            status: StageStatus::Succeeded,
            parsed,
            fallback_summary: None,
            adjustments,
        }
    }

    fn degraded(summary: String) -> Self {
        Self {
            status: StageStatus::ParseDegraded,
            parsed: None,
            fallback_summary: Some(summary),
            adjustments: Vec::new(),
        }
    }
}

/// Parses stage output against its declared format.
#[derive(Debug, Clone)]
pub struct ResponseParser {
    /// Longest fallback summary, in characters.
    max_summary_chars: usize,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self {
            max_summary_chars: 240,
        }
    }
}

impl ResponseParser {
    pub fn new(max_summary_chars: usize) -> Self {
        Self { max_summary_chars }
    }

    /// Parse one stage's raw text.
    ///
    /// Free-text stages pass through; an empty response degrades. For
    /// structured stages the fallback chain is: strict parse, balanced
    /// brace extraction, lenient repairs, then `ParseDegraded` with a
    /// cleaned summary in place of the value.
    pub fn parse(&self, stage: &str, raw: &str, output: &OutputFormat) -> ParseOutcome {
        match output {
            OutputFormat::FreeText => {
                if raw.trim().is_empty() {
                    debug!(stage, "empty free-text output");
                    ParseOutcome::degraded(String::new())
                } else {
                    ParseOutcome::succeeded(None, Vec::new())
                }
            }
            OutputFormat::Structured { schema } => match extract_object(raw) {
                Some(value) => {
                    let (canonical, adjustments) = schema.validate(value);
                    if !adjustments.is_empty() {
                        debug!(stage, repairs = adjustments.len(), "schema adjustments applied");
                    }
                    ParseOutcome::succeeded(Some(canonical), adjustments)
                }
                None => {
                    debug!(stage, "unparseable structured output");
                    ParseOutcome::degraded(self.summarize(raw))
                }
            },
        }
    }

    /// Clean raw text down to something displayable in place of a value.
    fn summarize(&self, raw: &str) -> String {
        let cleaned = raw
            .lines()
            .filter(|line| !line.trim_start().starts_with("```"))
            .collect::<Vec<_>>()
            .join(" ");
        let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
        if cleaned.chars().count() <= self.max_summary_chars {
            return cleaned;
        }
        let cut: String = cleaned.chars().take(self.max_summary_chars).collect();
        let keep = match cut.rfind(' ') {
            Some(pos) if pos > 0 => &cut[..pos],
            _ => cut.as_str(),
        };
        format!("{keep} ...")
    }
}

/// Pull a JSON object out of `raw`, trying progressively harder.
fn extract_object(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();

    if let Some(value) = parse_object(trimmed) {
        return Some(value);
    }

    // The model usually wraps the object in prose or fences; take the
    // first balanced top-level object.
    if let Some(candidate) = balanced_object(trimmed) {
        if let Some(value) = parse_object(candidate) {
            return Some(value);
        }
        let repaired = repair_json(candidate);
        if let Some(value) = parse_object(&repaired) {
            return Some(value);
        }
    }

    // Single-quoted strings hide braces from the scanner; repair the whole
    // text first and scan again.
    let repaired = repair_json(trimmed);
    if let Some(candidate) = balanced_object(&repaired) {
        if let Some(value) = parse_object(candidate) {
            return Some(value);
        }
    }

    None
}

fn parse_object(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(Value::is_object)
}

/// The substring from the first `{` to its matching `}`, honoring strings
/// and escapes so nested structures survive.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Lenient textual repairs: single quotes to double quotes, comments
/// stripped, trailing commas dropped. Operates outside strings only.
fn repair_json(text: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Normal,
        InDouble,
        InSingle,
        LineComment,
        BlockComment,
    }

    let mut out = String::with_capacity(text.len());
    let mut state = State::Normal;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                '"' => {
                    state = State::InDouble;
                    out.push('"');
                }
                '\'' => {
                    state = State::InSingle;
                    out.push('"');
                }
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                }
                '}' | ']' => {
                    // Drop a trailing comma left before the closer.
                    while out.ends_with(char::is_whitespace) {
                        out.pop();
                    }
                    if out.ends_with(',') {
                        out.pop();
                    }
                    out.push(c);
                }
                c => out.push(c),
            },
            State::InDouble => match c {
                '\\' => {
                    out.push('\\');
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                '"' => {
                    state = State::Normal;
                    out.push('"');
                }
                c => out.push(c),
            },
            State::InSingle => match c {
                '\\' => match chars.next() {
                    // \' has no meaning once the string is double-quoted.
                    Some('\'') => out.push('\''),
                    Some(next) => {
                        out.push('\\');
                        out.push(next);
                    }
                    None => {}
                },
                '"' => out.push_str("\\\""),
                '\'' => {
                    state = State::Normal;
                    out.push('"');
                }
                c => out.push(c),
            },
            State::LineComment => {
                if c == '\n' {
                    state = State::Normal;
                    out.push('\n');
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Normal;
                }
            }
        }
    }
    out
}
