//! Check outputs — the value a check hands to its dependents.
//!
//! Provider output is either structured JSON or raw text that may carry
//! embedded JSON. Rather than a wrapper that behaves as both at once,
//! [`OutputValue`] is an explicit sum type with two accessors; the
//! template renderer picks the right view per consumer.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::issue::Issue;

/// The output of one check execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OutputValue {
    Json(serde_json::Value),
    Text(String),
}

impl OutputValue {
    /// String view: raw text for `Text`, compact JSON for `Json`.
    pub fn as_str(&self) -> Cow<'_, str> {
        match self {
            Self::Text(s) => Cow::Borrowed(s),
            Self::Json(serde_json::Value::String(s)) => Cow::Borrowed(s),
            Self::Json(v) => Cow::Owned(v.to_string()),
        }
    }

    /// Parsed view: the JSON value itself, or JSON extracted from text.
    ///
    /// Text extraction is lenient: a trailing JSON object/array wins,
    /// then the first one found anywhere, then the whole string if it
    /// parses, else `None`.
    pub fn as_parsed(&self) -> Option<serde_json::Value> {
        match self {
            Self::Json(v) => Some(v.clone()),
            Self::Text(s) => extract_embedded_json(s),
        }
    }

    /// The array items of this output, when it is (or parses to) an array.
    pub fn as_array(&self) -> Option<Vec<serde_json::Value>> {
        match self.as_parsed()? {
            serde_json::Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Json(serde_json::Value::Null) => true,
            Self::Json(_) => false,
        }
    }
}

impl From<serde_json::Value> for OutputValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<String> for OutputValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Find JSON embedded in free-form provider text.
///
/// Tries, in order: whole string, a JSON document at the tail, the first
/// balanced object/array anywhere.
pub fn extract_embedded_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }
    // Tail: scan backwards for the last opening brace/bracket that
    // yields a valid parse to the end of the string.
    for (idx, ch) in trimmed.char_indices().rev() {
        if ch == '{' || ch == '[' {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(&trimmed[idx..]) {
                return Some(v);
            }
        }
    }
    // Anywhere: first balanced candidate from the front.
    for (idx, ch) in trimmed.char_indices() {
        if ch == '{' || ch == '[' {
            if let Some(end) = balanced_end(&trimmed[idx..], ch) {
                if let Ok(v) = serde_json::from_str::<serde_json::Value>(&trimmed[idx..idx + end]) {
                    return Some(v);
                }
            }
        }
    }
    None
}

/// Byte length of the balanced `{...}` / `[...]` starting at offset 0,
/// respecting string literals and escapes.
fn balanced_end(s: &str, open: char) -> Option<usize> {
    let close = if open == '{' { '}' } else { ']' };
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;
    for (i, ch) in s.char_indices() {
        if in_str {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_str = false;
            }
            continue;
        }
        match ch {
            '"' => in_str = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// What one check execution produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewSummary {
    #[serde(default)]
    pub issues: Vec<Issue>,
    /// The value dependents see via `outputs[check]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputValue>,
    /// Human-readable rendering (markdown).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Pre-extraction value kept for forEach aggregation.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "__raw")]
    pub raw: Option<serde_json::Value>,
}

impl ReviewSummary {
    pub fn with_output(output: impl Into<OutputValue>) -> Self {
        Self {
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn with_issues(issues: Vec<Issue>) -> Self {
        Self {
            issues,
            ..Default::default()
        }
    }

    pub fn push_issue(&mut self, issue: Issue) {
        self.issues.push(issue);
    }

    /// True when any issue is at `error` severity or above.
    pub fn has_fatal_issues(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.severity >= crate::issue::Severity::Error)
    }
}
