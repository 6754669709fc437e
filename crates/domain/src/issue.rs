use serde::{Deserialize, Serialize};

/// How serious an issue is. Ordering matters: `Critical` is the highest
/// and drives the failed-run exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Security,
    Performance,
    Style,
    Logic,
    Documentation,
}

impl Default for Category {
    fn default() -> Self {
        Self::Logic
    }
}

/// A single finding produced by a provider or by a failed predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    /// Stable identifier, e.g. `security-scan/fail_if`.
    pub rule_id: String,
    pub message: String,
    pub severity: Severity,
    #[serde(default)]
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
}

impl Issue {
    pub fn new(rule_id: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            file: String::new(),
            line: 0,
            end_line: None,
            rule_id: rule_id.into(),
            message: message.into(),
            severity,
            category: Category::default(),
            suggestion: None,
            replacement: None,
        }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn with_file(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = file.into();
        self.line = line;
        self
    }
}

/// Count issues at or above a severity.
pub fn count_at_least(issues: &[Issue], min: Severity) -> usize {
    issues.iter().filter(|i| i.severity >= min).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn severity_serde_snake_case() {
        assert_eq!(serde_json::to_string(&Severity::Critical).unwrap(), "\"critical\"");
        let s: Severity = serde_json::from_str("\"warning\"").unwrap();
        assert_eq!(s, Severity::Warning);
    }

    #[test]
    fn issue_builder() {
        let i = Issue::new("lint/unused", "unused variable", Severity::Warning)
            .with_category(Category::Style)
            .with_file("src/main.rs", 10);
        assert_eq!(i.file, "src/main.rs");
        assert_eq!(i.line, 10);
        assert_eq!(i.category, Category::Style);
    }

    #[test]
    fn count_at_least_filters() {
        let issues = vec![
            Issue::new("a", "m", Severity::Info),
            Issue::new("b", "m", Severity::Error),
            Issue::new("c", "m", Severity::Critical),
        ];
        assert_eq!(count_at_least(&issues, Severity::Error), 2);
        assert_eq!(count_at_least(&issues, Severity::Critical), 1);
        assert_eq!(count_at_least(&issues, Severity::Info), 3);
    }

    #[test]
    fn issue_deserializes_without_optional_fields() {
        let json = serde_json::json!({
            "rule_id": "x/y",
            "message": "msg",
            "severity": "error",
        });
        let i: Issue = serde_json::from_value(json).unwrap();
        assert_eq!(i.file, "");
        assert_eq!(i.line, 0);
        assert_eq!(i.category, Category::Logic);
    }
}
