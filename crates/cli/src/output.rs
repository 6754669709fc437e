//! Text rendering for run summaries.

use visor_engine::RunSummary;

pub fn render_text(summary: &RunSummary) -> String {
    let mut out = String::new();

    for check in &summary.checks {
        out.push_str(&format!(
            "{:8}  {}  [{}]  {}ms\n",
            format!("{:?}", check.outcome).to_lowercase(),
            check.check,
            check.scope,
            check.duration_ms,
        ));
    }

    if !summary.issues.is_empty() {
        out.push('\n');
        for issue in &summary.issues {
            let location = if issue.file.is_empty() {
                String::new()
            } else {
                format!(" {}:{}", issue.file, issue.line)
            };
            out.push_str(&format!(
                "{:8}  {}{}  {}\n",
                issue.severity.as_str(),
                issue.rule_id,
                location,
                issue.message,
            ));
        }
    }

    out.push_str(&format!(
        "\n{} succeeded, {} failed, {} issue(s) in {}ms\n",
        summary.stats.success_count,
        summary.stats.failure_count,
        summary.issues.len(),
        summary.stats.duration_ms,
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use visor_domain::issue::{Issue, Severity};
    use visor_domain::scope::Scope;
    use visor_engine::{CheckOutcome, OutcomeKind, RunStats};

    #[test]
    fn renders_checks_issues_and_totals() {
        let summary = RunSummary {
            checks: vec![CheckOutcome {
                check: "lint".into(),
                scope: Scope::root(),
                outcome: OutcomeKind::Fatal,
                duration_ms: 12,
                issues: Vec::new(),
            }],
            issues: vec![
                Issue::new("lint/fail_if", "gate matched", Severity::Error)
                    .with_file("src/lib.rs", 4),
            ],
            stats: RunStats {
                duration_ms: 20,
                success_count: 0,
                failure_count: 1,
                fail_if_triggered: 1,
            },
            routing: Vec::new(),
            history: Default::default(),
            outputs: Default::default(),
        };
        let text = render_text(&summary);
        assert!(text.contains("fatal"));
        assert!(text.contains("lint/fail_if"));
        assert!(text.contains("src/lib.rs:4"));
        assert!(text.contains("0 succeeded, 1 failed"));
    }
}
