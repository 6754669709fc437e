//! Run results — what one engine invocation returns.

use std::collections::HashMap;

use serde::Serialize;

use visor_domain::issue::{Issue, Severity};
use visor_domain::review::ReviewSummary;
use visor_domain::scope::Scope;
use visor_domain::trace::RoutingRecord;

/// Terminal state of one check execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Fatal,
    /// Not run: `if` false, `assume` false, unselected, or cancelled.
    Skipped,
    /// Not run because a fatal upstream blocked it. Blocks dependents.
    Blocked,
}

impl OutcomeKind {
    pub fn blocks_dependents(self) -> bool {
        matches!(self, Self::Fatal | Self::Blocked)
    }

    pub fn is_failure(self) -> bool {
        self == Self::Fatal
    }
}

/// One completed (or skipped) check execution.
#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub check: String,
    pub scope: Scope,
    pub outcome: OutcomeKind,
    pub duration_ms: u64,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub duration_ms: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// How many times a `fail_if` predicate fired.
    pub fail_if_triggered: u64,
}

/// Aggregate result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub checks: Vec<CheckOutcome>,
    pub issues: Vec<Issue>,
    pub stats: RunStats,
    pub routing: Vec<RoutingRecord>,
    /// check → every summary across all loops, in completion order.
    pub history: HashMap<String, Vec<ReviewSummary>>,
    /// check → final output value (parsed view where available).
    pub outputs: HashMap<String, serde_json::Value>,
}

impl RunSummary {
    /// The canonical failed-run signal.
    pub fn has_critical(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }

    /// CLI exit code threshold: 0 success, 1 on any critical issue.
    pub fn exit_code(&self) -> i32 {
        if self.has_critical() {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_blocking() {
        assert!(OutcomeKind::Fatal.blocks_dependents());
        assert!(OutcomeKind::Blocked.blocks_dependents());
        assert!(!OutcomeKind::Success.blocks_dependents());
        assert!(!OutcomeKind::Skipped.blocks_dependents());
    }

    #[test]
    fn critical_issue_drives_exit_code() {
        let mut summary = RunSummary {
            checks: Vec::new(),
            issues: Vec::new(),
            stats: RunStats::default(),
            routing: Vec::new(),
            history: HashMap::new(),
            outputs: HashMap::new(),
        };
        assert_eq!(summary.exit_code(), 0);
        summary
            .issues
            .push(Issue::new("x/y", "bad", Severity::Critical));
        assert!(summary.has_critical());
        assert_eq!(summary.exit_code(), 1);
    }
}
