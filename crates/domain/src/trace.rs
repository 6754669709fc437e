//! Routing trace — the ordered record of every routing decision in a run.

use serde::{Deserialize, Serialize};

use crate::scope::Scope;

/// What the router decided to do after a check completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteAction {
    Run,
    Goto,
    Retry,
    GotoJs,
    RunJs,
    Skip,
    Halt,
}

impl RouteAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Goto => "goto",
            Self::Retry => "retry",
            Self::GotoJs => "goto_js",
            Self::RunJs => "run_js",
            Self::Skip => "skip",
            Self::Halt => "halt",
        }
    }
}

/// One entry in the routing trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub from_check: String,
    pub action: RouteAction,
    pub reason: String,
    /// How many routing transitions this scope had consumed when the
    /// action was taken.
    pub loop_depth: u32,
    pub scope: Scope,
}

impl RoutingRecord {
    pub fn new(
        from_check: impl Into<String>,
        action: RouteAction,
        reason: impl Into<String>,
        loop_depth: u32,
        scope: Scope,
    ) -> Self {
        Self {
            from_check: from_check.into(),
            action,
            reason: reason.into(),
            loop_depth,
            scope,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_with_scope_string() {
        let r = RoutingRecord::new(
            "build",
            RouteAction::Goto,
            "on_fail goto fix",
            1,
            Scope::root(),
        );
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["action"], "goto");
        assert_eq!(v["scope"], "root");
        assert_eq!(v["loop_depth"], 1);
    }

    #[test]
    fn action_strings() {
        assert_eq!(RouteAction::GotoJs.as_str(), "goto_js");
        assert_eq!(RouteAction::Halt.as_str(), "halt");
    }
}
