//! Per-check configuration: the `CheckSpec` and its routing blocks.

use serde::{Deserialize, Serialize};

use crate::event::TriggerEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The provider type a check dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Ai,
    Command,
    HttpClient,
    Mcp,
    Workflow,
    Log,
    Memory,
    Noop,
}

impl Default for ProviderKind {
    fn default() -> Self {
        Self::Noop
    }
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Command => "command",
            Self::HttpClient => "http_client",
            Self::Mcp => "mcp",
            Self::Workflow => "workflow",
            Self::Log => "log",
            Self::Memory => "memory",
            Self::Noop => "noop",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run items
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One entry in a `run` / `run_js` / `on_init.run` list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RunItem {
    /// Invoke a named tool with `args = with`; output stored under `as`
    /// (defaults to the tool name).
    Tool {
        tool: String,
        #[serde(default)]
        with: serde_json::Map<String, serde_json::Value>,
        #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
        store_as: Option<String>,
    },
    /// Invoke an existing check as a helper step.
    Step {
        step: String,
        #[serde(default)]
        with: serde_json::Map<String, serde_json::Value>,
        #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
        store_as: Option<String>,
    },
    /// Invoke a reusable workflow; `with` becomes workflow inputs.
    Workflow {
        workflow: String,
        #[serde(default)]
        with: serde_json::Map<String, serde_json::Value>,
        #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
        store_as: Option<String>,
        #[serde(default)]
        overrides: serde_json::Map<String, serde_json::Value>,
        #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
        output_mapping: std::collections::HashMap<String, String>,
    },
    /// Invoke an existing check by id.
    Check(String),
}

impl RunItem {
    /// The key this item's output is stored under, when it produces one.
    pub fn output_key(&self) -> Option<String> {
        match self {
            Self::Tool { tool, store_as, .. } => {
                Some(store_as.clone().unwrap_or_else(|| tool.clone()))
            }
            Self::Step { step, store_as, .. } => {
                Some(store_as.clone().unwrap_or_else(|| step.clone()))
            }
            Self::Workflow {
                workflow, store_as, ..
            } => Some(store_as.clone().unwrap_or_else(|| workflow.clone())),
            Self::Check(_) => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry & backoff
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffMode {
    Linear,
    Exponential,
}

impl Default for BackoffMode {
    fn default() -> Self {
        Self::Linear
    }
}

fn default_backoff_delay_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Backoff {
    #[serde(default)]
    pub mode: BackoffMode,
    #[serde(default = "default_backoff_delay_ms")]
    pub delay_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            mode: BackoffMode::default(),
            delay_ms: default_backoff_delay_ms(),
        }
    }
}

impl Backoff {
    /// Delay before retry attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let ms = match self.mode {
            BackoffMode::Linear => self.delay_ms.saturating_mul(attempt as u64),
            BackoffMode::Exponential => {
                let shift = attempt.saturating_sub(1).min(16);
                self.delay_ms.saturating_mul(1u64 << shift)
            }
        };
        std::time::Duration::from_millis(ms)
    }
}

fn default_retry_max() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySpec {
    /// Maximum retry attempts after the initial run.
    #[serde(default = "default_retry_max")]
    pub max: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max: default_retry_max(),
            backoff: Backoff::default(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routing blocks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `on_success` / `on_fail` — at most one action is applied, in the
/// order `retry`, `goto`, `goto_js`, `run_js`, `run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouteSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run: Vec<RunItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto_js: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_js: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
}

impl RouteSpec {
    pub fn is_empty(&self) -> bool {
        self.run.is_empty()
            && self.goto.is_none()
            && self.goto_js.is_none()
            && self.run_js.is_none()
            && self.retry.is_none()
    }
}

/// `on_init` — items executed sequentially before the check runs; each
/// item's output becomes visible to subsequent items and the main step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OnInit {
    #[serde(default)]
    pub run: Vec<RunItem>,
}

/// `on_finish` — fires exactly once after a forEach fan-out completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OnFinish {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run: Vec<RunItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto_js: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Check spec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One named unit of work.
///
/// Provider-specific fields (`exec`, `prompt`, `url`, ...) are collected
/// into `params`; each provider deserializes its own typed view and
/// rejects specs it cannot handle via `validate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckSpec {
    #[serde(rename = "type", default)]
    pub kind: ProviderKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Events this check runs on. Empty means every event.
    #[serde(default)]
    pub on: Vec<TriggerEvent>,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub if_expr: Option<String>,
    #[serde(rename = "forEach", default)]
    pub for_each: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_if: Option<String>,
    /// Pre-contract: a false `assume` skips the provider entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assume: Option<String>,
    /// Post-contract: a false `guarantee` is a fatal failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guarantee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_init: Option<OnInit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<RouteSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<RouteSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_finish: Option<OnFinish>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Side-effectful checks are never retried automatically.
    #[serde(default)]
    pub critical: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Provider-specific fields, validated by the provider.
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl CheckSpec {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Whether this check is selected by `event`.
    pub fn runs_on(&self, event: TriggerEvent) -> bool {
        self.on.is_empty() || self.on.contains(&event)
    }

    /// Convenience accessor for a string-valued provider param.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_item_untagged_shapes() {
        let plain: RunItem = serde_json::from_str("\"lint\"").unwrap();
        assert_eq!(plain, RunItem::Check("lint".into()));

        let tool: RunItem = serde_json::from_value(serde_json::json!({
            "tool": "fetch-jira",
            "with": { "issue_key": "PROJ-123" },
            "as": "jira",
        }))
        .unwrap();
        match &tool {
            RunItem::Tool { tool, store_as, .. } => {
                assert_eq!(tool, "fetch-jira");
                assert_eq!(store_as.as_deref(), Some("jira"));
            }
            other => panic!("expected Tool, got {other:?}"),
        }

        let wf: RunItem = serde_json::from_value(serde_json::json!({
            "workflow": "deploy",
            "with": { "env": "staging" },
        }))
        .unwrap();
        assert!(matches!(wf, RunItem::Workflow { .. }));
    }

    #[test]
    fn run_item_output_key_defaults() {
        let tool: RunItem =
            serde_json::from_value(serde_json::json!({ "tool": "fetch" })).unwrap();
        assert_eq!(tool.output_key().as_deref(), Some("fetch"));
        let check = RunItem::Check("lint".into());
        assert!(check.output_key().is_none());
    }

    #[test]
    fn backoff_linear_and_exponential() {
        let lin = Backoff {
            mode: BackoffMode::Linear,
            delay_ms: 100,
        };
        assert_eq!(lin.delay_for(1).as_millis(), 100);
        assert_eq!(lin.delay_for(3).as_millis(), 300);

        let exp = Backoff {
            mode: BackoffMode::Exponential,
            delay_ms: 100,
        };
        assert_eq!(exp.delay_for(1).as_millis(), 100);
        assert_eq!(exp.delay_for(2).as_millis(), 200);
        assert_eq!(exp.delay_for(4).as_millis(), 800);
    }

    #[test]
    fn retry_spec_defaults() {
        let r: RetrySpec = serde_json::from_str("{}").unwrap();
        assert_eq!(r.max, 2);
        assert_eq!(r.backoff.mode, BackoffMode::Linear);
        assert_eq!(r.backoff.delay_ms, 200);
    }

    #[test]
    fn check_spec_from_yaml() {
        let yaml = r#"
type: command
exec: "echo hello"
depends_on: [setup]
on: [pr_opened, pr_updated]
forEach: true
fail_if: "output.contains(\"FAIL\")"
tags: [one_shot]
"#;
        let spec: CheckSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.kind, ProviderKind::Command);
        assert_eq!(spec.param_str("exec"), Some("echo hello"));
        assert!(spec.for_each);
        assert!(spec.has_tag("one_shot"));
        assert!(spec.runs_on(TriggerEvent::PrOpened));
        assert!(!spec.runs_on(TriggerEvent::Manual));
    }

    #[test]
    fn empty_on_matches_every_event() {
        let spec = CheckSpec::default();
        assert!(spec.runs_on(TriggerEvent::Manual));
        assert!(spec.runs_on(TriggerEvent::Scheduled));
    }

    #[test]
    fn provider_kind_strings() {
        assert_eq!(ProviderKind::HttpClient.as_str(), "http_client");
        let k: ProviderKind = serde_json::from_str("\"http_client\"").unwrap();
        assert_eq!(k, ProviderKind::HttpClient);
    }
}
