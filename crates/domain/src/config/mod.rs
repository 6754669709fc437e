//! Run configuration — the immutable per-run mapping of checks plus
//! global limits, routing budgets, and ambient settings.

mod check;

pub use check::*;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisorConfig {
    /// check_id → spec. Identifiers are non-empty and unique by map shape.
    #[serde(default)]
    pub checks: HashMap<String, CheckSpec>,
    /// Named helper actions invocable from `run` items (`{ tool: … }`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tools: HashMap<String, CheckSpec>,
    /// Reusable workflows invocable from `run` items and `workflow` checks.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub workflows: HashMap<String, WorkflowConfig>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Global gating predicate; a step-level `fail_if` overrides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_if: Option<String>,
    #[serde(default)]
    pub memory: MemoryPersistConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub schedules: SchedulesConfig,
}

/// A reusable sub-graph of checks. Invoked with `with` inputs; step
/// `overrides` merge right-biased onto the named check specs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub checks: HashMap<String, CheckSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_if: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Limits & routing budgets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn default_max_runs_per_check() -> u32 {
    50
}

fn default_max_parallelism() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Per-scope ceiling on provider invocations for one check.
    #[serde(default = "default_max_runs_per_check")]
    pub max_runs_per_check: u32,
    /// Dispatcher parallelism cap within a wave.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Cap on per-check history entries. Unbounded within one run when
    /// unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_history_per_check: Option<usize>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_runs_per_check: default_max_runs_per_check(),
            max_parallelism: default_max_parallelism(),
            max_history_per_check: None,
        }
    }
}

fn default_max_loops() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Per-scope ceiling on routing transitions. 0 disables rescheduling.
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_loops: default_max_loops(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ambient settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryFormat {
    Json,
    Csv,
}

impl Default for MemoryFormat {
    fn default() -> Self {
        Self::Json
    }
}

/// Optional on-disk snapshot of the memory store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryPersistConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub format: MemoryFormat,
}

/// NDJSON telemetry fallback file (one JSON object per engine event).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_schedule_db_path() -> PathBuf {
    PathBuf::from("visor-schedules.db")
}

fn default_tick_secs() -> u64 {
    10
}

fn default_lock_ttl_secs() -> u64 {
    60
}

fn default_max_per_creator() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulesConfig {
    #[serde(default = "default_schedule_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Per-creator ceiling enforced by `validate_limits`.
    #[serde(default = "default_max_per_creator")]
    pub max_per_creator: u32,
}

impl Default for SchedulesConfig {
    fn default() -> Self {
        Self {
            db_path: default_schedule_db_path(),
            tick_secs: default_tick_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            max_per_creator: default_max_per_creator(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl VisorConfig {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good. Cycle detection
    /// is the dependency graph's job; this pass catches everything that
    /// can be seen per check.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        for (id, spec) in &self.checks {
            if id.is_empty() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: "checks".into(),
                    message: "check id must not be empty".into(),
                });
                continue;
            }

            for dep in &spec.depends_on {
                if !self.checks.contains_key(dep) {
                    issues.push(ConfigIssue {
                        severity: ConfigSeverity::Error,
                        field: format!("checks.{id}.depends_on"),
                        message: format!("unknown dependency: {dep}"),
                    });
                }
            }

            for (block, route) in [("on_success", &spec.on_success), ("on_fail", &spec.on_fail)] {
                let Some(route) = route else { continue };
                if let Some(target) = &route.goto {
                    if !self.checks.contains_key(target) {
                        issues.push(ConfigIssue {
                            severity: ConfigSeverity::Error,
                            field: format!("checks.{id}.{block}.goto"),
                            message: format!("unknown goto target: {target}"),
                        });
                    }
                }
                self.validate_run_items(id, block, &route.run, &mut issues);
                if route.run_js.is_some() {
                    issues.push(ConfigIssue {
                        severity: ConfigSeverity::Warning,
                        field: format!("checks.{id}.{block}.run_js"),
                        message: "workflows launched from run_js do not forward-run \
                                  their failure chains into this graph"
                            .into(),
                    });
                }
            }

            if let Some(init) = &spec.on_init {
                self.validate_run_items(id, "on_init", &init.run, &mut issues);
            }
            if let Some(finish) = &spec.on_finish {
                self.validate_run_items(id, "on_finish", &finish.run, &mut issues);
                if !spec.for_each {
                    issues.push(ConfigIssue {
                        severity: ConfigSeverity::Warning,
                        field: format!("checks.{id}.on_finish"),
                        message: "on_finish only fires for forEach producers".into(),
                    });
                }
            }
        }

        issues
    }

    fn validate_run_items(
        &self,
        check_id: &str,
        block: &str,
        items: &[RunItem],
        issues: &mut Vec<ConfigIssue>,
    ) {
        for item in items {
            let (target, known) = match item {
                RunItem::Check(id) => (id, self.checks.contains_key(id)),
                RunItem::Step { step, .. } => (step, self.checks.contains_key(step)),
                RunItem::Tool { tool, .. } => (tool, self.tools.contains_key(tool)),
                RunItem::Workflow { workflow, .. } => {
                    (workflow, self.workflows.contains_key(workflow))
                }
            };
            if !known {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: format!("checks.{check_id}.{block}.run"),
                    message: format!("unknown run target: {target}"),
                });
            }
        }
    }

    /// True when validation produced no errors (warnings allowed).
    pub fn is_valid(&self) -> bool {
        !self
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error)
    }
}
