//! Check execution lifecycle and the routing state machine.
//!
//! One executed check moves through: guards (`if`, budgets, upstream
//! state) → `on_init` → `assume` → provider invocation (with retry) →
//! `guarantee` → `fail_if` → output commit → routing (`on_fail` /
//! `on_success`) → forEach fan-out. Every routing transition consumes
//! the per-scope loop budget.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use tokio::sync::{broadcast, Semaphore};

use visor_domain::cancel::CancelToken;
use visor_domain::config::{
    CheckSpec, ProviderKind, RouteSpec, RunItem, VisorConfig,
};
use visor_domain::error::{Error, Result};
use visor_domain::event::EventContext;
use visor_domain::issue::{Issue, Severity};
use visor_domain::review::{OutputValue, ReviewSummary};
use visor_domain::scope::Scope;
use visor_domain::trace::{RouteAction, RoutingRecord};
use visor_memory::MemoryStore;
use visor_sandbox::{EvalOptions, Sandbox, ScopeMap};
use visor_template::TemplateScope;

use crate::events::EngineEvent;
use crate::graph::DependencyGraph;
use crate::outputs::OutputStore;
use crate::provider::{DepResults, ExecContext, ProviderRegistry};
use crate::summary::{CheckOutcome, OutcomeKind};

/// Max nested `on_init` depth.
const MAX_INIT_DEPTH: u32 = 3;
/// Max nested workflow depth across sub-runs.
pub(crate) const MAX_WORKFLOW_DEPTH: usize = 8;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) struct RunState {
    pub config: Arc<VisorConfig>,
    pub graph: DependencyGraph,
    pub registry: Arc<ProviderRegistry>,
    pub outputs: OutputStore,
    pub memory: Arc<MemoryStore>,
    pub event: Arc<EventContext>,
    pub mocks: HashMap<String, ReviewSummary>,
    pub cancel: CancelToken,
    pub events: broadcast::Sender<EngineEvent>,
    /// Bounds concurrent provider invocations.
    pub semaphore: Arc<Semaphore>,
    /// Environment snapshot taken at run start.
    pub env: serde_json::Map<String, serde_json::Value>,
    /// Workflow nesting depth of this run.
    pub depth: usize,

    pub trace: Mutex<Vec<RoutingRecord>>,
    pub records: Mutex<Vec<CheckOutcome>>,
    /// Standalone issues not tied to one execution (budget violations).
    pub extra_issues: Mutex<Vec<Issue>>,
    /// Provider invocations per (check, scope).
    pub run_counts: Mutex<HashMap<(String, Scope), u32>>,
    /// Routing transitions per scope.
    pub routing_counts: Mutex<HashMap<Scope, u32>>,
    /// Terminal outcome per (check, scope), for upstream gating.
    pub outcomes: Mutex<HashMap<(String, Scope), OutcomeKind>>,
    /// on_finish firings per (producer, scope), exposed as `attempt`.
    pub finish_counts: Mutex<HashMap<(String, Scope), u32>>,
    pub fail_if_triggered: AtomicU64,
}

impl RunState {
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn total_runs(&self, check: &str) -> u32 {
        self.run_counts
            .lock()
            .iter()
            .filter(|((c, _), _)| c.as_str() == check)
            .map(|(_, n)| *n)
            .sum()
    }

    fn record(&self, check: &str, scope: &Scope, outcome: OutcomeKind, started: Instant, issues: Vec<Issue>) {
        self.outcomes
            .lock()
            .insert((check.to_string(), scope.clone()), outcome);
        self.records.lock().push(CheckOutcome {
            check: check.to_string(),
            scope: scope.clone(),
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
            issues,
        });
    }

    fn outcome_of(&self, check: &str, scope: &Scope) -> Option<OutcomeKind> {
        let outcomes = self.outcomes.lock();
        let mut cursor = Some(scope.clone());
        while let Some(s) = cursor {
            if let Some(o) = outcomes.get(&(check.to_string(), s.clone())) {
                return Some(*o);
            }
            cursor = s.parent();
        }
        None
    }

    /// Consume one routing transition from `scope`. On an exhausted
    /// budget, attaches the budget issue and refuses further routing.
    fn try_consume_routing(
        &self,
        from_check: &str,
        scope: &Scope,
        action: RouteAction,
        reason: &str,
    ) -> bool {
        let max = self.config.routing.max_loops;
        let mut counts = self.routing_counts.lock();
        let count = counts.entry(scope.clone()).or_insert(0);
        if *count >= max {
            drop(counts);
            tracing::warn!(
                check = from_check,
                scope = %scope,
                max_loops = max,
                "routing budget exceeded"
            );
            self.extra_issues.lock().push(Issue::new(
                format!("{from_check}/routing/max_loops_exceeded"),
                format!("routing budget exceeded after {max} transitions in scope {scope}"),
                Severity::Error,
            ));
            self.trace.lock().push(RoutingRecord::new(
                from_check,
                RouteAction::Halt,
                "routing budget exceeded",
                max,
                scope.clone(),
            ));
            self.emit(EngineEvent::RoutingLoop {
                scope: scope.clone(),
                depth: max,
            });
            return false;
        }
        *count += 1;
        let depth = *count;
        drop(counts);
        let record = RoutingRecord::new(from_check, action, reason, depth, scope.clone());
        self.trace.lock().push(record.clone());
        self.emit(EngineEvent::RoutingAction { record });
        true
    }

    fn push_trace(&self, from_check: &str, action: RouteAction, reason: &str, scope: &Scope) {
        let depth = *self.routing_counts.lock().get(scope).unwrap_or(&0);
        let record = RoutingRecord::new(from_check, action, reason, depth, scope.clone());
        self.trace.lock().push(record.clone());
        self.emit(EngineEvent::RoutingAction { record });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scope building
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) struct ScopeData {
    pub values: ScopeMap,
    pub raw_text: HashMap<String, String>,
}

impl ScopeData {
    pub fn template_scope(&self) -> TemplateScope {
        TemplateScope::new(self.values.clone()).with_raw_text(self.raw_text.clone())
    }
}

/// Smart view of an output: parsed JSON when available, else raw text.
fn smart_value(output: &OutputValue) -> serde_json::Value {
    output
        .as_parsed()
        .unwrap_or_else(|| serde_json::Value::String(output.as_str().into_owned()))
}

pub(crate) fn build_scope(
    state: &RunState,
    scope: &Scope,
    args: &serde_json::Map<String, serde_json::Value>,
    current: Option<&ReviewSummary>,
    failed: bool,
) -> ScopeData {
    let mut values = ScopeMap::new();
    let mut raw_text = HashMap::new();

    let pr = state
        .event
        .pr
        .as_ref()
        .and_then(|pr| serde_json::to_value(pr).ok())
        .unwrap_or(serde_json::Value::Null);
    let files = pr.get("files").cloned().unwrap_or_else(|| serde_json::json!([]));
    values.insert("pr".into(), pr);
    values.insert("files".into(), files);
    values.insert(
        "event".into(),
        serde_json::Value::String(state.event.event.as_str().to_string()),
    );
    values.insert("env".into(), serde_json::Value::Object(state.env.clone()));

    let mut inputs = serde_json::Map::new();
    for (k, v) in &state.event.inputs {
        inputs.insert(k.clone(), v.clone());
    }
    for (k, v) in args {
        inputs.insert(k.clone(), v.clone());
    }
    values.insert("args".into(), serde_json::Value::Object(inputs));

    let mut outputs = serde_json::Map::new();
    let mut outputs_history = serde_json::Map::new();
    let mut outputs_raw = serde_json::Map::new();
    // Histories exist (possibly empty) for every configured check, so
    // aggregation templates can take lengths before any iteration ran.
    let mut history_ids: std::collections::BTreeSet<String> =
        state.config.checks.keys().cloned().collect();
    history_ids.extend(state.outputs.completed_checks());
    for check in history_ids {
        if let Some(summary) = state.outputs.get(&check, scope) {
            if let Some(output) = &summary.output {
                outputs.insert(check.clone(), smart_value(output));
                if let OutputValue::Text(text) = output {
                    raw_text.insert(check.clone(), text.clone());
                }
            }
        }
        let history: Vec<serde_json::Value> = state
            .outputs
            .history(&check)
            .iter()
            .filter_map(|s| s.output.as_ref().map(smart_value))
            .collect();
        outputs_history.insert(check.clone(), serde_json::Value::Array(history));
        if let Some(raw) = state.outputs.raw(&check) {
            outputs_raw.insert(check, raw);
        }
    }
    values.insert("outputs".into(), serde_json::Value::Object(outputs));
    values.insert(
        "outputs_history".into(),
        serde_json::Value::Object(outputs_history),
    );
    values.insert("outputs_raw".into(), serde_json::Value::Object(outputs_raw));

    values.insert("memory".into(), state.memory.snapshot());

    if let Some(summary) = current {
        values.insert(
            "issues".into(),
            serde_json::to_value(&summary.issues).unwrap_or_default(),
        );
        if let Some(output) = &summary.output {
            values.insert("output".into(), smart_value(output));
        } else {
            values.insert("output".into(), serde_json::Value::Null);
        }
    } else {
        values.insert("issues".into(), serde_json::json!([]));
        values.insert("output".into(), serde_json::Value::Null);
    }
    values.insert("__failed".into(), serde_json::Value::Bool(failed));

    ScopeData { values, raw_text }
}

/// Environment variables captured once per run.
pub(crate) fn env_snapshot() -> serde_json::Map<String, serde_json::Value> {
    std::env::vars()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Check lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Copy)]
pub(crate) struct ExecFlags {
    /// Reached via a routing action rather than initial dispatch.
    pub routed: bool,
    /// Nested on_init depth so far.
    pub init_depth: u32,
}

impl ExecFlags {
    pub fn initial() -> Self {
        Self {
            routed: false,
            init_depth: 0,
        }
    }

    pub fn routed() -> Self {
        Self {
            routed: true,
            init_depth: 0,
        }
    }
}

/// Execute one check in one scope, including its routing and fan-out.
pub(crate) fn run_check_tree(
    state: Arc<RunState>,
    check: String,
    scope: Scope,
    flags: ExecFlags,
) -> BoxFuture<'static, OutcomeKind> {
    Box::pin(async move {
        let started = Instant::now();
        let Some(spec) = state.config.checks.get(&check).cloned() else {
            state.record(&check, &scope, OutcomeKind::Skipped, started, Vec::new());
            return OutcomeKind::Skipped;
        };

        // Cancellation: don't start new work.
        if state.cancel.is_cancelled() {
            let issue = Issue::new(
                format!("{check}/cancelled"),
                "run was cancelled before this check executed",
                Severity::Warning,
            );
            state.record(&check, &scope, OutcomeKind::Skipped, started, vec![issue]);
            return OutcomeKind::Skipped;
        }

        // One-shot checks are never routed to twice.
        if flags.routed && spec.has_tag("one_shot") && state.total_runs(&check) > 0 {
            state.push_trace(&check, RouteAction::Skip, "one_shot already executed", &scope);
            return OutcomeKind::Skipped;
        }

        // Fatal upstreams block dependents without continue_on_failure.
        if !spec.continue_on_failure {
            for dep in state.graph.direct_dependencies(&check) {
                if let Some(outcome) = state.outcome_of(dep, &scope) {
                    if outcome.blocks_dependents() {
                        state.push_trace(
                            &check,
                            RouteAction::Skip,
                            &format!("fatal upstream: {dep}"),
                            &scope,
                        );
                        state.record(&check, &scope, OutcomeKind::Blocked, started, Vec::new());
                        return OutcomeKind::Blocked;
                    }
                }
            }
        }

        // `if` guard.
        if let Some(if_expr) = &spec.if_expr {
            let data = build_scope(&state, &scope, &serde_json::Map::new(), None, false);
            match Sandbox::eval_bool(if_expr, &data.values, &EvalOptions::expression()) {
                Ok(true) => {}
                Ok(false) => {
                    state.push_trace(&check, RouteAction::Skip, "if condition false", &scope);
                    state.record(&check, &scope, OutcomeKind::Skipped, started, Vec::new());
                    return OutcomeKind::Skipped;
                }
                Err(e) => {
                    let issue = Issue::new(
                        format!("{check}/if_error"),
                        format!("if predicate failed: {e}"),
                        Severity::Error,
                    );
                    state.record(
                        &check,
                        &scope,
                        OutcomeKind::Fatal,
                        started,
                        vec![issue],
                    );
                    return OutcomeKind::Fatal;
                }
            }
        }

        // `on_init` runs before the check; its outputs become visible.
        if let Some(init) = &spec.on_init {
            if flags.init_depth >= MAX_INIT_DEPTH {
                tracing::warn!(check = %check, "on_init nesting too deep, skipping");
            } else if !init.run.is_empty() {
                state.push_trace(&check, RouteAction::Run, "on_init", &scope);
                run_items(
                    state.clone(),
                    check.clone(),
                    scope.clone(),
                    init.run.clone(),
                    flags.init_depth + 1,
                )
                .await;
            }
        }

        // `assume` pre-contract.
        if let Some(assume) = &spec.assume {
            let data = build_scope(&state, &scope, &serde_json::Map::new(), None, false);
            match Sandbox::eval_bool(assume, &data.values, &EvalOptions::expression()) {
                Ok(true) => {}
                Ok(false) => {
                    let issue = Issue::new(
                        format!("{check}/assume_violated"),
                        "pre-contract does not hold, check skipped",
                        Severity::Warning,
                    );
                    state.push_trace(&check, RouteAction::Skip, "assume violated", &scope);
                    state.record(&check, &scope, OutcomeKind::Skipped, started, vec![issue]);
                    return OutcomeKind::Skipped;
                }
                Err(e) => {
                    let issue = Issue::new(
                        format!("{check}/assume_error"),
                        format!("assume predicate failed: {e}"),
                        Severity::Error,
                    );
                    state.record(&check, &scope, OutcomeKind::Fatal, started, vec![issue]);
                    return OutcomeKind::Fatal;
                }
            }
        }

        // Provider invocation with bounded retry.
        let (mut summary, mut fatal) = invoke_provider_with_retry(
            &state, &check, &spec, &scope,
        )
        .await;

        // `guarantee` post-contract.
        if !fatal {
            if let Some(guarantee) = &spec.guarantee {
                let data = build_scope(&state, &scope, &serde_json::Map::new(), Some(&summary), false);
                match Sandbox::eval_bool(guarantee, &data.values, &EvalOptions::expression()) {
                    Ok(true) => {}
                    Ok(false) => {
                        summary.push_issue(Issue::new(
                            format!("{check}/guarantee_violated"),
                            "post-contract does not hold",
                            Severity::Error,
                        ));
                        fatal = true;
                    }
                    Err(e) => {
                        summary.push_issue(Issue::new(
                            format!("{check}/guarantee_error"),
                            format!("guarantee predicate failed: {e}"),
                            Severity::Error,
                        ));
                        fatal = true;
                    }
                }
            }
        }

        // `fail_if` gating: step-level overrides global.
        let fail_if = spec
            .fail_if
            .clone()
            .or_else(|| state.config.fail_if.clone());
        if let Some(expr) = fail_if {
            let data = build_scope(&state, &scope, &serde_json::Map::new(), Some(&summary), fatal);
            match Sandbox::eval_bool(&expr, &data.values, &EvalOptions::expression()) {
                Ok(true) => {
                    state.fail_if_triggered.fetch_add(1, Ordering::Relaxed);
                    summary.push_issue(Issue::new(
                        format!("{check}/fail_if"),
                        format!("fail_if predicate matched: {expr}"),
                        Severity::Error,
                    ));
                    fatal = true;
                }
                Ok(false) => {}
                Err(e) => {
                    // A throwing fail_if is itself a fatal gating error;
                    // alongside existing issues it reports separately.
                    summary.push_issue(Issue::new(
                        format!("{check}/fail_if_error"),
                        format!("fail_if predicate failed: {e}"),
                        Severity::Error,
                    ));
                    fatal = true;
                }
            }
        }

        // forEach output coercion before commit.
        if spec.for_each && !fatal {
            match summary.output.as_ref().and_then(|o| o.as_array()) {
                Some(items) => {
                    state
                        .outputs
                        .set_raw(&check, serde_json::Value::Array(items));
                }
                None => {
                    summary.push_issue(Issue::new(
                        format!("{check}/foreach/not_array"),
                        "forEach output is not an array",
                        Severity::Error,
                    ));
                    fatal = true;
                }
            }
        }

        // Output commit.
        state.outputs.put(&check, &scope, summary.clone());

        let duration_ms = started.elapsed().as_millis() as u64;
        let outcome = if fatal {
            state.emit(EngineEvent::CheckFail {
                check: check.clone(),
                scope: scope.clone(),
                duration_ms,
                issue_count: summary.issues.len(),
            });
            OutcomeKind::Fatal
        } else {
            state.emit(EngineEvent::CheckSuccess {
                check: check.clone(),
                scope: scope.clone(),
                duration_ms,
            });
            OutcomeKind::Success
        };
        state.record(&check, &scope, outcome, started, summary.issues.clone());

        // Routing.
        let route = if fatal {
            spec.on_fail.clone()
        } else {
            spec.on_success.clone()
        };
        if let Some(route) = route {
            apply_route(state.clone(), check.clone(), scope.clone(), route, fatal).await;
        }

        // forEach fan-out.
        if spec.for_each && !fatal {
            fan_out(state.clone(), check.clone(), scope.clone(), spec.clone()).await;
        }

        outcome
    })
}

/// Provider invocation plus the `on_fail.retry` loop. Every invocation
/// counts against `max_runs` for the scope.
async fn invoke_provider_with_retry(
    state: &Arc<RunState>,
    check: &str,
    spec: &CheckSpec,
    scope: &Scope,
) -> (ReviewSummary, bool) {
    let retry = spec.on_fail.as_ref().and_then(|r| r.retry.clone());
    let max_attempts = 1 + retry.as_ref().map(|r| r.max).unwrap_or(0);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        // Budget: each provider invocation counts, whatever its origin.
        let effective_max = spec
            .max_runs
            .unwrap_or(state.config.limits.max_runs_per_check);
        {
            let mut counts = state.run_counts.lock();
            let count = counts
                .entry((check.to_string(), scope.clone()))
                .or_insert(0);
            if *count >= effective_max {
                let issue = Issue::new(
                    format!("{check}/limits/max_runs_exceeded"),
                    format!("check exceeded max_runs ({effective_max}) in scope {scope}"),
                    Severity::Error,
                );
                return (ReviewSummary::with_issues(vec![issue]), true);
            }
            *count += 1;
        }

        state.emit(EngineEvent::CheckStart {
            check: check.to_string(),
            scope: scope.clone(),
            attempt,
        });

        let result = invoke_provider_once(state, check, spec, scope, attempt).await;

        match result {
            Ok(summary) => {
                let fatal = summary.has_fatal_issues();
                return (summary, fatal);
            }
            Err(e) => {
                let retriable = e.is_transient() && !spec.critical && attempt < max_attempts;
                if let (true, Some(retry_spec)) = (retriable, retry.as_ref()) {
                    if state.try_consume_routing(
                        check,
                        scope,
                        RouteAction::Retry,
                        &format!("transient provider error: {e}"),
                    ) {
                        let delay = retry_spec.backoff.delay_for(attempt);
                        tracing::debug!(
                            check,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying after transient failure"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                }
                let issue = Issue::new(
                    format!("{check}/provider_error"),
                    e.to_string(),
                    Severity::Error,
                );
                return (ReviewSummary::with_issues(vec![issue]), true);
            }
        }
    }
}

/// One provider call: mock short-circuit, validation, semaphore, and the
/// per-check timeout.
async fn invoke_provider_once(
    state: &Arc<RunState>,
    check: &str,
    spec: &CheckSpec,
    scope: &Scope,
    attempt: u32,
) -> Result<ReviewSummary> {
    if let Some(mock) = state.mocks.get(check) {
        return Ok(mock.clone());
    }

    // The workflow kind is engine-internal: a sub-run over a named
    // workflow config.
    if spec.kind == ProviderKind::Workflow {
        return run_workflow_check(state, check, spec, scope).await;
    }

    let provider = state.registry.get(spec.kind).ok_or_else(|| {
        Error::Config(format!(
            "no provider registered for type {}",
            spec.kind.as_str()
        ))
    })?;
    if !provider.validate(spec) {
        return Err(Error::provider(
            provider.name(),
            format!("invalid spec for check {check}"),
            false,
        ));
    }

    let deps = collect_dep_results(state, check, scope);
    let data = build_scope(state, scope, &serde_json::Map::new(), None, false);
    let ctx = ExecContext {
        scope: scope.clone(),
        attempt,
        cancel: state.cancel.clone(),
        memory: state.memory.clone(),
        event: state.event.clone(),
        args: serde_json::Map::new(),
        template_scope: data.template_scope(),
        mock: None,
    };

    let _permit = state
        .semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| Error::Internal("dispatcher semaphore closed".into()))?;

    if state.cancel.is_cancelled() {
        return Err(Error::Cancelled(format!("check {check} not started")));
    }

    let fut = provider.execute(&ctx, spec, &deps);
    match spec.timeout_ms {
        Some(ms) => tokio::time::timeout(std::time::Duration::from_millis(ms), fut)
            .await
            .map_err(|_| Error::provider(provider.name(), format!("timed out after {ms}ms"), true))?,
        None => fut.await,
    }
}

fn collect_dep_results(state: &RunState, check: &str, scope: &Scope) -> DepResults {
    let mut deps = DepResults::new();
    for dep in state.graph.direct_dependencies(check) {
        if let Some(summary) = state.outputs.get(dep, scope) {
            deps.insert(dep.clone(), summary);
        }
        let is_foreach = state
            .config
            .checks
            .get(dep)
            .map(|s| s.for_each)
            .unwrap_or(false);
        if is_foreach {
            if let Some(raw) = state.outputs.raw(dep) {
                deps.insert(format!("{dep}-raw"), ReviewSummary::with_output(raw));
            }
        }
    }
    deps
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Apply at most one `on_success`/`on_fail` action, in the priority
/// order `goto`, `goto_js`, `run_js`, `run` (retry is consumed inside
/// the provider loop).
async fn apply_route(
    state: Arc<RunState>,
    check: String,
    scope: Scope,
    route: RouteSpec,
    failed: bool,
) {
    if let Some(target) = &route.goto {
        if state.try_consume_routing(&check, &scope, RouteAction::Goto, &format!("goto {target}")) {
            goto_target(state, &check, target, &scope).await;
        }
        return;
    }

    if let Some(expr) = &route.goto_js {
        let summary = state.outputs.get(&check, &scope);
        let data = build_scope(&state, &scope, &serde_json::Map::new(), summary.as_ref(), failed);
        match Sandbox::eval(expr, &data.values, &EvalOptions::script()) {
            Ok(serde_json::Value::Null) => {
                state.push_trace(&check, RouteAction::GotoJs, "returned null, done", &scope);
            }
            Ok(serde_json::Value::String(target)) => {
                if state.try_consume_routing(
                    &check,
                    &scope,
                    RouteAction::GotoJs,
                    &format!("goto_js -> {target}"),
                ) {
                    goto_target(state, &check, &target, &scope).await;
                }
            }
            Ok(other) => {
                tracing::warn!(check = %check, value = %other, "goto_js returned non-string");
                state.push_trace(&check, RouteAction::GotoJs, "non-string result ignored", &scope);
            }
            Err(e) => {
                state
                    .extra_issues
                    .lock()
                    .push(Issue::new(
                        format!("{check}/goto_js_error"),
                        format!("goto_js failed: {e}"),
                        Severity::Error,
                    ));
            }
        }
        return;
    }

    if let Some(expr) = &route.run_js {
        let summary = state.outputs.get(&check, &scope);
        let data = build_scope(&state, &scope, &serde_json::Map::new(), summary.as_ref(), failed);
        match Sandbox::eval(expr, &data.values, &EvalOptions::script()) {
            Ok(value) => {
                let items = parse_run_items(&value);
                if items.is_empty() {
                    state.push_trace(&check, RouteAction::RunJs, "no run items", &scope);
                } else if state.try_consume_routing(
                    &check,
                    &scope,
                    RouteAction::RunJs,
                    &format!("{} run item(s)", items.len()),
                ) {
                    run_items(state.clone(), check.clone(), scope.clone(), items, 0).await;
                }
            }
            Err(e) => {
                state.extra_issues.lock().push(Issue::new(
                    format!("{check}/run_js_error"),
                    format!("run_js failed: {e}"),
                    Severity::Error,
                ));
            }
        }
        return;
    }

    if !route.run.is_empty()
        && state.try_consume_routing(
            &check,
            &scope,
            RouteAction::Run,
            &format!("{} run item(s)", route.run.len()),
        )
    {
        run_items(state.clone(), check.clone(), scope.clone(), route.run.clone(), 0).await;
    }
}

/// `goto`: the target must exist and must not be downstream of the
/// router (ancestors and siblings only). After the target re-runs, its
/// direct dependents forward-run unless another upstream is still fatal.
async fn goto_target(state: Arc<RunState>, from_check: &str, target: &str, scope: &Scope) {
    if !state.config.checks.contains_key(target) || !state.graph.contains(target) {
        state.extra_issues.lock().push(Issue::new(
            format!("{from_check}/routing/invalid_goto_target"),
            format!("goto target does not exist: {target}"),
            Severity::Error,
        ));
        return;
    }
    if state.graph.is_downstream_of(target, from_check) {
        state.extra_issues.lock().push(Issue::new(
            format!("{from_check}/routing/invalid_goto_target"),
            format!("goto target {target} is downstream of {from_check}"),
            Severity::Error,
        ));
        return;
    }

    let outcome = run_check_tree(
        state.clone(),
        target.to_string(),
        scope.clone(),
        ExecFlags::routed(),
    )
    .await;

    if outcome != OutcomeKind::Success {
        return;
    }

    // Forward-run direct dependents only; skip any with another fatal
    // upstream.
    for dependent in state.graph.direct_dependents(target).to_vec() {
        let blocked = state
            .graph
            .direct_dependencies(&dependent)
            .iter()
            .filter(|d| d.as_str() != target)
            .any(|d| {
                state
                    .outcome_of(d, scope)
                    .map(|o| o.blocks_dependents())
                    .unwrap_or(false)
            });
        if blocked {
            state.push_trace(
                &dependent,
                RouteAction::Skip,
                "forward-run blocked by fatal upstream",
                scope,
            );
            continue;
        }
        run_check_tree(
            state.clone(),
            dependent,
            scope.clone(),
            ExecFlags::routed(),
        )
        .await;
    }
}

/// Interpret a `run_js` result as run items: a string, a run-item map,
/// or an array of either.
fn parse_run_items(value: &serde_json::Value) -> Vec<RunItem> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect(),
        serde_json::Value::String(_) | serde_json::Value::Object(_) => {
            serde_json::from_value(value.clone()).into_iter().collect()
        }
        _ => Vec::new(),
    }
}

/// Execute run items sequentially; each item's output is visible to
/// subsequent items via the output store.
pub(crate) fn run_items(
    state: Arc<RunState>,
    from_check: String,
    scope: Scope,
    items: Vec<RunItem>,
    init_depth: u32,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        for item in items {
            if state.cancel.is_cancelled() {
                return;
            }
            match item {
                RunItem::Check(id) => {
                    run_check_tree(
                        state.clone(),
                        id,
                        scope.clone(),
                        ExecFlags {
                            routed: true,
                            init_depth,
                        },
                    )
                    .await;
                }
                RunItem::Tool {
                    tool,
                    with,
                    store_as,
                } => {
                    let key = store_as.unwrap_or_else(|| tool.clone());
                    match run_helper(&state, HelperKind::Tool, &tool, &with, &scope).await {
                        Ok(summary) => state.outputs.put(&key, &scope, summary),
                        Err(e) => {
                            state.outputs.put(
                                &key,
                                &scope,
                                ReviewSummary::with_issues(vec![Issue::new(
                                    format!("{from_check}/tool/{tool}"),
                                    e.to_string(),
                                    Severity::Error,
                                )]),
                            );
                        }
                    }
                }
                RunItem::Step {
                    step,
                    with,
                    store_as,
                } => {
                    let key = store_as.unwrap_or_else(|| step.clone());
                    match run_helper(&state, HelperKind::Step, &step, &with, &scope).await {
                        Ok(summary) => state.outputs.put(&key, &scope, summary),
                        Err(e) => {
                            state.outputs.put(
                                &key,
                                &scope,
                                ReviewSummary::with_issues(vec![Issue::new(
                                    format!("{from_check}/step/{step}"),
                                    e.to_string(),
                                    Severity::Error,
                                )]),
                            );
                        }
                    }
                }
                RunItem::Workflow {
                    workflow,
                    with,
                    store_as,
                    overrides,
                    output_mapping,
                } => {
                    let key = store_as.unwrap_or_else(|| workflow.clone());
                    match run_workflow_item(&state, &workflow, &with, &overrides, &output_mapping)
                        .await
                    {
                        Ok(summary) => state.outputs.put(&key, &scope, summary),
                        Err(e) => {
                            state.outputs.put(
                                &key,
                                &scope,
                                ReviewSummary::with_issues(vec![Issue::new(
                                    format!("{from_check}/workflow/{workflow}"),
                                    e.to_string(),
                                    Severity::Error,
                                )]),
                            );
                        }
                    }
                }
            }
        }
    })
}

enum HelperKind {
    Tool,
    Step,
}

/// Invoke a tool or an existing check as a helper: a direct provider
/// call with `args = with`, no routing.
async fn run_helper(
    state: &Arc<RunState>,
    kind: HelperKind,
    name: &str,
    with: &serde_json::Map<String, serde_json::Value>,
    scope: &Scope,
) -> Result<ReviewSummary> {
    let spec = match kind {
        HelperKind::Tool => state
            .config
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown tool: {name}")))?,
        HelperKind::Step => state
            .config
            .checks
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown step: {name}")))?,
    };

    // Helper steps still count against the check's run budget.
    if matches!(kind, HelperKind::Step) {
        let effective_max = spec
            .max_runs
            .unwrap_or(state.config.limits.max_runs_per_check);
        let mut counts = state.run_counts.lock();
        let count = counts.entry((name.to_string(), scope.clone())).or_insert(0);
        if *count >= effective_max {
            return Err(Error::routing(
                visor_domain::RoutingErrorKind::MaxRunsExceeded,
                format!("step {name} exceeded max_runs in scope {scope}"),
            ));
        }
        *count += 1;
    }

    if let Some(mock) = state.mocks.get(name) {
        return Ok(mock.clone());
    }

    if spec.kind == ProviderKind::Workflow {
        return Err(Error::Config(format!(
            "helper {name} cannot itself be a workflow check"
        )));
    }

    let provider = state.registry.get(spec.kind).ok_or_else(|| {
        Error::Config(format!(
            "no provider registered for type {}",
            spec.kind.as_str()
        ))
    })?;

    let rendered_args = render_args(state, scope, with);
    let data = build_scope(state, scope, &rendered_args, None, false);
    let ctx = ExecContext {
        scope: scope.clone(),
        attempt: 1,
        cancel: state.cancel.clone(),
        memory: state.memory.clone(),
        event: state.event.clone(),
        args: rendered_args,
        template_scope: data.template_scope(),
        mock: None,
    };

    let _permit = state
        .semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| Error::Internal("dispatcher semaphore closed".into()))?;

    let deps = DepResults::new();
    provider.execute(&ctx, &spec, &deps).await
}

/// Render template strings inside `with` values against the current
/// scope before handing them to the helper as `args`.
fn render_args(
    state: &RunState,
    scope: &Scope,
    with: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    let data = build_scope(state, scope, &serde_json::Map::new(), None, false);
    let tpl_scope = data.template_scope();
    let mut rendered = serde_json::Map::new();
    for (k, v) in with {
        rendered.insert(k.clone(), render_value(v, &tpl_scope));
    }
    rendered
}

fn render_value(value: &serde_json::Value, scope: &TemplateScope) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => visor_template::render(s, scope)
            .map(serde_json::Value::String)
            .unwrap_or_else(|_| value.clone()),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| render_value(v, scope)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A `type: workflow` check: `workflow` names the config entry, `with`
/// becomes the sub-run inputs.
async fn run_workflow_check(
    state: &Arc<RunState>,
    check: &str,
    spec: &CheckSpec,
    _scope: &Scope,
) -> Result<ReviewSummary> {
    let name = spec
        .param_str("workflow")
        .ok_or_else(|| Error::Config(format!("check {check} is missing the workflow name")))?;
    let with = spec
        .params
        .get("with")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    let mapping = spec
        .params
        .get("output_mapping")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect::<HashMap<String, String>>()
        })
        .unwrap_or_default();
    run_workflow_item(state, name, &with, &serde_json::Map::new(), &mapping).await
}

/// Invoke a reusable workflow as a sub-run. Overrides merge right-biased
/// onto the named check specs; the merged config is immutable from here.
async fn run_workflow_item(
    state: &Arc<RunState>,
    name: &str,
    with: &serde_json::Map<String, serde_json::Value>,
    overrides: &serde_json::Map<String, serde_json::Value>,
    output_mapping: &HashMap<String, String>,
) -> Result<ReviewSummary> {
    if state.depth >= MAX_WORKFLOW_DEPTH {
        return Err(Error::Internal(format!(
            "workflow nesting exceeded depth {MAX_WORKFLOW_DEPTH}"
        )));
    }
    let workflow = state
        .config
        .workflows
        .get(name)
        .ok_or_else(|| Error::Config(format!("unknown workflow: {name}")))?;

    let mut sub_config = VisorConfig {
        checks: workflow.checks.clone(),
        fail_if: workflow.fail_if.clone(),
        tools: state.config.tools.clone(),
        workflows: state.config.workflows.clone(),
        limits: state.config.limits.clone(),
        routing: state.config.routing.clone(),
        ..Default::default()
    };

    // Right-biased merge of step overrides.
    for (check_id, patch) in overrides {
        if let (Some(existing), Some(patch)) = (sub_config.checks.get_mut(check_id), patch.as_object())
        {
            let mut merged = serde_json::to_value(&*existing)?;
            if let Some(target) = merged.as_object_mut() {
                for (k, v) in patch {
                    target.insert(k.clone(), v.clone());
                }
            }
            *existing = serde_json::from_value(merged)?;
        }
    }

    let mut event = (*state.event).clone();
    let tpl_scope =
        build_scope(state, &Scope::root(), &serde_json::Map::new(), None, false).template_scope();
    for (k, v) in with {
        event.inputs.insert(k.clone(), render_value(v, &tpl_scope));
    }

    let engine = crate::runner::Engine::with_memory(state.registry.clone(), state.memory.clone())
        .at_depth(state.depth + 1);
    let options = crate::runner::RunOptions::new(sub_config).with_event(event);
    let sub = engine.run(options).await?;

    let mut summary = ReviewSummary::default();
    summary.issues = sub.issues.clone();
    let output = if output_mapping.is_empty() {
        serde_json::to_value(&sub.outputs)?
    } else {
        let mut mapped = serde_json::Map::new();
        for (key, check_id) in output_mapping {
            mapped.insert(
                key.clone(),
                sub.outputs
                    .get(check_id)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            );
        }
        serde_json::Value::Object(mapped)
    };
    summary.output = Some(OutputValue::Json(output));
    Ok(summary)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// forEach fan-out
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One fan-out round for a producer that just committed an array.
///
/// Direct dependents run once per item in an isolated child scope; when
/// every iteration has terminated, `on_finish` fires exactly once.
/// `on_finish.goto_js` may re-run the producer, which starts a fresh
/// round with its own `on_finish`, bounded by the routing budget.
async fn fan_out(state: Arc<RunState>, producer: String, scope: Scope, spec: CheckSpec) {
    let items = state
        .outputs
        .raw(&producer)
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();

    // Direct dependents, ordered so in-scope dependencies between them
    // are satisfied.
    let mut dependents: Vec<String> = state.graph.direct_dependents(&producer).to_vec();
    dependents.sort_by_key(|d| {
        (
            state.graph.node(d).map(|n| n.depth).unwrap_or(0),
            d.clone(),
        )
    });

    if !items.is_empty() && !dependents.is_empty() {
        let mut iteration_futures = Vec::new();
        for (index, item) in items.iter().enumerate() {
            let child = scope.child(producer.clone(), index);
            // Bind the producer's output to this item inside the child
            // scope before any dependent reads it.
            state.outputs.scoped_bind(
                &producer,
                &child,
                ReviewSummary::with_output(OutputValue::Json(item.clone())),
            );

            let state = state.clone();
            let deps = dependents.clone();
            iteration_futures.push(async move {
                // Dependents of one item run in dependency order.
                for dependent in deps {
                    run_check_tree(
                        state.clone(),
                        dependent,
                        child.clone(),
                        ExecFlags::initial(),
                    )
                    .await;
                }
            });
        }
        join_all(iteration_futures).await;
    } else if items.is_empty() {
        tracing::debug!(producer = %producer, "forEach produced an empty array, dependents skipped");
    }

    // on_finish fires exactly once per round.
    let Some(finish) = spec.on_finish.clone() else {
        return;
    };
    let attempt = {
        let mut counts = state.finish_counts.lock();
        let count = counts
            .entry((producer.clone(), scope.clone()))
            .or_insert(0);
        let current = *count;
        *count += 1;
        current
    };

    if !finish.run.is_empty() {
        state.push_trace(&producer, RouteAction::Run, "on_finish", &scope);
        run_items(
            state.clone(),
            producer.clone(),
            scope.clone(),
            finish.run.clone(),
            0,
        )
        .await;
    }

    if let Some(expr) = &finish.goto_js {
        let summary = state.outputs.get(&producer, &scope);
        let mut data = build_scope(&state, &scope, &serde_json::Map::new(), summary.as_ref(), false);
        data.values.insert(
            "attempt".into(),
            serde_json::Value::Number(attempt.into()),
        );
        match Sandbox::eval(expr, &data.values, &EvalOptions::script()) {
            Ok(serde_json::Value::Null) => {
                state.push_trace(&producer, RouteAction::GotoJs, "returned null, fan-out done", &scope);
            }
            Ok(serde_json::Value::String(target)) => {
                if state.try_consume_routing(
                    &producer,
                    &scope,
                    RouteAction::GotoJs,
                    &format!("on_finish goto_js -> {target}"),
                ) {
                    if target == producer {
                        run_check_tree(
                            state.clone(),
                            target,
                            scope.clone(),
                            ExecFlags::routed(),
                        )
                        .await;
                    } else {
                        goto_target(state.clone(), &producer, &target, &scope).await;
                    }
                }
            }
            Ok(other) => {
                tracing::warn!(producer = %producer, value = %other, "on_finish goto_js returned non-string");
            }
            Err(e) => {
                state.extra_issues.lock().push(Issue::new(
                    format!("{producer}/on_finish/goto_js_error"),
                    format!("on_finish goto_js failed: {e}"),
                    Severity::Error,
                ));
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wave dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drive the planned waves. Checks driven by a forEach dependency are
/// executed inside the producer's fan-out, not at root.
pub(crate) async fn run_waves(state: Arc<RunState>) {
    for wave in state.graph.waves().to_vec() {
        let root_checks: Vec<String> = wave
            .into_iter()
            .filter(|check| !is_fanout_driven(&state, check))
            .collect();

        let futures: Vec<_> = root_checks
            .into_iter()
            .map(|check| {
                run_check_tree(state.clone(), check, Scope::root(), ExecFlags::initial())
            })
            .collect();
        join_all(futures).await;
    }
}

fn is_fanout_driven(state: &RunState, check: &str) -> bool {
    state
        .graph
        .direct_dependencies(check)
        .iter()
        .any(|dep| {
            state
                .config
                .checks
                .get(dep)
                .map(|s| s.for_each)
                .unwrap_or(false)
        })
}

/// Skip markers shared with the graph planner.
pub(crate) fn unexecuted_checks(state: &RunState, selected: &HashSet<String>) -> Vec<String> {
    let outcomes = state.outcomes.lock();
    let mut missing: Vec<String> = selected
        .iter()
        .filter(|id| !outcomes.keys().any(|(c, _)| c == *id))
        .cloned()
        .collect();
    missing.sort();
    missing
}
