//! End-to-end engine scenarios: sequential preprocessing, forEach
//! fan-out with aggregation, retry loops through on_finish, fail_if
//! gating, and loop budgets.

use std::sync::Arc;

use visor_domain::config::VisorConfig;
use visor_domain::trace::RouteAction;
use visor_engine::{Engine, OutcomeKind, RunOptions, RunSummary};

fn config(yaml: &str) -> VisorConfig {
    serde_yaml::from_str(yaml).expect("test config parses")
}

async fn run(yaml: &str) -> RunSummary {
    let engine = Engine::new(Arc::new(visor_providers::builtin_registry()));
    engine
        .run(RunOptions::new(config(yaml)))
        .await
        .expect("run completes")
}

fn executions(summary: &RunSummary, check: &str) -> usize {
    summary
        .checks
        .iter()
        .filter(|c| {
            c.check == check
                && matches!(c.outcome, OutcomeKind::Success | OutcomeKind::Fatal)
        })
        .count()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: sequential preprocessing via on_init
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn on_init_tool_output_visible_to_check() {
    let summary = run(r#"
tools:
  fetch_jira:
    type: noop
    output: { issue_key: "PROJ-123", status: "Open" }
checks:
  ai_review:
    type: noop
    output: "ticket={{ outputs.jira.issue_key }} status={{ outputs.jira.status }}"
    on_init:
      run:
        - { tool: fetch_jira, with: { issue_key: "PROJ-123" }, as: jira }
"#)
    .await;

    assert_eq!(
        summary.outputs["ai_review"],
        serde_json::json!("ticket=PROJ-123 status=Open")
    );
    assert_eq!(executions(&summary, "ai_review"), 1, "check runs exactly once");

    let init_actions: Vec<_> = summary
        .routing
        .iter()
        .filter(|r| r.action == RouteAction::Run && r.reason == "on_init")
        .collect();
    assert_eq!(init_actions.len(), 1, "one on_init run item in the trace");
    assert!(summary.issues.is_empty());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: forEach fan-out + aggregation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn foreach_fans_out_and_aggregates() {
    let summary = run(r#"
checks:
  fetch_items:
    type: noop
    forEach: true
    output: [{ id: 1 }, { id: 2 }, { id: 3 }]
    on_finish:
      run: [aggregate_validations]
  process_item:
    type: noop
    depends_on: [fetch_items]
    output: "processed {{ outputs.fetch_items.id }}"
  aggregate_validations:
    type: noop
    on: [pr_closed]
    output: "aggregated {{ outputs_history.process_item | length }}"
"#)
    .await;

    assert_eq!(executions(&summary, "process_item"), 3, "one run per item");
    assert_eq!(executions(&summary, "aggregate_validations"), 1, "on_finish fires once");
    assert_eq!(summary.history["process_item"].len(), 3);
    assert_eq!(
        summary.outputs["aggregate_validations"],
        serde_json::json!("aggregated 3")
    );

    // Each iteration saw its own item.
    let outputs: Vec<String> = summary.history["process_item"]
        .iter()
        .map(|s| s.output.as_ref().unwrap().as_str().into_owned())
        .collect();
    assert!(outputs.contains(&"processed 1".to_string()));
    assert!(outputs.contains(&"processed 2".to_string()));
    assert!(outputs.contains(&"processed 3".to_string()));
}

#[tokio::test]
async fn foreach_empty_array_skips_dependents_but_fires_on_finish() {
    let summary = run(r#"
checks:
  fetch_items:
    type: noop
    forEach: true
    output: []
    on_finish:
      run: [note]
  process_item:
    type: noop
    depends_on: [fetch_items]
    output: "never"
  note:
    type: noop
    on: [pr_closed]
    output: "finished with {{ outputs_history.process_item | length }} iterations"
"#)
    .await;

    assert_eq!(executions(&summary, "process_item"), 0);
    assert_eq!(executions(&summary, "note"), 1);
    assert_eq!(
        summary.outputs["note"],
        serde_json::json!("finished with 0 iterations")
    );
    assert!(summary.history.get("process_item").map(|h| h.len()).unwrap_or(0) == 0);
}

#[tokio::test]
async fn foreach_non_array_output_is_fatal() {
    let summary = run(r#"
checks:
  fetch_items:
    type: noop
    forEach: true
    output: "not an array"
"#)
    .await;

    assert_eq!(summary.stats.failure_count, 1);
    assert!(summary
        .issues
        .iter()
        .any(|i| i.rule_id == "fetch_items/foreach/not_array"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: retry via on_finish goto_js with memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn on_finish_goto_js_reruns_producer_once() {
    let engine = Engine::new(Arc::new(visor_providers::builtin_registry()));
    let summary = engine
        .run(RunOptions::new(config(r#"
checks:
  produce:
    type: noop
    forEach: true
    output: [{ status: "pending" }]
    on_finish:
      goto_js: |
        if attempt == 0 { "produce" } else { () }
  mark:
    type: memory
    depends_on: [produce]
    op: increment
    key: iterations
"#)))
        .await
        .expect("run completes");

    assert_eq!(executions(&summary, "produce"), 2, "producer re-ran once");
    assert_eq!(executions(&summary, "mark"), 2);
    assert_eq!(
        engine.memory().get(visor_memory::DEFAULT_NAMESPACE, "iterations"),
        Some(serde_json::json!(2))
    );
    assert_eq!(summary.stats.failure_count, 0, "no fatal issues");
    assert!(
        !summary
            .issues
            .iter()
            .any(|i| i.rule_id.contains("max_loops")),
        "loop budget not exceeded"
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: fail_if gating
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn global_fail_if_gates_and_blocks_dependents() {
    let summary = run(r#"
fail_if: "criticalIssues > 0"
checks:
  scan:
    type: noop
    issues:
      - { rule_id: "sec/secret", message: "hardcoded credential", severity: critical, file: "src/auth.rs", line: 3 }
  report:
    type: noop
    depends_on: [scan]
    output: "should not run"
  always_report:
    type: noop
    depends_on: [scan]
    continue_on_failure: true
    output: "ran anyway"
"#)
    .await;

    assert!(summary.stats.failure_count >= 1);
    assert_eq!(summary.stats.fail_if_triggered, 1);
    assert!(summary.issues.iter().any(|i| i.rule_id == "scan/fail_if"));

    let report = summary.checks.iter().find(|c| c.check == "report").unwrap();
    assert_eq!(report.outcome, OutcomeKind::Blocked);

    let always = summary
        .checks
        .iter()
        .find(|c| c.check == "always_report")
        .unwrap();
    assert_eq!(always.outcome, OutcomeKind::Success);

    assert!(summary.has_critical());
    assert_eq!(summary.exit_code(), 1);
}

#[tokio::test]
async fn step_fail_if_overrides_global() {
    let summary = run(r#"
fail_if: "criticalIssues > 0"
checks:
  lenient:
    type: noop
    fail_if: "false"
    issues:
      - { rule_id: "sec/x", message: "bad", severity: critical }
"#)
    .await;

    // The step-level predicate never fires, but critical issues alone
    // still make the check fatal.
    assert_eq!(summary.stats.fail_if_triggered, 0);
    assert!(!summary.issues.iter().any(|i| i.rule_id == "lenient/fail_if"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: loop budget exceeded
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn routing_budget_bounds_on_finish_loop() {
    let summary = run(r#"
routing:
  max_loops: 3
checks:
  cycle:
    type: noop
    forEach: true
    output: [1]
    on_finish:
      goto_js: "\"cycle\""
"#)
    .await;

    let transitions = summary
        .routing
        .iter()
        .filter(|r| r.action == RouteAction::GotoJs && r.from_check == "cycle")
        .count();
    assert!(transitions <= 3, "at most max_loops transitions, got {transitions}");
    assert!(summary
        .issues
        .iter()
        .any(|i| i.rule_id == "cycle/routing/max_loops_exceeded"));
    // Initial run + one per allowed transition.
    assert_eq!(executions(&summary, "cycle"), 4);
}

#[tokio::test]
async fn max_loops_zero_disables_routing() {
    let summary = run(r#"
routing:
  max_loops: 0
checks:
  first:
    type: noop
    output: "ok"
    on_success:
      run: [second]
  second:
    type: noop
    on: [pr_closed]
    output: "routed"
"#)
    .await;

    assert_eq!(executions(&summary, "second"), 0, "no rescheduling at all");
    assert!(summary
        .routing
        .iter()
        .any(|r| r.action == RouteAction::Halt));
}
