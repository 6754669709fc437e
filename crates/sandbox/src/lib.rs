//! Predicate sandbox — compiles and runs untrusted expressions with a
//! fixed global surface and a hard time budget.
//!
//! Scripts see only the scope values handed to [`Sandbox::eval`] plus the
//! registered helper functions. No filesystem, network, or process
//! packages exist in the engine, so scripts cannot reach them; a small
//! identifier denylist catches attempts to smuggle an evaluator in.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use visor_domain::error::{Error, PredicateErrorKind, Result};
use visor_domain::event::AuthorAssociation;
use visor_domain::issue::Severity;

/// Scope handed to an evaluation: top-level variable name → JSON value.
pub type ScopeMap = serde_json::Map<String, serde_json::Value>;

/// Collected `log(...)` output from one evaluation.
pub type LogSink = Arc<Mutex<Vec<String>>>;

fn default_timeout_ms() -> u64 {
    1000
}

/// Options for one evaluation.
#[derive(Clone, Default)]
pub struct EvalOptions {
    /// Wall-clock budget; zero means the default (1000 ms).
    pub timeout_ms: u64,
    /// When true the source is a full script (statements allowed);
    /// otherwise it must be a single expression.
    pub wrap_function: bool,
    /// When set, `log(...)` calls are captured here as well as traced.
    pub log_sink: Option<LogSink>,
}

impl EvalOptions {
    pub fn expression() -> Self {
        Self::default()
    }

    pub fn script() -> Self {
        Self {
            wrap_function: true,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    fn budget(&self) -> Duration {
        let ms = if self.timeout_ms == 0 {
            default_timeout_ms()
        } else {
            self.timeout_ms
        };
        Duration::from_millis(ms)
    }
}

/// Identifiers that are never allowed to appear in user scripts.
const DENIED_IDENTIFIERS: &[&str] = &["eval", "import", "require", "process", "Deno"];

/// Stateless evaluator. Each call builds a fresh engine so evaluations
/// never share state and can run on any thread.
pub struct Sandbox;

impl Sandbox {
    /// Evaluate `source` over `scope`, returning the resulting value.
    pub fn eval(source: &str, scope: &ScopeMap, opts: &EvalOptions) -> Result<serde_json::Value> {
        if let Some(denied) = find_denied_identifier(source) {
            return Err(Error::predicate(
                PredicateErrorKind::Blocked,
                format!("blocked identifier: {denied}"),
            ));
        }

        let mut engine = rhai::Engine::new();
        engine.disable_symbol("eval");
        let deadline = Instant::now() + opts.budget();
        engine.on_progress(move |_| {
            if Instant::now() >= deadline {
                Some(rhai::Dynamic::from("timeout"))
            } else {
                None
            }
        });

        register_builtins(&mut engine, scope, opts.log_sink.clone());

        let mut rhai_scope = rhai::Scope::new();
        for (key, value) in scope {
            let dynamic = rhai::serde::to_dynamic(value)
                .map_err(|e| Error::predicate(PredicateErrorKind::Runtime, e.to_string()))?;
            rhai_scope.push_dynamic(key.as_str(), dynamic);
        }
        push_issue_counters(&mut rhai_scope, scope);

        let result = if opts.wrap_function {
            engine.eval_with_scope::<rhai::Dynamic>(&mut rhai_scope, source)
        } else {
            engine.eval_expression_with_scope::<rhai::Dynamic>(&mut rhai_scope, source)
        };

        match result {
            Ok(value) => rhai::serde::from_dynamic(&value)
                .map_err(|e| Error::predicate(PredicateErrorKind::Runtime, e.to_string())),
            Err(err) => Err(classify_rhai_error(*err)),
        }
    }

    /// Evaluate a gating predicate. Non-bool results are truthy-coerced:
    /// `null`/`""`/`0`/`false` are false, everything else true.
    pub fn eval_bool(source: &str, scope: &ScopeMap, opts: &EvalOptions) -> Result<bool> {
        Ok(truthy(&Self::eval(source, scope, opts)?))
    }
}

/// JS-style truthiness over JSON values.
pub fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}

fn find_denied_identifier(source: &str) -> Option<&'static str> {
    for denied in DENIED_IDENTIFIERS {
        let mut search = source;
        while let Some(pos) = search.find(denied) {
            let before_ok = pos == 0
                || !search[..pos]
                    .chars()
                    .next_back()
                    .map(|c| c.is_alphanumeric() || c == '_')
                    .unwrap_or(false);
            let after = &search[pos + denied.len()..];
            let after_ok = !after
                .chars()
                .next()
                .map(|c| c.is_alphanumeric() || c == '_')
                .unwrap_or(false);
            if before_ok && after_ok {
                return Some(denied);
            }
            search = &search[pos + denied.len()..];
        }
    }
    None
}

fn classify_rhai_error(err: rhai::EvalAltResult) -> Error {
    use rhai::EvalAltResult::*;
    match &err {
        ErrorParsing(..) => Error::predicate(PredicateErrorKind::Syntax, err.to_string()),
        ErrorTerminated(..) => Error::predicate(
            PredicateErrorKind::Timeout,
            "evaluation exceeded its time budget",
        ),
        _ => Error::predicate(PredicateErrorKind::Runtime, err.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-ins
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Derived per-severity counters pushed as plain variables so predicates
/// can write `criticalIssues > 0`.
fn push_issue_counters(rhai_scope: &mut rhai::Scope<'_>, scope: &ScopeMap) {
    let issues = scope_issues(scope);
    let count = |sev: Severity| issues.iter().filter(|i| issue_severity(i) == sev).count() as i64;
    rhai_scope.push_constant("totalIssues", issues.len() as i64);
    rhai_scope.push_constant("criticalIssues", count(Severity::Critical));
    rhai_scope.push_constant("errorIssues", count(Severity::Error));
    rhai_scope.push_constant("warningIssues", count(Severity::Warning));
    rhai_scope.push_constant("infoIssues", count(Severity::Info));
}

fn scope_issues(scope: &ScopeMap) -> Vec<serde_json::Value> {
    scope
        .get("issues")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

fn issue_severity(issue: &serde_json::Value) -> Severity {
    match issue.get("severity").and_then(|v| v.as_str()) {
        Some("critical") => Severity::Critical,
        Some("error") => Severity::Error,
        Some("warning") => Severity::Warning,
        _ => Severity::Info,
    }
}

fn scope_association(scope: &ScopeMap) -> AuthorAssociation {
    scope
        .get("pr")
        .and_then(|pr| pr.get("author_association"))
        .and_then(|v| v.as_str())
        .map(AuthorAssociation::parse)
        .unwrap_or_default()
}

fn register_builtins(engine: &mut rhai::Engine, scope: &ScopeMap, log_sink: Option<LogSink>) {
    // ── Outcome helpers ───────────────────────────────────────────────
    let failed = scope
        .get("__failed")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    engine.register_fn("always", || true);
    engine.register_fn("success", move || !failed);
    engine.register_fn("failure", move || failed);

    // ── String helpers ────────────────────────────────────────────────
    engine.register_fn("contains", |s: &str, needle: &str| s.contains(needle));
    engine.register_fn("startsWith", |s: &str, prefix: &str| s.starts_with(prefix));
    engine.register_fn("endsWith", |s: &str, suffix: &str| s.ends_with(suffix));
    engine.register_fn("length", |s: &str| s.chars().count() as i64);
    engine.register_fn("length", |a: rhai::Array| a.len() as i64);

    // ── Issue helpers ─────────────────────────────────────────────────
    let issues = scope_issues(scope);

    let has = issues.clone();
    engine.register_fn("hasIssue", move || !has.is_empty());

    let count_all = issues.clone();
    engine.register_fn("countIssues", move || count_all.len() as i64);

    let count_sev = issues.clone();
    engine.register_fn("countIssues", move |severity: &str| {
        count_sev
            .iter()
            .filter(|i| i.get("severity").and_then(|v| v.as_str()) == Some(severity))
            .count() as i64
    });

    let by_pattern = issues.clone();
    engine.register_fn("hasFileMatching", move |pattern: &str| {
        let Ok(re) = regex::Regex::new(pattern) else {
            return false;
        };
        by_pattern.iter().any(|i| {
            i.get("file")
                .and_then(|v| v.as_str())
                .map(|f| re.is_match(f))
                .unwrap_or(false)
        })
    });

    let by_substr = issues.clone();
    engine.register_fn("hasFileWith", move |needle: &str| {
        by_substr.iter().any(|i| {
            i.get("file")
                .and_then(|v| v.as_str())
                .map(|f| f.contains(needle))
                .unwrap_or(false)
        })
    });

    let by_field = issues;
    engine.register_fn("hasIssueWith", move |field: &str, value: &str| {
        by_field.iter().any(|i| {
            i.get(field)
                .map(|v| match v {
                    serde_json::Value::String(s) => s == value,
                    other => other.to_string() == value,
                })
                .unwrap_or(false)
        })
    });

    // ── Permission helpers ────────────────────────────────────────────
    let assoc = scope_association(scope);
    engine.register_fn("hasMinPermission", move |level: &str| {
        assoc >= AuthorAssociation::parse(level)
    });
    engine.register_fn("isOwner", move || assoc == AuthorAssociation::Owner);
    engine.register_fn("isMember", move || assoc >= AuthorAssociation::Member);
    engine.register_fn("isCollaborator", move || {
        assoc >= AuthorAssociation::Collaborator
    });
    engine.register_fn("isContributor", move || {
        assoc >= AuthorAssociation::Contributor
    });
    engine.register_fn("isFirstTimer", move || {
        assoc == AuthorAssociation::FirstTimer
    });

    // ── log(...) ──────────────────────────────────────────────────────
    let sink1 = log_sink.clone();
    engine.register_fn("log", move |message: rhai::Dynamic| {
        let text = message.to_string();
        tracing::info!(target: "visor::predicate", "{text}");
        if let Some(sink) = &sink1 {
            sink.lock().push(text);
        }
    });
    let sink2 = log_sink;
    engine.register_fn("log", move |a: rhai::Dynamic, b: rhai::Dynamic| {
        let text = format!("{a} {b}");
        tracing::info!(target: "visor::predicate", "{text}");
        if let Some(sink) = &sink2 {
            sink.lock().push(text);
        }
    });
}
