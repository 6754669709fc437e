//! Template renderer for commands, prompts, bodies, and URLs.
//!
//! Two dialects are evaluated in order:
//! 1. Declarative template tags (`{{ … }}` / `{% … %}`) via tera over the
//!    fixed scope `{ pr, files, outputs, outputs_history, outputs_raw,
//!    env, args, memory }`.
//! 2. Any `{{ … }}` tag the declarative dialect could not resolve is
//!    evaluated as a sandboxed expression over the same scope.
//!    Unresolved values become empty strings.
//!
//! Logic blocks (`{% for %}`, `{% if %}`) must reference resolvable
//! scope values; the expression fallback applies to standalone tags.
//!
//! Outputs are JSON-smart: property access reaches into parsed fields,
//! while a bare `{{ outputs.check }}` coerces to the producer's raw
//! text when the output originated as text.

use std::collections::HashMap;

use visor_domain::error::{Error, Result};
use visor_sandbox::{EvalOptions, Sandbox, ScopeMap};

/// The fixed scope a template renders over.
#[derive(Debug, Clone, Default)]
pub struct TemplateScope {
    /// Top-level variables: `pr`, `files`, `outputs`, `outputs_history`,
    /// `outputs_raw`, `env`, `args`, `memory`, plus engine extras.
    pub values: ScopeMap,
    /// Raw producer text per check id, used for bare string coercion of
    /// `outputs.<check>` when the output was text carrying JSON.
    pub raw_text: HashMap<String, String>,
}

impl TemplateScope {
    pub fn new(values: ScopeMap) -> Self {
        Self {
            values,
            raw_text: HashMap::new(),
        }
    }

    pub fn with_raw_text(mut self, raw_text: HashMap<String, String>) -> Self {
        self.raw_text = raw_text;
        self
    }
}

/// Render `template` over `scope`.
pub fn render(template: &str, scope: &TemplateScope) -> Result<String> {
    if !template.contains("{{") && !template.contains("{%") {
        return Ok(template.to_string());
    }

    let ctx = tera_context(&scope.values)?;

    // Pass 1: the whole template through the declarative dialect.
    if let Ok(rendered) = tera::Tera::one_off(template, &ctx, false) {
        return Ok(rendered);
    }

    // Pass 2: park every tag the declarative dialect cannot resolve on
    // its own behind a placeholder, render the rest, then fill the
    // placeholders from the expression sandbox.
    let tags = scan_tags(template);
    let mut prepared = String::with_capacity(template.len());
    let mut cursor = 0usize;
    let mut pending: Vec<(String, String)> = Vec::new();

    for tag in &tags {
        prepared.push_str(&template[cursor..tag.start]);
        let single = format!("{{{{ {} }}}}", tag.expr);
        match tera::Tera::one_off(&single, &ctx, false) {
            Ok(value) => prepared.push_str(&value),
            Err(_) => {
                let placeholder = format!("\u{1}visor:{}\u{1}", pending.len());
                pending.push((placeholder.clone(), tag.expr.clone()));
                prepared.push_str(&placeholder);
            }
        }
        cursor = tag.end;
    }
    prepared.push_str(&template[cursor..]);

    // Remaining logic blocks render now that every tag is literal.
    let mut rendered = if prepared.contains("{%") {
        match tera::Tera::one_off(&prepared, &ctx, false) {
            Ok(out) => out,
            Err(e) => {
                return Err(Error::Config(format!("template render failed: {e}")));
            }
        }
    } else {
        prepared
    };

    for (placeholder, expr) in pending {
        let value = resolve_expression(&expr, scope);
        rendered = rendered.replace(&placeholder, &value);
    }

    Ok(rendered)
}

fn tera_context(values: &ScopeMap) -> Result<tera::Context> {
    tera::Context::from_serialize(serde_json::Value::Object(values.clone()))
        .map_err(|e| Error::Config(format!("template scope not serializable: {e}")))
}

/// One `{{ … }}` span in the template.
struct Tag {
    start: usize,
    end: usize,
    expr: String,
}

fn scan_tags(template: &str) -> Vec<Tag> {
    let mut tags = Vec::new();
    let mut rest = 0usize;
    while let Some(open) = template[rest..].find("{{") {
        let start = rest + open;
        let Some(close) = template[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + close + 2;
        tags.push(Tag {
            start,
            end,
            expr: template[start + 2..end - 2].trim().to_string(),
        });
        rest = end;
    }
    tags
}

/// Dialect 2: sandbox evaluation with the raw-text coercion special case.
fn resolve_expression(expr: &str, scope: &TemplateScope) -> String {
    // Bare `outputs.<check>` coerces to the producer's original text.
    if let Some(check) = expr.strip_prefix("outputs.") {
        if is_identifier(check) {
            if let Some(raw) = scope.raw_text.get(check) {
                return raw.clone();
            }
        }
    }

    match Sandbox::eval(expr, &scope.values, &EvalOptions::expression()) {
        Ok(value) => stringify(&value),
        Err(e) => {
            tracing::debug!(expr, error = %e, "template expression unresolved");
            String::new()
        }
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

/// Render a JSON value into template output.
fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(values: serde_json::Value) -> TemplateScope {
        TemplateScope::new(values.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn plain_text_passes_through() {
        let s = scope(json!({}));
        assert_eq!(render("no tags here", &s).unwrap(), "no tags here");
    }

    #[test]
    fn declarative_variable() {
        let s = scope(json!({"args": {"env": "staging"}}));
        assert_eq!(
            render("deploy to {{ args.env }}", &s).unwrap(),
            "deploy to staging"
        );
    }

    #[test]
    fn declarative_loop() {
        let s = scope(json!({"files": [{"path": "a.rs"}, {"path": "b.rs"}]}));
        let out = render("{% for f in files %}{{ f.path }};{% endfor %}", &s).unwrap();
        assert_eq!(out, "a.rs;b.rs;");
    }

    #[test]
    fn expression_fallback() {
        let s = scope(json!({"outputs": {"scan": {"items": [1, 2, 3]}}}));
        let out = render("count: {{ outputs.scan.items.len() }}", &s).unwrap();
        assert_eq!(out, "count: 3");
    }

    #[test]
    fn unresolved_becomes_empty() {
        let s = scope(json!({}));
        assert_eq!(render("x={{ nothing.here }}!", &s).unwrap(), "x=!");
    }

    #[test]
    fn raw_text_coercion_for_bare_output() {
        let raw = "Summary first.\n{\"status\": \"ok\"}";
        let mut s = scope(json!({
            "outputs": {"scan": {"status": "ok"}}
        }));
        s.raw_text.insert("scan".into(), raw.to_string());
        // Property access uses the parsed view.
        assert_eq!(
            render("{{ outputs.scan.status }}", &s).unwrap(),
            "ok"
        );
        // Bare access coerces to the original text.
        assert_eq!(render("{{ outputs.scan }}", &s).unwrap(), raw);
    }

    #[test]
    fn outputs_raw_exposes_aggregate() {
        let s = scope(json!({
            "outputs": {"items": {"id": 2}},
            "outputs_raw": {"items": [{"id": 1}, {"id": 2}]},
        }));
        let out = render("{{ outputs_raw.items | length }}", &s).unwrap();
        assert_eq!(out, "2");
    }

    #[test]
    fn mixed_declarative_and_expression() {
        let s = scope(json!({
            "args": {"name": "visor"},
            "outputs": {"scan": {"total": 7}},
        }));
        let out = render("{{ args.name }}: {{ outputs.scan.total + 1 }}", &s).unwrap();
        assert_eq!(out, "visor: 8");
    }

    #[test]
    fn rendering_is_idempotent_over_same_scope() {
        let s = scope(json!({"args": {"n": 3}, "outputs": {"c": {"v": 1}}}));
        let tpl = "{{ args.n }} and {{ outputs.c.v * 10 }}";
        let first = render(tpl, &s).unwrap();
        let second = render(tpl, &s).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "3 and 10");
    }

    #[test]
    fn object_result_renders_as_json() {
        let s = scope(json!({"outputs": {"c": {"a": 1}}}));
        // Filtered expression produces an object; stringified compactly.
        let out = render("{{ outputs.c }}", &s).unwrap();
        assert_eq!(out, r#"{"a":1}"#);
    }

    #[test]
    fn env_and_history_scope_keys() {
        let s = scope(json!({
            "env": {"CI": "true"},
            "outputs_history": {"proc": [{"v": 1}, {"v": 2}]},
        }));
        assert_eq!(render("{{ env.CI }}", &s).unwrap(), "true");
        assert_eq!(
            render("{{ outputs_history.proc | length }}", &s).unwrap(),
            "2"
        );
    }
}
