//! No-op provider — returns its configured output verbatim.
//!
//! Useful for wiring graphs together, for placeholder steps, and for
//! exercising routing in tests without real I/O.

use async_trait::async_trait;

use visor_domain::config::CheckSpec;
use visor_domain::error::Result;
use visor_domain::issue::Issue;
use visor_domain::review::{OutputValue, ReviewSummary};
use visor_engine::{DepResults, ExecContext, Provider};

pub struct NoopProvider;

#[async_trait]
impl Provider for NoopProvider {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn description(&self) -> &'static str {
        "returns the configured output and issues without doing any work"
    }

    fn supported_keys(&self) -> &'static [&'static str] {
        &["output", "issues"]
    }

    fn validate(&self, _spec: &CheckSpec) -> bool {
        true
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        spec: &CheckSpec,
        _deps: &DepResults,
    ) -> Result<ReviewSummary> {
        let mut summary = ReviewSummary::default();

        if let Some(output) = spec.params.get("output") {
            let output = match output {
                serde_json::Value::String(s) => {
                    OutputValue::Text(visor_template::render(s, &ctx.template_scope)?)
                }
                other => OutputValue::Json(other.clone()),
            };
            summary.output = Some(output);
        }

        if let Some(issues) = spec.params.get("issues").and_then(|v| v.as_array()) {
            summary.issues = issues
                .iter()
                .filter_map(|v| serde_json::from_value::<Issue>(v.clone()).ok())
                .collect();
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use visor_domain::cancel::CancelToken;
    use visor_domain::event::EventContext;
    use visor_domain::issue::Severity;
    use visor_domain::scope::Scope;
    use visor_memory::MemoryStore;
    use visor_template::TemplateScope;

    fn ctx() -> ExecContext {
        ExecContext {
            scope: Scope::root(),
            attempt: 1,
            cancel: CancelToken::new(),
            memory: Arc::new(MemoryStore::new()),
            event: Arc::new(EventContext::default()),
            args: serde_json::Map::new(),
            template_scope: TemplateScope::default(),
            mock: None,
        }
    }

    #[tokio::test]
    async fn returns_configured_output_and_issues() {
        let mut spec = CheckSpec::default();
        spec.params
            .insert("output".into(), serde_json::json!([1, 2, 3]));
        spec.params.insert(
            "issues".into(),
            serde_json::json!([{"rule_id": "a/b", "message": "m", "severity": "critical"}]),
        );
        let p = NoopProvider;
        let summary = p.execute(&ctx(), &spec, &HashMap::new()).await.unwrap();
        assert_eq!(
            summary.output,
            Some(OutputValue::Json(serde_json::json!([1, 2, 3])))
        );
        assert_eq!(summary.issues[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn empty_spec_yields_empty_summary() {
        let p = NoopProvider;
        let summary = p
            .execute(&ctx(), &CheckSpec::default(), &HashMap::new())
            .await
            .unwrap();
        assert!(summary.output.is_none());
        assert!(summary.issues.is_empty());
    }
}
