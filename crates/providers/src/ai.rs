//! AI provider — renders the prompt and delegates completion to a
//! pluggable transport.
//!
//! The engine ships no concrete AI backend; hosts install a transport
//! (HTTP gateway, SDK adapter, recorded fixture) when constructing the
//! registry.

use std::sync::Arc;

use async_trait::async_trait;

use visor_domain::config::CheckSpec;
use visor_domain::error::{Error, Result};
use visor_domain::review::ReviewSummary;
use visor_engine::{DepResults, ExecContext, Provider};

/// Narrow completion contract the AI provider delegates to.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Default transport: fails with a configuration hint.
pub struct UnconfiguredTransport;

#[async_trait]
impl ChatTransport for UnconfiguredTransport {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(Error::provider(
            "ai",
            "no AI transport configured; install one when building the provider registry",
            false,
        ))
    }
}

/// Canned transport for tests and dry runs.
pub struct StaticTransport(pub String);

#[async_trait]
impl ChatTransport for StaticTransport {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

pub struct AiProvider {
    transport: Arc<dyn ChatTransport>,
}

impl AiProvider {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Provider for AiProvider {
    fn name(&self) -> &'static str {
        "ai"
    }

    fn description(&self) -> &'static str {
        "renders a prompt template and completes it via the configured transport"
    }

    fn supported_keys(&self) -> &'static [&'static str] {
        &["prompt"]
    }

    fn requirements(&self) -> &'static [&'static str] {
        &["a configured chat transport"]
    }

    fn validate(&self, spec: &CheckSpec) -> bool {
        spec.param_str("prompt")
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        spec: &CheckSpec,
        _deps: &DepResults,
    ) -> Result<ReviewSummary> {
        let prompt = spec
            .param_str("prompt")
            .ok_or_else(|| Error::provider("ai", "missing prompt", false))?;
        let rendered = visor_template::render(prompt, &ctx.template_scope)?;

        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled("ai completion not started".into()));
        }

        tracing::debug!(prompt_chars = rendered.len(), "ai completion");
        let response = self.transport.complete(&rendered).await?;
        let mut summary = crate::summary_from_text(response);
        summary.content = summary
            .output
            .as_ref()
            .map(|o| o.as_str().into_owned());
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use visor_domain::cancel::CancelToken;
    use visor_domain::event::EventContext;
    use visor_domain::scope::Scope;
    use visor_memory::MemoryStore;
    use visor_template::TemplateScope;

    fn ctx_with_scope(values: serde_json::Value) -> ExecContext {
        ExecContext {
            scope: Scope::root(),
            attempt: 1,
            cancel: CancelToken::new(),
            memory: Arc::new(MemoryStore::new()),
            event: Arc::new(EventContext::default()),
            args: serde_json::Map::new(),
            template_scope: TemplateScope::new(values.as_object().cloned().unwrap_or_default()),
            mock: None,
        }
    }

    fn spec(prompt: &str) -> CheckSpec {
        let mut spec = CheckSpec::default();
        spec.params
            .insert("prompt".into(), serde_json::Value::String(prompt.into()));
        spec
    }

    #[tokio::test]
    async fn renders_prompt_and_returns_completion() {
        let p = AiProvider::new(Arc::new(StaticTransport("looks fine".into())));
        let ctx = ctx_with_scope(serde_json::json!({"args": {"target": "src/"}}));
        let summary = p
            .execute(&ctx, &spec("review {{ args.target }}"), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(summary.output.unwrap().as_str(), "looks fine");
        assert_eq!(summary.content.as_deref(), Some("looks fine"));
    }

    #[tokio::test]
    async fn structured_response_extracts_issues() {
        let response = r#"{"issues": [{"rule_id": "logic/off-by-one", "message": "loop bound", "severity": "warning"}]}"#;
        let p = AiProvider::new(Arc::new(StaticTransport(response.into())));
        let ctx = ctx_with_scope(serde_json::json!({}));
        let summary = p.execute(&ctx, &spec("review"), &HashMap::new()).await.unwrap();
        assert_eq!(summary.issues.len(), 1);
    }

    #[tokio::test]
    async fn unconfigured_transport_is_permanent_error() {
        let p = AiProvider::new(Arc::new(UnconfiguredTransport));
        let ctx = ctx_with_scope(serde_json::json!({}));
        let err = p.execute(&ctx, &spec("review"), &HashMap::new()).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn validate_requires_prompt() {
        let p = AiProvider::new(Arc::new(UnconfiguredTransport));
        assert!(!p.validate(&CheckSpec::default()));
        assert!(p.validate(&spec("hello")));
    }
}
