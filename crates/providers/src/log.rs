//! Log provider — emits a rendered message into the run's logs.

use async_trait::async_trait;

use visor_domain::config::CheckSpec;
use visor_domain::error::Result;
use visor_domain::review::ReviewSummary;
use visor_engine::{DepResults, ExecContext, Provider};

pub struct LogProvider;

#[async_trait]
impl Provider for LogProvider {
    fn name(&self) -> &'static str {
        "log"
    }

    fn description(&self) -> &'static str {
        "logs a rendered message; the message is the check output"
    }

    fn supported_keys(&self) -> &'static [&'static str] {
        &["message", "level"]
    }

    fn validate(&self, spec: &CheckSpec) -> bool {
        spec.params.contains_key("message")
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        spec: &CheckSpec,
        _deps: &DepResults,
    ) -> Result<ReviewSummary> {
        let message = spec.param_str("message").unwrap_or_default();
        let rendered = visor_template::render(message, &ctx.template_scope)?;

        match spec.param_str("level").unwrap_or("info") {
            "debug" => tracing::debug!(target: "visor::check", "{rendered}"),
            "warn" => tracing::warn!(target: "visor::check", "{rendered}"),
            "error" => tracing::error!(target: "visor::check", "{rendered}"),
            _ => tracing::info!(target: "visor::check", "{rendered}"),
        }

        Ok(ReviewSummary::with_output(rendered))
    }
}
