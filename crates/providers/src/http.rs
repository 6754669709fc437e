//! HTTP client provider.

use async_trait::async_trait;

use visor_domain::config::CheckSpec;
use visor_domain::error::{Error, Result};
use visor_domain::review::ReviewSummary;
use visor_engine::{DepResults, ExecContext, Provider};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

pub struct HttpClientProvider {
    client: reqwest::Client,
}

impl HttpClientProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpClientProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for HttpClientProvider {
    fn name(&self) -> &'static str {
        "http_client"
    }

    fn description(&self) -> &'static str {
        "performs an HTTP request; the response body is the check output"
    }

    fn supported_keys(&self) -> &'static [&'static str] {
        &["url", "method", "headers", "body"]
    }

    fn validate(&self, spec: &CheckSpec) -> bool {
        spec.param_str("url").map(|s| !s.is_empty()).unwrap_or(false)
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        spec: &CheckSpec,
        _deps: &DepResults,
    ) -> Result<ReviewSummary> {
        let url = spec
            .param_str("url")
            .ok_or_else(|| Error::provider("http_client", "missing url", false))?;
        let url = visor_template::render(url, &ctx.template_scope)?;

        let method: reqwest::Method = spec
            .param_str("method")
            .unwrap_or("GET")
            .to_ascii_uppercase()
            .parse()
            .map_err(|_| Error::provider("http_client", "invalid method", false))?;

        let timeout = std::time::Duration::from_millis(
            spec.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
        );
        let mut request = self.client.request(method, &url).timeout(timeout);

        if let Some(headers) = spec.params.get("headers").and_then(|v| v.as_object()) {
            for (name, value) in headers {
                let value = value
                    .as_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| value.to_string());
                request = request.header(name, visor_template::render(&value, &ctx.template_scope)?);
            }
        }
        if let Some(body) = spec.params.get("body") {
            let body = match body {
                serde_json::Value::String(s) => visor_template::render(s, &ctx.template_scope)?,
                other => other.to_string(),
            };
            request = request.body(body);
        }

        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled("http request not started".into()));
        }

        tracing::debug!(url = %url, "http_client request");
        let response = request.send().await.map_err(|e| {
            let transient = e.is_timeout() || e.is_connect();
            Error::provider("http_client", e.to_string(), transient)
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::provider("http_client", e.to_string(), true))?;

        if status.is_server_error() {
            return Err(Error::provider(
                "http_client",
                format!("{status}: {}", truncate(&body, 200)),
                true,
            ));
        }
        if status.is_client_error() {
            return Err(Error::provider(
                "http_client",
                format!("{status}: {}", truncate(&body, 200)),
                false,
            ));
        }

        Ok(crate::summary_from_text(body))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_url() {
        let p = HttpClientProvider::new();
        let mut spec = CheckSpec::default();
        assert!(!p.validate(&spec));
        spec.params.insert(
            "url".into(),
            serde_json::Value::String("https://example.com".into()),
        );
        assert!(p.validate(&spec));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 2), "he");
        // 2-byte char at the cut point.
        assert_eq!(truncate("h\u{00e9}llo", 2), "h");
    }
}
