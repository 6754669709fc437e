//! Command provider — runs a templated shell command and captures its
//! output.

use async_trait::async_trait;

use visor_domain::config::CheckSpec;
use visor_domain::error::{Error, Result};
use visor_domain::review::ReviewSummary;
use visor_engine::{DepResults, ExecContext, Provider};

/// Default hard timeout for shell commands.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Environment variable names a check may not override.
fn is_dangerous_env_var(name: &str) -> bool {
    const BLOCKED: &[&str] = &[
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "DYLD_INSERT_LIBRARIES",
        "DYLD_LIBRARY_PATH",
        "PATH",
        "HOME",
        "SHELL",
        "BASH_ENV",
        "ENV",
        "IFS",
    ];
    BLOCKED.contains(&name.to_ascii_uppercase().as_str())
}

pub struct CommandProvider;

#[async_trait]
impl Provider for CommandProvider {
    fn name(&self) -> &'static str {
        "command"
    }

    fn description(&self) -> &'static str {
        "runs a shell command and captures stdout as the check output"
    }

    fn supported_keys(&self) -> &'static [&'static str] {
        &["exec", "stdin", "workdir", "env"]
    }

    fn requirements(&self) -> &'static [&'static str] {
        &["sh"]
    }

    fn validate(&self, spec: &CheckSpec) -> bool {
        spec.param_str("exec").map(|s| !s.is_empty()).unwrap_or(false)
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        spec: &CheckSpec,
        _deps: &DepResults,
    ) -> Result<ReviewSummary> {
        let raw = spec
            .param_str("exec")
            .ok_or_else(|| Error::provider("command", "missing exec", false))?;
        let rendered = visor_template::render(raw, &ctx.template_scope)?;

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&rendered);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(workdir) = spec.param_str("workdir") {
            cmd.current_dir(workdir);
        }
        if let Some(env) = spec.params.get("env").and_then(|v| v.as_object()) {
            for (key, value) in env {
                if is_dangerous_env_var(key) {
                    return Err(Error::provider(
                        "command",
                        format!("environment variable '{key}' may not be overridden"),
                        false,
                    ));
                }
                let value = value.as_str().map(|s| s.to_string()).unwrap_or_else(|| value.to_string());
                let value = visor_template::render(&value, &ctx.template_scope)?;
                cmd.env(key, value);
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::provider("command", format!("failed to spawn: {e}"), false))?;

        if let Some(stdin_text) = spec.param_str("stdin") {
            let rendered_stdin = visor_template::render(stdin_text, &ctx.template_scope)?;
            if let Some(mut stdin) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                let _ = stdin.write_all(rendered_stdin.as_bytes()).await;
            }
        } else {
            drop(child.stdin.take());
        }

        let timeout = std::time::Duration::from_millis(
            spec.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_SECS * 1000),
        );
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result
                .map_err(|e| Error::provider("command", format!("wait failed: {e}"), true))?,
            Err(_) => {
                return Err(Error::provider(
                    "command",
                    format!("timed out after {}ms", timeout.as_millis()),
                    true,
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            tracing::debug!(exit_code = code, stderr = %stderr.trim(), "command failed");
            return Err(Error::provider(
                "command",
                format!("exit code {code}: {}", tail(&stderr, 400)),
                false,
            ));
        }

        Ok(crate::summary_from_text(stdout.trim_end().to_string()))
    }
}

fn tail(s: &str, max: usize) -> &str {
    let trimmed = s.trim();
    if trimmed.len() <= max {
        return trimmed;
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use visor_domain::cancel::CancelToken;
    use visor_domain::event::EventContext;
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

    fn spec(exec: &str) -> CheckSpec {
        let mut spec = CheckSpec::default();
        spec.params
            .insert("exec".into(), serde_json::Value::String(exec.into()));
        spec
    }

    #[test]
    fn validate_requires_exec() {
        let p = CommandProvider;
        assert!(p.validate(&spec("echo hi")));
        assert!(!p.validate(&CheckSpec::default()));
    }

    #[tokio::test]
    async fn captures_stdout() {
        let p = CommandProvider;
        let summary = p.execute(&ctx(), &spec("echo hello"), &HashMap::new()).await.unwrap();
        assert_eq!(summary.output.unwrap().as_str(), "hello");
    }

    #[tokio::test]
    async fn json_stdout_extracts_issues() {
        let p = CommandProvider;
        let cmd = r#"echo '{"issues": [{"rule_id": "x/y", "message": "m", "severity": "error"}]}'"#;
        let summary = p.execute(&ctx(), &spec(cmd), &HashMap::new()).await.unwrap();
        assert_eq!(summary.issues.len(), 1);
    }

    #[tokio::test]
    async fn nonzero_exit_is_permanent_error() {
        let p = CommandProvider;
        let err = p
            .execute(&ctx(), &spec("echo oops >&2; exit 3"), &HashMap::new())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("exit code 3"));
        assert!(err.to_string().contains("oops"));
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let p = CommandProvider;
        let mut s = spec("sleep 5");
        s.timeout_ms = Some(50);
        let err = p.execute(&ctx(), &s, &HashMap::new()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn blocked_env_override_rejected() {
        let p = CommandProvider;
        let mut s = spec("echo hi");
        s.params.insert(
            "env".into(),
            serde_json::json!({"LD_PRELOAD": "/tmp/evil.so"}),
        );
        let err = p.execute(&ctx(), &s, &HashMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("LD_PRELOAD"));
    }

    #[tokio::test]
    async fn stdin_is_piped() {
        let p = CommandProvider;
        let mut s = spec("cat");
        s.params
            .insert("stdin".into(), serde_json::Value::String("fed input".into()));
        let summary = p.execute(&ctx(), &s, &HashMap::new()).await.unwrap();
        assert_eq!(summary.output.unwrap().as_str(), "fed input");
    }
}
