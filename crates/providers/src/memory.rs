//! Memory provider — exposes the run's memory store as a check type.

use async_trait::async_trait;

use visor_domain::config::CheckSpec;
use visor_domain::error::{Error, Result};
use visor_domain::review::{OutputValue, ReviewSummary};
use visor_engine::{DepResults, ExecContext, Provider};

pub struct MemoryProvider;

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn description(&self) -> &'static str {
        "reads and writes the run's namespaced key-value store"
    }

    fn supported_keys(&self) -> &'static [&'static str] {
        &["op", "namespace", "key", "value"]
    }

    fn validate(&self, spec: &CheckSpec) -> bool {
        matches!(
            spec.param_str("op"),
            Some(
                "get" | "has" | "set" | "append" | "increment" | "delete" | "clear" | "list"
                    | "list_namespaces" | "get_all"
            )
        )
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        spec: &CheckSpec,
        _deps: &DepResults,
    ) -> Result<ReviewSummary> {
        let op = spec
            .param_str("op")
            .ok_or_else(|| Error::provider("memory", "missing op", false))?;
        let namespace = spec.param_str("namespace").unwrap_or(visor_memory::DEFAULT_NAMESPACE);
        let key = spec.param_str("key");
        let value = spec.params.get("value").cloned();
        let value = match value {
            Some(serde_json::Value::String(s)) => Some(serde_json::Value::String(
                visor_template::render(&s, &ctx.template_scope)?,
            )),
            other => other,
        };

        let need_key = || {
            key.ok_or_else(|| Error::provider("memory", format!("op {op} requires key"), false))
        };

        let result: serde_json::Value = match op {
            "get" => ctx
                .memory
                .get(namespace, need_key()?)
                .unwrap_or(serde_json::Value::Null),
            "has" => ctx.memory.has(namespace, need_key()?).into(),
            "set" => {
                let value = value
                    .ok_or_else(|| Error::provider("memory", "set requires value", false))?;
                ctx.memory.set(namespace, need_key()?, value.clone());
                value
            }
            "append" => {
                let value = value
                    .ok_or_else(|| Error::provider("memory", "append requires value", false))?;
                let key = need_key()?;
                ctx.memory.append(namespace, key, value);
                ctx.memory
                    .get(namespace, key)
                    .unwrap_or(serde_json::Value::Null)
            }
            "increment" => {
                let delta = value.and_then(|v| v.as_f64()).unwrap_or(1.0);
                let next = ctx
                    .memory
                    .increment(namespace, need_key()?, delta)
                    .map_err(|e| Error::provider("memory", e.to_string(), false))?;
                serde_json::json!(next)
            }
            "delete" => ctx.memory.delete(namespace, need_key()?).into(),
            "clear" => {
                ctx.memory.clear(namespace);
                serde_json::Value::Null
            }
            "list" => serde_json::json!(ctx.memory.list(namespace)),
            "list_namespaces" => serde_json::json!(ctx.memory.list_namespaces()),
            "get_all" => serde_json::json!(ctx.memory.get_all(namespace)),
            other => {
                return Err(Error::provider(
                    "memory",
                    format!("unknown op: {other}"),
                    false,
                ))
            }
        };

        Ok(ReviewSummary::with_output(OutputValue::Json(result)))
    }
}
