//! Provider contract and registry.
//!
//! The engine owns retry semantics and routing; providers own I/O and
//! content rendering. Each provider is looked up by its type descriptor
//! and handed the check spec, its dependencies' results, and an
//! execution context.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use visor_domain::cancel::CancelToken;
use visor_domain::config::{CheckSpec, ProviderKind};
use visor_domain::error::Result;
use visor_domain::event::EventContext;
use visor_domain::review::ReviewSummary;
use visor_domain::scope::Scope;
use visor_memory::MemoryStore;
use visor_template::TemplateScope;

/// `dependency_id → summary`; `-raw` aliases carry the aggregate value
/// for forEach producers.
pub type DepResults = HashMap<String, ReviewSummary>;

/// Everything a provider may need beyond its spec.
#[derive(Clone)]
pub struct ExecContext {
    pub scope: Scope,
    /// 1-based provider invocation attempt (increments on retry).
    pub attempt: u32,
    pub cancel: CancelToken,
    pub memory: Arc<MemoryStore>,
    pub event: Arc<EventContext>,
    /// Run-item `with` arguments, visible to templates as `args`.
    pub args: serde_json::Map<String, serde_json::Value>,
    /// Pre-built render scope (`pr`, `outputs`, `env`, `memory`, ...).
    pub template_scope: TemplateScope,
    /// Test hook: when set, the engine substitutes this summary for the
    /// provider call.
    pub mock: Option<ReviewSummary>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;

    /// Spec keys this provider reads from `params`.
    fn supported_keys(&self) -> &'static [&'static str] {
        &[]
    }

    /// External requirements (binaries, env vars) for diagnostics.
    fn requirements(&self) -> &'static [&'static str] {
        &[]
    }

    /// Cheap structural validation of a spec, run at plan time.
    fn validate(&self, spec: &CheckSpec) -> bool;

    async fn execute(
        &self,
        ctx: &ExecContext,
        spec: &CheckSpec,
        deps: &DepResults,
    ) -> Result<ReviewSummary>;
}

/// Lookup of provider implementations by type.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ProviderKind, provider: Arc<dyn Provider>) {
        tracing::debug!(kind = kind.as_str(), provider = provider.name(), "registered provider");
        self.providers.insert(kind, provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn Provider>> {
        self.providers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}
