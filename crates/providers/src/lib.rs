//! Built-in provider implementations behind the engine's `Provider`
//! contract: shell commands, HTTP calls, AI prompts, MCP tool
//! invocations, logging, memory operations, and a no-op.
//!
//! The `workflow` type is engine-internal (a sub-run) and has no
//! provider here.

pub mod ai;
pub mod command;
pub mod http;
pub mod log;
pub mod memory;
pub mod mcp;
pub mod noop;

use std::sync::Arc;

use visor_domain::config::ProviderKind;
use visor_domain::issue::Issue;
use visor_domain::review::{extract_embedded_json, ReviewSummary};
use visor_engine::ProviderRegistry;

pub use ai::{AiProvider, ChatTransport, StaticTransport, UnconfiguredTransport};
pub use command::CommandProvider;
pub use http::HttpClientProvider;
pub use log::LogProvider;
pub use mcp::McpProvider;
pub use memory::MemoryProvider;
pub use noop::NoopProvider;

/// Registry with every built-in provider. The AI provider starts with
/// the unconfigured transport; swap it via [`registry_with_transport`].
pub fn builtin_registry() -> ProviderRegistry {
    registry_with_transport(Arc::new(UnconfiguredTransport))
}

pub fn registry_with_transport(transport: Arc<dyn ChatTransport>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(ProviderKind::Command, Arc::new(CommandProvider));
    registry.register(ProviderKind::HttpClient, Arc::new(HttpClientProvider::new()));
    registry.register(ProviderKind::Ai, Arc::new(AiProvider::new(transport)));
    registry.register(ProviderKind::Mcp, Arc::new(McpProvider));
    registry.register(ProviderKind::Log, Arc::new(LogProvider));
    registry.register(ProviderKind::Memory, Arc::new(MemoryProvider));
    registry.register(ProviderKind::Noop, Arc::new(NoopProvider));
    registry
}

/// Build a summary from free-form provider text.
///
/// The text is the output; when it embeds a JSON object with an
/// `issues` array, those entries become structured issues.
pub(crate) fn summary_from_text(text: String) -> ReviewSummary {
    let mut summary = ReviewSummary::default();
    if let Some(parsed) = extract_embedded_json(&text) {
        if let Some(issues) = parsed.get("issues").and_then(|v| v.as_array()) {
            summary.issues = issues
                .iter()
                .filter_map(|v| serde_json::from_value::<Issue>(v.clone()).ok())
                .collect();
        }
        summary.raw = Some(parsed);
    }
    summary.output = Some(text.into());
    summary
}
