//! Run controller — the public entry that loads a config into a graph,
//! drives the dispatcher, and collects the run summary.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Semaphore};

use visor_domain::cancel::CancelToken;
use visor_domain::config::{ConfigSeverity, VisorConfig};
use visor_domain::error::{Error, Result};
use visor_domain::event::EventContext;
use visor_domain::issue::{Issue, Severity};
use visor_domain::review::ReviewSummary;
use visor_domain::scope::Scope;
use visor_memory::MemoryStore;

use crate::events::EngineEvent;
use crate::exec::{self, RunState};
use crate::graph::{select_checks, DependencyGraph};
use crate::outputs::OutputStore;
use crate::provider::ProviderRegistry;
use crate::summary::{CheckOutcome, OutcomeKind, RunStats, RunSummary};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RunOptions {
    pub config: VisorConfig,
    /// Explicit check selection; empty means every event-matching check.
    pub checks: Vec<String>,
    /// Tag filter applied to the selection.
    pub tags: Vec<String>,
    pub event: EventContext,
    /// Global run deadline; on expiry no new work is scheduled.
    pub deadline: Option<std::time::Duration>,
    /// Test hook: substitute summaries for named checks.
    pub mocks: HashMap<String, ReviewSummary>,
}

impl RunOptions {
    pub fn new(config: VisorConfig) -> Self {
        Self {
            config,
            checks: Vec::new(),
            tags: Vec::new(),
            event: EventContext::default(),
            deadline: None,
            mocks: HashMap::new(),
        }
    }

    pub fn with_checks(mut self, checks: Vec<String>) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_event(mut self, event: EventContext) -> Self {
        self.event = event;
        self
    }

    pub fn with_deadline(mut self, deadline: std::time::Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_mock(mut self, check: impl Into<String>, summary: ReviewSummary) -> Self {
        self.mocks.insert(check.into(), summary);
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Engine {
    registry: Arc<ProviderRegistry>,
    memory: Arc<MemoryStore>,
    events: broadcast::Sender<EngineEvent>,
    depth: usize,
}

impl Engine {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self::with_memory(registry, Arc::new(MemoryStore::new()))
    }

    pub fn with_memory(registry: Arc<ProviderRegistry>, memory: Arc<MemoryStore>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            registry,
            memory,
            events,
            depth: 0,
        }
    }

    pub(crate) fn at_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Subscribe to the engine's event stream before calling [`run`].
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn memory(&self) -> Arc<MemoryStore> {
        self.memory.clone()
    }

    /// Execute one run. Boxed so workflows can recurse through sub-runs.
    pub fn run(&self, options: RunOptions) -> BoxFuture<'_, Result<RunSummary>> {
        Box::pin(self.run_inner(options))
    }

    async fn run_inner(&self, options: RunOptions) -> Result<RunSummary> {
        let started = Instant::now();
        let config = Arc::new(options.config);

        // Fail fast on config errors; warnings are logged only.
        let config_issues = config.validate();
        let mut errors = Vec::new();
        for issue in &config_issues {
            match issue.severity {
                ConfigSeverity::Error => errors.push(issue.to_string()),
                ConfigSeverity::Warning => tracing::warn!("{issue}"),
            }
        }
        if !errors.is_empty() {
            return Err(Error::Config(errors.join("; ")));
        }

        let selected = select_checks(&config, &options.checks, &options.tags, options.event.event)?;
        let graph = DependencyGraph::build(&config, &selected)?;
        tracing::info!(
            checks = selected.len(),
            waves = graph.waves().len(),
            event = options.event.event.as_str(),
            "run planned"
        );

        let cancel = CancelToken::new();
        let deadline_task = options.deadline.map(|deadline| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                tracing::warn!("run deadline reached, cancelling");
                cancel.cancel();
            })
        });

        let telemetry_task = config
            .telemetry
            .file
            .clone()
            .map(|path| spawn_telemetry_writer(path, self.events.subscribe()));

        let state = Arc::new(RunState {
            config: config.clone(),
            graph,
            registry: self.registry.clone(),
            outputs: OutputStore::with_history_cap(config.limits.max_history_per_check),
            memory: self.memory.clone(),
            event: Arc::new(options.event),
            mocks: options.mocks,
            cancel: cancel.clone(),
            events: self.events.clone(),
            semaphore: Arc::new(Semaphore::new(config.limits.max_parallelism.max(1))),
            env: exec::env_snapshot(),
            depth: self.depth,
            trace: Mutex::new(Vec::new()),
            records: Mutex::new(Vec::new()),
            extra_issues: Mutex::new(Vec::new()),
            run_counts: Mutex::new(HashMap::new()),
            routing_counts: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(HashMap::new()),
            finish_counts: Mutex::new(HashMap::new()),
            fail_if_triggered: AtomicU64::new(0),
        });

        exec::run_waves(state.clone()).await;

        // Cancellation leaves the remainder marked, not silently absent.
        if cancel.is_cancelled() {
            let mut records = state.records.lock();
            for check in exec::unexecuted_checks(&state, &selected) {
                records.push(CheckOutcome {
                    check: check.clone(),
                    scope: Scope::root(),
                    outcome: OutcomeKind::Skipped,
                    duration_ms: 0,
                    issues: vec![Issue::new(
                        format!("{check}/cancelled"),
                        "run was cancelled before this check executed",
                        Severity::Warning,
                    )],
                });
            }
        }
        if let Some(task) = deadline_task {
            task.abort();
        }

        if let Some(path) = &config.memory.file {
            if let Err(e) = state.memory.persist(path, config.memory.format) {
                tracing::warn!(error = %e, path = %path.display(), "memory snapshot failed");
            }
        }

        let summary = self.build_summary(&state, started);
        let _ = self.events.send(EngineEvent::Done {
            success_count: summary.stats.success_count,
            failure_count: summary.stats.failure_count,
            duration_ms: summary.stats.duration_ms,
        });
        if let Some(task) = telemetry_task {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), task).await;
        }

        Ok(summary)
    }

    fn build_summary(&self, state: &RunState, started: Instant) -> RunSummary {
        let checks = state.records.lock().clone();
        let mut issues: Vec<Issue> = checks.iter().flat_map(|c| c.issues.clone()).collect();
        issues.extend(state.extra_issues.lock().clone());

        let success_count = checks
            .iter()
            .filter(|c| c.outcome == OutcomeKind::Success)
            .count() as u64;
        let failure_count = checks.iter().filter(|c| c.outcome.is_failure()).count() as u64;

        let mut outputs = HashMap::new();
        for check in state.outputs.completed_checks() {
            if let Some(summary) = state.outputs.get_latest(&check) {
                if let Some(output) = summary.output {
                    let value = output
                        .as_parsed()
                        .unwrap_or_else(|| serde_json::Value::String(output.as_str().into_owned()));
                    outputs.insert(check, value);
                }
            }
        }

        RunSummary {
            checks,
            issues,
            stats: RunStats {
                duration_ms: started.elapsed().as_millis() as u64,
                success_count,
                failure_count,
                fail_if_triggered: state.fail_if_triggered.load(Ordering::Relaxed),
            },
            routing: state.trace.lock().clone(),
            history: state.outputs.all_histories(),
            outputs,
        }
    }
}

/// Append one NDJSON object per event until the run's `done` marker.
fn spawn_telemetry_writer(
    path: PathBuf,
    mut events: broadcast::Receiver<EngineEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path);
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "telemetry file unavailable");
                return;
            }
        };
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        let _ = writeln!(file, "{line}");
                    }
                    if matches!(event, EngineEvent::Done { .. }) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "telemetry writer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
