//! `visor` binary — thin CLI over the check engine and schedule daemon.
//!
//! Exit codes: 0 success, 1 when any `critical` issue is present,
//! 2 on configuration errors, 3 on internal faults.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use visor_domain::cancel::CancelToken;
use visor_domain::config::{ConfigSeverity, VisorConfig};
use visor_domain::error::Error;
use visor_domain::event::{EventContext, TriggerEvent};
use visor_engine::{Engine, RunOptions, RunSummary};
use visor_memory::MemoryStore;
use visor_schedule::{
    Schedule, ScheduleDaemon, ScheduleExecutor, ScheduleKind, ScheduleStoreBackend,
    SqliteScheduleStore,
};

mod output;

const EXIT_CRITICAL: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_INTERNAL: i32 = 3;

#[derive(Parser)]
#[command(name = "visor", version, about = "dependency-aware check orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute checks for an event and print the report.
    Run {
        #[arg(long, default_value = "visor.yaml")]
        config: PathBuf,
        /// Run only these checks (plus their dependencies).
        #[arg(long = "check")]
        checks: Vec<String>,
        /// Keep only checks carrying one of these tags.
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Trigger event (manual, pr_opened, pr_updated, ...).
        #[arg(long, default_value = "manual")]
        event: String,
        /// Output format: text or json.
        #[arg(long, default_value = "text")]
        output: String,
        /// Global run deadline in seconds.
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    /// Validate a configuration file and exit.
    Validate {
        #[arg(long, default_value = "visor.yaml")]
        config: PathBuf,
    },
    /// Run the schedule daemon against the configured store.
    Daemon {
        #[arg(long, default_value = "visor.yaml")]
        config: PathBuf,
        /// Node identity for advisory locks (defaults to a random id).
        #[arg(long)]
        node_id: Option<String>,
    },
    /// Manage persisted schedules.
    Schedule {
        #[arg(long, default_value = "visor.yaml")]
        config: PathBuf,
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Create a schedule.
    Add {
        /// Cron expression, `@every <duration>`, or an RFC3339 instant.
        #[arg(long)]
        expression: String,
        /// The workflow (or check) to fire.
        #[arg(long)]
        workflow: String,
        #[arg(long, default_value = "cli")]
        creator: String,
    },
    /// List all schedules.
    List,
    /// Delete a schedule by id.
    Rm { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let code = match cli.command {
        Command::Run {
            config,
            checks,
            tags,
            event,
            output,
            deadline_secs,
        } => run_command(config, checks, tags, event, output, deadline_secs).await,
        Command::Validate { config } => validate_command(config),
        Command::Daemon { config, node_id } => daemon_command(config, node_id).await,
        Command::Schedule { config, action } => schedule_command(config, action).await,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &PathBuf) -> Result<VisorConfig, i32> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        eprintln!("error: cannot read {}: {e}", path.display());
        EXIT_CONFIG
    })?;
    serde_yaml::from_str(&data).map_err(|e| {
        eprintln!("error: invalid config {}: {e}", path.display());
        EXIT_CONFIG
    })
}

fn exit_code_for(error: &Error) -> i32 {
    match error {
        Error::Config(_) => EXIT_CONFIG,
        _ => EXIT_INTERNAL,
    }
}

async fn run_command(
    config_path: PathBuf,
    checks: Vec<String>,
    tags: Vec<String>,
    event: String,
    output_format: String,
    deadline_secs: Option<u64>,
) -> i32 {
    let config = match load_config(&config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let event: TriggerEvent = match event.parse() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_CONFIG;
        }
    };

    let memory = match open_memory(&config) {
        Ok(m) => m,
        Err(code) => return code,
    };
    let engine = Engine::with_memory(Arc::new(visor_providers::builtin_registry()), memory);

    let mut options = RunOptions::new(config)
        .with_checks(checks)
        .with_tags(tags)
        .with_event(EventContext {
            event,
            ..Default::default()
        });
    if let Some(secs) = deadline_secs {
        options = options.with_deadline(std::time::Duration::from_secs(secs));
    }

    match engine.run(options).await {
        Ok(summary) => {
            print_summary(&summary, &output_format);
            summary.exit_code()
        }
        Err(e) => {
            eprintln!("error: {e}");
            exit_code_for(&e)
        }
    }
}

fn open_memory(config: &VisorConfig) -> Result<Arc<MemoryStore>, i32> {
    match &config.memory.file {
        Some(path) => MemoryStore::open(path, config.memory.format)
            .map(Arc::new)
            .map_err(|e| {
                eprintln!("error: cannot open memory snapshot: {e}");
                EXIT_CONFIG
            }),
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

fn print_summary(summary: &RunSummary, format: &str) {
    if format == "json" {
        match serde_json::to_string_pretty(summary) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("error: cannot serialize summary: {e}"),
        }
    } else {
        print!("{}", output::render_text(summary));
    }
}

fn validate_command(config_path: PathBuf) -> i32 {
    let config = match load_config(&config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let issues = config.validate();
    for issue in &issues {
        println!("{issue}");
    }
    let errors = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    if errors > 0 {
        eprintln!("{errors} error(s) found");
        EXIT_CONFIG
    } else {
        println!("configuration is valid");
        0
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schedule daemon wiring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runs scheduled workflows through the engine with a synthetic
/// `scheduled` event.
struct EngineExecutor {
    config: VisorConfig,
    memory: Arc<MemoryStore>,
}

#[async_trait::async_trait]
impl ScheduleExecutor for EngineExecutor {
    async fn execute(&self, schedule: &Schedule) -> visor_domain::Result<()> {
        let engine = Engine::with_memory(
            Arc::new(visor_providers::builtin_registry()),
            self.memory.clone(),
        );

        // A workflow_ref names a workflow, or falls back to a check id.
        let (config, checks) = if let Some(workflow) = self.config.workflows.get(&schedule.workflow_ref)
        {
            let config = VisorConfig {
                checks: workflow.checks.clone(),
                fail_if: workflow.fail_if.clone(),
                tools: self.config.tools.clone(),
                workflows: self.config.workflows.clone(),
                limits: self.config.limits.clone(),
                routing: self.config.routing.clone(),
                ..Default::default()
            };
            (config, Vec::new())
        } else if self.config.checks.contains_key(&schedule.workflow_ref) {
            (self.config.clone(), vec![schedule.workflow_ref.clone()])
        } else {
            return Err(Error::Config(format!(
                "schedule references unknown workflow: {}",
                schedule.workflow_ref
            )));
        };

        let options = RunOptions::new(config)
            .with_checks(checks)
            .with_event(EventContext {
                event: TriggerEvent::Scheduled,
                ..Default::default()
            });
        let summary = engine.run(options).await?;
        if summary.has_critical() {
            return Err(Error::Internal(format!(
                "scheduled workflow {} reported critical issues",
                schedule.workflow_ref
            )));
        }
        Ok(())
    }
}

async fn open_store(config: &VisorConfig) -> Result<Arc<SqliteScheduleStore>, i32> {
    let store = SqliteScheduleStore::open(&config.schedules.db_path).map_err(|e| {
        eprintln!("error: cannot open schedule store: {e}");
        EXIT_CONFIG
    })?;
    store.initialize().await.map_err(|e| {
        eprintln!("error: cannot initialize schedule store: {e}");
        EXIT_INTERNAL
    })?;
    Ok(Arc::new(store))
}

async fn daemon_command(config_path: PathBuf, node_id: Option<String>) -> i32 {
    let config = match load_config(&config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let store = match open_store(&config).await {
        Ok(s) => s,
        Err(code) => return code,
    };
    let memory = match open_memory(&config) {
        Ok(m) => m,
        Err(code) => return code,
    };

    let node_id = node_id.unwrap_or_else(|| format!("visor-{}", uuid::Uuid::new_v4()));
    let executor = Arc::new(EngineExecutor {
        config: config.clone(),
        memory,
    });
    let daemon = ScheduleDaemon::new(store, executor, node_id)
        .with_tick(std::time::Duration::from_secs(config.schedules.tick_secs))
        .with_lock_ttl(chrono::Duration::seconds(
            config.schedules.lock_ttl_secs as i64,
        ));

    let cancel = CancelToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping daemon");
            signal_cancel.cancel();
        }
    });

    daemon.run(cancel).await;
    0
}

async fn schedule_command(config_path: PathBuf, action: ScheduleAction) -> i32 {
    let config = match load_config(&config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let store = match open_store(&config).await {
        Ok(s) => s,
        Err(code) => return code,
    };

    match action {
        ScheduleAction::Add {
            expression,
            workflow,
            creator,
        } => {
            let kind = match visor_schedule::parse_expression(&expression) {
                Ok(visor_schedule::Expression::At(_)) => ScheduleKind::OneTime,
                Ok(_) => ScheduleKind::Recurring,
                Err(e) => {
                    eprintln!("error: {e}");
                    return EXIT_CONFIG;
                }
            };
            let schedule =
                match Schedule::new(creator, kind, expression, workflow, chrono::Utc::now()) {
                    Ok(s) => s,
                    Err(e) => {
                        eprintln!("error: {e}");
                        return EXIT_CONFIG;
                    }
                };
            match store
                .create(schedule, config.schedules.max_per_creator)
                .await
            {
                Ok(created) => {
                    println!("{}", created.id);
                    0
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    exit_code_for(&e)
                }
            }
        }
        ScheduleAction::List => match store.get_active_schedules().await {
            Ok(schedules) => {
                for s in schedules {
                    println!(
                        "{}  {:10}  {:24}  next: {}",
                        s.id,
                        s.status.as_str(),
                        s.expression,
                        s.next_run_at
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "-".into()),
                    );
                }
                0
            }
            Err(e) => {
                eprintln!("error: {e}");
                exit_code_for(&e)
            }
        },
        ScheduleAction::Rm { id } => match store.delete(&id).await {
            Ok(true) => 0,
            Ok(false) => {
                eprintln!("error: no such schedule: {id}");
                EXIT_CONFIG
            }
            Err(e) => {
                eprintln!("error: {e}");
                exit_code_for(&e)
            }
        },
    }
}
