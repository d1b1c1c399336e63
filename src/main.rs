mod doctor;
mod echo;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use baton_agent::{CapabilityRegistry, CoordinatorBuilder, WorkflowDefinition};
use baton_core::config::{AppConfig, HandoffConfig, Preset};
use baton_core::event::EventBus;
use baton_core::hooks::ShellHooks;
use baton_core::traits::ContextMap;
use baton_core::types::Task;

#[derive(Parser)]
#[command(name = "baton", version, about = "Hybrid agent handoff coordinator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "baton.toml", env = "BATON_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect handoff configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run a workflow file with echo agents
    Run {
        /// Workflow definition (TOML)
        workflow: PathBuf,
        /// Task description
        #[arg(short, long, default_value = "demo task")]
        task: String,
        /// Agent initially holding the task
        #[arg(long)]
        agent: Option<String>,
        /// Start from a preset instead of the config file
        #[arg(long)]
        preset: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate the config and report its health
    Check {
        /// Check a preset instead of the config file
        #[arg(long)]
        preset: Option<String>,
    },
    /// Print every preset as TOML
    Presets,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let default_filter = format!("baton={},warn", config.handoff.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Check { preset } => {
                let config = match preset {
                    Some(name) => AppConfig {
                        handoff: HandoffConfig::preset(Preset::from_str(&name)?),
                        ..config
                    },
                    None => config,
                };
                if !doctor::run_doctor(&config) {
                    std::process::exit(1);
                }
            }
            ConfigAction::Presets => {
                for preset in Preset::ALL {
                    println!("# {}", preset.name());
                    println!("{}", toml::to_string_pretty(&HandoffConfig::preset(preset))?);
                }
            }
        },
        Commands::Run {
            workflow,
            task,
            agent,
            preset,
        } => {
            let handoff = match preset {
                Some(name) => HandoffConfig::preset(Preset::from_str(&name)?),
                None => config.handoff.clone(),
            };
            run_workflow(&workflow, task, agent, handoff, &config).await?;
        }
    }

    Ok(())
}

/// Config file if present, defaults otherwise; `BATON_*` vars win either way.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let mut config = if path.exists() {
        AppConfig::load(path)?
    } else {
        AppConfig::default()
    };
    config.handoff = config.handoff.with_env_overrides()?;
    Ok(config)
}

async fn run_workflow(
    path: &Path,
    description: String,
    agent: Option<String>,
    handoff: HandoffConfig,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let definition = WorkflowDefinition::load(path)?;
    let graph = definition.build()?;

    let registry = Arc::new(CapabilityRegistry::new());
    for capability in echo::capabilities(&definition) {
        registry.register(capability);
    }
    info!(
        workflow = %path.display(),
        nodes = graph.node_count(),
        agents = registry.len(),
        "Loaded workflow"
    );

    let event_bus = Arc::new(EventBus::new(256));
    let mut rx = event_bus.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(envelope) = rx.recv().await {
            debug!(
                event = envelope.event_type(),
                payload = %serde_json::to_string(&envelope.event).unwrap_or_default(),
                "Event"
            );
        }
    });

    let mut builder = CoordinatorBuilder::new(
        graph,
        &definition.entry,
        registry,
        Arc::new(echo::EchoAgents),
        event_bus.clone(),
    )
    .config(handoff)
    .edge_selection(definition.edge_selection);
    if let Some(hooks) = config.hooks.clone().filter(|h| !h.is_empty()) {
        builder = builder.hook(Arc::new(ShellHooks::new(hooks)));
    }
    let coordinator = builder.build()?;

    let mut task = Task::new(description);
    if let Some(agent) = agent {
        task = task.with_agent(agent);
    }
    let result = coordinator
        .execute_task_with_handoffs(task, ContextMap::new())
        .await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    let metrics = coordinator.metrics();
    info!(
        handoffs = metrics.total_handoffs,
        failed = metrics.failed_handoffs,
        avg_latency_ms = metrics.average_latency_ms,
        "Run finished"
    );

    drop(coordinator);
    drop(event_bus);
    printer.abort();
    Ok(())
}
