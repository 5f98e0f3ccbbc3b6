//! Arbiter - incremental validation runner
//!
//! The `arbiter` command wires the scheduler, resource governor and event
//! publisher together around a TOML configuration.
//!
//! ## Commands
//!
//! - `watch`: read change events (NDJSON) from stdin and validate them in debounced batches
//! - `run`: validate the given files once and exit
//! - `config`: print the effective configuration

use anyhow::{Context, Result};
use arbiter_core::telemetry::init_tracing;
use arbiter_core::{
    ArbiterConfig, CommandPhase, EventPublisher, OutputFormat, PhaseRegistry, PipelineConfig,
    ResourceGovernor, Signal, SignalBus, ValidationScheduler, DEBOUNCE_WINDOW, METRICS,
};
use arbiter_domain::ChangeEvent;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Level};

#[derive(Parser)]
#[command(name = "arbiter")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incremental validation scheduler", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "ARBITER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate change events read from stdin until EOF or Ctrl-C
    Watch {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Validate the given files once
    Run {
        /// Files to validate
        #[arg(required = true)]
        files: Vec<String>,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Print the effective configuration as TOML
    Config {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Command-line overrides applied on top of the configuration file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Event sink path ("-" for stdout)
    #[arg(short, long)]
    output: Option<String>,

    /// Event format: ndjson, json or table
    #[arg(short, long)]
    format: Option<OutputFormat>,

    /// Only revalidate files whose content changed
    #[arg(long)]
    fast: bool,

    /// Per-phase timeout in milliseconds
    #[arg(long)]
    phase_timeout_ms: Option<u64>,
}

impl Overrides {
    fn apply(self, mut config: ArbiterConfig) -> Result<ArbiterConfig> {
        if let Some(output) = self.output {
            config.output.path = output;
        }
        if let Some(format) = self.format {
            config.output.format = format;
        }
        if self.fast {
            config.pipeline.fast_mode = true;
        }
        if let Some(ms) = self.phase_timeout_ms {
            config.pipeline.phase_timeout_ms = ms;
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json_logs, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Watch { overrides } => cmd_watch(overrides.apply(config)?).await,
        Commands::Run { files, overrides } => cmd_run(overrides.apply(config)?, files).await,
        Commands::Config { overrides } => cmd_config(overrides.apply(config)?),
    }
}

fn load_config(path: Option<&Path>) -> Result<ArbiterConfig> {
    match path {
        Some(path) => ArbiterConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(ArbiterConfig::default()),
    }
}

/// Register a command executor for every phase that configures one.
fn build_registry(pipeline: &PipelineConfig) -> PhaseRegistry {
    let mut registry = PhaseRegistry::new();
    for phase in &pipeline.phases {
        match &phase.command {
            Some(command) => {
                registry.register(phase.name.clone(), Arc::new(CommandPhase::new(command.clone())))
            }
            None => warn!(phase = %phase.name, "phase has no command"),
        }
    }
    registry
}

/// Running components, torn down in dependency order.
struct Components {
    scheduler: ValidationScheduler,
    publisher: EventPublisher,
    governor: ResourceGovernor,
    signal_log: JoinHandle<()>,
}

impl Components {
    async fn start(config: ArbiterConfig) -> Result<Self> {
        let bus = SignalBus::new();
        let signal_log = spawn_signal_log(&bus);

        let governor = ResourceGovernor::new(config.limits.clone(), bus.clone());
        governor.start();

        let publisher = EventPublisher::new(config.output.clone(), bus.clone());
        publisher
            .start()
            .await
            .with_context(|| format!("Failed to open event sink {}", config.output.path))?;

        let registry = build_registry(&config.pipeline);
        let scheduler = ValidationScheduler::builder(
            config.pipeline,
            registry,
            governor.clone(),
            publisher.clone(),
            bus,
        )
        .build();
        scheduler.start();

        Ok(Self {
            scheduler,
            publisher,
            governor,
            signal_log,
        })
    }

    async fn shutdown(self) -> Result<()> {
        self.scheduler.stop().await;
        let flushed = self.publisher.stop().await;
        self.governor.destroy();
        self.signal_log.abort();
        METRICS.flush();
        flushed.context("Final flush of the event sink failed")
    }
}

/// Log governor and component signals for the operator.
fn spawn_signal_log(bus: &SignalBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(Signal::Error { source, message }) => warn!(source, %message, "component error"),
                Ok(Signal::BackoffTriggered { duration_ms, reason }) => {
                    warn!(duration_ms, %reason, "backing off")
                }
                Ok(Signal::ResourceWarning { message }) => warn!(%message, "resource warning"),
                Ok(Signal::RateLimited { wait_ms }) => debug!(wait_ms, "rate limited"),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "signal log lagging")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn cmd_watch(config: ArbiterConfig) -> Result<()> {
    let components = Components::start(config).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    info!("Reading change events from stdin");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read change events")? {
                    Some(line) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<ChangeEvent>(line) {
                            Ok(event) => components.scheduler.on_change_event(event),
                            Err(e) => warn!(error = %e, "ignoring malformed change event"),
                        }
                    }
                    None => {
                        // Let the last debounce window close before stopping.
                        tokio::time::sleep(DEBOUNCE_WINDOW * 2).await;
                        info!("Input closed, shutting down");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    components.shutdown().await
}

async fn cmd_run(config: ArbiterConfig, files: Vec<String>) -> Result<()> {
    let components = Components::start(config).await?;
    let events = files.into_iter().map(ChangeEvent::modified).collect();

    let outcome = components.scheduler.process_batch(events).await;
    components.shutdown().await?;

    match outcome.context("Batch failed")? {
        Some(batch) if !batch.ok() => anyhow::bail!(
            "Validation failed: {} error(s) across {} phase(s)",
            batch.error_count(),
            batch.phases.len()
        ),
        Some(batch) => {
            info!(batch_id = %batch.batch_id, phases = batch.phases.len(), "Validation passed");
            Ok(())
        }
        None => {
            info!("Nothing to validate");
            Ok(())
        }
    }
}

fn cmd_config(config: ArbiterConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("{}", rendered);
    Ok(())
}
