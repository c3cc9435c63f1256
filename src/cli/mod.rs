/*
* Fleet provisioner command line
* ------------------------------
*
* fleet-provisioner
* ├── serve [--port] [--queue FILE]   HTTP API over the queue
* ├── run --queue FILE [--fast]       process a queue file once, write it back
* └── init [--force]                  write config/default.toml
*
* There is no hypervisor adapter in this crate yet, so `serve` and `run`
* drive the in-memory simulated cluster described by `[simulator]`. That
* makes `run` a rehearsal: same phases, same naming and storage decisions,
* no real VMs touched.
*/

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::config::{settings::default_config_file, generate_default_config, Settings, TimeoutSettings};
use crate::core::queue::InMemoryQueueStore;
use crate::core::simulator::SimulatedCluster;
use crate::monitoring::{
    ChannelSink, EventBus, PipelineEvent, RunState, TaskStatus, TaskTracker, TracingSink,
};
use crate::provision::{
    CancellationFlag, CloudInitPayloadBuilder, ProvisioningPipeline, RunContext, RunSummary,
    SequentialIdentityPatcher,
};

#[derive(Parser)]
#[command(name = "fleet-provisioner")]
#[command(about = "Bot fleet VM provisioning queue processor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding default.toml / local.toml
    #[arg(short, long, value_name = "DIR")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        /// Queue file to preload
        #[arg(short, long)]
        queue: Option<PathBuf>,
    },
    /// Process every pending item of a queue file once
    Run {
        #[arg(short, long)]
        queue: PathBuf,
        /// Use millisecond polling budgets
        #[arg(long)]
        fast: bool,
    },
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        let dir = cli.config.unwrap_or_else(|| PathBuf::from("config"));
        return handle_init_command(&dir, force);
    }

    let settings = match &cli.config {
        Some(dir) => Settings::load_from(dir),
        None => Settings::new(),
    }
    .context("loading configuration")?;

    match cli.command {
        Commands::Serve { port, queue } => handle_serve_command(settings, port, queue).await,
        Commands::Run { queue, fast } => handle_run_command(settings, &queue, fast).await,
        Commands::Init { .. } => Ok(()),
    }
}

async fn handle_serve_command(
    mut settings: Settings,
    port: Option<u16>,
    queue: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(port) = port {
        settings.server.port = port;
    }
    let store = match &queue {
        Some(path) => InMemoryQueueStore::load_json(path)
            .await
            .with_context(|| format!("loading queue {}", path.display()))?,
        None => InMemoryQueueStore::new(),
    };

    warn!("no hypervisor adapter configured, serving against the simulated cluster");
    let gateway = Arc::new(SimulatedCluster::from_settings(&settings));
    let state = AppState::new(Arc::new(store), gateway, Arc::new(settings));
    api::serve(state).await.context("serving API")?;
    Ok(())
}

async fn handle_run_command(mut settings: Settings, queue: &Path, fast: bool) -> anyhow::Result<()> {
    if fast {
        settings.timeouts = TimeoutSettings::fast();
    }
    let store = Arc::new(
        InMemoryQueueStore::load_json(queue)
            .await
            .with_context(|| format!("loading queue {}", queue.display()))?,
    );
    let gateway = Arc::new(SimulatedCluster::from_settings(&settings));

    let cancel = CancellationFlag::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            // in-flight calls finish, then the run stops
            on_ctrl_c.cancel();
        }
    });

    let (progress, mut events) = ChannelSink::new();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = progress_line(&event) {
                println!("{line}");
            }
        }
    });

    let ctx = RunContext {
        store: store.clone(),
        gateway,
        settings: Arc::new(settings),
        cancel,
        events: EventBus::new()
            .with_sink(Arc::new(TracingSink))
            .with_sink(Arc::new(TaskTracker::default()))
            .with_sink(Arc::new(progress)),
        identity: Arc::new(SequentialIdentityPatcher::default()),
        iso: Arc::new(CloudInitPayloadBuilder::default()),
    };

    let summary = ProvisioningPipeline::new(ctx).run().await;
    // the finished pipeline dropped its bus, so the printer drains and exits
    if let Err(e) = printer.await {
        warn!(error = %e, "progress printer stopped early");
    }
    store
        .save_json(queue)
        .await
        .with_context(|| format!("writing queue {}", queue.display()))?;
    print_summary(&summary);
    Ok(())
}

/// One console line per phase start and per finished task.
fn progress_line(event: &PipelineEvent) -> Option<String> {
    match event {
        PipelineEvent::PhaseStarted { phase, items } => Some(format!(
            "{} {phase} phase, {items} item(s)",
            "==>".blue().bold()
        )),
        PipelineEvent::TaskFinished {
            item_id,
            status,
            message,
        } => {
            let mark = match status {
                TaskStatus::Success => "✓".green(),
                TaskStatus::Warning => "!".yellow(),
                TaskStatus::Error => "✗".red(),
                TaskStatus::Running => "…".normal(),
            };
            Some(format!("  {mark} {item_id}: {message}"))
        }
        _ => None,
    }
}

fn print_summary(summary: &RunSummary) {
    let state = match summary.state {
        RunState::Success => "success".green(),
        RunState::Error => "error".red(),
        RunState::Idle => "idle".yellow(),
        RunState::Running => "running".yellow(),
    };
    println!("{} {}", "Run finished:".bold(), state);
    println!(
        "  done {}  errors {}  pending {}  interrupted {}",
        summary.done.to_string().green(),
        summary.errors.to_string().red(),
        summary.pending,
        summary.interrupted
    );
    if summary.cancelled {
        println!("  {}", "cancelled before completion".yellow());
    }
    for failure in &summary.failures {
        println!("  {} {}: {}", "✗".red(), failure.name, failure.message);
    }
    for warning in &summary.warnings {
        println!("  {} {}", "!".yellow(), warning);
    }
}

fn handle_init_command(dir: &Path, force: bool) -> anyhow::Result<()> {
    let target = default_config_file(dir);
    if target.exists() && !force {
        anyhow::bail!(
            "{} already exists, use --force to overwrite",
            target.display()
        );
    }

    std::fs::create_dir_all(dir)?;
    let rendered = generate_default_config().to_toml()?;
    std::fs::write(&target, rendered)?;

    info!(path = %target.display(), "default configuration written");
    println!("{} Default configuration generated", "✓".green());
    Ok(())
}
