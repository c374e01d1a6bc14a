//! flowq CLI: operator interface to a flowq store.

use flowq::config::Config;
use flowq::flow::{FlowCatalog, FlowEngine};
use flowq::model::event::{IndexRange, ReadOptions};
use flowq::model::run::RunId;
use flowq::model::trigger::HistoryQuery;
use flowq::scheduler::Scheduler;
use flowq::store::{EventStore, connect};
use flowq::telemetry::init_telemetry;
use flowq::trigger::TriggerRegistry;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flowq", about = "Flow orchestration runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Flow definition operations
    Flows {
        #[command(subcommand)]
        action: FlowAction,
    },
    /// Flow run operations
    Runs {
        #[command(subcommand)]
        action: RunAction,
    },
    /// Scheduler job operations
    Jobs {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Raw event stream operations
    Events {
        #[command(subcommand)]
        action: EventAction,
    },
    /// Trigger operations
    Triggers {
        #[command(subcommand)]
        action: TriggerAction,
    },
}

#[derive(Subcommand)]
enum FlowAction {
    /// Load TOML flow definitions and print their DAG levels
    Validate {
        /// Directory containing flow TOML files
        #[arg(long, default_value = "flows")]
        dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum RunAction {
    /// List runs of a flow, newest first
    List {
        flow: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show a run snapshot
    Show { run_id: String },
    /// Cancel a live run
    Cancel { flow: String, run_id: String },
    /// Delete every run of a flow
    Clear { flow: String },
}

#[derive(Subcommand)]
enum JobAction {
    /// List persisted jobs
    List {
        /// Glob over job ids and names
        #[arg(long)]
        pattern: Option<String>,
    },
}

#[derive(Subcommand)]
enum EventAction {
    /// Read a subject's events
    Read {
        subject: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Newest first
        #[arg(long)]
        backward: bool,
    },
}

#[derive(Subcommand)]
enum TriggerAction {
    /// Show a trigger's recent audit records
    History {
        name: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Only these event kinds (repeatable)
        #[arg(long = "kind")]
        kinds: Vec<String>,
    },
}

struct Services {
    store: EventStore,
    scheduler: Scheduler,
    engine: FlowEngine,
}

async fn services(config: &Config) -> anyhow::Result<Services> {
    let store = connect(&config.store_config()?).await?;
    let scheduler = Scheduler::new(store.clone(), config.scheduler_config());
    let engine = FlowEngine::new(store.clone(), scheduler.clone(), config.engine_config());
    Ok(Services {
        store,
        scheduler,
        engine,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _guard = init_telemetry(config.telemetry_config())?;

    match cli.command {
        Command::Flows {
            action: FlowAction::Validate { dir },
        } => cmd_flows_validate(dir),
        Command::Runs { action } => {
            let svc = services(&config).await?;
            match action {
                RunAction::List {
                    flow,
                    limit,
                    offset,
                } => cmd_runs_list(&svc, &flow, offset, limit).await,
                RunAction::Show { run_id } => cmd_runs_show(&svc, run_id).await,
                RunAction::Cancel { flow, run_id } => {
                    let run = svc.engine.cancel_flow(&flow, &RunId::from(run_id)).await?;
                    println!("{} is {}", run.run_id, run.status);
                    Ok(())
                }
                RunAction::Clear { flow } => {
                    let removed = svc.engine.clear_history(&flow).await?;
                    println!("Removed {removed} run(s) of {flow}");
                    Ok(())
                }
            }
        }
        Command::Jobs {
            action: JobAction::List { pattern },
        } => {
            let svc = services(&config).await?;
            cmd_jobs_list(&svc, pattern).await
        }
        Command::Events {
            action:
                EventAction::Read {
                    subject,
                    limit,
                    backward,
                },
        } => {
            let svc = services(&config).await?;
            let opts = if backward {
                ReadOptions::backward(limit)
            } else {
                ReadOptions::forward(limit)
            };
            for record in svc.store.read(&subject, &opts).await? {
                println!(
                    "{:>6}  {}  {:<20}  {}",
                    record.id,
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    record.kind,
                    record.payload
                );
            }
            Ok(())
        }
        Command::Triggers {
            action: TriggerAction::History { name, limit, kinds },
        } => {
            let svc = services(&config).await?;
            let registry = TriggerRegistry::new(
                svc.store.clone(),
                svc.engine.clone(),
                svc.scheduler.clone(),
            );
            let records = registry
                .get_trigger_history(&name, &HistoryQuery::latest(limit).kinds(kinds))
                .await?;
            if records.is_empty() {
                println!("No history for trigger {name}.");
            }
            for record in records {
                println!(
                    "{:>6}  {}  {:<24}  {}",
                    record.id,
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    record.kind,
                    record.payload
                );
            }
            Ok(())
        }
    }
}

fn cmd_flows_validate(dir: PathBuf) -> anyhow::Result<()> {
    let catalog = FlowCatalog::load_from_dir(&dir)?;
    if catalog.is_empty() {
        println!("No flow definitions in {}.", dir.display());
        return Ok(());
    }
    for (definition, graph) in catalog.iter() {
        println!("{} ({} steps)", definition.name, definition.steps.len());
        for (depth, level) in graph.levels.iter().enumerate() {
            println!("  L{depth}: {}", level.join(", "));
        }
        for kind in &graph.external_kinds {
            println!("  external: {kind}");
        }
    }
    println!("\n{} flow(s) valid", catalog.len());
    Ok(())
}

async fn cmd_runs_list(svc: &Services, flow: &str, offset: usize, limit: usize) -> anyhow::Result<()> {
    let page = svc
        .engine
        .get_flow_runs(flow, &IndexRange::page(offset, limit).newest_first())
        .await?;

    if page.runs.is_empty() {
        println!("No runs of {flow}.");
        return Ok(());
    }

    println!("{:<36}  {:<10}  {:<16}  FINISHED", "RUN", "STATUS", "STARTED");
    println!("{}", "-".repeat(86));
    for run in &page.runs {
        println!(
            "{:<36}  {:<10}  {:<16}  {}",
            run.run_id,
            run.status,
            run.started_at.format("%Y-%m-%d %H:%M"),
            run.finished_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    println!("\n{} of {} run(s)", page.runs.len(), page.total);
    Ok(())
}

async fn cmd_runs_show(svc: &Services, run_id: String) -> anyhow::Result<()> {
    let run_id = RunId::from(run_id);
    let Some(run) = svc.engine.get_run(&run_id).await? else {
        anyhow::bail!("no run {run_id}");
    };

    println!("Run:        {}", run.run_id);
    println!("Flow:       {}", run.flow_name);
    println!("Status:     {}", run.status);
    println!("Started:    {}", run.started_at);
    if let Some(finished) = run.finished_at {
        println!("Finished:   {finished}");
    }
    if let Some(ref err) = run.error {
        println!("Error:      {err}");
    }
    println!("Payload:    {}", serde_json::to_string_pretty(&run.payload)?);
    println!("---");
    for (name, step) in &run.steps {
        println!(
            "{:<20}  {:<10}  attempts={}  {}",
            name,
            step.status,
            step.attempts,
            step.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_jobs_list(svc: &Services, pattern: Option<String>) -> anyhow::Result<()> {
    let jobs = match pattern {
        Some(p) => svc.scheduler.get_jobs_by_pattern(&p).await?,
        None => svc.scheduler.get_all_persisted_jobs().await?,
    };
    if jobs.is_empty() {
        println!("No jobs scheduled.");
        return Ok(());
    }
    println!(
        "{:<40}  {:<9}  {:<7}  {:<6}  {:<6}  NEXT RUN",
        "ID", "SCHEDULE", "ENABLED", "RUNS", "FAILS"
    );
    println!("{}", "-".repeat(100));
    for job in &jobs {
        println!(
            "{:<40}  {:<9}  {:<7}  {:<6}  {:<6}  {}",
            job.id,
            job.schedule.type_name(),
            job.enabled,
            job.run_count,
            job.fail_count,
            job.next_run
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    println!("\n{} job(s)", jobs.len());
    Ok(())
}
