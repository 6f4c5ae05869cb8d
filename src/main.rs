use anyhow::{Context, Result};
use baton_rs::baton::coordinator::{
    CompletionEvent, WorkflowCoordinator, EXIT_ESCALATE, EXIT_OK, EXIT_RETRY,
};
use baton_rs::baton::handoff::HandoffValidator;
use baton_rs::baton::workflow::loader::WorkflowLoader;
use baton_rs::baton::workflow::state::JsonGraphStore;
use baton_rs::baton::workflow::types::StepId;
use baton_rs::common::config::CoordinatorConfig;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workflow document path (overrides BATON_WORKFLOW)
    #[arg(short, long, global = true)]
    workflow: Option<PathBuf>,

    /// Fallback agent used on escalation (overrides BATON_FALLBACK_AGENT)
    #[arg(long, global = true)]
    fallback_agent: Option<String>,

    /// Malformed reports tolerated before escalation
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the workflow document from a plan file (JSON or YAML)
    Init {
        /// Path to the plan
        #[arg(short, long)]
        plan: PathBuf,

        /// Concurrency budget for plans that do not set one
        #[arg(short, long)]
        max_parallel: Option<usize>,

        /// Archive and replace an existing document
        #[arg(long)]
        force: bool,
    },
    /// Handle an agent's completion report
    Event {
        /// Reporting agent
        #[arg(short, long)]
        agent: String,

        /// Report text; read from --report-file or stdin when absent
        #[arg(short, long)]
        report: Option<String>,

        #[arg(long, conflicts_with = "report")]
        report_file: Option<PathBuf>,

        /// Step the report belongs to, when it cannot be inferred from the agent.
        /// Quote a numeric string id ("1") to keep it from parsing as an integer.
        #[arg(short, long)]
        step: Option<String>,
    },
    /// Print the workflow document
    Status,
    /// Print the schedule; with --dispatch, start the recommended steps
    Next {
        #[arg(long)]
        dispatch: bool,
    },
    /// Mark a pending step in progress
    Start {
        /// Step id; a quoted value ("1") is a string id
        #[arg(short, long)]
        step: String,
    },
    /// Mark a step completed without handoff validation
    Complete {
        /// Step id; a quoted value ("1") is a string id
        #[arg(short, long)]
        step: String,

        #[arg(short, long, default_value = "")]
        result: String,
    },
    /// Classify a report without touching the workflow
    Validate {
        #[arg(short, long)]
        report: Option<String>,
    },
    /// Report steps that have been in progress too long
    Sweep {
        /// Threshold in seconds (overrides BATON_STALE_STEP_SECS)
        #[arg(long)]
        older_than_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            EXIT_ESCALATE
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    let mut config = CoordinatorConfig::from_env().context("Failed to read configuration")?;
    if let Some(path) = args.workflow {
        config.workflow_path = path;
    }
    if let Some(agent) = args.fallback_agent {
        config.fallback_agent = agent;
    }
    if let Some(attempts) = args.max_attempts {
        config.max_handoff_attempts = attempts;
    }
    config.validate()?;

    log::debug!("Using workflow document {}", config.workflow_path.display());
    let store = JsonGraphStore::from_config(&config);
    let validator = HandoffValidator::from_config(&config)?;
    let coordinator =
        WorkflowCoordinator::new(store, config.clone()).with_validator(validator.clone());

    match args.command {
        Commands::Init {
            plan,
            max_parallel,
            force,
        } => {
            let loader = WorkflowLoader::with_budget(max_parallel.unwrap_or(config.max_parallel));
            let workflow = loader
                .load_plan(&plan)
                .with_context(|| format!("Failed to load plan {}", plan.display()))?;
            let workflow = coordinator.initialize(workflow, force).await?;
            print_json(&workflow.execution_state)?;
            Ok(EXIT_OK)
        }
        Commands::Event {
            agent,
            report,
            report_file,
            step,
        } => {
            let report = read_report(report, report_file)?;
            let mut event = CompletionEvent::new(agent, report);
            if let Some(step) = step {
                event = event.for_step(StepId::parse(&step));
            }
            let disposition = coordinator.handle_event(&event).await?;
            print_json(&disposition)?;
            Ok(disposition.exit_code())
        }
        Commands::Status => {
            print_json(&coordinator.status().await?)?;
            Ok(EXIT_OK)
        }
        Commands::Next { dispatch } => {
            if dispatch {
                print_json(&coordinator.dispatch().await?)?;
            } else {
                print_json(&coordinator.plan().await?)?;
            }
            Ok(EXIT_OK)
        }
        Commands::Start { step } => {
            let workflow = coordinator.start_step(&StepId::parse(&step)).await?;
            print_json(&workflow.execution_state)?;
            Ok(EXIT_OK)
        }
        Commands::Complete { step, result } => {
            let workflow = coordinator
                .complete_step(&StepId::parse(&step), &result)
                .await?;
            print_json(&workflow.execution_state)?;
            Ok(EXIT_OK)
        }
        Commands::Validate { report } => {
            let report = read_report(report, None)?;
            let outcome = validator.validate(&report);
            print_json(&outcome)?;
            Ok(if outcome.is_malformed() {
                EXIT_RETRY
            } else {
                EXIT_OK
            })
        }
        Commands::Sweep { older_than_secs } => {
            let threshold = older_than_secs
                .map(Duration::from_secs)
                .unwrap_or(config.stale_step_after);
            print_json(&coordinator.sweep_stale(threshold).await?)?;
            Ok(EXIT_OK)
        }
    }
}

fn read_report(report: Option<String>, report_file: Option<PathBuf>) -> Result<String> {
    if let Some(report) = report {
        return Ok(report);
    }
    if let Some(path) = report_file {
        return std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read report {}", path.display()));
    }
    let mut buffer = String::new();
    std::io::stdin()
        .read_to_string(&mut buffer)
        .context("Failed to read report from stdin")?;
    Ok(buffer)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
