//! Command-line interface for the `db` binary

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use docmodel::{RunEvent, RunStatus};
use docstore::Store;
use eyre::Context;

use crate::config::Config;
use crate::context::Services;
use crate::ingest::DirIngestor;
use crate::llm::OpenAiClient;
use crate::orchestrator::{Orchestrator, RunRequest};

#[derive(Debug, Parser)]
#[command(name = "db", about = "Evaluate how well documentation serves autonomous coding agents")]
pub struct Cli {
    /// Path to a config file (defaults to .docbench.yml, then user config)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the database path
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create and execute a run over a local documentation directory
    Run {
        /// Directory containing the documentation corpus (.md/.txt files)
        docs_path: String,

        /// Task budget for the run
        #[arg(long)]
        tasks: Option<usize>,

        /// Number of workers to provision
        #[arg(long)]
        workers: Option<usize>,

        /// Maximum loop iterations per task
        #[arg(long)]
        max_steps: Option<u32>,

        /// Hard run-level cost cap in USD
        #[arg(long)]
        cost_cap: Option<f64>,

        /// Run the optimized second phase when baseline failures exist
        #[arg(long)]
        optimize: bool,

        /// Exit immediately instead of following events
        #[arg(long)]
        no_follow: bool,
    },

    /// List runs
    List,

    /// Show a run's status, totals and evaluations
    Status { run_id: String },

    /// Print a run's events
    Events {
        run_id: String,

        /// Keep following until the run finishes
        #[arg(long)]
        follow: bool,

        /// Start after this event id
        #[arg(long, default_value_t = 0)]
        after: i64,
    },

    /// Cancel a non-terminal run
    Cancel { run_id: String },
}

fn colored_status(status: RunStatus) -> String {
    let text = status.to_string();
    match status {
        RunStatus::Completed => text.green().to_string(),
        RunStatus::Failed => text.red().to_string(),
        RunStatus::Canceled => text.yellow().to_string(),
        _ => text.cyan().to_string(),
    }
}

fn print_event(event: &RunEvent) {
    println!(
        "{:>6}  {:>4}  {:<28} {}",
        event.id,
        event.seq,
        event.event_type.bold(),
        event.payload.message
    );
}

fn open_store(cli_db: Option<&PathBuf>, config: &Config) -> eyre::Result<Store> {
    let path = cli_db.unwrap_or(&config.storage.db_path);
    Store::open(path).context("failed to open the store")
}

/// Dispatch a parsed command line
pub async fn execute(cli: Cli) -> eyre::Result<()> {
    let config = Config::load(cli.config.as_ref())?;
    let store = open_store(cli.database.as_ref(), &config)?;

    match cli.command {
        Command::Run {
            docs_path,
            tasks,
            workers,
            max_steps,
            cost_cap,
            optimize,
            no_follow,
        } => {
            let client = OpenAiClient::from_env(&config.provider.base_url, &config.provider.api_key_env)
                .map_err(|e| eyre::eyre!("{}", e))?;
            let services = Services::new(store, Arc::new(client))?;
            let orchestrator = Orchestrator::new(
                services,
                Arc::new(DirIngestor),
                config.run_defaults(),
            );

            let mut request = RunRequest::new(docs_path);
            request.task_count = tasks;
            request.max_steps_per_task = max_steps;
            request.hard_cost_cap_usd = cost_cap;
            request.enable_skill_optimization = optimize.then_some(true);
            if let Some(count) = workers {
                request.workers = Some(crate::orchestrator::WorkersRequest {
                    worker_count: Some(count),
                    assignments: Vec::new(),
                });
            }

            let run_id = orchestrator.create_run(request).await?;
            println!("run {}", run_id.bold());
            orchestrator.start_run_in_background(&run_id);

            if no_follow {
                return Ok(());
            }
            let mut stream = orchestrator
                .stream_events(&run_id, 0)
                .with_poll_interval(Duration::from_millis(200));
            while let Some(event) = stream.next().await? {
                print_event(&event);
            }
            let detail = orchestrator.get_run_detail(&run_id)?;
            println!();
            println!("status: {}", colored_status(detail.run.status));
            println!("cost:   ${:.4}", detail.run.cost_estimate);
            if let Some(totals) = detail.run.totals {
                println!(
                    "tasks:  {}/{} passed (avg score {:.2})",
                    totals.passed_tasks, totals.total_tasks, totals.average_score
                );
                for (class, count) in &totals.failure_breakdown {
                    println!("        {} x{}", class, count);
                }
            }
            Ok(())
        }

        Command::List => {
            for run in store.list_runs()? {
                println!(
                    "{}  {:<32} {}  ${:.4}",
                    run.id.bold(),
                    run.docs_url,
                    colored_status(run.status),
                    run.cost_estimate
                );
            }
            Ok(())
        }

        Command::Status { run_id } => {
            let run = store.get_run(&run_id)?;
            println!("run:    {}", run.id.bold());
            println!("docs:   {}", run.docs_url);
            println!("status: {}", colored_status(run.status));
            println!("cost:   ${:.4}", run.cost_estimate);
            if let Some(totals) = &run.totals {
                println!(
                    "totals: {}/{} passed, pass rate {:.2}%, avg score {:.2}",
                    totals.passed_tasks,
                    totals.total_tasks,
                    totals.pass_rate * 100.0,
                    totals.average_score
                );
            }
            let evaluations = store.get_evaluations(&run_id, None)?;
            for evaluation in &evaluations {
                let verdict = if evaluation.pass {
                    "pass".green()
                } else {
                    "fail".red()
                };
                let class = evaluation
                    .failure_class
                    .map(|c| c.to_string())
                    .unwrap_or_default();
                println!(
                    "  [{}] {} {:<10} avg {:.2} {}",
                    evaluation.phase, verdict, evaluation.task_id, evaluation.criterion_scores.average, class
                );
            }
            let errors = store.get_run_errors(&run_id)?;
            for error in &errors {
                println!("  {} {}", error.code.red(), error.message);
            }
            Ok(())
        }

        Command::Events { run_id, follow, after } => {
            if follow {
                let events = crate::events::EventLog::new(store.clone());
                let mut stream = events
                    .stream(&run_id, after)
                    .with_poll_interval(Duration::from_millis(200));
                while let Some(event) = stream.next().await? {
                    print_event(&event);
                }
            } else {
                for event in store.get_run_events_after(&run_id, after, 1000)? {
                    print_event(&event);
                }
            }
            Ok(())
        }

        Command::Cancel { run_id } => {
            let events = crate::events::EventLog::new(store.clone());
            crate::lifecycle::cancel(&store, &events, &run_id).await?;
            println!("run {} {}", run_id.bold(), "canceled".yellow());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_flags() {
        let cli = Cli::parse_from([
            "db", "run", "./docs", "--tasks", "4", "--optimize", "--cost-cap", "1.5",
        ]);
        match cli.command {
            Command::Run {
                docs_path,
                tasks,
                optimize,
                cost_cap,
                ..
            } => {
                assert_eq!(docs_path, "./docs");
                assert_eq!(tasks, Some(4));
                assert!(optimize);
                assert_eq!(cost_cap, Some(1.5));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_events_defaults() {
        let cli = Cli::parse_from(["db", "events", "run-1"]);
        match cli.command {
            Command::Events { run_id, follow, after } => {
                assert_eq!(run_id, "run-1");
                assert!(!follow);
                assert_eq!(after, 0);
            }
            _ => panic!("expected events command"),
        }
    }
}
