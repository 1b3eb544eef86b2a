use anyhow::{Context, Result};
use cajs_core::Task;
use cajs_engine::{orchestrator_from_env, SchedulerConfig};
use cajs_storage::JobStore;
use clap::{Parser, Subcommand};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "cajs")]
#[command(about = "Carbon-Aware Job Scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (default).
    Serve,
    /// Apply database migrations and exit.
    Migrate,
    /// Schedule one task and print the decision.
    Schedule {
        task_name: String,
        #[arg(long, default_value_t = 1.0)]
        duration_hours: f64,
        #[arg(long, default_value = "medium")]
        resource_usage: String,
    },
    /// Inspect or manage the job history.
    Jobs {
        #[command(subcommand)]
        action: Option<JobsAction>,
    },
    /// Report which carbon data source is in use.
    CarbonStatus,
}

#[derive(Debug, Subcommand)]
enum JobsAction {
    List,
    Show { id: i64 },
    Cancel { id: i64 },
    Clear,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let level = std::env::var("CAJS_LOG_LEVEL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "cajs={level},cajs_engine={level},cajs_adapters={level},cajs_storage={level},cajs_web={level},warn"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => cajs_web::serve_from_env().await?,
        Commands::Migrate => {
            let config = SchedulerConfig::from_env();
            JobStore::open(&config.database_url)
                .await
                .with_context(|| format!("migrating {}", config.database_url))?;
            tracing::info!(database_url = %config.database_url, "migrations applied");
        }
        Commands::Schedule {
            task_name,
            duration_hours,
            resource_usage,
        } => {
            let orchestrator = orchestrator_from_env().await?;
            let outcome = orchestrator
                .schedule(Task::new(task_name, duration_hours, resource_usage))
                .await?;
            print_json(&outcome)?;
        }
        Commands::Jobs { action } => {
            let orchestrator = orchestrator_from_env().await?;
            match action.unwrap_or(JobsAction::List) {
                JobsAction::List => print_json(&orchestrator.list_jobs().await?)?,
                JobsAction::Show { id } => print_json(&orchestrator.get_job(id).await?)?,
                JobsAction::Cancel { id } => print_json(&orchestrator.cancel_job(id).await?)?,
                JobsAction::Clear => {
                    let deleted = orchestrator.clear_jobs().await?;
                    println!("deleted {deleted} jobs");
                }
            }
        }
        Commands::CarbonStatus => {
            let orchestrator = orchestrator_from_env().await?;
            print_json(&orchestrator.carbon_status().await)?;
        }
    }

    Ok(())
}
