//! scdflow CLI - configuration checks, ledger ingestion and one-shot runs

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use scdflow_orchestration::{
    init_tracing, BackfillRequest, CoreServices, ScdflowConfig, SinkCatalog, TaskDag,
    TaskOrchestrator, Tick, TracingAnomalySink,
};
use scdflow_storage::{ChangeAction, Row, SourceRow, SqliteLedgerStore};
use serde_json::json;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "scdflow", version, about = "Incremental SCD2 ELT core")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true, default_value = "scdflow.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate the configuration
    ValidateConfig,
    /// Print the task DAG as execution phases
    Plan,
    /// Append a JSON-lines file of rows to a dataset's ledger
    Ingest {
        /// SQLite ledger database
        #[arg(long)]
        ledger: PathBuf,
        #[arg(long)]
        dataset: String,
        #[arg(long, value_enum, default_value_t = ActionArg::Insert)]
        action: ActionArg,
        /// Column holding the RFC 3339 event time (removed from the row; defaults to now)
        #[arg(long)]
        event_time_column: Option<String>,
        /// JSON-lines input, one object per line
        file: PathBuf,
    },
    /// Replay the whole ledger through the DAG into a fresh catalog and print the result as JSON
    Run {
        #[arg(long)]
        ledger: PathBuf,
        #[arg(long, default_value_t = 1)]
        tick: u64,
        /// Include the full catalog snapshot in the output
        #[arg(long)]
        snapshot: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionArg {
    Insert,
    Update,
    Delete,
}

impl From<ActionArg> for ChangeAction {
    fn from(action: ActionArg) -> Self {
        match action {
            ActionArg::Insert => ChangeAction::Insert,
            ActionArg::Update => ChangeAction::Update,
            ActionArg::Delete => ChangeAction::Delete,
        }
    }
}

fn load_config(path: &PathBuf) -> Result<ScdflowConfig> {
    let config = ScdflowConfig::from_yaml(path)
        .with_context(|| format!("loading {}", path.display()))?
        .apply_env_overrides()?;
    Ok(config)
}

fn services(config: ScdflowConfig, ledger: &PathBuf) -> Result<CoreServices> {
    let store = SqliteLedgerStore::open(ledger)
        .with_context(|| format!("opening ledger {}", ledger.display()))?;
    Ok(CoreServices::new(
        config,
        Arc::new(store),
        Arc::new(SinkCatalog::new("live")),
        Arc::new(TracingAnomalySink),
    )?)
}

fn read_rows(file: &PathBuf, event_time_column: Option<&str>) -> Result<Vec<SourceRow>> {
    let reader = BufReader::new(
        std::fs::File::open(file).with_context(|| format!("opening {}", file.display()))?,
    );
    let mut rows = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut values: Row = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: not a JSON object", file.display(), line_no + 1))?;

        let event_time = match event_time_column.and_then(|c| values.remove(c)) {
            Some(serde_json::Value::String(raw)) => DateTime::parse_from_rfc3339(&raw)
                .with_context(|| format!("{}:{}: bad event time", file.display(), line_no + 1))?
                .with_timezone(&Utc),
            Some(other) => bail!(
                "{}:{}: event time must be an RFC 3339 string, got {}",
                file.display(),
                line_no + 1,
                other
            ),
            None => Utc::now(),
        };
        rows.push(SourceRow::new(values, event_time));
    }
    Ok(rows)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::ValidateConfig => {
            init_tracing("warn");
            let config = load_config(&cli.config)?;
            TaskDag::from_config(&config)?;
            println!(
                "{}: ok ({} datasets, {} aggregates)",
                cli.config.display(),
                config.datasets.len(),
                config.aggregates.len()
            );
        }
        Commands::Plan => {
            init_tracing("warn");
            let config = load_config(&cli.config)?;
            println!("{}", TaskDag::from_config(&config)?.execution_plan());
        }
        Commands::Ingest {
            ledger,
            dataset,
            action,
            event_time_column,
            file,
        } => {
            let config = load_config(&cli.config)?;
            init_tracing(&config.logging.filter);
            let services = services(config, &ledger)?;
            let rows = read_rows(&file, event_time_column.as_deref())?;
            let report = services.ledger.append(&dataset, rows, action.into()).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "dataset": dataset,
                    "appended": report.appended.len(),
                    "rejected": report.rejected.len(),
                    "last_sequence_id": report.last_sequence_id(),
                }))?
            );
        }
        Commands::Run {
            ledger,
            tick,
            snapshot,
        } => {
            let config = load_config(&cli.config)?;
            init_tracing(&config.logging.filter);
            let orchestrator = TaskOrchestrator::new(services(config, &ledger)?)?;

            let target = Arc::new(SinkCatalog::new("run"));
            let request = BackfillRequest::new(format!("run-{}", Uuid::new_v4()), target.clone())
                .at_tick(Tick(tick));
            let report = orchestrator.backfill(request).await?;

            let mut output = json!({
                "backfill_id": report.id,
                "succeeded": report.succeeded(),
                "tick": report.tick_report,
                "runs": report.runs.all_runs(),
            });
            if snapshot {
                output["catalog"] = serde_json::to_value(target.snapshot())?;
            }
            println!("{}", serde_json::to_string_pretty(&output)?);

            if !report.succeeded() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
