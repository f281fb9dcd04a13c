use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use profsync_adapters::script_digest;
use profsync_sync::{render_query_script, QueryScriptParams, ReconcileOverrides};
use tracing::error;

mod env_boot;
mod telemetry;

#[derive(Debug, Parser)]
#[command(name = "profsync")]
#[command(about = "Fills missing analytics profile properties from the operational database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Query profiles missing fields, look them up and send updates.
    Reconcile(ReconcileArgs),
    /// Print the generated people query and its digest.
    QueryScript,
}

#[derive(Debug, Args, Default)]
struct ReconcileArgs {
    /// Plan and preview updates without sending them.
    #[arg(long)]
    dry_run: bool,
    /// Overwrite present values that differ from the database.
    #[arg(long)]
    force_overwrite: bool,
    /// Cap on profiles selected by the people query (0 = no cap).
    #[arg(long, value_name = "N")]
    max_results: Option<u64>,
    /// Directory for run_summary.json and planned_updates.json.
    #[arg(long, value_name = "PATH")]
    report_dir: Option<PathBuf>,
}

impl From<ReconcileArgs> for ReconcileOverrides {
    fn from(args: ReconcileArgs) -> Self {
        Self {
            dry_run: args.dry_run,
            force_overwrite: args.force_overwrite,
            max_results: args.max_results,
            report_dir: args.report_dir,
        }
    }
}

#[tokio::main]
async fn main() {
    env_boot::ensure_dotenv();
    if let Err(err) = telemetry::init_tracing("info") {
        eprintln!("{err:#}");
    }

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!("profsync failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli
        .command
        .unwrap_or_else(|| Commands::Reconcile(ReconcileArgs::default()))
    {
        Commands::Reconcile(args) => {
            let summary = profsync_sync::run_reconcile_from_env(args.into()).await?;
            println!(
                "reconcile complete: run_tag={} outcome={:?} rows={} planned={} sent={} failed_batches={} dry_run={}",
                summary.run_tag,
                summary.outcome,
                summary.query_rows,
                summary.planned_updates,
                summary.sent,
                summary.failed_batches,
                summary.dry_run
            );
        }
        Commands::QueryScript => {
            let params = QueryScriptParams::from_env()?;
            let script = render_query_script(&params);
            println!("{script}");
            eprintln!("sha256={}", script_digest(&script));
        }
    }

    Ok(())
}
