//! # Rowsync CLI (`rowsync`)
//!
//! The `rowsync` binary drives the database-to-index synchronization engine.
//!
//! ## Usage
//!
//! ```bash
//! rowsync --config ./config/rowsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rowsync run` | Sync every configured table to the index service |
//! | `rowsync validate` | Load and validate settings and table definitions |
//! | `rowsync tables` | Print the resolved table definitions and their queries |
//! | `rowsync delete --ids <id>...` | Remove documents from the index by id |
//!
//! ## Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | full success — every table synced, zero failed documents |
//! | 1 | partial — at least one table or document failed or was skipped |
//! | 2 | hard failure — invalid configuration or credential fetch failed |

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use rowsync::config::{load_settings, Settings};
use rowsync::models::{RunStatus, RunSummary};
use rowsync::publisher::{HttpIndexService, IndexService};
use rowsync::reader::build_query;
use rowsync::sync;

/// Rowsync — sync relational tables into a managed search index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rowsync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rowsync",
    about = "Sync relational database tables into a managed search index",
    version,
    long_about = "Rowsync extracts rows from a MySQL database according to a declarative \
    per-table configuration, converts them into searchable documents, and publishes them \
    in batches to a managed index service. Failures are isolated: a bad row skips the row, \
    a bad table skips the table, and the run summary reports exactly what happened."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rowsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Sync every configured table to the index service.
    ///
    /// Reads rows per the table definitions, maps them to documents, and
    /// publishes them in batches. Prints a per-table and aggregate summary.
    Run {
        /// Trigger label recorded in the run summary (e.g. `schedule`).
        #[arg(long)]
        source: Option<String>,

        /// Inline JSON table definitions, overriding the configured ones.
        #[arg(long)]
        tables_json: Option<String>,

        /// Validate, read, and map rows without publishing anything.
        #[arg(long)]
        dry_run: bool,

        /// Print the run summary as JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Load and validate settings and table definitions, then exit.
    ///
    /// Reports every invalid table definition at once. No database or
    /// network access.
    Validate,

    /// Print the resolved table definitions and the query each would run.
    Tables,

    /// Remove documents from the index by id.
    Delete {
        /// Document ids to delete.
        #[arg(long, required = true, num_args = 1..)]
        ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            2
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let settings = load_settings(&cli.config)?;

    match cli.command {
        Commands::Run {
            source,
            tables_json,
            dry_run,
            json,
        } => {
            if let Some(raw) = tables_json {
                // Same override channel the scheduler uses.
                std::env::set_var("TABLES_CONFIG", raw);
            }
            let summary = if dry_run {
                run_dry(&settings, source).await?
            } else {
                let cancel = Arc::new(AtomicBool::new(false));
                spawn_cancel_handler(cancel.clone());
                sync::invoke(&settings, source, cancel).await?
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary, dry_run);
            }

            Ok(match summary.status() {
                RunStatus::Success => 0,
                RunStatus::Partial => 1,
            })
        }
        Commands::Validate => {
            let tables = settings.load_tables()?;
            println!("settings ok: {}", cli.config.display());
            println!("table definitions ok: {} table(s)", tables.len());
            Ok(0)
        }
        Commands::Tables => {
            let tables = settings.load_tables()?;
            for table in &tables {
                println!("{}", table.name);
                println!("  title_field: {}", table.title_field);
                println!("  content_fields: {}", table.content_fields.join(", "));
                if !table.metadata_fields.is_empty() {
                    println!("  metadata_fields: {}", table.metadata_fields.join(", "));
                }
                println!("  query: {}", build_query(table));
            }
            Ok(0)
        }
        Commands::Delete { ids } => {
            let index = HttpIndexService::new(&settings.index)?;
            index.delete_documents(&ids).await?;
            println!("deleted {} document(s)", ids.len());
            Ok(0)
        }
    }
}

/// Read and map every configured table without touching the index service.
async fn run_dry(settings: &Settings, source: Option<String>) -> anyhow::Result<RunSummary> {
    use rowsync::publisher::PublishLimits;
    use rowsync::reader::{connect, MySqlRowSource};

    /// Accepts everything; nothing leaves the process.
    struct NullIndexService;

    #[async_trait::async_trait]
    impl IndexService for NullIndexService {
        async fn put_documents(
            &self,
            _documents: &[rowsync::models::Document],
        ) -> Result<Vec<rowsync::models::DocumentFailure>, rowsync::error::PublishError> {
            Ok(Vec::new())
        }

        async fn delete_documents(
            &self,
            _ids: &[String],
        ) -> Result<(), rowsync::error::PublishError> {
            Ok(())
        }
    }

    let tables = settings.load_tables()?;
    let creds = rowsync::credentials::from_settings(&settings.credentials)
        .resolve()
        .await?;
    let pool = connect(&settings.database, &creds)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    let rows = MySqlRowSource::new(pool);
    let index = NullIndexService;

    let ctx = sync::SyncContext {
        tables: &tables,
        rows: &rows,
        index: &index,
        limits: PublishLimits::from(&settings.index),
        source,
        cancel: Arc::new(AtomicBool::new(false)),
    };

    let summary = sync::run_sync(&ctx).await;
    rows.close().await;
    Ok(summary)
}

/// Flip the cancel flag on Ctrl-C; the run skips remaining tables.
fn spawn_cancel_handler(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing current table then stopping");
            cancel.store(true, Ordering::SeqCst);
        }
    });
}

fn print_summary(summary: &RunSummary, dry_run: bool) {
    if dry_run {
        println!("run {} (dry-run)", summary.run_id);
    } else {
        println!("run {}", summary.run_id);
    }
    for table in &summary.tables {
        println!(
            "  {}: {:?} ({} attempted, {} succeeded, {} failed, {} rows skipped)",
            table.table,
            table.status,
            table.documents_attempted,
            table.documents_succeeded,
            table.documents_failed,
            table.rows_skipped,
        );
        if let Some(ref error) = table.error {
            println!("    error: {}", error);
        }
    }
    println!(
        "  tables: {} synced, {} failed, {} skipped",
        summary.tables_processed, summary.tables_failed, summary.tables_skipped
    );
    println!(
        "  documents: {} attempted, {} succeeded, {} failed",
        summary.documents_attempted, summary.documents_succeeded, summary.documents_failed
    );
    if summary.total_failures > 0 {
        println!("  failures (first {}):", summary.failures.len());
        for failure in &summary.failures {
            match &failure.document_id {
                Some(id) => println!("    {} {}: {}", failure.table, id, failure.reason),
                None => println!("    {}: {}", failure.table, failure.reason),
            }
        }
    }
}
