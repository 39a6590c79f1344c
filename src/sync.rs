//! Run orchestration: fan the configured tables through the read → map →
//! publish pipeline and aggregate a [`RunSummary`].
//!
//! Failure isolation is the organizing principle here. A bad row skips the
//! row, a bad table skips the table, and only configuration or credential
//! problems abort the run. Tables are processed sequentially so one slow or
//! broken table cannot starve the others of connections.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tracing::{info, warn};

use crate::config::{Settings, TableConfig};
use crate::credentials;
use crate::mapper::map_row;
use crate::models::{RunSummary, TableReport};
use crate::publisher::{publish, IndexService, PublishLimits};
use crate::reader::{connect, MySqlRowSource, RowSource};

/// Everything one sync pass needs, with the I/O seams behind traits.
pub struct SyncContext<'a> {
    pub tables: &'a [TableConfig],
    pub rows: &'a dyn RowSource,
    pub index: &'a dyn IndexService,
    pub limits: PublishLimits,
    /// Trigger label recorded in the summary.
    pub source: Option<String>,
    /// Checked between tables; a set flag marks the remaining tables skipped.
    pub cancel: Arc<AtomicBool>,
}

/// Run one full sync pass over every configured table.
pub async fn run_sync(ctx: &SyncContext<'_>) -> RunSummary {
    let mut summary = RunSummary::new(ctx.source.clone());
    info!(run_id = %summary.run_id, tables = ctx.tables.len(), "sync run starting");

    // Sync markers are advisory: a service that cannot record them should
    // not block document upload.
    let sync_id = match ctx.index.begin_sync().await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "failed to start sync job marker, continuing");
            None
        }
    };

    for table in ctx.tables {
        if ctx.cancel.load(Ordering::SeqCst) {
            warn!(table = %table.name, "cancellation requested, skipping table");
            summary.record_table(TableReport::new(&table.name).skipped());
            continue;
        }

        let report = sync_table(ctx, table).await;
        info!(
            table = %report.table,
            status = ?report.status,
            attempted = report.documents_attempted,
            succeeded = report.documents_succeeded,
            failed = report.documents_failed,
            skipped_rows = report.rows_skipped,
            "table finished"
        );
        summary.record_table(report);
    }

    if let Some(ref id) = sync_id {
        if let Err(e) = ctx.index.end_sync(id).await {
            warn!(error = %e, "failed to stop sync job marker");
        }
    }

    summary.finish();
    summary
}

/// Sync a single table end to end.
///
/// Rows that fail to map are skipped and counted; duplicate document ids
/// within the table keep the first occurrence. A stream error marks the
/// whole table failed and nothing from it is published.
async fn sync_table(ctx: &SyncContext<'_>, table: &TableConfig) -> TableReport {
    let mut report = TableReport::new(&table.name);

    let mut stream = match ctx.rows.fetch(table).await {
        Ok(stream) => stream,
        Err(e) => return report.failed(e.to_string()),
    };

    let mut documents = Vec::new();
    let mut seen_ids = HashSet::new();

    while let Some(next) = stream.next().await {
        let row = match next {
            Ok(row) => row,
            Err(e) => return report.failed(e.to_string()),
        };

        match map_row(&row, table) {
            Ok(doc) => {
                if seen_ids.insert(doc.id.clone()) {
                    documents.push(doc);
                } else {
                    warn!(table = %table.name, id = %doc.id, "duplicate document id, keeping first");
                    report.rows_skipped += 1;
                }
            }
            Err(e) => {
                warn!(table = %table.name, error = %e, "row skipped");
                report.rows_skipped += 1;
            }
        }
    }

    report.documents_attempted = documents.len();
    if documents.is_empty() {
        return report;
    }

    let result = publish(ctx.index, documents, &ctx.limits).await;
    report.documents_succeeded = result.succeeded.len();
    report.documents_failed = result.failed.len();
    report.failures = result.failed;
    report
}

/// Full invocation: load tables, resolve credentials, connect, sync.
///
/// Configuration and credential problems return `Err` (hard failure, exit 2
/// territory). A database that cannot be reached is softer: every table is
/// recorded failed and the summary comes back partial.
pub async fn invoke(
    settings: &Settings,
    source: Option<String>,
    cancel: Arc<AtomicBool>,
) -> anyhow::Result<RunSummary> {
    let tables = settings.load_tables()?;

    let creds = credentials::from_settings(&settings.credentials)
        .resolve()
        .await?;

    let pool = match connect(&settings.database, &creds).await {
        Ok(pool) => pool,
        Err(e) => {
            warn!(error = %e, "database unreachable, failing all tables");
            let mut summary = RunSummary::new(source);
            for table in &tables {
                summary.record_table(TableReport::new(&table.name).failed(e.to_string()));
            }
            summary.finish();
            return Ok(summary);
        }
    };

    let rows = MySqlRowSource::new(pool);
    let index = crate::publisher::HttpIndexService::new(&settings.index)?;

    let ctx = SyncContext {
        tables: &tables,
        rows: &rows,
        index: &index,
        limits: PublishLimits::from(&settings.index),
        source,
        cancel,
    };

    let summary = run_sync(&ctx).await;
    rows.close().await;
    Ok(summary)
}
