//! Core data types that flow through the sync pipeline.
//!
//! A [`RowMap`] is produced by the row reader, converted by the mapper into a
//! [`Document`], uploaded by the publisher into a [`BatchResult`], and
//! aggregated per invocation into a [`RunSummary`].

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// How many failure details a [`RunSummary`] retains for diagnostics.
pub const MAX_FAILURE_DETAILS: usize = 10;

/// A single column value read from the source database.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }
}

/// A raw row: column name to scalar value. Ephemeral — consumed immediately
/// by the mapper.
pub type RowMap = HashMap<String, ScalarValue>;

/// A metadata value with an explicit type tag for the index service.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Str(String),
    Integer(i64),
    Number(f64),
    /// ISO-8601 date or datetime, already normalized.
    Date(String),
    Boolean(bool),
}

/// The normalized unit published to the index service, derived from one row.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Deterministic id derived from table name + title value, stable across
    /// runs so repeated syncs overwrite rather than duplicate.
    pub id: String,
    pub title: String,
    /// Content fields joined in config order with field-name framing.
    pub body: String,
    pub metadata: BTreeMap<String, MetadataValue>,
    /// Provenance: the source table this document came from.
    pub source_table: String,
}

/// A document the index service rejected, with the reason it gave.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentFailure {
    pub id: String,
    pub reason: String,
}

/// Outcome of publishing one document sequence: which ids landed and which
/// failed permanently after retries.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<DocumentFailure>,
}

/// Terminal state of one table's sync within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Synced,
    Failed,
    /// The run was cancelled before this table started.
    Skipped,
}

/// Per-table outcome recorded in the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub table: String,
    pub status: TableStatus,
    pub documents_attempted: usize,
    pub documents_succeeded: usize,
    pub documents_failed: usize,
    /// Rows dropped by mapping failures or duplicate document ids.
    pub rows_skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub failures: Vec<DocumentFailure>,
}

impl TableReport {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            status: TableStatus::Synced,
            documents_attempted: 0,
            documents_succeeded: 0,
            documents_failed: 0,
            rows_skipped: 0,
            error: None,
            failures: Vec::new(),
        }
    }

    pub fn failed(mut self, reason: String) -> Self {
        self.status = TableStatus::Failed;
        self.error = Some(reason);
        self
    }

    pub fn skipped(mut self) -> Self {
        self.status = TableStatus::Skipped;
        self
    }
}

/// Overall status of an invocation that produced a summary.
///
/// A hard failure (bad config, credential fetch) never produces a summary;
/// callers see an error instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
}

/// One retained failure reason, with enough context to diagnose without
/// re-running.
#[derive(Debug, Clone, Serialize)]
pub struct FailureDetail {
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub reason: String,
}

/// Aggregate result of one invocation across all configured tables.
///
/// Created once per invocation and returned to the caller; no sync state is
/// persisted between runs because re-sync is idempotent by construction.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    /// Trigger payload label (e.g. `"manual-test"` or `"schedule"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables_processed: usize,
    pub tables_failed: usize,
    pub tables_skipped: usize,
    pub documents_attempted: usize,
    pub documents_succeeded: usize,
    pub documents_failed: usize,
    pub rows_skipped: usize,
    pub tables: Vec<TableReport>,
    /// First [`MAX_FAILURE_DETAILS`] failure reasons.
    pub failures: Vec<FailureDetail>,
    pub total_failures: usize,
}

impl RunSummary {
    pub fn new(source: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            source,
            started_at: now,
            finished_at: now,
            tables_processed: 0,
            tables_failed: 0,
            tables_skipped: 0,
            documents_attempted: 0,
            documents_succeeded: 0,
            documents_failed: 0,
            rows_skipped: 0,
            tables: Vec::new(),
            failures: Vec::new(),
            total_failures: 0,
        }
    }

    /// Fold one table's outcome into the aggregate counters.
    pub fn record_table(&mut self, report: TableReport) {
        match report.status {
            TableStatus::Synced => self.tables_processed += 1,
            TableStatus::Failed => {
                self.tables_failed += 1;
                self.push_failure(FailureDetail {
                    table: report.table.clone(),
                    document_id: None,
                    reason: report
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown failure".to_string()),
                });
            }
            TableStatus::Skipped => self.tables_skipped += 1,
        }

        self.documents_attempted += report.documents_attempted;
        self.documents_succeeded += report.documents_succeeded;
        self.documents_failed += report.documents_failed;
        self.rows_skipped += report.rows_skipped;

        for failure in &report.failures {
            self.push_failure(FailureDetail {
                table: report.table.clone(),
                document_id: Some(failure.id.clone()),
                reason: failure.reason.clone(),
            });
        }

        self.tables.push(report);
    }

    fn push_failure(&mut self, detail: FailureDetail) {
        self.total_failures += 1;
        if self.failures.len() < MAX_FAILURE_DETAILS {
            self.failures.push(detail);
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    /// The run is a success only if every table synced with zero failed
    /// documents. Anything short of that is a partial success — the caller
    /// decides what to do with it based on the explicit counters.
    pub fn status(&self) -> RunStatus {
        if self.tables_failed == 0 && self.tables_skipped == 0 && self.documents_failed == 0 {
            RunStatus::Success
        } else {
            RunStatus::Partial
        }
    }
}
