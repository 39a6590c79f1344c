//! End-to-end sync tests over in-memory row and index doubles.
//!
//! Covers: full-table sync, per-row LIMIT, table failure isolation, rejected
//! document isolation, duplicate id dedup, and cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use rowsync::config::{parse_tables, TableConfig};
use rowsync::error::{DataSourceError, PublishError};
use rowsync::mapper::document_id;
use rowsync::models::{
    Document, DocumentFailure, MetadataValue, RowMap, RunStatus, ScalarValue, TableStatus,
};
use rowsync::publisher::{IndexService, PublishLimits};
use rowsync::reader::{RowSource, RowStream};
use rowsync::sync::{run_sync, SyncContext};

/// Serves canned rows per table, honoring the configured limit. Tables not
/// present fail with a query error, like a missing table would.
struct FakeRows {
    tables: HashMap<String, Vec<RowMap>>,
}

#[async_trait]
impl RowSource for FakeRows {
    async fn fetch(&self, table: &TableConfig) -> Result<RowStream, DataSourceError> {
        let Some(rows) = self.tables.get(&table.name) else {
            return Err(DataSourceError::Decode {
                column: table.name.clone(),
                reason: "table does not exist".to_string(),
            });
        };
        let limited: Vec<_> = rows
            .iter()
            .take(table.limit as usize)
            .cloned()
            .map(Ok)
            .collect();
        Ok(futures::stream::iter(limited).boxed())
    }
}

/// Records every put; rejects a configured id set.
#[derive(Default)]
struct FakeIndex {
    reject: Vec<String>,
    puts: Mutex<Vec<Vec<Document>>>,
    deletes: Mutex<Vec<Vec<String>>>,
    sync_calls: Mutex<Vec<String>>,
}

impl FakeIndex {
    fn published(&self) -> Vec<Document> {
        self.puts.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl IndexService for FakeIndex {
    async fn put_documents(
        &self,
        documents: &[Document],
    ) -> Result<Vec<DocumentFailure>, PublishError> {
        self.puts.lock().unwrap().push(documents.to_vec());
        Ok(documents
            .iter()
            .filter(|d| self.reject.contains(&d.id))
            .map(|d| DocumentFailure {
                id: d.id.clone(),
                reason: "rejected".to_string(),
            })
            .collect())
    }

    async fn delete_documents(&self, ids: &[String]) -> Result<(), PublishError> {
        self.deletes.lock().unwrap().push(ids.to_vec());
        Ok(())
    }

    async fn begin_sync(&self) -> Result<Option<String>, PublishError> {
        self.sync_calls.lock().unwrap().push("begin".to_string());
        Ok(Some("job-1".to_string()))
    }

    async fn end_sync(&self, sync_id: &str) -> Result<(), PublishError> {
        self.sync_calls
            .lock()
            .unwrap()
            .push(format!("end:{}", sync_id));
        Ok(())
    }
}

fn row(pairs: &[(&str, ScalarValue)]) -> RowMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn user_row(id: i64, username: &str, email: &str) -> RowMap {
    row(&[
        ("id", ScalarValue::Integer(id)),
        ("username", ScalarValue::Text(username.to_string())),
        ("email", ScalarValue::Text(email.to_string())),
        ("is_active", ScalarValue::Boolean(true)),
    ])
}

fn users_tables(limit: i64) -> Vec<TableConfig> {
    parse_tables(&format!(
        r#"[{{
            "name": "users",
            "title_field": "id",
            "content_fields": ["username", "email"],
            "metadata_fields": ["is_active"],
            "where_clause": "is_active = 1",
            "limit": {limit}
        }}]"#
    ))
    .unwrap()
}

fn test_limits() -> PublishLimits {
    PublishLimits {
        batch_size: 10,
        max_payload_bytes: 5 * 1024 * 1024,
        max_retries: 1,
        retry_backoff: Duration::ZERO,
    }
}

fn ctx<'a>(
    tables: &'a [TableConfig],
    rows: &'a FakeRows,
    index: &'a FakeIndex,
) -> SyncContext<'a> {
    SyncContext {
        tables,
        rows,
        index,
        limits: test_limits(),
        source: Some("manual-test".to_string()),
        cancel: Arc::new(AtomicBool::new(false)),
    }
}

#[tokio::test]
async fn full_table_sync_succeeds() {
    let tables = users_tables(10);
    let rows = FakeRows {
        tables: HashMap::from([(
            "users".to_string(),
            vec![
                user_row(1, "ada", "ada@example.com"),
                user_row(2, "grace", "grace@example.com"),
            ],
        )]),
    };
    let index = FakeIndex::default();

    let summary = run_sync(&ctx(&tables, &rows, &index)).await;

    assert_eq!(summary.status(), RunStatus::Success);
    assert_eq!(summary.tables_processed, 1);
    assert_eq!(summary.documents_succeeded, 2);
    assert_eq!(summary.documents_failed, 0);

    let published = index.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].id, document_id("users", "1"));

    let sync_calls = index.sync_calls.lock().unwrap();
    assert_eq!(*sync_calls, vec!["begin", "end:job-1"]);
}

#[tokio::test]
async fn users_scenario_limit_two_of_three_active() {
    // Three active users behind a limit of 2: exactly two documents, each
    // carrying the users provenance, framed body, and boolean metadata.
    let tables = users_tables(2);
    let rows = FakeRows {
        tables: HashMap::from([(
            "users".to_string(),
            vec![
                user_row(1, "ada", "ada@example.com"),
                user_row(2, "grace", "grace@example.com"),
                user_row(3, "edsger", "edsger@example.com"),
            ],
        )]),
    };
    let index = FakeIndex::default();

    let summary = run_sync(&ctx(&tables, &rows, &index)).await;
    assert_eq!(summary.status(), RunStatus::Success);
    assert_eq!(summary.documents_succeeded, 2);

    let published = index.published();
    assert_eq!(published.len(), 2);
    for doc in &published {
        assert_eq!(doc.source_table, "users");
        assert!(doc.body.contains("username: "));
        assert!(doc.body.contains("email: "));
        assert_eq!(
            doc.metadata.get("is_active"),
            Some(&MetadataValue::Boolean(true))
        );
    }
}

#[tokio::test]
async fn limit_caps_rows_read() {
    let tables = users_tables(2);
    let rows = FakeRows {
        tables: HashMap::from([(
            "users".to_string(),
            (1..=5)
                .map(|i| user_row(i, &format!("u{i}"), &format!("u{i}@example.com")))
                .collect(),
        )]),
    };
    let index = FakeIndex::default();

    let summary = run_sync(&ctx(&tables, &rows, &index)).await;
    assert_eq!(summary.documents_attempted, 2);
    assert_eq!(summary.documents_succeeded, 2);
}

#[tokio::test]
async fn failing_table_does_not_stop_the_run() {
    let tables = parse_tables(
        r#"[
            {"name": "missing", "title_field": "id", "content_fields": ["a"], "limit": 5},
            {"name": "users", "title_field": "id", "content_fields": ["username", "email"], "limit": 5}
        ]"#,
    )
    .unwrap();
    let rows = FakeRows {
        tables: HashMap::from([(
            "users".to_string(),
            vec![user_row(1, "ada", "ada@example.com")],
        )]),
    };
    let index = FakeIndex::default();

    let summary = run_sync(&ctx(&tables, &rows, &index)).await;

    assert_eq!(summary.status(), RunStatus::Partial);
    assert_eq!(summary.tables_failed, 1);
    assert_eq!(summary.tables_processed, 1);
    assert_eq!(summary.tables[0].status, TableStatus::Failed);
    assert_eq!(summary.tables[1].status, TableStatus::Synced);
    assert_eq!(summary.documents_succeeded, 1);
    assert_eq!(summary.failures[0].table, "missing");
}

#[tokio::test]
async fn rejected_document_does_not_fail_the_table() {
    let tables = users_tables(10);
    let rows = FakeRows {
        tables: HashMap::from([(
            "users".to_string(),
            vec![
                user_row(1, "ada", "ada@example.com"),
                user_row(2, "grace", "grace@example.com"),
            ],
        )]),
    };
    let index = FakeIndex {
        reject: vec![document_id("users", "2")],
        ..FakeIndex::default()
    };

    let summary = run_sync(&ctx(&tables, &rows, &index)).await;

    assert_eq!(summary.status(), RunStatus::Partial);
    assert_eq!(summary.tables_processed, 1);
    assert_eq!(summary.documents_succeeded, 1);
    assert_eq!(summary.documents_failed, 1);
    assert_eq!(
        summary.failures[0].document_id.as_deref(),
        Some(document_id("users", "2").as_str())
    );
}

#[tokio::test]
async fn unmappable_rows_are_skipped_and_counted() {
    let tables = users_tables(10);
    let rows = FakeRows {
        tables: HashMap::from([(
            "users".to_string(),
            vec![
                user_row(1, "ada", "ada@example.com"),
                // Null title: skipped, not fatal.
                row(&[
                    ("id", ScalarValue::Null),
                    ("username", ScalarValue::Text("ghost".to_string())),
                    ("email", ScalarValue::Text("ghost@example.com".to_string())),
                ]),
            ],
        )]),
    };
    let index = FakeIndex::default();

    let summary = run_sync(&ctx(&tables, &rows, &index)).await;

    assert_eq!(summary.documents_attempted, 1);
    assert_eq!(summary.documents_succeeded, 1);
    assert_eq!(summary.rows_skipped, 1);
    // A skipped row alone does not demote the run.
    assert_eq!(summary.status(), RunStatus::Success);
}

#[tokio::test]
async fn duplicate_titles_keep_first_row() {
    let tables = users_tables(10);
    let rows = FakeRows {
        tables: HashMap::from([(
            "users".to_string(),
            vec![
                user_row(1, "ada", "ada@example.com"),
                user_row(1, "ada-duplicate", "dup@example.com"),
            ],
        )]),
    };
    let index = FakeIndex::default();

    let summary = run_sync(&ctx(&tables, &rows, &index)).await;

    assert_eq!(summary.documents_attempted, 1);
    assert_eq!(summary.rows_skipped, 1);

    let puts = index.puts.lock().unwrap();
    assert_eq!(puts[0].len(), 1);
}

#[tokio::test]
async fn cancellation_skips_remaining_tables() {
    let tables = parse_tables(
        r#"[
            {"name": "users", "title_field": "id", "content_fields": ["username"], "limit": 5},
            {"name": "orders", "title_field": "id", "content_fields": ["status"], "limit": 5}
        ]"#,
    )
    .unwrap();
    let rows = FakeRows {
        tables: HashMap::new(),
    };
    let index = FakeIndex::default();

    let mut context = ctx(&tables, &rows, &index);
    context.cancel = Arc::new(AtomicBool::new(false));
    context.cancel.store(true, Ordering::SeqCst);

    let summary = run_sync(&context).await;

    assert_eq!(summary.tables_skipped, 2);
    assert_eq!(summary.status(), RunStatus::Partial);
    assert!(index.puts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn empty_table_is_synced_with_zero_documents() {
    let tables = users_tables(10);
    let rows = FakeRows {
        tables: HashMap::from([("users".to_string(), Vec::new())]),
    };
    let index = FakeIndex::default();

    let summary = run_sync(&ctx(&tables, &rows, &index)).await;

    assert_eq!(summary.status(), RunStatus::Success);
    assert_eq!(summary.tables_processed, 1);
    assert_eq!(summary.documents_attempted, 0);
    assert!(index.puts.lock().unwrap().is_empty());
}
