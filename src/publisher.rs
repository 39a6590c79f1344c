//! Batched, retrying document upload to the index service.
//!
//! Documents are grouped into batches bounded by both a document count and a
//! serialized payload size, uploaded over the service's batch-put endpoint,
//! and retried on transient failure with exponential backoff. Documents the
//! service rejects individually are retried alone; documents that still fail
//! after the retry budget are recorded in the [`BatchResult`], never raised.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::IndexSettings;
use crate::error::PublishError;
use crate::models::{BatchResult, Document, DocumentFailure, MetadataValue};

/// Destination for normalized documents. The seam the orchestrator and tests
/// program against.
#[async_trait]
pub trait IndexService: Send + Sync {
    /// Upload up to one batch of documents. Returns the per-document
    /// rejections reported by the service (empty on full success).
    async fn put_documents(
        &self,
        documents: &[Document],
    ) -> Result<Vec<DocumentFailure>, PublishError>;

    /// Remove documents by id.
    async fn delete_documents(&self, ids: &[String]) -> Result<(), PublishError>;

    /// Mark the start of a sync pass. Services without sync markers return
    /// `None`.
    async fn begin_sync(&self) -> Result<Option<String>, PublishError> {
        Ok(None)
    }

    /// Mark the end of the sync pass started by [`IndexService::begin_sync`].
    async fn end_sync(&self, _sync_id: &str) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Batching and retry policy for one run.
#[derive(Debug, Clone)]
pub struct PublishLimits {
    /// Maximum documents per batch-put call.
    pub batch_size: usize,
    /// Maximum serialized payload per call.
    pub max_payload_bytes: usize,
    /// Retries after the first attempt, for transient failures only.
    pub max_retries: u32,
    /// Base backoff delay, doubled per attempt. Zero in tests.
    pub retry_backoff: Duration,
}

impl From<&IndexSettings> for PublishLimits {
    fn from(settings: &IndexSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            max_payload_bytes: settings.max_payload_bytes,
            max_retries: settings.max_retries,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Serialized size of one document as it goes over the wire.
fn document_size(doc: &Document) -> usize {
    wire_document(doc).to_string().len()
}

/// Group documents into batches within both the count and payload caps.
///
/// Order is preserved. A single document larger than the payload cap gets a
/// batch of its own rather than being dropped; the service decides its fate.
pub fn split_batches(documents: Vec<Document>, limits: &PublishLimits) -> Vec<Vec<Document>> {
    let mut batches = Vec::new();
    let mut current: Vec<Document> = Vec::new();
    let mut current_bytes = 0usize;

    for doc in documents {
        let size = document_size(&doc);
        let full = !current.is_empty()
            && (current.len() >= limits.batch_size
                || current_bytes + size > limits.max_payload_bytes);
        if full {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(doc);
    }
    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

/// Publish a document sequence through the service, applying the retry
/// policy. Infallible by design: every document ends up in either the
/// succeeded or failed list of the returned [`BatchResult`].
pub async fn publish(
    service: &dyn IndexService,
    documents: Vec<Document>,
    limits: &PublishLimits,
) -> BatchResult {
    let mut result = BatchResult::default();

    for batch in split_batches(documents, limits) {
        match put_with_retry(service, &batch, limits).await {
            Ok(rejections) => {
                let rejected: std::collections::HashMap<&str, &str> = rejections
                    .iter()
                    .map(|f| (f.id.as_str(), f.reason.as_str()))
                    .collect();

                for doc in &batch {
                    match rejected.get(doc.id.as_str()) {
                        None => result.succeeded.push(doc.id.clone()),
                        Some(reason) => {
                            warn!(id = %doc.id, %reason, "document rejected, retrying alone");
                            retry_single(service, doc, limits, &mut result).await;
                        }
                    }
                }
            }
            Err(e) => {
                // Batch transport exhausted its retries: every document in it
                // fails with the same reason.
                warn!(error = %e, count = batch.len(), "batch publish failed");
                for doc in &batch {
                    result.failed.push(DocumentFailure {
                        id: doc.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    result
}

/// Upload one batch, retrying transient failures with exponential backoff.
async fn put_with_retry(
    service: &dyn IndexService,
    batch: &[Document],
    limits: &PublishLimits,
) -> Result<Vec<DocumentFailure>, PublishError> {
    let mut last_err = None;

    for attempt in 0..=limits.max_retries {
        if attempt > 0 {
            let delay = limits.retry_backoff * (1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        match service.put_documents(batch).await {
            Ok(failures) => return Ok(failures),
            Err(e) if e.is_transient() => {
                debug!(attempt, error = %e, "transient publish failure, retrying");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| PublishError::Response("retry loop exhausted".to_string())))
}

/// Retry one rejected document on its own, then record the terminal outcome.
async fn retry_single(
    service: &dyn IndexService,
    doc: &Document,
    limits: &PublishLimits,
    result: &mut BatchResult,
) {
    let single = std::slice::from_ref(doc);

    for attempt in 1..=limits.max_retries {
        tokio::time::sleep(limits.retry_backoff * (1 << (attempt - 1).min(5))).await;

        match service.put_documents(single).await {
            Ok(failures) if failures.is_empty() => {
                result.succeeded.push(doc.id.clone());
                return;
            }
            Ok(failures) => {
                if attempt == limits.max_retries {
                    result.failed.extend(failures);
                    return;
                }
            }
            Err(e) => {
                if !e.is_transient() || attempt == limits.max_retries {
                    result.failed.push(DocumentFailure {
                        id: doc.id.clone(),
                        reason: e.to_string(),
                    });
                    return;
                }
            }
        }
    }

    // max_retries == 0: no individual retry budget, record the original
    // rejection.
    result.failed.push(DocumentFailure {
        id: doc.id.clone(),
        reason: "rejected by index service".to_string(),
    });
}

/// Serialize one document into the service's wire shape.
///
/// The body travels as a base64 blob; metadata becomes a typed attribute
/// list; the source table rides along for provenance filtering.
pub fn wire_document(doc: &Document) -> serde_json::Value {
    let blob = base64::engine::general_purpose::STANDARD.encode(doc.body.as_bytes());

    let attributes: Vec<serde_json::Value> = doc
        .metadata
        .iter()
        .map(|(name, value)| {
            let tagged = match value {
                MetadataValue::Str(s) => json!({ "stringValue": s }),
                MetadataValue::Integer(i) => json!({ "longValue": i }),
                MetadataValue::Number(f) => json!({ "doubleValue": f }),
                MetadataValue::Date(d) => json!({ "dateValue": d }),
                MetadataValue::Boolean(b) => json!({ "booleanValue": b }),
            };
            json!({ "name": name, "value": tagged })
        })
        .collect();

    json!({
        "id": doc.id,
        "title": doc.title,
        "content": { "blob": blob },
        "attributes": attributes,
        "sourceTable": doc.source_table,
    })
}

/// HTTP client for the index service's batch document API.
pub struct HttpIndexService {
    client: reqwest::Client,
    endpoint: String,
    index_id: String,
    data_source_id: Option<String>,
    api_token: Option<String>,
    sync_id: tokio::sync::Mutex<Option<String>>,
}

impl HttpIndexService {
    pub fn new(settings: &IndexSettings) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            index_id: settings.index_id.clone(),
            data_source_id: settings.data_source_id.clone(),
            api_token: std::env::var("INDEX_API_TOKEN").ok(),
            sync_id: tokio::sync::Mutex::new(None),
        })
    }

    fn url(&self, action: &str) -> String {
        format!("{}/v1/indexes/{}/{}", self.endpoint, self.index_id, action)
    }

    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, PublishError> {
        let mut request = self.client.post(url).json(&body);
        if let Some(ref token) = self.api_token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PublishError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(serde_json::Value::Null);
        }
        resp.json()
            .await
            .map_err(|e| PublishError::Response(format!("invalid response body: {}", e)))
    }
}

/// Pull per-document rejections out of a batch-put response.
///
/// The service reports `failedDocuments: [{id, error}]`; an absent or empty
/// list means every document in the call landed.
fn parse_failed_documents(response: &serde_json::Value) -> Result<Vec<DocumentFailure>, PublishError> {
    let Some(failed) = response.get("failedDocuments") else {
        return Ok(Vec::new());
    };
    let entries = failed
        .as_array()
        .ok_or_else(|| PublishError::Response("failedDocuments is not an array".to_string()))?;

    entries
        .iter()
        .map(|entry| {
            let id = entry
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    PublishError::Response("failedDocuments entry missing id".to_string())
                })?;
            let reason = entry
                .get("error")
                .map(|e| match e.as_str() {
                    Some(s) => s.to_string(),
                    None => e.to_string(),
                })
                .unwrap_or_else(|| "unspecified error".to_string());
            Ok(DocumentFailure {
                id: id.to_string(),
                reason,
            })
        })
        .collect()
}

#[async_trait]
impl IndexService for HttpIndexService {
    async fn put_documents(
        &self,
        documents: &[Document],
    ) -> Result<Vec<DocumentFailure>, PublishError> {
        let wire: Vec<serde_json::Value> = documents.iter().map(wire_document).collect();

        let mut body = json!({ "documents": wire });
        if let Some(ref sync_id) = *self.sync_id.lock().await {
            body["syncJobId"] = json!(sync_id);
        }

        let response = self.post_json(&self.url("documents:batchPut"), body).await?;
        parse_failed_documents(&response)
    }

    async fn delete_documents(&self, ids: &[String]) -> Result<(), PublishError> {
        let body = json!({ "documentIds": ids });
        self.post_json(&self.url("documents:batchDelete"), body)
            .await?;
        Ok(())
    }

    async fn begin_sync(&self) -> Result<Option<String>, PublishError> {
        let Some(ref data_source_id) = self.data_source_id else {
            return Ok(None);
        };

        let body = json!({ "dataSourceId": data_source_id });
        let response = self.post_json(&self.url("syncJobs:start"), body).await?;

        let sync_id = response
            .get("syncJobId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PublishError::Response("syncJobs:start returned no syncJobId".to_string()))?
            .to_string();

        *self.sync_id.lock().await = Some(sync_id.clone());
        Ok(Some(sync_id))
    }

    async fn end_sync(&self, sync_id: &str) -> Result<(), PublishError> {
        let Some(ref data_source_id) = self.data_source_id else {
            return Ok(());
        };

        let body = json!({ "dataSourceId": data_source_id, "syncJobId": sync_id });
        self.post_json(&self.url("syncJobs:stop"), body).await?;
        *self.sync_id.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn doc(id: &str, body: &str) -> Document {
        Document {
            id: id.to_string(),
            title: id.to_string(),
            body: body.to_string(),
            metadata: BTreeMap::new(),
            source_table: "users".to_string(),
        }
    }

    fn limits(batch_size: usize, max_payload_bytes: usize) -> PublishLimits {
        PublishLimits {
            batch_size,
            max_payload_bytes,
            max_retries: 2,
            retry_backoff: Duration::ZERO,
        }
    }

    /// Rejects a fixed set of ids on every call; records batch sizes.
    struct RejectingService {
        reject: Vec<String>,
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl IndexService for RejectingService {
        async fn put_documents(
            &self,
            documents: &[Document],
        ) -> Result<Vec<DocumentFailure>, PublishError> {
            self.calls.lock().unwrap().push(documents.len());
            Ok(documents
                .iter()
                .filter(|d| self.reject.contains(&d.id))
                .map(|d| DocumentFailure {
                    id: d.id.clone(),
                    reason: "invalid attribute".to_string(),
                })
                .collect())
        }

        async fn delete_documents(&self, _ids: &[String]) -> Result<(), PublishError> {
            Ok(())
        }
    }

    /// Fails transiently a fixed number of times, then accepts everything.
    struct FlakyService {
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl IndexService for FlakyService {
        async fn put_documents(
            &self,
            _documents: &[Document],
        ) -> Result<Vec<DocumentFailure>, PublishError> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(PublishError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            Ok(Vec::new())
        }

        async fn delete_documents(&self, _ids: &[String]) -> Result<(), PublishError> {
            Ok(())
        }
    }

    #[test]
    fn test_split_batches_by_count() {
        let docs: Vec<Document> = (0..7).map(|i| doc(&format!("d{i}"), "x")).collect();
        let batches = split_batches(docs, &limits(3, usize::MAX));
        assert_eq!(
            batches.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![3, 3, 1]
        );
    }

    #[test]
    fn test_split_batches_by_payload() {
        let small = doc("small", "x");
        let big = doc("big", &"y".repeat(400));
        let cap = document_size(&small) + document_size(&big) - 1;

        let batches = split_batches(vec![small, big], &limits(10, cap));
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0][0].id, "small");
        assert_eq!(batches[1][0].id, "big");
    }

    #[test]
    fn test_oversized_document_gets_own_batch() {
        let huge = doc("huge", &"z".repeat(1000));
        let batches = split_batches(vec![doc("a", "x"), huge, doc("b", "x")], &limits(10, 200));
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1][0].id, "huge");
    }

    #[test]
    fn test_split_preserves_order() {
        let docs: Vec<Document> = (0..5).map(|i| doc(&format!("d{i}"), "x")).collect();
        let batches = split_batches(docs, &limits(2, usize::MAX));
        let flat: Vec<&str> = batches
            .iter()
            .flatten()
            .map(|d| d.id.as_str())
            .collect();
        assert_eq!(flat, vec!["d0", "d1", "d2", "d3", "d4"]);
    }

    #[tokio::test]
    async fn test_publish_all_succeed() {
        let service = RejectingService {
            reject: vec![],
            calls: Mutex::new(Vec::new()),
        };
        let docs = vec![doc("a", "x"), doc("b", "y")];

        let result = publish(&service, docs, &limits(10, usize::MAX)).await;
        assert_eq!(result.succeeded, vec!["a", "b"]);
        assert!(result.failed.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_document_isolated() {
        let service = RejectingService {
            reject: vec!["bad".to_string()],
            calls: Mutex::new(Vec::new()),
        };
        let docs = vec![doc("good", "x"), doc("bad", "y"), doc("fine", "z")];

        let result = publish(&service, docs, &limits(10, usize::MAX)).await;
        assert_eq!(result.succeeded, vec!["good", "fine"]);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].id, "bad");

        // One batch call plus individual retries for the rejected document.
        let calls = service.calls.lock().unwrap();
        assert_eq!(calls[0], 3);
        assert!(calls[1..].iter().all(|&n| n == 1));
    }

    #[tokio::test]
    async fn test_transient_failure_retried_then_succeeds() {
        let service = FlakyService {
            failures_left: Mutex::new(2),
        };
        let result = publish(&service, vec![doc("a", "x")], &limits(10, usize::MAX)).await;
        assert_eq!(result.succeeded, vec!["a"]);
        assert!(result.failed.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_batch() {
        let service = FlakyService {
            failures_left: Mutex::new(100),
        };
        let result = publish(
            &service,
            vec![doc("a", "x"), doc("b", "y")],
            &limits(10, usize::MAX),
        )
        .await;
        assert!(result.succeeded.is_empty());
        assert_eq!(result.failed.len(), 2);
        assert!(result.failed[0].reason.contains("503"));
    }

    #[test]
    fn test_wire_document_shape() {
        let mut metadata = BTreeMap::new();
        metadata.insert("count".to_string(), MetadataValue::Integer(3));
        metadata.insert(
            "created_at".to_string(),
            MetadataValue::Date("2024-05-01".to_string()),
        );

        let wire = wire_document(&Document {
            id: "abc".to_string(),
            title: "42".to_string(),
            body: "username: ada".to_string(),
            metadata,
            source_table: "users".to_string(),
        });

        assert_eq!(wire["id"], "abc");
        assert_eq!(wire["sourceTable"], "users");
        let blob = wire["content"]["blob"].as_str().unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(blob)
            .unwrap();
        assert_eq!(decoded, b"username: ada");

        let attrs = wire["attributes"].as_array().unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0]["name"], "count");
        assert_eq!(attrs[0]["value"]["longValue"], 3);
        assert_eq!(attrs[1]["value"]["dateValue"], "2024-05-01");
    }

    #[test]
    fn test_parse_failed_documents() {
        let response = serde_json::json!({
            "failedDocuments": [
                { "id": "a", "error": "too large" },
                { "id": "b" }
            ]
        });
        let failures = parse_failed_documents(&response).unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].reason, "too large");
        assert_eq!(failures[1].reason, "unspecified error");
    }

    #[test]
    fn test_parse_response_without_failures() {
        let failures = parse_failed_documents(&serde_json::json!({})).unwrap();
        assert!(failures.is_empty());
    }
}
