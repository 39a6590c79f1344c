//! Row-to-document transformation.
//!
//! Pure and deterministic: no I/O. A row either becomes a [`Document`] or is
//! rejected with a typed [`MappingError`] — never a document with an empty
//! title. Body field order follows the config so semantically similar rows
//! produce comparably-ordered bodies for the downstream index.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use crate::config::TableConfig;
use crate::error::MappingError;
use crate::models::{Document, MetadataValue, RowMap, ScalarValue};

/// Derive the stable document id for a table/title pair.
///
/// A pure function of its inputs: the same row (by title) across two runs
/// yields the same id, so a repeated sync overwrites instead of duplicating.
/// Ids are namespaced by table name, which also makes concurrent table syncs
/// collision-free.
pub fn document_id(table: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(table.as_bytes());
    hasher.update([0x1f]);
    hasher.update(title.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Convert one raw row into a normalized document.
pub fn map_row(row: &RowMap, table: &TableConfig) -> Result<Document, MappingError> {
    let title = match row.get(&table.title_field) {
        None => {
            return Err(MappingError::MissingTitle {
                field: table.title_field.clone(),
            })
        }
        Some(ScalarValue::Null) => {
            return Err(MappingError::NullTitle {
                field: table.title_field.clone(),
            })
        }
        Some(value) => render_scalar(value),
    };

    // Content fields in config order, non-null only, framed with the field
    // name so the value keeps its searchable context.
    let mut lines = Vec::new();
    for field in &table.content_fields {
        if let Some(value) = row.get(field) {
            if !value.is_null() {
                lines.push(format!("{}: {}", field, render_scalar(value)));
            }
        }
    }
    let body = lines.join("\n");

    let mut metadata = BTreeMap::new();
    for field in &table.metadata_fields {
        if let Some(value) = row.get(field) {
            if !value.is_null() {
                metadata.insert(field.clone(), coerce_metadata(value));
            }
        }
    }

    Ok(Document {
        id: document_id(&table.name, &title),
        title,
        body,
        metadata,
        source_table: table.name.clone(),
    })
}

fn render_scalar(value: &ScalarValue) -> String {
    match value {
        ScalarValue::Null => String::new(),
        ScalarValue::Boolean(b) => b.to_string(),
        ScalarValue::Integer(i) => i.to_string(),
        ScalarValue::Float(f) => f.to_string(),
        ScalarValue::Text(s) => s.clone(),
    }
}

/// Tag a metadata value with an explicit type for the index service.
///
/// Values that arrive typed from the database keep their type. Text goes
/// through detection: ISO-8601-looking strings become dates, numeric strings
/// become numbers, everything else stays a string. Detection order matters —
/// a bare year like `"2024"` is a number, but `"2024-05-01"` is a date.
pub fn coerce_metadata(value: &ScalarValue) -> MetadataValue {
    match value {
        ScalarValue::Null => MetadataValue::Str(String::new()),
        ScalarValue::Boolean(b) => MetadataValue::Boolean(*b),
        ScalarValue::Integer(i) => MetadataValue::Integer(*i),
        ScalarValue::Float(f) => MetadataValue::Number(*f),
        ScalarValue::Text(s) => coerce_text(s),
    }
}

fn coerce_text(s: &str) -> MetadataValue {
    let trimmed = s.trim();

    if let Some(date) = parse_iso_like(trimmed) {
        return MetadataValue::Date(date);
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return MetadataValue::Integer(i);
    }
    if looks_numeric(trimmed) {
        if let Ok(f) = trimmed.parse::<f64>() {
            if f.is_finite() {
                return MetadataValue::Number(f);
            }
        }
    }

    MetadataValue::Str(s.to_string())
}

/// Restrict float detection to digit-shaped text so words like "infinity"
/// stay strings.
fn looks_numeric(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().any(|b| b.is_ascii_digit())
        && s.bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'))
}

/// Normalize ISO-8601-looking text.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, and bare `YYYY-MM-DD`;
/// datetimes come back `Z`-suffixed, bare dates stay dates.
fn parse_iso_like(s: &str) -> Option<String> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(
            dt.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(format!("{}Z", dt.format("%Y-%m-%dT%H:%M:%S")));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.format("%Y-%m-%d").to_string());
    }
    None
}
