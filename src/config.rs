//! Configuration loading and the declarative table-sync model.
//!
//! Two layers of configuration:
//!
//! 1. **Settings** (TOML file) — database endpoint, credential provider,
//!    index service target, and publish limits.
//! 2. **Table definitions** (JSON array) — the declarative per-table sync
//!    model ([`TableConfig`]). Supplied inline in the settings file, as a
//!    sidecar file, or via the `TABLES_CONFIG` environment variable (which
//!    takes precedence), because the upstream contract delivers them as a
//!    single JSON string.
//!
//! Table definitions are validated all at once: any invalid entry fails the
//! whole parse with an aggregate error listing every problem, so a partial
//! misconfiguration never syncs silently.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Hard per-call document cap enforced by the index service.
pub const MAX_BATCH_DOCS: usize = 10;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub credentials: CredentialSettings,
    pub index: IndexSettings,
    #[serde(default)]
    pub tables: TablesSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_connect_retries: u32,
}

fn default_port() -> u16 {
    3306
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct CredentialSettings {
    /// `"secrets-manager"` or `"static"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Secret reference for the secrets-manager provider.
    #[serde(default)]
    pub secret_id: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for LocalStack and friends.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_provider() -> String {
    "static".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexSettings {
    pub endpoint: String,
    pub index_id: String,
    /// Passed through on sync begin/end markers when set.
    #[serde(default)]
    pub data_source_id: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_batch_size() -> usize {
    MAX_BATCH_DOCS
}
fn default_max_payload_bytes() -> usize {
    5 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TablesSettings {
    /// Inline JSON array of table definitions.
    #[serde(default)]
    pub config_json: Option<String>,
    /// Path to a JSON file with the table definitions.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Declarative description of which rows/fields from one source table to sync.
///
/// Loaded once per invocation, immutable thereafter.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TableConfig {
    pub name: String,
    pub title_field: String,
    pub content_fields: Vec<String>,
    #[serde(default)]
    pub metadata_fields: Vec<String>,
    /// SQL predicate applied verbatim; never validated beyond passthrough.
    #[serde(default)]
    pub where_clause: Option<String>,
    /// Caps rows fetched per run.
    pub limit: i64,
}

pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let settings: Settings = toml::from_str(&content)?;
    validate_settings(&settings)?;
    Ok(settings)
}

fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    let invalid = |msg: String| Err(ConfigError::Invalid(msg));

    if settings.database.host.trim().is_empty() {
        return invalid("database.host must not be empty".to_string());
    }
    if settings.database.database.trim().is_empty() {
        return invalid("database.database must not be empty".to_string());
    }

    match settings.credentials.provider.as_str() {
        "static" => {}
        "secrets-manager" => {
            if settings.credentials.secret_id.is_none() {
                return invalid(
                    "credentials.secret_id is required for the secrets-manager provider"
                        .to_string(),
                );
            }
            if settings.credentials.region.is_none() {
                return invalid(
                    "credentials.region is required for the secrets-manager provider".to_string(),
                );
            }
        }
        other => {
            return invalid(format!(
                "unknown credentials provider: '{}'. Must be static or secrets-manager",
                other
            ));
        }
    }

    if !settings.index.endpoint.starts_with("http://")
        && !settings.index.endpoint.starts_with("https://")
    {
        return invalid("index.endpoint must be an http(s) URL".to_string());
    }
    if settings.index.index_id.trim().is_empty() {
        return invalid("index.index_id must not be empty".to_string());
    }
    if settings.index.batch_size == 0 || settings.index.batch_size > MAX_BATCH_DOCS {
        return invalid(format!(
            "index.batch_size must be in 1..={}",
            MAX_BATCH_DOCS
        ));
    }
    if settings.index.max_payload_bytes == 0 {
        return invalid("index.max_payload_bytes must be > 0".to_string());
    }

    Ok(())
}

impl Settings {
    /// Resolve the raw tables JSON: `TABLES_CONFIG` env var, then the inline
    /// value, then the sidecar file.
    pub fn tables_json(&self) -> Result<String, ConfigError> {
        if let Ok(raw) = std::env::var("TABLES_CONFIG") {
            return Ok(raw);
        }
        if let Some(raw) = &self.tables.config_json {
            return Ok(raw.clone());
        }
        if let Some(path) = &self.tables.path {
            return std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            });
        }
        Err(ConfigError::Invalid(
            "no table definitions configured: set TABLES_CONFIG, tables.config_json, or tables.path"
                .to_string(),
        ))
    }

    pub fn load_tables(&self) -> Result<Vec<TableConfig>, ConfigError> {
        parse_tables(&self.tables_json()?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }
}

/// Parse and validate a JSON array of table definitions.
///
/// Pure and deterministic. All entries are validated upfront; any invalid
/// entry fails the whole batch with an aggregate [`ConfigError::InvalidTables`]
/// naming every problem.
pub fn parse_tables(raw: &str) -> Result<Vec<TableConfig>, ConfigError> {
    let tables: Vec<TableConfig> = serde_json::from_str(raw)?;

    let mut reasons = Vec::new();
    let mut seen_names = std::collections::HashSet::new();

    for (idx, table) in tables.iter().enumerate() {
        let mut fail = |msg: String| reasons.push(format!("table[{}]: {}", idx, msg));

        if table.name.trim().is_empty() {
            fail("name must not be empty".to_string());
        } else if !seen_names.insert(table.name.as_str()) {
            fail(format!("duplicate table name '{}'", table.name));
        }
        if table.title_field.trim().is_empty() {
            fail("title_field must not be empty".to_string());
        }
        if table.content_fields.is_empty() {
            fail("content_fields must not be empty".to_string());
        }
        if table.limit <= 0 {
            fail(format!("limit must be > 0, got {}", table.limit));
        }
        if table.content_fields.contains(&table.title_field) {
            fail(format!(
                "title_field '{}' must not also appear in content_fields",
                table.title_field
            ));
        }
        if table.metadata_fields.contains(&table.title_field) {
            fail(format!(
                "title_field '{}' must not also appear in metadata_fields",
                table.title_field
            ));
        }
        for field in table.all_fields() {
            if field.contains('`') {
                fail(format!("field name '{}' contains a backtick", field));
            }
        }
        if table.name.contains('`') {
            fail(format!("table name '{}' contains a backtick", table.name));
        }
    }

    if reasons.is_empty() {
        Ok(tables)
    } else {
        Err(ConfigError::InvalidTables { reasons })
    }
}

impl TableConfig {
    /// All configured fields in declaration order: title, content, metadata.
    pub fn all_fields(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.title_field)
            .chain(self.content_fields.iter())
            .chain(self.metadata_fields.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USERS_JSON: &str = r#"[{
        "name": "users",
        "title_field": "id",
        "content_fields": ["username", "email"],
        "metadata_fields": ["is_active"],
        "where_clause": "is_active = 1",
        "limit": 2
    }]"#;

    #[test]
    fn test_parse_valid_tables() {
        let tables = parse_tables(USERS_JSON).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "users");
        assert_eq!(tables[0].title_field, "id");
        assert_eq!(tables[0].content_fields, vec!["username", "email"]);
        assert_eq!(tables[0].where_clause.as_deref(), Some("is_active = 1"));
        assert_eq!(tables[0].limit, 2);
    }

    #[test]
    fn test_parse_is_deterministic() {
        let first = parse_tables(USERS_JSON).unwrap();
        let second = parse_tables(USERS_JSON).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unparseable_json_is_fatal() {
        let err = parse_tables("not json").unwrap_err();
        assert!(matches!(err, ConfigError::TablesJson(_)));
    }

    #[test]
    fn test_missing_required_key_is_fatal() {
        let err = parse_tables(r#"[{"name": "users"}]"#).unwrap_err();
        assert!(matches!(err, ConfigError::TablesJson(_)));
    }

    #[test]
    fn test_invalid_entries_reported_in_aggregate() {
        let raw = r#"[
            {"name": "users", "title_field": "id", "content_fields": [], "limit": 5},
            {"name": "", "title_field": "id", "content_fields": ["a"], "limit": 0},
            {"name": "ok", "title_field": "id", "content_fields": ["a"], "limit": 5}
        ]"#;
        let err = parse_tables(raw).unwrap_err();
        match err {
            ConfigError::InvalidTables { reasons } => {
                assert_eq!(reasons.len(), 3);
                assert!(reasons[0].contains("table[0]"));
                assert!(reasons[0].contains("content_fields"));
                assert!(reasons[1].contains("table[1]"));
                assert!(reasons[2].contains("limit"));
            }
            other => panic!("expected InvalidTables, got {:?}", other),
        }
    }

    #[test]
    fn test_title_field_overlap_rejected() {
        let raw = r#"[{
            "name": "users",
            "title_field": "username",
            "content_fields": ["username", "email"],
            "limit": 10
        }]"#;
        let err = parse_tables(raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTables { .. }));
    }

    #[test]
    fn test_duplicate_table_names_rejected() {
        let raw = r#"[
            {"name": "users", "title_field": "id", "content_fields": ["a"], "limit": 1},
            {"name": "users", "title_field": "id", "content_fields": ["a"], "limit": 1}
        ]"#;
        let err = parse_tables(raw).unwrap_err();
        match err {
            ConfigError::InvalidTables { reasons } => {
                assert!(reasons[0].contains("duplicate"));
            }
            other => panic!("expected InvalidTables, got {:?}", other),
        }
    }

    #[test]
    fn test_metadata_fields_default_empty() {
        let raw = r#"[{"name": "t", "title_field": "id", "content_fields": ["a"], "limit": 1}]"#;
        let tables = parse_tables(raw).unwrap();
        assert!(tables[0].metadata_fields.is_empty());
        assert!(tables[0].where_clause.is_none());
    }

    #[test]
    fn test_settings_validation() {
        let toml_str = r#"
            [database]
            host = "db.internal"
            database = "app"

            [credentials]
            provider = "secrets-manager"

            [index]
            endpoint = "https://search.example.com"
            index_id = "idx-1"
        "#;
        let settings: Settings = toml::from_str(toml_str).unwrap();
        // secrets-manager without secret_id must fail
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_settings_defaults() {
        let toml_str = r#"
            [database]
            host = "db.internal"
            database = "app"

            [credentials]

            [index]
            endpoint = "https://search.example.com"
            index_id = "idx-1"
        "#;
        let settings: Settings = toml::from_str(toml_str).unwrap();
        validate_settings(&settings).unwrap();
        assert_eq!(settings.database.port, 3306);
        assert_eq!(settings.credentials.provider, "static");
        assert_eq!(settings.index.batch_size, MAX_BATCH_DOCS);
        assert_eq!(settings.index.max_retries, 3);
    }

    #[test]
    fn test_batch_size_above_cap_rejected() {
        let toml_str = r#"
            [database]
            host = "db.internal"
            database = "app"

            [credentials]

            [index]
            endpoint = "https://search.example.com"
            index_id = "idx-1"
            batch_size = 50
        "#;
        let settings: Settings = toml::from_str(toml_str).unwrap();
        assert!(validate_settings(&settings).is_err());
    }
}
