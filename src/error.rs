//! Error taxonomy for the sync engine.
//!
//! Errors are scoped by blast radius:
//! - [`ConfigError`] and [`CredentialError`] are run-fatal — they abort the
//!   invocation before any row is read or document published.
//! - [`DataSourceError`] is scoped to a single table; the run records it and
//!   continues with the remaining tables.
//! - [`MappingError`] is scoped to a single row; the row is skipped and counted.
//! - [`PublishError`] is scoped to a batch or document; the publisher retries
//!   per policy and records permanent failures instead of raising.

use thiserror::Error;

/// Invalid or missing configuration. Fatal — aborts the entire run.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file: {0}")]
    Settings(#[from] toml::de::Error),

    #[error("tables config is not a valid JSON array of table definitions: {0}")]
    TablesJson(#[from] serde_json::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),

    /// Aggregate of every invalid table definition, reported together so a
    /// partial misconfiguration is never silently skipped.
    #[error("invalid table definitions:\n{}", reasons.join("\n"))]
    InvalidTables { reasons: Vec<String> },
}

/// Secret fetch or parsing failure. Fatal — no sync is attempted.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("{0} environment variable not set")]
    MissingEnv(&'static str),

    #[error("secret fetch failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("secret fetch failed: {0}")]
    Fetch(String),

    #[error("secret must be a JSON object with 'username' and 'password': {0}")]
    Malformed(String),
}

/// Connection or query failure. Scoped to one table; the run continues.
#[derive(Error, Debug)]
pub enum DataSourceError {
    #[error("database connection failed after {attempts} attempt(s): {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("query against table '{table}' failed: {source}")]
    Query {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to decode column '{column}': {reason}")]
    Decode { column: String, reason: String },
}

/// Row-level transformation failure. The row is skipped and counted.
#[derive(Error, Debug)]
pub enum MappingError {
    #[error("title field '{field}' is missing from the row")]
    MissingTitle { field: String },

    #[error("title field '{field}' is null")]
    NullTitle { field: String },
}

/// Upload failure at batch or document granularity.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("index request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("index service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected index response: {0}")]
    Response(String),
}

impl PublishError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Rate limits (429), server errors (5xx), and network failures are
    /// transient; other client errors and malformed responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            PublishError::Transport(_) => true,
            PublishError::Status { status, .. } => *status == 429 || *status >= 500,
            PublishError::Response(_) => false,
        }
    }
}
