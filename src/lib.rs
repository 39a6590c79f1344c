//! # Rowsync
//!
//! A database-to-search-index synchronization engine.
//!
//! Rowsync periodically extracts rows from a relational database (MySQL),
//! converts them into searchable documents, and publishes them in batches to
//! a managed index service. Which tables to sync, and which columns become
//! the document title, body, and metadata, is declared in a JSON table
//! configuration — no code changes per table.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌─────────┐   ┌───────────┐
//! │  MySQL    │──▶│ Reader   │──▶│ Mapper  │──▶│ Publisher │──▶ index service
//! │ (source)  │   │ (stream) │   │ (pure)  │   │ (batched) │
//! └──────────┘   └─────────┘   └─────────┘   └───────────┘
//!                        orchestrated per table by `sync`
//! ```
//!
//! ## Failure isolation
//!
//! | Error | Scope | Effect |
//! |-------|-------|--------|
//! | [`error::ConfigError`] | run | abort before any I/O |
//! | [`error::CredentialError`] | run | abort before any sync |
//! | [`error::DataSourceError`] | table | table marked failed, run continues |
//! | [`error::MappingError`] | row | row skipped and counted |
//! | [`error::PublishError`] | batch/document | retried, then recorded |
//!
//! Document ids are a deterministic hash of table name and title value, so a
//! re-run after any failure overwrites rather than duplicates. No sync state
//! is persisted between runs.

pub mod config;
pub mod credentials;
pub mod error;
pub mod mapper;
pub mod models;
pub mod publisher;
pub mod reader;
pub mod sync;
