//! Public interface types for the films data service
//!
//! Request/response records for the query API plus the crate-wide error type.
//! Layer-specific errors (`DatabaseError`, `IndexerError`, `UpstreamError`)
//! convert into `FilmDataError` at the service boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// RECORDS
// ═══════════════════════════════════════════════════════════════════════════════

/// Public shape of one film in an API response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilmResult {
    /// Upstream film id
    pub key: String,
    pub title: String,
    pub year: i32,
    pub rank: i64,
}

/// Who is calling the query API
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Inbound application id, when the caller sent one
    pub app_id: Option<String>,
    pub is_admin: bool,
}

impl CallerIdentity {
    pub fn app(app_id: impl Into<String>) -> Self {
        Self { app_id: Some(app_id.into()), is_admin: false }
    }

    pub fn admin() -> Self {
        Self { app_id: None, is_admin: true }
    }
}

/// Parameters accepted by the query API
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRequest {
    pub q: Option<String>,
    pub id: Option<String>,
    /// Opaque continuation token for the next page of a query search
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub debug: bool,
    pub callback: Option<String>,
}

impl QueryRequest {
    pub fn search(q: impl Into<String>) -> Self {
        Self { q: Some(q.into()), ..Default::default() }
    }

    pub fn lookup(id: impl Into<String>) -> Self {
        Self { id: Some(id.into()), ..Default::default() }
    }
}

/// Outcome class of a query API call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Ok,
    Forbidden,
}

/// Rendered query API response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    pub status: QueryStatus,
    /// JSON (optionally JSONP-wrapped), or empty
    pub body: String,
    /// Cursor for the following page of a query search, when one may exist
    pub next_cursor: Option<String>,
}

impl QueryResponse {
    pub const CONTENT_TYPE: &'static str = "application/json; charset=utf-8";

    pub fn ok(body: String) -> Self {
        Self { status: QueryStatus::Ok, body, next_cursor: None }
    }

    pub fn with_next_cursor(mut self, cursor: Option<String>) -> Self {
        self.next_cursor = cursor;
        self
    }

    pub fn empty() -> Self {
        Self::ok(String::new())
    }

    pub fn forbidden() -> Self {
        Self { status: QueryStatus::Forbidden, body: String::new(), next_cursor: None }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR TYPE
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for films data operations
#[derive(Debug, Error)]
pub enum FilmDataError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Index error: {0}")]
    IndexError(String),
    #[error("Upstream error: {0}")]
    UpstreamError(String),
    #[error("Malformed upstream response: {0}")]
    MalformedUpstreamResponse(String),
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<crate::database::DatabaseError> for FilmDataError {
    fn from(e: crate::database::DatabaseError) -> Self {
        FilmDataError::DatabaseError(e.to_string())
    }
}

impl From<crate::indexer::IndexerError> for FilmDataError {
    fn from(e: crate::indexer::IndexerError) -> Self {
        FilmDataError::IndexError(e.to_string())
    }
}

impl From<crate::upstream::UpstreamError> for FilmDataError {
    fn from(e: crate::upstream::UpstreamError) -> Self {
        FilmDataError::UpstreamError(e.to_string())
    }
}

impl From<tokio::task::JoinError> for FilmDataError {
    fn from(e: tokio::task::JoinError) -> Self {
        FilmDataError::IndexError(format!("index task did not complete: {}", e))
    }
}
