//! Failure taxonomy shared by the ingestion pipeline and the search engine.
//!
//! Only [`StoreError`] is allowed to abort an ingest run or a search request; the other kinds
//! are contained by the component that owns the failing call.

use std::time::Duration;

use thiserror::Error;

/// Failure fetching or parsing one page of one source.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport-level failure (DNS, connect, body read).
    #[error("http error for {url}: {source}")]
    Http {
        /// Page URL that failed.
        url: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
    /// The site answered with a non-success status code.
    #[error("{url} returned status {status}")]
    Status {
        /// Page URL that failed.
        url: String,
        /// HTTP status code.
        status: u16,
    },
    /// The page fetch exceeded its timeout.
    #[error("fetching {url} timed out after {timeout:?}")]
    Timeout {
        /// Page URL that timed out.
        url: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// The document no longer has the layout the adapter expects.
    #[error("markup mismatch on {url}: {detail}")]
    Markup {
        /// Page URL whose layout changed.
        url: String,
        /// What was missing.
        detail: String,
    },
}

impl FetchError {
    /// Short label used for per-source error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Status { .. } => "status",
            Self::Timeout { .. } => "timeout",
            Self::Markup { .. } => "markup",
        }
    }
}

/// Failure computing an embedding vector.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Transport-level failure talking to the provider.
    #[error("embedding request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Provider answered with a non-retryable (or exhausted) error status.
    #[error("embedding provider returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
    /// Provider response did not have the expected shape.
    #[error("malformed embedding response: {0}")]
    Malformed(String),
    /// The call exceeded its timeout.
    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),
    /// No provider is configured (e.g. missing API key).
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),
}

/// Failure turning a free-text query into filters. Never surfaced to callers.
#[derive(Debug, Error)]
pub enum QueryUnderstandingError {
    /// The language model call failed or timed out.
    #[error("language model call failed: {0}")]
    Provider(String),
    /// The model answered without a JSON object.
    #[error("no JSON object in model response")]
    NoJson,
    /// The JSON object could not be decoded.
    #[error("invalid JSON in model response: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure of the shared store. Aborts the enclosing operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database driver error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    /// The store call exceeded its timeout.
    #[error("store call `{operation}` timed out after {timeout:?}")]
    Timeout {
        /// Operation label.
        operation: &'static str,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// A stored value could not be converted into the record shape.
    #[error("invalid stored value: {0}")]
    Decode(String),
    /// Record with the given id does not exist.
    #[error("vehicle {0} not found")]
    NotFound(i64),
}
