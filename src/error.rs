use thiserror::Error;

use crate::entities::status::{ProcessingStatus, RequestStatus, TransformStatus};

/// Top-level error type for catalog and agent operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    #[error(
        "Duplicate request: workload_id {workload_id} already exists as request {existing_id} with different content"
    )]
    DuplicateRequest { workload_id: u64, existing_id: u64 },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Stale version on transform {transform_id}: expected {expected}, found {found}")]
    StaleVersion {
        transform_id: u64,
        expected: u64,
        found: u64,
    },

    #[error("Invalid request status transition: {from} -> {to}")]
    InvalidRequestTransition {
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error("Invalid transform status transition: {from} -> {to}")]
    InvalidTransformTransition {
        from: TransformStatus,
        to: TransformStatus,
    },

    #[error("Invalid processing status transition: {from} -> {to}")]
    InvalidProcessingTransition {
        from: ProcessingStatus,
        to: ProcessingStatus,
    },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Errors surfaced by backend plugins.
///
/// The distinction matters for the state machine: a transient error keeps the
/// processing in its current status so the next poll cycle retries, while a
/// fatal error moves it to Failed with the message captured in its metadata.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("fatal backend error: {0}")]
    Fatal(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("output parse error: {0}")]
    Parse(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
