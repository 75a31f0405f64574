//! External execution boundary.
//!
//! A backend owns the whole lifecycle of one external system: submit work,
//! poll it, look a submission up by its idempotency tag, cancel it, and
//! parse its declared outputs. Backends never touch the catalog; the
//! carrier translates between catalog rows and backend calls.

pub mod local;
pub mod registry;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::entities::ContentStatus;
use crate::error::BackendError;
use crate::metadata::{FileSpec, OutputDescriptor};

pub use local::LocalBackend;
pub use registry::BackendRegistry;

/// Coarse state of an external submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// The external system answered but the state did not map to anything we
    /// know; treated like Running and re-polled.
    Unknown,
}

/// Snapshot returned by one poll call.
#[derive(Debug, Clone)]
pub struct PollResult {
    pub status: ExternalStatus,
    /// Per-file progress keyed by "scope:name", for file-granular work.
    pub file_statuses: HashMap<String, ContentStatus>,
    /// Where the finished submission declared its outputs, if anywhere.
    pub output: Option<OutputDescriptor>,
}

impl PollResult {
    pub fn status_only(status: ExternalStatus) -> Self {
        Self {
            status,
            file_statuses: HashMap::new(),
            output: None,
        }
    }
}

/// Everything a backend needs to start one submission.
#[derive(Debug, Clone)]
pub struct SubmitContext {
    /// Idempotency tag; the backend attaches it so a lost acknowledgement can
    /// be recovered through [`Backend::find_by_tag`].
    pub tag: String,
    pub scope: String,
    pub input_dataset: String,
    pub files: Vec<FileSpec>,
    pub command: Option<String>,
}

/// One external execution system ("condor", "rucio-rule", ...).
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Start a submission and return its external id.
    async fn submit(&self, ctx: &SubmitContext) -> Result<String, BackendError>;

    /// Look up an existing submission by idempotency tag. `Ok(None)` means
    /// the tag is definitely unknown to the external system.
    async fn find_by_tag(&self, tag: &str) -> Result<Option<String>, BackendError>;

    async fn poll(&self, external_id: &str) -> Result<PollResult, BackendError>;

    /// Ask the external system to stop a submission. Idempotent.
    async fn cancel(&self, _external_id: &str) -> Result<(), BackendError> {
        Ok(())
    }

    /// Read and validate the declared outputs of a completed submission.
    async fn parse_outputs(
        &self,
        external_id: &str,
        output: &OutputDescriptor,
    ) -> Result<serde_json::Value, BackendError>;
}
