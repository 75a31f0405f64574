use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::{Locking, ProcessingStatus};
use crate::lease::Lease;

/// Granularity of the work a processing acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GranularityType {
    #[default]
    File,
    Event,
}

/// One concrete execution attempt of a transform against an external backend
/// (a batch cluster job, a workload-management task, a replication rule).
///
/// `submitted_id` is the append-only correlation to the external system: it
/// is set at most once and immutable afterwards, which the catalog enforces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Processing {
    pub id: u64,
    pub transform_id: u64,
    pub request_id: u64,
    pub status: ProcessingStatus,
    pub substatus: Option<ProcessingStatus>,
    /// Backend plugin name that submits/polls this processing.
    pub submitter: String,
    /// External job/task/rule id, set once at submission.
    pub submitted_id: Option<String>,
    pub granularity: Option<u64>,
    pub granularity_type: GranularityType,
    pub locking: Locking,
    pub lease: Option<Lease>,
    pub next_poll_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Serialized [`crate::metadata::ProcessingMeta`].
    pub processing_metadata: serde_json::Value,
    /// Parsed backend output, populated on completion.
    pub output_metadata: Option<serde_json::Value>,
}

impl Processing {
    pub fn new(transform_id: u64, request_id: u64, submitter: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            transform_id,
            request_id,
            status: ProcessingStatus::New,
            substatus: None,
            submitter: submitter.into(),
            submitted_id: None,
            granularity: None,
            granularity_type: GranularityType::File,
            locking: Locking::Idle,
            lease: None,
            next_poll_at: now,
            created_at: now,
            updated_at: now,
            submitted_at: None,
            finished_at: None,
            processing_metadata: serde_json::Value::Null,
            output_metadata: None,
        }
    }

    /// Tag attached to external submissions so a reclaimed processing can
    /// detect a prior submit instead of double-submitting.
    pub fn submission_tag(&self) -> String {
        format!("idds-proc-{}", self.id)
    }
}
