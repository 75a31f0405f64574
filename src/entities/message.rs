use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::MessageStatus;
use crate::metadata::WorkKind;

/// Routing tag selecting where a message is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDestination {
    Outside,
    Clerk,
    Transformer,
    Carrier,
    Conductor,
}

/// Granularity of the event a message reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageLevel {
    File,
    Collection,
    Work,
}

/// Wire message type string, e.g. "work_stagein" or "file_processing".
pub fn message_type(kind: WorkKind, level: MessageLevel) -> String {
    let level = match level {
        MessageLevel::File => "file",
        MessageLevel::Collection => "collection",
        MessageLevel::Work => "work",
    };
    format!("{level}_{}", kind.name())
}

/// An outbound notification record, delivered at-least-once by the conductor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub msg_type: String,
    pub status: MessageStatus,
    pub destination: MessageDestination,
    pub request_id: Option<u64>,
    pub transform_id: Option<u64>,
    pub processing_id: Option<u64>,
    pub retries: u32,
    /// Earliest time a retry tier may pick this message up again.
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Message {
    pub fn new(
        msg_type: impl Into<String>,
        destination: MessageDestination,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            msg_type: msg_type.into(),
            status: MessageStatus::New,
            destination,
            request_id: None,
            transform_id: None,
            processing_id: None,
            retries: 0,
            next_retry_at: now,
            created_at: now,
            updated_at: now,
            payload,
        }
    }

    pub fn for_work(mut self, request_id: u64, transform_id: u64, processing_id: Option<u64>) -> Self {
        self.request_id = Some(request_id);
        self.transform_id = Some(transform_id);
        self.processing_id = processing_id;
        self
    }
}
