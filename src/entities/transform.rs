use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::status::{Locking, TransformStatus};
use crate::lease::Lease;
use crate::metadata::WorkKind;

/// One task derived from a request's workflow, bound to a backend.
///
/// The `version` counter increments on every write; follow-on processing
/// chaining is guarded with a compare-and-set on it so two replicas cannot
/// both chain a new processing for the same transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transform {
    pub id: u64,
    pub request_id: u64,
    pub transform_type: WorkKind,
    pub status: TransformStatus,
    pub substatus: Option<TransformStatus>,
    pub priority: i32,
    pub retries: u32,
    pub version: u64,
    pub expired_at: Option<DateTime<Utc>>,
    pub locking: Locking,
    pub lease: Option<Lease>,
    pub next_poll_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub errors: Option<String>,
    /// Serialized [`crate::metadata::TransformMeta`].
    pub transform_metadata: serde_json::Value,
}

impl Transform {
    pub fn new(request_id: u64, transform_type: WorkKind, transform_metadata: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            request_id,
            transform_type,
            status: TransformStatus::New,
            substatus: None,
            priority: 0,
            retries: 0,
            version: 0,
            expired_at: Some(now + Duration::days(30)),
            locking: Locking::Idle,
            lease: None,
            next_poll_at: now,
            created_at: now,
            updated_at: now,
            errors: None,
            transform_metadata,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expired_at.is_some_and(|t| t < Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_transform_defaults() {
        let tf = Transform::new(7, WorkKind::StageIn, json!({}));
        assert_eq!(tf.request_id, 7);
        assert_eq!(tf.status, TransformStatus::New);
        assert_eq!(tf.version, 0);
        assert_eq!(tf.retries, 0);
        assert!(!tf.is_expired());
    }
}
