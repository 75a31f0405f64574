use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::status::{Locking, RequestStatus};
use crate::lease::Lease;

/// Top-level unit of work submitted by a user: a workflow to be decomposed
/// into transforms. Mutated only by the clerk while holding its lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub scope: String,
    pub name: String,
    pub requester: String,
    /// External workload id; duplicate submissions with the same workload_id
    /// but different content are rejected as a conflict.
    pub workload_id: Option<u64>,
    pub status: RequestStatus,
    pub substatus: Option<RequestStatus>,
    pub priority: i32,
    pub expired_at: Option<DateTime<Utc>>,
    pub locking: Locking,
    pub lease: Option<Lease>,
    pub next_poll_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub errors: Option<String>,
    /// Workflow envelope, opaque to the catalog (see [`crate::metadata`]).
    pub request_metadata: serde_json::Value,
}

impl Request {
    pub fn new(
        scope: impl Into<String>,
        name: impl Into<String>,
        requester: impl Into<String>,
        workload_id: Option<u64>,
        request_metadata: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            scope: scope.into(),
            name: name.into(),
            requester: requester.into(),
            workload_id,
            status: RequestStatus::New,
            substatus: None,
            priority: 0,
            expired_at: Some(now + Duration::days(30)),
            locking: Locking::Idle,
            lease: None,
            next_poll_at: now,
            created_at: now,
            updated_at: now,
            errors: None,
            request_metadata,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_lifetime(mut self, days: i64) -> Self {
        self.expired_at = Some(Utc::now() + Duration::days(days));
        self
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
    fn new_request_defaults() {
        let req = Request::new("user.test", "req1", "panda", Some(1234), json!({}));
        assert_eq!(req.status, RequestStatus::New);
        assert_eq!(req.locking, Locking::Idle);
        assert!(req.lease.is_none());
        assert!(req.next_poll_at <= Utc::now());
        assert!(!req.is_expired());
    }

    #[test]
    fn expired_request_detected() {
        let mut req = Request::new("user.test", "req1", "panda", None, json!({}));
        req.expired_at = Some(Utc::now() - Duration::seconds(1));
        assert!(req.is_expired());
    }
}
