//! Agent liveness surface.
//!
//! Every agent loop periodically writes a heartbeat record through the
//! catalog; infrastructure monitoring derives a single OK/not-OK answer
//! from heartbeat age and hung-worker counts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One agent process's liveness record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub agent: String,
    pub hostname: String,
    pub pid: u32,
    pub num_active_workers: usize,
    pub num_hang_workers: usize,
    pub last_heartbeat: DateTime<Utc>,
}

impl HealthRecord {
    pub fn new(agent: impl Into<String>, active: usize, hung: usize) -> Self {
        Self {
            agent: agent.into(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            pid: std::process::id(),
            num_active_workers: active,
            num_hang_workers: hung,
            last_heartbeat: Utc::now(),
        }
    }

    /// Identity key for upserts: one record per agent per process.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.agent, self.hostname, self.pid)
    }

    pub fn is_alive(&self, max_age_secs: i64) -> bool {
        Utc::now() - self.last_heartbeat <= Duration::seconds(max_age_secs)
    }
}

/// Overall liveness: every known agent has a recent heartbeat and no agent
/// reports hung workers.
pub fn overall_ok(records: &[HealthRecord], max_age_secs: i64) -> bool {
    !records.is_empty()
        && records
            .iter()
            .all(|r| r.is_alive(max_age_secs) && r.num_hang_workers == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_heartbeat_is_alive() {
        let record = HealthRecord::new("clerk", 2, 0);
        assert!(record.is_alive(600));
        assert!(overall_ok(&[record], 600));
    }

    #[test]
    fn stale_heartbeat_is_not_ok() {
        let mut record = HealthRecord::new("carrier", 1, 0);
        record.last_heartbeat = Utc::now() - Duration::seconds(1200);
        assert!(!record.is_alive(600));
        assert!(!overall_ok(&[record], 600));
    }

    #[test]
    fn hung_workers_fail_overall_check() {
        let record = HealthRecord::new("transformer", 3, 1);
        assert!(record.is_alive(600));
        assert!(!overall_ok(std::slice::from_ref(&record), 600));
    }

    #[test]
    fn no_heartbeats_is_not_ok() {
        assert!(!overall_ok(&[], 600));
    }
}
