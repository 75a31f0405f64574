//! Advisory row leases.
//!
//! The database row is the lock: a claimed entity carries a [`Lease`] naming
//! the holder (host + pid + agent thread id) and when it was acquired. A
//! lease older than the staleness ttl is considered abandoned and may be
//! swept back to idle by any agent, which is what makes crash recovery
//! possible (at-least-once re-processing of the same logical state).

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a lease holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub hostname: String,
    pub pid: u32,
    pub agent_id: String,
}

impl LockOwner {
    /// Identity for the current process, tagged with the agent's short id.
    pub fn current(agent_id: &str) -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            hostname,
            pid: std::process::id(),
            agent_id: agent_id.to_string(),
        }
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.hostname, self.pid, self.agent_id)
    }
}

/// An acquired lease on a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: LockOwner,
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    pub fn acquire(owner: LockOwner) -> Self {
        Self {
            owner,
            acquired_at: Utc::now(),
        }
    }

    /// A lease is stale once it is older than the configured ttl; stale
    /// leases are reclaimable by other agents.
    pub fn is_stale(&self, ttl_seconds: i64) -> bool {
        Utc::now() - self.acquired_at > Duration::seconds(ttl_seconds)
    }

    /// Refresh the acquisition timestamp while keeping ownership.
    pub fn renew(&mut self) {
        self.acquired_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_lease_is_not_stale() {
        let lease = Lease::acquire(LockOwner::current("clerk-1"));
        assert!(!lease.is_stale(3600));
    }

    #[test]
    fn old_lease_is_stale() {
        let mut lease = Lease::acquire(LockOwner::current("clerk-1"));
        lease.acquired_at = Utc::now() - Duration::seconds(7200);
        assert!(lease.is_stale(3600));
        lease.renew();
        assert!(!lease.is_stale(3600));
    }

    #[test]
    fn owner_display_includes_identity() {
        let owner = LockOwner {
            hostname: "node01".into(),
            pid: 4242,
            agent_id: "carrier-a".into(),
        };
        assert_eq!(owner.to_string(), "node01:4242:carrier-a");
    }
}
