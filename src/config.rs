//! Service configuration loaded from `idds.toml`.
//!
//! Every section is optional; values not present in the file use defaults
//! that match a small single-node deployment. The config file path can be
//! overridden on the command line.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::catalog::ClaimOptions;
use crate::retry::RetryPolicy;
use crate::scheduler::{AgentSchedule, JanitorSchedule};

/// Loop timing for one agent, one `[section]` per agent in the file.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Idle sleep between empty poll cycles, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Delay before the same row is polled again, in seconds.
    #[serde(default = "default_poll_period_secs")]
    pub poll_period_secs: i64,
    /// Rows claimed per cycle.
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Random extra idle sleep, in seconds.
    #[serde(default = "default_jitter_secs")]
    pub jitter_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_poll_period_secs() -> i64 {
    10
}

fn default_bulk_size() -> usize {
    10
}

fn default_num_workers() -> usize {
    1
}

fn default_jitter_secs() -> u64 {
    3
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            poll_period_secs: default_poll_period_secs(),
            bulk_size: default_bulk_size(),
            num_workers: default_num_workers(),
            jitter_secs: default_jitter_secs(),
        }
    }
}

impl AgentConfig {
    pub fn schedule(&self, heartbeat_interval_secs: u64) -> AgentSchedule {
        AgentSchedule {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            jitter_secs: self.jitter_secs,
            heartbeat_interval: Duration::from_secs(heartbeat_interval_secs),
            num_workers: self.num_workers,
        }
    }

    pub fn claim_options(&self, lock_ttl_secs: i64) -> ClaimOptions {
        ClaimOptions {
            bulk_size: self.bulk_size,
            stale_ttl_secs: lock_ttl_secs,
        }
    }
}

/// Maintenance settings for the janitor loop.
#[derive(Debug, Clone, Deserialize)]
pub struct JanitorConfig {
    #[serde(default = "default_janitor_interval_secs")]
    pub interval_secs: u64,
    /// Days a terminal request stays in the live tables before archival.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

fn default_janitor_interval_secs() -> u64 {
    300
}

fn default_retention_days() -> i64 {
    30
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_janitor_interval_secs(),
            retention_days: default_retention_days(),
        }
    }
}

impl JanitorConfig {
    pub fn schedule(&self, lock_ttl_secs: i64) -> JanitorSchedule {
        JanitorSchedule {
            interval: Duration::from_secs(self.interval_secs),
            lock_ttl_secs,
            retention_secs: self.retention_days * 24 * 3600,
        }
    }
}

/// Top-level configuration loaded from `idds.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct IddsConfig {
    #[serde(default)]
    pub clerk: AgentConfig,
    #[serde(default)]
    pub transformer: AgentConfig,
    #[serde(default)]
    pub carrier: AgentConfig,
    #[serde(default)]
    pub conductor: AgentConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub janitor: JanitorConfig,
    /// Heartbeat write period shared by all agents, in seconds.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Working directory handed to the local backend.
    #[serde(default = "default_workdir")]
    pub workdir: String,
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_workdir() -> String {
    "/tmp/idds".to_string()
}

impl Default for IddsConfig {
    fn default() -> Self {
        Self {
            clerk: AgentConfig::default(),
            transformer: AgentConfig::default(),
            carrier: AgentConfig::default(),
            conductor: AgentConfig::default(),
            retry: RetryPolicy::default(),
            janitor: JanitorConfig::default(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            workdir: default_workdir(),
        }
    }
}

impl IddsConfig {
    /// Load configuration from the given path, or from `idds.toml` in the
    /// current directory. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> crate::error::Result<Self> {
        let path = path.unwrap_or_else(|| Path::new("idds.toml"));
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_when_file_missing() {
        let config = IddsConfig::load(Some(Path::new("/nonexistent/idds.toml"))).unwrap();
        assert_eq!(config.clerk.poll_interval_secs, 10);
        assert_eq!(config.retry.max_replay_times, 3);
        assert_eq!(config.janitor.retention_days, 30);
        assert_eq!(config.heartbeat_interval_secs, 60);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idds.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[carrier]\npoll_interval_secs = 5\nnum_workers = 4\n\n[retry]\nbase_delay_secs = 30\n"
        )
        .unwrap();

        let config = IddsConfig::load(Some(&path)).unwrap();
        assert_eq!(config.carrier.poll_interval_secs, 5);
        assert_eq!(config.carrier.num_workers, 4);
        // Unset fields in a present section still default.
        assert_eq!(config.carrier.bulk_size, 10);
        assert_eq!(config.retry.base_delay_secs, 30);
        assert_eq!(config.retry.max_replay_times, 3);
        // Untouched sections default entirely.
        assert_eq!(config.clerk.num_workers, 1);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idds.toml");
        std::fs::write(&path, "carrier = \"not a table\"").unwrap();
        assert!(IddsConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn schedule_conversion() {
        let config = AgentConfig::default();
        let schedule = config.schedule(60);
        assert_eq!(schedule.poll_interval, Duration::from_secs(10));
        assert_eq!(schedule.num_workers, 1);
        let options = config.claim_options(3600);
        assert_eq!(options.bulk_size, 10);
        assert_eq!(options.stale_ttl_secs, 3600);
    }
}
