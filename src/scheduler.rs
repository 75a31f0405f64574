//! Agent execution plumbing.
//!
//! Every agent is a poll loop: claim a batch, process it, commit, sleep when
//! idle. This module owns the loop mechanics so the agents themselves only
//! implement [`AgentHandler::run_cycle`]. Replica workers are safe because
//! all claims are atomic at the catalog; the loop adds jitter so replicas do
//! not wake in lock-step.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::error::Result;
use crate::health::HealthRecord;
use crate::retry::jittered;

#[async_trait]
pub trait AgentHandler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// One poll cycle: claim a batch, process it, commit every row. Returns
    /// the number of items handled; zero means idle. Per-item failures must
    /// be absorbed into row state (status/errors), not returned, so one bad
    /// row never stalls the loop.
    async fn run_cycle(&self) -> Result<usize>;
}

/// Loop timing knobs for one agent.
#[derive(Debug, Clone)]
pub struct AgentSchedule {
    pub poll_interval: Duration,
    /// Extra idle-sleep slack, randomized per cycle.
    pub jitter_secs: u64,
    pub heartbeat_interval: Duration,
    pub num_workers: usize,
}

impl Default for AgentSchedule {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            jitter_secs: 3,
            heartbeat_interval: Duration::from_secs(60),
            num_workers: 1,
        }
    }
}

/// Per-worker liveness bookkeeping for one agent. Workers stamp their slot
/// at the top of every cycle; a slot that stops moving marks a hung worker.
struct WorkerActivity {
    last_seen: Vec<AtomicI64>,
}

impl WorkerActivity {
    fn new(workers: usize) -> Self {
        let now = Utc::now().timestamp();
        Self {
            last_seen: (0..workers).map(|_| AtomicI64::new(now)).collect(),
        }
    }

    fn beat(&self, worker: usize) {
        self.last_seen[worker].store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    fn hung_count(&self, threshold_secs: i64) -> usize {
        let cutoff = Utc::now().timestamp() - threshold_secs;
        self.last_seen
            .iter()
            .filter(|seen| seen.load(Ordering::Relaxed) < cutoff)
            .count()
    }
}

/// Spawn one agent: `num_workers` poll loops plus a heartbeat task, all tied
/// to `cancel`. Cancellation is cooperative; a worker finishes its current
/// cycle before exiting, so no claimed row is abandoned mid-flight.
pub fn spawn_agent(
    join: &mut JoinSet<()>,
    handler: Arc<dyn AgentHandler>,
    catalog: Arc<dyn Catalog>,
    schedule: AgentSchedule,
    cancel: CancellationToken,
) {
    let workers = schedule.num_workers.max(1);
    let activity = Arc::new(WorkerActivity::new(workers));
    for worker in 0..workers {
        let handler = Arc::clone(&handler);
        let schedule = schedule.clone();
        let cancel = cancel.clone();
        let activity = Arc::clone(&activity);
        join.spawn(async move {
            worker_loop(handler, schedule, worker, activity, cancel).await;
        });
    }

    let name = handler.name();
    let interval = schedule.heartbeat_interval;
    // A worker is hung once several idle periods pass without it reaching
    // the top of its loop.
    let hang_threshold =
        3 * (schedule.poll_interval.as_secs() + schedule.jitter_secs).max(1) as i64;
    join.spawn(async move {
        heartbeat_loop(name, workers, activity, catalog, interval, hang_threshold, cancel).await;
    });
}

async fn worker_loop(
    handler: Arc<dyn AgentHandler>,
    schedule: AgentSchedule,
    worker: usize,
    activity: Arc<WorkerActivity>,
    cancel: CancellationToken,
) {
    let name = handler.name();
    info!(agent = name, worker, "worker started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        activity.beat(worker);
        let idle_sleep = match handler.run_cycle().await {
            // More work may be waiting; go straight into the next cycle.
            Ok(n) if n > 0 => {
                debug!(agent = name, worker, handled = n, "cycle complete");
                continue;
            }
            Ok(_) => jittered(schedule.poll_interval, schedule.jitter_secs),
            Err(error) => {
                warn!(agent = name, worker, %error, "cycle failed");
                jittered(schedule.poll_interval, schedule.jitter_secs)
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(idle_sleep) => {}
        }
    }
    info!(agent = name, worker, "worker stopped");
}

async fn heartbeat_loop(
    name: &'static str,
    workers: usize,
    activity: Arc<WorkerActivity>,
    catalog: Arc<dyn Catalog>,
    interval: Duration,
    hang_threshold_secs: i64,
    cancel: CancellationToken,
) {
    loop {
        let hung = activity.hung_count(hang_threshold_secs);
        let record = HealthRecord::new(name, workers - hung, hung);
        if let Err(error) = catalog.upsert_heartbeat(record) {
            warn!(agent = name, %error, "heartbeat write failed");
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Maintenance knobs for the janitor loop.
#[derive(Debug, Clone)]
pub struct JanitorSchedule {
    pub interval: Duration,
    pub lock_ttl_secs: i64,
    /// How long terminal requests stay in the live tables before archival.
    pub retention_secs: i64,
}

impl Default for JanitorSchedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            lock_ttl_secs: 3600,
            retention_secs: 30 * 24 * 3600,
        }
    }
}

/// Background maintenance: recover stale leases and archive old terminal
/// requests. One instance per deployment is enough; extras are harmless.
pub fn spawn_janitor(
    join: &mut JoinSet<()>,
    catalog: Arc<dyn Catalog>,
    schedule: JanitorSchedule,
    cancel: CancellationToken,
) {
    join.spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(schedule.interval) => {}
            }
            match catalog.clean_stale_locks(schedule.lock_ttl_secs) {
                Ok(0) => {}
                Ok(recovered) => info!(recovered, "recovered stale locks"),
                Err(error) => warn!(%error, "stale lock sweep failed"),
            }
            match catalog.archive_terminal_requests(schedule.retention_secs) {
                Ok(ids) if !ids.is_empty() => info!(archived = ids.len(), "archived requests"),
                Ok(_) => {}
                Err(error) => warn!(%error, "archive sweep failed"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::catalog::{Catalog, ClaimOptions, MemoryCatalog};
    use crate::entities::{Request, RequestStatus};
    use crate::lease::LockOwner;
    use serde_json::json;

    struct CountingHandler {
        remaining: AtomicUsize,
        cycles: AtomicUsize,
    }

    #[async_trait]
    impl AgentHandler for CountingHandler {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run_cycle(&self) -> Result<usize> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(0);
            }
            self.remaining.store(left - 1, Ordering::SeqCst);
            Ok(1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn worker_drains_work_then_idles_and_heartbeats() {
        let handler = Arc::new(CountingHandler {
            remaining: AtomicUsize::new(3),
            cycles: AtomicUsize::new(0),
        });
        let catalog: Arc<dyn Catalog> = Arc::new(MemoryCatalog::new());
        let cancel = CancellationToken::new();
        let mut join = JoinSet::new();

        spawn_agent(
            &mut join,
            Arc::clone(&handler) as Arc<dyn AgentHandler>,
            Arc::clone(&catalog),
            AgentSchedule {
                poll_interval: Duration::from_secs(5),
                jitter_secs: 0,
                heartbeat_interval: Duration::from_secs(10),
                num_workers: 1,
            },
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
        while join.join_next().await.is_some() {}

        // Three busy cycles plus several idle ones.
        assert!(handler.cycles.load(Ordering::SeqCst) > 3);
        assert_eq!(handler.remaining.load(Ordering::SeqCst), 0);
        let beats = catalog.get_heartbeats().unwrap();
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].agent, "counting");
        assert_eq!(beats[0].num_active_workers, 1);
        assert_eq!(beats[0].num_hang_workers, 0);
    }

    #[test]
    fn stalled_worker_is_reported_hung() {
        let activity = WorkerActivity::new(2);
        activity.last_seen[0].store(Utc::now().timestamp() - 600, Ordering::Relaxed);
        assert_eq!(activity.hung_count(300), 1);
        // A fresh beat clears the slot again.
        activity.beat(0);
        assert_eq!(activity.hung_count(300), 0);
    }

    struct FailingHandler {
        cycles: AtomicUsize,
    }

    #[async_trait]
    impl AgentHandler for FailingHandler {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn run_cycle(&self) -> Result<usize> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            Err(crate::error::Error::Config("boom".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_errors_do_not_kill_the_loop() {
        let handler = Arc::new(FailingHandler {
            cycles: AtomicUsize::new(0),
        });
        let catalog: Arc<dyn Catalog> = Arc::new(MemoryCatalog::new());
        let cancel = CancellationToken::new();
        let mut join = JoinSet::new();

        spawn_agent(
            &mut join,
            Arc::clone(&handler) as Arc<dyn AgentHandler>,
            catalog,
            AgentSchedule {
                poll_interval: Duration::from_secs(5),
                jitter_secs: 0,
                heartbeat_interval: Duration::from_secs(60),
                num_workers: 1,
            },
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(22)).await;
        cancel.cancel();
        while join.join_next().await.is_some() {}

        assert!(handler.cycles.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn janitor_recovers_stale_locks() {
        let catalog = Arc::new(MemoryCatalog::new());
        let id = catalog
            .add_request(Request::new("user.test", "r", "panda", None, json!({})))
            .unwrap();
        let owner = LockOwner {
            hostname: "dead-node".into(),
            pid: 9,
            agent_id: "clerk".into(),
        };
        catalog
            .claim_requests(&[RequestStatus::New], &owner, ClaimOptions::default())
            .unwrap();
        assert!(catalog.get_request(id).unwrap().lease.is_some());

        // ttl of zero makes any lease stale on the first sweep.
        let cancel = CancellationToken::new();
        let mut join = JoinSet::new();
        spawn_janitor(
            &mut join,
            Arc::clone(&catalog) as Arc<dyn Catalog>,
            JanitorSchedule {
                interval: Duration::from_secs(10),
                lock_ttl_secs: 0,
                retention_secs: 3600,
            },
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(25)).await;
        cancel.cancel();
        while join.join_next().await.is_some() {}

        let req = catalog.get_request(id).unwrap();
        assert!(req.lease.is_none());
    }
}
