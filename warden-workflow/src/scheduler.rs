//! Scheduled-Step Background Task
//!
//! Polls the [`WorkflowStateStore`] for due records, claims them for this
//! node and resumes each through the [`WorkflowRunner`]. A second, slower
//! timer returns claims abandoned by crashed nodes to `Pending`:
//!
//! - claims older than `claim_timeout` are released by `reclaim_stale`
//! - the next poll on any node picks them up again
//!
//! # Configuration
//!
//! ```rust
//! use warden_workflow::SchedulerConfig;
//! use std::time::Duration;
//!
//! let config = SchedulerConfig {
//!     poll_interval: Duration::from_secs(1),
//!     batch_size: 100,
//!     claim_timeout: Duration::from_secs(300),
//!     reclaim_interval: Duration::from_secs(60),
//!     log_claims: false,
//! };
//! ```

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use warden_core::constants::{
    DEFAULT_SCHEDULER_BATCH_SIZE, DEFAULT_SCHEDULER_CLAIM_TIMEOUT_SECS,
    DEFAULT_SCHEDULER_POLL_INTERVAL_MS, DEFAULT_SCHEDULER_RECLAIM_INTERVAL_SECS,
};
use warden_core::env;

use crate::runner::{RunOutcome, WorkflowRunner};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the scheduled-step background task.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to poll for due steps (default: 1 second)
    pub poll_interval: Duration,

    /// Maximum number of records claimed per poll (default: 100)
    pub batch_size: usize,

    /// Claims older than this belong to a node presumed dead
    /// (default: 5 minutes)
    pub claim_timeout: Duration,

    /// How often to look for abandoned claims (default: 60 seconds)
    pub reclaim_interval: Duration,

    /// Whether to log each claimed record (default: false)
    pub log_claims: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_SCHEDULER_POLL_INTERVAL_MS),
            batch_size: DEFAULT_SCHEDULER_BATCH_SIZE,
            claim_timeout: Duration::from_secs(DEFAULT_SCHEDULER_CLAIM_TIMEOUT_SECS),
            reclaim_interval: Duration::from_secs(DEFAULT_SCHEDULER_RECLAIM_INTERVAL_SECS),
            log_claims: false,
        }
    }
}

impl SchedulerConfig {
    /// Create SchedulerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `WARDEN_SCHEDULER_POLL_INTERVAL_MS`: Poll interval (default: 1000)
    /// - `WARDEN_SCHEDULER_BATCH_SIZE`: Records claimed per poll (default: 100)
    /// - `WARDEN_SCHEDULER_CLAIM_TIMEOUT_SECS`: Abandoned-claim threshold (default: 300)
    /// - `WARDEN_SCHEDULER_RECLAIM_INTERVAL_SECS`: Reclaim pass interval (default: 60)
    /// - `WARDEN_SCHEDULER_LOG_CLAIMS`: Log each claim (default: false)
    pub fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_millis(env::parse_or(
                "WARDEN_SCHEDULER_POLL_INTERVAL_MS",
                DEFAULT_SCHEDULER_POLL_INTERVAL_MS,
            )),
            batch_size: env::parse_or("WARDEN_SCHEDULER_BATCH_SIZE", DEFAULT_SCHEDULER_BATCH_SIZE),
            claim_timeout: Duration::from_secs(env::parse_or(
                "WARDEN_SCHEDULER_CLAIM_TIMEOUT_SECS",
                DEFAULT_SCHEDULER_CLAIM_TIMEOUT_SECS,
            )),
            reclaim_interval: Duration::from_secs(env::parse_or(
                "WARDEN_SCHEDULER_RECLAIM_INTERVAL_SECS",
                DEFAULT_SCHEDULER_RECLAIM_INTERVAL_SECS,
            )),
            log_claims: env::flag_or("WARDEN_SCHEDULER_LOG_CLAIMS", false),
        }
    }

    /// Create a configuration for development/testing with fast polling.
    pub fn development() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 10,
            claim_timeout: Duration::from_secs(30),
            reclaim_interval: Duration::from_secs(5),
            log_claims: true,
        }
    }

    /// Create a configuration for production with a longer claim timeout.
    pub fn production() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_SCHEDULER_POLL_INTERVAL_MS),
            batch_size: DEFAULT_SCHEDULER_BATCH_SIZE,
            claim_timeout: Duration::from_secs(900), // 15 minutes
            reclaim_interval: Duration::from_secs(DEFAULT_SCHEDULER_RECLAIM_INTERVAL_SECS),
            log_claims: false,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters of scheduler activity.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    /// Records claimed by this node
    pub claimed: AtomicU64,

    /// Claimed records whose workflow ran to completion
    pub completed: AtomicU64,

    /// Claimed records that suspended again on a later step
    pub scheduled: AtomicU64,

    /// Claimed records whose step failed
    pub failed: AtomicU64,

    /// Claimed records dropped because their resource or workflow was gone
    pub cancelled: AtomicU64,

    /// Abandoned claims returned to pending
    pub reclaimed: AtomicU64,

    /// Poll cycles completed
    pub cycles: AtomicU64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            scheduled: self.scheduled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of scheduler metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub claimed: u64,
    pub completed: u64,
    pub scheduled: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub reclaimed: u64,
    pub cycles: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Background task that resumes due workflow steps until shutdown.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let handle = tokio::spawn(scheduled_step_task(runner.clone(), SchedulerConfig::from_env(), shutdown_rx));
///
/// // Later, trigger shutdown
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn scheduled_step_task(
    runner: Arc<WorkflowRunner>,
    config: SchedulerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SchedulerMetrics> {
    let metrics = Arc::new(SchedulerMetrics::new());

    let mut poll_interval = interval(config.poll_interval);
    poll_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut reclaim_interval = interval(config.reclaim_interval);
    reclaim_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        node_id = %runner.config().node_id,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        batch_size = config.batch_size,
        claim_timeout_secs = config.claim_timeout.as_secs(),
        "Scheduled step task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Scheduled step task shutting down");
                    break;
                }
            }

            _ = poll_interval.tick() => {
                run_due_steps(&runner, &config, &metrics).await;
            }

            _ = reclaim_interval.tick() => {
                reclaim_abandoned(&runner, &config, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        claimed = snapshot.claimed,
        completed = snapshot.completed,
        scheduled = snapshot.scheduled,
        failed = snapshot.failed,
        cancelled = snapshot.cancelled,
        reclaimed = snapshot.reclaimed,
        cycles = snapshot.cycles,
        "Scheduled step task completed"
    );

    metrics
}

/// One poll: claim a batch of due records and resume each in turn.
///
/// Step failures are counted and left to the runner's listener; the failed
/// record is back in `Pending` and is retried on a later poll.
pub async fn run_due_steps(
    runner: &WorkflowRunner,
    config: &SchedulerConfig,
    metrics: &SchedulerMetrics,
) {
    let node_id = &runner.config().node_id;
    let claimed = match runner
        .state_store()
        .claim_due(Utc::now(), config.batch_size, node_id)
        .await
    {
        Ok(claimed) => claimed,
        Err(e) => {
            tracing::error!(error = %e, "Failed to claim due workflow steps");
            metrics.cycles.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    metrics
        .claimed
        .fetch_add(claimed.len() as u64, Ordering::Relaxed);

    for record in claimed {
        if config.log_claims {
            tracing::info!(
                execution_id = %record.execution_id,
                step_id = %record.step_id,
                scheduled_at = %record.scheduled_at,
                "Claimed scheduled step"
            );
        }

        let counter = match runner.run_claimed(record).await {
            Ok(RunOutcome::Completed) => &metrics.completed,
            Ok(RunOutcome::Scheduled { .. }) => &metrics.scheduled,
            Ok(RunOutcome::Cancelled) | Ok(RunOutcome::Skipped) => &metrics.cancelled,
            Err(_) => &metrics.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    metrics.cycles.fetch_add(1, Ordering::Relaxed);
}

async fn reclaim_abandoned(
    runner: &WorkflowRunner,
    config: &SchedulerConfig,
    metrics: &SchedulerMetrics,
) {
    let Ok(timeout) = chrono::Duration::from_std(config.claim_timeout) else {
        tracing::warn!("Claim timeout out of range, skipping reclaim");
        return;
    };

    match runner.state_store().reclaim_stale(Utc::now() - timeout).await {
        Ok(0) => {}
        Ok(reclaimed) => {
            tracing::warn!(reclaimed, "Released abandoned workflow step claims");
            metrics
                .reclaimed
                .fetch_add(reclaimed as u64, Ordering::Relaxed);
        }
        Err(e) => tracing::error!(error = %e, "Failed to reclaim abandoned claims"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(1_000));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.claim_timeout, Duration::from_secs(300));
        assert!(!config.log_claims);
    }

    #[test]
    fn test_scheduler_config_presets() {
        let dev = SchedulerConfig::development();
        let prod = SchedulerConfig::production();
        assert!(dev.poll_interval < prod.poll_interval);
        assert!(dev.claim_timeout < prod.claim_timeout);
    }

    #[test]
    fn test_scheduler_config_from_env() {
        std::env::set_var("WARDEN_SCHEDULER_BATCH_SIZE", "7");
        std::env::set_var("WARDEN_SCHEDULER_LOG_CLAIMS", "true");
        let config = SchedulerConfig::from_env();
        assert_eq!(config.batch_size, 7);
        assert!(config.log_claims);
        std::env::remove_var("WARDEN_SCHEDULER_BATCH_SIZE");
        std::env::remove_var("WARDEN_SCHEDULER_LOG_CLAIMS");
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = SchedulerMetrics::new();
        metrics.claimed.fetch_add(3, Ordering::Relaxed);
        metrics.failed.fetch_add(1, Ordering::Relaxed);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.claimed, 3);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.completed, 0);
    }
}
