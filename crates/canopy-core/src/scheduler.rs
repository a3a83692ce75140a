// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixed-interval background jobs.
//!
//! Each registered job runs on its own task. A tick that arrives while the
//! previous run is still in progress is delayed, never queued, so runs of
//! the same job do not overlap. All tasks share one cancellation token and
//! stop at their next suspension point once it fires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// A unit of periodic work.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run once. `cancel` fires when the host is shutting down.
    async fn run(&self, cancel: &CancellationToken) -> Result<()>;
}

struct Entry {
    interval: Duration,
    job: Arc<dyn Job>,
}

/// Collects jobs before start-up. The task set is fixed once started.
#[derive(Default)]
pub struct Scheduler {
    entries: Vec<Entry>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` every `interval`, starting with an immediate first tick.
    pub fn every(mut self, interval: Duration, job: Arc<dyn Job>) -> Self {
        self.entries.push(Entry { interval, job });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn one task per job under `cancel`.
    pub fn start(self, cancel: CancellationToken) -> SchedulerHandle {
        let mut tasks = JoinSet::new();
        for entry in self.entries {
            let token = cancel.child_token();
            tasks.spawn(run_job(entry, token));
        }
        SchedulerHandle { cancel, tasks }
    }
}

async fn run_job(entry: Entry, cancel: CancellationToken) {
    let name = entry.job.name();
    info!(
        job = name,
        interval_secs = entry.interval.as_secs(),
        "Scheduled job started"
    );

    let mut ticker = interval(entry.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(job = name, "Scheduled job received shutdown signal");
                break;
            }

            _ = ticker.tick() => {
                match entry.job.run(&cancel).await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => {
                        debug!(job = name, "Scheduled job run cancelled");
                    }
                    Err(e) => {
                        error!(job = name, error = %e, "Scheduled job failed");
                    }
                }
            }
        }
    }

    info!(job = name, "Scheduled job stopped");
}

/// Running jobs.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl SchedulerHandle {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel every job and wait for the tasks to return.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Scheduled job task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        runs: AtomicUsize,
        work: Duration,
        fail: bool,
    }

    impl Counter {
        fn new(work: Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                work,
                fail: false,
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Job for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        async fn run(&self, cancel: &CancellationToken) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.work) => {}
            }
            if self.fail {
                Err(Error::internal("boom"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_runs_on_every_tick() {
        let job = Counter::new(Duration::ZERO);
        let handle = Scheduler::new()
            .every(Duration::from_secs(10), job.clone())
            .start(CancellationToken::new());

        // First tick fires immediately, then one per interval.
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(job.runs(), 4);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_job_does_not_stack() {
        let job = Counter::new(Duration::from_secs(25));
        let handle = Scheduler::new()
            .every(Duration::from_secs(10), job.clone())
            .start(CancellationToken::new());

        // Runs start at 0, 25 and 50; ticks missed meanwhile are dropped.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(job.runs(), 3);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_loop() {
        let job = Arc::new(Counter {
            runs: AtomicUsize::new(0),
            work: Duration::ZERO,
            fail: true,
        });
        let handle = Scheduler::new()
            .every(Duration::from_secs(1), job.clone())
            .start(CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(job.runs(), 3);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_running_job() {
        let job = Counter::new(Duration::from_secs(3600));
        let root = CancellationToken::new();
        let handle = Scheduler::new()
            .every(Duration::from_secs(10), job.clone())
            .start(root.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(job.runs(), 1);

        handle.shutdown().await;
        assert!(root.is_cancelled());
    }
}
