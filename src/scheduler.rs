//! Bounded in-flight execution of independent operations.
//!
//! The scheduler admits a new operation only while fewer than
//! [`ConcurrencyController::current_level`] are running, re-reading the
//! level every time. Stopping is cooperative: once the cancellation token
//! fires no new work is admitted and in-flight operations run to completion.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::ConcurrencyController;
use crate::error::DispatchError;

/// What to do with an operation that found every endpoint exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustedPolicy {
    #[default]
    Requeue,
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub on_exhausted: ExhaustedPolicy,
    /// Requeues allowed per operation before it is dropped
    #[serde(default = "default_max_requeues")]
    pub max_requeues: u32,
    /// Delay before a requeued operation is retried when no better hint exists
    #[serde(default = "default_requeue_delay_seconds")]
    pub requeue_delay_seconds: u64,
    /// Completed operations between progress callbacks
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
}

const fn default_max_requeues() -> u32 {
    3
}
const fn default_requeue_delay_seconds() -> u64 {
    5
}
const fn default_checkpoint_interval() -> u64 {
    50
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            on_exhausted: ExhaustedPolicy::default(),
            max_requeues: default_max_requeues(),
            requeue_delay_seconds: default_requeue_delay_seconds(),
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub const fn requeue_delay(&self) -> Duration {
        Duration::from_secs(self.requeue_delay_seconds)
    }
}

/// Counters describing a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: u64,
    /// Attempts that ended in exhaustion, including ones later retried
    pub exhausted: u64,
    pub requeued: u64,
    pub dropped: u64,
    /// Operations never admitted because the run was cancelled
    pub not_started: u64,
    pub cancelled: bool,
}

impl RunSummary {
    #[must_use]
    pub const fn completed(&self) -> u64 {
        self.succeeded + self.dropped
    }
}

type ProgressFn = Box<dyn FnMut(&RunSummary) + Send>;

struct Pending<I> {
    item: I,
    attempts: u32,
    not_before: Option<Instant>,
}

pub struct Scheduler {
    controller: Arc<ConcurrencyController>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    progress: Option<ProgressFn>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("controller", &self.controller)
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new(
        controller: Arc<ConcurrencyController>,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            controller,
            config,
            cancel,
            progress: None,
        }
    }

    /// Called every `checkpoint_interval` completions and once at the end of a run
    #[must_use]
    pub fn on_progress(mut self, callback: impl FnMut(&RunSummary) + Send + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    fn report(&mut self, summary: &RunSummary, last_reported: &mut u64) {
        let interval = self.config.checkpoint_interval.max(1);
        if summary.completed() >= *last_reported + interval {
            *last_reported = summary.completed();
            if let Some(progress) = self.progress.as_mut() {
                progress(summary);
            }
        }
    }

    /// Runs `operation` over every item until all are done or the run is cancelled.
    ///
    /// The operation owns its result handling; the scheduler only looks at
    /// whether it ended in endpoint exhaustion.
    pub async fn run<I, F, Fut>(&mut self, items: impl IntoIterator<Item = I>, operation: F) -> RunSummary
    where
        I: Clone + Send + 'static,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        let items: Vec<I> = items.into_iter().collect();
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            // capacity covers every item
            let _ = tx.try_send(item);
        }
        drop(tx);
        self.run_from(rx, operation).await
    }

    /// Like [`run`](Self::run), pulling items from `source` as capacity frees up.
    ///
    /// The run ends once every sender is dropped and all received work has settled.
    pub async fn run_from<I, F, Fut>(&mut self, mut source: mpsc::Receiver<I>, operation: F) -> RunSummary
    where
        I: Clone + Send + 'static,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        let mut queue: VecDeque<Pending<I>> = VecDeque::new();
        let mut source_open = true;
        let mut in_flight: JoinSet<(Pending<I>, Result<(), DispatchError>)> = JoinSet::new();
        let mut summary = RunSummary::default();
        let mut last_reported = 0;

        info!(
            "Scheduling operations at concurrency {}",
            self.controller.current_level()
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if !source_open && queue.is_empty() && in_flight.is_empty() {
                break;
            }

            let level = self.controller.current_level().max(1);
            if in_flight.len() < level {
                let now = Instant::now();
                let ready = queue
                    .iter()
                    .position(|p| p.not_before.map_or(true, |at| at <= now));

                if let Some(index) = ready {
                    tokio::select! {
                        () = self.controller.wait_for_admission() => {}
                        () = self.cancel.cancelled() => continue,
                    }
                    if let Some(mut pending) = queue.remove(index) {
                        pending.attempts += 1;
                        let future = operation(pending.item.clone());
                        in_flight.spawn(async move { (pending, future.await) });
                    }
                    continue;
                }

                // nothing ready: wait for new work, a deferred item, a completion, or a stop
                let wake = queue.iter().filter_map(|p| p.not_before).min();
                tokio::select! {
                    received = source.recv(), if source_open => match received {
                        Some(item) => queue.push_front(Pending {
                            item,
                            attempts: 0,
                            not_before: None,
                        }),
                        None => source_open = false,
                    },
                    () = sleep_until(wake.unwrap_or(now)), if wake.is_some() => {}
                    () = self.cancel.cancelled() => {}
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        self.settle(joined, &mut queue, &mut summary);
                        self.report(&summary, &mut last_reported);
                    }
                }
                continue;
            }

            // at capacity
            tokio::select! {
                () = self.cancel.cancelled() => {}
                Some(joined) = in_flight.join_next() => {
                    self.settle(joined, &mut queue, &mut summary);
                    self.report(&summary, &mut last_reported);
                }
            }
        }

        if self.cancel.is_cancelled() {
            summary.cancelled = true;
            info!(
                "Stop requested, draining {} in-flight operations",
                in_flight.len()
            );
        }

        while let Some(joined) = in_flight.join_next().await {
            self.settle(joined, &mut queue, &mut summary);
        }
        if summary.cancelled {
            // queued, requeued during the drain, or still buffered in the source
            source.close();
            let mut buffered = 0;
            while source.try_recv().is_ok() {
                buffered += 1;
            }
            summary.not_started = queue.len() as u64 + buffered;
        }

        if let Some(progress) = self.progress.as_mut() {
            progress(&summary);
        }
        info!(
            "Run finished: {} succeeded, {} dropped, {} requeued, {} not started",
            summary.succeeded, summary.dropped, summary.requeued, summary.not_started
        );
        summary
    }

    fn settle<I>(
        &self,
        joined: Result<(Pending<I>, Result<(), DispatchError>), tokio::task::JoinError>,
        queue: &mut VecDeque<Pending<I>>,
        summary: &mut RunSummary,
    ) {
        let (mut pending, result) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                error!("Operation task failed to join: {}", e);
                summary.dropped += 1;
                return;
            }
        };

        match result {
            Ok(()) => summary.succeeded += 1,
            Err(e) => {
                summary.exhausted += 1;
                let requeue = self.config.on_exhausted == ExhaustedPolicy::Requeue
                    && pending.attempts <= self.config.max_requeues;
                if requeue {
                    let delay = e.retry_after().unwrap_or_else(|| self.config.requeue_delay());
                    debug!("Requeueing operation in {:?}: {}", delay, e);
                    pending.not_before = Some(Instant::now() + delay);
                    summary.requeued += 1;
                    queue.push_back(pending);
                } else {
                    warn!("Dropping operation after {} attempts: {}", pending.attempts, e);
                    summary.dropped += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ConcurrencyConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn controller(level: usize) -> Arc<ConcurrencyController> {
        Arc::new(ConcurrencyController::with_level(
            ConcurrencyConfig {
                min_level: 1,
                max_level: 8,
                ..ConcurrencyConfig::default()
            },
            level,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_everything() {
        let mut scheduler = Scheduler::new(
            controller(3),
            SchedulerConfig::default(),
            CancellationToken::new(),
        );
        let summary = scheduler
            .run(0..10, |_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(())
            })
            .await;
        assert_eq!(summary.succeeded, 10);
        assert!(!summary.cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_before_source_closes() {
        let (tx, rx) = mpsc::channel(4);
        let started = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(
            controller(2),
            SchedulerConfig::default(),
            CancellationToken::new(),
        );

        let producer = tokio::spawn({
            let started = started.clone();
            async move {
                tx.send(1).await.unwrap();
                tx.send(2).await.unwrap();
                // the first items run while the source is still open
                tokio::time::sleep(Duration::from_secs(5)).await;
                assert_eq!(started.load(Ordering::SeqCst), 2);
                tx.send(3).await.unwrap();
            }
        });

        let counter = started.clone();
        let summary = scheduler
            .run_from(rx, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        producer.await.unwrap();
        assert_eq!(summary.succeeded, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_policy() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(
            controller(1),
            SchedulerConfig {
                on_exhausted: ExhaustedPolicy::Drop,
                ..SchedulerConfig::default()
            },
            CancellationToken::new(),
        );
        let counter = attempts.clone();
        let summary = scheduler
            .run(0..2, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(DispatchError::AllEndpointsExhausted { retry_after: None }) }
            })
            .await;
        assert_eq!(summary.dropped, 2);
        assert_eq!(summary.requeued, 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_honours_limit() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(
            controller(1),
            SchedulerConfig {
                max_requeues: 2,
                ..SchedulerConfig::default()
            },
            CancellationToken::new(),
        );
        let counter = attempts.clone();
        let start = Instant::now();
        let summary = scheduler
            .run(std::iter::once(()), move |()| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(DispatchError::AllEndpointsExhausted {
                        retry_after: Some(Duration::from_secs(7)),
                    })
                }
            })
            .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(summary.requeued, 2);
        assert_eq!(summary.dropped, 1);
        assert!(Instant::now() - start >= Duration::from_secs(14));
    }
}
