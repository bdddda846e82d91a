//! Background worker for periodic and on-demand tasks.
//!
//! `BackgroundWorker<R>` feeds tasks from an mpsc channel to a
//! `BackgroundRunnable` and calls its tick hook on a fixed interval. The
//! broker runs a [`CacheSweeper`] on it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::auth::AuthGate;
use super::cache::CacheGate;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Trait for task handlers executed by `BackgroundWorker`.
///
/// Implementors define how individual tasks are processed, what happens on each
/// periodic tick, and how to clean up on shutdown.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called periodically (on each tick interval). Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// CacheSweeper
// ---------------------------------------------------------------------------

/// Task variants for the sweep worker.
#[derive(Debug)]
pub enum SweepTask {
    /// Purge expired cache entries and revocations now.
    RunFull,
}

/// Periodically purges expired response-cache entries and lapsed token
/// revocations.
pub struct CacheSweeper {
    cache: CacheGate,
    auth: Arc<AuthGate>,
}

impl CacheSweeper {
    #[must_use]
    pub fn new(cache: CacheGate, auth: Arc<AuthGate>) -> Self {
        Self { cache, auth }
    }

    async fn sweep(&self) {
        let entries = self.cache.purge_expired().await;
        let revocations = self.auth.purge_revoked();
        if entries > 0 || revocations > 0 {
            tracing::debug!(entries, revocations, "swept expired state");
        }
    }
}

#[async_trait]
impl BackgroundRunnable for CacheSweeper {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::RunFull => self.sweep().await,
        }
    }

    async fn on_tick(&mut self) {
        self.sweep().await;
    }
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

const TASK_QUEUE_CAPACITY: usize = 256;

/// Runs a [`BackgroundRunnable`] on its own tokio task.
///
/// Queued tasks take priority over ticks. On `stop`, tasks already queued
/// are drained before `shutdown` runs.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker loop, ticking every `tick_interval`.
    pub fn start(mut runnable: R, tick_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(TASK_QUEUE_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; nothing to sweep at startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = &mut shutdown_rx => {
                        rx.close();
                        while let Some(task) = rx.recv().await {
                            runnable.run(task).await;
                        }
                        break;
                    }
                    _ = ticker.tick() => runnable.on_tick().await,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Queue a task for the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("worker not running"))?;
        tx.send(task)
            .await
            .map_err(|_| anyhow::anyhow!("worker channel closed"))
    }

    /// Stops the worker and waits for its loop to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "background worker ended abnormally");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use conduit_core::ManualClock;

    use super::*;
    use crate::security::JwtCodec;
    use crate::service::cache::{CacheStore, MemoryCacheStore};

    #[derive(Default, Clone)]
    struct Counters {
        runs: Arc<AtomicU32>,
        ticks: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BackgroundRunnable for Counters {
        type Task = u32;

        async fn run(&mut self, _task: u32) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn queued_tasks_run_before_shutdown() {
        let counters = Counters::default();
        let mut worker = BackgroundWorker::start(counters.clone(), Duration::from_secs(60));
        assert!(worker.is_running());

        for task in 0..3 {
            worker.submit(task).await.unwrap();
        }
        worker.stop().await;

        assert_eq!(counters.runs.load(Ordering::SeqCst), 3);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn tick_fires_on_interval_not_at_startup() {
        let counters = Counters::default();
        let mut worker = BackgroundWorker::start(counters.clone(), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop().await;
        assert!(counters.ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn submit_after_stop_fails() {
        let mut worker = BackgroundWorker::start(Counters::default(), Duration::from_secs(60));
        worker.stop().await;
        assert!(worker.submit(1).await.is_err());
    }

    fn sweeper_fixture() -> (CacheSweeper, Arc<ManualClock>, Arc<MemoryCacheStore>, Arc<AuthGate>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryCacheStore::new(clock.clone()));
        let auth = Arc::new(AuthGate::new(
            Arc::new(JwtCodec::new("s")),
            clock.clone(),
            Duration::from_secs(60),
            8,
        ));
        let sweeper = CacheSweeper::new(CacheGate::new(store.clone()), auth.clone());
        (sweeper, clock, store, auth)
    }

    #[tokio::test]
    async fn sweeper_purges_expired_entries_and_revocations() {
        let (mut sweeper, clock, store, auth) = sweeper_fixture();
        store
            .set("k", vec![1], Duration::from_secs(5), &["g".to_string()])
            .await
            .unwrap();
        let token = auth.issue("u", "ann", Duration::from_secs(5)).unwrap();
        auth.revoke(&token);

        sweeper.on_tick().await;
        assert_eq!(store.len(), 1);

        clock.advance(Duration::from_secs(6));
        sweeper.on_tick().await;
        assert!(store.is_empty());
        assert_eq!(auth.purge_revoked(), 0);
    }

    #[tokio::test]
    async fn submitted_full_sweep_runs_before_exit() {
        let (sweeper, clock, store, _auth) = sweeper_fixture();
        store
            .set("k", vec![1], Duration::from_secs(5), &["users".to_string()])
            .await
            .unwrap();
        clock.advance(Duration::from_secs(6));

        let mut worker = BackgroundWorker::start(sweeper, Duration::from_secs(60));
        worker.submit(SweepTask::RunFull).await.unwrap();
        // Queued tasks are drained before the worker exits.
        worker.stop().await;

        assert!(store.is_empty());
    }
}
