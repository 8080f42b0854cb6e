//! Background worker for periodic and on-demand tasks.
//!
//! A `BackgroundWorker<R>` owns one tokio task that feeds queued tasks to a
//! [`BackgroundRunnable`] and calls its tick hook on a fixed interval. The
//! scheduler is the runnable in this crate; the HTTP layer submits through a
//! cloneable [`WorkerHandle`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Queue depth of a worker.
const QUEUE_CAPACITY: usize = 256;

/// Task handler driven by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    async fn run(&mut self, task: Self::Task);

    /// Called on every tick. Late ticks are skipped, not replayed.
    async fn on_tick(&mut self) {}

    /// Called once after the loop exits.
    async fn shutdown(&mut self) {}
}

/// Cloneable submit side of a running worker.
pub struct WorkerHandle<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for WorkerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> From<mpsc::Sender<T>> for WorkerHandle<T> {
    fn from(tx: mpsc::Sender<T>) -> Self {
        Self { tx }
    }
}

impl<T: Send + 'static> WorkerHandle<T> {
    /// Enqueue a task without waiting for queue capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has stopped or its queue is full.
    pub fn try_submit(&self, task: T) -> anyhow::Result<()> {
        self.tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow::anyhow!("worker queue full"),
            mpsc::error::TrySendError::Closed(_) => anyhow::anyhow!("worker stopped"),
        })
    }

    /// Enqueue a task, waiting for queue capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has stopped.
    pub async fn submit(&self, task: T) -> anyhow::Result<()> {
        self.tx
            .send(task)
            .await
            .map_err(|_| anyhow::anyhow!("worker stopped"))
    }
}

/// Runs a [`BackgroundRunnable`] on its own task until stopped.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    handle: Option<WorkerHandle<R::Task>>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker loop. The first tick fires one full interval after
    /// start.
    pub fn start(mut runnable: R, tick_interval_ms: u64) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(QUEUE_CAPACITY);
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let period = Duration::from_millis(tick_interval_ms.max(1));

        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = stopped.cancelled() => break,
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = ticks.tick() => runnable.on_tick().await,
                }
            }
            debug!("background worker loop exited");
            runnable.shutdown().await;
        });

        Self {
            handle: Some(WorkerHandle { tx }),
            stop,
            task: Some(task),
        }
    }

    /// Enqueue a task, waiting for queue capacity.
    ///
    /// # Errors
    ///
    /// Returns an error once the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.handle {
            Some(handle) => handle.submit(task).await,
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// A cloneable submit handle, or `None` once the worker has stopped.
    #[must_use]
    pub fn handle(&self) -> Option<WorkerHandle<R::Task>> {
        self.handle.clone()
    }

    /// Stops the loop, runs the shutdown hook and waits for both. Tasks
    /// still queued are dropped.
    pub async fn stop(&mut self) {
        self.stop.cancel();
        self.handle = None;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}
