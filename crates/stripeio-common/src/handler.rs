//! Background operation handler.
//!
//! Runs short tasks asynchronously with bounded concurrency and a bounded
//! queue. Two operating modes:
//!
//! - `queue_depth == 0` (no-queue): tasks are spawned on demand up to
//!   `worker_threads` concurrent tasks. When the limit is reached, [`run`]
//!   executes the task inline on the caller and [`try_run`] refuses it.
//! - `queue_depth > 0` (pool): `worker_threads` workers drain a bounded
//!   FIFO. [`run`] waits for queue space, [`try_run`] refuses when full.
//!
//! Task failures stay inside the worker; callers that need to observe them
//! must carry their own channel.
//!
//! [`run`]: BackgroundHandler::run
//! [`try_run`]: BackgroundHandler::try_run

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum Mode {
    NoQueue {
        permits: Arc<Semaphore>,
    },
    Pool {
        tx: mpsc::Sender<Task>,
        shared: Arc<PoolShared>,
    },
}

struct PoolShared {
    rx: tokio::sync::Mutex<mpsc::Receiver<Task>>,
    workers_started: AtomicBool,
    worker_count: usize,
}

/// Bounded-capacity executor for asynchronous flushes and readaheads.
pub struct BackgroundHandler {
    mode: Mutex<Arc<Mode>>,
}

impl BackgroundHandler {
    pub fn new(worker_threads: usize, queue_depth: usize) -> Self {
        Self {
            mode: Mutex::new(Arc::new(Self::build_mode(worker_threads, queue_depth))),
        }
    }

    fn build_mode(worker_threads: usize, queue_depth: usize) -> Mode {
        if queue_depth == 0 {
            Mode::NoQueue {
                permits: Arc::new(Semaphore::new(worker_threads)),
            }
        } else {
            let (tx, rx) = mpsc::channel(queue_depth);
            Mode::Pool {
                tx,
                shared: Arc::new(PoolShared {
                    rx: tokio::sync::Mutex::new(rx),
                    workers_started: AtomicBool::new(false),
                    worker_count: worker_threads,
                }),
            }
        }
    }

    /// Change configuration at runtime.
    ///
    /// New submissions see the new configuration immediately. Superseded
    /// pool workers drain the remains of their old queue and exit once its
    /// last sender is gone.
    pub fn change_configuration(&self, worker_threads: usize, queue_depth: usize) {
        *self.mode.lock() = Arc::new(Self::build_mode(worker_threads, queue_depth));
    }

    fn current_mode(&self) -> Arc<Mode> {
        self.mode.lock().clone()
    }

    /// Workers are started from a submission so spawning happens inside a
    /// runtime context.
    fn ensure_workers(shared: &Arc<PoolShared>) {
        if shared.workers_started.swap(true, Ordering::SeqCst) {
            return;
        }
        for _ in 0..shared.worker_count {
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                loop {
                    let task = { shared.rx.lock().await.recv().await };
                    match task {
                        Some(task) => task.await,
                        None => break,
                    }
                }
            });
        }
    }

    /// Infallible submission. May suspend the caller waiting for queue
    /// space, or execute the task inline when the no-queue thread limit is
    /// reached.
    pub async fn run<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mode = self.current_mode();
        match &*mode {
            Mode::NoQueue { permits } => match Arc::clone(permits).try_acquire_owned() {
                Ok(permit) => {
                    tokio::spawn(async move {
                        task.await;
                        drop(permit);
                    });
                }
                Err(_) => task.await,
            },
            Mode::Pool { tx, shared } => {
                Self::ensure_workers(shared);
                if let Err(rejected) = tx.send(Box::pin(task)).await {
                    // Generation torn down between lookup and send; nothing
                    // will drain the old queue, so execute directly.
                    tracing::debug!("background queue closed, running task inline");
                    rejected.0.await;
                }
            }
        }
    }

    /// Non-blocking submission. Returns `false` when the task was not
    /// accepted (thread limit or queue full).
    pub fn try_run<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mode = self.current_mode();
        match &*mode {
            Mode::NoQueue { permits } => match Arc::clone(permits).try_acquire_owned() {
                Ok(permit) => {
                    tokio::spawn(async move {
                        task.await;
                        drop(permit);
                    });
                    true
                }
                Err(_) => false,
            },
            Mode::Pool { tx, shared } => {
                Self::ensure_workers(shared);
                tx.try_send(Box::pin(task)).is_ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
    }

    impl Gauge {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
            })
        }

        async fn work(&self, duration: Duration) {
            let level = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(level, Ordering::SeqCst);
            sleep(duration).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_noqueue_limits_spawned_tasks_and_falls_back_inline() {
        let handler = BackgroundHandler::new(2, 0);
        let gauge = Gauge::new();

        let started = Instant::now();
        for _ in 0..5 {
            let g = Arc::clone(&gauge);
            handler.run(async move { g.work(Duration::from_millis(50)).await }).await;
        }
        // Three of the five submissions did not get a permit and ran inline,
        // serially, on this task.
        assert!(started.elapsed() >= Duration::from_millis(150));

        while gauge.finished.load(Ordering::SeqCst) < 5 {
            sleep(Duration::from_millis(5)).await;
        }
        // Two spawned plus at most one inline at any moment.
        assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_noqueue_try_run_refuses_over_limit() {
        let handler = BackgroundHandler::new(1, 0);
        let gauge = Gauge::new();

        let g = Arc::clone(&gauge);
        assert!(handler.try_run(async move { g.work(Duration::from_millis(100)).await }));
        sleep(Duration::from_millis(10)).await;

        let g = Arc::clone(&gauge);
        assert!(!handler.try_run(async move { g.work(Duration::from_millis(10)).await }));

        while gauge.finished.load(Ordering::SeqCst) < 1 {
            sleep(Duration::from_millis(5)).await;
        }
        let g = Arc::clone(&gauge);
        assert!(handler.try_run(async move { g.work(Duration::from_millis(1)).await }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_run_blocks_when_queue_full() {
        let handler = BackgroundHandler::new(1, 2);
        let gate = Arc::new(tokio::sync::Notify::new());

        // Occupy the single worker until the gate opens.
        let g = Arc::clone(&gate);
        handler.run(async move { g.notified().await }).await;
        sleep(Duration::from_millis(20)).await;

        // Fill the queue.
        handler.run(async {}).await;
        handler.run(async {}).await;

        let opener = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move {
                sleep(Duration::from_millis(50)).await;
                gate.notify_one();
            }
        });

        // Queue is full; this submission waits until the worker frees a slot.
        let started = Instant::now();
        handler.run(async {}).await;
        assert!(started.elapsed() >= Duration::from_millis(40));
        opener.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_try_run_refuses_when_full() {
        let handler = BackgroundHandler::new(1, 1);
        let gauge = Gauge::new();

        let g = Arc::clone(&gauge);
        assert!(handler.try_run(async move { g.work(Duration::from_millis(100)).await }));
        sleep(Duration::from_millis(20)).await; // worker picked up the first task

        let g = Arc::clone(&gauge);
        assert!(handler.try_run(async move { g.work(Duration::from_millis(100)).await }));

        let g = Arc::clone(&gauge);
        assert!(!handler.try_run(async move { g.work(Duration::from_millis(1)).await }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_change_configuration_applies_to_new_submissions() {
        let handler = BackgroundHandler::new(1, 0);
        let gauge = Gauge::new();

        let g = Arc::clone(&gauge);
        assert!(handler.try_run(async move { g.work(Duration::from_millis(50)).await }));
        sleep(Duration::from_millis(5)).await;
        let g = Arc::clone(&gauge);
        assert!(!handler.try_run(async move { g.work(Duration::from_millis(1)).await }));

        handler.change_configuration(3, 0);
        let g = Arc::clone(&gauge);
        assert!(handler.try_run(async move { g.work(Duration::from_millis(1)).await }));

        while gauge.finished.load(Ordering::SeqCst) < 2 {
            sleep(Duration::from_millis(5)).await;
        }
    }
}
