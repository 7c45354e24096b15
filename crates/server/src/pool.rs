//! Elastic worker pool for per-circuit work.
//!
//! Jobs go through one unbounded channel. A worker is added whenever the
//! backlog exceeds the number of live workers, up to `max_workers`; workers
//! above `min_workers` exit after sitting idle for `idle_timeout`.

use crate::config::PoolConfig;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    jobs: Receiver<Job>,
    live: AtomicUsize,
    min_workers: usize,
    idle_timeout: Duration,
}

/// Thread pool that grows with its backlog and shrinks when idle.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    shared: Arc<Shared>,
    max_workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `min_workers` threads.
    pub fn new(config: &PoolConfig) -> Self {
        let min_workers = config.min_workers.max(1);
        let (sender, jobs) = unbounded();
        let pool = Self {
            sender: Some(sender),
            shared: Arc::new(Shared {
                jobs,
                live: AtomicUsize::new(0),
                min_workers,
                idle_timeout: config.idle_timeout(),
            }),
            max_workers: config.max_workers.max(min_workers),
            handles: Mutex::new(Vec::new()),
        };
        for _ in 0..min_workers {
            pool.spawn_worker();
        }
        pool
    }

    /// Live worker threads.
    pub fn workers(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Jobs waiting for a worker.
    pub fn backlog(&self) -> usize {
        self.shared.jobs.len()
    }

    /// Queue a job, adding a worker if the backlog outgrew the pool.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(Box::new(job)).is_err() {
            warn!("worker pool is shut down; dropping job");
            return;
        }
        let live = self.workers();
        if self.backlog() > live && live < self.max_workers {
            self.spawn_worker();
        }
    }

    /// Run `f` over every item on the pool and collect the results.
    ///
    /// Results arrive in completion order. A job that panics contributes
    /// nothing, and the call still returns once the rest are done.
    pub fn map<T, R, F>(&self, items: Vec<T>, f: F) -> Vec<R>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let expected = items.len();
        let f = Arc::new(f);
        let (done_tx, done_rx) = unbounded();
        for item in items {
            let f = Arc::clone(&f);
            let done_tx = done_tx.clone();
            self.execute(move || {
                let _ = done_tx.send(f(item));
            });
        }
        drop(done_tx);
        done_rx.iter().take(expected).collect()
    }

    fn spawn_worker(&self) {
        let shared = Arc::clone(&self.shared);
        shared.live.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name("simwire-worker".into())
            .spawn(move || worker_loop(&shared));
        match spawned {
            Ok(handle) => {
                let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                debug!(workers = self.workers(), "worker started");
            }
            Err(err) => {
                self.shared.live.fetch_sub(1, Ordering::AcqRel);
                warn!(%err, "failed to spawn worker");
            }
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        match shared.jobs.recv_timeout(shared.idle_timeout) {
            Ok(job) => {
                // the worker outlives a panicking job
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    warn!("worker job panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let live = shared.live.load(Ordering::Acquire);
                if live > shared.min_workers
                    && shared
                        .live
                        .compare_exchange(live, live - 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    debug!("idle worker exiting");
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    shared.live.fetch_sub(1, Ordering::AcqRel);
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        let handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn config(min: usize, max: usize, idle_ms: u64) -> PoolConfig {
        PoolConfig {
            min_workers: min,
            max_workers: max,
            idle_timeout_ms: idle_ms,
        }
    }

    #[test]
    fn map_collects_every_result() {
        let pool = WorkerPool::new(&config(1, 4, 1_000));
        let mut out = pool.map((0..50u32).collect(), |n| n * 2);
        out.sort_unstable();
        assert_eq!(out, (0..50u32).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_job_drops_only_its_result() {
        let pool = WorkerPool::new(&config(1, 1, 1_000));
        let mut out = pool.map((0..10u32).collect(), |n| {
            assert_ne!(n, 5, "bad item");
            n
        });
        out.sort_unstable();
        assert_eq!(out, vec![0, 1, 2, 3, 4, 6, 7, 8, 9]);
        assert_eq!(pool.workers(), 1);

        let again = pool.map(vec![1u32, 2], |n| n + 1);
        assert_eq!(again.len(), 2);
    }

    #[test]
    fn grows_under_backlog_and_shrinks_when_idle() {
        let pool = WorkerPool::new(&config(1, 3, 50));
        let (gate_tx, gate_rx) = unbounded::<()>();
        for _ in 0..6 {
            let gate_rx = gate_rx.clone();
            pool.execute(move || {
                let _ = gate_rx.recv();
            });
        }
        assert_eq!(pool.workers(), 3);
        drop(gate_tx);

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.workers() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.workers(), 1);
    }
}
