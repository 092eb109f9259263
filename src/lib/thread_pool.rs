//! General-purpose FIFO job pool.
//!
//! Backs the parallelism inside the sorter and realigner. Jobs run to
//! completion in submission order across a fixed set of workers; there is no
//! cancellation and no priority. Runs create two pools, one for spill and
//! interval-cleaning work and one dedicated to in-chunk sort shards, so shard
//! sorting can never be starved behind a backlog of spill jobs.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    /// Jobs queued or currently running.
    outstanding: Mutex<usize>,
    idle: Condvar,
}

/// Fixed-size worker pool with FIFO scheduling.
pub struct ThreadPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    state: Arc<PoolState>,
}

impl ThreadPool {
    /// Creates a pool with one worker per available core.
    #[must_use]
    pub fn new() -> Self {
        Self::with_workers(available_cores())
    }

    /// Creates a pool with an explicit worker count (minimum 1).
    #[must_use]
    pub fn with_workers(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx): (Sender<Job>, Receiver<Job>) = crossbeam_channel::unbounded();
        let state = Arc::new(PoolState { outstanding: Mutex::new(0), idle: Condvar::new() });

        let handles = (0..workers)
            .map(|i| {
                let rx = rx.clone();
                let state = Arc::clone(&state);
                std::thread::Builder::new()
                    .name(format!("pool-worker-{i}"))
                    .spawn(move || worker_loop(&rx, &state))
                    .expect("failed to spawn pool worker")
            })
            .collect();

        Self { tx: Some(tx), workers: handles, state }
    }

    /// Enqueues a job. Jobs start in submission order as workers free up.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        *self.state.outstanding.lock() += 1;
        self.tx
            .as_ref()
            .expect("pool already shut down")
            .send(Box::new(job))
            .expect("pool workers are gone");
    }

    /// Blocks until every queued and running job has finished.
    pub fn wait_for_completion(&self) {
        let mut outstanding = self.state.outstanding.lock();
        while *outstanding > 0 {
            self.state.idle.wait(&mut outstanding);
        }
    }

    /// Number of workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel ends each worker loop after it drains.
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: &Receiver<Job>, state: &PoolState) {
    while let Ok(job) = rx.recv() {
        // The guard keeps the outstanding count correct even if a job panics,
        // so wait_for_completion cannot hang on a poisoned worker.
        let guard = CompletionGuard { state };
        job();
        drop(guard);
    }
}

struct CompletionGuard<'a> {
    state: &'a PoolState,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        let mut outstanding = self.state.outstanding.lock();
        *outstanding -= 1;
        if *outstanding == 0 {
            self.state.idle.notify_all();
        }
    }
}

/// Number of cores available to this process.
#[must_use]
pub fn available_cores() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}
