//! Emit-queue serializer for realignment output.
//!
//! Intervals may be cleaned concurrently, but their output must leave in
//! input order. Each pending unit, a pass-through read or a cleaned
//! interval, is appended to a bounded ordered queue; whoever holds the
//! queue drains the ready prefix into the mate-fixing manager. Producers
//! that cannot take the lock skip draining (a later flush will catch up);
//! the terminal flush drains everything.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use noodles::sam::alignment::record_buf::RecordBuf;
use parking_lot::{Condvar, Mutex};

use crate::matefix::MateFixingManager;
use crate::realign::clean::CleanOutcome;

/// Bound on pending emit-queue entries; producers park when it is full.
pub const EMIT_QUEUE_CAPACITY: usize = 1_000;

/// A cleaning job's completion slot.
pub struct CleanTask {
    done: AtomicBool,
    outcome: Mutex<Option<CleanOutcome>>,
}

impl CleanTask {
    /// Creates an incomplete task.
    #[must_use]
    pub fn new() -> Self {
        Self { done: AtomicBool::new(false), outcome: Mutex::new(None) }
    }

    /// Stores the outcome and marks the task emittable.
    pub fn complete(&self, outcome: CleanOutcome) {
        *self.outcome.lock() = Some(outcome);
        self.done.store(true, Ordering::Release);
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn take_outcome(&self) -> Option<CleanOutcome> {
        self.outcome.lock().take()
    }
}

impl Default for CleanTask {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit of ordered output.
pub enum Emittable {
    /// A read passing through outside any interval; always ready.
    Read(RecordBuf),
    /// A cleaned interval; ready once its task completes.
    Bin(Arc<CleanTask>),
}

impl Emittable {
    fn can_emit(&self) -> bool {
        match self {
            Emittable::Read(_) => true,
            Emittable::Bin(task) => task.is_done(),
        }
    }
}

/// The ordered, bounded emit queue in front of the mate-fixing manager.
pub struct EmitQueue {
    inner: Mutex<VecDeque<Emittable>>,
    progress: Condvar,
    manager: Arc<MateFixingManager>,
    capacity: usize,
}

impl EmitQueue {
    /// Creates a queue draining into `manager`.
    #[must_use]
    pub fn new(manager: Arc<MateFixingManager>) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            progress: Condvar::new(),
            manager,
            capacity: EMIT_QUEUE_CAPACITY,
        }
    }

    /// Appends one entry, parking while the queue is full and nothing can
    /// be drained.
    pub fn push(&self, entry: Emittable) {
        let mut queue = self.inner.lock();
        while queue.len() >= self.capacity {
            if self.drain_ready(&mut queue) == 0 {
                self.progress.wait(&mut queue);
            }
        }
        queue.push_back(entry);
    }

    /// Drains the ready prefix if the queue lock is free; otherwise wakes
    /// whoever holds it and returns.
    pub fn flush(&self) {
        if let Some(mut queue) = self.inner.try_lock() {
            self.drain_ready(&mut queue);
        }
        self.progress.notify_all();
    }

    /// Drains everything, waiting for outstanding cleaning to complete.
    /// Call only after all producers have finished pushing.
    pub fn final_flush(&self) {
        let mut queue = self.inner.lock();
        while !queue.is_empty() {
            if self.drain_ready(&mut queue) == 0 {
                self.progress.wait(&mut queue);
            }
        }
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn drain_ready(&self, queue: &mut VecDeque<Emittable>) -> usize {
        let mut drained = 0;
        while queue.front().is_some_and(Emittable::can_emit) {
            match queue.pop_front().expect("front exists") {
                Emittable::Read(record) => self.manager.add_read(record, false, true),
                Emittable::Bin(task) => {
                    if let Some(outcome) = task.take_outcome() {
                        self.manager.add_reads(outcome.reads, &outcome.modified);
                    }
                }
            }
            drained += 1;
        }
        if drained > 0 {
            self.progress.notify_all();
        }
        drained
    }
}
