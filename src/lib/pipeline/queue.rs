//! Bounded inter-stage alignment queues.
//!
//! Each arrow between two pipeline stages is one of these queues. A pop
//! blocks while the queue is empty and returns `None` only once every
//! producer handle has been dropped **and** the queue is drained; queue
//! disconnection is the completion signal, so consumers never poll.

use crossbeam_channel::{Receiver, Sender};
use noodles::sam::alignment::record_buf::RecordBuf;

/// Default per-queue capacity, in records.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8_192;

/// Producer half of an alignment queue.
#[derive(Clone)]
pub struct AlignmentSender {
    tx: Sender<RecordBuf>,
}

impl AlignmentSender {
    /// Enqueues one record, blocking while the queue is at capacity.
    ///
    /// A send into a queue whose consumer has gone away drops the record;
    /// the consumer's failure is reported through its own stage status.
    pub fn send(&self, record: RecordBuf) {
        let _ = self.tx.send(record);
    }
}

/// Consumer half of an alignment queue.
pub struct AlignmentReceiver {
    rx: Receiver<RecordBuf>,
}

impl AlignmentReceiver {
    /// Dequeues the next record.
    ///
    /// Blocks while the queue is empty and at least one producer handle is
    /// alive. Returns `None` once the upstream stage has completed (all
    /// senders dropped) and the queue is empty.
    pub fn recv(&self) -> Option<RecordBuf> {
        self.rx.recv().ok()
    }

    /// Dequeues without blocking; `None` means empty right now (or done).
    pub fn try_recv(&self) -> Option<RecordBuf> {
        self.rx.try_recv().ok()
    }

    /// Iterator over remaining records, ending at upstream completion.
    pub fn iter(&self) -> impl Iterator<Item = RecordBuf> + '_ {
        self.rx.iter()
    }
}

/// Creates a bounded alignment queue.
#[must_use]
pub fn alignment_queue(capacity: usize) -> (AlignmentSender, AlignmentReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (AlignmentSender { tx }, AlignmentReceiver { rx })
}
