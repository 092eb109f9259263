//! The staged pipeline runtime.
//!
//! A pipeline is a chain of [`Stage`]s connected by bounded alignment queues
//! ([`queue`]). Each stage runs on its own worker thread; records flow
//! downstream with single ownership, duplicated only at fan-out points.
//!
//! # Completion and visibility
//!
//! A stage completes by returning from [`Stage::run`], which drops its
//! output senders (waking downstream consumers with end-of-stream) and then
//! stores the `finished` flag with `Release` ordering. A downstream observer
//! that reads the flag with `Acquire` therefore also observes every record
//! the stage emitted before finishing. Consumers normally never touch the
//! flag (queue disconnection carries the same happens-before edge), but
//! the orchestrator uses it to read exit status without joining.

pub mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Result;
use log::error;
use noodles::sam::alignment::record_buf::RecordBuf;
use noodles::sam::Header;

pub use queue::{alignment_queue, AlignmentReceiver, AlignmentSender, DEFAULT_QUEUE_CAPACITY};

/// Read-only stream metadata captured once at wiring time.
///
/// Stages receive this instead of a back-reference to their upstream source;
/// the header (and with it the reference dictionary) is frozen after the
/// reader initializes it.
#[derive(Clone)]
pub struct StreamContext {
    header: Arc<Header>,
}

impl StreamContext {
    /// Wraps a header for sharing across stages.
    #[must_use]
    pub fn new(header: Header) -> Self {
        Self { header: Arc::new(header) }
    }

    /// The stream's header.
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Number of reference sequences in the dictionary.
    #[must_use]
    pub fn reference_count(&self) -> usize {
        self.header.reference_sequences().len()
    }
}

/// A stage's downstream fan-out set.
///
/// The first sink receives each record itself; each additional sink
/// receives a deep copy. With no sinks records are dropped at the fan-out
/// point, ending their lifecycle.
#[derive(Clone)]
pub struct StageOutput {
    sinks: Vec<AlignmentSender>,
}

impl StageOutput {
    /// Wraps a sink set.
    #[must_use]
    pub fn new(sinks: Vec<AlignmentSender>) -> Self {
        Self { sinks }
    }

    /// Fans a record out to every sink.
    pub fn send(&self, record: RecordBuf) {
        match self.sinks.split_first() {
            None => drop(record),
            Some((first, rest)) => {
                for sink in rest {
                    sink.send(record.clone());
                }
                first.send(record);
            }
        }
    }
}

/// A stage's connections: its input queue, fan-out sinks, and stream context.
pub struct StageIo {
    input: Option<AlignmentReceiver>,
    output: StageOutput,
    context: StreamContext,
}

impl StageIo {
    /// Assembles stage connections. Source stages pass `None` for input;
    /// sink stages pass an empty output list.
    #[must_use]
    pub fn new(
        input: Option<AlignmentReceiver>,
        outputs: Vec<AlignmentSender>,
        context: StreamContext,
    ) -> Self {
        Self { input, output: StageOutput::new(outputs), context }
    }

    /// The stream context captured at wiring time.
    #[must_use]
    pub fn context(&self) -> &StreamContext {
        &self.context
    }

    /// The stream header.
    #[must_use]
    pub fn header(&self) -> &Header {
        self.context.header()
    }

    /// Next input record; `None` once the upstream stage has completed and
    /// the queue is empty.
    pub fn next_input(&self) -> Option<RecordBuf> {
        self.input.as_ref().and_then(AlignmentReceiver::recv)
    }

    /// Fans a record out to every registered sink (see [`StageOutput`]).
    pub fn emit(&self, record: RecordBuf) {
        self.output.send(record);
    }

    /// The fan-out set itself, for stages whose helpers (the mate-fixing
    /// manager, the emit queue) need to own a downstream handle.
    #[must_use]
    pub fn output(&self) -> &StageOutput {
        &self.output
    }
}

/// A pipeline stage: one processing loop over the record stream.
pub trait Stage: Send + 'static {
    /// Stage name for logs and thread naming.
    fn name(&self) -> &'static str;

    /// The stage's synchronous driver; runs to stream completion.
    ///
    /// # Errors
    ///
    /// An error fails the stage; the orchestrator surfaces it as a nonzero
    /// exit status.
    fn run(&mut self, io: &mut StageIo) -> Result<()>;
}

/// Handle to an asynchronously running stage.
pub struct StageHandle {
    name: &'static str,
    finished: Arc<AtomicBool>,
    join: JoinHandle<i32>,
}

impl StageHandle {
    /// Whether the stage's loop has returned. `Acquire` pairing with the
    /// stage's `Release` store means a `true` here also makes all of the
    /// stage's emitted records visible.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Stage name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Joins the stage and returns its exit status (0 = success).
    #[must_use]
    pub fn finish(self) -> i32 {
        self.join.join().unwrap_or(1)
    }
}

/// Launches a stage on its own worker thread.
///
/// The stage's queues travel with it inside `io`; when `run` returns, `io`
/// is dropped, closing the output queues before the finished flag is set.
pub fn spawn_stage<S: Stage>(mut stage: S, mut io: StageIo) -> StageHandle {
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);
    let name = stage.name();

    let join = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let status = match stage.run(&mut io) {
                Ok(()) => 0,
                Err(e) => {
                    error!("Stage '{name}' failed: {e:#}");
                    1
                }
            };
            drop(io);
            flag.store(true, Ordering::Release);
            status
        })
        .expect("failed to spawn stage thread");

    StageHandle { name, finished, join }
}

/// Joins a set of stage handles and returns the first nonzero status.
#[must_use]
pub fn finish_all(handles: Vec<StageHandle>) -> i32 {
    let mut status = 0;
    for handle in handles {
        let name = handle.name();
        let code = handle.finish();
        if code != 0 {
            error!("Stage '{name}' exited with status {code}");
            if status == 0 {
                status = code;
            }
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sam::builder::{test_header, RecordBuilder};
    use anyhow::bail;

    /// Passes records through, counting them.
    struct CountingStage {
        seen: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Stage for CountingStage {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn run(&mut self, io: &mut StageIo) -> Result<()> {
            while let Some(record) = io.next_input() {
                self.seen.fetch_add(1, Ordering::Relaxed);
                io.emit(record);
            }
            Ok(())
        }
    }

    struct FailingStage;

    impl Stage for FailingStage {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn run(&mut self, _io: &mut StageIo) -> Result<()> {
            bail!("deliberate failure")
        }
    }

    fn context() -> StreamContext {
        StreamContext::new(test_header(&[("chr1", 10_000)]))
    }

    #[test]
    fn test_records_flow_through_chained_stages() {
        let ctx = context();
        let (in_tx, in_rx) = alignment_queue(64);
        let (mid_tx, mid_rx) = alignment_queue(64);

        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let stage = CountingStage { seen: Arc::clone(&seen) };
        let handle =
            spawn_stage(stage, StageIo::new(Some(in_rx), vec![mid_tx], ctx));

        for i in 1..=50 {
            in_tx.send(RecordBuilder::mapped().alignment_start(i).build());
        }
        drop(in_tx);

        let out: Vec<_> = mid_rx.iter().collect();
        assert_eq!(handle.finish(), 0);
        assert_eq!(out.len(), 50);
        assert_eq!(seen.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn test_fan_out_duplicates_for_extra_sinks() {
        let ctx = context();
        let (a_tx, a_rx) = alignment_queue(8);
        let (b_tx, b_rx) = alignment_queue(8);

        let io = StageIo::new(None, vec![a_tx, b_tx], ctx);
        io.emit(RecordBuilder::mapped().name("r1").alignment_start(7).build());
        drop(io);

        let a: Vec<_> = a_rx.iter().collect();
        let b: Vec<_> = b_rx.iter().collect();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].alignment_start(), b[0].alignment_start());
    }

    #[test]
    fn test_failing_stage_reports_nonzero() {
        let ctx = context();
        let (_tx, rx) = alignment_queue(8);
        let handle = spawn_stage(FailingStage, StageIo::new(Some(rx), vec![], ctx));
        assert_eq!(handle.finish(), 1);
    }

    #[test]
    fn test_finished_flag_set_after_completion() {
        let ctx = context();
        let (tx, rx) = alignment_queue(8);
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handle =
            spawn_stage(CountingStage { seen }, StageIo::new(Some(rx), vec![], ctx));

        drop(tx);
        // Join first so the flag store has happened, then observe it.
        let status = {
            while !handle.is_finished() {
                std::thread::yield_now();
            }
            handle.finish()
        };
        assert_eq!(status, 0);
    }
}
