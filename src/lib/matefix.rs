//! Constrained mate-fixing manager.
//!
//! A locally reordering writer that emits alignments in coordinate order
//! while repairing paired-end mate information, under two constraints:
//! reads move at most Y bases from their original positions
//! (`max_pos_move_allowed`), and pairs are only mate-moved when their
//! insert size is at most X (`max_insert_size_for_movement`).
//!
//! Those bounds make the window tractable. When read K arrives, any
//! buffered read R with `R.pos + 2Y < K.pos` can no longer be preceded by
//! anything still upstream: R could have moved at most Y right and K at
//! most Y left. R is then safe to emit once its mate can no longer move
//! either: the pair's insert size exceeds X, or K is already 2Y past the
//! mate's position.
//!
//! # Concurrency
//!
//! In threaded mode adds are queued over a bounded channel to a dedicated
//! worker that owns the window and mate map exclusively; a mutex guards the
//! public entry so batches from different callers cannot interleave across
//! the channel boundary. Single-threaded mode inlines the worker under the
//! same lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use ahash::AHashMap;
use log::error;
use noodles::sam::alignment::record_buf::RecordBuf;
use parking_lot::Mutex;

use crate::locus::GenomeLoc;
use crate::pipeline::StageOutput;
use crate::sam::record_utils::set_mate_info;
use crate::sort::keys::{CoordinateKey, SortKey};

/// Emission cadence: the window is scanned for safe heads every this many
/// added reads.
pub const EMIT_FREQUENCY: u64 = 10_000;

/// Capacity of the add queue in threaded mode.
const ADD_QUEUE_CAPACITY: usize = 8_192;

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct MateFixingOptions {
    /// X: pairs with a larger insert size are never mate-moved.
    pub max_insert_size_for_movement: i32,
    /// Y: no read may move more than this many bases.
    pub max_pos_move_allowed: u32,
    /// Window overflow threshold.
    pub max_records_in_memory: usize,
}

impl Default for MateFixingOptions {
    fn default() -> Self {
        Self {
            max_insert_size_for_movement: 3_000,
            max_pos_move_allowed: 200,
            max_records_in_memory: 150_000,
        }
    }
}

/// Waiting-window key: coordinate sort order with a name and insertion
/// serial making keys unique while keeping equal-position reads in
/// arrival order.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct WaitingKey {
    coord: CoordinateKey,
    name: Vec<u8>,
    serial: u64,
}

struct MateEntry {
    key: WaitingKey,
    was_modified: bool,
}

/// The worker-owned state: the ordered window, the mate map, and the
/// flush bookkeeping.
struct MateFixState {
    options: MateFixingOptions,
    waiting: BTreeMap<WaitingKey, RecordBuf>,
    for_mate_matching: AHashMap<Vec<u8>, MateEntry>,
    last_loc_flushed: Arc<Mutex<Option<GenomeLoc>>>,
    counter: u64,
    next_serial: u64,
    sink: StageOutput,
}

/// True when a pair must not be mate-moved: its ends map to different
/// contigs, or its insert size exceeds the movement bound.
#[must_use]
pub fn is_isize_too_big_to_move(record: &RecordBuf, max_insert_size: i32) -> bool {
    let flags = record.flags();
    let cross_contig = flags.is_segmented()
        && !flags.is_unmapped()
        && record.reference_sequence_id() != record.mate_reference_sequence_id();
    cross_contig || record.template_length().abs() > max_insert_size
}

impl MateFixState {
    fn make_key(&mut self, record: &RecordBuf) -> WaitingKey {
        let serial = self.next_serial;
        self.next_serial += 1;
        WaitingKey {
            coord: CoordinateKey::from_record(record),
            name: record.name().map_or_else(Vec::new, |n| n.to_vec()),
            serial,
        }
    }

    fn tid(record: &RecordBuf) -> i64 {
        record.reference_sequence_id().map_or(-1, |id| id as i64)
    }

    fn pos(record: &RecordBuf) -> i64 {
        record.alignment_start().map_or(-1, |p| usize::from(p) as i64)
    }

    fn mate_pos(record: &RecordBuf) -> i64 {
        record.mate_alignment_start().map_or(-1, |p| usize::from(p) as i64)
    }

    /// True when nothing still upstream of a read added at `added_pos` can
    /// end up before `pos`: both could move at most Y towards each other.
    fn no_read_can_move_before(&self, pos: i64, added_pos: i64) -> bool {
        pos + 2 * i64::from(self.options.max_pos_move_allowed) < added_pos
    }

    fn paired_read_is_movable(&self, record: &RecordBuf) -> bool {
        let flags = record.flags();
        flags.is_segmented()
            && (!flags.is_unmapped() || !flags.is_mate_unmapped())
            && !is_isize_too_big_to_move(record, self.options.max_insert_size_for_movement)
    }

    fn emit(&mut self, record: RecordBuf) {
        self.sink.send(record);
    }

    fn add_read(&mut self, mut record: RecordBuf, was_modified: bool, can_flush: bool) {
        // Contig change or window overflow flushes the queue down to the
        // new read's horizon.
        let too_many_reads = self.waiting.len() >= self.options.max_records_in_memory;
        let contig_changed = self
            .waiting
            .first_key_value()
            .is_some_and(|(_, front)| Self::tid(front) != Self::tid(&record));

        if (can_flush && too_many_reads) || contig_changed {
            while self.waiting.len() > 1 {
                let (key, read) = self.waiting.pop_first().expect("window not empty");
                self.for_mate_matching.remove(&key.name);
                self.emit(read);
            }

            if let Some((_, last)) = self.waiting.pop_first() {
                *self.last_loc_flushed.lock() = GenomeLoc::of_record(&last);
                self.emit(last);
            }

            if too_many_reads {
                // The window overflowed mid-contig: keep mate entries whose
                // partner was realigned, their pairing info must still be
                // repaired when the mate shows up.
                self.for_mate_matching.retain(|_, entry| entry.was_modified);
            } else {
                self.for_mate_matching.clear();
            }
        }

        // Mate repair. The earlier-arriving end sits in the window under
        // the key recorded in the mate map; fixing can move either end, so
        // the mate is re-keyed on the way back in and the new read's own
        // key is computed only after repair.
        let name = record.name().map_or_else(Vec::new, |n| n.to_vec());
        let mut register_for_mate = false;
        if record.flags().is_segmented() {
            if let Some(entry) = self.for_mate_matching.remove(&name) {
                if let Some(mut mate) = self.waiting.remove(&entry.key) {
                    // Unmapped pairs are left alone: repairing them would
                    // clear their placement and break coordinate order.
                    let do_not_fix =
                        record.flags().is_unmapped() && mate.flags().is_unmapped();
                    if do_not_fix {
                        self.waiting.insert(entry.key, mate);
                    } else {
                        set_mate_info(&mut mate, &mut record);
                        let rekeyed = WaitingKey {
                            coord: CoordinateKey::from_record(&mate),
                            name: entry.key.name.clone(),
                            serial: entry.key.serial,
                        };
                        self.waiting.insert(rekeyed, mate);
                    }
                }
                // else: the mate was evicted by a flush before this end
                // arrived; both are emitted as observed.
            } else if self.paired_read_is_movable(&record) {
                register_for_mate = true;
            }
        }

        let key = self.make_key(&record);
        if register_for_mate {
            self.for_mate_matching
                .insert(name, MateEntry { key: key.clone(), was_modified });
        }

        let added_pos = Self::pos(&record);
        self.waiting.insert(key, record);

        self.counter += 1;
        if self.counter % EMIT_FREQUENCY == 0 {
            self.emit_safe_heads(added_pos);
        }
    }

    /// Emits window heads whose final position is fixed relative to the
    /// read just added at `added_pos`.
    fn emit_safe_heads(&mut self, added_pos: i64) {
        while let Some((_, head)) = self.waiting.first_key_value() {
            let head_fixed = self.no_read_can_move_before(Self::pos(head), added_pos)
                && (!self.paired_read_is_movable(head)
                    || self.no_read_can_move_before(Self::mate_pos(head), added_pos));
            if !head_fixed {
                break;
            }

            let (key, read) = self.waiting.pop_first().expect("head exists");
            // Covers the case where the mate never showed up.
            self.for_mate_matching.remove(&key.name);
            self.emit(read);
        }
    }

    /// Drains the window in coordinate order.
    fn close(&mut self) {
        while let Some((_, read)) = self.waiting.pop_first() {
            self.emit(read);
        }
        self.for_mate_matching.clear();
    }
}

enum AddMessage {
    Read { record: RecordBuf, was_modified: bool, can_flush: bool },
}

enum Mode {
    /// `None` after close: the state (and with it the downstream sender)
    /// is dropped so consumers observe end-of-stream.
    Inline(Mutex<Option<MateFixState>>),
    Threaded {
        entry: Mutex<()>,
        tx: Mutex<Option<crossbeam_channel::Sender<AddMessage>>>,
        handle: Mutex<Option<JoinHandle<()>>>,
    },
}

/// The constrained mate-fixing manager.
///
/// Shared between the realigner's emit path and its cleaning workers via
/// `Arc`; see the module docs for the threading model.
pub struct MateFixingManager {
    mode: Mode,
    last_loc_flushed: Arc<Mutex<Option<GenomeLoc>>>,
    max_insert_size_for_movement: i32,
}

impl MateFixingManager {
    /// Creates a manager draining into `sink`.
    ///
    /// With `threaded`, adds are serviced by a dedicated worker thread;
    /// otherwise they run inline in the caller.
    #[must_use]
    pub fn new(options: MateFixingOptions, sink: StageOutput, threaded: bool) -> Self {
        let last_loc_flushed = Arc::new(Mutex::new(None));
        let max_isize = options.max_insert_size_for_movement;
        let mut state = MateFixState {
            options,
            waiting: BTreeMap::new(),
            for_mate_matching: AHashMap::new(),
            last_loc_flushed: Arc::clone(&last_loc_flushed),
            counter: 0,
            next_serial: 0,
            sink,
        };

        let mode = if threaded {
            let (tx, rx) = crossbeam_channel::bounded::<AddMessage>(ADD_QUEUE_CAPACITY);
            let handle = std::thread::Builder::new()
                .name("mate-fixer".to_string())
                .spawn(move || {
                    while let Ok(message) = rx.recv() {
                        match message {
                            AddMessage::Read { record, was_modified, can_flush } => {
                                state.add_read(record, was_modified, can_flush);
                            }
                        }
                    }
                    state.close();
                })
                .expect("failed to spawn mate-fixer thread");
            Mode::Threaded {
                entry: Mutex::new(()),
                tx: Mutex::new(Some(tx)),
                handle: Mutex::new(Some(handle)),
            }
        } else {
            Mode::Inline(Mutex::new(Some(state)))
        };

        Self { mode, last_loc_flushed, max_insert_size_for_movement: max_isize }
    }

    /// Queues one read. Reads added after `close` are dropped.
    pub fn add_read(&self, record: RecordBuf, was_modified: bool, can_flush: bool) {
        match &self.mode {
            Mode::Inline(state) => {
                if let Some(state) = state.lock().as_mut() {
                    state.add_read(record, was_modified, can_flush);
                }
            }
            Mode::Threaded { entry, tx, .. } => {
                let _guard = entry.lock();
                if let Some(tx) = tx.lock().as_ref() {
                    let _ = tx.send(AddMessage::Read { record, was_modified, can_flush });
                }
            }
        }
    }

    /// Queues a batch, holding the entry lock so the batch stays
    /// contiguous in the add order. `modified` runs parallel to `batch`.
    pub fn add_reads(&self, batch: Vec<RecordBuf>, modified: &[bool]) {
        debug_assert_eq!(batch.len(), modified.len());
        match &self.mode {
            Mode::Inline(state) => {
                let mut state = state.lock();
                if let Some(state) = state.as_mut() {
                    for (record, was_modified) in batch.into_iter().zip(modified) {
                        state.add_read(record, *was_modified, false);
                    }
                }
            }
            Mode::Threaded { entry, tx, .. } => {
                let _guard = entry.lock();
                let tx = tx.lock();
                if let Some(tx) = tx.as_ref() {
                    for (record, was_modified) in batch.into_iter().zip(modified) {
                        let _ = tx.send(AddMessage::Read {
                            record,
                            was_modified: *was_modified,
                            can_flush: false,
                        });
                    }
                }
            }
        }
    }

    /// Whether a region starting at `earliest` may still be realigned:
    /// everything at or before the last flushed locus (within the
    /// insert-size horizon) is already emitted and fixed.
    #[must_use]
    pub fn can_move_reads(&self, earliest: &GenomeLoc) -> bool {
        match self.last_loc_flushed.lock().as_ref() {
            None => true,
            Some(last) => {
                last.compare_contigs(earliest) != std::cmp::Ordering::Equal
                    || last.distance(earliest) > self.max_insert_size_for_movement.max(0) as u32
            }
        }
    }

    /// Terminates the add worker and drains the window in order. Dropping
    /// the worker state here also closes the downstream queue.
    pub fn close(&self) {
        match &self.mode {
            Mode::Inline(state) => {
                if let Some(mut state) = state.lock().take() {
                    state.close();
                }
            }
            Mode::Threaded { tx, handle, .. } => {
                tx.lock().take();
                if let Some(handle) = handle.lock().take() {
                    if handle.join().is_err() {
                        error!("Mate-fixing worker panicked");
                    }
                }
            }
        }
    }
}
