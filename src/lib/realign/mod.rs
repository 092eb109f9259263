//! Local realignment around indels.
//!
//! The realigner streams coordinate-sorted reads against a list of target
//! intervals. Reads overlapping the current interval are binned; when the
//! stream moves past the interval, the bin is cleaned: candidate alternate
//! consensuses are scored against the reads, and the winner rewrites the
//! CIGARs it improves ([`clean`]). Interval cleaning may run on the worker
//! pool; the emit queue ([`emit`]) restores input order, and the
//! constrained mate-fixing manager repairs pairing on the way out.

pub mod clean;
pub mod consensus;
pub mod emit;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, info};
use noodles::sam::alignment::record_buf::RecordBuf;
use noodles::sam::Header;

use crate::known_sites::KnownIndel;
use crate::locus::GenomeLoc;
use crate::matefix::{is_isize_too_big_to_move, MateFixingManager, MateFixingOptions};
use crate::pipeline::{Stage, StageIo};
use crate::progress::ProgressTracker;
use crate::reference::ReferenceReader;
use crate::thread_pool::ThreadPool;

pub use clean::{clean_interval, CleanInputs, CleanOutcome, OC_TAG, OP_TAG};
pub use emit::{CleanTask, Emittable, EmitQueue};

/// Which sources contribute candidate consensuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusModel {
    /// Only known indel sites.
    KnownsOnly,
    /// Known sites plus indels already present in read alignments.
    UseReads,
    /// Additionally, Smith-Waterman alignments of mismatching reads.
    UseSw,
}

/// Realigner configuration.
#[derive(Debug, Clone)]
pub struct RealignOptions {
    /// Candidate consensus sources.
    pub consensus_model: ConsensusModel,
    /// Minimum log-odds improvement to accept an interval's realignment.
    pub lod_threshold: f64,
    /// Column-entropy gate fraction.
    pub mismatch_threshold: f64,
    /// Mate-fixing window overflow threshold.
    pub max_reads_in_memory: usize,
    /// X: insert-size bound for mate movement.
    pub max_isize_for_movement: i32,
    /// Y: per-read positional movement cap.
    pub max_pos_move_allowed: u32,
    /// Cap on candidate consensuses per interval.
    pub max_consensuses: usize,
    /// Cap on reads used to generate consensuses.
    pub max_reads_for_consensuses: usize,
    /// Intervals holding more reads than this pass through uncleaned.
    pub max_reads_for_realignment: usize,
    /// Suppress OC/OP tags on realigned reads.
    pub no_original_alignment_tags: bool,
}

impl Default for RealignOptions {
    fn default() -> Self {
        Self {
            consensus_model: ConsensusModel::UseReads,
            lod_threshold: 5.0,
            mismatch_threshold: 0.15,
            max_reads_in_memory: 150_000,
            max_isize_for_movement: 3_000,
            max_pos_move_allowed: 200,
            max_consensuses: 30,
            max_reads_for_consensuses: 120,
            max_reads_for_realignment: 20_000,
            no_original_alignment_tags: false,
        }
    }
}

/// Reads and known sites collected for one target interval.
struct IntervalData {
    interval: GenomeLoc,
    reads_to_clean: Vec<RecordBuf>,
    reads_not_to_clean: Vec<RecordBuf>,
    known_indels: Vec<KnownIndel>,
    seen_known: HashSet<usize>,
}

impl IntervalData {
    fn new(interval: GenomeLoc) -> Self {
        Self {
            interval,
            reads_to_clean: Vec::new(),
            reads_not_to_clean: Vec::new(),
            known_indels: Vec::new(),
            seen_known: HashSet::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.reads_to_clean.is_empty() && self.reads_not_to_clean.is_empty()
    }
}

/// The local-realignment stage.
pub struct LocalRealigner {
    options: RealignOptions,
    reference: ReferenceReader,
    intervals: Vec<GenomeLoc>,
    known_indels: Vec<KnownIndel>,
    max_known_footprint: u32,
    pool: Option<Arc<ThreadPool>>,
}

impl LocalRealigner {
    /// Assembles the stage. `intervals` and `known_indels` may arrive in
    /// any order; they are sorted here. With `pool` absent, interval
    /// cleaning and mate fixing run inline on the stage thread.
    #[must_use]
    pub fn new(
        options: RealignOptions,
        reference: ReferenceReader,
        mut intervals: Vec<GenomeLoc>,
        mut known_indels: Vec<KnownIndel>,
        pool: Option<Arc<ThreadPool>>,
    ) -> Self {
        intervals.sort();
        known_indels.sort_by_key(|k| k.loc);
        let max_known_footprint =
            known_indels.iter().map(|k| k.length as u32).max().unwrap_or(0);
        Self { options, reference, intervals, known_indels, max_known_footprint, pool }
    }

    /// Reads that must not be realigned: unplaced, non-primary, QC-failed,
    /// zero-MAPQ, reference-skipping, or beyond the movement bounds.
    fn cannot_be_cleaned(&self, record: &RecordBuf) -> bool {
        let flags = record.flags();
        flags.is_unmapped()
            || flags.is_secondary()
            || flags.is_supplementary()
            || flags.is_qc_fail()
            || record.mapping_quality().map_or(true, |q| u8::from(q) == 0)
            || record.alignment_start().is_none()
            || record
                .cigar()
                .as_ref()
                .iter()
                .any(|op| op.kind() == noodles::sam::alignment::record::cigar::op::Kind::Skip)
            || is_isize_too_big_to_move(record, self.options.max_isize_for_movement)
    }

    /// Collects known sites whose event footprint overlaps the read.
    fn associate_known_indels(&self, read_loc: &GenomeLoc, data: &mut IntervalData) {
        let upper = self
            .known_indels
            .partition_point(|k| (k.loc.contig, k.loc.start) <= (read_loc.contig, read_loc.stop));

        for idx in (0..upper).rev() {
            let known = &self.known_indels[idx];
            if known.loc.contig != read_loc.contig
                || known.loc.start + self.max_known_footprint < read_loc.start.saturating_sub(1)
            {
                break;
            }
            if known.overlaps(read_loc) && data.seen_known.insert(idx) {
                data.known_indels.push(known.clone());
            }
        }
    }

    fn finalize_interval(
        &self,
        data: IntervalData,
        header: &Header,
        emitter: &Arc<EmitQueue>,
        manager: &Arc<MateFixingManager>,
    ) {
        if data.is_empty() {
            return;
        }

        let contig_name = header
            .reference_sequences()
            .get_index(data.interval.contig)
            .map_or_else(
                || format!("#{}", data.interval.contig),
                |(name, _)| String::from_utf8_lossy(name).into_owned(),
            );

        let inputs = CleanInputs {
            interval: data.interval,
            contig_name,
            reads_to_clean: data.reads_to_clean,
            reads_not_to_clean: data.reads_not_to_clean,
            known_indels: data.known_indels,
        };

        let task = Arc::new(CleanTask::new());
        emitter.push(Emittable::Bin(Arc::clone(&task)));

        let options = self.options.clone();
        let reference = self.reference.clone();
        let manager = Arc::clone(manager);
        let emitter = Arc::clone(emitter);
        let job = move || {
            let can_move = manager.can_move_reads(&inputs.interval);
            let outcome = clean_interval(&options, &reference, can_move, inputs);
            task.complete(outcome);
            emitter.flush();
        };

        match &self.pool {
            Some(pool) => pool.execute(job),
            None => job(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_read(
        &self,
        record: RecordBuf,
        current: &mut Option<IntervalData>,
        interval_iter: &mut std::vec::IntoIter<GenomeLoc>,
        header: &Header,
        emitter: &Arc<EmitQueue>,
        manager: &Arc<MateFixingManager>,
    ) {
        let Some(read_loc) = GenomeLoc::of_record(&record) else {
            // Unplaced reads follow every placed read in coordinate order;
            // close out any pending interval before letting them through.
            if let Some(data) = current.take() {
                self.finalize_interval(data, header, emitter, manager);
            }
            emitter.push(Emittable::Read(record));
            return;
        };

        // The stream has moved past the current interval: clean and
        // advance until the interval catches up with the read.
        while current.as_ref().is_some_and(|data| read_loc.is_past(&data.interval)) {
            let data = current.take().expect("checked above");
            self.finalize_interval(data, header, emitter, manager);
            *current = interval_iter.next().map(IntervalData::new);
        }

        match current {
            None => emitter.push(Emittable::Read(record)),
            Some(data) => {
                if read_loc.overlaps(&data.interval) {
                    self.associate_known_indels(&read_loc, data);
                    if self.cannot_be_cleaned(&record) {
                        data.reads_not_to_clean.push(record);
                    } else {
                        data.reads_to_clean.push(record);
                    }
                } else {
                    // Entirely before the interval.
                    emitter.push(Emittable::Read(record));
                }
            }
        }
    }
}

impl Stage for LocalRealigner {
    fn name(&self) -> &'static str {
        "local-realigner"
    }

    fn run(&mut self, io: &mut StageIo) -> Result<()> {
        let threaded = self.pool.is_some();
        info!(
            "Realigning over {} interval(s) with {} known indel site(s)",
            self.intervals.len(),
            self.known_indels.len()
        );

        let matefix_options = MateFixingOptions {
            max_insert_size_for_movement: self.options.max_isize_for_movement,
            max_pos_move_allowed: self.options.max_pos_move_allowed,
            max_records_in_memory: self.options.max_reads_in_memory,
        };
        let manager = Arc::new(MateFixingManager::new(
            matefix_options,
            io.output().clone(),
            threaded,
        ));
        let emitter = Arc::new(EmitQueue::new(Arc::clone(&manager)));

        let mut interval_iter = std::mem::take(&mut self.intervals).into_iter();
        let mut current = interval_iter.next().map(IntervalData::new);
        let progress = ProgressTracker::new("Processed alignments");
        let header = io.context().header().clone();

        while let Some(record) = io.next_input() {
            progress.inc(1);
            self.process_read(record, &mut current, &mut interval_iter, &header, &emitter, &manager);
        }

        if let Some(data) = current.take() {
            self.finalize_interval(data, &header, &emitter, &manager);
        }

        if let Some(pool) = &self.pool {
            pool.wait_for_completion();
        }
        emitter.final_flush();
        manager.close();
        progress.log_final();
        debug!("Realignment stream complete");

        Ok(())
    }
}
