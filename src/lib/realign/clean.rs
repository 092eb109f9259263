//! Interval cleaning: pick the consensus that minimizes mismatch quality
//! and rewrite the reads that support it.
//!
//! Cleaning never fails the stream: any condition that prevents
//! realignment (too many reads, missing reference window, no usable
//! consensus, insufficient improvement) degrades to emitting the
//! interval's reads unchanged.

use log::{debug, warn};
use noodles::core::Position;
use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record::cigar::Op;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::alignment::record_buf::RecordBuf;

use crate::errors::ReadforgeError;
use crate::known_sites::KnownIndel;
use crate::locus::GenomeLoc;
use crate::realign::consensus::{
    consensus_from_cigar, consensus_from_known_indel, fit_read_to_window, is_regular_base,
    Consensus,
};
use crate::realign::{ConsensusModel, RealignOptions};
use crate::reference::ReferenceReader;
use crate::sam::record_utils::alignment_end;
use crate::sort::keys::{CoordinateKey, SortKey};

/// Original-CIGAR tag attached to realigned reads.
pub const OC_TAG: Tag = Tag::new(b'O', b'C');

/// Original-position tag attached to realigned reads.
pub const OP_TAG: Tag = Tag::new(b'O', b'P');

/// Reference bases of padding on both sides of an interval's read span.
pub const REFERENCE_PADDING: u32 = 30;

/// Mismatch penalty for read bases hanging past the window.
const MAX_QUAL: i64 = 99;

/// A cleaned column may keep at most this fraction of mismatch quality.
const MISMATCH_COLUMN_CLEANED_FRACTION: f64 = 0.75;

/// Score for alignments that fall off the window entirely.
const OUT_OF_WINDOW_SCORE: i64 = i64::MAX / 4;

/// Everything one interval's cleaning needs, detached from the stream.
pub struct CleanInputs {
    /// The target interval.
    pub interval: GenomeLoc,
    /// Its contig's name in the reference.
    pub contig_name: String,
    /// Reads that qualify for realignment.
    pub reads_to_clean: Vec<RecordBuf>,
    /// Overlapping reads that only pass through.
    pub reads_not_to_clean: Vec<RecordBuf>,
    /// Known indel sites overlapping reads of this interval.
    pub known_indels: Vec<KnownIndel>,
}

/// An interval's reads in coordinate order with per-read modified flags.
pub struct CleanOutcome {
    /// All of the interval's reads.
    pub reads: Vec<RecordBuf>,
    /// Parallel to `reads`: true for reads the cleaner rewrote.
    pub modified: Vec<bool>,
}

/// Cleans one interval. `can_move` is the mate-fixing manager's verdict on
/// whether this region may still be reordered.
pub fn clean_interval(
    options: &RealignOptions,
    reference: &ReferenceReader,
    can_move: bool,
    inputs: CleanInputs,
) -> CleanOutcome {
    let CleanInputs { interval, contig_name, reads_to_clean, reads_not_to_clean, known_indels } =
        inputs;

    if reads_to_clean.is_empty() {
        return pass_through(reads_to_clean, reads_not_to_clean);
    }
    if !can_move {
        debug!("Skipping realignment at {interval}: too close to the last flushed locus");
        return pass_through(reads_to_clean, reads_not_to_clean);
    }
    if reads_to_clean.len() > options.max_reads_for_realignment {
        warn!(
            "{}",
            ReadforgeError::IntervalExhausted {
                interval: format!("{contig_name}:{}-{}", interval.start, interval.stop),
                count: reads_to_clean.len(),
                limit: options.max_reads_for_realignment,
            }
        );
        return pass_through(reads_to_clean, reads_not_to_clean);
    }

    // Padded reference window spanning the interval and every read on it.
    let mut span_start = i64::from(interval.start);
    let mut span_stop = i64::from(interval.stop);
    for read in &reads_to_clean {
        if let Some(start) = read.alignment_start().map(usize::from) {
            span_start = span_start.min(start as i64);
            span_stop = span_stop.max(alignment_end(read).unwrap_or(start) as i64);
        }
    }
    let window = reference.window(
        &contig_name,
        span_start - i64::from(REFERENCE_PADDING),
        span_stop + i64::from(REFERENCE_PADDING),
    );
    let (window, leftmost) = match window {
        Ok((window, leftmost)) => (window, leftmost as i64),
        Err(e) => {
            warn!("Skipping realignment at {interval}: {e}");
            return pass_through(reads_to_clean, reads_not_to_clean);
        }
    };

    // Partition reads: perfect matches stay untouched, the rest are
    // realignment candidates; gapped candidates also seed consensuses.
    let mut ref_reads: Vec<RecordBuf> = Vec::new();
    let mut alt_reads: Vec<AlignedRead> = Vec::new();
    let mut total_raw_mismatch_sum: i64 = 0;

    for record in reads_to_clean {
        let aligned = AlignedRead::new(record);
        let start_on_ref = aligned.original_start - leftmost;
        let score = mismatch_quality_sum(&aligned, &window, start_on_ref, i64::MAX / 2);
        if score > 0 {
            if !aligned.record.flags().is_duplicate() {
                total_raw_mismatch_sum += score;
            }
            alt_reads.push(aligned);
        } else {
            ref_reads.push(aligned.into_record());
        }
    }

    if alt_reads.is_empty() {
        return finish(ref_reads, alt_reads, reads_not_to_clean, Vec::new());
    }

    let consenses =
        generate_consenses(options, &window, leftmost, &known_indels, &alt_reads);
    if consenses.is_empty() {
        return finish(ref_reads, alt_reads, reads_not_to_clean, Vec::new());
    }

    // Score every candidate, keeping the best offset per read. Summation
    // short-circuits once a candidate is already worse than the best.
    let mut consenses = consenses;
    let mut best_idx: Option<usize> = None;
    let mut best_sum = i64::MAX;
    for ci in 0..consenses.len() {
        let mut sum = 0i64;
        let mut read_indexes = Vec::with_capacity(alt_reads.len());
        for (ri, aligned) in alt_reads.iter().enumerate() {
            let (score, offset) =
                find_best_offset(&consenses[ci].sequence, aligned, leftmost);
            read_indexes.push((ri, offset));
            sum += score;
            if sum > best_sum {
                break;
            }
        }
        consenses[ci].mismatch_sum = sum;
        consenses[ci].read_indexes = read_indexes;

        let better = match best_idx {
            None => true,
            Some(best) => {
                sum < best_sum
                    || (sum == best_sum
                        && indel_offset(&consenses[ci]) < indel_offset(&consenses[best]))
            }
        };
        if better {
            best_idx = Some(ci);
            best_sum = sum;
        }
    }

    let best = &consenses[best_idx.expect("at least one consensus scored")];
    let improvement = (total_raw_mismatch_sum - best.mismatch_sum) as f64 / 10.0;
    if improvement < options.lod_threshold {
        return finish(ref_reads, alt_reads, reads_not_to_clean, Vec::new());
    }

    // Tentatively rewrite the supporting reads against the best consensus.
    for &(ri, offset) in &best.read_indexes {
        if !update_read(
            &best.cigar,
            best.position_on_reference,
            offset,
            &mut alt_reads[ri],
            leftmost,
        ) {
            debug!("Inconsistent consensus placement at {interval}; leaving reads unchanged");
            for aligned in &mut alt_reads {
                aligned.clear_tentative();
            }
            return finish(ref_reads, alt_reads, reads_not_to_clean, Vec::new());
        }
    }

    if options.consensus_model != ConsensusModel::KnownsOnly
        && !alternate_reduces_entropy(&alt_reads, &window, leftmost, options.mismatch_threshold)
    {
        for aligned in &mut alt_reads {
            aligned.clear_tentative();
        }
        return finish(ref_reads, alt_reads, reads_not_to_clean, Vec::new());
    }

    // Commit, under the per-read movement cap.
    let mut cleaned_indices = Vec::new();
    for &(ri, _) in &best.read_indexes {
        if alt_reads[ri].constize_update(
            i64::from(options.max_pos_move_allowed),
            options.no_original_alignment_tags,
        ) {
            cleaned_indices.push(ri);
        }
    }

    debug!(
        "Realigned {} of {} reads at {} (LOD {:.2})",
        cleaned_indices.len(),
        best.read_indexes.len(),
        interval,
        improvement
    );

    finish(ref_reads, alt_reads, reads_not_to_clean, cleaned_indices)
}

fn pass_through(reads_to_clean: Vec<RecordBuf>, reads_not_to_clean: Vec<RecordBuf>) -> CleanOutcome {
    let mut reads: Vec<(CoordinateKey, RecordBuf, bool)> = reads_to_clean
        .into_iter()
        .chain(reads_not_to_clean)
        .map(|r| (CoordinateKey::from_record(&r), r, false))
        .collect();
    sort_outcome(&mut reads)
}

fn finish(
    ref_reads: Vec<RecordBuf>,
    alt_reads: Vec<AlignedRead>,
    reads_not_to_clean: Vec<RecordBuf>,
    cleaned_indices: Vec<usize>,
) -> CleanOutcome {
    let mut reads: Vec<(CoordinateKey, RecordBuf, bool)> =
        Vec::with_capacity(ref_reads.len() + alt_reads.len() + reads_not_to_clean.len());
    for record in ref_reads {
        reads.push((CoordinateKey::from_record(&record), record, false));
    }
    for (ri, aligned) in alt_reads.into_iter().enumerate() {
        let modified = cleaned_indices.contains(&ri);
        let record = aligned.into_record();
        reads.push((CoordinateKey::from_record(&record), record, modified));
    }
    for record in reads_not_to_clean {
        reads.push((CoordinateKey::from_record(&record), record, false));
    }
    sort_outcome(&mut reads)
}

fn sort_outcome(reads: &mut Vec<(CoordinateKey, RecordBuf, bool)>) -> CleanOutcome {
    reads.sort_by(|(a, _, _), (b, _, _)| a.cmp(b));
    let mut records = Vec::with_capacity(reads.len());
    let mut modified = Vec::with_capacity(reads.len());
    for (_, record, was_modified) in reads.drain(..) {
        records.push(record);
        modified.push(was_modified);
    }
    CleanOutcome { reads: records, modified }
}

fn generate_consenses(
    options: &RealignOptions,
    window: &[u8],
    leftmost: i64,
    known_indels: &[KnownIndel],
    alt_reads: &[AlignedRead],
) -> Vec<Consensus> {
    let mut consenses: Vec<Consensus> = Vec::new();
    let mut seen: std::collections::HashSet<Vec<u8>> = std::collections::HashSet::new();
    let mut push = |candidate: Option<Consensus>, consenses: &mut Vec<Consensus>| {
        if let Some(candidate) = candidate {
            if consenses.len() < options.max_consensuses && seen.insert(candidate.sequence.clone())
            {
                consenses.push(candidate);
            }
        }
    };

    // Known sites always contribute; the event begins one base after the
    // VCF anchor.
    for indel in known_indels {
        let index_on_ref = i64::from(indel.loc.start) + 1 - leftmost;
        push(consensus_from_known_indel(index_on_ref, window, indel), &mut consenses);
    }

    if options.consensus_model != ConsensusModel::KnownsOnly {
        for aligned in alt_reads
            .iter()
            .filter(|a| a.has_single_indel())
            .take(options.max_reads_for_consensuses)
        {
            push(
                consensus_from_cigar(
                    aligned.original_start - leftmost,
                    &aligned.unclipped_cigar,
                    window,
                    &aligned.bases,
                ),
                &mut consenses,
            );
        }
    }

    if options.consensus_model == ConsensusModel::UseSw {
        for aligned in alt_reads.iter().take(options.max_reads_for_consensuses) {
            if let Some((start, cigar)) = fit_read_to_window(&aligned.bases, window) {
                push(
                    consensus_from_cigar(start as i64, &cigar, window, &aligned.bases),
                    &mut consenses,
                );
            }
        }
    }

    consenses
}

/// Window offset of a consensus's indel, for tie-breaking equal scores.
fn indel_offset(consensus: &Consensus) -> usize {
    let leading = consensus
        .cigar
        .first()
        .filter(|op| op.kind() == Kind::Match)
        .map_or(0, |op| op.len());
    consensus.position_on_reference + leading
}

/// A read under consideration, with clip-free bases and tentative updates.
pub(crate) struct AlignedRead {
    record: RecordBuf,
    /// Bases with soft clips removed, uppercased.
    pub(crate) bases: Vec<u8>,
    quals: Vec<u8>,
    /// Clip-free CIGAR over `bases`.
    unclipped_cigar: Vec<Op>,
    /// 1-based original alignment start.
    pub(crate) original_start: i64,
    new_start: Option<i64>,
    new_cigar: Option<Vec<Op>>,
}

impl AlignedRead {
    pub(crate) fn new(record: RecordBuf) -> Self {
        let original_start = record.alignment_start().map_or(0, |p| usize::from(p) as i64);
        let cigar: Vec<Op> = record.cigar().as_ref().to_vec();
        let sequence = record.sequence().as_ref();
        let quality = record.quality_scores().as_ref();

        let mut bases = Vec::with_capacity(sequence.len());
        let mut quals = Vec::with_capacity(quality.len());
        let mut unclipped_cigar = Vec::with_capacity(cigar.len());

        if cigar.is_empty() {
            bases.extend_from_slice(sequence);
            quals.extend_from_slice(quality);
        } else {
            let mut read_idx = 0usize;
            for op in &cigar {
                let len = op.len();
                match op.kind() {
                    Kind::SoftClip => read_idx += len,
                    Kind::HardClip | Kind::Pad => {}
                    kind => {
                        if consumes_query(kind) {
                            bases.extend_from_slice(&sequence[read_idx..read_idx + len]);
                            quals.extend_from_slice(&quality[read_idx..read_idx + len]);
                            read_idx += len;
                        }
                        unclipped_cigar.push(*op);
                    }
                }
            }
        }
        bases.make_ascii_uppercase();

        Self {
            record,
            bases,
            quals,
            unclipped_cigar,
            original_start,
            new_start: None,
            new_cigar: None,
        }
    }

    fn len(&self) -> usize {
        self.bases.len()
    }

    /// True when the alignment carries exactly one indel.
    fn has_single_indel(&self) -> bool {
        let indels = self
            .unclipped_cigar
            .iter()
            .filter(|op| matches!(op.kind(), Kind::Insertion | Kind::Deletion))
            .count();
        indels == 1
    }

    fn set_new_start(&mut self, start: i64) {
        self.new_start = Some(start);
    }

    fn set_new_cigar(&mut self, cigar: Option<Vec<Op>>) {
        self.new_cigar = cigar;
    }

    fn clear_tentative(&mut self) {
        self.new_start = None;
        self.new_cigar = None;
    }

    fn effective_start(&self) -> i64 {
        self.new_start.unwrap_or(self.original_start)
    }

    fn effective_cigar(&self) -> &[Op] {
        self.new_cigar.as_deref().unwrap_or(&self.unclipped_cigar)
    }

    /// Applies the tentative update if there is one and it stays within
    /// the movement cap. Realigned reads get their original CIGAR and
    /// position recorded in OC/OP tags and a small mapping-quality bump.
    fn constize_update(&mut self, max_pos_move: i64, no_tags: bool) -> bool {
        let Some(new_cigar) = self.new_cigar.take() else {
            self.new_start = None;
            return false;
        };
        let new_start = self.new_start.take().unwrap_or(self.original_start);

        if (new_start - self.original_start).abs() > max_pos_move {
            debug!(
                "Not realigning read: it would move {} bases (cap {max_pos_move})",
                (new_start - self.original_start).abs()
            );
            return false;
        }

        let original_cigar: Vec<Op> = self.record.cigar().as_ref().to_vec();
        let reclipped = reclip_cigar(&new_cigar, &original_cigar);
        if reclipped == original_cigar && new_start == self.original_start {
            return false;
        }

        if !no_tags {
            self.record
                .data_mut()
                .insert(OC_TAG, Value::String(cigar_to_string(&original_cigar).into()));
            self.record.data_mut().insert(OP_TAG, Value::Int32(self.original_start as i32));
        }

        *self.record.cigar_mut() = reclipped.iter().copied().collect();
        *self.record.alignment_start_mut() =
            usize::try_from(new_start).ok().and_then(|s| Position::try_from(s).ok());
        if let Some(mapq) = self.record.mapping_quality() {
            let bumped = u8::from(mapq).saturating_add(10).min(254);
            *self.record.mapping_quality_mut() = bumped.try_into().ok();
        }
        self.unclipped_cigar = new_cigar;

        true
    }

    fn into_record(self) -> RecordBuf {
        self.record
    }
}

fn consumes_query(kind: Kind) -> bool {
    matches!(
        kind,
        Kind::Match | Kind::Insertion | Kind::SoftClip | Kind::SequenceMatch | Kind::SequenceMismatch
    )
}

/// Restores the original clip operators around a rewritten CIGAR.
fn reclip_cigar(new_cigar: &[Op], original: &[Op]) -> Vec<Op> {
    let is_clip = |op: &&Op| matches!(op.kind(), Kind::SoftClip | Kind::HardClip);
    let mut out: Vec<Op> = original.iter().take_while(is_clip).copied().collect();
    out.extend_from_slice(new_cigar);
    let trailing: Vec<Op> = original.iter().rev().take_while(is_clip).copied().collect();
    out.extend(trailing.into_iter().rev());
    out
}

/// Renders a CIGAR in its text form.
pub(crate) fn cigar_to_string(cigar: &[Op]) -> String {
    let mut out = String::with_capacity(cigar.len() * 4);
    for op in cigar {
        out.push_str(&op.len().to_string());
        out.push(match op.kind() {
            Kind::Match => 'M',
            Kind::Insertion => 'I',
            Kind::Deletion => 'D',
            Kind::Skip => 'N',
            Kind::SoftClip => 'S',
            Kind::HardClip => 'H',
            Kind::Pad => 'P',
            Kind::SequenceMatch => '=',
            Kind::SequenceMismatch => 'X',
        });
    }
    out
}

/// Sum of base qualities at mismatching positions, ignoring the CIGAR:
/// the read is laid gaplessly on `reference` at `ref_index`. Bases past
/// the window cost [`MAX_QUAL`] each; summation stops once `quit_above`
/// is exceeded.
pub(crate) fn mismatch_quality_sum(
    read: &AlignedRead,
    reference: &[u8],
    ref_index: i64,
    quit_above: i64,
) -> i64 {
    if ref_index < 0 {
        return OUT_OF_WINDOW_SCORE;
    }
    let mut sum = 0i64;
    for (i, (&base, &qual)) in read.bases.iter().zip(&read.quals).enumerate() {
        let idx = ref_index as usize + i;
        if idx >= reference.len() {
            sum += MAX_QUAL;
        } else {
            let ref_base = reference[idx];
            if !is_regular_base(base) || !is_regular_base(ref_base) {
                continue;
            }
            if base != ref_base {
                sum += i64::from(qual);
            }
        }
        if sum > quit_above {
            return sum;
        }
    }
    sum
}

/// Best gapless placement of a read on a consensus sequence.
///
/// The read's original offset is scored first; other offsets are tried by
/// increasing distance from it with strict improvement, so ties resolve to
/// the offset closest to the original position.
pub(crate) fn find_best_offset(
    sequence: &[u8],
    read: &AlignedRead,
    leftmost: i64,
) -> (i64, usize) {
    let original_index = (read.original_start - leftmost).max(0);
    let mut best_score = mismatch_quality_sum(read, sequence, original_index, i64::MAX / 2);
    let mut best_offset = original_index;
    if best_score == 0 {
        return (0, best_offset as usize);
    }

    let max_possible = sequence.len() as i64 - read.len() as i64;
    if max_possible < 0 {
        return (best_score, best_offset as usize);
    }

    let max_distance = original_index.max(max_possible - original_index);
    for distance in 1..=max_distance {
        for candidate in [original_index - distance, original_index + distance] {
            if candidate < 0 || candidate > max_possible {
                continue;
            }
            let score = mismatch_quality_sum(read, sequence, candidate, best_score);
            if score < best_score {
                best_score = score;
                best_offset = candidate;
                if score == 0 {
                    return (0, best_offset as usize);
                }
            }
        }
    }

    (best_score, best_offset as usize)
}

/// Maps a read placed at `my_pos_on_alt` on a consensus back to reference
/// coordinates, producing its tentative start and CIGAR.
///
/// The consensus CIGAR must be a single M block, or one indel with an
/// optional leading M. Reads landing entirely on one side of the indel
/// keep their original alignment.
pub(crate) fn update_read(
    alt_cigar: &[Op],
    alt_pos_on_ref: usize,
    my_pos_on_alt: usize,
    read: &mut AlignedRead,
    leftmost: i64,
) -> bool {
    // No indel: a straight re-placement on the reference.
    if alt_cigar.len() == 1 && alt_cigar[0].kind() == Kind::Match {
        read.set_new_start(leftmost + my_pos_on_alt as i64);
        read.set_new_cigar(Some(vec![Op::new(Kind::Match, read.len())]));
        return true;
    }

    let Some(&first) = alt_cigar.first() else { return false };
    let Some(&second) = alt_cigar.get(1) else { return false };

    let (indel, leading_match_len) = if first.kind() == Kind::Insertion {
        if second.kind() != Kind::Match {
            return false;
        }
        (first, 0)
    } else if first.kind() == Kind::Match {
        if !matches!(second.kind(), Kind::Insertion | Kind::Deletion) {
            return false;
        }
        (second, first.len())
    } else {
        return false;
    };

    let end_of_first_block = alt_pos_on_ref + leading_match_len;
    let read_len = read.len();
    let mut new_cigar: Vec<Op> = Vec::with_capacity(3);
    let mut saw_alignment_start = false;

    // Reads starting before the indel.
    if my_pos_on_alt < end_of_first_block {
        read.set_new_start(leftmost + my_pos_on_alt as i64);
        saw_alignment_start = true;

        // Ending before it too: the original alignment already stands.
        if my_pos_on_alt + read_len <= end_of_first_block {
            read.clear_tentative();
            return true;
        }
        new_cigar.push(Op::new(Kind::Match, end_of_first_block - my_pos_on_alt));
    }

    if indel.kind() == Kind::Insertion {
        // Ending inside the insertion.
        if my_pos_on_alt + read_len < end_of_first_block + indel.len() {
            let partial = if saw_alignment_start {
                my_pos_on_alt + read_len - end_of_first_block
            } else {
                read_len
            };
            new_cigar.push(Op::new(Kind::Insertion, partial));
            read.set_new_cigar(Some(new_cigar));
            return saw_alignment_start;
        }

        if !saw_alignment_start && my_pos_on_alt < end_of_first_block + indel.len() {
            // Starting inside the insertion.
            read.set_new_start(leftmost + end_of_first_block as i64);
            new_cigar
                .push(Op::new(Kind::Insertion, indel.len() - (my_pos_on_alt - end_of_first_block)));
            saw_alignment_start = true;
        } else if saw_alignment_start {
            new_cigar.push(indel);
        }
    } else if saw_alignment_start {
        new_cigar.push(indel);
    }

    // Reads starting after the indel keep their original alignment.
    if !saw_alignment_start {
        read.clear_tentative();
        return true;
    }

    let consumed: usize =
        new_cigar.iter().filter(|op| op.kind() != Kind::Deletion).map(|op| op.len()).sum();
    if read_len > consumed {
        new_cigar.push(Op::new(Kind::Match, read_len - consumed));
    }
    read.set_new_cigar(Some(new_cigar));

    true
}

/// Column-entropy gate: accept the realignment only when it reduces the
/// number of quality-weighted mismatch columns.
pub(crate) fn alternate_reduces_entropy(
    reads: &[AlignedRead],
    reference: &[u8],
    leftmost: i64,
    mismatch_threshold: f64,
) -> bool {
    let len = reference.len();
    let mut original_mismatch = vec![0i64; len];
    let mut cleaned_mismatch = vec![0i64; len];
    let mut total_original = vec![0i64; len];
    let mut total_cleaned = vec![0i64; len];

    for read in reads {
        // Reads whose original alignment is gapped have no meaningful
        // gapless baseline; skip them.
        if read
            .record
            .cigar()
            .as_ref()
            .iter()
            .any(|op| matches!(op.kind(), Kind::Insertion | Kind::Deletion | Kind::Skip))
        {
            continue;
        }

        // Original (gapless) placement.
        let mut ref_idx = read.original_start - leftmost;
        for (&base, &qual) in read.bases.iter().zip(&read.quals) {
            if ref_idx < 0 || ref_idx as usize >= len {
                break;
            }
            total_original[ref_idx as usize] += i64::from(qual);
            if base != reference[ref_idx as usize] {
                original_mismatch[ref_idx as usize] += i64::from(qual);
            }
            ref_idx += 1;
        }

        // Placement after cleaning, walking the effective CIGAR.
        let mut ref_idx = read.effective_start() - leftmost;
        let mut read_idx = 0usize;
        for op in read.effective_cigar() {
            let op_len = op.len();
            match op.kind() {
                Kind::Match | Kind::SequenceMatch | Kind::SequenceMismatch => {
                    for _ in 0..op_len {
                        if ref_idx >= 0 && (ref_idx as usize) < len && read_idx < read.bases.len()
                        {
                            total_cleaned[ref_idx as usize] += i64::from(read.quals[read_idx]);
                            if read.bases[read_idx] != reference[ref_idx as usize] {
                                cleaned_mismatch[ref_idx as usize] +=
                                    i64::from(read.quals[read_idx]);
                            }
                        }
                        ref_idx += 1;
                        read_idx += 1;
                    }
                }
                Kind::Insertion | Kind::SoftClip => read_idx += op_len,
                Kind::Deletion | Kind::Skip => ref_idx += op_len as i64,
                Kind::HardClip | Kind::Pad => {}
            }
        }
    }

    let mut original_columns = 0usize;
    let mut cleaned_columns = 0usize;
    for i in 0..len {
        if cleaned_mismatch[i] == original_mismatch[i] {
            continue;
        }
        if original_mismatch[i] as f64 > total_original[i] as f64 * mismatch_threshold {
            original_columns += 1;
            if cleaned_mismatch[i] as f64
                > total_cleaned[i] as f64 * MISMATCH_COLUMN_CLEANED_FRACTION
            {
                cleaned_columns += 1;
            }
        } else if cleaned_mismatch[i] as f64 > total_cleaned[i] as f64 * mismatch_threshold {
            cleaned_columns += 1;
        }
    }

    original_columns == 0 || cleaned_columns < original_columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sam::builder::{parse_cigar, RecordBuilder};

    fn aligned(record: RecordBuf) -> AlignedRead {
        AlignedRead::new(record)
    }

    #[test]
    fn test_unclipped_bases_strip_soft_clips() {
        let read = aligned(
            RecordBuilder::mapped()
                .alignment_start(100)
                .sequence("AACCGGTT")
                .cigar("2S4M2S")
                .build(),
        );
        assert_eq!(read.bases, b"CCGG");
        assert_eq!(read.unclipped_cigar, parse_cigar("4M"));
    }

    #[test]
    fn test_mismatch_quality_sum_counts_mismatches() {
        let read = aligned(
            RecordBuilder::mapped()
                .alignment_start(1)
                .sequence("ACGT")
                .qualities(vec![10, 20, 30, 40])
                .cigar("4M")
                .build(),
        );
        // Reference differs at positions 1 and 3.
        assert_eq!(mismatch_quality_sum(&read, b"AAGA", 0, i64::MAX / 2), 60);
        assert_eq!(mismatch_quality_sum(&read, b"ACGT", 0, i64::MAX / 2), 0);
    }

    #[test]
    fn test_mismatch_quality_sum_out_of_window() {
        let read = aligned(
            RecordBuilder::mapped().alignment_start(1).sequence("ACGT").cigar("4M").build(),
        );
        assert_eq!(mismatch_quality_sum(&read, b"ACGT", -1, i64::MAX / 2), OUT_OF_WINDOW_SCORE);
        // Two bases hang off the end of a 2-base window.
        assert_eq!(mismatch_quality_sum(&read, b"AC", 0, i64::MAX / 2), 2 * MAX_QUAL);
    }

    #[test]
    fn test_mismatch_quality_sum_early_termination() {
        let read = aligned(
            RecordBuilder::mapped()
                .alignment_start(1)
                .sequence("AAAA")
                .qualities(vec![30; 4])
                .cigar("4M")
                .build(),
        );
        let score = mismatch_quality_sum(&read, b"CCCC", 0, 40);
        assert!(score > 40);
        assert!(score < 120); // stopped before summing all four
    }

    #[test]
    fn test_find_best_offset_prefers_closest_on_tie() {
        // The consensus contains the read at offsets 2 and 8; original
        // position maps to offset 5, equidistant-ish; the scan hits 2
        // via distance 3 before 8 via distance 3, left candidate first.
        let read = aligned(
            RecordBuilder::mapped().alignment_start(6).sequence("ACGT").cigar("4M").build(),
        );
        let sequence = b"GGACGTGGACGTGG";
        let leftmost = 1;
        let (score, offset) = find_best_offset(sequence, &read, leftmost);
        assert_eq!(score, 0);
        assert_eq!(offset, 2);
    }

    #[test]
    fn test_find_best_offset_keeps_original_when_perfect() {
        let read = aligned(
            RecordBuilder::mapped().alignment_start(3).sequence("ACGT").cigar("4M").build(),
        );
        let sequence = b"GGACGTGG";
        let (score, offset) = find_best_offset(sequence, &read, 1);
        assert_eq!(score, 0);
        assert_eq!(offset, 2);
    }

    #[test]
    fn test_update_read_straight_match() {
        let mut read = aligned(
            RecordBuilder::mapped().alignment_start(50).sequence("ACGT").cigar("4M").build(),
        );
        assert!(update_read(&parse_cigar("20M"), 0, 7, &mut read, 100));
        assert_eq!(read.effective_start(), 107);
        assert_eq!(read.effective_cigar(), parse_cigar("4M").as_slice());
    }

    #[test]
    fn test_update_read_spanning_deletion() {
        // Consensus: 10M 2D 10M starting at window offset 0. A 8-base read
        // placed at alt offset 6 crosses the deletion after 4 bases.
        let mut read = aligned(
            RecordBuilder::mapped()
                .alignment_start(50)
                .sequence("AAAACCCC")
                .cigar("8M")
                .build(),
        );
        assert!(update_read(&parse_cigar("10M2D10M"), 0, 6, &mut read, 100));
        assert_eq!(read.effective_start(), 106);
        assert_eq!(read.effective_cigar(), parse_cigar("4M2D4M").as_slice());
    }

    #[test]
    fn test_update_read_spanning_insertion() {
        // Consensus: 10M 3I 10M. Read of 8 at alt offset 8: 2M 3I 3M.
        let mut read = aligned(
            RecordBuilder::mapped()
                .alignment_start(50)
                .sequence("AAAACCCC")
                .cigar("8M")
                .build(),
        );
        assert!(update_read(&parse_cigar("10M3I10M"), 0, 8, &mut read, 100));
        assert_eq!(read.effective_start(), 108);
        assert_eq!(read.effective_cigar(), parse_cigar("2M3I3M").as_slice());
    }

    #[test]
    fn test_update_read_before_indel_keeps_original() {
        let mut read = aligned(
            RecordBuilder::mapped().alignment_start(50).sequence("ACGT").cigar("4M").build(),
        );
        // Read ends at alt offset 6, before the indel at offset 10.
        assert!(update_read(&parse_cigar("10M2D10M"), 0, 2, &mut read, 100));
        // Position recorded but no cigar: nothing to apply.
        assert!(read.new_cigar.is_none());
        assert!(!read.constize_update(200, false));
    }

    #[test]
    fn test_update_read_after_indel_keeps_original() {
        let mut read = aligned(
            RecordBuilder::mapped().alignment_start(50).sequence("ACGT").cigar("4M").build(),
        );
        assert!(update_read(&parse_cigar("10M2D10M"), 0, 14, &mut read, 100));
        assert!(read.new_cigar.is_none());
    }

    #[test]
    fn test_constize_applies_tags_and_movement_cap() {
        let mut read = aligned(
            RecordBuilder::mapped()
                .name("r")
                .alignment_start(100)
                .sequence("AAAACCCC")
                .cigar("8M")
                .mapping_quality(40)
                .build(),
        );
        read.set_new_start(102);
        read.set_new_cigar(Some(parse_cigar("4M2D4M")));
        assert!(read.constize_update(200, false));

        let record = read.into_record();
        assert_eq!(record.alignment_start().map(usize::from), Some(102));
        assert_eq!(
            record.data().get(&OC_TAG),
            Some(&Value::String("8M".into()))
        );
        assert_eq!(record.data().get(&OP_TAG), Some(&Value::Int32(100)));
        assert_eq!(record.mapping_quality().map(u8::from), Some(50));
    }

    #[test]
    fn test_constize_rejects_beyond_movement_cap() {
        let mut read = aligned(
            RecordBuilder::mapped()
                .alignment_start(100)
                .sequence("AAAACCCC")
                .cigar("8M")
                .build(),
        );
        read.set_new_start(160);
        read.set_new_cigar(Some(parse_cigar("4M2D4M")));
        // Cap of 10: a 60-base move is rejected, record untouched.
        assert!(!read.constize_update(10, false));

        let record = read.into_record();
        assert_eq!(record.alignment_start().map(usize::from), Some(100));
        assert!(record.data().get(&OC_TAG).is_none());
    }

    #[test]
    fn test_reclip_cigar_restores_clips() {
        let original = parse_cigar("3S10M2H");
        let new_cigar = parse_cigar("4M2D6M");
        assert_eq!(reclip_cigar(&new_cigar, &original), parse_cigar("3S4M2D6M2H"));
    }

    #[test]
    fn test_cigar_to_string() {
        assert_eq!(cigar_to_string(&parse_cigar("3S10M2D5M")), "3S10M2D5M");
    }

    #[test]
    fn test_entropy_accepts_real_cleanup() {
        // Three reads with a shared mismatch column cleaned by a 1-base
        // deletion placement.
        let reference = b"AAAATTTTCCCC";
        let mut reads = Vec::new();
        for i in 0..3 {
            let mut read = aligned(
                RecordBuilder::mapped()
                    .name(&format!("r{i}"))
                    .alignment_start(5)
                    .sequence("TTTCC")
                    .qualities(vec![30; 5])
                    .cigar("5M")
                    .build(),
            );
            // Cleaned placement: 3M1D2M at the same start, skipping the
            // mismatching column.
            read.set_new_start(5);
            read.set_new_cigar(Some(parse_cigar("3M1D2M")));
            reads.push(read);
        }
        assert!(alternate_reduces_entropy(&reads, reference, 1, 0.15));
    }

    #[test]
    fn test_entropy_rejects_pushed_mismatches() {
        // A shift that keeps the mismatch column dirty and dirties a new
        // one: one column before, two after.
        let reference = b"AAAACAAAA";
        let mut read = aligned(
            RecordBuilder::mapped()
                .alignment_start(1)
                .sequence("AAAAT")
                .qualities(vec![30, 30, 30, 30, 40])
                .cigar("5M")
                .build(),
        );
        read.set_new_start(2);
        read.set_new_cigar(Some(parse_cigar("5M")));
        assert!(!alternate_reduces_entropy(&[read], reference, 1, 0.15));
    }
}
