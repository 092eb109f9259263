//! Alternate-consensus generation.
//!
//! A consensus candidate is the padded reference window with exactly one
//! indel applied: its sequence, the CIGAR placing it back on the window,
//! and the window offset that CIGAR starts at. Candidates come from three
//! sources: known indel sites, indels already present in read CIGARs,
//! and Smith-Waterman alignment of mismatching reads against the window.

use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record::cigar::Op;

use crate::known_sites::KnownIndel;

/// A candidate alternate reference for one interval.
#[derive(Debug, Clone)]
pub struct Consensus {
    /// The full-window alternate sequence.
    pub sequence: Vec<u8>,
    /// CIGAR of the altered stretch against the reference window.
    pub cigar: Vec<Op>,
    /// Window offset the CIGAR starts at.
    pub position_on_reference: usize,
    /// Total mismatch-quality sum across scored reads.
    pub mismatch_sum: i64,
    /// Per-read (index, best offset on this consensus) pairs.
    pub read_indexes: Vec<(usize, usize)>,
}

/// True for A, C, G, or T.
#[inline]
#[must_use]
pub fn is_regular_base(base: u8) -> bool {
    matches!(base.to_ascii_uppercase(), b'A' | b'C' | b'G' | b'T')
}

/// Builds a consensus from a known indel site.
///
/// `index_on_ref` is the 0-based window offset of the first base affected
/// by the event. The CIGAR covers the whole window, so the consensus sits
/// at window offset 0.
#[must_use]
pub fn consensus_from_known_indel(
    index_on_ref: i64,
    reference: &[u8],
    indel: &KnownIndel,
) -> Option<Consensus> {
    if index_on_ref < 0 || index_on_ref as usize >= reference.len() {
        return None;
    }
    let index_on_ref = index_on_ref as usize;

    let mut sequence = Vec::with_capacity(reference.len() + indel.length);
    sequence.extend_from_slice(&reference[..index_on_ref]);

    let mut cigar = Vec::with_capacity(3);
    if index_on_ref > 0 {
        cigar.push(Op::new(Kind::Match, index_on_ref));
    }

    let ref_idx = if indel.is_insertion {
        sequence.extend_from_slice(&indel.bases);
        cigar.push(Op::new(Kind::Insertion, indel.length));
        index_on_ref
    } else {
        if index_on_ref + indel.length > reference.len() {
            return None;
        }
        cigar.push(Op::new(Kind::Deletion, indel.length));
        index_on_ref + indel.length
    };

    if reference.len() > ref_idx {
        cigar.push(Op::new(Kind::Match, reference.len() - ref_idx));
        sequence.extend_from_slice(&reference[ref_idx..]);
    }

    Some(Consensus {
        sequence,
        cigar,
        position_on_reference: 0,
        mismatch_sum: 0,
        read_indexes: Vec::new(),
    })
}

/// Builds a consensus from a read's gapped CIGAR placed at `index_on_ref`.
///
/// Matched stretches contribute reference bases (the consensus is the
/// reference with the read's single indel applied); candidates with zero
/// or multiple indels, irregular inserted bases, or alignments running off
/// the window are rejected.
#[must_use]
pub fn consensus_from_cigar(
    index_on_ref: i64,
    cigar: &[Op],
    reference: &[u8],
    read_bases: &[u8],
) -> Option<Consensus> {
    if index_on_ref < 0 {
        return None;
    }
    let index_on_ref = index_on_ref as usize;
    if index_on_ref > reference.len() {
        return None;
    }

    let mut sequence = Vec::with_capacity(reference.len() + read_bases.len());
    sequence.extend_from_slice(&reference[..index_on_ref]);

    let mut elements = Vec::with_capacity(cigar.len());
    let mut indel_count = 0usize;
    let mut read_idx = 0usize;
    let mut ref_idx = index_on_ref;

    for op in cigar {
        let len = op.len();
        match op.kind() {
            Kind::Deletion => {
                ref_idx += len;
                indel_count += 1;
                elements.push(*op);
            }
            Kind::Match | Kind::SequenceMatch | Kind::SequenceMismatch | Kind::Skip => {
                if op.kind() != Kind::Skip {
                    read_idx += len;
                }
                if ref_idx + len > reference.len() {
                    return None;
                }
                sequence.extend_from_slice(&reference[ref_idx..ref_idx + len]);
                ref_idx += len;
                elements.push(Op::new(Kind::Match, len));
            }
            Kind::Insertion => {
                let inserted = read_bases.get(read_idx..read_idx + len)?;
                if !inserted.iter().copied().all(is_regular_base) {
                    return None;
                }
                sequence.extend_from_slice(inserted);
                read_idx += len;
                indel_count += 1;
                elements.push(*op);
            }
            Kind::SoftClip => read_idx += len,
            Kind::HardClip | Kind::Pad => {}
        }
    }

    if indel_count != 1 || ref_idx > reference.len() {
        return None;
    }

    sequence.extend_from_slice(&reference[ref_idx..]);

    Some(Consensus {
        sequence,
        cigar: elements,
        position_on_reference: index_on_ref,
        mismatch_sum: 0,
        read_indexes: Vec::new(),
    })
}

// Affine-gap alignment parameters for consensus discovery.
const SW_MATCH: i32 = 30;
const SW_MISMATCH: i32 = -10;
const SW_GAP_OPEN: i32 = -10;
const SW_GAP_EXTEND: i32 = -2;

/// Fitting alignment of a read against the reference window: the read
/// aligns end to end, the window contributes any contiguous stretch.
/// Returns the 0-based window start and the M/I/D CIGAR, or `None` for
/// empty inputs.
#[must_use]
pub fn fit_read_to_window(read: &[u8], window: &[u8]) -> Option<(usize, Vec<Op>)> {
    if read.is_empty() || window.is_empty() {
        return None;
    }

    let rows = read.len() + 1; // read position
    let cols = window.len() + 1; // window position
    let neg_inf = i32::MIN / 2;

    // Gotoh: m = match/mismatch, x = gap in read (D), y = gap in window (I).
    let mut m = vec![neg_inf; rows * cols];
    let mut x = vec![neg_inf; rows * cols];
    let mut y = vec![neg_inf; rows * cols];
    let idx = |i: usize, j: usize| i * cols + j;

    // Free start anywhere on the window; the read must start at its base 0.
    for j in 0..cols {
        m[idx(0, j)] = 0;
    }
    for i in 1..rows {
        y[idx(i, 0)] = SW_GAP_OPEN + (i as i32 - 1) * SW_GAP_EXTEND;
    }

    for i in 1..rows {
        for j in 1..cols {
            let score = if read[i - 1].eq_ignore_ascii_case(&window[j - 1]) {
                SW_MATCH
            } else {
                SW_MISMATCH
            };
            let diag =
                m[idx(i - 1, j - 1)].max(x[idx(i - 1, j - 1)]).max(y[idx(i - 1, j - 1)]);
            m[idx(i, j)] = diag.saturating_add(score);

            // Gap in the read: consume a window base (deletion from read).
            x[idx(i, j)] = (m[idx(i, j - 1)] + SW_GAP_OPEN)
                .max(x[idx(i, j - 1)] + SW_GAP_EXTEND)
                .max(y[idx(i, j - 1)] + SW_GAP_OPEN);
            // Gap in the window: consume a read base (insertion in read).
            y[idx(i, j)] = (m[idx(i - 1, j)] + SW_GAP_OPEN)
                .max(y[idx(i - 1, j)] + SW_GAP_EXTEND)
                .max(x[idx(i - 1, j)] + SW_GAP_OPEN);
        }
    }

    // Free end anywhere on the window: best score in the last read row.
    let last = rows - 1;
    let (mut best_j, mut best_state) = (0usize, 0u8);
    let mut best_score = neg_inf;
    for j in 1..cols {
        for (state, value) in
            [(0u8, m[idx(last, j)]), (1u8, x[idx(last, j)]), (2u8, y[idx(last, j)])]
        {
            if value > best_score {
                best_score = value;
                best_j = j;
                best_state = state;
            }
        }
    }
    if best_score <= 0 {
        return None;
    }

    // Traceback.
    let mut ops_rev: Vec<Kind> = Vec::with_capacity(read.len() + 8);
    let (mut i, mut j, mut state) = (last, best_j, best_state);
    while i > 0 {
        match state {
            0 => {
                // Came from the best of the three at (i-1, j-1).
                let diag_m = m[idx(i - 1, j - 1)];
                let diag_x = x[idx(i - 1, j - 1)];
                let diag_y = y[idx(i - 1, j - 1)];
                ops_rev.push(Kind::Match);
                state = if diag_m >= diag_x && diag_m >= diag_y {
                    0
                } else if diag_x >= diag_y {
                    1
                } else {
                    2
                };
                i -= 1;
                j -= 1;
            }
            1 => {
                ops_rev.push(Kind::Deletion);
                let from_m = m[idx(i, j - 1)] + SW_GAP_OPEN;
                let from_x = x[idx(i, j - 1)] + SW_GAP_EXTEND;
                let from_y = y[idx(i, j - 1)] + SW_GAP_OPEN;
                state = if from_x >= from_m && from_x >= from_y {
                    1
                } else if from_m >= from_y {
                    0
                } else {
                    2
                };
                j -= 1;
            }
            _ => {
                ops_rev.push(Kind::Insertion);
                if j == 0 {
                    i -= 1;
                    continue;
                }
                let from_m = m[idx(i - 1, j)] + SW_GAP_OPEN;
                let from_y = y[idx(i - 1, j)] + SW_GAP_EXTEND;
                let from_x = x[idx(i - 1, j)] + SW_GAP_OPEN;
                state = if from_y >= from_m && from_y >= from_x {
                    2
                } else if from_m >= from_x {
                    0
                } else {
                    1
                };
                i -= 1;
            }
        }
    }

    let start = j;
    let mut cigar: Vec<Op> = Vec::new();
    for kind in ops_rev.into_iter().rev() {
        match cigar.last_mut() {
            Some(op) if op.kind() == kind => *op = Op::new(kind, op.len() + 1),
            _ => cigar.push(Op::new(kind, 1)),
        }
    }

    Some((start, cigar))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locus::GenomeLoc;
    use crate::sam::builder::parse_cigar;

    fn known_deletion(length: usize) -> KnownIndel {
        KnownIndel {
            loc: GenomeLoc::new(0, 100, 100),
            is_insertion: false,
            length,
            bases: Vec::new(),
        }
    }

    fn known_insertion(bases: &[u8]) -> KnownIndel {
        KnownIndel {
            loc: GenomeLoc::new(0, 100, 100),
            is_insertion: true,
            length: bases.len(),
            bases: bases.to_vec(),
        }
    }

    #[test]
    fn test_consensus_from_known_deletion() {
        //           0123456789
        let reference = b"ACGTACGTAC";
        let consensus = consensus_from_known_indel(4, reference, &known_deletion(2)).unwrap();

        assert_eq!(consensus.sequence, b"ACGTGTAC");
        assert_eq!(consensus.cigar, parse_cigar("4M2D4M"));
        assert_eq!(consensus.position_on_reference, 0);
    }

    #[test]
    fn test_consensus_from_known_insertion() {
        let reference = b"ACGTACGTAC";
        let consensus =
            consensus_from_known_indel(4, reference, &known_insertion(b"TT")).unwrap();

        assert_eq!(consensus.sequence, b"ACGTTTACGTAC");
        assert_eq!(consensus.cigar, parse_cigar("4M2I6M"));
    }

    #[test]
    fn test_consensus_from_known_out_of_window() {
        let reference = b"ACGT";
        assert!(consensus_from_known_indel(-1, reference, &known_deletion(1)).is_none());
        assert!(consensus_from_known_indel(4, reference, &known_deletion(1)).is_none());
        assert!(consensus_from_known_indel(2, reference, &known_deletion(5)).is_none());
    }

    #[test]
    fn test_consensus_from_cigar_single_deletion() {
        let reference = b"AAAACCCCGGGG";
        // Read aligned at offset 2 with a 2-base deletion after 3 matches.
        let cigar = parse_cigar("3M2D4M");
        let consensus = consensus_from_cigar(2, &cigar, reference, b"AACCCCG").unwrap();

        // Prefix (2) + 3 ref bases + skip 2 + 4 ref bases + suffix (1).
        assert_eq!(consensus.sequence, b"AAAACCGGGG");
        assert_eq!(consensus.position_on_reference, 2);
        assert_eq!(consensus.cigar, parse_cigar("3M2D4M"));
    }

    #[test]
    fn test_consensus_from_cigar_insertion_uses_read_bases() {
        let reference = b"AAAACCCC";
        let cigar = parse_cigar("2M2I2M");
        let consensus = consensus_from_cigar(2, &cigar, reference, b"AATTCC").unwrap();

        assert_eq!(consensus.sequence, b"AAAATTCCCC");
        assert_eq!(consensus.cigar, parse_cigar("2M2I2M"));
    }

    #[test]
    fn test_consensus_from_cigar_rejects_multiple_indels() {
        let reference = b"AAAACCCCGGGG";
        let cigar = parse_cigar("2M1D2M1I2M");
        assert!(consensus_from_cigar(0, &cigar, reference, b"AACCTCC").is_none());
    }

    #[test]
    fn test_consensus_from_cigar_rejects_no_indel() {
        let reference = b"AAAACCCC";
        let cigar = parse_cigar("6M");
        assert!(consensus_from_cigar(0, &cigar, reference, b"AAAACC").is_none());
    }

    #[test]
    fn test_sw_exact_match() {
        let window = b"AAAACGTACGTCCCC";
        let (start, cigar) = fit_read_to_window(b"CGTACGT", window).unwrap();
        assert_eq!(start, 4);
        assert_eq!(cigar, parse_cigar("7M"));
    }

    #[test]
    fn test_sw_finds_deletion() {
        // Window has "ACGTTTTTACGT"; the read is missing the TTTT run's
        // middle two bases.
        let window = b"GGGGACGTTTTTACGTGGGG";
        let read = b"ACGTTTACGT";
        let (start, cigar) = fit_read_to_window(read, window).unwrap();
        assert_eq!(start, 4);

        let deletions: usize = cigar
            .iter()
            .filter(|op| op.kind() == Kind::Deletion)
            .map(|op| op.len())
            .sum();
        assert_eq!(deletions, 2);

        let matches: usize =
            cigar.iter().filter(|op| op.kind() == Kind::Match).map(|op| op.len()).sum();
        assert_eq!(matches, read.len());
    }

    #[test]
    fn test_sw_finds_insertion() {
        let window = b"GGGGACGTACGTGGGG";
        let read = b"ACGTCCACGT";
        let (start, cigar) = fit_read_to_window(read, window).unwrap();
        assert_eq!(start, 4);

        let insertions: usize = cigar
            .iter()
            .filter(|op| op.kind() == Kind::Insertion)
            .map(|op| op.len())
            .sum();
        assert_eq!(insertions, 2);
    }

    #[test]
    fn test_sw_empty_inputs() {
        assert!(fit_read_to_window(b"", b"ACGT").is_none());
        assert!(fit_read_to_window(b"ACGT", b"").is_none());
    }
}
