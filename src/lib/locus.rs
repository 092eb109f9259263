//! Genome locus arithmetic.
//!
//! A [`GenomeLoc`] names a contiguous stretch of one reference sequence by
//! contig index and a 1-based inclusive interval. Ordering is lexicographic
//! by (contig, start, stop), which matches coordinate sort order for loci on
//! the same reference dictionary.

use std::cmp::Ordering;
use std::fmt;

use noodles::sam::Header;
use noodles::sam::alignment::record_buf::RecordBuf;

use crate::sam::record_utils::alignment_end;

/// A contig index plus a 1-based inclusive interval on that contig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenomeLoc {
    /// Index into the header's reference dictionary.
    pub contig: usize,
    /// 1-based inclusive start.
    pub start: u32,
    /// 1-based inclusive stop.
    pub stop: u32,
}

impl GenomeLoc {
    /// Creates a locus from its parts.
    #[must_use]
    pub fn new(contig: usize, start: u32, stop: u32) -> Self {
        Self { contig, start, stop }
    }

    /// Locus spanning one alignment record (start through alignment end).
    ///
    /// Returns `None` for unmapped records with no position.
    #[must_use]
    pub fn of_record(record: &RecordBuf) -> Option<Self> {
        let contig = record.reference_sequence_id()?;
        let start = record.alignment_start().map(usize::from)?;
        let stop = alignment_end(record).unwrap_or(start);
        Some(Self { contig, start: start as u32, stop: stop as u32 })
    }

    /// Zero iff both loci are on the same contig; otherwise the contig delta.
    #[must_use]
    pub fn compare_contigs(&self, other: &GenomeLoc) -> Ordering {
        self.contig.cmp(&other.contig)
    }

    /// Positional distance to `other`.
    ///
    /// Defined only on the same contig; loci on different contigs are
    /// infinitely far apart.
    #[must_use]
    pub fn distance(&self, other: &GenomeLoc) -> u32 {
        if self.contig == other.contig {
            self.start.abs_diff(other.start)
        } else {
            u32::MAX
        }
    }

    /// True when the two loci share at least one base.
    #[must_use]
    pub fn overlaps(&self, other: &GenomeLoc) -> bool {
        self.contig == other.contig && self.start <= other.stop && other.start <= self.stop
    }

    /// True when `self` starts strictly after `other` ends (same contig), or
    /// lies on a later contig.
    #[must_use]
    pub fn is_past(&self, other: &GenomeLoc) -> bool {
        self.contig > other.contig || (self.contig == other.contig && self.start > other.stop)
    }

    /// Interval length in bases.
    #[allow(clippy::len_without_is_empty)]
    #[must_use]
    pub fn len(&self) -> u32 {
        self.stop - self.start + 1
    }

    /// Renders with the contig's name from the header, falling back to the
    /// bare index when the dictionary is shorter than expected.
    #[must_use]
    pub fn display(&self, header: &Header) -> String {
        match header.reference_sequences().get_index(self.contig) {
            Some((name, _)) => format!("{}:{}-{}", name, self.start, self.stop),
            None => format!("#{}:{}-{}", self.contig, self.start, self.stop),
        }
    }
}

impl fmt::Display for GenomeLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}-{}", self.contig, self.start, self.stop)
    }
}

impl Ord for GenomeLoc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.contig
            .cmp(&other.contig)
            .then_with(|| self.start.cmp(&other.start))
            .then_with(|| self.stop.cmp(&other.stop))
    }
}

impl PartialOrd for GenomeLoc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
