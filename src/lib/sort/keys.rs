//! Sort key types for alignment ordering.
//!
//! Keys are extracted once per record and compared many times, so they hold
//! only the fields their ordering needs.
//!
//! # Orderings
//!
//! - [`CoordinateKey`]: reference id (unmapped last) → position → reverse
//!   strand. The stream-level default after sorting.
//! - [`QuerynameKey`]: lexicographic read name → flag ordering →
//!   first-of-pair bit.
//!
//! Equal-key records must retain source order, so every consumer of these
//! keys uses a stable sort.

use std::cmp::Ordering;

use noodles::sam::alignment::record_buf::RecordBuf;

/// Sort order for the alignment stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// (reference id, position), unmapped records last.
    Coordinate,
    /// Lexicographic read name.
    Queryname,
}

impl SortOrder {
    /// The @HD SO tag value declaring this order.
    #[must_use]
    pub fn header_so_tag(&self) -> &'static str {
        match self {
            Self::Coordinate => "coordinate",
            Self::Queryname => "queryname",
        }
    }
}

/// Key extraction from a record.
pub trait SortKey: Ord + Clone + Send + 'static {
    /// Builds the key for one record.
    fn from_record(record: &RecordBuf) -> Self;
}

/// Transforms flags so that tied names order R1, R2, primary,
/// supplementary, secondary, the conventional queryname tie-break.
#[inline]
#[must_use]
pub const fn queryname_flag_order(flags: u16) -> u16 {
    ((flags & 0xc0) << 8) | ((flags & 0x100) << 3) | ((flags & 0x800) >> 3)
}

/// Sort key for coordinate ordering.
///
/// Records without a reference id sort after every placed record,
/// regardless of their unmapped flag: placement follows the reference
/// field, and placed-but-unmapped mates stay next to their pair.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CoordinateKey {
    /// Reference id, or `i32::MAX` for records with none.
    pub tid: i32,
    /// 1-based position (0 when absent).
    pub pos: i64,
    /// Reverse-strand tie-break.
    pub reverse: bool,
}

impl CoordinateKey {
    /// Key that sorts after every placed record.
    #[must_use]
    pub fn unplaced() -> Self {
        Self { tid: i32::MAX, pos: i64::MAX, reverse: false }
    }
}

impl Ord for CoordinateKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tid
            .cmp(&other.tid)
            .then_with(|| self.pos.cmp(&other.pos))
            .then_with(|| self.reverse.cmp(&other.reverse))
    }
}

impl PartialOrd for CoordinateKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl SortKey for CoordinateKey {
    fn from_record(record: &RecordBuf) -> Self {
        match record.reference_sequence_id() {
            None => Self::unplaced(),
            Some(tid) => Self {
                tid: tid as i32,
                pos: record.alignment_start().map_or(0, |p| usize::from(p) as i64),
                reverse: record.flags().is_reverse_complemented(),
            },
        }
    }
}

/// Sort key for queryname ordering.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct QuerynameKey {
    /// Read name bytes.
    pub name: Vec<u8>,
    /// Transformed flags (see [`queryname_flag_order`]).
    pub flag_order: u16,
    /// True for reads that are not first-of-pair, so R1 sorts first.
    pub second_in_pair: bool,
}

impl Ord for QuerynameKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.flag_order.cmp(&other.flag_order))
            .then_with(|| self.second_in_pair.cmp(&other.second_in_pair))
    }
}

impl PartialOrd for QuerynameKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl SortKey for QuerynameKey {
    fn from_record(record: &RecordBuf) -> Self {
        let name = record.name().map_or_else(Vec::new, |n| n.to_vec());
        let flags = u16::from(record.flags());
        Self {
            name,
            flag_order: queryname_flag_order(flags),
            second_in_pair: !record.flags().is_first_segment(),
        }
    }
}
