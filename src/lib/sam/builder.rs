//! Builder for creating test alignment records.
//!
//! A fluent API for constructing `RecordBuf`s in tests without spelling out
//! every field. Defaults: 30-base `A` sequence, uniform quality 30, MAPQ 60
//! for mapped records, CIGAR derived from the sequence length when not given.
//!
//! ```
//! use readforge_lib::sam::builder::RecordBuilder;
//!
//! let record = RecordBuilder::mapped()
//!     .name("read1")
//!     .alignment_start(100)
//!     .cigar("10M1D20M")
//!     .build();
//! assert_eq!(record.alignment_start().map(usize::from), Some(100));
//! ```

use bstr::BString;
use noodles::core::Position;
use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record::cigar::Op;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::alignment::record_buf::{QualityScores, RecordBuf, Sequence};
use noodles::sam::header::record::value::map::ReferenceSequence;
use noodles::sam::header::record::value::Map;
use noodles::sam::Header;
use std::num::NonZeroUsize;

/// Default read length when no sequence is given.
pub const DEFAULT_READ_LENGTH: usize = 30;

/// Default base quality.
pub const DEFAULT_BASE_QUALITY: u8 = 30;

/// Default mapping quality for mapped records.
pub const DEFAULT_MAPQ: u8 = 60;

/// Parses a CIGAR string into ops. Panics on malformed input (test helper).
#[must_use]
pub fn parse_cigar(cigar_str: &str) -> Vec<Op> {
    let mut ops = Vec::new();
    let mut num_str = String::new();

    for c in cigar_str.chars() {
        if c.is_ascii_digit() {
            num_str.push(c);
        } else {
            let len: usize = num_str.parse().expect("Invalid CIGAR: expected number");
            let kind = match c {
                'M' => Kind::Match,
                'I' => Kind::Insertion,
                'D' => Kind::Deletion,
                'N' => Kind::Skip,
                'S' => Kind::SoftClip,
                'H' => Kind::HardClip,
                'P' => Kind::Pad,
                '=' => Kind::SequenceMatch,
                'X' => Kind::SequenceMismatch,
                _ => panic!("Unknown CIGAR operation: {c}"),
            };
            ops.push(Op::new(kind, len));
            num_str.clear();
        }
    }

    ops
}

/// Builds a header with the given (name, length) reference dictionary.
#[must_use]
pub fn test_header(references: &[(&str, usize)]) -> Header {
    let mut builder = Header::builder();
    for (name, len) in references {
        let length = NonZeroUsize::new(*len).expect("reference length must be nonzero");
        builder = builder
            .add_reference_sequence(name.as_bytes(), Map::<ReferenceSequence>::new(length));
    }
    builder.build()
}

/// Fluent builder for a single test record.
#[derive(Debug, Default)]
pub struct RecordBuilder {
    name: Option<String>,
    sequence: Option<String>,
    qualities: Option<Vec<u8>>,
    flags: Flags,
    reference_sequence_id: Option<usize>,
    alignment_start: Option<usize>,
    mapping_quality: Option<u8>,
    cigar: Option<String>,
    mate_reference_sequence_id: Option<usize>,
    mate_alignment_start: Option<usize>,
    template_length: i32,
    tags: Vec<(Tag, Value)>,
}

impl RecordBuilder {
    /// A builder for a mapped record on reference 0 at position 1.
    #[must_use]
    pub fn mapped() -> Self {
        Self {
            reference_sequence_id: Some(0),
            alignment_start: Some(1),
            mapping_quality: Some(DEFAULT_MAPQ),
            ..Self::default()
        }
    }

    /// A builder for an unmapped record.
    #[must_use]
    pub fn unmapped() -> Self {
        Self { flags: Flags::UNMAPPED, ..Self::default() }
    }

    /// Sets the read name.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Sets the read bases.
    #[must_use]
    pub fn sequence(mut self, bases: &str) -> Self {
        self.sequence = Some(bases.to_string());
        self
    }

    /// Sets per-base qualities (must match sequence length).
    #[must_use]
    pub fn qualities(mut self, quals: Vec<u8>) -> Self {
        self.qualities = Some(quals);
        self
    }

    /// Replaces the flag set wholesale.
    #[must_use]
    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Marks the record paired.
    #[must_use]
    pub fn paired(mut self) -> Self {
        self.flags.insert(Flags::SEGMENTED);
        self
    }

    /// Marks the record reverse-strand.
    #[must_use]
    pub fn reverse(mut self) -> Self {
        self.flags.insert(Flags::REVERSE_COMPLEMENTED);
        self
    }

    /// Marks the record first-of-pair (implies paired).
    #[must_use]
    pub fn first_of_pair(mut self) -> Self {
        self.flags.insert(Flags::SEGMENTED | Flags::FIRST_SEGMENT);
        self
    }

    /// Marks the record second-of-pair (implies paired).
    #[must_use]
    pub fn second_of_pair(mut self) -> Self {
        self.flags.insert(Flags::SEGMENTED | Flags::LAST_SEGMENT);
        self
    }

    /// Marks the mate unmapped.
    #[must_use]
    pub fn mate_unmapped(mut self) -> Self {
        self.flags.insert(Flags::MATE_UNMAPPED);
        self
    }

    /// Marks the record secondary.
    #[must_use]
    pub fn secondary(mut self) -> Self {
        self.flags.insert(Flags::SECONDARY);
        self
    }

    /// Sets the reference sequence index.
    #[must_use]
    pub fn reference_sequence_id(mut self, id: usize) -> Self {
        self.reference_sequence_id = Some(id);
        self
    }

    /// Sets the 1-based alignment start.
    #[must_use]
    pub fn alignment_start(mut self, start: usize) -> Self {
        self.alignment_start = Some(start);
        self
    }

    /// Sets the mapping quality.
    #[must_use]
    pub fn mapping_quality(mut self, mapq: u8) -> Self {
        self.mapping_quality = Some(mapq);
        self
    }

    /// Sets the CIGAR from its string form.
    #[must_use]
    pub fn cigar(mut self, cigar: &str) -> Self {
        self.cigar = Some(cigar.to_string());
        self
    }

    /// Sets the mate's reference sequence index.
    #[must_use]
    pub fn mate_reference_sequence_id(mut self, id: usize) -> Self {
        self.mate_reference_sequence_id = Some(id);
        self
    }

    /// Sets the mate's 1-based alignment start.
    #[must_use]
    pub fn mate_alignment_start(mut self, start: usize) -> Self {
        self.mate_alignment_start = Some(start);
        self
    }

    /// Sets the signed template length.
    #[must_use]
    pub fn template_length(mut self, tlen: i32) -> Self {
        self.template_length = tlen;
        self
    }

    /// Attaches an auxiliary tag.
    #[must_use]
    pub fn tag(mut self, tag: Tag, value: Value) -> Self {
        self.tags.push((tag, value));
        self
    }

    /// Builds the record.
    ///
    /// # Panics
    ///
    /// Panics on malformed CIGAR strings or zero positions (test helper).
    #[must_use]
    pub fn build(self) -> RecordBuf {
        let mut record = RecordBuf::default();

        let name = self.name.unwrap_or_else(|| "read".to_string());
        *record.name_mut() = Some(BString::from(name.as_bytes()));

        let sequence = self.sequence.unwrap_or_else(|| "A".repeat(DEFAULT_READ_LENGTH));
        let quals = self.qualities.unwrap_or_else(|| vec![DEFAULT_BASE_QUALITY; sequence.len()]);
        assert_eq!(quals.len(), sequence.len(), "qualities must match sequence length");

        *record.flags_mut() = self.flags;
        *record.reference_sequence_id_mut() = self.reference_sequence_id;
        if let Some(start) = self.alignment_start {
            *record.alignment_start_mut() =
                Some(Position::try_from(start).expect("alignment start must be >= 1"));
        }
        if let Some(mapq) = self.mapping_quality {
            *record.mapping_quality_mut() = mapq.try_into().ok();
        }

        if !self.flags.is_unmapped() {
            let cigar = self.cigar.unwrap_or_else(|| format!("{}M", sequence.len()));
            *record.cigar_mut() = parse_cigar(&cigar).into_iter().collect();
        }

        *record.mate_reference_sequence_id_mut() = self.mate_reference_sequence_id;
        if let Some(start) = self.mate_alignment_start {
            *record.mate_alignment_start_mut() =
                Some(Position::try_from(start).expect("mate alignment start must be >= 1"));
        }
        *record.template_length_mut() = self.template_length;

        *record.sequence_mut() = Sequence::from(sequence.into_bytes());
        *record.quality_scores_mut() = QualityScores::from(quals);

        for (tag, value) in self.tags {
            record.data_mut().insert(tag, value);
        }

        record
    }
}
