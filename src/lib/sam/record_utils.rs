//! Coordinate and CIGAR arithmetic over alignment records.
//!
//! These helpers implement the positional laws the pipeline depends on:
//! alignment end positions, 5' positions for insert-size computation, and
//! the in-place mate-information repair used by the mate-fixing manager.

use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::alignment::record_buf::RecordBuf;

/// The MQ (mate mapping quality) tag.
pub const MQ_TAG: Tag = Tag::new(b'M', b'Q');

/// Number of reference bases consumed by a CIGAR (M, D, N, =, X).
#[must_use]
pub fn reference_length(record: &RecordBuf) -> usize {
    record
        .cigar()
        .as_ref()
        .iter()
        .filter_map(|op| match op.kind() {
            Kind::Match
            | Kind::Deletion
            | Kind::Skip
            | Kind::SequenceMatch
            | Kind::SequenceMismatch => Some(op.len()),
            _ => None,
        })
        .sum()
}

/// Number of query bases consumed by a CIGAR (M, I, S, =, X).
#[must_use]
pub fn query_length(record: &RecordBuf) -> usize {
    record
        .cigar()
        .as_ref()
        .iter()
        .filter_map(|op| match op.kind() {
            Kind::Match
            | Kind::Insertion
            | Kind::SoftClip
            | Kind::SequenceMatch
            | Kind::SequenceMismatch => Some(op.len()),
            _ => None,
        })
        .sum()
}

/// 1-based inclusive alignment end, or `None` for records with no position.
#[must_use]
pub fn alignment_end(record: &RecordBuf) -> Option<usize> {
    let start = record.alignment_start().map(usize::from)?;
    let span = reference_length(record);
    Some(start + span.saturating_sub(1))
}

/// 1-based 5' position of a record: the alignment end for reverse-strand
/// reads, the alignment start otherwise.
#[must_use]
pub fn five_prime_position(record: &RecordBuf) -> usize {
    let start = record.alignment_start().map_or(0, usize::from);
    if record.flags().is_reverse_complemented() {
        alignment_end(record).unwrap_or(start)
    } else {
        start
    }
}

/// Signed template length between the two ends of a pair.
///
/// Zero when either end is unmapped or the ends sit on different contigs.
/// The raw value is the 5'-to-5' distance with a +1/−1 adjustment for
/// inclusive coordinates; [`set_mate_info`] normalizes it by one before
/// storing.
#[must_use]
pub fn compute_insert_size(first: &RecordBuf, second: &RecordBuf) -> i32 {
    if first.flags().is_unmapped() || second.flags().is_unmapped() {
        return 0;
    }
    if first.reference_sequence_id() != second.reference_sequence_id() {
        return 0;
    }

    let e1 = five_prime_position(first) as i64;
    let e2 = five_prime_position(second) as i64;
    let adjustment: i64 = if e2 >= e1 { 1 } else { -1 };

    (e2 - e1 + adjustment) as i32
}

/// Repairs the mate information on both ends of a pair in place.
///
/// With both ends mapped, each record receives its partner's reference id,
/// position, strand, and mapping quality (`MQ` tag), and the pair's insert
/// size is recomputed from 5' positions (`rec1` positive, `rec2` negated).
/// With both ends unmapped, coordinates are cleared on both. With exactly
/// one end unmapped, the mapped end's position is copied to the unmapped
/// one so the pair stays adjacent in coordinate order.
pub fn set_mate_info(rec1: &mut RecordBuf, rec2: &mut RecordBuf) {
    let mapped1 = !rec1.flags().is_unmapped();
    let mapped2 = !rec2.flags().is_unmapped();

    if mapped1 && mapped2 {
        copy_mate_fields(rec1, rec2);
        copy_mate_fields(rec2, rec1);
    } else if !mapped1 && !mapped2 {
        clear_alignment(rec1);
        clear_alignment(rec2);
        rec1.flags_mut().insert(Flags::MATE_UNMAPPED);
        rec2.flags_mut().insert(Flags::MATE_UNMAPPED);
        rec1.data_mut().remove(&MQ_TAG);
        rec2.data_mut().remove(&MQ_TAG);
    } else {
        let (mapped, unmapped) =
            if mapped1 { (&mut *rec1, &mut *rec2) } else { (&mut *rec2, &mut *rec1) };

        // Pull the unmapped end next to its mapped partner.
        *unmapped.reference_sequence_id_mut() = mapped.reference_sequence_id();
        *unmapped.alignment_start_mut() = mapped.alignment_start();

        *mapped.mate_reference_sequence_id_mut() = unmapped.reference_sequence_id();
        *mapped.mate_alignment_start_mut() = unmapped.alignment_start();
        set_flag(mapped, Flags::MATE_REVERSE_COMPLEMENTED, unmapped.flags().is_reverse_complemented());
        mapped.flags_mut().insert(Flags::MATE_UNMAPPED);

        *unmapped.mate_reference_sequence_id_mut() = mapped.reference_sequence_id();
        *unmapped.mate_alignment_start_mut() = mapped.alignment_start();
        set_flag(unmapped, Flags::MATE_REVERSE_COMPLEMENTED, mapped.flags().is_reverse_complemented());
        unmapped.flags_mut().remove(Flags::MATE_UNMAPPED);
    }

    let mut insert_size = compute_insert_size(rec1, rec2);
    // Normalize the inclusive-coordinate adjustment back out.
    if insert_size > 0 {
        insert_size -= 1;
    }
    if insert_size < 0 {
        insert_size += 1;
    }
    *rec1.template_length_mut() = insert_size;
    *rec2.template_length_mut() = -insert_size;
}

/// Copies `src`'s placement onto `dst`'s mate fields and records `src`'s
/// mapping quality in `dst`'s MQ tag.
fn copy_mate_fields(dst: &mut RecordBuf, src: &RecordBuf) {
    *dst.mate_reference_sequence_id_mut() = src.reference_sequence_id();
    *dst.mate_alignment_start_mut() = src.alignment_start();
    set_flag(dst, Flags::MATE_REVERSE_COMPLEMENTED, src.flags().is_reverse_complemented());
    dst.flags_mut().remove(Flags::MATE_UNMAPPED);

    let mapq = src.mapping_quality().map_or(255, u8::from);
    dst.data_mut().insert(MQ_TAG, Value::UInt8(mapq));
}

fn clear_alignment(record: &mut RecordBuf) {
    *record.reference_sequence_id_mut() = None;
    *record.alignment_start_mut() = None;
    *record.mate_reference_sequence_id_mut() = None;
    *record.mate_alignment_start_mut() = None;
}

fn set_flag(record: &mut RecordBuf, flag: Flags, value: bool) {
    if value {
        record.flags_mut().insert(flag);
    } else {
        record.flags_mut().remove(flag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sam::builder::RecordBuilder;

    #[test]
    fn test_reference_length_counts_consuming_ops() {
        // 10M2D5M1I3M: reference span = 10 + 2 + 5 + 3 = 20
        let record = RecordBuilder::mapped()
            .alignment_start(100)
            .cigar("10M2D5M1I3M")
            .sequence(&"A".repeat(19))
            .build();
        assert_eq!(reference_length(&record), 20);
        assert_eq!(query_length(&record), 19);
        assert_eq!(alignment_end(&record), Some(119));
    }

    #[test]
    fn test_five_prime_position_by_strand() {
        let fwd = RecordBuilder::mapped().alignment_start(100).cigar("50M").build();
        assert_eq!(five_prime_position(&fwd), 100);

        let rev = RecordBuilder::mapped().alignment_start(100).cigar("50M").reverse().build();
        assert_eq!(five_prime_position(&rev), 149);
    }

    #[test]
    fn test_insert_size_sign_law() {
        let mut r1 = RecordBuilder::mapped().name("p").alignment_start(100).cigar("50M").paired().build();
        let mut r2 = RecordBuilder::mapped()
            .name("p")
            .alignment_start(200)
            .cigar("50M")
            .reverse()
            .paired()
            .build();

        set_mate_info(&mut r1, &mut r2);

        assert_eq!(r1.template_length(), -r2.template_length());
        // 5' of r1 = 100, 5' of r2 = 249, raw = 150, stored = 149.
        assert_eq!(r1.template_length(), 149);
    }

    #[test]
    fn test_set_mate_info_both_mapped() {
        let mut r1 = RecordBuilder::mapped()
            .name("p")
            .reference_sequence_id(0)
            .alignment_start(100)
            .cigar("50M")
            .mapping_quality(40)
            .paired()
            .build();
        let mut r2 = RecordBuilder::mapped()
            .name("p")
            .reference_sequence_id(0)
            .alignment_start(300)
            .cigar("50M")
            .mapping_quality(20)
            .reverse()
            .paired()
            .build();

        set_mate_info(&mut r1, &mut r2);

        assert_eq!(r1.mate_alignment_start().map(usize::from), Some(300));
        assert_eq!(r2.mate_alignment_start().map(usize::from), Some(100));
        assert!(r1.flags().is_mate_reverse_complemented());
        assert!(!r2.flags().is_mate_reverse_complemented());
        assert_eq!(r1.data().get(&MQ_TAG), Some(&Value::UInt8(20)));
        assert_eq!(r2.data().get(&MQ_TAG), Some(&Value::UInt8(40)));
    }

    #[test]
    fn test_set_mate_info_one_unmapped() {
        let mut mapped = RecordBuilder::mapped()
            .name("p")
            .reference_sequence_id(0)
            .alignment_start(1000)
            .cigar("50M")
            .paired()
            .build();
        let mut unmapped = RecordBuilder::unmapped().name("p").paired().build();

        set_mate_info(&mut mapped, &mut unmapped);

        // The unmapped end is placed at its partner's position.
        assert_eq!(unmapped.alignment_start().map(usize::from), Some(1000));
        assert_eq!(unmapped.reference_sequence_id(), Some(0));
        assert!(mapped.flags().is_mate_unmapped());
        assert!(!unmapped.flags().is_mate_unmapped());
        assert_eq!(mapped.template_length(), 0);
        assert_eq!(unmapped.template_length(), 0);
    }

    #[test]
    fn test_set_mate_info_both_unmapped_clears_coordinates() {
        let mut r1 = RecordBuilder::unmapped().name("p").paired().build();
        let mut r2 = RecordBuilder::unmapped().name("p").paired().build();

        set_mate_info(&mut r1, &mut r2);

        assert!(r1.alignment_start().is_none());
        assert!(r2.reference_sequence_id().is_none());
        assert!(r1.flags().is_mate_unmapped());
        assert!(r2.flags().is_mate_unmapped());
    }
}
