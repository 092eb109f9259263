//! End-to-end pipeline tests: real files in, real files out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record_buf::RecordBuf;
use noodles::sam::header::record::value::map::header::tag as header_tag;
use noodles::sam::Header;

use readforge_lib::bam_io::{create_record_writer, open_alignment_input, OutputFormat};
use readforge_lib::locus::GenomeLoc;
use readforge_lib::pipeline::{alignment_queue, finish_all, spawn_stage, StageIo, StreamContext};
use readforge_lib::reader::FileReader;
use readforge_lib::realign::{LocalRealigner, RealignOptions};
use readforge_lib::reference::ReferenceReader;
use readforge_lib::sam::builder::{test_header, RecordBuilder};
use readforge_lib::sort::{ExternalSorter, SortOptions, SortOrder, SortPools};
use readforge_lib::thread_pool::ThreadPool;

fn write_bam(path: &Path, header: &Header, records: &[RecordBuf]) {
    let mut writer = create_record_writer(path, OutputFormat::Bam, header, true).unwrap();
    for record in records {
        writer.write_record(header, record).unwrap();
    }
    writer.finish().unwrap();
}

fn read_bam(path: &Path) -> (Header, Vec<RecordBuf>) {
    let (mut reader, header, _) = open_alignment_input(path).unwrap();
    let mut records = Vec::new();
    let mut record = RecordBuf::default();
    while reader.read_record(&header, &mut record).unwrap() != 0 {
        records.push(record.clone());
    }
    (header, records)
}

/// Runs the full sort pipeline over BAM files on disk.
fn sort_files(inputs: &[PathBuf], output: &Path, options: SortOptions, threads: usize) {
    let reader = FileReader::open(inputs, false).unwrap();
    let input_header = reader.header().clone();
    let output_header =
        readforge_lib::header::with_sort_order(&input_header, options.order);

    let pools = (threads > 1).then(|| SortPools {
        general: Arc::new(ThreadPool::with_workers(threads)),
        shards: Arc::new(ThreadPool::with_workers(threads)),
    });
    let sorter = ExternalSorter::new(options, pools);

    let context = StreamContext::new(input_header);
    let (read_tx, read_rx) = alignment_queue(1024);
    let (out_tx, out_rx) = alignment_queue(1024);

    let reader_handle = spawn_stage(reader, StageIo::new(None, vec![read_tx], context.clone()));
    let sorter_handle = spawn_stage(sorter, StageIo::new(Some(read_rx), vec![out_tx], context));

    let mut writer =
        create_record_writer(output, OutputFormat::Bam, &output_header, true).unwrap();
    while let Some(record) = out_rx.recv() {
        writer.write_record(&output_header, &record).unwrap();
    }
    writer.finish().unwrap();

    assert_eq!(finish_all(vec![reader_handle, sorter_handle]), 0);
}

fn starts(records: &[RecordBuf]) -> Vec<usize> {
    records.iter().map(|r| r.alignment_start().map_or(0, usize::from)).collect()
}

#[test]
fn test_empty_input_produces_header_only_output() {
    let dir = tempfile::tempdir().unwrap();
    let header = test_header(&[("chr1", 100_000)]);
    let input = dir.path().join("empty.bam");
    let output = dir.path().join("sorted.bam");
    write_bam(&input, &header, &[]);

    sort_files(&[input], &output, SortOptions::default(), 1);

    let (out_header, records) = read_bam(&output);
    assert!(records.is_empty());
    assert_eq!(out_header.reference_sequences().len(), 1);
}

#[test]
fn test_coordinate_sort_two_reads() {
    let dir = tempfile::tempdir().unwrap();
    let header = test_header(&[("chr1", 100_000)]);
    let input = dir.path().join("in.bam");
    let output = dir.path().join("out.bam");
    write_bam(
        &input,
        &header,
        &[
            RecordBuilder::mapped().name("a").alignment_start(100).build(),
            RecordBuilder::mapped().name("b").alignment_start(50).build(),
        ],
    );

    sort_files(&[input], &output, SortOptions::default(), 1);

    let (out_header, records) = read_bam(&output);
    assert_eq!(starts(&records), vec![50, 100]);

    // The output header declares its order.
    let so = out_header
        .header()
        .and_then(|hd| hd.other_fields().get(&header_tag::SORT_ORDER))
        .expect("SO tag present");
    assert_eq!(so.as_slice(), b"coordinate");
}

#[test]
fn test_sort_spills_and_preserves_count() {
    let dir = tempfile::tempdir().unwrap();
    let header = test_header(&[("chr1", 1_000_000)]);
    let input = dir.path().join("in.bam");
    let output = dir.path().join("out.bam");

    let mut records = Vec::new();
    for i in 0..1_200u32 {
        let pos = 1 + ((i as usize * 7_919) % 900_000);
        records.push(
            RecordBuilder::mapped().name(&format!("r{i}")).alignment_start(pos).build(),
        );
    }
    write_bam(&input, &header, &records);

    // 1200 records with 500 per chunk spills exactly 3 temp files
    // (500 + 500 + 200); all 1200 come back ordered.
    let options = SortOptions { records_per_tempfile: 500, ..SortOptions::default() };
    sort_files(&[input], &output, options, 2);

    let (_, sorted) = read_bam(&output);
    assert_eq!(sorted.len(), 1_200);
    let positions = starts(&sorted);
    assert!(positions.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_sort_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let header = test_header(&[("chr1", 100_000)]);
    let input = dir.path().join("in.bam");
    let once = dir.path().join("once.bam");
    let twice = dir.path().join("twice.bam");

    let mut records = Vec::new();
    for i in 0..50u32 {
        let pos = 1 + ((i as usize * 37) % 1000);
        records.push(
            RecordBuilder::mapped().name(&format!("r{i}")).alignment_start(pos).build(),
        );
    }
    write_bam(&input, &header, &records);

    let options = || SortOptions { records_per_tempfile: 20, ..SortOptions::default() };
    sort_files(&[input], &once, options(), 1);
    sort_files(&[once.clone()], &twice, options(), 1);

    let (_, first) = read_bam(&once);
    let (_, second) = read_bam(&twice);
    assert_eq!(starts(&first), starts(&second));
    let names = |records: &[RecordBuf]| -> Vec<Vec<u8>> {
        records.iter().map(|r| r.name().unwrap().to_vec()).collect()
    };
    assert_eq!(names(&first), names(&second));
}

#[test]
fn test_queryname_sort_orders_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let header = test_header(&[("chr1", 100_000)]);
    let input = dir.path().join("in.bam");
    let output = dir.path().join("out.bam");
    write_bam(
        &input,
        &header,
        &[
            RecordBuilder::mapped().name("delta").alignment_start(10).build(),
            RecordBuilder::mapped().name("alpha").alignment_start(20).build(),
            RecordBuilder::mapped().name("charlie").alignment_start(30).build(),
        ],
    );

    let options = SortOptions { order: SortOrder::Queryname, ..SortOptions::default() };
    sort_files(&[input], &output, options, 1);

    let (out_header, records) = read_bam(&output);
    let names: Vec<Vec<u8>> = records.iter().map(|r| r.name().unwrap().to_vec()).collect();
    assert_eq!(names, vec![b"alpha".to_vec(), b"charlie".to_vec(), b"delta".to_vec()]);

    let so = out_header
        .header()
        .and_then(|hd| hd.other_fields().get(&header_tag::SORT_ORDER))
        .unwrap();
    assert_eq!(so.as_slice(), b"queryname");
}

/// Runs the realign pipeline (no intervals) over a file, returning output.
fn realign_passthrough(input: &Path, threads: usize) -> Vec<RecordBuf> {
    let reader = FileReader::open(&[input.to_path_buf()], true).unwrap();
    let input_header = reader.header().clone();

    let reference = ReferenceReader::from_sequences(vec![(
        "chr1".to_string(),
        b"ACGT".repeat(2_500),
    )]);
    let pool = (threads > 1).then(|| Arc::new(ThreadPool::with_workers(threads)));
    let realigner = LocalRealigner::new(
        RealignOptions::default(),
        reference,
        Vec::<GenomeLoc>::new(),
        Vec::new(),
        pool,
    );

    let context = StreamContext::new(input_header);
    let (read_tx, read_rx) = alignment_queue(1024);
    let (out_tx, out_rx) = alignment_queue(1024);
    let reader_handle = spawn_stage(reader, StageIo::new(None, vec![read_tx], context.clone()));
    let realigner_handle =
        spawn_stage(realigner, StageIo::new(Some(read_rx), vec![out_tx], context));

    let out: Vec<RecordBuf> = out_rx.iter().collect();
    assert_eq!(finish_all(vec![reader_handle, realigner_handle]), 0);
    out
}

#[test]
fn test_realign_repairs_mate_of_unmapped_read() {
    let dir = tempfile::tempdir().unwrap();
    let header = test_header(&[("chr1", 100_000)]);
    let input = dir.path().join("pairs.bam");

    let r1 = RecordBuilder::mapped()
        .name("pair")
        .alignment_start(1_000)
        .cigar("30M")
        .paired()
        .first_of_pair()
        .mate_unmapped()
        .build();
    let r2 = RecordBuilder::mapped()
        .name("pair")
        .alignment_start(1_000)
        .flags(Flags::UNMAPPED | Flags::SEGMENTED | Flags::LAST_SEGMENT)
        .build();
    write_bam(&input, &header, &[r1, r2]);

    let out = realign_passthrough(&input, 1);
    assert_eq!(out.len(), 2);

    let mapped = out.iter().find(|r| !r.flags().is_unmapped()).unwrap();
    let unmapped = out.iter().find(|r| r.flags().is_unmapped()).unwrap();

    assert_eq!(unmapped.alignment_start().map(usize::from), Some(1_000));
    assert!(mapped.flags().is_mate_unmapped());
    assert_eq!(mapped.template_length(), 0);
    assert_eq!(unmapped.template_length(), 0);
}

#[test]
fn test_realign_passthrough_preserves_stream() {
    let dir = tempfile::tempdir().unwrap();
    let header = test_header(&[("chr1", 100_000)]);
    let input = dir.path().join("in.bam");

    let mut records = Vec::new();
    for i in 0..100u32 {
        records.push(
            RecordBuilder::mapped()
                .name(&format!("r{i}"))
                .alignment_start(1 + i as usize * 11)
                .build(),
        );
    }
    write_bam(&input, &header, &records);

    for threads in [1, 3] {
        let out = realign_passthrough(&input, threads);
        assert_eq!(out.len(), 100, "threads={threads}");
        let positions = starts(&out);
        assert!(positions.windows(2).all(|w| w[0] <= w[1]), "threads={threads}");
    }
}

#[test]
fn test_sam_input_bam_output_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let header = test_header(&[("chr1", 100_000)]);
    let sam_path = dir.path().join("in.sam");
    let out_path = dir.path().join("out.bam");

    let mut writer =
        create_record_writer(&sam_path, OutputFormat::Sam, &header, true).unwrap();
    for i in 1..=3 {
        writer
            .write_record(
                &header,
                &RecordBuilder::mapped().name(&format!("r{i}")).alignment_start(i * 100).build(),
            )
            .unwrap();
    }
    writer.finish().unwrap();

    sort_files(&[sam_path], &out_path, SortOptions::default(), 1);
    let (_, records) = read_bam(&out_path);
    assert_eq!(starts(&records), vec![100, 200, 300]);
}
