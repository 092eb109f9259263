//! External merge-sort stage.
//!
//! # Algorithm
//!
//! 1. **Chunking**: accumulate input records until the chunk holds
//!    `records_per_tempfile`, then hand the buffer to a spill job and start
//!    a fresh one. The tail left at end of input spills as the last chunk.
//! 2. **Spill job**: stable-sort the chunk and write it to a uniquely
//!    numbered temp file carrying the output header.
//! 3. **In-chunk sort**: the chunk is split into `min(⌊n/30_000⌋, workers)`
//!    contiguous shards sorted concurrently on the dedicated shard pool,
//!    then merged pairwise as each shard's completion event arrives.
//! 4. **Merge**: open every temp file, k-way merge on a min-heap keyed by
//!    the sort comparator (ties to the earlier chunk, keeping equal-key
//!    records in source order), emit downstream, delete the temp files.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use noodles::bam;
use noodles::sam::alignment::record_buf::RecordBuf;
use noodles::sam::Header;
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::bam_io::{create_record_writer, OutputFormat};
use crate::header::with_sort_order;
use crate::pipeline::{Stage, StageIo};
use crate::sort::keys::{CoordinateKey, QuerynameKey, SortKey, SortOrder};
use crate::thread_pool::ThreadPool;

/// Default chunk size, in records.
pub const DEFAULT_RECORDS_PER_TEMPFILE: usize = 500_000;

/// Shards smaller than this sort inline; the split overhead would dominate.
const MIN_SHARD_SIZE: usize = 30_000;

/// Buffer size for reading temp files during the merge.
const MERGE_BUFFER_SIZE: usize = 64 * 1024;

/// Sorter configuration.
#[derive(Debug, Clone)]
pub struct SortOptions {
    /// Output ordering.
    pub order: SortOrder,
    /// Records per spilled chunk.
    pub records_per_tempfile: usize,
    /// BGZF-compress temp chunks (smaller spill files, more CPU).
    pub compress_temp_files: bool,
}

impl Default for SortOptions {
    fn default() -> Self {
        Self {
            order: SortOrder::Coordinate,
            records_per_tempfile: DEFAULT_RECORDS_PER_TEMPFILE,
            compress_temp_files: false,
        }
    }
}

/// The two pools backing sorter parallelism: `general` runs whole spill
/// jobs, `shards` runs in-chunk sort shards.
#[derive(Clone)]
pub struct SortPools {
    /// Spill and merge work.
    pub general: Arc<ThreadPool>,
    /// In-chunk sort shards only.
    pub shards: Arc<ThreadPool>,
}

/// First error raised by any spill job; checked before the merge phase.
type SpillError = Arc<Mutex<Option<anyhow::Error>>>;

/// External merge sorter stage.
pub struct ExternalSorter {
    options: SortOptions,
    pools: Option<SortPools>,
    temp_dir_in: Option<PathBuf>,
}

impl ExternalSorter {
    /// Creates a sorter. With `pools` absent the sorter runs entirely on
    /// the stage thread (single-threaded mode).
    #[must_use]
    pub fn new(options: SortOptions, pools: Option<SortPools>) -> Self {
        Self { options, pools, temp_dir_in: None }
    }

    /// Places temp chunks under `dir` instead of the system temp directory.
    #[must_use]
    pub fn temp_dir_in(mut self, dir: PathBuf) -> Self {
        self.temp_dir_in = Some(dir);
        self
    }

    fn create_temp_dir(&self) -> Result<TempDir> {
        match &self.temp_dir_in {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                TempDir::new_in(base).context("Failed to create temp directory")
            }
            None => TempDir::new().context("Failed to create temp directory"),
        }
    }

    fn run_sort<K: SortKey>(&mut self, io: &mut StageIo) -> Result<()> {
        let output_header = with_sort_order(io.header(), self.options.order);
        let temp_dir = self.create_temp_dir()?;
        let stub = temp_dir.path().join("chunk_");

        info!("Sorting with order '{}'", self.options.order.header_so_tag());
        debug!("Chunk size: {} records", self.options.records_per_tempfile);

        // Phase 1: chunk and spill.
        let spill_error: SpillError = Arc::new(Mutex::new(None));
        let mut chunk_files: Vec<PathBuf> = Vec::new();
        let mut buffer: Vec<(K, RecordBuf)> =
            Vec::with_capacity(self.options.records_per_tempfile.min(1 << 20));
        let mut total_records: u64 = 0;

        while let Some(record) = io.next_input() {
            total_records += 1;

            if buffer.len() >= self.options.records_per_tempfile {
                let chunk = std::mem::take(&mut buffer);
                self.spill(chunk, &output_header, &stub, &mut chunk_files, &spill_error);
            }

            let key = K::from_record(&record);
            buffer.push((key, record));
        }

        if !buffer.is_empty() {
            self.spill(buffer, &output_header, &stub, &mut chunk_files, &spill_error);
        }

        if let Some(pools) = &self.pools {
            pools.general.wait_for_completion();
        }
        if let Some(error) = spill_error.lock().take() {
            return Err(error.context("Writing a sort temp file failed"));
        }

        info!("Read {} records into {} chunk(s)", total_records, chunk_files.len());

        // Phase 2: k-way merge back into one stream.
        let merged = self.merge_chunks::<K>(&chunk_files, &output_header, io)?;
        if merged != total_records {
            warn!("Merged {merged} records but read {total_records}");
        }

        for path in &chunk_files {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("Could not remove temp file '{}': {e}", path.display());
            }
        }

        info!("Sort complete: {merged} records emitted");
        Ok(())
    }

    /// Dispatches one chunk to a spill job (or spills inline when
    /// single-threaded). Chunk file names are `<stub><sequence-number>`.
    fn spill<K: SortKey>(
        &self,
        chunk: Vec<(K, RecordBuf)>,
        output_header: &Header,
        stub: &Path,
        chunk_files: &mut Vec<PathBuf>,
        spill_error: &SpillError,
    ) {
        let seq = chunk_files.len();
        let path = PathBuf::from(format!("{}{seq:04}.bam", stub.display()));
        chunk_files.push(path.clone());

        let compress = self.options.compress_temp_files;
        let header = output_header.clone();

        match &self.pools {
            None => {
                let chunk = sort_chunk(chunk, None);
                if let Err(e) = write_chunk(&chunk, &header, &path, compress) {
                    let mut slot = spill_error.lock();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                }
            }
            Some(pools) => {
                let shard_pool = Arc::clone(&pools.shards);
                let error = Arc::clone(spill_error);
                pools.general.execute(move || {
                    let chunk = sort_chunk(chunk, Some(&shard_pool));
                    if let Err(e) = write_chunk(&chunk, &header, &path, compress) {
                        let mut slot = error.lock();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                    // Chunk records are freed here, after the spill.
                });
            }
        }
    }

    fn merge_chunks<K: SortKey>(
        &self,
        chunk_files: &[PathBuf],
        output_header: &Header,
        io: &StageIo,
    ) -> Result<u64> {
        let mut readers: Vec<ChunkReader> = chunk_files
            .iter()
            .map(|path| ChunkReader::open(path))
            .collect::<Result<_>>()?;

        let mut heap: BinaryHeap<Reverse<HeapEntry<K>>> =
            BinaryHeap::with_capacity(readers.len());
        for (idx, reader) in readers.iter_mut().enumerate() {
            if let Some((key, record)) = reader.next::<K>(output_header)? {
                heap.push(Reverse(HeapEntry { key, record, chunk_idx: idx }));
            }
        }

        let mut merged: u64 = 0;
        while let Some(Reverse(entry)) = heap.pop() {
            io.emit(entry.record);
            merged += 1;

            let reader = &mut readers[entry.chunk_idx];
            if let Some((key, record)) = reader.next::<K>(output_header)? {
                heap.push(Reverse(HeapEntry { key, record, chunk_idx: entry.chunk_idx }));
            }
        }

        Ok(merged)
    }
}

impl Stage for ExternalSorter {
    fn name(&self) -> &'static str {
        "external-sorter"
    }

    fn run(&mut self, io: &mut StageIo) -> Result<()> {
        match self.options.order {
            SortOrder::Coordinate => self.run_sort::<CoordinateKey>(io),
            SortOrder::Queryname => self.run_sort::<QuerynameKey>(io),
        }
    }
}

/// Stable-sorts a chunk, sharding across the pool when it pays off.
fn sort_chunk<K: SortKey>(
    mut chunk: Vec<(K, RecordBuf)>,
    shard_pool: Option<&Arc<ThreadPool>>,
) -> Vec<(K, RecordBuf)> {
    let divisions = match shard_pool {
        None => 1,
        Some(pool) => (chunk.len() / MIN_SHARD_SIZE).min(pool.worker_count()),
    };

    if divisions <= 1 {
        chunk.sort_by(|(a, _), (b, _)| a.cmp(b));
        return chunk;
    }

    let pool = shard_pool.expect("divisions > 1 implies a pool");
    let section_len = chunk.len() / divisions;

    // Split into contiguous shards; the last takes the remainder.
    let mut shards: Vec<Vec<(K, RecordBuf)>> = Vec::with_capacity(divisions);
    for _ in 0..divisions - 1 {
        let rest = chunk.split_off(section_len);
        let shard = std::mem::replace(&mut chunk, rest);
        shards.push(shard);
    }
    shards.push(chunk);

    // One single-use completion channel per shard; receiving the sorted
    // shard is the completion event.
    let mut done: Vec<Receiver<Vec<(K, RecordBuf)>>> = Vec::with_capacity(divisions);
    for mut shard in shards {
        let (tx, rx) = crossbeam_channel::bounded(1);
        done.push(rx);
        pool.execute(move || {
            shard.sort_by(|(a, _), (b, _)| a.cmp(b));
            let _ = tx.send(shard);
        });
    }

    // Rejoin front to back, merging each shard as it completes.
    let mut completions = done.into_iter();
    let mut rejoined =
        completions.next().expect("at least one shard").recv().expect("shard sort worker died");
    for rx in completions {
        let shard = rx.recv().expect("shard sort worker died");
        rejoined = merge_sorted(rejoined, shard);
    }
    rejoined
}

/// Merges two sorted runs, taking from `left` on ties (`left` precedes
/// `right` in source order, so the merge stays stable).
fn merge_sorted<K: SortKey>(
    left: Vec<(K, RecordBuf)>,
    right: Vec<(K, RecordBuf)>,
) -> Vec<(K, RecordBuf)> {
    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();

    loop {
        match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => {
                if l.0 <= r.0 {
                    out.push(left.next().expect("peeked"));
                } else {
                    out.push(right.next().expect("peeked"));
                }
            }
            (Some(_), None) => out.push(left.next().expect("peeked")),
            (None, Some(_)) => out.push(right.next().expect("peeked")),
            (None, None) => break,
        }
    }

    out
}

/// Writes a sorted chunk to its temp file.
fn write_chunk<K: SortKey>(
    chunk: &[(K, RecordBuf)],
    header: &Header,
    path: &Path,
    compress: bool,
) -> Result<()> {
    let mut writer = create_record_writer(path, OutputFormat::Bam, header, compress)
        .with_context(|| format!("Failed to open temp file '{}'", path.display()))?;
    for (_, record) in chunk {
        writer
            .write_record(header, record)
            .with_context(|| format!("Failed to write temp file '{}'", path.display()))?;
    }
    writer.finish().with_context(|| format!("Failed to finish temp file '{}'", path.display()))?;
    Ok(())
}

/// Reader over one sorted chunk file.
struct ChunkReader {
    reader: bam::io::Reader<noodles::bgzf::Reader<BufReader<File>>>,
}

impl ChunkReader {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open chunk file '{}'", path.display()))?;
        let mut reader =
            bam::io::Reader::new(BufReader::with_capacity(MERGE_BUFFER_SIZE, file));
        reader.read_header()?;
        Ok(Self { reader })
    }

    fn next<K: SortKey>(&mut self, header: &Header) -> Result<Option<(K, RecordBuf)>> {
        let mut record = RecordBuf::default();
        match self.reader.read_record_buf(header, &mut record)? {
            0 => Ok(None),
            _ => {
                let key = K::from_record(&record);
                Ok(Some((key, record)))
            }
        }
    }
}

/// Entry in the merge heap. Ordering is (key, chunk index) so equal keys
/// drain from earlier chunks first.
struct HeapEntry<K> {
    key: K,
    record: RecordBuf,
    chunk_idx: usize,
}

impl<K: Ord> PartialEq for HeapEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.chunk_idx == other.chunk_idx
    }
}

impl<K: Ord> Eq for HeapEntry<K> {}

impl<K: Ord> PartialOrd for HeapEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> Ord for HeapEntry<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key).then_with(|| self.chunk_idx.cmp(&other.chunk_idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{alignment_queue, StreamContext};
    use crate::sam::builder::{test_header, RecordBuilder};

    fn run_sorter(
        options: SortOptions,
        pools: Option<SortPools>,
        records: Vec<RecordBuf>,
    ) -> Vec<RecordBuf> {
        let header = test_header(&[("chr1", 1_000_000), ("chr2", 1_000_000)]);
        let context = StreamContext::new(header);

        let (in_tx, in_rx) = alignment_queue(records.len().max(1));
        let (out_tx, out_rx) = alignment_queue(records.len().max(1));
        for record in records {
            in_tx.send(record);
        }
        drop(in_tx);

        let mut sorter = ExternalSorter::new(options, pools);
        let mut io = StageIo::new(Some(in_rx), vec![out_tx], context);
        sorter.run(&mut io).unwrap();
        drop(io);

        out_rx.iter().collect()
    }

    fn starts(records: &[RecordBuf]) -> Vec<usize> {
        records.iter().map(|r| r.alignment_start().map(usize::from).unwrap_or(0)).collect()
    }

    #[test]
    fn test_coordinate_sort_small_input() {
        let records = vec![
            RecordBuilder::mapped().name("a").alignment_start(100).build(),
            RecordBuilder::mapped().name("b").alignment_start(50).build(),
        ];
        let out = run_sorter(SortOptions::default(), None, records);
        assert_eq!(starts(&out), vec![50, 100]);
    }

    #[test]
    fn test_spill_produces_expected_chunks_and_count() {
        // 10 records with 3 per chunk: chunks of 3,3,3,1; all merged back.
        let mut records = Vec::new();
        for i in (1..=10).rev() {
            records.push(RecordBuilder::mapped().name(&format!("r{i}")).alignment_start(i * 7).build());
        }
        let options = SortOptions { records_per_tempfile: 3, ..SortOptions::default() };
        let out = run_sorter(options, None, records);

        assert_eq!(out.len(), 10);
        let positions = starts(&out);
        assert!(positions.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_temp_files_deleted_after_merge() {
        let dir = tempfile::tempdir().unwrap();
        let header = test_header(&[("chr1", 1_000_000)]);
        let context = StreamContext::new(header);

        let (in_tx, in_rx) = alignment_queue(16);
        let (out_tx, out_rx) = alignment_queue(16);
        for i in (1..=9).rev() {
            in_tx.send(RecordBuilder::mapped().alignment_start(i).build());
        }
        drop(in_tx);

        let options = SortOptions { records_per_tempfile: 3, ..SortOptions::default() };
        let mut sorter =
            ExternalSorter::new(options, None).temp_dir_in(dir.path().to_path_buf());
        let mut io = StageIo::new(Some(in_rx), vec![out_tx], context);
        sorter.run(&mut io).unwrap();
        drop(io);

        assert_eq!(out_rx.iter().count(), 9);

        // Only empty temp dirs may remain under the override directory.
        let leftover_files: Vec<_> = walk_files(dir.path());
        assert!(leftover_files.is_empty(), "temp files left behind: {leftover_files:?}");
    }

    fn walk_files(dir: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_dir() {
                files.extend(walk_files(&entry.path()));
            } else {
                files.push(entry.path());
            }
        }
        files
    }

    #[test]
    fn test_stability_across_chunks() {
        // Equal-key records (same position) must come out in source order
        // even when split across chunks.
        let mut records = Vec::new();
        for i in 0..6 {
            records.push(
                RecordBuilder::mapped().name(&format!("dup{i}")).alignment_start(500).build(),
            );
        }
        let options = SortOptions { records_per_tempfile: 2, ..SortOptions::default() };
        let out = run_sorter(options, None, records);

        let names: Vec<String> = out
            .iter()
            .map(|r| String::from_utf8_lossy(r.name().unwrap().as_ref()).to_string())
            .collect();
        assert_eq!(names, vec!["dup0", "dup1", "dup2", "dup3", "dup4", "dup5"]);
    }

    #[test]
    fn test_unmapped_sort_last() {
        let records = vec![
            RecordBuilder::unmapped().name("u").build(),
            RecordBuilder::mapped().name("m").alignment_start(10).build(),
        ];
        let out = run_sorter(SortOptions::default(), None, records);
        assert!(AsRef::<[u8]>::as_ref(out[0].name().unwrap()) == b"m");
        assert!(out[1].flags().is_unmapped());
    }

    #[test]
    fn test_queryname_sort() {
        let records = vec![
            RecordBuilder::mapped().name("zebra").alignment_start(1).build(),
            RecordBuilder::mapped().name("alpha").alignment_start(2).build(),
            RecordBuilder::mapped().name("mid").alignment_start(3).build(),
        ];
        let options = SortOptions { order: SortOrder::Queryname, ..SortOptions::default() };
        let out = run_sorter(options, None, records);

        let names: Vec<&[u8]> = out.iter().map(|r| r.name().unwrap().as_ref()).collect();
        assert_eq!(names, vec![b"alpha".as_slice(), b"mid".as_slice(), b"zebra".as_slice()]);
    }

    #[test]
    fn test_threaded_sort_matches_single_threaded() {
        let make_records = || {
            let mut records = Vec::new();
            for i in 0..500 {
                let pos = (i * 7919) % 10_000 + 1;
                records.push(
                    RecordBuilder::mapped().name(&format!("r{i}")).alignment_start(pos).build(),
                );
            }
            records
        };

        let single = run_sorter(
            SortOptions { records_per_tempfile: 100, ..SortOptions::default() },
            None,
            make_records(),
        );

        let pools = SortPools {
            general: Arc::new(ThreadPool::with_workers(2)),
            shards: Arc::new(ThreadPool::with_workers(2)),
        };
        let threaded = run_sorter(
            SortOptions { records_per_tempfile: 100, ..SortOptions::default() },
            Some(pools),
            make_records(),
        );

        assert_eq!(starts(&single), starts(&threaded));
    }

    #[test]
    fn test_empty_input_emits_nothing() {
        let out = run_sorter(SortOptions::default(), None, Vec::new());
        assert!(out.is_empty());
    }

    #[test]
    fn test_merge_sorted_stable() {
        let left = vec![
            (CoordinateKey { tid: 0, pos: 1, reverse: false }, RecordBuilder::mapped().name("l1").build()),
            (CoordinateKey { tid: 0, pos: 5, reverse: false }, RecordBuilder::mapped().name("l2").build()),
        ];
        let right = vec![
            (CoordinateKey { tid: 0, pos: 1, reverse: false }, RecordBuilder::mapped().name("r1").build()),
            (CoordinateKey { tid: 0, pos: 3, reverse: false }, RecordBuilder::mapped().name("r2").build()),
        ];

        let merged = merge_sorted(left, right);
        let names: Vec<&[u8]> =
            merged.iter().map(|(_, r)| r.name().unwrap().as_ref()).collect();
        assert_eq!(
            names,
            vec![b"l1".as_slice(), b"r1".as_slice(), b"r2".as_slice(), b"l2".as_slice()]
        );
    }
}
