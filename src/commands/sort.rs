//! Sort an alignment stream by coordinate or read name.
//!
//! Wires the file reader into the external merge sorter and writes the
//! merged stream out with the @HD SO tag rewritten.

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use readforge_lib::header::{add_pg_record, with_sort_order};
use readforge_lib::pipeline::{alignment_queue, finish_all, spawn_stage, StageIo, StreamContext};
use readforge_lib::reader::FileReader;
use readforge_lib::sort::{
    ExternalSorter, SortOptions, SortOrder, SortPools, DEFAULT_RECORDS_PER_TEMPFILE,
};
use readforge_lib::thread_pool::ThreadPool;

use crate::commands::command::Command;
use crate::commands::common::{open_output, write_stream, IoOptions, ThreadsOption};

/// Sort order argument.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SortOrderArg {
    /// (reference, position) with unmapped reads last.
    Coordinate,
    /// Lexicographic read name.
    Queryname,
}

impl From<SortOrderArg> for SortOrder {
    fn from(arg: SortOrderArg) -> Self {
        match arg {
            SortOrderArg::Coordinate => SortOrder::Coordinate,
            SortOrderArg::Queryname => SortOrder::Queryname,
        }
    }
}

/// Sort an alignment stream.
#[derive(Debug, Parser)]
#[command(
    name = "sort",
    about = "Sort SAM/BAM input by coordinate or read name",
    long_about = "\
Sort an alignment stream with an external merge sort.

Records are buffered in fixed-size chunks, each chunk is stable-sorted and
spilled to a temporary file, and the chunks are k-way merged into the
output. With --threads > 1, spills overlap reading and each chunk's sort is
sharded across a dedicated pool.

EXAMPLES:

  # Coordinate-sort a BAM
  readforge sort --in input.bam --out sorted.bam

  # Name-sort multiple inputs with 8 threads
  readforge sort --in a.bam --in b.bam --out sorted.bam \\
    --order queryname --threads 8"
)]
pub struct Sort {
    #[command(flatten)]
    pub io: IoOptions,

    /// Sort order.
    #[arg(long = "order", value_enum, default_value = "coordinate")]
    pub order: SortOrderArg,

    /// Records per temporary spill file.
    #[arg(long = "records-per-tempfile", default_value_t = DEFAULT_RECORDS_PER_TEMPFILE)]
    pub records_per_tempfile: usize,

    /// BGZF-compress temporary spill files.
    #[arg(long = "compress-temp", default_value_t = false)]
    pub compress_temp: bool,

    /// Directory for temporary spill files (system temp by default).
    #[arg(short = 'T', long = "tmp-dir")]
    pub tmp_dir: Option<PathBuf>,

    #[command(flatten)]
    pub threads: ThreadsOption,
}

impl Command for Sort {
    fn execute(&self, command_line: &str) -> Result<()> {
        self.io.validate()?;
        let threads = self.threads.count()?;
        if self.records_per_tempfile == 0 {
            bail!("--records-per-tempfile must be greater than 0");
        }

        let order = SortOrder::from(self.order);
        info!("Sorting {} input(s) by {}", self.io.inputs.len(), order.header_so_tag());

        let reader = FileReader::open(&self.io.inputs, false)?;
        let input_header = reader.header().clone();
        let context = StreamContext::new(input_header.clone());

        let output_header = add_pg_record(
            with_sort_order(&input_header, order),
            env!("CARGO_PKG_VERSION"),
            command_line,
        )?;
        let mut writer =
            open_output(&self.io, self.io.inferred_output_format(), &output_header)?;

        let pools = (threads > 1).then(|| SortPools {
            general: Arc::new(ThreadPool::with_workers(threads)),
            shards: Arc::new(ThreadPool::with_workers(threads)),
        });
        let options = SortOptions {
            order,
            records_per_tempfile: self.records_per_tempfile,
            compress_temp_files: self.compress_temp,
        };
        let mut sorter = ExternalSorter::new(options, pools);
        if let Some(dir) = &self.tmp_dir {
            sorter = sorter.temp_dir_in(dir.clone());
        }

        let (read_tx, read_rx) = alignment_queue(readforge_lib::pipeline::DEFAULT_QUEUE_CAPACITY);
        let (out_tx, out_rx) = alignment_queue(readforge_lib::pipeline::DEFAULT_QUEUE_CAPACITY);

        let reader_handle =
            spawn_stage(reader, StageIo::new(None, vec![read_tx], context.clone()));
        let sorter_handle =
            spawn_stage(sorter, StageIo::new(Some(read_rx), vec![out_tx], context));

        let written = write_stream(&out_rx, &mut writer, &output_header)?;

        let status = finish_all(vec![reader_handle, sorter_handle]);
        if status != 0 {
            bail!("sort pipeline failed with status {status}");
        }

        info!("Wrote {written} records to {}", self.io.out.display());
        Ok(())
    }
}
