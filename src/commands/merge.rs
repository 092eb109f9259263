//! Merge multiple alignment inputs into one stream.
//!
//! Relies on the reader's multi-input interleave (a k-way coordinate merge
//! for binary inputs); no re-sort happens here; use `sort` for unsorted
//! inputs.

use anyhow::{bail, Result};
use clap::Parser;
use log::info;

use readforge_lib::header::add_pg_record;
use readforge_lib::pipeline::{alignment_queue, finish_all, spawn_stage, StageIo, StreamContext};
use readforge_lib::reader::FileReader;

use crate::commands::command::Command;
use crate::commands::common::{open_output, write_stream, IoOptions};

/// Merge alignment inputs.
#[derive(Debug, Parser)]
#[command(
    name = "merge",
    about = "Merge multiple SAM/BAM inputs into one output",
    long_about = "\
Merge alignment inputs into a single output stream.

Coordinate-sorted binary inputs are interleaved by position; text inputs
are concatenated. All inputs must share a format and (for binary inputs)
a header.

EXAMPLES:

  readforge merge --in a.bam --in b.bam --in c.bam --out merged.bam"
)]
pub struct Merge {
    #[command(flatten)]
    pub io: IoOptions,
}

impl Command for Merge {
    fn execute(&self, command_line: &str) -> Result<()> {
        self.io.validate()?;
        info!("Merging {} input(s)", self.io.inputs.len());

        let reader = FileReader::open(&self.io.inputs, false)?;
        let input_header = reader.header().clone();

        let output_header =
            add_pg_record(input_header.clone(), env!("CARGO_PKG_VERSION"), command_line)?;
        let mut writer =
            open_output(&self.io, self.io.inferred_output_format(), &output_header)?;

        let context = StreamContext::new(input_header);
        let (out_tx, out_rx) = alignment_queue(readforge_lib::pipeline::DEFAULT_QUEUE_CAPACITY);
        let reader_handle = spawn_stage(reader, StageIo::new(None, vec![out_tx], context));

        let written = write_stream(&out_rx, &mut writer, &output_header)?;

        let status = finish_all(vec![reader_handle]);
        if status != 0 {
            bail!("merge pipeline failed with status {status}");
        }

        info!("Wrote {written} records to {}", self.io.out.display());
        Ok(())
    }
}
