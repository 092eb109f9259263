//! View or convert an alignment stream.
//!
//! The identity pipeline: reader straight to writer, converting between
//! SAM and BAM as requested.

use anyhow::{bail, Result};
use clap::Parser;

use readforge_lib::bam_io::OutputFormat;
use readforge_lib::header::add_pg_record;
use readforge_lib::pipeline::{alignment_queue, finish_all, spawn_stage, StageIo, StreamContext};
use readforge_lib::reader::FileReader;

use crate::commands::command::Command;
use crate::commands::common::{open_output, write_stream, IoOptions};

/// View or convert alignment input.
#[derive(Debug, Parser)]
#[command(
    name = "view",
    about = "View SAM/BAM input, converting between formats",
    long_about = "\
Stream records from any supported input to the output, converting format
on the way. Without -b, output is SAM text (stdout-friendly); with -b it
is BAM.

EXAMPLES:

  # BAM to SAM on stdout
  readforge view --in input.bam

  # SAM to BAM
  readforge view --in input.sam --out output.bam -b"
)]
pub struct View {
    #[command(flatten)]
    pub io: IoOptions,

    /// Write BAM instead of SAM text.
    #[arg(short = 'b', long = "bam", default_value_t = false)]
    pub bam: bool,
}

impl Command for View {
    fn execute(&self, command_line: &str) -> Result<()> {
        self.io.validate()?;

        let reader = FileReader::open(&self.io.inputs, true)?;
        let input_header = reader.header().clone();

        let format = if self.bam { OutputFormat::Bam } else { OutputFormat::Sam };
        let output_header =
            add_pg_record(input_header.clone(), env!("CARGO_PKG_VERSION"), command_line)?;
        let mut writer = open_output(&self.io, format, &output_header)?;

        let context = StreamContext::new(input_header);
        let (out_tx, out_rx) = alignment_queue(readforge_lib::pipeline::DEFAULT_QUEUE_CAPACITY);
        let reader_handle = spawn_stage(reader, StageIo::new(None, vec![out_tx], context));

        write_stream(&out_rx, &mut writer, &output_header)?;

        let status = finish_all(vec![reader_handle]);
        if status != 0 {
            bail!("view pipeline failed with status {status}");
        }
        Ok(())
    }
}
