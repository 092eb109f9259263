//! Common CLI options and wiring helpers shared across commands.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Result};
use clap::Args;
use noodles::sam::Header;

use readforge_lib::bam_io::{create_record_writer, OutputFormat, RecordWriter};
use readforge_lib::pipeline::AlignmentReceiver;
use readforge_lib::validation::validate_file_exists;

/// Input/output targets shared by every command.
#[derive(Debug, Clone, Args)]
pub struct IoOptions {
    /// Input file(s); `-` reads from stdin. Repeat for multiple inputs.
    #[arg(short = 'i', long = "in", required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,

    /// Output file; `-` writes to stdout.
    #[arg(short = 'o', long = "out", default_value = "-")]
    pub out: PathBuf,
}

impl IoOptions {
    /// Validates that every non-stdin input exists.
    pub fn validate(&self) -> Result<()> {
        for input in &self.inputs {
            if input != Path::new("-") {
                validate_file_exists(input, "Input")?;
            }
        }
        Ok(())
    }

    /// Output format inferred from the output path: `.sam` means text,
    /// anything else is BAM.
    #[must_use]
    pub fn inferred_output_format(&self) -> OutputFormat {
        match self.out.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("sam") => OutputFormat::Sam,
            _ => OutputFormat::Bam,
        }
    }
}

/// Worker-thread count shared by the parallel commands.
#[derive(Debug, Clone, Args)]
pub struct ThreadsOption {
    /// Worker threads for internal parallelism; 1 disables the pools.
    #[arg(short = 't', long = "threads", default_value = "1")]
    pub threads: usize,
}

impl ThreadsOption {
    /// Validated thread count.
    pub fn count(&self) -> Result<usize> {
        ensure!(self.threads >= 1, "--threads must be at least 1");
        Ok(self.threads)
    }
}

/// Drains an alignment queue into a writer, returning the record count.
pub fn write_stream(
    rx: &AlignmentReceiver,
    writer: &mut RecordWriter,
    header: &Header,
) -> Result<u64> {
    let mut written = 0u64;
    while let Some(record) = rx.recv() {
        writer.write_record(header, &record)?;
        written += 1;
    }
    writer.finish()?;
    Ok(written)
}

/// Opens the output writer for a command.
pub fn open_output(
    io: &IoOptions,
    format: OutputFormat,
    header: &Header,
) -> Result<RecordWriter> {
    create_record_writer(&io.out, format, header, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inferred_output_format() {
        let sam = IoOptions { inputs: vec![], out: PathBuf::from("out.sam") };
        let bam = IoOptions { inputs: vec![], out: PathBuf::from("out.bam") };
        let stdout = IoOptions { inputs: vec![], out: PathBuf::from("-") };

        assert_eq!(sam.inferred_output_format(), OutputFormat::Sam);
        assert_eq!(bam.inferred_output_format(), OutputFormat::Bam);
        assert_eq!(stdout.inferred_output_format(), OutputFormat::Bam);
    }

    #[test]
    fn test_threads_validation() {
        assert!(ThreadsOption { threads: 0 }.count().is_err());
        assert_eq!(ThreadsOption { threads: 4 }.count().unwrap(), 4);
    }
}
