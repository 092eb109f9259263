//! Alignment stream I/O: format detection, readers, and writers.
//!
//! Inputs may be text SAM or binary (BGZF-framed) BAM; the format is
//! detected from the first two bytes (`@` for SAM, the gzip magic for BAM)
//! through a bounded peek, so stdin works the same as files. Writers are
//! constructed per output target; `-` means stdin/stdout.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use noodles::bam;
use noodles::bgzf;
use noodles::sam;
use noodles::sam::alignment::io::Write as AlignmentWrite;
use noodles::sam::alignment::record_buf::RecordBuf;
use noodles::sam::Header;

use crate::errors::ReadforgeError;

/// Detected format of an alignment input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// Text SAM.
    Sam,
    /// BGZF-framed binary BAM.
    Bam,
}

impl InputFormat {
    /// Human-readable name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sam => "SAM",
            Self::Bam => "BAM",
        }
    }
}

/// Format of an alignment output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Text SAM.
    Sam,
    /// BGZF-framed binary BAM.
    Bam,
}

/// A boxed buffered byte source (file or stdin).
pub type ByteSource = Box<dyn BufRead + Send>;

/// Opens a raw byte source for a path, treating `-` as stdin.
///
/// # Errors
///
/// Returns an error if the file cannot be opened.
pub fn open_byte_source(path: &Path) -> std::io::Result<ByteSource> {
    if path == Path::new("-") {
        Ok(Box::new(BufReader::new(std::io::stdin())))
    } else {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }
}

/// Detects the format from the source's first bytes without consuming them.
///
/// # Errors
///
/// Returns [`ReadforgeError::FormatUnknown`] when the leading bytes match
/// neither SAM nor the gzip magic, and I/O errors from the peek itself.
pub fn sniff_format(source: &mut ByteSource, path: &Path) -> Result<InputFormat, ReadforgeError> {
    let buf = source.fill_buf()?;
    match buf {
        [b'@', ..] => Ok(InputFormat::Sam),
        [0x1f, 0x8b, ..] => Ok(InputFormat::Bam),
        _ => Err(ReadforgeError::FormatUnknown { path: path.to_path_buf() }),
    }
}

/// A single-input record reader over either supported format.
pub enum RecordReader {
    /// Text SAM reader.
    Sam(sam::io::Reader<ByteSource>),
    /// Binary BAM reader.
    Bam(bam::io::Reader<bgzf::Reader<ByteSource>>),
}

impl RecordReader {
    /// Reads the next record into `record`; returns 0 at end of input.
    ///
    /// # Errors
    ///
    /// Returns decode or I/O errors from the underlying reader.
    pub fn read_record(
        &mut self,
        header: &Header,
        record: &mut RecordBuf,
    ) -> std::io::Result<usize> {
        match self {
            Self::Sam(reader) => reader.read_record_buf(header, record),
            Self::Bam(reader) => reader.read_record_buf(header, record),
        }
    }
}

/// Opens one alignment input, consuming its header.
///
/// # Errors
///
/// Returns format-detection and header-parse failures.
pub fn open_alignment_input(path: &Path) -> Result<(RecordReader, Header, InputFormat)> {
    let mut source = open_byte_source(path)
        .with_context(|| format!("Failed to open '{}'", path.display()))?;
    let format = sniff_format(&mut source, path)?;

    match format {
        InputFormat::Sam => {
            let mut reader = sam::io::Reader::new(source);
            let header = reader
                .read_header()
                .with_context(|| format!("Failed to read SAM header from '{}'", path.display()))?;
            Ok((RecordReader::Sam(reader), header, format))
        }
        InputFormat::Bam => {
            let mut reader = bam::io::Reader::new(source);
            let header = reader
                .read_header()
                .with_context(|| format!("Failed to read BAM header from '{}'", path.display()))?;
            Ok((RecordReader::Bam(reader), header, format))
        }
    }
}

/// A boxed byte sink (file or stdout).
pub type ByteSink = Box<dyn Write + Send>;

/// A record writer over either supported output format.
pub enum RecordWriter {
    /// Text SAM writer.
    Sam(sam::io::Writer<ByteSink>),
    /// Binary BAM writer.
    Bam(bam::io::Writer<bgzf::Writer<ByteSink>>),
}

impl RecordWriter {
    /// Writes one record.
    ///
    /// # Errors
    ///
    /// Returns encode or I/O errors from the underlying writer.
    pub fn write_record(&mut self, header: &Header, record: &RecordBuf) -> std::io::Result<()> {
        match self {
            Self::Sam(writer) => writer.write_alignment_record(header, record),
            Self::Bam(writer) => writer.write_alignment_record(header, record),
        }
    }

    /// Flushes and finalizes the output (writes the BGZF EOF block for BAM).
    ///
    /// # Errors
    ///
    /// Returns I/O errors from the final flush.
    pub fn finish(&mut self) -> std::io::Result<()> {
        match self {
            Self::Sam(writer) => writer.get_mut().flush(),
            Self::Bam(writer) => writer.try_finish(),
        }
    }
}

/// Creates a record writer for a path (`-` = stdout), writing the header.
///
/// `compress` selects BGZF compression for BAM outputs; uncompressed BGZF
/// framing is used otherwise (the temp-file mode of the sorter). SAM output
/// ignores it.
///
/// # Errors
///
/// Returns errors from creating the target or writing the header.
pub fn create_record_writer(
    path: &Path,
    format: OutputFormat,
    header: &Header,
    compress: bool,
) -> Result<RecordWriter> {
    let sink: ByteSink = if path == Path::new("-") {
        Box::new(std::io::stdout())
    } else {
        Box::new(
            File::create(path)
                .with_context(|| format!("Failed to create '{}'", path.display()))?,
        )
    };

    match format {
        OutputFormat::Sam => {
            let mut writer = sam::io::Writer::new(sink);
            writer.write_header(header).context("Failed to write SAM header")?;
            Ok(RecordWriter::Sam(writer))
        }
        OutputFormat::Bam => {
            let level = if compress {
                bgzf::writer::CompressionLevel::default()
            } else {
                bgzf::writer::CompressionLevel::NONE
            };
            let inner = bgzf::writer::Builder::default()
                .set_compression_level(level)
                .build_from_writer(sink);
            let mut writer = bam::io::Writer::from(inner);
            writer.write_header(header).context("Failed to write BAM header")?;
            Ok(RecordWriter::Bam(writer))
        }
    }
}

/// Renders a header to its SAM text form, for equality checks and logs.
///
/// # Errors
///
/// Returns an error if the header fails to serialize.
pub fn header_text(header: &Header) -> Result<Vec<u8>> {
    let mut writer = sam::io::Writer::new(Vec::new());
    writer.write_header(header).context("Failed to serialize header")?;
    Ok(writer.into_inner())
}
