//! File-reader stage: turns one or more inputs into an alignment stream.
//!
//! All inputs in a batch must share a format. Binary inputs are interleaved
//! the way a multi-reader would deliver them (a k-way merge on
//! coordinate keys), while text inputs are concatenated sequentially. The stream
//! header is the first input's header; text inputs with diverging headers
//! produce a warning, binary inputs with diverging headers are rejected.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use log::{debug, warn};
use noodles::sam::alignment::record_buf::RecordBuf;
use noodles::sam::Header;

use crate::bam_io::{header_text, open_alignment_input, InputFormat, RecordReader};
use crate::errors::ReadforgeError;
use crate::pipeline::{Stage, StageIo};
use crate::progress::ProgressTracker;
use crate::sort::keys::{CoordinateKey, SortKey};

struct OpenInput {
    path: PathBuf,
    reader: RecordReader,
    header: Header,
}

impl OpenInput {
    fn next(&mut self) -> std::io::Result<Option<RecordBuf>> {
        let mut record = RecordBuf::default();
        match self.reader.read_record(&self.header, &mut record)? {
            0 => Ok(None),
            _ => Ok(Some(record)),
        }
    }
}

/// Source stage producing the alignment stream from files or stdin.
pub struct FileReader {
    inputs: Vec<OpenInput>,
    header: Header,
    format: InputFormat,
}

impl FileReader {
    /// Opens a batch of inputs (`-` = stdin), verifying format agreement
    /// and header compatibility.
    ///
    /// `needs_sequence_data` is the downstream capability declaration: a
    /// stage that inspects bases asks for fully materialized records. The
    /// decoder here always materializes them, so the bit is recorded for
    /// diagnostics only.
    ///
    /// # Errors
    ///
    /// Returns [`ReadforgeError::FormatUnknown`] / `FormatMismatch` on
    /// detection failures, `HeaderConflict` for diverging binary headers,
    /// and I/O errors from opening.
    pub fn open(paths: &[PathBuf], needs_sequence_data: bool) -> Result<Self> {
        anyhow::ensure!(!paths.is_empty(), "No input files given");
        debug!("Opening {} input(s); sequence data requested: {needs_sequence_data}", paths.len());

        let mut inputs: Vec<OpenInput> = Vec::with_capacity(paths.len());
        let mut batch_format: Option<InputFormat> = None;
        let mut first_header_text: Option<Vec<u8>> = None;

        for path in paths {
            let (reader, header, format) = open_alignment_input(path)?;

            match batch_format {
                None => batch_format = Some(format),
                Some(expected) if expected != format => {
                    return Err(ReadforgeError::FormatMismatch {
                        path: path.clone(),
                        found: format.as_str(),
                        expected: expected.as_str(),
                    }
                    .into());
                }
                Some(_) => {}
            }

            match &first_header_text {
                None => first_header_text = Some(header_text(&header)?),
                Some(first) => {
                    if *first != header_text(&header)? {
                        match format {
                            InputFormat::Sam => {
                                warn!("SAM input '{}' has a different header; using the first input's header", path.display());
                            }
                            InputFormat::Bam => {
                                return Err(ReadforgeError::HeaderConflict {
                                    path: path.clone(),
                                }
                                .into());
                            }
                        }
                    }
                }
            }

            inputs.push(OpenInput { path: path.clone(), reader, header });
        }

        let header = inputs[0].header.clone();
        let format = batch_format.expect("at least one input");
        Ok(Self { inputs, header, format })
    }

    /// The stream header (first input's header).
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The batch's detected format.
    #[must_use]
    pub fn format(&self) -> InputFormat {
        self.format
    }

    fn run_sequential(&mut self, io: &StageIo, progress: &ProgressTracker) -> Result<()> {
        for input in &mut self.inputs {
            loop {
                let record = input
                    .next()
                    .map_err(|e| read_error(&input.path, &e))?;
                match record {
                    None => break,
                    Some(record) => {
                        progress.inc(1);
                        io.emit(record);
                    }
                }
            }
        }
        Ok(())
    }

    /// Interleaves binary inputs by coordinate key, ties broken by input
    /// order, which reproduces a multi-reader's merged delivery for
    /// coordinate-sorted inputs.
    fn run_interleaved(&mut self, io: &StageIo, progress: &ProgressTracker) -> Result<()> {
        let mut heap: BinaryHeap<Reverse<(CoordinateKey, usize)>> =
            BinaryHeap::with_capacity(self.inputs.len());
        let mut pending: Vec<Option<RecordBuf>> = Vec::with_capacity(self.inputs.len());

        for (idx, input) in self.inputs.iter_mut().enumerate() {
            let record = input.next().map_err(|e| read_error(&input.path, &e))?;
            if let Some(record) = record {
                heap.push(Reverse((CoordinateKey::from_record(&record), idx)));
                pending.push(Some(record));
            } else {
                pending.push(None);
            }
        }

        while let Some(Reverse((_, idx))) = heap.pop() {
            let record = pending[idx].take().expect("heap entry has a pending record");
            progress.inc(1);
            io.emit(record);

            let input = &mut self.inputs[idx];
            let next = input.next().map_err(|e| read_error(&input.path, &e))?;
            if let Some(record) = next {
                heap.push(Reverse((CoordinateKey::from_record(&record), idx)));
                pending[idx] = Some(record);
            }
        }

        Ok(())
    }
}

fn read_error(path: &Path, error: &std::io::Error) -> anyhow::Error {
    anyhow::anyhow!("Failed to read record from '{}': {error}", path.display())
}

impl Stage for FileReader {
    fn name(&self) -> &'static str {
        "file-reader"
    }

    fn run(&mut self, io: &mut StageIo) -> Result<()> {
        let progress = ProgressTracker::new("Read alignments");

        match (self.format, self.inputs.len()) {
            (InputFormat::Sam, _) | (InputFormat::Bam, 1) => {
                self.run_sequential(io, &progress)?;
            }
            (InputFormat::Bam, _) => self.run_interleaved(io, &progress)?,
        }

        progress.log_final();
        Ok(())
    }
}
