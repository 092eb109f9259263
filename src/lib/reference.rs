//! Reference genome access with all sequences held in memory.
//!
//! The realigner fetches one small padded window per interval, across the
//! whole genome in coordinate order, so the whole FASTA is loaded up front
//! and shared read-only between worker threads.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::debug;
use noodles::fasta;

use crate::errors::ReadforgeError;

/// Thread-safe in-memory reference reader.
#[derive(Clone)]
pub struct ReferenceReader {
    sequences: Arc<HashMap<String, Vec<u8>>>,
}

impl ReferenceReader {
    /// Loads every sequence from a FASTA file, uppercasing bases.
    ///
    /// # Errors
    ///
    /// Returns errors from opening or parsing the FASTA.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = fasta::io::reader::Builder
            .build_from_path(path)
            .with_context(|| format!("Failed to open reference '{}'", path.display()))?;

        let mut sequences = HashMap::new();
        for result in reader.records() {
            let record = result?;
            let name = std::str::from_utf8(record.name())
                .context("Reference contig name is not UTF-8")?
                .to_string();
            let mut bases: Vec<u8> = record.sequence().as_ref().to_vec();
            bases.make_ascii_uppercase();
            sequences.insert(name, bases);
        }

        debug!("Loaded {} reference contigs into memory", sequences.len());
        Ok(Self { sequences: Arc::new(sequences) })
    }

    /// Builds a reader from in-memory sequences (test support).
    #[must_use]
    pub fn from_sequences(contigs: Vec<(String, Vec<u8>)>) -> Self {
        let mut sequences = HashMap::new();
        for (name, mut bases) in contigs {
            bases.make_ascii_uppercase();
            sequences.insert(name, bases);
        }
        Self { sequences: Arc::new(sequences) }
    }

    /// Length of a contig, if present.
    #[must_use]
    pub fn contig_length(&self, name: &str) -> Option<usize> {
        self.sequences.get(name).map(Vec::len)
    }

    /// Fetches a window, clamping it to the contig bounds.
    ///
    /// `start`/`stop` are 1-based inclusive and may exceed the contig on
    /// either side (padding near the ends); the returned pair is the bases
    /// and the clamped 1-based start they begin at.
    ///
    /// # Errors
    ///
    /// Returns [`ReadforgeError::ReferenceMissing`] when the contig is not
    /// in the reference or the clamped window is empty.
    pub fn window(
        &self,
        name: &str,
        start: i64,
        stop: i64,
    ) -> Result<(Vec<u8>, usize), ReadforgeError> {
        let missing = || ReadforgeError::ReferenceMissing {
            name: name.to_string(),
            start: start.max(0) as usize,
            stop: stop.max(0) as usize,
        };

        let sequence = self.sequences.get(name).ok_or_else(missing)?;
        let clamped_start = start.max(1) as usize;
        let clamped_stop = (stop.min(sequence.len() as i64)).max(0) as usize;
        if clamped_start > clamped_stop {
            return Err(missing());
        }

        Ok((sequence[clamped_start - 1..clamped_stop].to_vec(), clamped_start))
    }
}
