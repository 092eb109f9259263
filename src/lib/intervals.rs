//! Target-interval list parsing for the realigner.
//!
//! Accepts the common `contig:start-stop` interval format, one per line,
//! with `contig:pos` for single bases and `#`/`@`-prefixed lines skipped.
//! Contig names are resolved against the stream header's reference
//! dictionary; intervals are returned sorted in coordinate order.

use std::io::BufRead;
use std::path::Path;

use anyhow::{bail, Context, Result};
use noodles::sam::Header;

use crate::locus::GenomeLoc;

/// Parses one interval line against the header's dictionary.
fn parse_line(line: &str, header: &Header) -> Result<GenomeLoc> {
    let (contig_name, range) = match line.split_once(':') {
        Some((name, range)) => (name, Some(range)),
        None => (line, None),
    };

    let contig = header
        .reference_sequences()
        .get_index_of(contig_name.as_bytes())
        .with_context(|| format!("Interval contig '{contig_name}' is not in the header"))?;

    let (start, stop) = match range {
        None => {
            let len = header
                .reference_sequences()
                .get_index(contig)
                .map(|(_, seq)| usize::from(seq.length()) as u32)
                .unwrap_or(u32::MAX);
            (1, len)
        }
        Some(range) => match range.split_once('-') {
            Some((start, stop)) => (
                start.trim().parse().with_context(|| format!("Bad interval start '{start}'"))?,
                stop.trim().parse().with_context(|| format!("Bad interval stop '{stop}'"))?,
            ),
            None => {
                let pos: u32 =
                    range.trim().parse().with_context(|| format!("Bad interval '{range}'"))?;
                (pos, pos)
            }
        },
    };

    if start == 0 || stop < start {
        bail!("Interval '{line}' is not a valid 1-based range");
    }

    Ok(GenomeLoc::new(contig, start, stop))
}

/// Reads an interval list file, returning intervals in coordinate order.
///
/// # Errors
///
/// Returns parse errors naming the offending line.
pub fn load_intervals<P: AsRef<Path>>(path: P, header: &Header) -> Result<Vec<GenomeLoc>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open intervals file '{}'", path.display()))?;

    let mut intervals = Vec::new();
    for (number, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            continue;
        }
        let interval = parse_line(line, header)
            .with_context(|| format!("{}:{}", path.display(), number + 1))?;
        intervals.push(interval);
    }

    intervals.sort();
    Ok(intervals)
}
