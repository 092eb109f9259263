//! Known-indel variant feed for the realigner.
//!
//! Reads a VCF of known variants, keeps the indel-type records, and exposes
//! them as simple typed sites resolved against the stream header's
//! reference dictionary. Non-indel variants and variants on contigs absent
//! from the dictionary are skipped.

use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, warn};
use noodles::sam::Header;
use noodles::vcf;

use crate::locus::GenomeLoc;

/// One known indel site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownIndel {
    /// Locus of the variant's anchor base.
    pub loc: GenomeLoc,
    /// True for insertions, false for deletions.
    pub is_insertion: bool,
    /// Inserted or deleted length in bases.
    pub length: usize,
    /// Inserted bases (empty for deletions).
    pub bases: Vec<u8>,
}

impl KnownIndel {
    /// True when the site's event footprint overlaps `interval`.
    ///
    /// Deletions occupy `length` reference bases after the anchor;
    /// insertions sit between two reference bases at the anchor.
    #[must_use]
    pub fn overlaps(&self, interval: &GenomeLoc) -> bool {
        let footprint = if self.is_insertion {
            GenomeLoc::new(self.loc.contig, self.loc.start, self.loc.stop)
        } else {
            GenomeLoc::new(self.loc.contig, self.loc.start, self.loc.stop + self.length as u32)
        };
        footprint.overlaps(interval)
    }
}

/// Loads the indel records from a VCF.
///
/// The first alternate allele decides the type: longer than the reference
/// allele is an insertion, shorter a deletion, equal lengths are skipped.
///
/// # Errors
///
/// Returns open/parse failures; malformed individual records are skipped
/// with a warning.
pub fn load_known_indels<P: AsRef<Path>>(path: P, header: &Header) -> Result<Vec<KnownIndel>> {
    let path = path.as_ref();
    let mut reader = vcf::io::reader::Builder::default()
        .build_from_path(path)
        .with_context(|| format!("Failed to open known-sites VCF '{}'", path.display()))?;
    let vcf_header = reader.read_header().context("Failed to read VCF header")?;

    let mut sites = Vec::new();
    let mut skipped_contigs = 0usize;

    for result in reader.record_bufs(&vcf_header) {
        let record = result?;

        let Some(contig) = header
            .reference_sequences()
            .get_index_of(record.reference_sequence_name().as_bytes())
        else {
            skipped_contigs += 1;
            continue;
        };

        let Some(start) = record.variant_start().map(usize::from) else {
            warn!("Skipping known-sites record without a position");
            continue;
        };

        let ref_len = record.reference_bases().len();
        let Some(alt) = record.alternate_bases().as_ref().iter().next() else {
            continue;
        };
        let alt_len = alt.len();
        if ref_len == alt_len || ref_len == 0 || alt_len == 0 {
            continue;
        }

        let loc = GenomeLoc::new(contig, start as u32, start as u32);
        if alt_len > ref_len {
            sites.push(KnownIndel {
                loc,
                is_insertion: true,
                length: alt_len - ref_len,
                bases: alt.as_bytes()[ref_len..].to_ascii_uppercase(),
            });
        } else {
            sites.push(KnownIndel {
                loc,
                is_insertion: false,
                length: ref_len - alt_len,
                bases: Vec::new(),
            });
        }
    }

    if skipped_contigs > 0 {
        warn!("Skipped {skipped_contigs} known-sites records on contigs not in the header");
    }
    debug!("Loaded {} known indel sites from '{}'", sites.len(), path.display());

    Ok(sites)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sam::builder::test_header;
    use std::io::Write;

    const VCF: &str = "\
##fileformat=VCFv4.2
##contig=<ID=chr1,length=10000>
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO
chr1\t1049\t.\tA\tAT\t.\t.\t.
chr1\t2000\t.\tACGT\tA\t.\t.\t.
chr1\t3000\t.\tG\tC\t.\t.\t.
chrX\t100\t.\tA\tAT\t.\t.\t.
";

    fn load() -> Vec<KnownIndel> {
        let mut file = tempfile::NamedTempFile::with_suffix(".vcf").unwrap();
        file.write_all(VCF.as_bytes()).unwrap();
        load_known_indels(file.path(), &test_header(&[("chr1", 10_000)])).unwrap()
    }

    #[test]
    fn test_keeps_only_indels_on_known_contigs() {
        let sites = load();
        assert_eq!(sites.len(), 2);
    }

    #[test]
    fn test_insertion_parsed() {
        let sites = load();
        let ins = &sites[0];
        assert!(ins.is_insertion);
        assert_eq!(ins.length, 1);
        assert_eq!(ins.bases, b"T");
        assert_eq!(ins.loc, GenomeLoc::new(0, 1049, 1049));
    }

    #[test]
    fn test_deletion_parsed() {
        let sites = load();
        let del = &sites[1];
        assert!(!del.is_insertion);
        assert_eq!(del.length, 3);
        assert!(del.bases.is_empty());
    }

    #[test]
    fn test_deletion_footprint_overlap() {
        let sites = load();
        let del = &sites[1]; // anchor 2000, deletes 2001-2003
        assert!(del.overlaps(&GenomeLoc::new(0, 2003, 2010)));
        assert!(!del.overlaps(&GenomeLoc::new(0, 2004, 2010)));
        assert!(del.overlaps(&GenomeLoc::new(0, 1990, 2000)));
    }
}
