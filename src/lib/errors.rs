//! Typed error kinds for readforge operations.
//!
//! Most plumbing uses `anyhow`; the variants here exist where callers need to
//! branch on the kind or map it to a distinct process exit code (format
//! detection failures are fatal with their own code).

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for readforge operations.
pub type Result<T> = std::result::Result<T, ReadforgeError>;

/// Error type for readforge operations.
#[derive(Error, Debug)]
pub enum ReadforgeError {
    /// The leading bytes of an input matched no supported format.
    #[error("Could not detect the format of '{path}' (expected SAM or BAM)")]
    FormatUnknown {
        /// Path of the offending input.
        path: PathBuf,
    },

    /// Inputs in one batch disagree on format.
    #[error("Input '{path}' is {found}, but earlier inputs are {expected}; mixed-format input is not supported")]
    FormatMismatch {
        /// Path of the offending input.
        path: PathBuf,
        /// Format of the offending input.
        found: &'static str,
        /// Format established by the first input.
        expected: &'static str,
    },

    /// Multiple binary inputs carry conflicting headers.
    #[error("BAM input '{path}' has a header that conflicts with the first input")]
    HeaderConflict {
        /// Path of the offending input.
        path: PathBuf,
    },

    /// A reference window lookup fell outside the loaded sequences.
    #[error("Reference sequence '{name}' not found or window {start}-{stop} out of range")]
    ReferenceMissing {
        /// Contig name as requested.
        name: String,
        /// 1-based window start.
        start: usize,
        /// 1-based window stop.
        stop: usize,
    },

    /// An interval collected more reads than the realigner allows.
    #[error("Interval {interval} holds {count} reads (limit {limit}); passing through uncleaned")]
    IntervalExhausted {
        /// Display form of the interval.
        interval: String,
        /// Number of reads collected.
        count: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReadforgeError {
    /// Process exit code for this error. Format problems are distinguishable
    /// from ordinary failures so drivers can tell them apart.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            ReadforgeError::FormatUnknown { .. } | ReadforgeError::FormatMismatch { .. } => 2,
            _ => 1,
        }
    }
}
