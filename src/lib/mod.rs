#![deny(unsafe_code)]
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args
)]

//! # readforge - streaming read-processing engine
//!
//! readforge moves sequencing alignments through chained pipeline stages:
//! a file reader, an external merge sorter, and a local realigner whose
//! output passes through a constrained mate-fixing writer. Stages run on
//! their own threads connected by bounded queues; the sorter and realigner
//! spread their heavy work over shared thread pools.
//!
//! ## Module map
//!
//! - [`pipeline`] - stage abstraction, inter-stage queues, fan-out
//! - [`reader`] - SAM/BAM input stage with format autodetection
//! - [`sort`] - external merge sort (chunk, spill, k-way merge)
//! - [`realign`] - indel realignment with consensus scoring
//! - [`matefix`] - coordinate-ordered window with mate repair
//! - [`thread_pool`] - FIFO job pools backing internal parallelism
//! - [`bam_io`], [`reference`][mod@reference], [`known_sites`],
//!   [`intervals`] - I/O collaborators
//! - [`locus`], [`sam`] - coordinate and record arithmetic

pub mod bam_io;
pub mod errors;
pub mod header;
pub mod intervals;
pub mod known_sites;
pub mod locus;
pub mod matefix;
pub mod pipeline;
pub mod progress;
pub mod reader;
pub mod realign;
pub mod reference;
pub mod sam;
pub mod sort;
pub mod thread_pool;
pub mod validation;

pub use errors::{ReadforgeError, Result};
