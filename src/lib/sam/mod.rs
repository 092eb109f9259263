//! Record-level SAM/BAM utilities.
//!
//! [`record_utils`] holds CIGAR and coordinate arithmetic shared by the
//! sorter, realigner, and mate fixer. [`builder`] is the fluent test-record
//! builder used throughout unit and integration tests.

pub mod builder;
pub mod record_utils;

pub use record_utils::{
    alignment_end, compute_insert_size, five_prime_position, query_length, reference_length,
    set_mate_info,
};
