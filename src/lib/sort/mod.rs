//! External merge sorting for alignment streams.
//!
//! The sorter buffers a fixed number of records, spills each sorted chunk
//! to a temporary file, and k-way merges the chunks back into one ordered
//! stream. Chunk sorting is parallelized two ways: whole spill jobs run on
//! the general pool while each chunk's sort is sharded across a dedicated
//! pool, so shard work is never queued behind spills.

pub mod external;
pub mod keys;

pub use external::{ExternalSorter, SortOptions, SortPools, DEFAULT_RECORDS_PER_TEMPFILE};
pub use keys::{CoordinateKey, QuerynameKey, SortKey, SortOrder};
