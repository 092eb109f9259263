//! CLI command implementations.
//!
//! One submodule per subcommand:
//!
//! - [`sort`] - external merge sort by coordinate or queryname
//! - [`realign`] - local realignment around indels
//! - [`merge`] - merge multiple inputs into one stream
//! - [`view`] - format conversion / passthrough

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]

pub mod command;
pub mod common;
pub mod merge;
pub mod realign;
pub mod sort;
pub mod view;
