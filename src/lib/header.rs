//! Output-header construction: sort-order tags and @PG records.
//!
//! The sort-order tag written here is authoritative for downstream stages;
//! the sorter rewrites it before any record reaches a writer.

use anyhow::Result;
use bstr::BString;
use noodles::sam::header::record::value::map::header::tag as header_tag;
use noodles::sam::header::record::value::map::Program;
use noodles::sam::header::record::value::Map;
use noodles::sam::Header;

use crate::sort::SortOrder;

/// Rebuilds a header with the @HD SO tag set for the given sort order.
///
/// Reference sequences, read groups, programs, and comments are carried
/// over unchanged.
#[must_use]
pub fn with_sort_order(header: &Header, order: SortOrder) -> Header {
    let mut builder = Header::builder();

    for (name, seq) in header.reference_sequences() {
        builder = builder.add_reference_sequence(name.as_slice(), seq.clone());
    }
    for (id, rg) in header.read_groups() {
        builder = builder.add_read_group(id.as_slice(), rg.clone());
    }
    for (id, pg) in header.programs().as_ref() {
        builder = builder.add_program(id.as_slice(), pg.clone());
    }
    for comment in header.comments() {
        builder = builder.add_comment(comment.clone());
    }

    let hd = Map::<noodles::sam::header::record::value::map::Header>::builder()
        .insert(header_tag::SORT_ORDER, BString::from(order.header_so_tag()))
        .build()
        .expect("valid header record");

    builder.set_header(hd).build()
}

/// Appends a @PG record for this invocation.
///
/// # Errors
///
/// Returns an error if the program record cannot be built.
pub fn add_pg_record(header: Header, version: &str, command_line: &str) -> Result<Header> {
    let mut id = String::from("readforge");
    let mut suffix = 0u32;
    while header.programs().as_ref().contains_key(id.as_bytes()) {
        suffix += 1;
        id = format!("readforge.{suffix}");
    }

    use noodles::sam::header::record::value::map::program::tag;

    let program = Map::<Program>::builder()
        .insert(tag::NAME, "readforge")
        .insert(tag::VERSION, version)
        .insert(tag::COMMAND_LINE, command_line)
        .build()?;

    let mut header = header;
    header.programs_mut().add(BString::from(id.as_str()), program)?;
    Ok(header)
}
