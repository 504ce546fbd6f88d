//! Decoders for administrative tool output.

#[cfg(any(windows, test))]
pub mod format_list;
pub mod ipset_xml;

#[cfg(any(windows, test))]
pub use format_list::{parse_records, Record};
pub use ipset_xml::parse_members;
