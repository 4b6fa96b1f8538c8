//! SAS data files (`.sas7bdat`) and format catalogs (`.sas7bcat`).
//!
//! Both share a header and a page structure. A data file stores its
//! dictionary in subheaders on metadata pages and its rows on data or mixed
//! pages, optionally compressed row by row. A catalog stores value-label
//! formats in chained blocks located through an index record.

mod bcat;
mod bdat;
pub mod compression;
mod header;

pub(crate) use bcat::{catalog_label_sets, read_sas7bcat};
pub(crate) use bdat::read_sas7bdat;
#[doc(hidden)]
pub use header::build_header;

use crate::value::{Missing, Value, ValueData};

/// Page types (`page_type & PAGE_TYPE_MASK`).
pub(crate) mod page {
    pub const META: u16 = 0x0000;
    pub const DATA: u16 = 0x0100;
    pub const MIX: u16 = 0x0200;
    pub const AMD: u16 = 0x0400;
    pub const TYPE_MASK: u16 = 0x0F00;
    /// Set on pages holding deleted or compressed-away content.
    pub const COMP: u16 = 0x9000;
}

/// Magic byte 15 of a data file.
pub const KIND_DATA: u8 = header::KIND_DATA;
/// Magic byte 15 of a catalog.
pub const KIND_CATALOG: u8 = header::KIND_CATALOG;

/// Convert a SAS double, classifying the NaN payloads SAS uses for `.`,
/// `._` and `.A` through `.Z`.
pub(crate) fn numeric_value(v: f64) -> Value {
    if !v.is_nan() {
        return Value::double(v);
    }
    let tag = !((v.to_bits() >> 40) & 0xFF) as u8;
    Value::new(ValueData::Double(v), missing_for_tag(tag))
}

/// Missing kind for a stored tag byte: 0 is `._`, 2 through 27 are `.A`
/// through `.Z`.
pub(crate) fn missing_for_tag(tag: u8) -> Missing {
    match tag {
        0 => Missing::Tagged('_'),
        2..=0x1B => Missing::Tagged(char::from(b'A' + (tag - 2))),
        b'A'..=b'Z' | b'_' => Missing::Tagged(char::from(tag)),
        _ => Missing::System,
    }
}

/// Bit pattern SAS writes for a missing value with `tag`
/// (`None` for the plain `.`).
pub fn missing_bits(tag: Option<char>) -> u64 {
    let code: u8 = match tag {
        None => 1,
        Some('_') => 0,
        Some(c @ 'A'..='Z') => c as u8 - b'A' + 2,
        Some(_) => 1,
    };
    0xFFFF_0000_0000_0000 | (u64::from(!code) << 40)
}
