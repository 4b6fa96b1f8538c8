//! SPSS system file (`.sav`) reader and writer.

pub mod compression;
pub mod format;
mod reader;
mod writer;

pub(crate) use reader::read;
pub use writer::{FileLabel, FileLabelTooLong, SavCompression, SavSource, SavWriter};

/// System-missing value.
pub const SYSMIS: f64 = -f64::MAX;
/// Largest representable value, `HIGHEST` in missing ranges.
pub const HIGHEST: f64 = f64::MAX;
/// Second-smallest representable value, `LOWEST` in missing ranges.
pub const LOWEST: f64 = -1.797_693_134_862_315_5e308;

/// Default compression bias.
pub const BIAS: f64 = 100.0;

pub(crate) const MAGIC: &[u8; 4] = b"$FL2";
pub(crate) const MAGIC_ZLIB: &[u8; 4] = b"$FL3";

pub(crate) const HEADER_LEN: usize = 176;

/// Bytes of a string held by one segment of a very long string.
pub(crate) const SEGMENT_DATA: usize = 255;
/// Width advance per segment when splitting a very long string.
pub(crate) const SEGMENT_STRIDE: usize = 252;
/// Widest string a single variable record can hold.
pub(crate) const MAX_SHORT_STRING: usize = 255;

/// Dictionary record types.
pub(crate) mod record {
    pub const VARIABLE: i32 = 2;
    pub const VALUE_LABELS: i32 = 3;
    pub const VALUE_LABEL_VARS: i32 = 4;
    pub const DOCUMENT: i32 = 6;
    pub const EXTENSION: i32 = 7;
    pub const DICT_END: i32 = 999;
}

/// Extension record subtypes.
pub(crate) mod subtype {
    pub const MACHINE_INTEGER: i32 = 3;
    pub const MACHINE_FLOAT: i32 = 4;
    pub const DISPLAY: i32 = 11;
    pub const LONG_NAMES: i32 = 13;
    pub const VERY_LONG_STRINGS: i32 = 14;
    pub const ENCODING: i32 = 20;
    pub const LONG_STRING_LABELS: i32 = 21;
    pub const LONG_STRING_MISSING: i32 = 22;
}

/// Number of segments a string of `width` bytes is split into.
pub(crate) fn segment_count(width: usize) -> usize {
    if width <= MAX_SHORT_STRING {
        1
    } else {
        crate::io::div_ceil(width, SEGMENT_STRIDE)
    }
}

/// Declared width of segment `index` of a string of `width` bytes.
pub(crate) fn segment_width(width: usize, index: usize) -> usize {
    let n = segment_count(width);
    if n == 1 {
        width
    } else if index + 1 < n {
        MAX_SHORT_STRING
    } else {
        width - SEGMENT_STRIDE * (n - 1)
    }
}

/// 8-byte slots occupied by a variable record of `width` (0 = numeric).
pub(crate) fn slots_for_width(width: usize) -> usize {
    if width == 0 {
        1
    } else {
        crate::io::div_ceil(width, 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_special_values() {
        assert_eq!(SYSMIS.to_bits(), 0xffef_ffff_ffff_ffff);
        assert_eq!(LOWEST.to_bits(), 0xffef_ffff_ffff_fffe);
    }

    #[test]
    fn test_segments() {
        assert_eq!(segment_count(255), 1);
        assert_eq!(segment_count(300), 2);
        assert_eq!(segment_width(300, 0), 255);
        assert_eq!(segment_width(300, 1), 48);
        assert_eq!(segment_count(504), 2);
        assert_eq!(segment_count(505), 3);
        assert_eq!(slots_for_width(255), 32);
        assert_eq!(slots_for_width(0), 1);
    }
}
