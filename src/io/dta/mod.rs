//! Stata DTA reader.
//!
//! Covers releases 104 through 118. Releases before 117 are a fixed binary
//! layout (header, descriptors, expansion fields, data, value labels); 117
//! and 118 wrap the sections in XML-like tags with an offset map and add
//! out-of-row strL storage.

mod reader;

pub(crate) use reader::read;

use bitflags::bitflags;

use crate::value::{Missing, ValueType};

// ----------------------------------------------------------------------------
// Releases
// ----------------------------------------------------------------------------

/// A DTA file-format release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DtaRelease {
    R104,
    R105,
    R108,
    R110,
    R111,
    R113,
    R114,
    R115,
    R117,
    R118,
}

impl DtaRelease {
    /// Every release, oldest first.
    pub const ALL: [DtaRelease; 10] = [
        Self::R104,
        Self::R105,
        Self::R108,
        Self::R110,
        Self::R111,
        Self::R113,
        Self::R114,
        Self::R115,
        Self::R117,
        Self::R118,
    ];

    /// Release number as written in the file.
    pub fn code(self) -> u16 {
        match self {
            Self::R104 => 104,
            Self::R105 => 105,
            Self::R108 => 108,
            Self::R110 => 110,
            Self::R111 => 111,
            Self::R113 => 113,
            Self::R114 => 114,
            Self::R115 => 115,
            Self::R117 => 117,
            Self::R118 => 118,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.code() == code)
    }

    /// The flag enabling this release in [`DtaReleases`].
    pub fn flag(self) -> DtaReleases {
        match self {
            Self::R104 => DtaReleases::DTA_104,
            Self::R105 => DtaReleases::DTA_105,
            Self::R108 => DtaReleases::DTA_108,
            Self::R110 => DtaReleases::DTA_110,
            Self::R111 => DtaReleases::DTA_111,
            Self::R113 => DtaReleases::DTA_113,
            Self::R114 => DtaReleases::DTA_114,
            Self::R115 => DtaReleases::DTA_115,
            Self::R117 => DtaReleases::DTA_117,
            Self::R118 => DtaReleases::DTA_118,
        }
    }

    pub fn is_xml(self) -> bool {
        self >= Self::R117
    }

    /// Whether numeric columns carry the 27 missing codes `.`, `.a`..`.z`.
    pub fn has_tagged_missing(self) -> bool {
        self >= Self::R113
    }

    /// Whether the type list uses the 251..255 numeric codes.
    pub fn has_numeric_type_codes(self) -> bool {
        self >= Self::R111
    }

    pub fn data_label_len(self) -> usize {
        match self {
            Self::R104 => 32,
            _ => 81,
        }
    }

    pub fn timestamp_len(self) -> usize {
        match self {
            Self::R104 => 0,
            _ => 18,
        }
    }

    /// Width of variable names and value-label names.
    pub fn name_len(self) -> usize {
        match self {
            Self::R104 | Self::R105 | Self::R108 => 9,
            Self::R118 => 129,
            _ => 33,
        }
    }

    pub fn format_len(self) -> usize {
        match self {
            Self::R104 => 7,
            Self::R105 | Self::R108 | Self::R110 | Self::R111 | Self::R113 => 12,
            Self::R118 => 57,
            _ => 49,
        }
    }

    pub fn variable_label_len(self) -> usize {
        match self {
            Self::R104 => 32,
            Self::R118 => 321,
            _ => 81,
        }
    }

    /// Byte width of the expansion-field length, 0 when there are none.
    pub fn expansion_len_width(self) -> usize {
        match self {
            Self::R104 => 0,
            Self::R105 | Self::R108 => 2,
            _ => 4,
        }
    }

    /// Whether value labels use the compact 8-byte-label table.
    pub fn has_old_value_labels(self) -> bool {
        self <= Self::R105
    }

    /// Character set text is stored in when the caller does not override it.
    pub fn default_encoding(self) -> &'static str {
        if self == Self::R118 {
            "UTF-8"
        } else {
            "WINDOWS-1252"
        }
    }
}

bitflags! {
    /// Set of DTA releases a parser accepts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DtaReleases: u32 {
        const DTA_104 = 0x001;
        const DTA_105 = 0x002;
        const DTA_108 = 0x004;
        const DTA_110 = 0x008;
        const DTA_111 = 0x010;
        const DTA_114 = 0x020;
        const DTA_117 = 0x040;
        const DTA_118 = 0x080;
        const DTA_113 = 0x100;
        const DTA_115 = 0x200;
    }
}

impl Default for DtaReleases {
    fn default() -> Self {
        Self::all()
    }
}

// ----------------------------------------------------------------------------
// Storage types
// ----------------------------------------------------------------------------

/// On-disk type of a DTA column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StorageType {
    Byte,
    Int,
    Long,
    Float,
    Double,
    /// Fixed-width string of the given byte width.
    Str(usize),
    /// Reference into the strL table (117+).
    StrL,
}

impl StorageType {
    /// Decode a one-byte type-list entry.
    pub(crate) fn from_byte_code(code: u8, release: DtaRelease) -> Option<Self> {
        if release.has_numeric_type_codes() {
            match code {
                251 => Some(Self::Byte),
                252 => Some(Self::Int),
                253 => Some(Self::Long),
                254 => Some(Self::Float),
                255 => Some(Self::Double),
                1..=244 => Some(Self::Str(code as usize)),
                _ => None,
            }
        } else {
            match code {
                b'b' => Some(Self::Byte),
                b'i' => Some(Self::Int),
                b'l' => Some(Self::Long),
                b'f' => Some(Self::Float),
                b'd' => Some(Self::Double),
                0x80..=0xFF => Some(Self::Str((code - 0x7F) as usize)),
                _ => None,
            }
        }
    }

    /// Decode a two-byte type-list entry (117+).
    pub(crate) fn from_xml_code(code: u16) -> Option<Self> {
        match code {
            1..=2045 => Some(Self::Str(code as usize)),
            32768 => Some(Self::StrL),
            65526 => Some(Self::Double),
            65527 => Some(Self::Float),
            65528 => Some(Self::Long),
            65529 => Some(Self::Int),
            65530 => Some(Self::Byte),
            _ => None,
        }
    }

    /// Bytes the column occupies in a row.
    pub(crate) fn width(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Int => 2,
            Self::Long | Self::Float => 4,
            Self::Double | Self::StrL => 8,
            Self::Str(n) => n,
        }
    }

    pub(crate) fn value_type(self) -> ValueType {
        match self {
            Self::Byte => ValueType::Char,
            Self::Int => ValueType::Int16,
            Self::Long => ValueType::Int32,
            Self::Float => ValueType::Float,
            Self::Double => ValueType::Double,
            Self::Str(_) => ValueType::String,
            Self::StrL => ValueType::LongString,
        }
    }
}

// ----------------------------------------------------------------------------
// Missing values
// ----------------------------------------------------------------------------

const BYTE_MISSING: i8 = 101;
const INT_MISSING: i16 = 32741;
const LONG_MISSING: i32 = 2_147_483_621;
const FLOAT_MISSING_BITS: i32 = 0x7f00_0000;
const DOUBLE_MISSING_BITS: i64 = 0x7fe0_0000_0000_0000;

/// Missing code `n` above the system-missing sentinel.
fn tagged(n: i64) -> Missing {
    match n {
        1..=26 => Missing::Tagged((b'a' + (n - 1) as u8) as char),
        _ => Missing::System,
    }
}

pub(crate) fn classify_byte(v: i8, release: DtaRelease) -> Missing {
    if release.has_tagged_missing() {
        if v >= BYTE_MISSING {
            return tagged(i64::from(v - BYTE_MISSING));
        }
    } else if v == i8::MAX {
        return Missing::System;
    }
    Missing::NotMissing
}

pub(crate) fn classify_int(v: i16, release: DtaRelease) -> Missing {
    if release.has_tagged_missing() {
        if v >= INT_MISSING {
            return tagged(i64::from(v - INT_MISSING));
        }
    } else if v == i16::MAX {
        return Missing::System;
    }
    Missing::NotMissing
}

pub(crate) fn classify_long(v: i32, release: DtaRelease) -> Missing {
    if release.has_tagged_missing() {
        if v >= LONG_MISSING {
            return tagged(i64::from(v - LONG_MISSING));
        }
    } else if v == i32::MAX {
        return Missing::System;
    }
    Missing::NotMissing
}

pub(crate) fn classify_float(v: f32, release: DtaRelease) -> Missing {
    let bits = v.to_bits() as i32;
    if bits < FLOAT_MISSING_BITS {
        return Missing::NotMissing;
    }
    if release.has_tagged_missing() {
        tagged(i64::from((bits - FLOAT_MISSING_BITS) >> 11))
    } else {
        Missing::System
    }
}

pub(crate) fn classify_double(v: f64, release: DtaRelease) -> Missing {
    let bits = v.to_bits() as i64;
    if bits < DOUBLE_MISSING_BITS {
        return Missing::NotMissing;
    }
    if release.has_tagged_missing() {
        tagged((bits - DOUBLE_MISSING_BITS) >> 40)
    } else {
        Missing::System
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_codes_roundtrip() {
        for release in DtaRelease::ALL {
            assert_eq!(DtaRelease::from_code(release.code()), Some(release));
        }
        assert_eq!(DtaRelease::from_code(116), None);
    }

    #[test]
    fn test_release_flags_match_bit_assignment() {
        assert_eq!(DtaRelease::R113.flag().bits(), 0x100);
        assert_eq!(DtaRelease::R118.flag().bits(), 0x80);
        assert!(DtaReleases::default().contains(DtaReleases::DTA_115));
    }

    #[test]
    fn test_field_widths() {
        assert_eq!(DtaRelease::R104.format_len(), 7);
        assert_eq!(DtaRelease::R113.format_len(), 12);
        assert_eq!(DtaRelease::R117.format_len(), 49);
        assert_eq!(DtaRelease::R118.format_len(), 57);
        assert_eq!(DtaRelease::R108.name_len(), 9);
        assert_eq!(DtaRelease::R110.name_len(), 33);
    }

    #[test]
    fn test_type_codes() {
        assert_eq!(
            StorageType::from_byte_code(b'd', DtaRelease::R110),
            Some(StorageType::Double)
        );
        assert_eq!(
            StorageType::from_byte_code(0x7F + 12, DtaRelease::R108),
            Some(StorageType::Str(12))
        );
        assert_eq!(
            StorageType::from_byte_code(251, DtaRelease::R114),
            Some(StorageType::Byte)
        );
        assert_eq!(StorageType::from_xml_code(32768), Some(StorageType::StrL));
        assert_eq!(StorageType::from_xml_code(3000), None);
    }

    #[test]
    fn test_integer_missing_codes() {
        let r = DtaRelease::R114;
        assert_eq!(classify_byte(100, r), Missing::NotMissing);
        assert_eq!(classify_byte(101, r), Missing::System);
        assert_eq!(classify_byte(102, r), Missing::Tagged('a'));
        assert_eq!(classify_int(32741 + 26, r), Missing::Tagged('z'));
        assert_eq!(classify_long(-5, r), Missing::NotMissing);
        assert_eq!(classify_long(2_147_483_621, r), Missing::System);
    }

    #[test]
    fn test_legacy_missing_codes() {
        let r = DtaRelease::R110;
        assert_eq!(classify_byte(101, r), Missing::NotMissing);
        assert_eq!(classify_byte(127, r), Missing::System);
        assert_eq!(classify_int(32767, r), Missing::System);
    }

    #[test]
    fn test_float_missing_codes() {
        let r = DtaRelease::R117;
        assert_eq!(classify_float(1.5, r), Missing::NotMissing);
        assert_eq!(classify_float(-1.0e30, r), Missing::NotMissing);
        assert_eq!(classify_float(f32::from_bits(0x7f00_0000), r), Missing::System);
        assert_eq!(
            classify_float(f32::from_bits(0x7f00_0800), r),
            Missing::Tagged('a')
        );
        assert_eq!(
            classify_double(f64::from_bits(0x7fe0_0000_0000_0000), r),
            Missing::System
        );
        assert_eq!(
            classify_double(f64::from_bits(0x7fe0_0200_0000_0000), r),
            Missing::Tagged('b')
        );
        assert_eq!(classify_double(-2.0, r), Missing::NotMissing);
    }
}
