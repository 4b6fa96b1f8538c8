//! SPSS portable file (`.por`) reader.
//!
//! A portable file is text in 80-column lines. After a 200-byte splash and a
//! 256-byte translation table every byte is interpreted through that table,
//! which maps the file's own character set onto the fixed portable ordering.

mod reader;
mod stream;

pub(crate) use reader::read;

/// Windows-1252 character at each position of the portable ordering.
/// Unused positions hold a space.
static PORTABLE_TO_WINDOWS_1252: [u8; 256] = {
    let chars: &[u8] = b"\
        0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz .\
        <(+|&[]!$*);^-/|,%_>?`:#@'=\"  \xb1 \xb0\x86~\x96   0\xb9\xb2\xb3456789   \x97() {}\\\xa2\x95";
    let mut table = [b' '; 256];
    let mut i = 0;
    while i < chars.len() {
        table[64 + i] = chars[i];
        i += 1;
    }
    table
};

/// First position of the translation table that carries a character.
const FIRST_USED: usize = 64;

pub(crate) const LINE_LEN: usize = 80;
pub(crate) const SPLASH_LEN: usize = 200;
pub(crate) const TABLE_LEN: usize = 256;
pub(crate) const SIGNATURE: &[u8; 8] = b"SPSSPORT";

/// Record tags.
pub(crate) mod tag {
    pub const PRODUCT: u8 = b'1';
    pub const AUTHOR: u8 = b'2';
    pub const SUBPRODUCT: u8 = b'3';
    pub const VARIABLE_COUNT: u8 = b'4';
    pub const PRECISION: u8 = b'5';
    pub const WEIGHT: u8 = b'6';
    pub const VARIABLE: u8 = b'7';
    pub const MISSING: u8 = b'8';
    pub const MISSING_LO_THRU: u8 = b'9';
    pub const MISSING_THRU_HI: u8 = b'A';
    pub const MISSING_RANGE: u8 = b'B';
    pub const VARIABLE_LABEL: u8 = b'C';
    pub const VALUE_LABELS: u8 = b'D';
    pub const DOCUMENT: u8 = b'E';
    pub const DATA: u8 = b'F';
    pub const END_OF_DATA: u8 = b'Z';
}

/// Map from the file's bytes to Windows-1252, built from the file's table.
#[derive(Debug, Clone)]
pub(crate) struct TranslationTable {
    map: [Option<u8>; 256],
}

impl TranslationTable {
    /// Build from the 256 raw bytes following the splash. When one byte
    /// appears at several positions the first one wins.
    pub(crate) fn new(raw: &[u8]) -> Self {
        let mut map = [None; 256];
        for (position, &byte) in raw.iter().enumerate().skip(FIRST_USED) {
            let slot = &mut map[usize::from(byte)];
            if slot.is_none() {
                *slot = Some(PORTABLE_TO_WINDOWS_1252[position]);
            }
        }
        // line padding is always a space
        map[usize::from(b' ')].get_or_insert(b' ');
        Self { map }
    }

    pub(crate) fn translate(&self, byte: u8) -> Option<u8> {
        self.map[usize::from(byte)]
    }
}

/// Value of a base-30 digit (`0-9`, `A-T`).
pub(crate) fn base30_digit(c: u8) -> Option<u32> {
    match c {
        b'0'..=b'9' => Some(u32::from(c - b'0')),
        b'A'..=b'T' => Some(u32::from(c - b'A') + 10),
        _ => None,
    }
}

/// Portable ordering as Windows-1252 bytes, usable as an identity table.
pub fn identity_table() -> [u8; 256] {
    PORTABLE_TO_WINDOWS_1252
}
