//! Character-set normalization.
//!
//! Maps the encoding names and numeric code pages that the formats declare
//! onto `encoding_rs` encodings and converts text to UTF-8. Unknown
//! declarations are reported as `UnsupportedCharset`.

use ahash::AHashMap;
use encoding_rs::Encoding;
use once_cell::sync::Lazy;

use crate::error::{ReadStatError, Result};

use super::cursor::trim_field;

/// Encoding names used by SAS, Stata and SPSS that WHATWG labels do not cover.
static ALIASES: Lazy<AHashMap<&'static str, &'static Encoding>> = Lazy::new(|| {
    let groups: [(&[&str], &'static Encoding); 17] = [
        (&["cp1252", "wlatin1", "latin1", "iso-8859-1", "iso8859-1"], encoding_rs::WINDOWS_1252),
        (&["cp1250", "wlatin2"], encoding_rs::WINDOWS_1250),
        (&["cp1251", "wcyrillic"], encoding_rs::WINDOWS_1251),
        (&["cp1253", "wgreek"], encoding_rs::WINDOWS_1253),
        (&["cp1254", "wturkish"], encoding_rs::WINDOWS_1254),
        (&["cp1255", "whebrew"], encoding_rs::WINDOWS_1255),
        (&["cp1256", "warabic"], encoding_rs::WINDOWS_1256),
        (&["cp1257", "wbaltic"], encoding_rs::WINDOWS_1257),
        (&["cp1258", "wvietnamese"], encoding_rs::WINDOWS_1258),
        (&["cp874", "pcthai"], encoding_rs::WINDOWS_874),
        (&["cp932", "sjis", "ms932"], encoding_rs::SHIFT_JIS),
        (&["cp936", "ms936"], encoding_rs::GBK),
        (&["cp949", "ms949"], encoding_rs::EUC_KR),
        (&["cp950", "ms950"], encoding_rs::BIG5),
        (&["ascii", "us-ascii", "ansi_x3.4-1968"], encoding_rs::WINDOWS_1252),
        (&["utf8", "utf-8"], encoding_rs::UTF_8),
        (&["koi8r"], encoding_rs::KOI8_R),
    ];
    groups
        .iter()
        .flat_map(|(names, encoding)| names.iter().map(move |name| (*name, *encoding)))
        .collect()
});

/// A resolved source character set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charset {
    encoding: &'static Encoding,
}

impl Charset {
    pub fn utf8() -> Self {
        Self::from_encoding(encoding_rs::UTF_8)
    }

    pub fn windows_1252() -> Self {
        Self::from_encoding(encoding_rs::WINDOWS_1252)
    }

    pub fn from_encoding(encoding: &'static Encoding) -> Self {
        Self { encoding }
    }

    /// Resolve an encoding name as written in a file header
    /// (case-insensitive, with the aliases the statistics packages use).
    pub fn for_label(label: &str) -> Result<Self> {
        let trimmed = label.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        let normalized = trimmed.to_ascii_lowercase();
        let alias = ALIASES.get(normalized.as_str()).copied();
        alias
            .or_else(|| Encoding::for_label(normalized.as_bytes()))
            .map(Self::from_encoding)
            .ok_or_else(|| ReadStatError::UnsupportedCharset(trimmed.to_string()))
    }

    /// Resolve a Windows/IANA numeric code page (SPSS machine-integer record).
    pub fn for_code_page(code_page: i32) -> Result<Self> {
        let encoding = match code_page {
            // 7- and 8-bit ASCII as declared by old SPSS releases
            2 | 3 | 20127 | 1252 | 28591 => encoding_rs::WINDOWS_1252,
            874 => encoding_rs::WINDOWS_874,
            932 => encoding_rs::SHIFT_JIS,
            936 => encoding_rs::GBK,
            949 => encoding_rs::EUC_KR,
            950 => encoding_rs::BIG5,
            866 => encoding_rs::IBM866,
            1250 => encoding_rs::WINDOWS_1250,
            1251 => encoding_rs::WINDOWS_1251,
            1253 => encoding_rs::WINDOWS_1253,
            1254 => encoding_rs::WINDOWS_1254,
            1255 => encoding_rs::WINDOWS_1255,
            1256 => encoding_rs::WINDOWS_1256,
            1257 => encoding_rs::WINDOWS_1257,
            1258 => encoding_rs::WINDOWS_1258,
            20866 => encoding_rs::KOI8_R,
            21866 => encoding_rs::KOI8_U,
            28592 => encoding_rs::ISO_8859_2,
            28593 => encoding_rs::ISO_8859_3,
            28594 => encoding_rs::ISO_8859_4,
            28595 => encoding_rs::ISO_8859_5,
            28596 => encoding_rs::ISO_8859_6,
            28597 => encoding_rs::ISO_8859_7,
            28598 => encoding_rs::ISO_8859_8,
            28603 => encoding_rs::ISO_8859_13,
            28605 => encoding_rs::ISO_8859_15,
            51932 => encoding_rs::EUC_JP,
            54936 => encoding_rs::GB18030,
            65001 => encoding_rs::UTF_8,
            _ => {
                return Err(ReadStatError::UnsupportedCharset(format!(
                    "code page {code_page}"
                )))
            }
        };
        Ok(Self::from_encoding(encoding))
    }

    /// Canonical name of the encoding.
    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    pub fn is_utf8(&self) -> bool {
        self.encoding == encoding_rs::UTF_8
    }

    /// Convert raw text to UTF-8. Malformed sequences become U+FFFD.
    pub fn decode(&self, bytes: &[u8]) -> String {
        if self.is_utf8() {
            return String::from_utf8_lossy(bytes).into_owned();
        }
        self.encoding
            .decode_without_bom_handling(bytes)
            .0
            .into_owned()
    }

    /// Decode a fixed-width field: cut at NUL, drop trailing blanks.
    pub fn decode_field(&self, bytes: &[u8]) -> String {
        self.decode(trim_field(bytes))
    }

    /// Convert UTF-8 text into this character set.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        if self.is_utf8() {
            return text.as_bytes().to_vec();
        }
        self.encoding.encode(text).0.into_owned()
    }
}

impl Default for Charset {
    fn default() -> Self {
        Self::utf8()
    }
}

/// Resolve the session charset: an explicit override wins over the file's
/// own declaration, which wins over the format default.
pub fn resolve(
    override_label: Option<&str>,
    declared: Option<Result<Charset>>,
    default: Charset,
) -> Result<Charset> {
    if let Some(label) = override_label {
        return Charset::for_label(label);
    }
    match declared {
        Some(result) => result,
        None => Ok(default),
    }
}
