//! SPSS print/write format specifications.
//!
//! A format is packed into an `i32` as `type << 16 | width << 8 | decimals`.

/// Format type codes and their names.
const FORMAT_NAMES: &[(u8, &str)] = &[
    (1, "A"),
    (2, "AHEX"),
    (3, "COMMA"),
    (4, "DOLLAR"),
    (5, "F"),
    (6, "IB"),
    (7, "PIBHEX"),
    (8, "P"),
    (9, "PIB"),
    (10, "PK"),
    (11, "RB"),
    (12, "RBHEX"),
    (15, "Z"),
    (16, "N"),
    (17, "E"),
    (20, "DATE"),
    (21, "TIME"),
    (22, "DATETIME"),
    (23, "ADATE"),
    (24, "JDATE"),
    (25, "DTIME"),
    (26, "WKDAY"),
    (27, "MONTH"),
    (28, "MOYR"),
    (29, "QYR"),
    (30, "WKYR"),
    (31, "PCT"),
    (32, "DOT"),
    (33, "CCA"),
    (34, "CCB"),
    (35, "CCC"),
    (36, "CCD"),
    (37, "CCE"),
    (38, "EDATE"),
    (39, "SDATE"),
    (40, "MTIME"),
    (41, "YMDHMS"),
];

pub const TYPE_A: u8 = 1;
pub const TYPE_F: u8 = 5;

/// A decoded format specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub format_type: u8,
    pub width: u8,
    pub decimals: u8,
}

impl Format {
    pub fn unpack(packed: i32) -> Self {
        Self {
            format_type: ((packed >> 16) & 0xFF) as u8,
            width: ((packed >> 8) & 0xFF) as u8,
            decimals: (packed & 0xFF) as u8,
        }
    }

    pub fn pack(self) -> i32 {
        i32::from(self.format_type) << 16 | i32::from(self.width) << 8 | i32::from(self.decimals)
    }

    /// Default format for a numeric or string variable of `width` bytes.
    pub fn default_for(is_string: bool, width: usize) -> Self {
        if is_string {
            Self {
                format_type: TYPE_A,
                width: width.min(255) as u8,
                decimals: 0,
            }
        } else {
            Self {
                format_type: TYPE_F,
                width: 8,
                decimals: 2,
            }
        }
    }

    fn name(self) -> Option<&'static str> {
        FORMAT_NAMES
            .iter()
            .find(|(code, _)| *code == self.format_type)
            .map(|(_, name)| *name)
    }

    /// Parse a format like `F8.2`, `A20` or `DATE11`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim().to_ascii_uppercase();
        let split = text.find(|c: char| c.is_ascii_digit())?;
        let (name, rest) = text.split_at(split);
        let format_type = FORMAT_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(code, _)| *code)?;
        let (width, decimals) = match rest.split_once('.') {
            Some((w, d)) if d.is_empty() => (w.parse().ok()?, 0),
            Some((w, d)) => (w.parse().ok()?, d.parse().ok()?),
            None => (rest.parse().ok()?, 0),
        };
        Some(Self {
            format_type,
            width,
            decimals,
        })
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Some(name) = self.name() else {
            return Ok(());
        };
        if self.decimals > 0 {
            write!(f, "{name}{}.{}", self.width, self.decimals)
        } else {
            write!(f, "{name}{}", self.width)
        }
    }
}
