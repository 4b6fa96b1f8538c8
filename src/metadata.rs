//! File-level metadata, variables and value-label sets.

use std::fmt;

use indexmap::IndexMap;

use crate::io::cursor::Endian;
use crate::io::dta::DtaRelease;
use crate::value::{Missing, MissingRule, Value, ValueData, ValueType};

/// Format family and dialect of a decoded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Dta(DtaRelease),
    Sav,
    Por,
    Sas7bdat { is_64bit: bool },
    Sas7bcat { is_64bit: bool },
    Rds { version: i32 },
    RData { version: i32 },
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dta(release) => write!(f, "Stata DTA {}", release.code()),
            Self::Sav => f.write_str("SPSS SAV"),
            Self::Por => f.write_str("SPSS POR"),
            Self::Sas7bdat { is_64bit } => {
                write!(f, "SAS7BDAT ({}-bit)", if *is_64bit { 64 } else { 32 })
            }
            Self::Sas7bcat { is_64bit } => {
                write!(f, "SAS7BCAT ({}-bit)", if *is_64bit { 64 } else { 32 })
            }
            Self::Rds { version } => write!(f, "RDS v{version}"),
            Self::RData { version } => write!(f, "RData v{version}"),
        }
    }
}

/// Compression declared by a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    /// SPSS bytecode compression of 8-byte slots.
    Bytecode,
    /// SPSS zlib compression (`$FL3`).
    Zlib,
    /// SAS run-length compression (`SASYZCRL`).
    Rle,
    /// SAS Ross data compression (`SASYZCR2`).
    Rdc,
    Gzip,
    Bzip2,
    Xz,
}

/// File-level metadata produced once per decode session.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMetadata {
    /// Number of observations that will be emitted.
    pub obs_count: usize,
    pub var_count: usize,
    pub file_label: String,
    /// Character set the file's text is converted from.
    pub encoding: String,
    pub format: FileFormat,
    pub compression: Compression,
    pub endian: Endian,
    /// Creation timestamp as stored in the file, when present.
    pub timestamp: Option<String>,
}

impl FileMetadata {
    pub fn new(format: FileFormat) -> Self {
        Self {
            obs_count: 0,
            var_count: 0,
            file_label: String::new(),
            encoding: String::from("UTF-8"),
            format,
            compression: Compression::None,
            endian: Endian::Little,
            timestamp: None,
        }
    }
}

/// A variable definition from a file's dictionary.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    /// Position in file order, starting at 0.
    pub index: usize,
    pub name: String,
    /// Long name where the format distinguishes it from `name`.
    pub long_name: Option<String>,
    pub value_type: ValueType,
    /// Display format, e.g. `%9.0g`, `F8.2`, `DATE9.`.
    pub format: String,
    pub label: String,
    /// Name of the value-label set the variable refers to.
    pub label_set: Option<String>,
    /// Storage width in bytes (strings) or 8 for doubles.
    pub storage_width: usize,
    pub missing: MissingRule,
}

impl Variable {
    pub fn new(index: usize, name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            index,
            name: name.into(),
            long_name: None,
            value_type,
            format: String::new(),
            label: String::new(),
            label_set: None,
            storage_width: 8,
            missing: MissingRule::None,
        }
    }

    /// Long name if present, short name otherwise.
    pub fn display_name(&self) -> &str {
        self.long_name.as_deref().unwrap_or(&self.name)
    }
}

/// Hashable identity of a labelled value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LabelKey {
    Number(u64),
    Missing(Missing),
    Text(String),
}

impl LabelKey {
    fn of(value: &Value) -> Self {
        match value.missing_kind() {
            m @ (Missing::System | Missing::Tagged(_)) => return LabelKey::Missing(m),
            Missing::NotMissing | Missing::User => {}
        }
        match value.data() {
            ValueData::String(s) | ValueData::LongString(s) => LabelKey::Text(s.clone()),
            _ => {
                let v = value.to_f64().unwrap_or(f64::NAN);
                // -0.0 and 0.0 label the same code
                LabelKey::Number(if v == 0.0 { 0 } else { v.to_bits() })
            }
        }
    }
}

/// A named, ordered mapping from values to display labels.
///
/// Inserting a value that is already present replaces its label and keeps its
/// original position.
#[derive(Debug, Clone, Default)]
pub struct ValueLabelSet {
    name: String,
    labels: IndexMap<LabelKey, (Value, String)>,
}

impl ValueLabelSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert(&mut self, value: Value, label: impl Into<String>) {
        let key = LabelKey::of(&value);
        self.labels.insert(key, (value, label.into()));
    }

    pub fn get(&self, value: &Value) -> Option<&str> {
        self.labels
            .get(&LabelKey::of(value))
            .map(|(_, label)| label.as_str())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Value, &str)> {
        self.labels.values().map(|(v, l)| (v, l.as_str()))
    }
}
