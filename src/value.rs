//! Cell values and missing-value classification.
//!
//! A [`Value`] carries its own type discriminant and the missing-value
//! classification that was decided once, when the raw bytes were decoded.

use std::fmt;

/// Primitive cell types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// Fixed-width string.
    String,
    /// Single signed byte (Stata `byte`).
    Char,
    /// 16-bit integer.
    Int16,
    /// 32-bit integer.
    Int32,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// String stored outside the row (Stata strL).
    LongString,
}

impl ValueType {
    /// Whether values of this type carry text.
    pub fn is_string(self) -> bool {
        matches!(self, Self::String | Self::LongString)
    }

    /// Whether values of this type are numeric.
    pub fn is_numeric(self) -> bool {
        !self.is_string()
    }

    /// Lower-case name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Char => "char",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Float => "float",
            Self::Double => "double",
            Self::LongString => "long string",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Missing-value classification of a decoded cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Missing {
    /// A regular value.
    #[default]
    NotMissing,
    /// The format's system missing value (Stata `.`, SPSS SYSMIS, R `NA`).
    System,
    /// A tagged missing value (Stata `.a`–`.z`, SAS `.A`–`.Z` and `._`).
    Tagged(char),
    /// A value declared missing by the variable's own metadata (SPSS).
    User,
}

/// Payload of a cell; the variant is the type discriminant.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
    String(String),
    Char(i8),
    Int16(i16),
    Int32(i32),
    Float(f32),
    Double(f64),
    LongString(String),
}

/// A single decoded cell.
#[derive(Debug, Clone)]
pub struct Value {
    data: ValueData,
    missing: Missing,
}

impl Value {
    /// Create a value with an explicit classification.
    pub fn new(data: ValueData, missing: Missing) -> Self {
        Self { data, missing }
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::new(ValueData::String(s.into()), Missing::NotMissing)
    }

    pub fn long_string(s: impl Into<String>) -> Self {
        Self::new(ValueData::LongString(s.into()), Missing::NotMissing)
    }

    pub fn char(v: i8) -> Self {
        Self::new(ValueData::Char(v), Missing::NotMissing)
    }

    pub fn int16(v: i16) -> Self {
        Self::new(ValueData::Int16(v), Missing::NotMissing)
    }

    pub fn int32(v: i32) -> Self {
        Self::new(ValueData::Int32(v), Missing::NotMissing)
    }

    pub fn float(v: f32) -> Self {
        Self::new(ValueData::Float(v), Missing::NotMissing)
    }

    pub fn double(v: f64) -> Self {
        Self::new(ValueData::Double(v), Missing::NotMissing)
    }

    /// An empty payload of `value_type` flagged as missing.
    pub fn missing(value_type: ValueType, missing: Missing) -> Self {
        let data = match value_type {
            ValueType::String => ValueData::String(String::new()),
            ValueType::LongString => ValueData::LongString(String::new()),
            ValueType::Char => ValueData::Char(0),
            ValueType::Int16 => ValueData::Int16(0),
            ValueType::Int32 => ValueData::Int32(0),
            ValueType::Float => ValueData::Float(f32::NAN),
            ValueType::Double => ValueData::Double(f64::NAN),
        };
        Self::new(data, missing)
    }

    /// Re-classify this value, keeping the payload.
    pub fn with_missing(mut self, missing: Missing) -> Self {
        self.missing = missing;
        self
    }

    /// Type discriminant of the payload.
    pub fn value_type(&self) -> ValueType {
        match self.data {
            ValueData::String(_) => ValueType::String,
            ValueData::Char(_) => ValueType::Char,
            ValueData::Int16(_) => ValueType::Int16,
            ValueData::Int32(_) => ValueType::Int32,
            ValueData::Float(_) => ValueType::Float,
            ValueData::Double(_) => ValueType::Double,
            ValueData::LongString(_) => ValueType::LongString,
        }
    }

    pub fn data(&self) -> &ValueData {
        &self.data
    }

    pub fn missing_kind(&self) -> Missing {
        self.missing
    }

    /// Whether the cell holds no data. Depends only on the stored value.
    pub fn is_missing(&self) -> bool {
        self.missing != Missing::NotMissing
    }

    /// Tag of a tagged missing value.
    pub fn missing_tag(&self) -> Option<char> {
        match self.missing {
            Missing::Tagged(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_char(&self) -> Option<i8> {
        match self.data {
            ValueData::Char(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self.data {
            ValueData::Int16(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self.data {
            ValueData::Int32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self.data {
            ValueData::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.data {
            ValueData::Double(v) => Some(v),
            _ => None,
        }
    }

    /// Text of a string or long-string value.
    pub fn as_str(&self) -> Option<&str> {
        match &self.data {
            ValueData::String(s) | ValueData::LongString(s) => Some(s),
            _ => None,
        }
    }

    /// Any numeric payload widened to `f64`.
    pub fn to_f64(&self) -> Option<f64> {
        match self.data {
            ValueData::Char(v) => Some(f64::from(v)),
            ValueData::Int16(v) => Some(f64::from(v)),
            ValueData::Int32(v) => Some(f64::from(v)),
            ValueData::Float(v) => Some(f64::from(v)),
            ValueData::Double(v) => Some(v),
            ValueData::String(_) | ValueData::LongString(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.missing {
            Missing::System => return f.write_str("."),
            Missing::Tagged(c) => return write!(f, ".{c}"),
            Missing::User | Missing::NotMissing => {}
        }
        match &self.data {
            ValueData::String(s) | ValueData::LongString(s) => f.write_str(s),
            ValueData::Char(v) => write!(f, "{v}"),
            ValueData::Int16(v) => write!(f, "{v}"),
            ValueData::Int32(v) => write!(f, "{v}"),
            ValueData::Float(v) => write!(f, "{v}"),
            ValueData::Double(v) => write!(f, "{v}"),
        }
    }
}

impl PartialEq for Value {
    /// System and tagged missing values compare by type and tag only; their
    /// payload carries no information.
    fn eq(&self, other: &Self) -> bool {
        if self.missing != other.missing {
            return false;
        }
        match self.missing {
            Missing::System | Missing::Tagged(_) => self.value_type() == other.value_type(),
            Missing::NotMissing | Missing::User => self.data == other.data,
        }
    }
}

/// Missing-value declaration of a variable (SPSS style).
///
/// Up to three discrete values, or a range plus at most one discrete value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum MissingRule {
    #[default]
    None,
    Discrete(Vec<f64>),
    Range {
        low: f64,
        high: f64,
        discrete: Option<f64>,
    },
    /// Discrete string values, compared after right-trimming blanks.
    Strings(Vec<String>),
}

impl MissingRule {
    /// Classify a numeric payload against this rule.
    pub fn classify_f64(&self, v: f64) -> Missing {
        let hit = match self {
            Self::None | Self::Strings(_) => false,
            Self::Discrete(values) => values.iter().any(|&m| m == v),
            Self::Range {
                low,
                high,
                discrete,
            } => (*low <= v && v <= *high) || *discrete == Some(v),
        };
        if hit {
            Missing::User
        } else {
            Missing::NotMissing
        }
    }

    /// Classify a string payload against this rule.
    pub fn classify_str(&self, s: &str) -> Missing {
        match self {
            Self::Strings(values) if values.iter().any(|m| m.trim_end() == s.trim_end()) => {
                Missing::User
            }
            _ => Missing::NotMissing,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Discrete(v) => v.is_empty(),
            Self::Strings(v) => v.is_empty(),
            Self::Range { .. } => false,
        }
    }
}
