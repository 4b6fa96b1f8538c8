//! Error types for readstat-rs
//!
//! Every failure of a decode or encode call is terminal for that call and maps
//! to exactly one [`ErrorKind`] of the closed taxonomy.

use std::fmt;
use std::io;
use thiserror::Error;

/// Closed error taxonomy shared by every decoder and the SAV writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The source could not be accessed.
    Open,
    /// I/O failure while reading.
    Read,
    /// I/O failure while writing.
    Write,
    /// Resource allocation failure.
    Malloc,
    /// A callback, provider or cancellation check requested termination.
    UserAbort,
    /// Structural violation of the expected binary layout.
    Parse,
    /// The file declares a compression scheme that is not implemented.
    UnsupportedCompression,
    /// The file declares a character encoding that cannot be converted.
    UnsupportedCharset,
    /// Declared and observed row counts disagree.
    RowCountMismatch,
    /// Declared and observed row widths disagree.
    RowWidthMismatch,
}

impl ErrorKind {
    /// Numeric code of the kind (`0` is reserved for success).
    pub fn code(self) -> i32 {
        match self {
            Self::Open => 1,
            Self::Read => 2,
            Self::Malloc => 3,
            Self::UserAbort => 4,
            Self::Parse => 5,
            Self::UnsupportedCompression => 6,
            Self::UnsupportedCharset => 7,
            Self::RowCountMismatch => 8,
            Self::RowWidthMismatch => 9,
            Self::Write => 10,
        }
    }

    /// Stable human-readable description of the kind.
    pub fn message(self) -> &'static str {
        match self {
            Self::Open => "Unable to open file",
            Self::Read => "Unable to read from file",
            Self::Write => "Unable to write data",
            Self::Malloc => "Unable to allocate memory",
            Self::UserAbort => "The parsing was aborted (callback returned non-zero value)",
            Self::Parse => "Invalid file, or file has unsupported features",
            Self::UnsupportedCompression => "File has an unsupported compression scheme",
            Self::UnsupportedCharset => "File has an unsupported character set",
            Self::RowCountMismatch => "File did not contain the expected number of rows",
            Self::RowWidthMismatch => "A row in the file was not the expected length",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Main error type for readstat-rs operations
#[derive(Debug, Error)]
pub enum ReadStatError {
    /// The file could not be opened
    #[error("Unable to open file: {0}")]
    Open(#[source] io::Error),

    /// A read failed at the given byte offset
    #[error("Unable to read from file at offset {offset}: {source}")]
    Read {
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// The sink refused bytes
    #[error("Unable to write data: {0}")]
    Write(#[source] io::Error),

    /// A declared size could not be allocated
    #[error("Unable to allocate {0} bytes")]
    Malloc(usize),

    /// A handler or provider asked to stop
    #[error("The parsing was aborted (callback returned non-zero value)")]
    UserAbort,

    /// The binary layout is not what the format requires
    #[error("Parse error: {0}")]
    Parse(String),

    /// Compression scheme not implemented
    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(String),

    /// Character set not convertible
    #[error("Unsupported character set: {0}")]
    UnsupportedCharset(String),

    /// Fewer (or more) rows than declared
    #[error("Row count mismatch: expected {expected} rows, found {actual}")]
    RowCountMismatch { expected: u64, actual: u64 },

    /// A row shorter or longer than declared
    #[error("Row width mismatch: expected {expected} bytes, found {actual}")]
    RowWidthMismatch { expected: u64, actual: u64 },

    /// A provider supplied a value whose type does not fit the variable
    #[error("Variable {var_index} expects {expected} values, provider returned {found}")]
    ValueTypeMismatch {
        var_index: usize,
        expected: &'static str,
        found: &'static str,
    },
}

impl ReadStatError {
    /// The taxonomy entry this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Open(_) => ErrorKind::Open,
            Self::Read { .. } => ErrorKind::Read,
            Self::Write(_) | Self::ValueTypeMismatch { .. } => ErrorKind::Write,
            Self::Malloc(_) => ErrorKind::Malloc,
            Self::UserAbort => ErrorKind::UserAbort,
            Self::Parse(_) => ErrorKind::Parse,
            Self::UnsupportedCompression(_) => ErrorKind::UnsupportedCompression,
            Self::UnsupportedCharset(_) => ErrorKind::UnsupportedCharset,
            Self::RowCountMismatch { .. } => ErrorKind::RowCountMismatch,
            Self::RowWidthMismatch { .. } => ErrorKind::RowWidthMismatch,
        }
    }

    /// Shorthand for a [`ReadStatError::Parse`] error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    /// Wrap an I/O error raised while reading at `offset`.
    pub fn read_at(offset: u64, source: io::Error) -> Self {
        Self::Read { offset, source }
    }
}

/// Result type alias for readstat-rs operations
pub type Result<T> = std::result::Result<T, ReadStatError>;
