//! # readstat
//!
//! A pure Rust library for reading statistical data files from Stata, SPSS,
//! SAS and R, and for writing SPSS system files.
//!
//! Decoding is callback-driven: a [`Parser`] streams file metadata,
//! variable descriptions, cell values and value labels into a [`Handler`]
//! in a fixed order, without materializing the whole table.
//!
//! ## Features
//!
//! - Stata `.dta`, releases 104 through 118
//! - SPSS `.sav` (uncompressed, bytecode and zlib) and `.por`
//! - SAS `.sas7bdat` (RLE and RDC compression) and `.sas7bcat` catalogs
//! - R `.rds` and `.RData` data frames, plain or gzip-compressed
//! - SPSS `.sav` writing through [`SavWriter`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::ops::ControlFlow;
//! use readstat::{Handler, Parser, Value};
//!
//! struct Sum(f64);
//!
//! impl Handler for Sum {
//!     fn value(&mut self, _obs: usize, _var: usize, value: &Value) -> ControlFlow<()> {
//!         if !value.is_missing() {
//!             self.0 += value.to_f64().unwrap_or(0.0);
//!         }
//!         ControlFlow::Continue(())
//!     }
//! }
//!
//! let mut parser = Parser::new(Sum(0.0));
//! parser.parse_dta("auto.dta")?;
//! println!("total: {}", parser.handler().0);
//! # Ok::<(), readstat::ReadStatError>(())
//! ```
//!
//! ## Emission order
//!
//! - `info` once, after the signature checks out
//! - `variable` once per variable, in index order
//! - `value` for every cell, row-major
//! - `value_label` for every entry of every label set
//!
//! Any callback may return `ControlFlow::Break(())` to stop the decode,
//! which then fails with [`ErrorKind::UserAbort`].

#![allow(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod handler;
pub mod io;
pub mod metadata;
pub mod parser;
pub mod value;

pub use error::{ErrorKind, ReadStatError, Result};
pub use handler::{Handler, NullHandler};
pub use metadata::{Compression, FileFormat, FileMetadata, ValueLabelSet, Variable};
pub use parser::{Parser, ParserConfiguration};
pub use value::{Missing, MissingRule, Value, ValueData, ValueType};

pub use io::charset::Charset;
pub use io::cursor::Endian;
pub use io::dta::{DtaRelease, DtaReleases};
pub use io::rdata::{ColumnClass, ColumnData, RColumn, RDataHandler, RDataParser};
pub use io::sav::{FileLabel, FileLabelTooLong, SavCompression, SavSource, SavWriter};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
