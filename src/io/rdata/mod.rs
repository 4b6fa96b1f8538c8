//! R workspace (`.RData`) and single-object (`.rds`) files.
//!
//! R serializes column by column. [`RDataParser`] hands whole columns to an
//! [`RDataHandler`]; [`Parser::parse_rds`](crate::Parser::parse_rds)
//! transposes a data frame into the row-major value stream instead.

mod reader;
mod sexp;

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::ops::ControlFlow;
use std::path::Path;

use tracing::debug;

use crate::error::{ReadStatError, Result};
use crate::parser::{open, ParserConfiguration};

pub(crate) use reader::read_rds_rows;
#[doc(hidden)]
pub use sexp::build::XdrWriter;

/// Column storage as handed to [`RDataHandler::column`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColumnData<'a> {
    /// Logical vector; `NA` is `i32::MIN`.
    Logical(&'a [i32]),
    /// Integer vector or factor codes; `NA` is `i32::MIN`.
    Integer(&'a [i32]),
    /// Double vector; `NA` and `NaN` are NaN payloads.
    Real(&'a [f64]),
    /// Character vector of `len` elements, delivered through
    /// [`RDataHandler::text_value`].
    Text { len: usize },
}

impl ColumnData<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::Logical(v) | Self::Integer(v) => v.len(),
            Self::Real(v) => v.len(),
            Self::Text { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// R class of a column that changes how its numbers read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnClass {
    #[default]
    Plain,
    /// Integer codes into the levels, reported as value labels.
    Factor,
    /// Days since 1970-01-01.
    Date,
    /// Seconds since 1970-01-01 UTC.
    DateTime,
}

/// One column of a data frame.
#[derive(Debug, Clone, Copy)]
pub struct RColumn<'a> {
    pub index: usize,
    pub data: ColumnData<'a>,
    pub class: ColumnClass,
}

/// Receiver of column-oriented decode events.
///
/// For each data frame: `table` (workspaces only), then per column
/// `column`, its `text_value`s and its `value_label`s, then one
/// `column_name` per column.
pub trait RDataHandler {
    fn table(&mut self, _name: &str) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn column(&mut self, _column: &RColumn<'_>) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn column_name(&mut self, _name: &str, _index: usize) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Element `index` of the current character column; `None` is `NA`.
    fn text_value(&mut self, _value: Option<&str>, _index: usize) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Level `code` (1-based) of the factor in column `index`.
    fn value_label(&mut self, _code: i32, _label: &str, _index: usize) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn error(&mut self, _message: &str) {}
}

impl<H: RDataHandler + ?Sized> RDataHandler for &mut H {
    fn table(&mut self, name: &str) -> ControlFlow<()> {
        (**self).table(name)
    }

    fn column(&mut self, column: &RColumn<'_>) -> ControlFlow<()> {
        (**self).column(column)
    }

    fn column_name(&mut self, name: &str, index: usize) -> ControlFlow<()> {
        (**self).column_name(name, index)
    }

    fn text_value(&mut self, value: Option<&str>, index: usize) -> ControlFlow<()> {
        (**self).text_value(value, index)
    }

    fn value_label(&mut self, code: i32, label: &str, index: usize) -> ControlFlow<()> {
        (**self).value_label(code, label, index)
    }

    fn error(&mut self, message: &str) {
        (**self).error(message)
    }
}

/// Column-oriented reader for R files.
pub struct RDataParser<H: RDataHandler> {
    handler: H,
    config: ParserConfiguration,
}

impl<H: RDataHandler> RDataParser<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            config: ParserConfiguration::default(),
        }
    }

    /// Set configuration options. Only `encoding` applies here.
    pub fn with_configuration(mut self, config: ParserConfiguration) -> Self {
        self.config = config;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    fn report(&mut self, result: Result<()>) -> Result<()> {
        match &result {
            Err(ReadStatError::UserAbort) => debug!("decode aborted by handler"),
            Err(err) => self.handler.error(&err.to_string()),
            Ok(()) => {}
        }
        result
    }

    fn open_reporting(&mut self, path: &Path) -> Result<BufReader<File>> {
        open(path).map_err(|err| {
            self.handler.error(&err.to_string());
            err
        })
    }

    /// Decode a workspace: one `table` per data frame it holds. A
    /// single-object `.rds` stream is accepted too and never calls `table`.
    pub fn parse_rdata<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = self.open_reporting(path.as_ref())?;
        self.parse_rdata_reader(file)
    }

    pub fn parse_rdata_reader<R: Read + Seek>(&mut self, reader: R) -> Result<()> {
        let result = reader::read_columns(reader, &self.config, &mut self.handler, true);
        self.report(result)
    }

    /// Decode a single data frame saved with `saveRDS`; `table` is not called.
    pub fn parse_rds<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = self.open_reporting(path.as_ref())?;
        self.parse_rds_reader(file)
    }

    pub fn parse_rds_reader<R: Read + Seek>(&mut self, reader: R) -> Result<()> {
        let result = reader::read_columns(reader, &self.config, &mut self.handler, false);
        self.report(result)
    }
}
