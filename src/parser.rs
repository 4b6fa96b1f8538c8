//! Decode entry points.
//!
//! A [`Parser`] owns a [`Handler`] and a [`ParserConfiguration`]. Each
//! `parse_*` method runs one decode session: it opens the source, drives the
//! format decoder, checks the emitted cell count and reports any failure to
//! the handler's `error` method before returning it.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use tracing::debug;

use crate::error::{ReadStatError, Result};
use crate::handler::{Dispatcher, Handler};
use crate::io::dta::DtaReleases;
use crate::io::{dta, por, rdata, sas, sav};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Options shared by every decoder.
#[derive(Debug, Clone)]
pub struct ParserConfiguration {
    /// Character set to decode text with, overriding whatever the file
    /// declares. Accepts the usual labels (`"UTF-8"`, `"latin1"`, `"CP1252"`).
    ///
    /// Default: `None` (use the file's declaration or the format default).
    pub encoding: Option<String>,

    /// Maximum number of observations to emit. The info callback reports
    /// the capped count.
    ///
    /// Default: `None` (all rows).
    pub row_limit: Option<usize>,

    /// DTA releases the DTA decoder accepts; others fail with a parse error.
    ///
    /// Default: all releases.
    pub dta_releases: DtaReleases,
}

impl Default for ParserConfiguration {
    fn default() -> Self {
        Self {
            encoding: None,
            row_limit: None,
            dta_releases: DtaReleases::all(),
        }
    }
}

impl ParserConfiguration {
    /// Number of rows to emit for a file declaring `declared` rows.
    pub fn rows_to_emit(&self, declared: usize) -> usize {
        match self.row_limit {
            Some(limit) => declared.min(limit),
            None => declared,
        }
    }
}

// ----------------------------------------------------------------------------
// Parser
// ----------------------------------------------------------------------------

/// Callback-driven reader for every supported format.
pub struct Parser<H: Handler> {
    handler: H,
    config: ParserConfiguration,
}

pub(crate) fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(ReadStatError::Open)?;
    Ok(BufReader::new(file))
}

impl<H: Handler> Parser<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            config: ParserConfiguration::default(),
        }
    }

    /// Set configuration options.
    pub fn with_configuration(mut self, config: ParserConfiguration) -> Self {
        self.config = config;
        self
    }

    pub fn configuration(&self) -> &ParserConfiguration {
        &self.config
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

    fn open_reporting(&mut self, path: &Path) -> Result<BufReader<File>> {
        open(path).map_err(|err| {
            self.handler.error(&err.to_string());
            err
        })
    }

    /// Run one decode session and enforce the emission contract.
    fn run<F>(&mut self, decode: F) -> Result<()>
    where
        F: FnOnce(&ParserConfiguration, &mut Dispatcher<'_, H>) -> Result<()>,
    {
        let mut dispatcher = Dispatcher::new(&mut self.handler);
        let result = decode(&self.config, &mut dispatcher).and_then(|()| dispatcher.finish());
        match &result {
            Err(ReadStatError::UserAbort) => debug!("decode aborted by handler"),
            Err(err) => {
                debug!(error = %err, kind = ?err.kind(), "decode failed");
                dispatcher.error(&err.to_string());
            }
            Ok(()) => {}
        }
        result
    }

    // -- Stata ---------------------------------------------------------------

    /// Decode a Stata `.dta` file.
    pub fn parse_dta<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = self.open_reporting(path.as_ref())?;
        self.parse_dta_reader(file)
    }

    pub fn parse_dta_reader<R: Read + Seek>(&mut self, reader: R) -> Result<()> {
        self.run(|config, d| dta::read(reader, config, d))
    }

    // -- SPSS ----------------------------------------------------------------

    /// Decode an SPSS `.sav` system file.
    pub fn parse_sav<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = self.open_reporting(path.as_ref())?;
        self.parse_sav_reader(file)
    }

    pub fn parse_sav_reader<R: Read + Seek>(&mut self, reader: R) -> Result<()> {
        self.run(|config, d| sav::read(reader, config, d))
    }

    /// Decode an SPSS `.por` portable file.
    pub fn parse_por<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = self.open_reporting(path.as_ref())?;
        self.parse_por_reader(file)
    }

    pub fn parse_por_reader<R: Read + Seek>(&mut self, reader: R) -> Result<()> {
        self.run(|config, d| por::read(reader, config, d))
    }

    // -- SAS -----------------------------------------------------------------

    /// Decode a SAS `.sas7bdat` data file.
    pub fn parse_sas7bdat<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = self.open_reporting(path.as_ref())?;
        self.parse_sas7bdat_reader(file)
    }

    pub fn parse_sas7bdat_reader<R: Read + Seek>(&mut self, reader: R) -> Result<()> {
        self.run(|config, d| sas::read_sas7bdat(reader, config, d, &[]))
    }

    /// Decode a SAS data file, emitting the value labels of a format
    /// catalog in its label stage.
    pub fn parse_sas7bdat_with_catalog<P: AsRef<Path>, Q: AsRef<Path>>(
        &mut self,
        data: P,
        catalog: Q,
    ) -> Result<()> {
        let data = self.open_reporting(data.as_ref())?;
        let catalog = self.open_reporting(catalog.as_ref())?;
        self.parse_sas7bdat_with_catalog_reader(data, catalog)
    }

    pub fn parse_sas7bdat_with_catalog_reader<R: Read + Seek, C: Read + Seek>(
        &mut self,
        data: R,
        catalog: C,
    ) -> Result<()> {
        let sets = match sas::catalog_label_sets(catalog, &self.config) {
            Ok(sets) => sets,
            Err(err) => {
                self.handler.error(&err.to_string());
                return Err(err);
            }
        };
        self.run(|config, d| sas::read_sas7bdat(data, config, d, &sets))
    }

    /// Decode a SAS `.sas7bcat` format catalog. Only labels are emitted.
    pub fn parse_sas7bcat<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = self.open_reporting(path.as_ref())?;
        self.parse_sas7bcat_reader(file)
    }

    pub fn parse_sas7bcat_reader<R: Read + Seek>(&mut self, reader: R) -> Result<()> {
        self.run(|config, d| sas::read_sas7bcat(reader, config, d))
    }

    // -- R -------------------------------------------------------------------

    /// Decode an `.rds` file holding a single data frame, emitting its
    /// columns in row-major order.
    pub fn parse_rds<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = self.open_reporting(path.as_ref())?;
        self.parse_rds_reader(file)
    }

    pub fn parse_rds_reader<R: Read + Seek>(&mut self, reader: R) -> Result<()> {
        self.run(|config, d| rdata::read_rds_rows(reader, config, d))
    }
}
