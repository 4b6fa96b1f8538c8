//! Binary format decoders and the SAV encoder.
//!
//! Every decoder follows the same staged state machine: signature, file
//! metadata, variable dictionary, row data, value labels. Each reports to a
//! [`Dispatcher`](crate::handler::Dispatcher) that enforces the callback
//! contract.

pub mod charset;
pub mod cursor;
pub mod dta;
pub mod por;
pub mod rdata;
pub mod sas;
pub mod sav;

use crate::error::{ReadStatError, Result};

/// Turn a nom failure into a `Parse` error naming the structure being read.
pub(crate) trait NomResultExt<T> {
    fn map_parse(self, what: &str) -> Result<T>;
}

impl<I, T> NomResultExt<(I, T)> for nom::IResult<I, T> {
    fn map_parse(self, what: &str) -> Result<(I, T)> {
        self.map_err(|err| match err {
            nom::Err::Incomplete(_) => ReadStatError::parse(format!("{what} is truncated")),
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                ReadStatError::parse(format!("malformed {what} ({:?})", e.code))
            }
        })
    }
}

/// Ceiling division for record and segment arithmetic.
pub(crate) fn div_ceil(n: usize, d: usize) -> usize {
    if d == 0 {
        0
    } else {
        n / d + usize::from(n % d != 0)
    }
}
