//! Character stream over the 80-column lines of a portable file.

use std::io::{self, Read, Seek};

use crate::error::{ReadStatError, Result};
use crate::io::cursor::{bounded_vec, ByteReader};

use super::{base30_digit, TranslationTable, LINE_LEN};

/// Largest base-30 scale worth computing; beyond it `powi` is 0 or infinite.
const MAX_SCALE: i64 = 400;

/// Resume point for a second pass over the data.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Mark {
    position: u64,
    column: usize,
    pad: usize,
    peeked: Option<u8>,
}

pub(crate) struct PorStream<R> {
    reader: ByteReader<R>,
    column: usize,
    /// Spaces still owed for a line that ended before column 80.
    pad: usize,
    peeked: Option<u8>,
    table: Option<TranslationTable>,
}

impl<R: Read + Seek> PorStream<R> {
    pub(crate) fn new(reader: ByteReader<R>) -> Self {
        Self {
            reader,
            column: 0,
            pad: 0,
            peeked: None,
            table: None,
        }
    }

    pub(crate) fn set_table(&mut self, table: TranslationTable) {
        self.table = Some(table);
    }

    /// Next byte with line ends removed and short lines padded.
    pub(crate) fn next_raw(&mut self) -> Result<Option<u8>> {
        loop {
            if self.pad > 0 {
                self.pad -= 1;
                return Ok(Some(b' '));
            }
            let mut byte = [0u8; 1];
            if !self.reader.read_exact_or_eof(&mut byte)? {
                return Ok(None);
            }
            match byte[0] {
                b'\r' => continue,
                b'\n' => {
                    self.pad = LINE_LEN.saturating_sub(self.column);
                    self.column = 0;
                }
                raw => {
                    self.column += 1;
                    return Ok(Some(raw));
                }
            }
        }
    }

    /// Fill `buf` with raw bytes; `false` if the stream ends first.
    pub(crate) fn read_raw(&mut self, buf: &mut [u8]) -> Result<bool> {
        for slot in buf.iter_mut() {
            match self.next_raw()? {
                Some(b) => *slot = b,
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    fn translate(&self, raw: u8) -> Result<u8> {
        match &self.table {
            None => Ok(raw),
            Some(table) => table.translate(raw).ok_or_else(|| {
                ReadStatError::UnsupportedCharset(format!(
                    "byte 0x{raw:02x} at offset {} is not in the translation table",
                    self.reader.position()
                ))
            }),
        }
    }

    /// Next translated character, or `None` at end of file.
    pub(crate) fn next_char(&mut self) -> Result<Option<u8>> {
        if let Some(c) = self.peeked.take() {
            return Ok(Some(c));
        }
        match self.next_raw()? {
            Some(raw) => self.translate(raw).map(Some),
            None => Ok(None),
        }
    }

    pub(crate) fn peek_char(&mut self) -> Result<Option<u8>> {
        if self.peeked.is_none() {
            self.peeked = self.next_char()?;
        }
        Ok(self.peeked)
    }

    pub(crate) fn expect_char(&mut self) -> Result<u8> {
        self.next_char()?.ok_or_else(|| {
            ReadStatError::read_at(
                self.reader.position(),
                io::Error::new(io::ErrorKind::UnexpectedEof, "portable file ends mid-record"),
            )
        })
    }

    /// Skip blanks and peek at the next significant character.
    pub(crate) fn peek_significant(&mut self) -> Result<Option<u8>> {
        while self.peek_char()? == Some(b' ') {
            self.peeked = None;
        }
        self.peek_char()
    }

    /// A base-30 number terminated by `/`; `None` for the missing marker `*.`.
    pub(crate) fn read_number(&mut self) -> Result<Option<f64>> {
        let mut c = self.expect_char()?;
        while c == b' ' {
            c = self.expect_char()?;
        }
        if c == b'*' {
            self.expect_char()?;
            return Ok(None);
        }
        let negative = c == b'-';
        if negative {
            c = self.expect_char()?;
        }

        let mut mantissa = 0f64;
        let mut digits = 0u64;
        let mut fraction_digits = 0i64;
        let mut in_fraction = false;
        loop {
            if let Some(d) = base30_digit(c) {
                mantissa = mantissa * 30.0 + f64::from(d);
                digits += 1;
                if in_fraction {
                    fraction_digits = fraction_digits.saturating_add(1);
                }
            } else if c == b'.' && !in_fraction {
                in_fraction = true;
            } else {
                break;
            }
            c = self.expect_char()?;
        }
        if digits == 0 {
            return Err(ReadStatError::parse(format!(
                "number without digits near offset {}",
                self.reader.position()
            )));
        }

        let mut exponent = 0i64;
        if c == b'+' || c == b'-' {
            let negative_exponent = c == b'-';
            c = self.expect_char()?;
            while let Some(d) = base30_digit(c) {
                exponent = exponent * 30 + i64::from(d);
                if exponent > i64::from(i32::MAX) {
                    return Err(ReadStatError::parse(format!(
                        "number exponent out of range near offset {}",
                        self.reader.position()
                    )));
                }
                c = self.expect_char()?;
            }
            if negative_exponent {
                exponent = -exponent;
            }
        }
        if c != b'/' {
            return Err(ReadStatError::parse(format!(
                "number not terminated by '/' near offset {}",
                self.reader.position()
            )));
        }
        let scale = (exponent - fraction_digits).clamp(-MAX_SCALE, MAX_SCALE) as i32;
        let value = if scale < 0 {
            mantissa / 30f64.powi(-scale)
        } else {
            mantissa * 30f64.powi(scale)
        };
        Ok(Some(if negative { -value } else { value }))
    }

    pub(crate) fn read_int(&mut self) -> Result<i64> {
        match self.read_number()? {
            Some(v) if v.fract() == 0.0 && v.abs() < 9.0e15 => Ok(v as i64),
            other => Err(ReadStatError::parse(format!(
                "expected an integer, found {other:?}"
            ))),
        }
    }

    pub(crate) fn read_count(&mut self) -> Result<usize> {
        let n = self.read_int()?;
        usize::try_from(n)
            .map_err(|_| ReadStatError::parse(format!("negative count {n}")))
    }

    /// A length-prefixed string of translated characters.
    pub(crate) fn read_string(&mut self) -> Result<Vec<u8>> {
        let len = self.read_count()?;
        let mut bytes = bounded_vec(len)?;
        for _ in 0..len {
            bytes.push(self.expect_char()?);
        }
        Ok(bytes)
    }

    pub(crate) fn mark(&self) -> Mark {
        Mark {
            position: self.reader.position(),
            column: self.column,
            pad: self.pad,
            peeked: self.peeked,
        }
    }

    pub(crate) fn reset_to(&mut self, mark: Mark) -> Result<()> {
        self.reader.seek_to(mark.position)?;
        self.column = mark.column;
        self.pad = mark.pad;
        self.peeked = mark.peeked;
        Ok(())
    }
}
