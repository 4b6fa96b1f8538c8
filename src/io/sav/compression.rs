//! SPSS bytecode compression.
//!
//! Data is a sequence of 8-byte command blocks. Each command byte describes
//! one 8-byte slot of the case stream:
//!
//! | code     | meaning                                          |
//! |----------|--------------------------------------------------|
//! | 0        | padding, ignored                                 |
//! | 1..=251  | the number `code - bias`                         |
//! | 252      | end of data                                      |
//! | 253      | the slot is stored verbatim after the block      |
//! | 254      | eight spaces                                     |
//! | 255      | system-missing                                   |

use std::io::{Read, Write};

use crate::error::Result;
use crate::io::cursor::{ByteReader, ByteWriter, Endian};

use super::SYSMIS;

pub const CODE_PADDING: u8 = 0;
pub const CODE_END: u8 = 252;
pub const CODE_RAW: u8 = 253;
pub const CODE_SPACES: u8 = 254;
pub const CODE_SYSMIS: u8 = 255;

const SPACES: [u8; 8] = [b' '; 8];

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Streaming bytecode decompressor yielding uncompressed 8-byte slots.
#[derive(Debug)]
pub struct BytecodeDecoder {
    bias: f64,
    endian: Endian,
    codes: [u8; 8],
    next: usize,
    finished: bool,
}

impl BytecodeDecoder {
    pub fn new(bias: f64, endian: Endian) -> Self {
        Self {
            bias,
            endian,
            codes: [0; 8],
            next: 8,
            finished: false,
        }
    }

    /// Forget all state, e.g. after seeking back to the start of the data.
    pub fn reset(&mut self) {
        self.codes = [0; 8];
        self.next = 8;
        self.finished = false;
    }

    fn number(&self, v: f64) -> [u8; 8] {
        match self.endian {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        }
    }

    /// Decode the next slot into `out`. Returns `false` at end of data.
    pub fn next_slot<R: Read>(&mut self, reader: &mut ByteReader<R>, out: &mut [u8]) -> Result<bool> {
        loop {
            if self.finished {
                return Ok(false);
            }
            if self.next == self.codes.len() {
                if !reader.read_exact_or_eof(&mut self.codes)? {
                    self.finished = true;
                    return Ok(false);
                }
                self.next = 0;
            }
            let code = self.codes[self.next];
            self.next += 1;
            match code {
                CODE_PADDING => continue,
                CODE_END => {
                    self.finished = true;
                    return Ok(false);
                }
                CODE_RAW => reader.read_exact(&mut out[..8])?,
                CODE_SPACES => out[..8].copy_from_slice(&SPACES),
                CODE_SYSMIS => out[..8].copy_from_slice(&self.number(SYSMIS)),
                _ => out[..8].copy_from_slice(&self.number(f64::from(code) - self.bias)),
            }
            return Ok(true);
        }
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// What an uncompressed slot holds, which decides how it may be compressed.
#[derive(Debug, Clone, Copy)]
pub enum SlotKind {
    Numeric(f64),
    Text([u8; 8]),
}

/// Bytecode compressor buffering one command block at a time.
#[derive(Debug)]
pub struct BytecodeEncoder {
    bias: f64,
    codes: [u8; 8],
    count: usize,
    raw: Vec<[u8; 8]>,
}

impl BytecodeEncoder {
    pub fn new(bias: f64) -> Self {
        Self {
            bias,
            codes: [0; 8],
            count: 0,
            raw: Vec::with_capacity(8),
        }
    }

    /// Code for a numeric slot, if it compresses.
    fn numeric_code(&self, v: f64) -> Option<u8> {
        if v.to_bits() == SYSMIS.to_bits() {
            return Some(CODE_SYSMIS);
        }
        let shifted = v + self.bias;
        if v.fract() == 0.0 && (1.0..=251.0).contains(&shifted) {
            Some(shifted as u8)
        } else {
            None
        }
    }

    pub fn push<W: Write>(
        &mut self,
        writer: &mut ByteWriter<W>,
        slot: SlotKind,
        endian: Endian,
    ) -> Result<()> {
        let code = match slot {
            SlotKind::Numeric(v) => match self.numeric_code(v) {
                Some(code) => code,
                None => {
                    self.raw.push(match endian {
                        Endian::Little => v.to_le_bytes(),
                        Endian::Big => v.to_be_bytes(),
                    });
                    CODE_RAW
                }
            },
            SlotKind::Text(bytes) if bytes == SPACES => CODE_SPACES,
            SlotKind::Text(bytes) => {
                self.raw.push(bytes);
                CODE_RAW
            }
        };
        self.codes[self.count] = code;
        self.count += 1;
        if self.count == self.codes.len() {
            self.flush_block(writer)?;
        }
        Ok(())
    }

    fn flush_block<W: Write>(&mut self, writer: &mut ByteWriter<W>) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }
        for code in &mut self.codes[self.count..] {
            *code = CODE_PADDING;
        }
        writer.write_bytes(&self.codes)?;
        for raw in self.raw.drain(..) {
            writer.write_bytes(&raw)?;
        }
        self.count = 0;
        Ok(())
    }

    /// Write the partially filled block, if any.
    pub fn finish<W: Write>(&mut self, writer: &mut ByteWriter<W>) -> Result<()> {
        self.flush_block(writer)
    }
}
