//! Row decompression for SAS7BDAT files.
//!
//! Two schemes exist, named by the literal stored in the first column-text
//! subheader:
//! - **SASYZCRL**: run-length encoding with 4-bit commands
//! - **SASYZCR2**: Ross data compression (RDC), LZ77-style with control words

use crate::error::{ReadStatError, Result};
use crate::io::cursor::bounded_vec;

/// Trait for decompressing one row.
pub trait Decompressor {
    /// Decompress `source`, which must expand to exactly `decompressed_size` bytes.
    fn decompress(&self, source: &[u8], decompressed_size: usize) -> Result<Vec<u8>>;
}

fn overrun() -> ReadStatError {
    ReadStatError::parse("compressed row ends inside a command")
}

fn byte_at(source: &[u8], pos: usize) -> Result<u8> {
    source.get(pos).copied().ok_or_else(overrun)
}

fn check_size(out: &[u8], decompressed_size: usize) -> Result<()> {
    if out.len() != decompressed_size {
        return Err(ReadStatError::RowWidthMismatch {
            expected: decompressed_size as u64,
            actual: out.len() as u64,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RLE
// ---------------------------------------------------------------------------

/// Decompressor for `SASYZCRL` rows.
pub struct RleDecompressor;

impl Decompressor for RleDecompressor {
    fn decompress(&self, source: &[u8], decompressed_size: usize) -> Result<Vec<u8>> {
        let mut out = bounded_vec(decompressed_size)?;
        let mut pos = 0;
        while pos < source.len() {
            let control = source[pos];
            pos += 1;
            let command = control >> 4;
            let low = usize::from(control & 0x0F);

            let mut copy_len = 0;
            let mut insert_len = 0;
            let mut insert_byte = 0u8;
            match command {
                0x0 | 0x1 => {
                    copy_len = usize::from(byte_at(source, pos)?) + 64 + low * 256;
                    if command == 0x1 {
                        copy_len += 4096;
                    }
                    pos += 1;
                }
                0x2 => copy_len = low + 96,
                0x4 => {
                    insert_len = usize::from(byte_at(source, pos)?) + 18 + low * 256;
                    insert_byte = byte_at(source, pos + 1)?;
                    pos += 2;
                }
                0x5..=0x7 => {
                    insert_len = usize::from(byte_at(source, pos)?) + 17 + low * 256;
                    insert_byte = [b'@', b' ', 0][usize::from(command - 0x5)];
                    pos += 1;
                }
                0x8 => copy_len = low + 1,
                0x9 => copy_len = low + 17,
                0xA => copy_len = low + 33,
                0xB => copy_len = low + 49,
                0xC => {
                    insert_byte = byte_at(source, pos)?;
                    insert_len = low + 3;
                    pos += 1;
                }
                0xD..=0xF => {
                    insert_len = low + 2;
                    insert_byte = [b'@', b' ', 0][usize::from(command - 0xD)];
                }
                _ => {
                    return Err(ReadStatError::parse(format!(
                        "unknown RLE command 0x{command:x}"
                    )))
                }
            }

            if copy_len > 0 {
                let chunk = source.get(pos..pos + copy_len).ok_or_else(overrun)?;
                out.extend_from_slice(chunk);
                pos += copy_len;
            }
            out.resize(out.len() + insert_len, insert_byte);
            if out.len() > decompressed_size {
                return Err(ReadStatError::RowWidthMismatch {
                    expected: decompressed_size as u64,
                    actual: out.len() as u64,
                });
            }
        }
        check_size(&out, decompressed_size)?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// RDC
// ---------------------------------------------------------------------------

/// Decompressor for `SASYZCR2` rows.
pub struct RdcDecompressor;

impl RdcDecompressor {
    fn copy_back(out: &mut Vec<u8>, offset: usize, count: usize) -> Result<()> {
        let start = out
            .len()
            .checked_sub(offset)
            .ok_or_else(|| ReadStatError::parse("RDC back-reference before start of row"))?;
        // may overlap the bytes being written
        for k in 0..count {
            let b = out[start + k];
            out.push(b);
        }
        Ok(())
    }
}

impl Decompressor for RdcDecompressor {
    fn decompress(&self, source: &[u8], decompressed_size: usize) -> Result<Vec<u8>> {
        let mut out = bounded_vec(decompressed_size)?;
        let mut pos = 0;
        let mut control_bits = 0u16;
        let mut control_mask = 0u16;

        while pos < source.len() {
            control_mask >>= 1;
            if control_mask == 0 {
                control_bits = u16::from_be_bytes([byte_at(source, pos)?, byte_at(source, pos + 1)?]);
                pos += 2;
                control_mask = 0x8000;
            }
            if control_bits & control_mask == 0 {
                out.push(byte_at(source, pos)?);
                pos += 1;
                continue;
            }

            let command = byte_at(source, pos)? >> 4;
            let count = usize::from(byte_at(source, pos)? & 0x0F);
            pos += 1;
            match command {
                0 => {
                    let b = byte_at(source, pos)?;
                    pos += 1;
                    out.resize(out.len() + count + 3, b);
                }
                1 => {
                    let count = count + (usize::from(byte_at(source, pos)?) << 4) + 19;
                    let b = byte_at(source, pos + 1)?;
                    pos += 2;
                    out.resize(out.len() + count, b);
                }
                2 => {
                    let offset = count + 3 + (usize::from(byte_at(source, pos)?) << 4);
                    let count = usize::from(byte_at(source, pos + 1)?) + 16;
                    pos += 2;
                    Self::copy_back(&mut out, offset, count)?;
                }
                _ => {
                    let offset = count + 3 + (usize::from(byte_at(source, pos)?) << 4);
                    pos += 1;
                    Self::copy_back(&mut out, offset, usize::from(command))?;
                }
            }
            if out.len() > decompressed_size {
                return Err(ReadStatError::RowWidthMismatch {
                    expected: decompressed_size as u64,
                    actual: out.len() as u64,
                });
            }
        }
        check_size(&out, decompressed_size)?;
        Ok(out)
    }
}
