//! Bounds-checked binary cursor shared by every decoder and the writer.
//!
//! [`ByteReader`] wraps any byte source and tracks the absolute offset so
//! that every failed read reports where it happened. [`ByteWriter`] is the
//! symmetric sink. Both take the byte order at runtime since most formats
//! only reveal it in their header.

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{ReadStatError, Result};

/// Byte order of multi-byte fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Byte order of the running machine.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub fn swapped(self) -> Self {
        match self {
            Endian::Little => Endian::Big,
            Endian::Big => Endian::Little,
        }
    }

    pub fn u16(self, buf: &[u8]) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(buf),
            Endian::Big => BigEndian::read_u16(buf),
        }
    }

    pub fn u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(buf),
            Endian::Big => BigEndian::read_u32(buf),
        }
    }

    pub fn i32(self, buf: &[u8]) -> i32 {
        self.u32(buf) as i32
    }

    pub fn u64(self, buf: &[u8]) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_u64(buf),
            Endian::Big => BigEndian::read_u64(buf),
        }
    }

    pub fn f64(self, buf: &[u8]) -> f64 {
        f64::from_bits(self.u64(buf))
    }

    /// Unsigned integer of `buf.len()` bytes (at most 8).
    pub fn uint(self, buf: &[u8]) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_uint(buf, buf.len()),
            Endian::Big => BigEndian::read_uint(buf, buf.len()),
        }
    }
}

/// Borrow `len` bytes at `offset`, failing instead of slicing out of bounds.
pub fn slice_at(buf: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or_else(|| {
            ReadStatError::parse(format!(
                "field of {len} bytes at offset {offset} exceeds buffer of {} bytes",
                buf.len()
            ))
        })
}

/// Cut a fixed-width text field at its first NUL.
pub fn until_nul(buf: &[u8]) -> &[u8] {
    match buf.iter().position(|&b| b == 0) {
        Some(n) => &buf[..n],
        None => buf,
    }
}

/// Cut at the first NUL and drop trailing blanks.
pub fn trim_field(buf: &[u8]) -> &[u8] {
    let buf = until_nul(buf);
    let end = buf
        .iter()
        .rposition(|&b| b != b' ')
        .map_or(0, |p| p + 1);
    &buf[..end]
}

/// Most bytes reserved up front for a length read from a file; buffers
/// beyond this grow only as data actually arrives.
pub const PREALLOC_LIMIT: usize = 64 * 1024;

/// An empty vector with room for `len` items, capped at [`PREALLOC_LIMIT`] bytes.
pub fn bounded_vec<T>(len: usize) -> Result<Vec<T>> {
    let cap = len.min(PREALLOC_LIMIT / std::mem::size_of::<T>().max(1));
    let mut v = Vec::new();
    v.try_reserve_exact(cap)
        .map_err(|_| ReadStatError::Malloc(cap.saturating_mul(std::mem::size_of::<T>())))?;
    Ok(v)
}

/// Allocate a zeroed buffer, reporting allocation failure instead of aborting.
pub fn alloc(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| ReadStatError::Malloc(len))?;
    buf.resize(len, 0);
    Ok(buf)
}

macro_rules! read_number {
    ($(#[$doc:meta])* $name:ident, $ty:ty, $method:ident) => {
        $(#[$doc])*
        pub fn $name(&mut self) -> Result<$ty> {
            let offset = self.position;
            let value = match self.endian {
                Endian::Little => self.inner.$method::<LittleEndian>(),
                Endian::Big => self.inner.$method::<BigEndian>(),
            }
            .map_err(|e| ReadStatError::read_at(offset, e))?;
            self.position += std::mem::size_of::<$ty>() as u64;
            Ok(value)
        }
    };
}

/// Sequential reader with explicit byte order and offset tracking.
#[derive(Debug)]
pub struct ByteReader<R> {
    inner: R,
    endian: Endian,
    position: u64,
}

impl<R: Read> ByteReader<R> {
    pub fn new(inner: R, endian: Endian) -> Self {
        Self {
            inner,
            endian,
            position: 0,
        }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    /// Absolute offset of the next byte.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Fill `buf` completely or fail with the offset of the read.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner
            .read_exact(buf)
            .map_err(|e| ReadStatError::read_at(self.position, e))?;
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Fill `buf` completely, or return `Ok(false)` when the source is
    /// exhausted before the first byte. A partial fill is an error.
    pub fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ReadStatError::read_at(self.position, e)),
            }
        }
        self.position += filled as u64;
        if filled == 0 && !buf.is_empty() {
            return Ok(false);
        }
        if filled < buf.len() {
            return Err(ReadStatError::read_at(
                self.position,
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("record truncated after {filled} of {} bytes", buf.len()),
                ),
            ));
        }
        Ok(true)
    }

    /// Read up to `buf.len()` bytes, returning how many were available.
    pub fn read_up_to(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ReadStatError::read_at(self.position, e)),
            }
        }
        self.position += filled as u64;
        Ok(filled)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let offset = self.position;
        let value = self
            .inner
            .read_u8()
            .map_err(|e| ReadStatError::read_at(offset, e))?;
        self.position += 1;
        Ok(value)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    read_number!(read_u16, u16, read_u16);
    read_number!(read_i16, i16, read_i16);
    read_number!(read_u32, u32, read_u32);
    read_number!(read_i32, i32, read_i32);
    read_number!(read_u64, u64, read_u64);
    read_number!(read_i64, i64, read_i64);
    read_number!(read_f32, f32, read_f32);
    read_number!(read_f64, f64, read_f64);

    /// Read `len` bytes into a fresh buffer. Memory grows with the bytes
    /// present, so an inflated length fails at end of input.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = bounded_vec(len)?;
        let read = (&mut self.inner)
            .take(len as u64)
            .read_to_end(&mut buf)
            .map_err(|e| ReadStatError::read_at(self.position, e))?;
        self.position += read as u64;
        if read < len {
            return Err(ReadStatError::read_at(
                self.position,
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("expected {len} bytes, found {read}"),
                ),
            ));
        }
        Ok(buf)
    }

    /// Read a fixed-width text field and cut it at the first NUL.
    pub fn read_fixed_field(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = self.read_bytes(len)?;
        let end = until_nul(&buf).len();
        buf.truncate(end);
        Ok(buf)
    }

    /// Consume `expected` or fail with a parse error naming `what`.
    pub fn expect(&mut self, expected: &[u8], what: &str) -> Result<()> {
        let offset = self.position;
        let found = self.read_bytes(expected.len())?;
        if found != expected {
            return Err(ReadStatError::parse(format!(
                "expected {what} at offset {offset}, found {:?}",
                String::from_utf8_lossy(&found)
            )));
        }
        Ok(())
    }

    /// Discard `len` bytes.
    pub fn skip(&mut self, len: u64) -> Result<()> {
        let copied = io::copy(&mut (&mut self.inner).take(len), &mut io::sink())
            .map_err(|e| ReadStatError::read_at(self.position, e))?;
        self.position += copied;
        if copied < len {
            return Err(ReadStatError::read_at(
                self.position,
                io::Error::new(io::ErrorKind::UnexpectedEof, "unexpected end of file"),
            ));
        }
        Ok(())
    }
}

impl<R: Read + Seek> ByteReader<R> {
    /// Create a reader positioned wherever `inner` currently is.
    pub fn from_seekable(mut inner: R, endian: Endian) -> Result<Self> {
        let position = inner
            .stream_position()
            .map_err(|e| ReadStatError::read_at(0, e))?;
        Ok(Self {
            inner,
            endian,
            position,
        })
    }

    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.inner
            .seek(SeekFrom::Start(offset))
            .map_err(|e| ReadStatError::read_at(offset, e))?;
        self.position = offset;
        Ok(())
    }

    /// Total length of the underlying source; the position is preserved.
    pub fn stream_len(&mut self) -> Result<u64> {
        let here = self.position;
        let len = self
            .inner
            .seek(SeekFrom::End(0))
            .map_err(|e| ReadStatError::read_at(here, e))?;
        self.seek_to(here)?;
        Ok(len)
    }
}

/// Sequential writer with explicit byte order; failures map to `Write`.
#[derive(Debug)]
pub struct ByteWriter<W> {
    inner: W,
    endian: Endian,
    position: u64,
}

impl<W: Write> ByteWriter<W> {
    pub fn new(inner: W, endian: Endian) -> Self {
        Self {
            inner,
            endian,
            position: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).map_err(ReadStatError::Write)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.inner.write_u8(value).map_err(ReadStatError::Write)?;
        self.position += 1;
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        match self.endian {
            Endian::Little => self.inner.write_i32::<LittleEndian>(value),
            Endian::Big => self.inner.write_i32::<BigEndian>(value),
        }
        .map_err(ReadStatError::Write)?;
        self.position += 4;
        Ok(())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        match self.endian {
            Endian::Little => self.inner.write_f64::<LittleEndian>(value),
            Endian::Big => self.inner.write_f64::<BigEndian>(value),
        }
        .map_err(ReadStatError::Write)?;
        self.position += 8;
        Ok(())
    }

    /// Write `bytes` into a field of exactly `len` bytes, padding with `pad`.
    /// Input longer than the field is cut.
    pub fn write_padded(&mut self, bytes: &[u8], len: usize, pad: u8) -> Result<()> {
        let n = bytes.len().min(len);
        self.write_bytes(&bytes[..n])?;
        for _ in n..len {
            self.write_u8(pad)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush().map_err(ReadStatError::Write)
    }
}
