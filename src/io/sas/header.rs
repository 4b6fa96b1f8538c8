//! File header shared by SAS7BDAT and SAS7BCAT.

use std::io::{Read, Seek};

use chrono::{Duration, NaiveDate};
use tracing::debug;

use crate::error::{ReadStatError, Result};
use crate::io::charset::{self, Charset};
use crate::io::cursor::{ByteReader, Endian};

/// Leading bytes of every SAS file; byte 15 tells data from catalog.
const MAGIC: [u8; 32] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xc2, 0xea, 0x81, 0x60,
    0xb3, 0x14, 0x11, 0xcf, 0xbd, 0x92, 0x08, 0x00, 0x09, 0xc7, 0x31, 0x8c, 0x18, 0x1f, 0x10, 0x11,
];

pub(crate) const KIND_OFFSET: usize = 15;
pub(crate) const KIND_DATA: u8 = 0x60;
pub(crate) const KIND_CATALOG: u8 = 0x63;

/// Bytes of the header prefix holding every field we read.
const PREFIX_LEN: usize = 288;

/// Everything the page decoders need from the header.
#[derive(Debug, Clone)]
pub(crate) struct SasHeader {
    pub is_64bit: bool,
    pub endian: Endian,
    /// Extra alignment after the fixed 164-byte block (0 or 4).
    pub pad: usize,
    pub encoding: u8,
    pub table_name: Vec<u8>,
    pub created: f64,
    pub modified: f64,
    pub header_len: u64,
    pub page_size: usize,
    pub page_count: u64,
}

impl SasHeader {
    /// Width of integers in page headers and subheaders.
    pub fn int_len(&self) -> usize {
        if self.is_64bit {
            8
        } else {
            4
        }
    }

    /// Offset of the page header fields within a page.
    pub fn page_bit_offset(&self) -> usize {
        if self.is_64bit {
            32
        } else {
            16
        }
    }

    pub fn pointer_len(&self) -> usize {
        if self.is_64bit {
            24
        } else {
            12
        }
    }

    /// Offset of page `index` (0-based) in the file.
    pub fn page_offset(&self, index: u64) -> u64 {
        self.header_len + index * self.page_size as u64
    }

    /// Text charset: the configured override, the header's encoding byte,
    /// or Windows-1252 when the header declares none.
    pub fn charset(&self, override_label: Option<&str>) -> Result<Charset> {
        let declared = match self.encoding {
            0 => None,
            code => Some(encoding_name(code).map_or_else(
                || {
                    Err(ReadStatError::UnsupportedCharset(format!(
                        "SAS encoding code {code}"
                    )))
                },
                Charset::for_label,
            )),
        };
        charset::resolve(override_label, declared, Charset::windows_1252())
    }

    /// Creation time rendered for the metadata callback.
    pub fn created_timestamp(&self) -> Option<String> {
        sas_datetime(self.created).map(|t| t.format("%d %b %Y %H:%M:%S").to_string())
    }
}

/// Character set named by the header's encoding byte.
fn encoding_name(code: u8) -> Option<&'static str> {
    let name = match code {
        20 => "UTF-8",
        28 | 29 | 62 => "windows-1252",
        30 => "ISO-8859-2",
        31 => "ISO-8859-3",
        32 => "ISO-8859-4",
        33 => "ISO-8859-5",
        34 => "ISO-8859-6",
        35 => "ISO-8859-7",
        36 => "ISO-8859-8",
        37 => "windows-1254",
        38 => "ISO-8859-10",
        39 => "windows-874",
        40 => "ISO-8859-15",
        60 => "windows-1250",
        61 => "windows-1251",
        63 => "windows-1253",
        64 => "windows-1254",
        65 => "windows-1255",
        66 => "windows-1256",
        67 => "windows-1257",
        68 => "windows-1258",
        123 => "Big5",
        125 => "GBK",
        134 => "EUC-JP",
        138 => "Shift_JIS",
        140 => "EUC-KR",
        _ => return None,
    };
    Some(name)
}

/// Convert SAS seconds since 1960-01-01 to a calendar time.
pub(crate) fn sas_datetime(seconds: f64) -> Option<chrono::NaiveDateTime> {
    if !seconds.is_finite() || seconds.abs() > 1.0e12 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1960, 1, 1)?.and_hms_opt(0, 0, 0)?;
    epoch.checked_add_signed(Duration::milliseconds((seconds * 1000.0) as i64))
}

/// Read and validate the header. `kind` is [`KIND_DATA`] or [`KIND_CATALOG`].
pub(crate) fn read_header<R: Read + Seek>(reader: &mut ByteReader<R>, kind: u8) -> Result<SasHeader> {
    let not_sas = || ReadStatError::parse("not a SAS file of the expected kind");
    let mut buf = [0u8; PREFIX_LEN];
    let n = reader.read_up_to(&mut buf)?;
    if n < MAGIC.len() {
        return Err(not_sas());
    }
    let mut magic = MAGIC;
    magic[KIND_OFFSET] = kind;
    if buf[..32] != magic {
        return Err(not_sas());
    }
    if n < PREFIX_LEN {
        return Err(ReadStatError::parse("SAS header is truncated"));
    }

    let is_64bit = buf[32] == 0x33;
    let pad = if buf[35] == 0x33 { 4 } else { 0 };
    let endian = match buf[37] {
        0x01 => Endian::Little,
        0x00 => Endian::Big,
        other => {
            return Err(ReadStatError::parse(format!(
                "unknown SAS byte order marker 0x{other:02x}"
            )))
        }
    };

    let header_len = u64::from(endian.u32(&buf[196 + pad..]));
    let page_size = endian.u32(&buf[200 + pad..]) as usize;
    let page_count = if is_64bit {
        endian.u64(&buf[204 + pad..])
    } else {
        u64::from(endian.u32(&buf[204 + pad..]))
    };
    if header_len < PREFIX_LEN as u64 || page_size == 0 {
        return Err(ReadStatError::parse(format!(
            "invalid SAS header length {header_len} or page size {page_size}"
        )));
    }

    let header = SasHeader {
        is_64bit,
        endian,
        pad,
        encoding: buf[70],
        table_name: buf[92..124].to_vec(),
        created: endian.f64(&buf[164 + pad..]),
        modified: endian.f64(&buf[172 + pad..]),
        header_len,
        page_size,
        page_count,
    };
    debug!(
        is_64bit,
        endian = ?endian,
        header_len,
        page_size,
        page_count,
        "SAS header"
    );
    Ok(header)
}

/// Reject a page size no file of this length can hold, before a page buffer
/// of that size is allocated.
pub(crate) fn check_page_size<R: Read + Seek>(reader: &mut ByteReader<R>, header: &SasHeader) -> Result<()> {
    let len = reader.stream_len()?;
    if header.page_size as u64 > len {
        return Err(ReadStatError::parse(format!(
            "page size {} exceeds the file length {len}",
            header.page_size
        )));
    }
    Ok(())
}

/// Builds headers for fixtures and tests.
#[doc(hidden)]
pub fn build_header(kind: u8, is_64bit: bool, endian: Endian, page_size: u32, page_count: u32) -> Vec<u8> {
    let header_len = 1024usize;
    let mut buf = vec![0u8; header_len];
    buf[..32].copy_from_slice(&MAGIC);
    buf[KIND_OFFSET] = kind;
    buf[32] = if is_64bit { 0x33 } else { 0x22 };
    buf[35] = if is_64bit { 0x33 } else { 0x22 };
    buf[37] = u8::from(endian == Endian::Little);
    buf[70] = 20;
    buf[84..92].copy_from_slice(b"SAS FILE");
    let pad = if is_64bit { 4 } else { 0 };
    let put_u32 = |buf: &mut [u8], at: usize, v: u32| {
        let bytes = match endian {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        buf[at..at + 4].copy_from_slice(&bytes);
    };
    put_u32(&mut buf, 196 + pad, header_len as u32);
    put_u32(&mut buf, 200 + pad, page_size);
    if is_64bit && endian == Endian::Big {
        put_u32(&mut buf, 208 + pad, page_count);
    } else {
        put_u32(&mut buf, 204 + pad, page_count);
    }
    buf
}
