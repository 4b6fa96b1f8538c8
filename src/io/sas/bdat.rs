//! SAS7BDAT decoding session.
//!
//! Two passes over the pages: the first collects the dictionary from the
//! metadata subheaders up to the first data page, the second streams rows
//! from compressed-row subheaders, mixed pages and data pages.

use std::io::{Read, Seek};

use tracing::{debug, trace, warn};

use super::compression::{Decompressor, RdcDecompressor, RleDecompressor};
use super::header::{check_page_size, read_header, SasHeader, KIND_DATA};
use super::{numeric_value, page};
use crate::error::{ReadStatError, Result};
use crate::handler::{Dispatcher, Handler};
use crate::io::charset::Charset;
use crate::io::cursor::{alloc, slice_at, trim_field, ByteReader, Endian};
use crate::io::div_ceil;
use crate::metadata::{Compression, FileFormat, FileMetadata, ValueLabelSet, Variable};
use crate::parser::ParserConfiguration;
use crate::value::{Value, ValueType};

/// Subheader signatures (first four bytes, or bytes 4..8 in big-endian
/// 64-bit files).
pub(crate) mod signature {
    pub const ROW_SIZE: u32 = 0xF7F7_F7F7;
    pub const COLUMN_SIZE: u32 = 0xF6F6_F6F6;
    pub const COUNTS: u32 = 0xFFFF_FC00;
    pub const COLUMN_FORMAT: u32 = 0xFFFF_FBFE;
    pub const COLUMN_MASK: u32 = 0xFFFF_FFF8;
    pub const COLUMN_ATTRS: u32 = 0xFFFF_FFFC;
    pub const COLUMN_TEXT: u32 = 0xFFFF_FFFD;
    pub const COLUMN_LIST: u32 = 0xFFFF_FFFE;
    pub const COLUMN_NAME: u32 = 0xFFFF_FFFF;

    pub fn is_known(sig: u32) -> bool {
        matches!(
            sig,
            ROW_SIZE
                | COLUMN_SIZE
                | COUNTS
                | COLUMN_FORMAT
                | COLUMN_MASK
                | COLUMN_ATTRS
                | COLUMN_TEXT
                | COLUMN_LIST
                | COLUMN_NAME
        )
    }
}

/// Subheader pointer compression codes.
const SUBHEADER_TRUNCATED: u8 = 1;
const SUBHEADER_COMPRESSED: u8 = 4;

const RLE_LITERAL: &[u8; 8] = b"SASYZCRL";
const RDC_LITERAL: &[u8; 8] = b"SASYZCR2";

// ----------------------------------------------------------------------------
// Pages
// ----------------------------------------------------------------------------

fn int_at(buf: &[u8], at: usize, len: usize, endian: Endian) -> Result<u64> {
    Ok(endian.uint(slice_at(buf, at, len)?))
}

struct PageHeader {
    page_type: u16,
    block_count: u16,
    subheader_count: u16,
}

impl PageHeader {
    fn parse(page: &[u8], header: &SasHeader) -> Result<Self> {
        let at = header.page_bit_offset();
        let e = header.endian;
        let fields = slice_at(page, at, 6)?;
        Ok(Self {
            page_type: e.u16(&fields[0..]),
            block_count: e.u16(&fields[2..]),
            subheader_count: e.u16(&fields[4..]),
        })
    }

    fn kind(&self) -> u16 {
        self.page_type & page::TYPE_MASK
    }

    fn is_comp(&self) -> bool {
        self.page_type & page::COMP == page::COMP
    }
}

struct Pointer {
    offset: usize,
    len: usize,
    compression: u8,
    kind: u8,
}

fn pointers(page: &[u8], header: &SasHeader, count: u16) -> Result<Vec<Pointer>> {
    let il = header.int_len();
    let base = header.page_bit_offset() + 8;
    (0..usize::from(count))
        .map(|i| {
            let p = slice_at(page, base + i * header.pointer_len(), 2 * il + 2)?;
            Ok(Pointer {
                offset: header.endian.uint(&p[..il]) as usize,
                len: header.endian.uint(&p[il..2 * il]) as usize,
                compression: p[2 * il],
                kind: p[2 * il + 1],
            })
        })
        .collect()
}

/// Signature of a subheader, `None` when it is too short to carry one.
fn signature_of(body: &[u8], header: &SasHeader) -> Option<u32> {
    let at = if header.is_64bit && header.endian == Endian::Big {
        4
    } else {
        0
    };
    body.get(at..at + 4).map(|b| header.endian.u32(b))
}

/// Read page `index` into `buf`; `false` when the file ends first.
fn read_page<R: Read + Seek>(
    reader: &mut ByteReader<R>,
    header: &SasHeader,
    index: u64,
    buf: &mut [u8],
) -> Result<bool> {
    reader.seek_to(header.page_offset(index))?;
    reader.read_exact_or_eof(buf)
}

// ----------------------------------------------------------------------------
// Dictionary
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct TextRef {
    index: u16,
    offset: u16,
    len: u16,
}

impl TextRef {
    fn parse(buf: &[u8], at: usize, endian: Endian) -> Result<Self> {
        let b = slice_at(buf, at, 6)?;
        Ok(Self {
            index: endian.u16(&b[0..]),
            offset: endian.u16(&b[2..]),
            len: endian.u16(&b[4..]),
        })
    }
}

struct ColumnAttrs {
    offset: usize,
    width: usize,
    numeric: bool,
}

#[derive(Default)]
struct Dictionary {
    row_length: Option<usize>,
    total_rows: u64,
    mix_rows: u64,
    column_count: Option<usize>,
    text_blobs: Vec<Vec<u8>>,
    names: Vec<TextRef>,
    attrs: Vec<ColumnAttrs>,
    formats: Vec<(TextRef, TextRef)>,
    compression: Compression,
}

impl Dictionary {
    fn text(&self, r: TextRef, charset: &Charset) -> Result<String> {
        if r.len == 0 {
            return Ok(String::new());
        }
        let blob = self
            .text_blobs
            .get(usize::from(r.index))
            .ok_or_else(|| ReadStatError::parse(format!("text reference to missing blob {}", r.index)))?;
        let bytes = slice_at(blob, usize::from(r.offset), usize::from(r.len))?;
        Ok(charset.decode(trim_field(bytes)))
    }

    fn add_subheader(&mut self, sig: u32, body: &[u8], header: &SasHeader) -> Result<()> {
        let il = header.int_len();
        let e = header.endian;
        match sig {
            signature::ROW_SIZE => {
                self.row_length = Some(int_at(body, 5 * il, il, e)? as usize);
                self.total_rows = int_at(body, 6 * il, il, e)?;
                self.mix_rows = int_at(body, 15 * il, il, e)?;
                debug!(
                    row_length = ?self.row_length,
                    rows = self.total_rows,
                    mix_rows = self.mix_rows,
                    "row size subheader"
                );
            }
            signature::COLUMN_SIZE => {
                self.column_count = Some(int_at(body, il, il, e)? as usize);
            }
            signature::COLUMN_TEXT => {
                let blob = body.get(il..).unwrap_or_default().to_vec();
                if self.text_blobs.is_empty() {
                    self.compression = compression_of(&blob)?;
                }
                self.text_blobs.push(blob);
            }
            signature::COLUMN_NAME => {
                let n = entry_count(body.len(), il, 8)?;
                for i in 0..n {
                    self.names.push(TextRef::parse(body, il + 8 + 8 * i, e)?);
                }
            }
            signature::COLUMN_ATTRS => {
                let stride = il + 8;
                let n = entry_count(body.len(), il, stride)?;
                for i in 0..n {
                    let base = il + 8 + i * stride;
                    let offset = int_at(body, base, il, e)? as usize;
                    let width = int_at(body, base + il, 4, e)? as usize;
                    let numeric = match slice_at(body, base + il + 6, 1)?[0] {
                        1 => true,
                        2 => false,
                        other => {
                            return Err(ReadStatError::parse(format!(
                                "unknown column type {other}"
                            )))
                        }
                    };
                    self.attrs.push(ColumnAttrs {
                        offset,
                        width,
                        numeric,
                    });
                }
            }
            signature::COLUMN_FORMAT => {
                let format = TextRef::parse(body, 22 + 3 * il, e)?;
                let label = TextRef::parse(body, 28 + 3 * il, e)?;
                self.formats.push((format, label));
            }
            other => trace!(signature = other, "subheader skipped"),
        }
        Ok(())
    }
}

/// Entries in a column name or attribute subheader.
fn entry_count(len: usize, il: usize, stride: usize) -> Result<usize> {
    len.checked_sub(2 * il + 12)
        .map(|n| n / stride)
        .ok_or_else(|| ReadStatError::parse(format!("column subheader of {len} bytes is too short")))
}

/// Row compression named by the literal in the first text blob.
fn compression_of(blob: &[u8]) -> Result<Compression> {
    match blob.get(12..20) {
        Some(lit) if lit == RLE_LITERAL => Ok(Compression::Rle),
        Some(lit) if lit == RDC_LITERAL => Ok(Compression::Rdc),
        Some(lit) if lit.starts_with(b"SASYZ") => Err(ReadStatError::UnsupportedCompression(
            String::from_utf8_lossy(lit).into_owned(),
        )),
        _ => Ok(Compression::None),
    }
}

struct Column {
    offset: usize,
    width: usize,
    numeric: bool,
}

fn read_dictionary<R: Read + Seek>(
    reader: &mut ByteReader<R>,
    header: &SasHeader,
    page_buf: &mut [u8],
) -> Result<Dictionary> {
    let mut dict = Dictionary::default();
    for index in 0..header.page_count {
        if !read_page(reader, header, index, page_buf)? {
            break;
        }
        let ph = PageHeader::parse(page_buf, header)?;
        trace!(index, page_type = ph.page_type, subheaders = ph.subheader_count, "page");
        if ph.is_comp() {
            continue;
        }
        match ph.kind() {
            page::META | page::MIX | page::AMD => {
                for ptr in pointers(page_buf, header, ph.subheader_count)? {
                    if ptr.len == 0
                        || ptr.compression == SUBHEADER_TRUNCATED
                        || ptr.compression == SUBHEADER_COMPRESSED
                    {
                        continue;
                    }
                    let body = slice_at(page_buf, ptr.offset, ptr.len)?;
                    if let Some(sig) = signature_of(body, header) {
                        dict.add_subheader(sig, body, header)?;
                    }
                }
            }
            page::DATA => break,
            other => warn!(index, page_type = other, "unknown SAS page type"),
        }
    }
    Ok(dict)
}

fn build_columns(
    dict: &Dictionary,
    charset: &Charset,
    catalog: &[ValueLabelSet],
) -> Result<(Vec<Variable>, Vec<Column>)> {
    let row_length = dict
        .row_length
        .ok_or_else(|| ReadStatError::parse("no row size subheader before the first data page"))?;
    let count = dict.column_count.unwrap_or(dict.attrs.len());
    if dict.names.len() < count || dict.attrs.len() < count {
        return Err(ReadStatError::parse(format!(
            "{count} columns declared but {} names and {} attributes found",
            dict.names.len(),
            dict.attrs.len()
        )));
    }

    let mut vars = Vec::with_capacity(count);
    let mut columns = Vec::with_capacity(count);
    for (index, attrs) in dict.attrs.iter().take(count).enumerate() {
        let overruns = attrs
            .offset
            .checked_add(attrs.width)
            .map_or(true, |end| end > row_length);
        if overruns || (attrs.numeric && !(1..=8).contains(&attrs.width)) {
            return Err(ReadStatError::parse(format!(
                "column {index} of width {} at offset {} does not fit a {row_length}-byte row",
                attrs.width, attrs.offset
            )));
        }
        let value_type = if attrs.numeric {
            ValueType::Double
        } else {
            ValueType::String
        };
        let mut var = Variable::new(index, dict.text(dict.names[index], charset)?, value_type);
        if let Some(&(format, label)) = dict.formats.get(index) {
            var.format = dict.text(format, charset)?;
            var.label = dict.text(label, charset)?;
        }
        var.storage_width = attrs.width;
        var.label_set = catalog
            .iter()
            .find(|set| !var.format.is_empty() && set.name().eq_ignore_ascii_case(&var.format))
            .map(|set| set.name().to_string());
        vars.push(var);
        columns.push(Column {
            offset: attrs.offset,
            width: attrs.width,
            numeric: attrs.numeric,
        });
    }
    Ok((vars, columns))
}

// ----------------------------------------------------------------------------
// Rows
// ----------------------------------------------------------------------------

fn decode_cell(row: &[u8], column: &Column, charset: &Charset, endian: Endian) -> Value {
    let field = &row[column.offset..column.offset + column.width];
    if column.numeric {
        // truncated numerics keep their most significant bytes
        let mut raw = [0u8; 8];
        match endian {
            Endian::Little => raw[8 - column.width..].copy_from_slice(field),
            Endian::Big => raw[..column.width].copy_from_slice(field),
        }
        numeric_value(endian.f64(&raw))
    } else {
        Value::string(charset.decode(trim_field(field)))
    }
}

struct RowSink<'s, 'h, H: Handler + ?Sized> {
    dispatcher: &'s mut Dispatcher<'h, H>,
    columns: &'s [Column],
    charset: &'s Charset,
    endian: Endian,
    target: usize,
    emitted: usize,
}

impl<H: Handler + ?Sized> RowSink<'_, '_, H> {
    fn done(&self) -> bool {
        self.emitted >= self.target
    }

    fn emit(&mut self, row: &[u8]) -> Result<()> {
        for (index, column) in self.columns.iter().enumerate() {
            let value = decode_cell(row, column, self.charset, self.endian);
            self.dispatcher.value(self.emitted, index, &value)?;
        }
        self.emitted += 1;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// Decode a SAS7BDAT stream into `dispatcher`. `catalog` holds label sets
/// decoded from a format catalog; variables whose format names a set are
/// linked to it and the sets are emitted after the rows.
pub(crate) fn read_sas7bdat<R: Read + Seek, H: Handler + ?Sized>(
    source: R,
    config: &ParserConfiguration,
    dispatcher: &mut Dispatcher<'_, H>,
    catalog: &[ValueLabelSet],
) -> Result<()> {
    let mut reader = ByteReader::from_seekable(source, Endian::Little)?;
    let header = read_header(&mut reader, KIND_DATA)?;
    dispatcher.signature_ok();
    reader.set_endian(header.endian);
    if header.page_size < header.page_bit_offset() + 8 {
        return Err(ReadStatError::parse(format!(
            "page size {} is smaller than a page header",
            header.page_size
        )));
    }
    let charset = header.charset(config.encoding.as_deref())?;

    check_page_size(&mut reader, &header)?;
    let mut page_buf = alloc(header.page_size)?;
    let dict = read_dictionary(&mut reader, &header, &mut page_buf)?;
    let (vars, columns) = build_columns(&dict, &charset, catalog)?;
    let row_length = dict.row_length.unwrap_or(0);
    let total = usize::try_from(dict.total_rows)
        .map_err(|_| ReadStatError::parse(format!("row count {} overflows", dict.total_rows)))?;

    let mut metadata = FileMetadata::new(FileFormat::Sas7bdat {
        is_64bit: header.is_64bit,
    });
    metadata.obs_count = config.rows_to_emit(total);
    metadata.var_count = vars.len();
    metadata.file_label = charset.decode_field(&header.table_name);
    metadata.encoding = charset.name().to_string();
    metadata.compression = dict.compression;
    metadata.endian = header.endian;
    metadata.timestamp = header.created_timestamp();
    dispatcher.info(&metadata)?;

    for var in &vars {
        dispatcher.variable(var)?;
    }

    let decompressor: Option<Box<dyn Decompressor>> = match dict.compression {
        Compression::Rle => Some(Box::new(RleDecompressor)),
        Compression::Rdc => Some(Box::new(RdcDecompressor)),
        _ => None,
    };

    let mut rows = RowSink {
        dispatcher: &mut *dispatcher,
        columns: &columns,
        charset: &charset,
        endian: header.endian,
        target: metadata.obs_count,
        emitted: 0,
    };
    let mut rows_read = 0u64;
    let bit_offset = header.page_bit_offset();

    for index in 0..header.page_count {
        if rows.done() {
            break;
        }
        if !read_page(&mut reader, &header, index, &mut page_buf)? {
            break;
        }
        let ph = PageHeader::parse(&page_buf, &header)?;
        if ph.is_comp() {
            continue;
        }
        let kind = ph.kind();
        if matches!(kind, page::META | page::MIX | page::AMD) {
            for ptr in pointers(&page_buf, &header, ph.subheader_count)? {
                if rows.done() {
                    break;
                }
                if ptr.len == 0 || ptr.compression == SUBHEADER_TRUNCATED {
                    continue;
                }
                let body = slice_at(&page_buf, ptr.offset, ptr.len)?;
                if ptr.compression == SUBHEADER_COMPRESSED {
                    let decompressor = decompressor.as_ref().ok_or_else(|| {
                        ReadStatError::parse("compressed row in a file declaring no compression")
                    })?;
                    let row = decompressor.decompress(body, row_length)?;
                    rows.emit(&row)?;
                    rows_read += 1;
                } else if ptr.kind == 1
                    && decompressor.is_some()
                    && !signature_of(body, &header).is_some_and(signature::is_known)
                {
                    rows.emit(slice_at(body, 0, row_length)?)?;
                    rows_read += 1;
                }
            }
        }

        let (start, count) = match kind {
            page::MIX => {
                let after = bit_offset + 8 + usize::from(ph.subheader_count) * header.pointer_len();
                (div_ceil(after, 8) * 8, dict.mix_rows)
            }
            page::DATA => (bit_offset + 8, u64::from(ph.block_count)),
            _ => continue,
        };
        let count = count.min(dict.total_rows.saturating_sub(rows_read)) as usize;
        trace!(index, rows = count, "row page");
        for i in 0..count {
            if rows.done() {
                break;
            }
            rows.emit(slice_at(&page_buf, start + i * row_length, row_length)?)?;
            rows_read += 1;
        }
    }

    if !rows.done() {
        return Err(ReadStatError::RowCountMismatch {
            expected: dict.total_rows,
            actual: rows.emitted as u64,
        });
    }

    for set in catalog {
        for (value, label) in set.iter() {
            dispatcher.value_label(set.name(), value, label)?;
        }
    }
    Ok(())
}
