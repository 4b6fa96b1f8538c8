//! SAS7BCAT format catalogs.
//!
//! The first page carries an index of `XLSR` records. Each record flagged
//! `O` points at a block (page and offset) holding one format; a block may
//! span several pages as a chain of links. A format block lists its value
//! entries first and its labels after them, joined by a label position.

use std::io::{Read, Seek};

use tracing::{debug, trace};

use super::header::{check_page_size, read_header, SasHeader, KIND_CATALOG};
use super::missing_for_tag;
use crate::error::{ReadStatError, Result};
use crate::handler::{Dispatcher, Handler};
use crate::io::charset::Charset;
use crate::io::cursor::{alloc, slice_at, trim_field, ByteReader, Endian};
use crate::metadata::{FileFormat, FileMetadata, ValueLabelSet};
use crate::parser::ParserConfiguration;
use crate::value::{Value, ValueData};

const XLSR: &[u8; 4] = b"XLSR";

/// Offset of the block payload in a 32-bit catalog.
const PAYLOAD_OFFSET: usize = 106;

/// Where the index records sit and how they are shaped.
struct IndexLayout {
    first_offset: usize,
    record_len: usize,
    flag_offset: usize,
}

impl IndexLayout {
    fn for_header(header: &SasHeader) -> Self {
        if header.is_64bit {
            Self {
                first_offset: 856,
                record_len: 212,
                flag_offset: 50,
            }
        } else {
            Self {
                first_offset: 840,
                record_len: 204,
                flag_offset: 26,
            }
        }
    }
}

/// Page (1-based) and offset of a format block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct BlockPointer {
    page: u64,
    offset: usize,
}

fn scan_index(
    buf: &[u8],
    start: usize,
    layout: &IndexLayout,
    header: &SasHeader,
    out: &mut Vec<BlockPointer>,
) -> Result<()> {
    let e = header.endian;
    let mut at = start;
    while at + layout.record_len <= buf.len() {
        if &buf[at..at + 4] != XLSR {
            // some records are only 4-byte aligned
            at += 4;
            if at + layout.record_len > buf.len() || &buf[at..at + 4] != XLSR {
                break;
            }
        }
        let record = &buf[at..at + layout.record_len];
        if record[layout.flag_offset] == b'O' {
            let pointer = if header.is_64bit {
                BlockPointer {
                    page: e.u64(&record[8..16]),
                    offset: usize::from(e.u16(&record[16..18])),
                }
            } else {
                BlockPointer {
                    page: u64::from(e.u32(&record[4..8])),
                    offset: usize::from(e.u16(&record[8..10])),
                }
            };
            trace!(page = pointer.page, offset = pointer.offset, "format block");
            out.push(pointer);
        }
        at += layout.record_len;
    }
    Ok(())
}

/// Gather a block by following its chain of links.
fn read_block<R: Read + Seek>(
    reader: &mut ByteReader<R>,
    header: &SasHeader,
    start: BlockPointer,
) -> Result<Vec<u8>> {
    let link_header_len = if header.is_64bit { 32 } else { 16 };
    let e = header.endian;
    let mut block = Vec::new();
    let mut next = start;
    let mut links = 0u64;
    while next.page > 0 && next.offset > 0 && next.page <= header.page_count {
        links += 1;
        if links > header.page_count {
            return Err(ReadStatError::parse("format block chain loops"));
        }
        reader.seek_to(header.page_offset(next.page - 1) + next.offset as u64)?;
        let link = reader.read_bytes(link_header_len)?;
        let (page, offset, len) = if header.is_64bit {
            (e.u32(&link[0..4]), e.u16(&link[8..10]), e.u16(&link[10..12]))
        } else {
            (e.u32(&link[0..4]), e.u16(&link[4..6]), e.u16(&link[6..8]))
        };
        let mut data = alloc(usize::from(len))?;
        reader.read_exact(&mut data)?;
        block.extend_from_slice(&data);
        next = BlockPointer {
            page: u64::from(page),
            offset: usize::from(offset),
        };
    }
    Ok(block)
}

/// Decode one format block into a label set; `None` for an empty format.
fn parse_block(block: &[u8], header: &SasHeader, charset: &Charset) -> Result<Option<ValueLabelSet>> {
    let e = header.endian;
    if block.len() < PAYLOAD_OFFSET {
        return Ok(None);
    }
    let flags = e.u16(&block[2..4]);
    let mut pad = if flags & 0x08 != 0 { 4 } else { 0 };
    let mut payload_offset = PAYLOAD_OFFSET;
    let (capacity, used) = if header.is_64bit {
        payload_offset += 32;
        (
            e.u64(slice_at(block, 42 + pad, 8)?),
            e.u64(slice_at(block, 50 + pad, 8)?),
        )
    } else {
        (
            u64::from(e.u32(slice_at(block, 38 + pad, 4)?)),
            u64::from(e.u32(slice_at(block, 42 + pad, 4)?)),
        )
    };
    let mut name = charset.decode_field(&block[8..16]);
    if pad > 0 {
        pad += 16;
    }
    let long_name_flag = if header.is_64bit { 0x20 } else { 0x80 };
    if flags & long_name_flag != 0 {
        name = charset.decode_field(slice_at(block, payload_offset + pad, 32)?);
        pad += 32;
    }
    if used == 0 {
        return Ok(None);
    }
    let payload = block
        .get(payload_offset + pad..)
        .ok_or_else(|| ReadStatError::parse(format!("format block {name} is truncated")))?;
    let entries = parse_entries(payload, &name, capacity, used, header, charset)?;
    let mut set = ValueLabelSet::new(name);
    for (value, label) in entries {
        set.insert(value, label);
    }
    debug!(name = set.name(), labels = set.len(), "catalog format");
    Ok(Some(set))
}

fn parse_entries(
    payload: &[u8],
    name: &str,
    capacity: u64,
    used: u64,
    header: &SasHeader,
    charset: &Charset,
) -> Result<Vec<(Value, String)>> {
    let e = header.endian;
    let truncated = || ReadStatError::parse(format!("value entries of format {name} are truncated"));
    // every entry takes at least six bytes
    if used > capacity || capacity > payload.len() as u64 / 6 {
        return Err(truncated());
    }
    let used = used as usize;
    let is_string = name.starts_with('$');

    // pass 1: value entries, ordered by label position
    let mut value_at = vec![None; used];
    let mut pos = 0usize;
    for i in 0..capacity as usize {
        let entry_len = 6 + usize::from(e.u16(slice_at(payload, pos + 2, 2).map_err(|_| truncated())?));
        if i < used {
            let label_pos = e.u32(slice_at(payload, pos + 10 + header.pad, 4).map_err(|_| truncated())?) as usize;
            let slot = value_at
                .get_mut(label_pos)
                .ok_or_else(|| ReadStatError::parse(format!("label position {label_pos} out of range")))?;
            *slot = Some((pos, entry_len));
        }
        pos += entry_len;
    }

    // pass 2: labels follow the entries in label-position order
    let mut label_pos = pos;
    let mut out = Vec::with_capacity(used);
    for slot in value_at {
        let (entry, entry_len) = slot.ok_or_else(|| ReadStatError::parse("label position never assigned"))?;
        let value_entry = slice_at(payload, entry, entry_len.max(30)).map_err(|_| truncated())?;
        let value = if is_string {
            let raw = slice_at(value_entry, entry_len.saturating_sub(16), 16)?;
            Value::string(charset.decode(trim_field(raw)))
        } else {
            // always big-endian, stored negated
            let bits = Endian::Big.u64(&value_entry[22..30]);
            if (bits | 0xFF00_0000_0000) == 0xFFFF_FFFF_FFFF {
                Value::new(ValueData::Double(f64::NAN), missing_for_tag((bits >> 40) as u8))
            } else {
                Value::double(-f64::from_bits(bits))
            }
        };
        let len = usize::from(e.u16(slice_at(payload, label_pos + 8, 2).map_err(|_| truncated())?));
        let text = slice_at(payload, label_pos + 10, len).map_err(|_| truncated())?;
        out.push((value, charset.decode(trim_field(text))));
        label_pos += 8 + 2 + len + 1;
    }
    Ok(out)
}

fn read_catalog<R: Read + Seek>(
    reader: &mut ByteReader<R>,
    header: &SasHeader,
    charset: &Charset,
) -> Result<Vec<ValueLabelSet>> {
    let layout = IndexLayout::for_header(header);
    check_page_size(reader, header)?;
    let mut page = alloc(header.page_size)?;
    let mut pointers = Vec::new();
    for index in 0..header.page_count {
        reader.seek_to(header.page_offset(index))?;
        if !reader.read_exact_or_eof(&mut page)? {
            break;
        }
        if index == 0 {
            scan_index(&page, layout.first_offset, &layout, header, &mut pointers)?;
        } else if page.get(16..20) == Some(XLSR.as_slice()) {
            scan_index(&page, 16, &layout, header, &mut pointers)?;
        } else {
            break;
        }
    }
    pointers.sort_unstable();
    pointers.dedup();
    debug!(blocks = pointers.len(), "catalog index");

    let mut sets = Vec::with_capacity(pointers.len());
    for pointer in pointers {
        let block = read_block(reader, header, pointer)?;
        if let Some(set) = parse_block(&block, header, charset)? {
            sets.push(set);
        }
    }
    Ok(sets)
}

fn open_catalog<R: Read + Seek>(source: R) -> Result<(ByteReader<R>, SasHeader)> {
    let mut reader = ByteReader::from_seekable(source, Endian::Little)?;
    let header = read_header(&mut reader, KIND_CATALOG)?;
    reader.set_endian(header.endian);
    Ok((reader, header))
}

/// Decode every label set of a catalog, for linking to a data file.
pub(crate) fn catalog_label_sets<R: Read + Seek>(
    source: R,
    config: &ParserConfiguration,
) -> Result<Vec<ValueLabelSet>> {
    let (mut reader, header) = open_catalog(source)?;
    let charset = header.charset(config.encoding.as_deref())?;
    read_catalog(&mut reader, &header, &charset)
}

/// Decode a catalog on its own: info with zero rows and variables, then the
/// labels.
pub(crate) fn read_sas7bcat<R: Read + Seek, H: Handler + ?Sized>(
    source: R,
    config: &ParserConfiguration,
    dispatcher: &mut Dispatcher<'_, H>,
) -> Result<()> {
    let (mut reader, header) = open_catalog(source)?;
    dispatcher.signature_ok();
    let charset = header.charset(config.encoding.as_deref())?;
    let sets = read_catalog(&mut reader, &header, &charset)?;

    let mut metadata = FileMetadata::new(FileFormat::Sas7bcat {
        is_64bit: header.is_64bit,
    });
    metadata.file_label = charset.decode_field(&header.table_name);
    metadata.encoding = charset.name().to_string();
    metadata.endian = header.endian;
    metadata.timestamp = header.created_timestamp();
    dispatcher.info(&metadata)?;

    for set in &sets {
        for (value, label) in set.iter() {
            dispatcher.value_label(set.name(), value, label)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Missing;

    fn header() -> SasHeader {
        SasHeader {
            is_64bit: false,
            endian: Endian::Little,
            pad: 0,
            encoding: 20,
            table_name: Vec::new(),
            created: 0.0,
            modified: 0.0,
            header_len: 1024,
            page_size: 4096,
            page_count: 2,
        }
    }

    /// A 32-bit block with entries `(value bits, label)` in reverse label
    /// position order.
    fn block(name: &[u8; 8], values: &[([u8; 30], &str)]) -> Vec<u8> {
        let mut b = vec![0u8; PAYLOAD_OFFSET];
        b[8..16].copy_from_slice(name);
        let n = values.len() as u32;
        b[38..42].copy_from_slice(&n.to_le_bytes());
        b[42..46].copy_from_slice(&n.to_le_bytes());
        for (i, (entry, _)) in values.iter().enumerate() {
            let mut entry = *entry;
            entry[2..4].copy_from_slice(&24u16.to_le_bytes());
            let label_pos = (values.len() - 1 - i) as u32;
            entry[10..14].copy_from_slice(&label_pos.to_le_bytes());
            b.extend_from_slice(&entry);
        }
        for (_, label) in values.iter().rev() {
            let mut rec = vec![0u8; 10];
            rec[8..10].copy_from_slice(&(label.len() as u16).to_le_bytes());
            rec.extend_from_slice(label.as_bytes());
            rec.push(0);
            b.extend_from_slice(&rec);
        }
        b
    }

    fn numeric_entry(v: f64) -> [u8; 30] {
        let mut e = [0u8; 30];
        e[22..30].copy_from_slice(&(-v).to_be_bytes());
        e
    }

    #[test]
    fn test_numeric_block() {
        let b = block(b"SEXF    ", &[(numeric_entry(1.0), "Male"), (numeric_entry(2.0), "Female")]);
        let set = parse_block(&b, &header(), &Charset::utf8()).unwrap().unwrap();
        assert_eq!(set.name(), "SEXF");
        assert_eq!(set.get(&Value::double(1.0)), Some("Male"));
        assert_eq!(set.get(&Value::double(2.0)), Some("Female"));
        // emitted in label-position order
        let labels: Vec<&str> = set.iter().map(|(_, l)| l).collect();
        assert_eq!(labels, ["Female", "Male"]);
    }

    #[test]
    fn test_string_block() {
        let mut entry = [b' '; 30];
        entry[..14].fill(0);
        entry[14..15].copy_from_slice(b"M");
        let b = block(b"$SEX    ", &[(entry, "Male")]);
        let set = parse_block(&b, &header(), &Charset::utf8()).unwrap().unwrap();
        assert_eq!(set.get(&Value::string("M")), Some("Male"));
    }

    #[test]
    fn test_tagged_missing_value() {
        let mut entry = [0u8; 30];
        // tag 'B' (3) in byte 2 of the big-endian payload, low bytes all ones
        entry[22..30].copy_from_slice(&[0x00, 0x00, 0x03, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        let b = block(b"MISSF   ", &[(entry, "Refused")]);
        let set = parse_block(&b, &header(), &Charset::utf8()).unwrap().unwrap();
        let (value, label) = set.iter().next().unwrap();
        assert_eq!(value.missing_kind(), Missing::Tagged('B'));
        assert_eq!(label, "Refused");
    }

    #[test]
    fn test_truncated_block_is_parse_error() {
        let mut b = block(b"SEXF    ", &[(numeric_entry(1.0), "Male")]);
        b.truncate(PAYLOAD_OFFSET + 20);
        let err = parse_block(&b, &header(), &Charset::utf8()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Parse);
    }

    #[test]
    fn test_index_scan() {
        let h = header();
        let layout = IndexLayout::for_header(&h);
        let mut page = vec![0u8; 4096];
        let at = layout.first_offset;
        page[at..at + 4].copy_from_slice(XLSR);
        page[at + 4..at + 8].copy_from_slice(&2u32.to_le_bytes());
        page[at + 8..at + 10].copy_from_slice(&16u16.to_le_bytes());
        page[at + layout.flag_offset] = b'O';
        let next = at + layout.record_len;
        page[next..next + 4].copy_from_slice(XLSR);
        page[next + layout.flag_offset] = b'D';
        let mut out = Vec::new();
        scan_index(&page, at, &layout, &h, &mut out).unwrap();
        assert_eq!(out, vec![BlockPointer { page: 2, offset: 16 }]);
    }
}
