//! DTA decoding session.

use std::io::{Read, Seek};

use ahash::AHashMap;
use nom::{
    bytes::complete::{tag, take},
    multi::{count, length_data, many0},
    number::{
        complete::{u16 as nom_u16, u32 as nom_u32, u64 as nom_u64, u8 as nom_u8},
        Endianness,
    },
    IResult,
};
use tracing::{debug, trace};

use super::{
    classify_byte, classify_double, classify_float, classify_int, classify_long, DtaRelease,
    StorageType,
};
use crate::error::{ReadStatError, Result};
use crate::handler::{Dispatcher, Handler};
use crate::io::charset::{self, Charset};
use crate::io::cursor::{alloc, slice_at, until_nul, ByteReader, Endian};
use crate::io::NomResultExt;
use crate::metadata::{FileFormat, FileMetadata, Variable};
use crate::parser::ParserConfiguration;
use crate::value::{Value, ValueData};

const XML_MAGIC: &[u8] = b"<stata_dta>";

/// Section indices of the 117+ offset map.
mod section {
    pub const VARIABLE_TYPES: usize = 2;
    pub const CHARACTERISTICS: usize = 8;
    pub const DATA: usize = 9;
    pub const STRLS: usize = 10;
    pub const VALUE_LABELS: usize = 11;
}

struct Header {
    release: DtaRelease,
    endian: Endian,
    var_count: usize,
    obs_count: u64,
    data_label: Vec<u8>,
    timestamp: Vec<u8>,
    /// Section offsets, 117+ only.
    map: Option<Vec<u64>>,
}

#[derive(Default)]
struct Descriptors {
    types: Vec<StorageType>,
    names: Vec<Vec<u8>>,
    formats: Vec<Vec<u8>>,
    label_sets: Vec<Vec<u8>>,
    labels: Vec<Vec<u8>>,
}

fn nom_endian(endian: Endian) -> Endianness {
    match endian {
        Endian::Little => Endianness::Little,
        Endian::Big => Endianness::Big,
    }
}

/// Decode a DTA stream into `dispatcher`.
pub(crate) fn read<R: Read + Seek, H: Handler + ?Sized>(
    source: R,
    config: &ParserConfiguration,
    dispatcher: &mut Dispatcher<'_, H>,
) -> Result<()> {
    let mut reader = ByteReader::from_seekable(source, Endian::Little)?;
    let start = reader.position();
    let mut magic = [0u8; 11];
    let got = reader.read_up_to(&mut magic)?;
    reader.seek_to(start)?;

    let header = if got == magic.len() && &magic[..] == XML_MAGIC {
        read_xml_header(&mut reader)?
    } else {
        read_binary_header(&mut reader)?
    };
    if !config.dta_releases.contains(header.release.flag()) {
        return Err(ReadStatError::parse(format!(
            "DTA release {} is not enabled",
            header.release.code()
        )));
    }
    dispatcher.signature_ok();
    debug!(
        release = header.release.code(),
        endian = ?header.endian,
        vars = header.var_count,
        obs = header.obs_count,
        "DTA header"
    );

    let release = header.release;
    let default = Charset::for_label(release.default_encoding())?;
    let charset = charset::resolve(config.encoding.as_deref(), None, default)?;

    let descriptors = match &header.map {
        Some(map) => read_xml_descriptors(&mut reader, &header, map)?,
        None => read_binary_descriptors(&mut reader, &header)?,
    };

    let declared_obs = usize::try_from(header.obs_count)
        .map_err(|_| ReadStatError::parse("observation count exceeds address space"))?;
    let obs_count = config.rows_to_emit(declared_obs);

    let mut metadata = FileMetadata::new(FileFormat::Dta(release));
    metadata.obs_count = obs_count;
    metadata.var_count = header.var_count;
    metadata.file_label = charset.decode_field(&header.data_label);
    metadata.encoding = charset.name().to_string();
    metadata.endian = header.endian;
    if !header.timestamp.is_empty() {
        metadata.timestamp = Some(charset.decode_field(&header.timestamp));
    }
    dispatcher.info(&metadata)?;

    for (i, ty) in descriptors.types.iter().enumerate() {
        let mut variable = Variable::new(i, charset.decode_field(&descriptors.names[i]), ty.value_type());
        variable.format = charset.decode_field(&descriptors.formats[i]);
        variable.label = charset.decode_field(&descriptors.labels[i]);
        let set = charset.decode_field(&descriptors.label_sets[i]);
        if !set.is_empty() {
            variable.label_set = Some(set);
        }
        variable.storage_width = ty.width();
        dispatcher.variable(&variable)?;
    }

    let row_len: usize = descriptors.types.iter().map(|t| t.width()).sum();
    let strls = match &header.map {
        Some(map) => read_strls(&mut reader, &header, map, &charset)?,
        None => AHashMap::new(),
    };

    // Locate the data section and check it against the declared shape.
    let (data_start, available) = match &header.map {
        Some(map) => {
            let start = map[section::DATA] + b"<data>".len() as u64;
            let end = map[section::STRLS]
                .checked_sub(b"</data>".len() as u64)
                .filter(|&end| end >= start)
                .ok_or_else(|| ReadStatError::parse("data section offsets are inconsistent"))?;
            (start, end - start)
        }
        None => {
            let start = reader.position();
            (start, reader.stream_len()?.saturating_sub(start))
        }
    };
    let needed = header.obs_count.saturating_mul(row_len as u64);
    let exact = header.map.is_some();
    if available < needed || (exact && available != needed) {
        return Err(shape_mismatch(header.obs_count, row_len as u64, available));
    }

    reader.seek_to(data_start)?;
    let mut row = alloc(row_len)?;
    for obs in 0..obs_count {
        reader.read_exact(&mut row)?;
        let mut offset = 0;
        for (var, ty) in descriptors.types.iter().enumerate() {
            let width = ty.width();
            let cell = &row[offset..offset + width];
            offset += width;
            let value = decode_cell(cell, *ty, &header, &charset, &strls)?;
            dispatcher.value(obs, var, &value)?;
        }
    }
    trace!(rows = obs_count, "DTA data emitted");

    match &header.map {
        Some(map) => read_xml_labels(&mut reader, &header, map, &charset, dispatcher),
        None => {
            reader.seek_to(data_start + needed)?;
            read_binary_labels(&mut reader, &header, &charset, dispatcher)
        }
    }
}

fn shape_mismatch(obs_count: u64, row_len: u64, available: u64) -> ReadStatError {
    if row_len == 0 || available % row_len == 0 {
        ReadStatError::RowCountMismatch {
            expected: obs_count,
            actual: available.checked_div(row_len).unwrap_or(0),
        }
    } else {
        ReadStatError::RowWidthMismatch {
            expected: row_len,
            actual: available % row_len,
        }
    }
}

// ----------------------------------------------------------------------------
// Cells
// ----------------------------------------------------------------------------

fn decode_cell(
    cell: &[u8],
    ty: StorageType,
    header: &Header,
    charset: &Charset,
    strls: &AHashMap<(u32, u64), String>,
) -> Result<Value> {
    let release = header.release;
    let e = header.endian;
    let value = match ty {
        StorageType::Byte => {
            let v = cell[0] as i8;
            Value::new(ValueData::Char(v), classify_byte(v, release))
        }
        StorageType::Int => {
            let v = e.u16(cell) as i16;
            Value::new(ValueData::Int16(v), classify_int(v, release))
        }
        StorageType::Long => {
            let v = e.i32(cell);
            Value::new(ValueData::Int32(v), classify_long(v, release))
        }
        StorageType::Float => {
            let v = f32::from_bits(e.u32(cell));
            Value::new(ValueData::Float(v), classify_float(v, release))
        }
        StorageType::Double => {
            let v = e.f64(cell);
            Value::new(ValueData::Double(v), classify_double(v, release))
        }
        StorageType::Str(_) => Value::string(charset.decode(until_nul(cell))),
        StorageType::StrL => {
            let key = strl_ref(cell, release, e);
            if key == (0, 0) {
                Value::long_string("")
            } else {
                let text = strls.get(&key).ok_or_else(|| {
                    ReadStatError::parse(format!("strL ({}, {}) is not in the strL table", key.0, key.1))
                })?;
                Value::long_string(text.clone())
            }
        }
    };
    Ok(value)
}

/// The (variable, observation) key of a strL reference.
fn strl_ref(cell: &[u8], release: DtaRelease, e: Endian) -> (u32, u64) {
    if release == DtaRelease::R117 {
        (e.u32(&cell[0..4]), u64::from(e.u32(&cell[4..8])))
    } else {
        match e {
            Endian::Little => (u32::from(e.u16(&cell[0..2])), e.uint(&cell[2..8])),
            Endian::Big => (u32::from(e.u16(&cell[6..8])), e.uint(&cell[0..6])),
        }
    }
}

// ----------------------------------------------------------------------------
// Releases 104..115
// ----------------------------------------------------------------------------

fn read_binary_header<R: Read>(reader: &mut ByteReader<R>) -> Result<Header> {
    let mut fixed = [0u8; 4];
    if reader.read_up_to(&mut fixed)? < fixed.len() {
        return Err(ReadStatError::parse("file is too short to be a DTA file"));
    }
    let release = DtaRelease::from_code(u16::from(fixed[0]))
        .filter(|r| !r.is_xml())
        .ok_or_else(|| ReadStatError::parse(format!("unrecognized DTA release byte 0x{:02x}", fixed[0])))?;
    let endian = match fixed[1] {
        0x01 => Endian::Big,
        0x02 => Endian::Little,
        other => {
            return Err(ReadStatError::parse(format!(
                "unrecognized DTA byte order 0x{other:02x}"
            )))
        }
    };
    if fixed[2] != 0x01 {
        return Err(ReadStatError::parse("DTA file type is not a dataset"));
    }
    reader.set_endian(endian);
    let var_count = usize::from(reader.read_u16()?);
    let obs_count = u64::from(reader.read_u32()?);
    let data_label = reader.read_fixed_field(release.data_label_len())?;
    let timestamp = reader.read_fixed_field(release.timestamp_len())?;
    Ok(Header {
        release,
        endian,
        var_count,
        obs_count,
        data_label,
        timestamp,
        map: None,
    })
}

fn read_binary_descriptors<R: Read>(
    reader: &mut ByteReader<R>,
    header: &Header,
) -> Result<Descriptors> {
    let release = header.release;
    let k = header.var_count;
    let mut d = Descriptors::default();

    let codes = reader.read_bytes(k)?;
    for (i, &code) in codes.iter().enumerate() {
        let ty = StorageType::from_byte_code(code, release).ok_or_else(|| {
            ReadStatError::parse(format!("variable {i} has unknown type code {code}"))
        })?;
        d.types.push(ty);
    }
    for _ in 0..k {
        d.names.push(reader.read_bytes(release.name_len())?);
    }
    reader.skip(2 * (k as u64 + 1))?;
    for _ in 0..k {
        d.formats.push(reader.read_bytes(release.format_len())?);
    }
    for _ in 0..k {
        d.label_sets.push(reader.read_bytes(release.name_len())?);
    }
    for _ in 0..k {
        d.labels.push(reader.read_bytes(release.variable_label_len())?);
    }

    let len_width = release.expansion_len_width();
    if len_width > 0 {
        loop {
            let data_type = reader.read_u8()?;
            let len = if len_width == 2 {
                u64::from(reader.read_u16()?)
            } else {
                u64::from(reader.read_u32()?)
            };
            if data_type == 0 && len == 0 {
                break;
            }
            trace!(data_type, len, "skipping expansion field");
            reader.skip(len)?;
        }
    }
    Ok(d)
}

fn read_binary_labels<R: Read, H: Handler + ?Sized>(
    reader: &mut ByteReader<R>,
    header: &Header,
    charset: &Charset,
    dispatcher: &mut Dispatcher<'_, H>,
) -> Result<()> {
    let release = header.release;
    loop {
        if release.has_old_value_labels() {
            let mut len_buf = [0u8; 2];
            if !reader.read_exact_or_eof(&mut len_buf)? {
                return Ok(());
            }
            let len = header.endian.u16(&len_buf) as usize;
            let name = reader.read_bytes(9)?;
            reader.skip(1)?;
            let table = reader.read_bytes(len)?;
            emit_old_table(&table, &charset.decode_field(&name), header, charset, dispatcher)?;
        } else {
            let mut len_buf = [0u8; 4];
            if !reader.read_exact_or_eof(&mut len_buf)? {
                return Ok(());
            }
            let len = header.endian.u32(&len_buf) as usize;
            let name = reader.read_bytes(release.name_len())?;
            reader.skip(3)?;
            let table = reader.read_bytes(len)?;
            emit_table(&table, &charset.decode_field(&name), header, charset, dispatcher)?;
        }
    }
}

// ----------------------------------------------------------------------------
// Releases 117 and 118
// ----------------------------------------------------------------------------

fn xml_preamble(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    let (input, _) = tag(&b"<stata_dta><header><release>"[..])(input)?;
    let (input, release) = take(3usize)(input)?;
    let (input, _) = tag(&b"</release><byteorder>"[..])(input)?;
    let (input, order) = take(3usize)(input)?;
    let (input, _) = tag(&b"</byteorder>"[..])(input)?;
    Ok((input, (release, order)))
}

struct XmlCounts<'a> {
    var_count: u16,
    obs_count: u64,
    label: &'a [u8],
    timestamp: &'a [u8],
    map: Vec<u64>,
}

fn xml_counts(input: &[u8], release: DtaRelease, e: Endianness) -> IResult<&[u8], XmlCounts<'_>> {
    let (input, _) = tag(&b"<K>"[..])(input)?;
    let (input, var_count) = nom_u16(e)(input)?;
    let (input, _) = tag(&b"</K><N>"[..])(input)?;
    let (input, obs_count) = if release == DtaRelease::R117 {
        let (input, n) = nom_u32(e)(input)?;
        (input, u64::from(n))
    } else {
        nom_u64(e)(input)?
    };
    let (input, _) = tag(&b"</N><label>"[..])(input)?;
    let (input, label) = if release == DtaRelease::R117 {
        length_data(nom_u8)(input)?
    } else {
        length_data(nom_u16(e))(input)?
    };
    let (input, _) = tag(&b"</label><timestamp>"[..])(input)?;
    let (input, timestamp) = length_data(nom_u8)(input)?;
    let (input, _) = tag(&b"</timestamp></header><map>"[..])(input)?;
    let (input, map) = count(nom_u64(e), 14)(input)?;
    let (input, _) = tag(&b"</map>"[..])(input)?;
    Ok((
        input,
        XmlCounts {
            var_count,
            obs_count,
            label,
            timestamp,
            map,
        },
    ))
}

fn read_xml_header<R: Read + Seek>(reader: &mut ByteReader<R>) -> Result<Header> {
    // label (u16 length) plus the fixed tags always fit
    const MAX_HEADER: u64 = 1 << 17;
    let start = reader.position();
    let len = reader.stream_len()?.saturating_sub(start).min(MAX_HEADER) as usize;
    let prefix = reader.read_bytes(len)?;

    let (rest, (release_text, order)) = xml_preamble(&prefix).map_parse("DTA header")?;
    let release = std::str::from_utf8(release_text)
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .and_then(DtaRelease::from_code)
        .filter(|r| r.is_xml())
        .ok_or_else(|| {
            ReadStatError::parse(format!(
                "unrecognized DTA release {:?}",
                String::from_utf8_lossy(release_text)
            ))
        })?;
    let endian = match order {
        b"LSF" => Endian::Little,
        b"MSF" => Endian::Big,
        _ => return Err(ReadStatError::parse("unrecognized DTA byte order")),
    };
    let (_, counts) = xml_counts(rest, release, nom_endian(endian)).map_parse("DTA header")?;
    reader.set_endian(endian);
    Ok(Header {
        release,
        endian,
        var_count: usize::from(counts.var_count),
        obs_count: counts.obs_count,
        data_label: counts.label.to_vec(),
        timestamp: counts.timestamp.to_vec(),
        map: Some(counts.map),
    })
}

/// Read the bytes between two map entries.
fn read_section<R: Read + Seek>(
    reader: &mut ByteReader<R>,
    map: &[u64],
    from: usize,
    to: usize,
) -> Result<Vec<u8>> {
    let (start, end) = (map[from], map[to]);
    if end < start || end > reader.stream_len()? {
        return Err(ReadStatError::parse(format!(
            "DTA map entries {from}..{to} are out of range"
        )));
    }
    reader.seek_to(start)?;
    reader.read_bytes((end - start) as usize)
}

fn xml_descriptors(
    input: &[u8],
    release: DtaRelease,
    k: usize,
    e: Endianness,
) -> IResult<&[u8], Descriptors> {
    let name_len = release.name_len();
    let (input, _) = tag(&b"<variable_types>"[..])(input)?;
    let (input, codes) = count(nom_u16(e), k)(input)?;
    let (input, _) = tag(&b"</variable_types><varnames>"[..])(input)?;
    let (input, names) = count(take(name_len), k)(input)?;
    let (input, _) = tag(&b"</varnames><sortlist>"[..])(input)?;
    let (input, _) = count(nom_u16(e), k + 1)(input)?;
    let (input, _) = tag(&b"</sortlist><formats>"[..])(input)?;
    let (input, formats) = count(take(release.format_len()), k)(input)?;
    let (input, _) = tag(&b"</formats><value_label_names>"[..])(input)?;
    let (input, label_sets) = count(take(name_len), k)(input)?;
    let (input, _) = tag(&b"</value_label_names><variable_labels>"[..])(input)?;
    let (input, labels) = count(take(release.variable_label_len()), k)(input)?;
    let (input, _) = tag(&b"</variable_labels>"[..])(input)?;

    let owned = |v: Vec<&[u8]>| -> Vec<Vec<u8>> { v.into_iter().map(<[u8]>::to_vec).collect() };
    let mut d = Descriptors {
        names: owned(names),
        formats: owned(formats),
        label_sets: owned(label_sets),
        labels: owned(labels),
        ..Default::default()
    };
    for code in codes {
        match StorageType::from_xml_code(code) {
            Some(ty) => d.types.push(ty),
            None => {
                return Err(nom::Err::Failure(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Verify,
                )))
            }
        }
    }
    Ok((input, d))
}

fn read_xml_descriptors<R: Read + Seek>(
    reader: &mut ByteReader<R>,
    header: &Header,
    map: &[u64],
) -> Result<Descriptors> {
    let bytes = read_section(reader, map, section::VARIABLE_TYPES, section::CHARACTERISTICS)?;
    let (_, d) = xml_descriptors(
        &bytes,
        header.release,
        header.var_count,
        nom_endian(header.endian),
    )
    .map_parse("DTA variable descriptors")?;
    Ok(d)
}

struct Gso<'a> {
    v: u32,
    o: u64,
    binary: bool,
    data: &'a [u8],
}

fn gso(input: &[u8], release: DtaRelease, e: Endianness) -> IResult<&[u8], Gso<'_>> {
    let (input, _) = tag(&b"GSO"[..])(input)?;
    let (input, v) = nom_u32(e)(input)?;
    let (input, o) = if release == DtaRelease::R117 {
        let (input, o) = nom_u32(e)(input)?;
        (input, u64::from(o))
    } else {
        nom_u64(e)(input)?
    };
    let (input, t) = nom_u8(input)?;
    let (input, data) = length_data(nom_u32(e))(input)?;
    Ok((
        input,
        Gso {
            v,
            o,
            binary: t == 129,
            data,
        },
    ))
}

fn read_strls<R: Read + Seek>(
    reader: &mut ByteReader<R>,
    header: &Header,
    map: &[u64],
    charset: &Charset,
) -> Result<AHashMap<(u32, u64), String>> {
    let bytes = read_section(reader, map, section::STRLS, section::VALUE_LABELS)?;
    let e = nom_endian(header.endian);
    let release = header.release;
    let (rest, _) = tag::<_, _, nom::error::Error<&[u8]>>(&b"<strls>"[..])(bytes.as_slice())
        .map_parse("strL table")?;
    let (rest, entries) = many0(|i| gso(i, release, e))(rest).map_parse("strL table")?;
    tag::<_, _, nom::error::Error<&[u8]>>(&b"</strls>"[..])(rest).map_parse("strL table")?;

    let mut table = AHashMap::with_capacity(entries.len());
    for entry in entries {
        let data = if entry.binary {
            entry.data
        } else {
            until_nul(entry.data)
        };
        table.insert((entry.v, entry.o), charset.decode(data));
    }
    debug!(entries = table.len(), "strL table loaded");
    Ok(table)
}

fn read_xml_labels<R: Read + Seek, H: Handler + ?Sized>(
    reader: &mut ByteReader<R>,
    header: &Header,
    map: &[u64],
    charset: &Charset,
    dispatcher: &mut Dispatcher<'_, H>,
) -> Result<()> {
    let release = header.release;
    reader.seek_to(map[section::VALUE_LABELS])?;
    reader.expect(b"<value_labels>", "<value_labels>")?;
    loop {
        let mut open = [0u8; 5];
        reader.read_exact(&mut open)?;
        if &open != b"<lbl>" {
            if &open == b"</val" {
                return reader.expect(b"ue_labels>", "</value_labels>");
            }
            return Err(ReadStatError::parse("expected <lbl> in value labels"));
        }
        let len = reader.read_u32()? as usize;
        let name = reader.read_bytes(release.name_len())?;
        reader.skip(3)?;
        let table = reader.read_bytes(len)?;
        reader.expect(b"</lbl>", "</lbl>")?;
        emit_table(&table, &charset.decode_field(&name), header, charset, dispatcher)?;
    }
}

// ----------------------------------------------------------------------------
// Value-label tables
// ----------------------------------------------------------------------------

/// Modern table: n, txtlen, off[n], val[n], txt.
fn emit_table<H: Handler + ?Sized>(
    table: &[u8],
    set: &str,
    header: &Header,
    charset: &Charset,
    dispatcher: &mut Dispatcher<'_, H>,
) -> Result<()> {
    let e = header.endian;
    let n = e.u32(slice_at(table, 0, 4)?) as usize;
    let txt_len = e.u32(slice_at(table, 4, 4)?) as usize;
    let offsets = slice_at(table, 8, n.saturating_mul(4))?;
    let values = slice_at(table, 8 + 4 * n, 4 * n)?;
    let txt = slice_at(table, 8 + 8 * n, txt_len)?;
    for i in 0..n {
        let off = e.u32(&offsets[4 * i..]) as usize;
        let raw = e.i32(&values[4 * i..]);
        let text = txt
            .get(off..)
            .ok_or_else(|| ReadStatError::parse(format!("label offset {off} in set {set} is out of range")))?;
        let value = Value::new(ValueData::Int32(raw), classify_long(raw, header.release));
        dispatcher.value_label(set, &value, &charset.decode(until_nul(text)))?;
    }
    Ok(())
}

/// Release 104/105 table: i16 values followed by 8-byte labels.
fn emit_old_table<H: Handler + ?Sized>(
    table: &[u8],
    set: &str,
    header: &Header,
    charset: &Charset,
    dispatcher: &mut Dispatcher<'_, H>,
) -> Result<()> {
    let n = table.len() / 10;
    for i in 0..n {
        let raw = header.endian.u16(slice_at(table, 2 * i, 2)?) as i16;
        let label = slice_at(table, 2 * n + 8 * i, 8)?;
        let value = Value::int32(i32::from(raw));
        dispatcher.value_label(set, &value, &charset.decode_field(label))?;
    }
    Ok(())
}
