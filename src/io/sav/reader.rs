//! SAV decoding session.

use std::io::{Read, Seek};

use ahash::AHashMap;
use nom::{
    bytes::complete::{tag, take, take_till, take_till1, take_while},
    multi::{count, length_data, many0},
    number::{
        complete::{u32 as nom_u32, u8 as nom_u8},
        Endianness,
    },
    sequence::{separated_pair, terminated},
    IResult,
};
use tracing::{debug, trace, warn};

use super::compression::BytecodeDecoder;
use super::format::Format;
use super::{
    record, segment_count, subtype, HEADER_LEN, MAGIC, MAGIC_ZLIB, MAX_SHORT_STRING,
    SEGMENT_DATA, SYSMIS,
};
use crate::error::{ReadStatError, Result};
use crate::handler::{Dispatcher, Handler};
use crate::io::charset::{self, Charset};
use crate::io::cursor::{alloc, bounded_vec, trim_field, ByteReader, Endian};
use crate::io::NomResultExt;
use crate::metadata::{Compression, FileFormat, FileMetadata, ValueLabelSet, Variable};
use crate::parser::ParserConfiguration;
use crate::value::{Missing, MissingRule, Value, ValueData, ValueType};

// ----------------------------------------------------------------------------
// Raw records
// ----------------------------------------------------------------------------

struct Header {
    endian: Endian,
    compression: Compression,
    ncases: i32,
    bias: f64,
    date: Vec<u8>,
    time: Vec<u8>,
    label: Vec<u8>,
}

/// A type-2 record that starts a variable or segment.
struct VarRecord {
    width: usize,
    name: Vec<u8>,
    label: Option<Vec<u8>>,
    print_format: i32,
    n_missing: i32,
    missing: Vec<[u8; 8]>,
    first_slot: usize,
}

struct LabelRecord {
    entries: Vec<([u8; 8], Vec<u8>)>,
    /// 1-based slot indices of the variables using the set.
    slots: Vec<usize>,
}

struct LongStringLabels {
    var_name: Vec<u8>,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

struct LongStringMissing {
    var_name: Vec<u8>,
    values: Vec<Vec<u8>>,
}

#[derive(Default)]
struct Dictionary {
    records: Vec<VarRecord>,
    total_slots: usize,
    label_records: Vec<LabelRecord>,
    long_names: Vec<u8>,
    very_long_strings: Vec<u8>,
    encoding: Option<Vec<u8>>,
    code_page: Option<i32>,
    long_labels: Vec<LongStringLabels>,
    long_missing: Vec<LongStringMissing>,
}

/// A logical variable assembled from one or more records.
struct SavVariable {
    variable: Variable,
    /// (byte offset in the row, bytes used) of each segment.
    segments: Vec<(usize, usize)>,
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// Decode a SAV stream into `dispatcher`.
pub(crate) fn read<R: Read + Seek, H: Handler + ?Sized>(
    source: R,
    config: &ParserConfiguration,
    dispatcher: &mut Dispatcher<'_, H>,
) -> Result<()> {
    let mut reader = ByteReader::from_seekable(source, Endian::Little)?;
    let header = read_header(&mut reader)?;
    dispatcher.signature_ok();
    debug!(endian = ?header.endian, compression = ?header.compression, ncases = header.ncases, "SAV header");

    let dict = read_dictionary(&mut reader, header.endian)?;
    let declared = dict
        .encoding
        .as_ref()
        .map(|name| Charset::for_label(&String::from_utf8_lossy(name)))
        .or_else(|| dict.code_page.map(Charset::for_code_page));
    let charset = charset::resolve(config.encoding.as_deref(), declared, Charset::windows_1252())?;

    let mut vars = build_variables(&dict, &charset, header.endian)?;
    let label_sets = build_label_sets(&dict, &mut vars, &charset, header.endian)?;

    let row_len = dict.total_slots * 8;
    let data_start = reader.position();
    let mut rows = RowDecoder::new(&header, row_len);

    let total = if header.ncases >= 0 {
        header.ncases as usize
    } else {
        let n = rows.count(&mut reader)?;
        reader.seek_to(data_start)?;
        rows.reset();
        debug!(rows = n, "SAV case count resolved by counting pass");
        n
    };
    let obs_count = config.rows_to_emit(total);

    let mut metadata = FileMetadata::new(FileFormat::Sav);
    metadata.obs_count = obs_count;
    metadata.var_count = vars.len();
    metadata.file_label = charset.decode_field(&header.label);
    metadata.encoding = charset.name().to_string();
    metadata.compression = header.compression;
    metadata.endian = header.endian;
    let stamp = format!(
        "{} {}",
        charset.decode_field(&header.date),
        charset.decode_field(&header.time)
    );
    if !stamp.trim().is_empty() {
        metadata.timestamp = Some(stamp.trim().to_string());
    }
    dispatcher.info(&metadata)?;

    for var in &vars {
        dispatcher.variable(&var.variable)?;
    }

    if row_len > 0 {
        let mut row = alloc(row_len)?;
        for obs in 0..obs_count {
            if !rows.next_row(&mut reader, &mut row)? {
                return Err(ReadStatError::RowCountMismatch {
                    expected: total as u64,
                    actual: obs as u64,
                });
            }
            for (index, var) in vars.iter().enumerate() {
                let value = decode_cell(&row, var, &charset, header.endian);
                dispatcher.value(obs, index, &value)?;
            }
        }
    }

    for set in &label_sets {
        for (value, label) in set.iter() {
            dispatcher.value_label(set.name(), value, label)?;
        }
    }
    Ok(())
}

fn decode_cell(row: &[u8], var: &SavVariable, charset: &Charset, endian: Endian) -> Value {
    if var.variable.value_type.is_numeric() {
        let (offset, _) = var.segments[0];
        let v = endian.f64(&row[offset..offset + 8]);
        numeric_value(v, &var.variable.missing)
    } else {
        let mut bytes = Vec::with_capacity(var.variable.storage_width);
        for &(offset, used) in &var.segments {
            bytes.extend_from_slice(&row[offset..offset + used]);
        }
        let text = charset.decode(trim_field(&bytes));
        let missing = var.variable.missing.classify_str(&text);
        Value::string(text).with_missing(missing)
    }
}

fn numeric_value(v: f64, rule: &MissingRule) -> Value {
    let missing = if v.to_bits() == SYSMIS.to_bits() || v.is_nan() {
        Missing::System
    } else {
        rule.classify_f64(v)
    };
    Value::new(ValueData::Double(v), missing)
}

// ----------------------------------------------------------------------------
// Rows
// ----------------------------------------------------------------------------

struct RowDecoder {
    bytecode: Option<BytecodeDecoder>,
    row_len: usize,
}

impl RowDecoder {
    fn new(header: &Header, row_len: usize) -> Self {
        let bytecode = (header.compression == Compression::Bytecode)
            .then(|| BytecodeDecoder::new(header.bias, header.endian));
        Self { bytecode, row_len }
    }

    fn reset(&mut self) {
        if let Some(decoder) = &mut self.bytecode {
            decoder.reset();
        }
    }

    /// Fill `row` with the next case. `false` when the data ends cleanly.
    fn next_row<R: Read>(&mut self, reader: &mut ByteReader<R>, row: &mut [u8]) -> Result<bool> {
        match &mut self.bytecode {
            None => {
                let n = reader.read_up_to(row)?;
                if n == 0 {
                    return Ok(false);
                }
                if n < row.len() {
                    return Err(ReadStatError::RowWidthMismatch {
                        expected: row.len() as u64,
                        actual: n as u64,
                    });
                }
                Ok(true)
            }
            Some(decoder) => {
                for (i, slot) in row.chunks_exact_mut(8).enumerate() {
                    if !decoder.next_slot(reader, slot)? {
                        if i == 0 {
                            return Ok(false);
                        }
                        return Err(ReadStatError::RowWidthMismatch {
                            expected: row.len() as u64,
                            actual: 8 * i as u64,
                        });
                    }
                }
                Ok(true)
            }
        }
    }

    fn count<R: Read>(&mut self, reader: &mut ByteReader<R>) -> Result<usize> {
        if self.row_len == 0 {
            return Ok(0);
        }
        let mut row = alloc(self.row_len)?;
        let mut n = 0;
        while self.next_row(reader, &mut row)? {
            n += 1;
        }
        Ok(n)
    }
}

// ----------------------------------------------------------------------------
// Header and dictionary
// ----------------------------------------------------------------------------

fn read_header<R: Read>(reader: &mut ByteReader<R>) -> Result<Header> {
    let mut buf = [0u8; HEADER_LEN];
    let n = reader.read_up_to(&mut buf)?;
    if n < 4 || (&buf[..4] != MAGIC && &buf[..4] != MAGIC_ZLIB) {
        return Err(ReadStatError::parse("not an SPSS system file"));
    }
    if &buf[..4] == MAGIC_ZLIB {
        return Err(ReadStatError::UnsupportedCompression(
            "zlib-compressed system file".into(),
        ));
    }
    if n < HEADER_LEN {
        return Err(ReadStatError::parse("SAV header is truncated"));
    }
    let layout = &buf[64..68];
    let endian = [Endian::Little, Endian::Big]
        .into_iter()
        .find(|e| matches!(e.i32(layout), 2 | 3))
        .ok_or_else(|| ReadStatError::parse("SAV layout code is not 2 or 3"))?;
    reader.set_endian(endian);

    let compression = match endian.i32(&buf[72..76]) {
        0 => Compression::None,
        1 => Compression::Bytecode,
        2 => {
            return Err(ReadStatError::UnsupportedCompression(
                "zlib-compressed system file".into(),
            ))
        }
        other => {
            return Err(ReadStatError::parse(format!(
                "unknown SAV compression code {other}"
            )))
        }
    };
    Ok(Header {
        endian,
        compression,
        ncases: endian.i32(&buf[80..84]),
        bias: endian.f64(&buf[84..92]),
        date: buf[92..101].to_vec(),
        time: buf[101..109].to_vec(),
        label: buf[109..173].to_vec(),
    })
}

fn read_dictionary<R: Read>(reader: &mut ByteReader<R>, endian: Endian) -> Result<Dictionary> {
    let mut dict = Dictionary::default();
    loop {
        let offset = reader.position();
        match reader.read_i32()? {
            record::VARIABLE => read_variable_record(reader, &mut dict)?,
            record::VALUE_LABELS => {
                let labels = read_value_labels(reader)?;
                dict.label_records.push(labels);
            }
            record::VALUE_LABEL_VARS => {
                return Err(ReadStatError::parse(format!(
                    "value label variables record without labels at offset {offset}"
                )))
            }
            record::DOCUMENT => {
                let lines = reader.read_u32()?;
                reader.skip(u64::from(lines) * 80)?;
            }
            record::EXTENSION => read_extension(reader, &mut dict, endian)?,
            record::DICT_END => {
                reader.read_i32()?;
                break;
            }
            other => {
                return Err(ReadStatError::parse(format!(
                    "unknown SAV record type {other} at offset {offset}"
                )))
            }
        }
    }
    trace!(records = dict.records.len(), slots = dict.total_slots, "SAV dictionary read");
    Ok(dict)
}

fn read_variable_record<R: Read>(reader: &mut ByteReader<R>, dict: &mut Dictionary) -> Result<()> {
    let width = reader.read_i32()?;
    let has_label = reader.read_i32()?;
    let n_missing = reader.read_i32()?;
    let print_format = reader.read_i32()?;
    let _write_format = reader.read_i32()?;
    let name = reader.read_bytes(8)?;
    let label = if has_label == 1 {
        let len = reader.read_u32()? as usize;
        let label = reader.read_bytes(len)?;
        reader.skip(((4 - len % 4) % 4) as u64)?;
        Some(label)
    } else {
        None
    };
    let n = match n_missing {
        0..=3 => n_missing as usize,
        -2 => 2,
        -3 => 3,
        other => {
            return Err(ReadStatError::parse(format!(
                "invalid missing value count {other}"
            )))
        }
    };
    let mut missing = Vec::with_capacity(n);
    for _ in 0..n {
        let mut value = [0u8; 8];
        reader.read_exact(&mut value)?;
        missing.push(value);
    }

    let slot = dict.total_slots;
    dict.total_slots += 1;
    match width {
        -1 => {
            if dict.records.last().map_or(true, |last| last.width == 0) {
                return Err(ReadStatError::parse(
                    "continuation record without a string variable",
                ));
            }
        }
        0..=255 => dict.records.push(VarRecord {
            width: width as usize,
            name,
            label,
            print_format,
            n_missing,
            missing,
            first_slot: slot,
        }),
        other => {
            return Err(ReadStatError::parse(format!(
                "invalid variable width {other}"
            )))
        }
    }
    Ok(())
}

fn read_value_labels<R: Read>(reader: &mut ByteReader<R>) -> Result<LabelRecord> {
    let n = reader.read_u32()? as usize;
    let mut entries = bounded_vec(n)?;
    for _ in 0..n {
        let mut value = [0u8; 8];
        reader.read_exact(&mut value)?;
        let len = usize::from(reader.read_u8()?);
        let label = reader.read_bytes(len)?;
        let padded = crate::io::div_ceil(len + 1, 8) * 8;
        reader.skip((padded - len - 1) as u64)?;
        entries.push((value, label));
    }
    let rec_type = reader.read_i32()?;
    if rec_type != record::VALUE_LABEL_VARS {
        return Err(ReadStatError::parse(format!(
            "expected value label variables record, found type {rec_type}"
        )));
    }
    let n_vars = reader.read_u32()? as usize;
    let mut slots = Vec::with_capacity(n_vars.min(1 << 16));
    for _ in 0..n_vars {
        slots.push(reader.read_u32()? as usize);
    }
    Ok(LabelRecord { entries, slots })
}

fn read_extension<R: Read>(
    reader: &mut ByteReader<R>,
    dict: &mut Dictionary,
    endian: Endian,
) -> Result<()> {
    let kind = reader.read_i32()?;
    let size = reader.read_u32()? as usize;
    let count = reader.read_u32()? as usize;
    let len = size
        .checked_mul(count)
        .ok_or_else(|| ReadStatError::parse("extension record size overflows"))?;
    let data = reader.read_bytes(len)?;
    let e = match endian {
        Endian::Little => Endianness::Little,
        Endian::Big => Endianness::Big,
    };
    match kind {
        subtype::MACHINE_INTEGER if size == 4 && count >= 8 => {
            dict.code_page = Some(endian.i32(&data[28..32]));
        }
        subtype::MACHINE_FLOAT | subtype::DISPLAY => {}
        subtype::LONG_NAMES => dict.long_names = data,
        subtype::VERY_LONG_STRINGS => dict.very_long_strings = data,
        subtype::ENCODING => dict.encoding = Some(data),
        subtype::LONG_STRING_LABELS => {
            let (rest, sets) =
                many0(|i| long_string_labels(i, e))(data.as_slice()).map_parse("long string value labels")?;
            if !rest.is_empty() {
                return Err(ReadStatError::parse("trailing bytes in long string value labels"));
            }
            dict.long_labels.extend(sets);
        }
        subtype::LONG_STRING_MISSING => {
            let (rest, sets) =
                many0(|i| long_string_missing(i, e))(data.as_slice()).map_parse("long string missing values")?;
            if !rest.is_empty() {
                return Err(ReadStatError::parse("trailing bytes in long string missing values"));
            }
            dict.long_missing.extend(sets);
        }
        other => warn!(subtype = other, len, "skipping SAV extension record"),
    }
    Ok(())
}

fn long_string_labels(input: &[u8], e: Endianness) -> IResult<&[u8], LongStringLabels> {
    let (input, var_name) = length_data(nom_u32(e))(input)?;
    let (input, _width) = nom_u32(e)(input)?;
    let (input, n) = nom_u32(e)(input)?;
    let (input, entries) = count(|i| label_entry(i, e), n as usize)(input)?;
    Ok((
        input,
        LongStringLabels {
            var_name: var_name.to_vec(),
            entries,
        },
    ))
}

fn label_entry(input: &[u8], e: Endianness) -> IResult<&[u8], (Vec<u8>, Vec<u8>)> {
    let (input, value) = length_data(nom_u32(e))(input)?;
    let (input, label) = length_data(nom_u32(e))(input)?;
    Ok((input, (value.to_vec(), label.to_vec())))
}

fn long_string_missing(input: &[u8], e: Endianness) -> IResult<&[u8], LongStringMissing> {
    let (input, var_name) = length_data(nom_u32(e))(input)?;
    let (input, n) = nom_u8(input)?;
    let (input, value_len) = nom_u32(e)(input)?;
    let (input, values) = count(take(value_len as usize), usize::from(n))(input)?;
    Ok((
        input,
        LongStringMissing {
            var_name: var_name.to_vec(),
            values: values.into_iter().map(<[u8]>::to_vec).collect(),
        },
    ))
}

/// `KEY=value` pairs separated by tabs (and NULs, for very long strings).
fn key_value_pairs(input: &[u8]) -> IResult<&[u8], Vec<(&[u8], &[u8])>> {
    let separator = |c: u8| c == b'\t' || c == 0;
    many0(terminated(
        separated_pair(
            take_till1(move |c| c == b'=' || separator(c)),
            tag("="),
            take_till(separator),
        ),
        take_while(separator),
    ))(input)
}

// ----------------------------------------------------------------------------
// Variables and label sets
// ----------------------------------------------------------------------------

fn ascii_key(bytes: &[u8]) -> String {
    String::from_utf8_lossy(trim_field(bytes)).to_ascii_uppercase()
}

fn build_variables(dict: &Dictionary, charset: &Charset, endian: Endian) -> Result<Vec<SavVariable>> {
    let (_, pairs) = key_value_pairs(&dict.very_long_strings).map_parse("very long string record")?;
    let mut very_long: AHashMap<String, usize> = AHashMap::new();
    for (key, value) in pairs {
        let width = String::from_utf8_lossy(trim_field(value))
            .trim()
            .parse::<usize>()
            .map_err(|_| ReadStatError::parse("invalid very long string width"))?;
        very_long.insert(ascii_key(key), width);
    }

    let (_, pairs) = key_value_pairs(&dict.long_names).map_parse("long variable names record")?;
    let long_names: AHashMap<String, &[u8]> =
        pairs.into_iter().map(|(k, v)| (ascii_key(k), v)).collect();

    let mut vars = Vec::with_capacity(dict.records.len());
    let mut i = 0;
    while i < dict.records.len() {
        let rec = &dict.records[i];
        let key = ascii_key(&rec.name);
        let declared = very_long.get(&key).copied().filter(|&w| w > MAX_SHORT_STRING);
        let (width, n_segments) = match declared {
            Some(w) if rec.width > 0 => (w, segment_count(w)),
            _ => (rec.width, 1),
        };
        let group = dict.records.get(i..i + n_segments).ok_or_else(|| {
            ReadStatError::parse(format!("very long string {key} is missing segments"))
        })?;

        let value_type = if width == 0 {
            ValueType::Double
        } else {
            ValueType::String
        };
        let mut variable = Variable::new(vars.len(), charset.decode_field(&rec.name), value_type);
        variable.long_name = long_names
            .get(&key)
            .map(|long| charset.decode_field(long));
        variable.format = Format::unpack(rec.print_format).to_string();
        if let Some(label) = &rec.label {
            variable.label = charset.decode(label);
        }
        variable.storage_width = if width == 0 { 8 } else { width };
        variable.missing = missing_rule(rec, value_type, charset, endian);

        let segments = if width == 0 {
            vec![(rec.first_slot * 8, 8)]
        } else {
            group
                .iter()
                .map(|seg| (seg.first_slot * 8, seg.width.min(SEGMENT_DATA)))
                .collect()
        };
        vars.push(SavVariable { variable, segments });
        i += n_segments;
    }

    for entry in &dict.long_missing {
        let name = charset.decode_field(&entry.var_name);
        if let Some(var) = find_by_name(&mut vars, &name) {
            var.variable.missing = MissingRule::Strings(
                entry
                    .values
                    .iter()
                    .map(|v| charset.decode_field(v))
                    .collect(),
            );
        }
    }
    Ok(vars)
}

fn find_by_name<'a>(vars: &'a mut [SavVariable], name: &str) -> Option<&'a mut SavVariable> {
    vars.iter_mut().find(|v| {
        v.variable.name.eq_ignore_ascii_case(name)
            || v
                .variable
                .long_name
                .as_deref()
                .is_some_and(|long| long.eq_ignore_ascii_case(name))
    })
}

fn missing_rule(rec: &VarRecord, value_type: ValueType, charset: &Charset, endian: Endian) -> MissingRule {
    if rec.missing.is_empty() {
        return MissingRule::None;
    }
    if value_type.is_string() {
        return MissingRule::Strings(rec.missing.iter().map(|v| charset.decode_field(v)).collect());
    }
    let values: Vec<f64> = rec.missing.iter().map(|v| endian.f64(v)).collect();
    match rec.n_missing {
        -2 => MissingRule::Range {
            low: values[0],
            high: values[1],
            discrete: None,
        },
        -3 => MissingRule::Range {
            low: values[0],
            high: values[1],
            discrete: Some(values[2]),
        },
        _ => MissingRule::Discrete(values),
    }
}

fn build_label_sets(
    dict: &Dictionary,
    vars: &mut [SavVariable],
    charset: &Charset,
    endian: Endian,
) -> Result<Vec<ValueLabelSet>> {
    let slot_to_var: AHashMap<usize, usize> = vars
        .iter()
        .enumerate()
        .map(|(i, v)| (v.segments[0].0 / 8 + 1, i))
        .collect();

    let mut sets = Vec::new();
    for rec in &dict.label_records {
        let name = format!("labels{}", sets.len());
        let mut members = Vec::with_capacity(rec.slots.len());
        for slot in &rec.slots {
            let index = *slot_to_var.get(slot).ok_or_else(|| {
                ReadStatError::parse(format!("value labels refer to unknown slot {slot}"))
            })?;
            members.push(index);
        }
        let Some(&first) = members.first() else {
            continue;
        };
        let is_string = vars[first].variable.value_type.is_string();
        let mut set = ValueLabelSet::new(name.clone());
        for (raw, label) in &rec.entries {
            let value = if is_string {
                Value::string(charset.decode_field(raw))
            } else {
                numeric_value(endian.f64(raw), &MissingRule::None)
            };
            set.insert(value, charset.decode(label));
        }
        for index in members {
            vars[index].variable.label_set = Some(name.clone());
        }
        sets.push(set);
    }

    for rec in &dict.long_labels {
        let name = format!("labels{}", sets.len());
        let var_name = charset.decode_field(&rec.var_name);
        let Some(var) = find_by_name(vars, &var_name) else {
            warn!(variable = %var_name, "long string labels for unknown variable");
            continue;
        };
        var.variable.label_set = Some(name.clone());
        let mut set = ValueLabelSet::new(name);
        for (value, label) in &rec.entries {
            set.insert(Value::string(charset.decode_field(value)), charset.decode(label));
        }
        sets.push(set);
    }
    Ok(sets)
}
