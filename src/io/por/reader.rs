//! POR decoding session.

use std::io::{Read, Seek};

use chrono::NaiveDateTime;
use tracing::{debug, trace};

use super::stream::PorStream;
use super::{tag, TranslationTable, SIGNATURE, SPLASH_LEN, TABLE_LEN};
use crate::error::{ReadStatError, Result};
use crate::handler::{Dispatcher, Handler};
use crate::io::charset::{self, Charset};
use crate::io::cursor::{ByteReader, Endian};
use crate::io::sav::format::Format;
use crate::io::sav::{HIGHEST, LOWEST};
use crate::metadata::{FileFormat, FileMetadata, ValueLabelSet, Variable};
use crate::parser::ParserConfiguration;
use crate::value::{Missing, MissingRule, Value, ValueData, ValueType};

/// Missing-value declarations collected for one variable.
#[derive(Default)]
struct MissingSpec {
    discrete: Vec<f64>,
    range: Option<(f64, f64)>,
    strings: Vec<String>,
}

impl MissingSpec {
    fn into_rule(self) -> MissingRule {
        if !self.strings.is_empty() {
            return MissingRule::Strings(self.strings);
        }
        match self.range {
            Some((low, high)) => MissingRule::Range {
                low,
                high,
                discrete: self.discrete.first().copied(),
            },
            None if !self.discrete.is_empty() => MissingRule::Discrete(self.discrete),
            None => MissingRule::None,
        }
    }
}

struct Dictionary {
    variables: Vec<Variable>,
    missing: Vec<MissingSpec>,
    label_sets: Vec<ValueLabelSet>,
    timestamp: Option<String>,
}

/// Decode a portable file into `dispatcher`.
pub(crate) fn read<R: Read + Seek, H: Handler + ?Sized>(
    source: R,
    config: &ParserConfiguration,
    dispatcher: &mut Dispatcher<'_, H>,
) -> Result<()> {
    let mut stream = PorStream::new(ByteReader::from_seekable(source, Endian::Big)?);
    read_signature(&mut stream)?;
    dispatcher.signature_ok();

    let charset = charset::resolve(config.encoding.as_deref(), None, Charset::windows_1252())?;
    let dict = read_dictionary(&mut stream, &charset)?;
    let mut variables = dict.variables;
    for (variable, spec) in variables.iter_mut().zip(dict.missing) {
        variable.missing = spec.into_rule();
    }

    let data_start = stream.mark();
    let total = count_rows(&mut stream, &variables)?;
    stream.reset_to(data_start)?;
    debug!(rows = total, vars = variables.len(), "POR case count resolved by counting pass");

    let mut metadata = FileMetadata::new(FileFormat::Por);
    metadata.obs_count = config.rows_to_emit(total);
    metadata.var_count = variables.len();
    metadata.encoding = charset.name().to_string();
    metadata.endian = Endian::Big;
    metadata.timestamp = dict.timestamp;
    dispatcher.info(&metadata)?;

    for variable in &variables {
        dispatcher.variable(variable)?;
    }

    for obs in 0..metadata.obs_count {
        if stream.peek_significant()? == Some(tag::END_OF_DATA) {
            return Err(ReadStatError::RowCountMismatch {
                expected: total as u64,
                actual: obs as u64,
            });
        }
        for (index, variable) in variables.iter().enumerate() {
            let value = read_cell(&mut stream, variable, &charset)?;
            dispatcher.value(obs, index, &value)?;
        }
    }

    for set in &dict.label_sets {
        for (value, label) in set.iter() {
            dispatcher.value_label(set.name(), value, label)?;
        }
    }
    Ok(())
}

fn read_signature<R: Read + Seek>(stream: &mut PorStream<R>) -> Result<()> {
    let not_portable = || ReadStatError::parse("not an SPSS portable file");
    let mut splash = [0u8; SPLASH_LEN];
    if !stream.read_raw(&mut splash)? {
        return Err(not_portable());
    }
    let mut raw_table = [0u8; TABLE_LEN];
    if !stream.read_raw(&mut raw_table)? {
        return Err(not_portable());
    }
    let table = TranslationTable::new(&raw_table);
    let mut signature = [0u8; 8];
    if !stream.read_raw(&mut signature)? {
        return Err(not_portable());
    }
    let translated: Option<Vec<u8>> = signature.iter().map(|&b| table.translate(b)).collect();
    if translated.as_deref() != Some(&SIGNATURE[..]) {
        return Err(not_portable());
    }
    stream.set_table(table);
    Ok(())
}

fn read_dictionary<R: Read + Seek>(stream: &mut PorStream<R>, charset: &Charset) -> Result<Dictionary> {
    let version = stream.expect_char()?;
    let date = charset.decode(&stream.read_string()?);
    let time = charset.decode(&stream.read_string()?);
    trace!(version = %char::from(version), %date, %time, "POR version record");
    let timestamp = NaiveDateTime::parse_from_str(&format!("{date}{time}"), "%Y%m%d%H%M%S")
        .map(|t| t.format("%d %b %Y %H:%M:%S").to_string())
        .ok();

    let mut dict = Dictionary {
        variables: Vec::new(),
        missing: Vec::new(),
        label_sets: Vec::new(),
        timestamp,
    };

    loop {
        let record = stream.expect_char()?;
        match record {
            tag::PRODUCT | tag::AUTHOR | tag::SUBPRODUCT | tag::WEIGHT => {
                stream.read_string()?;
            }
            tag::VARIABLE_COUNT | tag::PRECISION => {
                stream.read_int()?;
            }
            tag::VARIABLE => {
                let width = stream.read_count()?;
                let name = charset.decode(&stream.read_string()?);
                let print = read_format(stream)?;
                let _write = read_format(stream)?;
                let value_type = if width == 0 {
                    ValueType::Double
                } else {
                    ValueType::String
                };
                let mut variable = Variable::new(dict.variables.len(), name, value_type);
                variable.format = print.to_string();
                variable.storage_width = if width == 0 { 8 } else { width };
                dict.variables.push(variable);
                dict.missing.push(MissingSpec::default());
            }
            tag::MISSING | tag::MISSING_LO_THRU | tag::MISSING_THRU_HI | tag::MISSING_RANGE => {
                let is_string = dict
                    .variables
                    .last()
                    .ok_or_else(|| ReadStatError::parse("missing values before any variable"))?
                    .value_type
                    .is_string();
                let spec = dict
                    .missing
                    .last_mut()
                    .ok_or_else(|| ReadStatError::parse("missing values before any variable"))?;
                read_missing(stream, record, is_string, spec, charset)?;
            }
            tag::VARIABLE_LABEL => {
                let label = charset.decode(&stream.read_string()?);
                let variable = dict
                    .variables
                    .last_mut()
                    .ok_or_else(|| ReadStatError::parse("variable label before any variable"))?;
                variable.label = label;
            }
            tag::VALUE_LABELS => {
                let set = read_value_labels(stream, &mut dict, charset)?;
                dict.label_sets.push(set);
            }
            tag::DOCUMENT => {
                let lines = stream.read_count()?;
                for _ in 0..lines {
                    stream.read_string()?;
                }
            }
            tag::DATA => break,
            other => {
                return Err(ReadStatError::parse(format!(
                    "unknown portable record tag {:?}",
                    char::from(other)
                )))
            }
        }
    }
    Ok(dict)
}

fn read_format<R: Read + Seek>(stream: &mut PorStream<R>) -> Result<Format> {
    let mut field = || -> Result<u8> {
        let v = stream.read_int()?;
        u8::try_from(v).map_err(|_| ReadStatError::parse(format!("format field {v} out of range")))
    };
    Ok(Format {
        format_type: field()?,
        width: field()?,
        decimals: field()?,
    })
}

fn read_missing<R: Read + Seek>(
    stream: &mut PorStream<R>,
    record: u8,
    is_string: bool,
    spec: &mut MissingSpec,
    charset: &Charset,
) -> Result<()> {
    if is_string {
        if record != tag::MISSING {
            return Err(ReadStatError::parse("missing range on a string variable"));
        }
        let value = charset.decode(&stream.read_string()?);
        spec.strings.push(value.trim_end().to_string());
        return Ok(());
    }
    let mut number = || -> Result<f64> {
        stream
            .read_number()?
            .ok_or_else(|| ReadStatError::parse("system-missing used as a missing value"))
    };
    match record {
        tag::MISSING => spec.discrete.push(number()?),
        tag::MISSING_LO_THRU => spec.range = Some((LOWEST, number()?)),
        tag::MISSING_THRU_HI => spec.range = Some((number()?, HIGHEST)),
        _ => {
            let low = number()?;
            let high = number()?;
            spec.range = Some((low, high));
        }
    }
    Ok(())
}

fn read_value_labels<R: Read + Seek>(
    stream: &mut PorStream<R>,
    dict: &mut Dictionary,
    charset: &Charset,
) -> Result<ValueLabelSet> {
    let name = format!("labels{}", dict.label_sets.len());
    let n_vars = stream.read_count()?;
    let mut is_string = None;
    for _ in 0..n_vars {
        let var_name = charset.decode(&stream.read_string()?);
        let variable = dict
            .variables
            .iter_mut()
            .find(|v| v.name == var_name)
            .ok_or_else(|| {
                ReadStatError::parse(format!("value labels for unknown variable {var_name}"))
            })?;
        variable.label_set = Some(name.clone());
        is_string.get_or_insert(variable.value_type.is_string());
    }
    let is_string = is_string.unwrap_or(false);

    let mut set = ValueLabelSet::new(name);
    let n_labels = stream.read_count()?;
    for _ in 0..n_labels {
        let value = if is_string {
            Value::string(charset.decode(&stream.read_string()?).trim_end())
        } else {
            numeric_value(stream.read_number()?, &MissingRule::None)
        };
        let label = charset.decode(&stream.read_string()?);
        set.insert(value, label);
    }
    Ok(set)
}

fn numeric_value(v: Option<f64>, rule: &MissingRule) -> Value {
    match v {
        Some(v) => Value::new(ValueData::Double(v), rule.classify_f64(v)),
        None => Value::missing(ValueType::Double, Missing::System),
    }
}

fn read_cell<R: Read + Seek>(
    stream: &mut PorStream<R>,
    variable: &Variable,
    charset: &Charset,
) -> Result<Value> {
    if variable.value_type.is_numeric() {
        return Ok(numeric_value(stream.read_number()?, &variable.missing));
    }
    let raw = stream.read_string()?;
    let text = charset.decode(&raw).trim_end().to_string();
    let missing = variable.missing.classify_str(&text);
    Ok(Value::string(text).with_missing(missing))
}

/// Count the cases between the data tag and the end marker.
fn count_rows<R: Read + Seek>(stream: &mut PorStream<R>, variables: &[Variable]) -> Result<usize> {
    if variables.is_empty() {
        return Ok(0);
    }
    let mut rows = 0;
    loop {
        match stream.peek_significant()? {
            None | Some(tag::END_OF_DATA) => return Ok(rows),
            Some(_) => {}
        }
        for (read, variable) in variables.iter().enumerate() {
            if read > 0 && matches!(stream.peek_significant()?, None | Some(tag::END_OF_DATA)) {
                return Err(ReadStatError::RowWidthMismatch {
                    expected: variables.len() as u64,
                    actual: read as u64,
                });
            }
            if variable.value_type.is_numeric() {
                stream.read_number()?;
            } else {
                stream.read_string()?;
            }
        }
        rows += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_spec_rules() {
        let spec = MissingSpec {
            discrete: vec![9.0],
            range: Some((LOWEST, 0.0)),
            strings: Vec::new(),
        };
        assert_eq!(
            spec.into_rule(),
            MissingRule::Range {
                low: LOWEST,
                high: 0.0,
                discrete: Some(9.0)
            }
        );
        let spec = MissingSpec {
            discrete: vec![1.0, 2.0],
            ..Default::default()
        };
        assert_eq!(spec.into_rule(), MissingRule::Discrete(vec![1.0, 2.0]));
        assert_eq!(MissingSpec::default().into_rule(), MissingRule::None);
    }

    #[test]
    fn test_numeric_value() {
        assert_eq!(
            numeric_value(None, &MissingRule::None).missing_kind(),
            Missing::System
        );
        let rule = MissingRule::Discrete(vec![-1.0]);
        assert!(numeric_value(Some(-1.0), &rule).is_missing());
        assert!(!numeric_value(Some(1.0), &rule).is_missing());
    }
}
