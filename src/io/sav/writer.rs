//! SAV encoding session.
//!
//! [`SavWriter`] pulls the dictionary and every cell from a [`SavSource`]
//! and pushes a complete system file into any [`Write`] sink. Text is always
//! written as UTF-8 and declared as such in the encoding record.

use std::io::Write;

use chrono::NaiveDateTime;
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::compression::{BytecodeEncoder, SlotKind};
use super::format::Format;
use super::{
    record, segment_count, segment_width, slots_for_width, subtype, BIAS, HIGHEST, LOWEST,
    MAGIC, MAX_SHORT_STRING, SEGMENT_DATA, SYSMIS,
};
use crate::error::{ReadStatError, Result};
use crate::io::cursor::{ByteWriter, Endian};
use crate::value::{Missing, MissingRule, Value, ValueType};
use crate::VERSION;

// ----------------------------------------------------------------------------
// File label
// ----------------------------------------------------------------------------

/// A file label longer than the header field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("file label is {len} bytes, at most {} fit the header", FileLabel::CAPACITY)]
pub struct FileLabelTooLong {
    pub len: usize,
}

/// Text for the fixed 64-byte label field of the file header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileLabel(String);

impl FileLabel {
    /// Capacity of the header field in bytes.
    pub const CAPACITY: usize = 64;

    /// Accept `text` if its UTF-8 encoding fits the field.
    pub fn new(text: impl Into<String>) -> std::result::Result<Self, FileLabelTooLong> {
        let text = text.into();
        if text.len() > Self::CAPACITY {
            return Err(FileLabelTooLong { len: text.len() });
        }
        Ok(Self(text))
    }

    /// Keep as many whole characters of `text` as fit the field.
    pub fn truncate(text: &str) -> Self {
        Self(truncate_str(text, Self::CAPACITY).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for FileLabel {
    type Error = FileLabelTooLong;

    fn try_from(text: &str) -> std::result::Result<Self, Self::Error> {
        Self::new(text)
    }
}

impl TryFrom<String> for FileLabel {
    type Error = FileLabelTooLong;

    fn try_from(text: String) -> std::result::Result<Self, Self::Error> {
        Self::new(text)
    }
}

fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ----------------------------------------------------------------------------
// Providers
// ----------------------------------------------------------------------------

/// Data compression of the written file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SavCompression {
    None,
    #[default]
    Bytecode,
}

/// Pull interface the writer reads the dataset through.
///
/// Variables are indexed `0..var_count`, observations `0..obs_count`.
/// Any numeric [`ValueType`] declares a numeric variable; values of any
/// numeric type are widened to `f64`.
pub trait SavSource {
    /// Short name, at most 8 bytes; longer names are cut.
    fn short_name(&mut self, var: usize) -> String;

    /// Long name written to the long-names record.
    fn long_name(&mut self, _var: usize) -> Option<String> {
        None
    }

    fn value_type(&mut self, var: usize) -> ValueType;

    /// Display format such as `F8.2`; `None` picks `F8.2` or `A<width>`.
    fn format(&mut self, _var: usize) -> Option<String> {
        None
    }

    /// Storage width in bytes of a string variable. Ignored for numerics.
    fn width(&mut self, _var: usize) -> usize {
        8
    }

    fn variable_label(&mut self, _var: usize) -> Option<String> {
        None
    }

    fn missing_rule(&mut self, _var: usize) -> MissingRule {
        MissingRule::None
    }

    fn value(&mut self, obs: usize, var: usize) -> Value;

    /// Number of value labels attached to `var`.
    fn vlabel_count(&mut self, _var: usize) -> usize {
        0
    }

    fn vlabel_value(&mut self, var: usize, _index: usize) -> Value {
        Value::missing(self.value_type(var), Missing::System)
    }

    fn vlabel_label(&mut self, _var: usize, _index: usize) -> String {
        String::new()
    }

    /// Polled before every row; `true` stops the write with `UserAbort`.
    fn cancelled(&mut self) -> bool {
        false
    }
}

// ----------------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------------

/// Dictionary entry for one variable, as pulled from the source.
struct VarPlan {
    short_name: String,
    long_name: Option<String>,
    /// 0 for numeric variables.
    width: usize,
    format: Format,
    label: Option<String>,
    missing: MissingRule,
    labels: Vec<(Value, String)>,
}

impl VarPlan {
    fn is_string(&self) -> bool {
        self.width > 0
    }

    /// Declared width of each segment record.
    fn segment_widths(&self) -> Vec<usize> {
        if !self.is_string() {
            return vec![0];
        }
        (0..segment_count(self.width))
            .map(|i| segment_width(self.width, i))
            .collect()
    }

    /// Name of segment `index`; continuation segments reuse a name prefix.
    fn segment_name(&self, index: usize) -> String {
        if index == 0 {
            return self.short_name.clone();
        }
        let prefix = truncate_str(&self.short_name, 5);
        format!("{prefix}{index}")
    }

    fn label_name(&self) -> &str {
        self.long_name.as_deref().unwrap_or(&self.short_name)
    }
}

/// Encoder for SPSS system files.
pub struct SavWriter<W: Write> {
    writer: ByteWriter<W>,
    compression: SavCompression,
    file_label: FileLabel,
    timestamp: NaiveDateTime,
}

impl<W: Write> SavWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: ByteWriter::new(sink, Endian::Little),
            compression: SavCompression::default(),
            file_label: FileLabel::default(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn with_compression(mut self, compression: SavCompression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_file_label(mut self, label: FileLabel) -> Self {
        self.file_label = label;
        self
    }

    /// Creation time recorded in the header. Default: now.
    pub fn with_timestamp(mut self, timestamp: NaiveDateTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Bytes pushed to the sink so far.
    pub fn bytes_written(&self) -> u64 {
        self.writer.position()
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    /// Write `obs_count` rows of `var_count` variables pulled from `source`.
    pub fn write<S: SavSource + ?Sized>(
        &mut self,
        source: &mut S,
        obs_count: usize,
        var_count: usize,
    ) -> Result<()> {
        let plans: Vec<VarPlan> = (0..var_count).map(|var| plan_variable(source, var)).collect();
        let total_slots: usize = plans
            .iter()
            .flat_map(|p| p.segment_widths())
            .map(slots_for_width)
            .sum();
        debug!(obs_count, var_count, total_slots, compression = ?self.compression, "writing SAV file");

        self.write_header(total_slots, obs_count)?;
        for plan in &plans {
            self.write_variable(plan)?;
        }
        self.write_value_labels(&plans)?;
        self.write_extensions(&plans)?;
        self.writer.write_i32(record::DICT_END)?;
        self.writer.write_i32(0)?;

        self.write_data(source, &plans, obs_count)?;
        self.writer.flush()
    }

    // -- Header and dictionary ---------------------------------------------

    fn write_header(&mut self, total_slots: usize, obs_count: usize) -> Result<()> {
        let product = format!("@(#) SPSS DATA FILE - readstat-rs {VERSION}");
        self.writer.write_bytes(MAGIC)?;
        self.writer.write_padded(product.as_bytes(), 60, b' ')?;
        self.writer.write_i32(2)?;
        self.writer.write_i32(i32::try_from(total_slots).unwrap_or(-1))?;
        self.writer.write_i32(match self.compression {
            SavCompression::None => 0,
            SavCompression::Bytecode => 1,
        })?;
        self.writer.write_i32(0)?;
        self.writer.write_i32(i32::try_from(obs_count).unwrap_or(-1))?;
        self.writer.write_f64(BIAS)?;
        let date = self.timestamp.format("%d %b %y").to_string();
        let time = self.timestamp.format("%H:%M:%S").to_string();
        self.writer.write_padded(date.as_bytes(), 9, b' ')?;
        self.writer.write_padded(time.as_bytes(), 8, b' ')?;
        let label = self.file_label.as_str().as_bytes().to_vec();
        self.writer.write_padded(&label, FileLabel::CAPACITY, b' ')?;
        self.writer.write_padded(&[], 3, 0)
    }

    fn write_variable(&mut self, plan: &VarPlan) -> Result<()> {
        let missing = if plan.is_string() && plan.width > 8 {
            Vec::new()
        } else {
            missing_slots(plan)
        };
        for (index, width) in plan.segment_widths().into_iter().enumerate() {
            let first = index == 0;
            let format = if first {
                plan.format
            } else {
                Format::default_for(true, width)
            };
            let label = plan.label.as_ref().filter(|_| first);

            self.writer.write_i32(record::VARIABLE)?;
            self.writer.write_i32(width as i32)?;
            self.writer.write_i32(i32::from(label.is_some()))?;
            let n_missing = if first { missing_code(&plan.missing, missing.len()) } else { 0 };
            self.writer.write_i32(n_missing)?;
            self.writer.write_i32(format.pack())?;
            self.writer.write_i32(format.pack())?;
            self.writer
                .write_padded(plan.segment_name(index).as_bytes(), 8, b' ')?;
            if let Some(label) = label {
                let bytes = label.as_bytes();
                self.writer.write_i32(bytes.len() as i32)?;
                self.writer.write_bytes(bytes)?;
                self.writer.write_padded(&[], (4 - bytes.len() % 4) % 4, b' ')?;
            }
            if first {
                for slot in &missing {
                    self.writer.write_bytes(slot)?;
                }
            }
            for _ in 1..slots_for_width(width) {
                self.write_continuation()?;
            }
        }
        Ok(())
    }

    fn write_continuation(&mut self) -> Result<()> {
        self.writer.write_i32(record::VARIABLE)?;
        self.writer.write_i32(-1)?;
        for _ in 0..4 {
            self.writer.write_i32(0)?;
        }
        self.writer.write_padded(&[], 8, b' ')
    }

    fn write_value_labels(&mut self, plans: &[VarPlan]) -> Result<()> {
        let mut slot = 1usize;
        for plan in plans {
            let first_slot = slot;
            slot += plan
                .segment_widths()
                .into_iter()
                .map(slots_for_width)
                .sum::<usize>();
            if plan.labels.is_empty() || plan.width > 8 {
                continue;
            }
            self.writer.write_i32(record::VALUE_LABELS)?;
            self.writer.write_i32(plan.labels.len() as i32)?;
            for (value, label) in &plan.labels {
                self.writer.write_bytes(&short_slot(plan, value))?;
                let label = truncate_str(label, 255).as_bytes();
                self.writer.write_u8(label.len() as u8)?;
                self.writer.write_bytes(label)?;
                let padded = crate::io::div_ceil(label.len() + 1, 8) * 8;
                self.writer.write_padded(&[], padded - label.len() - 1, b' ')?;
            }
            self.writer.write_i32(record::VALUE_LABEL_VARS)?;
            self.writer.write_i32(1)?;
            self.writer.write_i32(first_slot as i32)?;
        }
        Ok(())
    }

    fn write_extension(&mut self, kind: i32, size: usize, data: &[u8]) -> Result<()> {
        trace!(subtype = kind, len = data.len(), "writing extension record");
        self.writer.write_i32(record::EXTENSION)?;
        self.writer.write_i32(kind)?;
        self.writer.write_i32(size as i32)?;
        self.writer.write_i32((data.len() / size) as i32)?;
        self.writer.write_bytes(data)
    }

    fn write_extensions(&mut self, plans: &[VarPlan]) -> Result<()> {
        let mut machine = Vec::with_capacity(32);
        for v in [1i32, 0, 0, -1, 1, 1, 2, 65001] {
            machine.extend_from_slice(&v.to_le_bytes());
        }
        self.write_extension(subtype::MACHINE_INTEGER, 4, &machine)?;

        let mut float = Vec::with_capacity(24);
        for v in [SYSMIS, HIGHEST, LOWEST] {
            float.extend_from_slice(&v.to_le_bytes());
        }
        self.write_extension(subtype::MACHINE_FLOAT, 8, &float)?;

        let long_names: Vec<String> = plans
            .iter()
            .filter_map(|p| {
                p.long_name
                    .as_ref()
                    .map(|long| format!("{}={long}", p.short_name))
            })
            .collect();
        if !long_names.is_empty() {
            self.write_extension(subtype::LONG_NAMES, 1, long_names.join("\t").as_bytes())?;
        }

        let very_long: String = plans
            .iter()
            .filter(|p| p.width > MAX_SHORT_STRING)
            .map(|p| format!("{}={:05}\0\t", p.short_name, p.width))
            .collect();
        if !very_long.is_empty() {
            self.write_extension(subtype::VERY_LONG_STRINGS, 1, very_long.as_bytes())?;
        }

        self.write_extension(subtype::ENCODING, 1, b"UTF-8")?;

        let mut labels = Vec::new();
        for plan in plans.iter().filter(|p| p.width > 8 && !p.labels.is_empty()) {
            put_counted(&mut labels, plan.label_name().as_bytes());
            labels.extend_from_slice(&(plan.width as u32).to_le_bytes());
            labels.extend_from_slice(&(plan.labels.len() as u32).to_le_bytes());
            for (value, label) in &plan.labels {
                let text = value.as_str().unwrap_or_default();
                put_counted(&mut labels, &padded_text(text, plan.width));
                put_counted(&mut labels, label.as_bytes());
            }
        }
        if !labels.is_empty() {
            self.write_extension(subtype::LONG_STRING_LABELS, 1, &labels)?;
        }

        let mut missing = Vec::new();
        for plan in plans.iter().filter(|p| p.width > 8) {
            let MissingRule::Strings(values) = &plan.missing else {
                continue;
            };
            if values.is_empty() {
                continue;
            }
            put_counted(&mut missing, plan.short_name.as_bytes());
            missing.push(values.len().min(3) as u8);
            missing.extend_from_slice(&8u32.to_le_bytes());
            for value in values.iter().take(3) {
                missing.extend_from_slice(&padded_text(value, 8));
            }
        }
        if !missing.is_empty() {
            self.write_extension(subtype::LONG_STRING_MISSING, 1, &missing)?;
        }
        Ok(())
    }

    // -- Data ----------------------------------------------------------------

    fn write_data<S: SavSource + ?Sized>(
        &mut self,
        source: &mut S,
        plans: &[VarPlan],
        obs_count: usize,
    ) -> Result<()> {
        let mut encoder = match self.compression {
            SavCompression::Bytecode => Some(BytecodeEncoder::new(BIAS)),
            SavCompression::None => None,
        };
        let mut slots = Vec::new();
        for obs in 0..obs_count {
            if source.cancelled() {
                debug!(obs, "SAV write cancelled");
                return Err(ReadStatError::UserAbort);
            }
            slots.clear();
            for (var, plan) in plans.iter().enumerate() {
                let value = source.value(obs, var);
                cell_slots(&mut slots, plan, &value, var)?;
            }
            for slot in &slots {
                match &mut encoder {
                    Some(encoder) => encoder.push(&mut self.writer, *slot, Endian::Little)?,
                    None => match slot {
                        SlotKind::Numeric(v) => self.writer.write_f64(*v)?,
                        SlotKind::Text(bytes) => self.writer.write_bytes(bytes)?,
                    },
                }
            }
        }
        if let Some(encoder) = &mut encoder {
            encoder.finish(&mut self.writer)?;
        }
        Ok(())
    }
}

fn plan_variable<S: SavSource + ?Sized>(source: &mut S, var: usize) -> VarPlan {
    let value_type = source.value_type(var);
    let width = if value_type.is_string() {
        source.width(var).max(1)
    } else {
        0
    };
    let format = source
        .format(var)
        .and_then(|f| Format::parse(&f))
        .unwrap_or_else(|| Format::default_for(width > 0, width));
    let labels = (0..source.vlabel_count(var))
        .map(|i| (source.vlabel_value(var, i), source.vlabel_label(var, i)))
        .collect();
    VarPlan {
        short_name: truncate_str(&source.short_name(var), 8).to_string(),
        long_name: source.long_name(var),
        width,
        format,
        label: source.variable_label(var),
        missing: source.missing_rule(var),
        labels,
    }
}

fn padded_text(text: &str, width: usize) -> Vec<u8> {
    let mut bytes = truncate_str(text, width).as_bytes().to_vec();
    bytes.resize(width, b' ');
    bytes
}

fn put_counted(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn numeric_payload(value: &Value) -> Option<f64> {
    match value.missing_kind() {
        Missing::System | Missing::Tagged(_) => Some(SYSMIS),
        Missing::NotMissing | Missing::User => value.to_f64(),
    }
}

/// The 8 bytes a value occupies in a value-label or missing-value slot.
fn short_slot(plan: &VarPlan, value: &Value) -> [u8; 8] {
    if !plan.is_string() {
        return numeric_payload(value).unwrap_or(SYSMIS).to_le_bytes();
    }
    let mut slot = [b' '; 8];
    slot.copy_from_slice(&padded_text(value.as_str().unwrap_or_default(), 8));
    slot
}

fn missing_slots(plan: &VarPlan) -> Vec<[u8; 8]> {
    let to_bytes = |v: f64| v.to_le_bytes();
    let slots: Vec<[u8; 8]> = match &plan.missing {
        MissingRule::None => Vec::new(),
        MissingRule::Discrete(values) if !plan.is_string() => {
            values.iter().copied().map(to_bytes).collect()
        }
        MissingRule::Range {
            low,
            high,
            discrete,
        } if !plan.is_string() => {
            let mut slots = vec![to_bytes(*low), to_bytes(*high)];
            slots.extend(discrete.map(to_bytes));
            slots
        }
        MissingRule::Strings(values) if plan.is_string() => values
            .iter()
            .map(|v| short_slot(plan, &Value::string(v.as_str())))
            .collect(),
        other => {
            warn!(variable = %plan.short_name, rule = ?other, "missing rule does not fit variable type");
            Vec::new()
        }
    };
    if slots.len() > 3 {
        warn!(variable = %plan.short_name, count = slots.len(), "keeping the first 3 missing values");
        return slots.into_iter().take(3).collect();
    }
    slots
}

fn missing_code(rule: &MissingRule, n: usize) -> i32 {
    match rule {
        MissingRule::Range { .. } if n > 0 => -(n as i32),
        _ => n as i32,
    }
}

/// Append the slots of one cell of `plan`.
fn cell_slots(slots: &mut Vec<SlotKind>, plan: &VarPlan, value: &Value, var: usize) -> Result<()> {
    let found = value.value_type();
    let mismatch = || ReadStatError::ValueTypeMismatch {
        var_index: var,
        expected: if plan.is_string() { "string" } else { "numeric" },
        found: found.name(),
    };
    if !plan.is_string() {
        if found.is_string() {
            return Err(mismatch());
        }
        let v = numeric_payload(value).ok_or_else(mismatch)?;
        slots.push(SlotKind::Numeric(v));
        return Ok(());
    }

    if found.is_numeric() {
        return Err(mismatch());
    }
    let text = match value.missing_kind() {
        Missing::System | Missing::Tagged(_) => "",
        Missing::NotMissing | Missing::User => value.as_str().unwrap_or_default(),
    };
    let widths = plan.segment_widths();
    let capacity: usize = widths.iter().map(|w| (*w).min(SEGMENT_DATA)).sum();
    let data = padded_text(text, plan.width.min(capacity));
    let mut pos = 0;
    for width in widths {
        let used = width.min(SEGMENT_DATA);
        let end = (pos + used).min(data.len());
        let mut segment = data[pos.min(end)..end].to_vec();
        pos += used;
        segment.resize(slots_for_width(width) * 8, b' ');
        for chunk in segment.chunks_exact(8) {
            let mut slot = [0u8; 8];
            slot.copy_from_slice(chunk);
            slots.push(SlotKind::Text(slot));
        }
    }
    Ok(())
}
