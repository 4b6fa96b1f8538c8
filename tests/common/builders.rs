//! In-memory fixture builders.
//!
//! Each builder produces the bytes of a small but complete file of one
//! format, laid out the way the corresponding reader expects to find it.

use readstat::io::por::identity_table;
use readstat::io::rdata::XdrWriter;
use readstat::io::sas::{build_header, missing_bits, KIND_CATALOG, KIND_DATA};
use readstat::{Endian, MissingRule, SavCompression, SavSource, SavWriter, Value, ValueType};

// ===========================================================================
// SAV
// ===========================================================================

/// One column of a [`Table`].
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub long_name: Option<String>,
    pub value_type: ValueType,
    pub width: usize,
    pub label: Option<String>,
    pub missing: MissingRule,
    pub values: Vec<Value>,
    pub labels: Vec<(Value, String)>,
}

impl Column {
    pub fn numeric(name: &str, values: &[f64]) -> Self {
        Self {
            name: name.to_string(),
            long_name: None,
            value_type: ValueType::Double,
            width: 8,
            label: None,
            missing: MissingRule::None,
            values: values.iter().map(|&v| Value::double(v)).collect(),
            labels: Vec::new(),
        }
    }

    pub fn text(name: &str, width: usize, values: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            long_name: None,
            value_type: ValueType::String,
            width,
            label: None,
            missing: MissingRule::None,
            values: values.iter().map(|&v| Value::string(v)).collect(),
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn with_missing(mut self, missing: MissingRule) -> Self {
        self.missing = missing;
        self
    }

    pub fn with_value_label(mut self, value: Value, label: &str) -> Self {
        self.labels.push((value, label.to_string()));
        self
    }
}

/// Column-stored dataset served to [`SavWriter`] through [`SavSource`].
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub columns: Vec<Column>,
    /// Answer `true` from the cancellation check before this row.
    pub cancel_before: Option<usize>,
    /// Rows whose values were pulled, in pull order (one entry per cell).
    pub pulled: Vec<usize>,
    rows_started: usize,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            ..Self::default()
        }
    }

    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.values.len())
    }

    /// Encode every row.
    pub fn to_sav(&mut self, compression: SavCompression) -> Vec<u8> {
        let (rows, vars) = (self.rows(), self.columns.len());
        let mut writer = SavWriter::new(Vec::new()).with_compression(compression);
        writer.write(self, rows, vars).expect("fixture encodes");
        writer.into_inner()
    }
}

impl SavSource for Table {
    fn short_name(&mut self, var: usize) -> String {
        self.columns[var].name.clone()
    }

    fn long_name(&mut self, var: usize) -> Option<String> {
        self.columns[var].long_name.clone()
    }

    fn value_type(&mut self, var: usize) -> ValueType {
        self.columns[var].value_type
    }

    fn width(&mut self, var: usize) -> usize {
        self.columns[var].width
    }

    fn variable_label(&mut self, var: usize) -> Option<String> {
        self.columns[var].label.clone()
    }

    fn missing_rule(&mut self, var: usize) -> MissingRule {
        self.columns[var].missing.clone()
    }

    fn value(&mut self, obs: usize, var: usize) -> Value {
        self.pulled.push(obs);
        self.columns[var].values[obs].clone()
    }

    fn vlabel_count(&mut self, var: usize) -> usize {
        self.columns[var].labels.len()
    }

    fn vlabel_value(&mut self, var: usize, index: usize) -> Value {
        self.columns[var].labels[index].0.clone()
    }

    fn vlabel_label(&mut self, var: usize, index: usize) -> String {
        self.columns[var].labels[index].1.clone()
    }

    fn cancelled(&mut self) -> bool {
        let row = self.rows_started;
        self.rows_started += 1;
        self.cancel_before == Some(row)
    }
}

/// Overwrite the declared case count of a SAV file.
pub fn set_sav_case_count(bytes: &mut [u8], ncases: i32) {
    bytes[80..84].copy_from_slice(&ncases.to_le_bytes());
}

// ===========================================================================
// DTA
// ===========================================================================

/// A DTA variable descriptor.
#[derive(Debug, Clone)]
pub struct DtaVar {
    pub name: &'static str,
    /// Type code as written in the type list (one byte before 117, two after).
    pub code: u16,
    pub format: &'static str,
    pub label_set: &'static str,
    pub label: &'static str,
}

impl DtaVar {
    pub fn new(name: &'static str, code: u16, format: &'static str) -> Self {
        Self {
            name,
            code,
            format,
            label_set: "",
            label: "",
        }
    }

    pub fn labelled(mut self, set: &'static str) -> Self {
        self.label_set = set;
        self
    }
}

fn fixed(text: &str, len: usize) -> Vec<u8> {
    let mut field = text.as_bytes().to_vec();
    field.truncate(len.saturating_sub(1));
    field.resize(len, 0);
    field
}

/// Modern value-label table: n, txtlen, off[n], val[n], txt.
fn dta_label_table(entries: &[(i32, &str)]) -> Vec<u8> {
    let mut txt = Vec::new();
    let mut offsets = Vec::new();
    for (_, label) in entries {
        offsets.push(txt.len() as u32);
        txt.extend_from_slice(label.as_bytes());
        txt.push(0);
    }
    let mut table = Vec::new();
    table.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    table.extend_from_slice(&(txt.len() as u32).to_le_bytes());
    for off in offsets {
        table.extend_from_slice(&off.to_le_bytes());
    }
    for (value, _) in entries {
        table.extend_from_slice(&value.to_le_bytes());
    }
    table.extend_from_slice(&txt);
    table
}

/// A little-endian release 114 file.
pub fn dta114(
    vars: &[DtaVar],
    obs: u32,
    data: &[u8],
    label_sets: &[(&str, &[(i32, &str)])],
) -> Vec<u8> {
    let k = vars.len();
    let mut b = vec![114u8, 0x02, 0x01, 0x00];
    b.extend_from_slice(&(k as u16).to_le_bytes());
    b.extend_from_slice(&obs.to_le_bytes());
    b.extend(fixed("fixture dataset", 81));
    b.extend(fixed("05 Jan 2024 10:30", 18));
    for v in vars {
        b.push(v.code as u8);
    }
    for v in vars {
        b.extend(fixed(v.name, 33));
    }
    b.extend(vec![0u8; 2 * (k + 1)]);
    for v in vars {
        b.extend(fixed(v.format, 49));
    }
    for v in vars {
        b.extend(fixed(v.label_set, 33));
    }
    for v in vars {
        b.extend(fixed(v.label, 81));
    }
    // expansion fields terminator
    b.push(0);
    b.extend_from_slice(&0u32.to_le_bytes());
    b.extend_from_slice(data);
    for (name, entries) in label_sets {
        let table = dta_label_table(entries);
        b.extend_from_slice(&(table.len() as u32).to_le_bytes());
        b.extend(fixed(name, 33));
        b.extend_from_slice(&[0, 0, 0]);
        b.extend(table);
    }
    b
}

/// A strL stored in the GSO table of a 117/118 file.
#[derive(Debug, Clone)]
pub struct Strl {
    pub var: u32,
    pub obs: u64,
    pub text: String,
}

/// A little-endian release 117 or 118 file. Cells are given raw; use
/// [`strl_cell`] for strL references.
pub fn dta_xml(
    release: u16,
    vars: &[DtaVar],
    obs: u64,
    data: &[u8],
    strls: &[Strl],
    label_sets: &[(&str, &[(i32, &str)])],
) -> Vec<u8> {
    let is_118 = release == 118;
    let (name_len, format_len, label_len) = if is_118 { (129, 57, 321) } else { (33, 49, 81) };
    let k = vars.len();
    let mut b = Vec::new();
    let mut map = [0u64; 14];

    b.extend_from_slice(b"<stata_dta><header><release>");
    b.extend_from_slice(release.to_string().as_bytes());
    b.extend_from_slice(b"</release><byteorder>LSF</byteorder><K>");
    b.extend_from_slice(&(k as u16).to_le_bytes());
    b.extend_from_slice(b"</K><N>");
    if is_118 {
        b.extend_from_slice(&obs.to_le_bytes());
    } else {
        b.extend_from_slice(&(obs as u32).to_le_bytes());
    }
    b.extend_from_slice(b"</N><label>");
    let label = b"xml fixture";
    if is_118 {
        b.extend_from_slice(&(label.len() as u16).to_le_bytes());
    } else {
        b.push(label.len() as u8);
    }
    b.extend_from_slice(label);
    b.extend_from_slice(b"</label><timestamp>");
    let ts = b"05 Jan 2024 10:30";
    b.push(ts.len() as u8);
    b.extend_from_slice(ts);
    b.extend_from_slice(b"</timestamp></header>");

    map[1] = b.len() as u64;
    let map_at = b.len() + b"<map>".len();
    b.extend_from_slice(b"<map>");
    b.extend(vec![0u8; 14 * 8]);
    b.extend_from_slice(b"</map>");

    map[2] = b.len() as u64;
    b.extend_from_slice(b"<variable_types>");
    for v in vars {
        b.extend_from_slice(&v.code.to_le_bytes());
    }
    b.extend_from_slice(b"</variable_types>");
    map[3] = b.len() as u64;
    b.extend_from_slice(b"<varnames>");
    for v in vars {
        b.extend(fixed(v.name, name_len));
    }
    b.extend_from_slice(b"</varnames>");
    map[4] = b.len() as u64;
    b.extend_from_slice(b"<sortlist>");
    b.extend(vec![0u8; 2 * (k + 1)]);
    b.extend_from_slice(b"</sortlist>");
    map[5] = b.len() as u64;
    b.extend_from_slice(b"<formats>");
    for v in vars {
        b.extend(fixed(v.format, format_len));
    }
    b.extend_from_slice(b"</formats>");
    map[6] = b.len() as u64;
    b.extend_from_slice(b"<value_label_names>");
    for v in vars {
        b.extend(fixed(v.label_set, name_len));
    }
    b.extend_from_slice(b"</value_label_names>");
    map[7] = b.len() as u64;
    b.extend_from_slice(b"<variable_labels>");
    for v in vars {
        b.extend(fixed(v.label, label_len));
    }
    b.extend_from_slice(b"</variable_labels>");
    map[8] = b.len() as u64;
    b.extend_from_slice(b"<characteristics></characteristics>");

    map[9] = b.len() as u64;
    b.extend_from_slice(b"<data>");
    b.extend_from_slice(data);
    b.extend_from_slice(b"</data>");

    map[10] = b.len() as u64;
    b.extend_from_slice(b"<strls>");
    for s in strls {
        b.extend_from_slice(b"GSO");
        b.extend_from_slice(&s.var.to_le_bytes());
        if is_118 {
            b.extend_from_slice(&s.obs.to_le_bytes());
        } else {
            b.extend_from_slice(&(s.obs as u32).to_le_bytes());
        }
        b.push(130);
        b.extend_from_slice(&(s.text.len() as u32 + 1).to_le_bytes());
        b.extend_from_slice(s.text.as_bytes());
        b.push(0);
    }
    b.extend_from_slice(b"</strls>");

    map[11] = b.len() as u64;
    b.extend_from_slice(b"<value_labels>");
    for (name, entries) in label_sets {
        let table = dta_label_table(entries);
        b.extend_from_slice(b"<lbl>");
        b.extend_from_slice(&(table.len() as u32).to_le_bytes());
        b.extend(fixed(name, name_len));
        b.extend_from_slice(&[0, 0, 0]);
        b.extend(table);
        b.extend_from_slice(b"</lbl>");
    }
    b.extend_from_slice(b"</value_labels>");

    map[12] = b.len() as u64;
    b.extend_from_slice(b"</stata_dta>");
    map[13] = b.len() as u64;

    for (i, offset) in map.iter().enumerate() {
        b[map_at + 8 * i..map_at + 8 * i + 8].copy_from_slice(&offset.to_le_bytes());
    }
    b
}

/// An 8-byte strL reference cell.
pub fn strl_cell(release: u16, var: u32, obs: u64) -> Vec<u8> {
    if release == 117 {
        let mut cell = var.to_le_bytes().to_vec();
        cell.extend_from_slice(&(obs as u32).to_le_bytes());
        cell
    } else {
        let mut cell = (var as u16).to_le_bytes().to_vec();
        cell.extend_from_slice(&obs.to_le_bytes()[..6]);
        cell
    }
}

// ===========================================================================
// POR
// ===========================================================================

fn base30(mut n: u64) -> Vec<u8> {
    const DIGITS: &[u8; 30] = b"0123456789ABCDEFGHIJKLMNOPQRST";
    if n == 0 {
        return b"0".to_vec();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(DIGITS[(n % 30) as usize]);
        n /= 30;
    }
    digits.reverse();
    digits
}

/// Builder for the character stream of a portable file, written through
/// the identity translation table.
#[derive(Debug, Clone)]
pub struct Por {
    text: Vec<u8>,
}

impl Default for Por {
    fn default() -> Self {
        Self::new()
    }
}

impl Por {
    /// Splash, table, signature and version record.
    pub fn new() -> Self {
        let mut text = vec![b' '; 200];
        text.extend_from_slice(&identity_table());
        text.extend_from_slice(b"SPSSPORT");
        let mut por = Self { text };
        por.tag(b'A').string("20240105").string("103000");
        por
    }

    /// Re-encode so the file writes `file_byte` wherever the portable
    /// character set has `portable`.
    pub fn remapped(&self, portable: u8, file_byte: u8) -> Self {
        let table = identity_table();
        let position = (64..256)
            .find(|&i| table[i] == portable)
            .expect("character is in the portable set");
        let mut text = self.text.clone();
        text[200 + position] = file_byte;
        for byte in &mut text[456..] {
            if *byte == portable {
                *byte = file_byte;
            }
        }
        Self { text }
    }

    pub fn tag(&mut self, tag: u8) -> &mut Self {
        self.text.push(tag);
        self
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.text.extend_from_slice(bytes);
        self
    }

    pub fn int(&mut self, n: i64) -> &mut Self {
        if n < 0 {
            self.text.push(b'-');
        }
        self.text.extend(base30(n.unsigned_abs()));
        self.text.push(b'/');
        self
    }

    /// A number with at most a dozen base-30 fraction digits.
    pub fn number(&mut self, v: f64) -> &mut Self {
        if v < 0.0 {
            self.text.push(b'-');
        }
        let v = v.abs();
        let whole = v.trunc();
        self.text.extend(base30(whole as u64));
        let mut frac = v - whole;
        if frac > 0.0 {
            self.text.push(b'.');
            for _ in 0..12 {
                if frac == 0.0 {
                    break;
                }
                frac *= 30.0;
                let d = frac.trunc();
                self.text.extend(base30(d as u64));
                frac -= d;
            }
        }
        self.text.push(b'/');
        self
    }

    pub fn sysmis(&mut self) -> &mut Self {
        self.text.extend_from_slice(b"*.");
        self
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        self.int(s.len() as i64);
        self.text.extend_from_slice(s.as_bytes());
        self
    }

    /// Variable record: width 0 for numerics.
    pub fn variable(&mut self, name: &str, width: i64) -> &mut Self {
        let (fmt, fw, fd) = if width == 0 { (5, 8, 2) } else { (1, width, 0) };
        self.tag(b'7').int(width).string(name);
        self.int(fmt).int(fw).int(fd).int(fmt).int(fw).int(fd)
    }

    /// Wrap into 80-column lines.
    pub fn finish(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.text.len() + self.text.len() / 40);
        for line in self.text.chunks(80) {
            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }
        out
    }
}

// ===========================================================================
// SAS7BDAT
// ===========================================================================

#[derive(Debug, Clone)]
pub enum SasCell {
    Num(f64),
    /// Missing value with an optional tag letter.
    Missing(Option<char>),
    Str(&'static str),
}

#[derive(Debug, Clone)]
pub struct SasColumn {
    pub name: &'static str,
    pub format: &'static str,
    pub label: &'static str,
    pub numeric: bool,
    pub width: usize,
}

impl SasColumn {
    pub fn numeric(name: &'static str, format: &'static str) -> Self {
        Self {
            name,
            format,
            label: "",
            numeric: true,
            width: 8,
        }
    }

    pub fn text(name: &'static str, width: usize) -> Self {
        Self {
            name,
            format: "$",
            label: "",
            numeric: false,
            width,
        }
    }
}

const SAS_PAGE: usize = 4096;

/// RLE rows as literal copies of up to 16 bytes.
fn rle_pack(raw: &[u8]) -> Vec<u8> {
    let mut packed = Vec::new();
    for chunk in raw.chunks(16) {
        packed.push(0x80 | (chunk.len() as u8 - 1));
        packed.extend_from_slice(chunk);
    }
    packed
}

/// RDC rows: runs of 3 to 18 bytes as short runs, 19 or more as long runs,
/// anything else as literals, grouped 16 items per control word.
fn rdc_pack(raw: &[u8]) -> Vec<u8> {
    let mut items: Vec<(bool, Vec<u8>)> = Vec::new();
    let mut i = 0;
    while i < raw.len() {
        let b = raw[i];
        let mut run = 1;
        while i + run < raw.len() && raw[i + run] == b && run < 4114 {
            run += 1;
        }
        if run >= 19 {
            let c = run - 19;
            items.push((true, vec![0x10 | (c & 0x0F) as u8, (c >> 4) as u8, b]));
            i += run;
        } else if run >= 3 {
            items.push((true, vec![(run - 3) as u8, b]));
            i += run;
        } else {
            items.push((false, vec![b]));
            i += 1;
        }
    }
    let mut packed = Vec::new();
    for group in items.chunks(16) {
        let mut control = 0u16;
        for (k, (command, _)) in group.iter().enumerate() {
            if *command {
                control |= 0x8000 >> k;
            }
        }
        packed.extend_from_slice(&control.to_be_bytes());
        for (_, bytes) in group {
            packed.extend_from_slice(bytes);
        }
    }
    packed
}

/// How rows are stored: plain on a data page, or packed into
/// compressed-row subheaders of the metadata page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SasPacking {
    Plain,
    Rle,
    Rdc,
}

/// A little-endian data file: one metadata page, then one data page
/// unless the rows are packed into the metadata page.
#[derive(Debug, Clone)]
pub struct Sas7bdat {
    pub is_64bit: bool,
    pub packing: SasPacking,
    pub table_name: &'static str,
    pub columns: Vec<SasColumn>,
    pub rows: Vec<Vec<SasCell>>,
    /// Row count written to the row size subheader; defaults to `rows.len()`.
    pub declared_rows: Option<u64>,
}

impl Sas7bdat {
    pub fn new(columns: Vec<SasColumn>, rows: Vec<Vec<SasCell>>) -> Self {
        Self {
            is_64bit: false,
            packing: SasPacking::Plain,
            table_name: "FIXTURE",
            columns,
            rows,
            declared_rows: None,
        }
    }

    fn il(&self) -> usize {
        if self.is_64bit {
            8
        } else {
            4
        }
    }

    fn put_int(&self, buf: &mut [u8], at: usize, v: u64) {
        let il = self.il();
        buf[at..at + il].copy_from_slice(&v.to_le_bytes()[..il]);
    }

    fn subheader(&self, signature: u32, len: usize) -> Vec<u8> {
        let mut body = vec![0u8; len];
        body[0..4].copy_from_slice(&signature.to_le_bytes());
        if self.is_64bit {
            body[4..8].fill(0xFF);
        }
        body
    }

    fn row_length(&self) -> usize {
        self.columns.iter().map(|c| c.width).sum()
    }

    fn row_bytes(&self, row: &[SasCell]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.row_length());
        for (cell, column) in row.iter().zip(&self.columns) {
            match cell {
                SasCell::Num(v) => out.extend_from_slice(&v.to_le_bytes()),
                SasCell::Missing(tag) => out.extend_from_slice(&missing_bits(*tag).to_le_bytes()),
                SasCell::Str(s) => {
                    let mut field = s.as_bytes().to_vec();
                    field.resize(column.width, b' ');
                    out.extend(field);
                }
            }
        }
        out
    }

    pub fn build(&self) -> Vec<u8> {
        let il = self.il();
        let bit_offset = if self.is_64bit { 32 } else { 16 };
        let pointer_len = 3 * il;
        let n = self.columns.len();

        // column text blob: 12 reserved bytes, compression literal, strings
        let mut blob = vec![0u8; 20];
        match self.packing {
            SasPacking::Plain => {}
            SasPacking::Rle => blob[12..20].copy_from_slice(b"SASYZCRL"),
            SasPacking::Rdc => blob[12..20].copy_from_slice(b"SASYZCR2"),
        }
        let text_ref = |s: &str, blob: &mut Vec<u8>| -> (u16, u16) {
            let at = blob.len() as u16;
            blob.extend_from_slice(s.as_bytes());
            while blob.len() % 4 != 0 {
                blob.push(b' ');
            }
            (at, s.len() as u16)
        };
        let names: Vec<_> = self.columns.iter().map(|c| text_ref(c.name, &mut blob)).collect();
        let formats: Vec<_> = self.columns.iter().map(|c| text_ref(c.format, &mut blob)).collect();
        let labels: Vec<_> = self.columns.iter().map(|c| text_ref(c.label, &mut blob)).collect();

        let mut subheaders: Vec<(Vec<u8>, u8, u8)> = Vec::new();

        let mut row_size = self.subheader(0xF7F7_F7F7, 20 * il);
        self.put_int(&mut row_size, 5 * il, self.row_length() as u64);
        let declared = self.declared_rows.unwrap_or(self.rows.len() as u64);
        self.put_int(&mut row_size, 6 * il, declared);
        subheaders.push((row_size, 0, 0));

        let mut column_size = self.subheader(0xF6F6_F6F6, 3 * il);
        self.put_int(&mut column_size, il, n as u64);
        subheaders.push((column_size, 0, 0));

        let mut text = self.subheader(0xFFFF_FFFD, il);
        text.truncate(il);
        text.extend_from_slice(&blob);
        subheaders.push((text, 0, 0));

        let mut name_sh = self.subheader(0xFFFF_FFFF, 2 * il + 12 + 8 * n);
        for (i, (offset, len)) in names.iter().enumerate() {
            let at = il + 8 + 8 * i;
            name_sh[at + 2..at + 4].copy_from_slice(&offset.to_le_bytes());
            name_sh[at + 4..at + 6].copy_from_slice(&len.to_le_bytes());
        }
        subheaders.push((name_sh, 0, 0));

        let stride = il + 8;
        let mut attrs = self.subheader(0xFFFF_FFFC, 2 * il + 12 + stride * n);
        let mut offset = 0u64;
        for (i, column) in self.columns.iter().enumerate() {
            let base = il + 8 + i * stride;
            self.put_int(&mut attrs, base, offset);
            attrs[base + il..base + il + 4].copy_from_slice(&(column.width as u32).to_le_bytes());
            attrs[base + il + 6] = if column.numeric { 1 } else { 2 };
            offset += column.width as u64;
        }
        subheaders.push((attrs, 0, 0));

        for i in 0..n {
            let mut format = self.subheader(0xFFFF_FBFE, 3 * il + 64);
            let (f_at, f_len) = formats[i];
            let (l_at, l_len) = labels[i];
            let at = 22 + 3 * il;
            format[at + 2..at + 4].copy_from_slice(&f_at.to_le_bytes());
            format[at + 4..at + 6].copy_from_slice(&f_len.to_le_bytes());
            let at = 28 + 3 * il;
            format[at + 2..at + 4].copy_from_slice(&l_at.to_le_bytes());
            format[at + 4..at + 6].copy_from_slice(&l_len.to_le_bytes());
            subheaders.push((format, 0, 0));
        }

        if self.packing != SasPacking::Plain {
            for row in &self.rows {
                let raw = self.row_bytes(row);
                let packed = match self.packing {
                    SasPacking::Rdc => rdc_pack(&raw),
                    _ => rle_pack(&raw),
                };
                subheaders.push((packed, 4, 1));
            }
        }

        let mut meta = vec![0u8; SAS_PAGE];
        meta[bit_offset + 2..bit_offset + 4].copy_from_slice(&(subheaders.len() as u16).to_le_bytes());
        meta[bit_offset + 4..bit_offset + 6].copy_from_slice(&(subheaders.len() as u16).to_le_bytes());
        let mut at = bit_offset + 8 + subheaders.len() * pointer_len;
        at = (at + 7) / 8 * 8;
        for (i, (body, compression, kind)) in subheaders.iter().enumerate() {
            let p = bit_offset + 8 + i * pointer_len;
            self.put_int(&mut meta, p, at as u64);
            self.put_int(&mut meta, p + il, body.len() as u64);
            meta[p + 2 * il] = *compression;
            meta[p + 2 * il + 1] = *kind;
            meta[at..at + body.len()].copy_from_slice(body);
            at += (body.len() + 7) / 8 * 8;
        }

        let mut pages = vec![meta];
        if self.packing == SasPacking::Plain {
            let mut data = vec![0u8; SAS_PAGE];
            data[bit_offset..bit_offset + 2].copy_from_slice(&0x0100u16.to_le_bytes());
            data[bit_offset + 2..bit_offset + 4].copy_from_slice(&(self.rows.len() as u16).to_le_bytes());
            let mut at = bit_offset + 8;
            for row in &self.rows {
                let raw = self.row_bytes(row);
                data[at..at + raw.len()].copy_from_slice(&raw);
                at += raw.len();
            }
            pages.push(data);
        }

        let mut file = build_header(KIND_DATA, self.is_64bit, Endian::Little, SAS_PAGE as u32, pages.len() as u32);
        let name = self.table_name.as_bytes();
        file[92..92 + name.len()].copy_from_slice(name);
        for page in pages {
            file.extend(page);
        }
        file
    }
}

// ===========================================================================
// SAS7BCAT
// ===========================================================================

/// Entries of one catalog format: numeric or (for `$` names) string keys.
#[derive(Debug, Clone)]
pub enum CatalogKey {
    Num(f64),
    Str(&'static str),
}

/// A 32-bit little-endian catalog holding one format block per entry of
/// `formats`, each on its own page.
pub fn sas7bcat(formats: &[(&str, &[(CatalogKey, &str)])]) -> Vec<u8> {
    const FIRST_RECORD: usize = 840;
    const RECORD_LEN: usize = 204;
    const FLAG_OFFSET: usize = 26;
    const LINK_OFFSET: usize = 16;

    let mut index = vec![0u8; SAS_PAGE];
    let mut pages = Vec::new();
    for (i, (name, entries)) in formats.iter().enumerate() {
        let at = FIRST_RECORD + i * RECORD_LEN;
        index[at..at + 4].copy_from_slice(b"XLSR");
        let page_number = (i + 2) as u32;
        index[at + 4..at + 8].copy_from_slice(&page_number.to_le_bytes());
        index[at + 8..at + 10].copy_from_slice(&(LINK_OFFSET as u16).to_le_bytes());
        index[at + FLAG_OFFSET] = b'O';

        let block = catalog_block(name, entries);
        let mut page = vec![0u8; SAS_PAGE];
        page[LINK_OFFSET + 6..LINK_OFFSET + 8].copy_from_slice(&(block.len() as u16).to_le_bytes());
        page[LINK_OFFSET + 16..LINK_OFFSET + 16 + block.len()].copy_from_slice(&block);
        pages.push(page);
    }

    let mut file = build_header(KIND_CATALOG, false, Endian::Little, SAS_PAGE as u32, (pages.len() + 1) as u32);
    file.extend(index);
    for page in pages {
        file.extend(page);
    }
    file
}

fn catalog_block(name: &str, entries: &[(CatalogKey, &str)]) -> Vec<u8> {
    let mut b = vec![0u8; 106];
    let mut field = name.as_bytes().to_vec();
    field.resize(8, b' ');
    b[8..16].copy_from_slice(&field);
    let n = entries.len() as u32;
    b[38..42].copy_from_slice(&n.to_le_bytes());
    b[42..46].copy_from_slice(&n.to_le_bytes());
    for (i, (key, _)) in entries.iter().enumerate() {
        let mut entry = [0u8; 30];
        entry[2..4].copy_from_slice(&24u16.to_le_bytes());
        entry[10..14].copy_from_slice(&(i as u32).to_le_bytes());
        match key {
            CatalogKey::Num(v) => entry[22..30].copy_from_slice(&(-v).to_be_bytes()),
            CatalogKey::Str(s) => {
                entry[14..30].fill(b' ');
                entry[14..14 + s.len()].copy_from_slice(s.as_bytes());
            }
        }
        b.extend_from_slice(&entry);
    }
    for (_, label) in entries {
        let mut rec = vec![0u8; 10];
        rec[8..10].copy_from_slice(&(label.len() as u16).to_le_bytes());
        rec.extend_from_slice(label.as_bytes());
        rec.push(0);
        b.extend_from_slice(&rec);
    }
    b
}

// ===========================================================================
// RDS / RData
// ===========================================================================

/// One data frame column.
#[derive(Debug, Clone)]
pub enum RCol {
    Logical(Vec<i32>),
    Int(Vec<i32>),
    Real(Vec<f64>),
    Str(Vec<Option<&'static str>>),
    Factor(Vec<i32>, Vec<&'static str>),
    Date(Vec<f64>),
}

impl RCol {
    fn len(&self) -> usize {
        match self {
            RCol::Logical(v) | RCol::Int(v) | RCol::Factor(v, _) => v.len(),
            RCol::Real(v) | RCol::Date(v) => v.len(),
            RCol::Str(v) => v.len(),
        }
    }
}

/// Append a `data.frame` object.
pub fn write_frame(w: &mut XdrWriter, columns: &[(&str, RCol)]) {
    let rows = columns.first().map_or(0, |(_, c)| c.len());
    w.list(columns.len(), true);
    for (_, column) in columns {
        match column {
            RCol::Logical(v) => {
                w.logicals(v);
            }
            RCol::Int(v) => {
                w.ints(v, false);
            }
            RCol::Real(v) => {
                w.reals(v, false);
            }
            RCol::Str(v) => {
                w.strings(v, false);
            }
            RCol::Factor(codes, levels) => {
                let levels: Vec<Option<&str>> = levels.iter().map(|l| Some(*l)).collect();
                w.ints(codes, true);
                w.cell("levels").strings(&levels, false);
                w.cell("class").strings(&[Some("factor")], false).nil();
            }
            RCol::Date(v) => {
                w.reals(v, true);
                w.cell("class").strings(&[Some("Date")], false).nil();
            }
        }
    }
    let names: Vec<Option<&str>> = columns.iter().map(|(n, _)| Some(*n)).collect();
    w.cell("names").strings(&names, false);
    w.cell("row.names").ints(&[i32::MIN, -(rows as i32)], false);
    w.cell("class").strings(&[Some("data.frame")], false).nil();
}

/// An `.rds` stream holding one data frame.
pub fn rds(columns: &[(&str, RCol)]) -> Vec<u8> {
    let mut w = XdrWriter::new();
    w.header();
    write_frame(&mut w, columns);
    w.bytes
}

/// An `.RData` workspace binding each name to its object.
pub fn rdata(objects: &[(&str, &dyn Fn(&mut XdrWriter))]) -> Vec<u8> {
    let mut w = XdrWriter::new();
    w.bytes.extend_from_slice(b"RDX2\n");
    w.header();
    for (name, write) in objects {
        w.cell(name);
        write(&mut w);
    }
    w.nil();
    w.bytes
}
