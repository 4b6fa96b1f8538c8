//! R's XDR serialization format: a tree of typed cells, written depth
//! first, with a back-reference table for symbols and environments.

use std::io::Read;

use tracing::{debug, trace};

use crate::error::{ReadStatError, Result};
use crate::io::charset::Charset;
use crate::io::cursor::{bounded_vec, ByteReader};

/// Cell types.
pub(crate) mod sxp {
    pub const NIL: u8 = 0;
    pub const SYM: u8 = 1;
    pub const LIST: u8 = 2;
    pub const CLO: u8 = 3;
    pub const ENV: u8 = 4;
    pub const PROM: u8 = 5;
    pub const LANG: u8 = 6;
    pub const SPECIAL: u8 = 7;
    pub const BUILTIN: u8 = 8;
    pub const CHAR: u8 = 9;
    pub const LGL: u8 = 10;
    pub const INT: u8 = 13;
    pub const REAL: u8 = 14;
    pub const CPLX: u8 = 15;
    pub const STR: u8 = 16;
    pub const DOT: u8 = 17;
    pub const VEC: u8 = 19;
    pub const EXPR: u8 = 20;
    pub const BCODE: u8 = 21;
    pub const EXTPTR: u8 = 22;
    pub const WEAKREF: u8 = 23;
    pub const RAW: u8 = 24;
    pub const S4: u8 = 25;

    pub const ALTREP: u8 = 238;
    pub const ATTRLIST: u8 = 239;
    pub const ATTRLANG: u8 = 240;
    pub const BASEENV: u8 = 241;
    pub const EMPTYENV: u8 = 242;
    pub const GENERICREF: u8 = 245;
    pub const CLASSREF: u8 = 246;
    pub const PERSIST: u8 = 247;
    pub const PACKAGE: u8 = 248;
    pub const NAMESPACE: u8 = 249;
    pub const BASENAMESPACE: u8 = 250;
    pub const MISSINGARG: u8 = 251;
    pub const UNBOUNDVALUE: u8 = 252;
    pub const GLOBALENV: u8 = 253;
    pub const NILVALUE: u8 = 254;
    pub const REF: u8 = 255;
}

const IS_OBJECT: u32 = 1 << 8;
const HAS_ATTR: u32 = 1 << 9;
const HAS_TAG: u32 = 1 << 10;

/// Encoding bits of a CHARSXP's levels.
const LEVEL_BYTES: u32 = 1 << 1;
const LEVEL_LATIN1: u32 = 1 << 2;
const LEVEL_UTF8: u32 = 1 << 3;
const LEVEL_ASCII: u32 = 1 << 6;

/// `NA_integer_` and the logical `NA`.
pub(crate) const NA_INTEGER: i32 = i32::MIN;

const MAX_DEPTH: usize = 1024;

/// A decoded cell.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Sexp {
    Null,
    Symbol(String),
    Char(Option<String>),
    Logical(Vec<i32>),
    Integer(Vec<i32>),
    Real(Vec<f64>),
    Complex(Vec<(f64, f64)>),
    Strings(Vec<Option<String>>),
    List(Vec<Node>),
    Pairlist(Vec<(Option<String>, Node)>),
    Raw(Vec<u8>),
    Environment,
    /// Closures, byte code, external pointers and the like.
    Opaque(u8),
}

/// A cell with its attributes.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Node {
    pub sexp: Sexp,
    pub attributes: Vec<(String, Node)>,
    pub is_object: bool,
}

impl Node {
    pub fn new(sexp: Sexp) -> Self {
        Self {
            sexp,
            attributes: Vec::new(),
            is_object: false,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&Node> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, node)| node)
    }

    /// Entries of a character attribute, NA entries dropped.
    pub fn string_attr(&self, name: &str) -> Vec<&str> {
        match self.attr(name).map(|n| &n.sexp) {
            Some(Sexp::Strings(values)) => values.iter().filter_map(|v| v.as_deref()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn inherits(&self, class: &str) -> bool {
        self.string_attr("class").contains(&class)
    }

    /// Length of a vector cell.
    pub fn len(&self) -> usize {
        match &self.sexp {
            Sexp::Logical(v) | Sexp::Integer(v) => v.len(),
            Sexp::Real(v) => v.len(),
            Sexp::Complex(v) => v.len(),
            Sexp::Strings(v) => v.len(),
            Sexp::List(v) => v.len(),
            Sexp::Pairlist(v) => v.len(),
            Sexp::Raw(v) => v.len(),
            _ => 0,
        }
    }
}

/// Stream header following the `X\n` format marker.
#[derive(Debug, Clone)]
pub(crate) struct StreamHeader {
    pub version: i32,
    pub writer_version: i32,
    /// Native encoding of the writer (version 3).
    pub native_encoding: Option<String>,
}

/// Render an R version integer as `major.minor.patch`.
pub(crate) fn version_string(v: i32) -> String {
    format!("{}.{}.{}", v / 65536, (v / 256) % 256, v % 256)
}

pub(crate) struct SexpReader<R> {
    reader: ByteReader<R>,
    refs: Vec<Node>,
    native: Charset,
    depth: usize,
}

impl<R: Read> SexpReader<R> {
    pub fn new(reader: ByteReader<R>) -> Self {
        Self {
            reader,
            refs: Vec::new(),
            native: Charset::utf8(),
            depth: 0,
        }
    }

    /// Charset for strings not flagged UTF-8 or Latin-1.
    pub fn set_native(&mut self, charset: Charset) {
        self.native = charset;
    }

    pub fn read_header(&mut self) -> Result<StreamHeader> {
        let version = self.reader.read_i32()?;
        let writer_version = self.reader.read_i32()?;
        let min_reader_version = self.reader.read_i32()?;
        let native_encoding = match version {
            2 => None,
            3 => {
                let len = self.read_length()?;
                let name = self.reader.read_bytes(len)?;
                Some(String::from_utf8_lossy(&name).into_owned())
            }
            other => {
                return Err(ReadStatError::parse(format!(
                    "unsupported serialization version {other}"
                )))
            }
        };
        debug!(
            version,
            writer = %version_string(writer_version),
            min_reader = %version_string(min_reader_version),
            native = ?native_encoding,
            "R serialization header"
        );
        Ok(StreamHeader {
            version,
            writer_version,
            native_encoding,
        })
    }

    fn read_length(&mut self) -> Result<usize> {
        let len = self.reader.read_i32()?;
        if len == -1 {
            let upper = self.reader.read_u32()?;
            let lower = self.reader.read_u32()?;
            let long = (u64::from(upper) << 32) | u64::from(lower);
            return usize::try_from(long)
                .map_err(|_| ReadStatError::parse(format!("vector length {long} overflows")));
        }
        usize::try_from(len).map_err(|_| ReadStatError::parse(format!("negative vector length {len}")))
    }

    fn vec_with_capacity<T>(len: usize) -> Result<Vec<T>> {
        bounded_vec(len)
    }

    pub fn read_item(&mut self) -> Result<Node> {
        let flags = self.reader.read_u32()?;
        self.read_with_flags(flags)
    }

    fn read_with_flags(&mut self, flags: u32) -> Result<Node> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ReadStatError::parse("object nesting too deep"));
        }
        let result = self.read_cell(flags);
        self.depth -= 1;
        result
    }

    fn read_cell(&mut self, flags: u32) -> Result<Node> {
        let kind = (flags & 0xFF) as u8;
        let has_attr = flags & HAS_ATTR != 0;
        let levels = flags >> 12;
        trace!(kind, has_attr, "cell");

        let sexp = match kind {
            sxp::NILVALUE | sxp::NIL | sxp::MISSINGARG | sxp::UNBOUNDVALUE => return Ok(Node::new(Sexp::Null)),
            sxp::EMPTYENV | sxp::BASEENV | sxp::GLOBALENV | sxp::BASENAMESPACE => {
                return Ok(Node::new(Sexp::Environment))
            }
            sxp::REF => {
                let mut index = (flags >> 8) as usize;
                if index == 0 {
                    index = self.read_length()?;
                }
                return index
                    .checked_sub(1)
                    .and_then(|i| self.refs.get(i))
                    .cloned()
                    .ok_or_else(|| ReadStatError::parse(format!("reference {index} is not in the table")));
            }
            sxp::PERSIST => {
                let names = self.read_string_vec()?;
                let node = Node::new(Sexp::Strings(names));
                self.refs.push(node.clone());
                return Ok(node);
            }
            sxp::SYM => {
                let name = match self.read_item()?.sexp {
                    Sexp::Char(Some(s)) => s,
                    _ => String::new(),
                };
                let node = Node::new(Sexp::Symbol(name));
                self.refs.push(node.clone());
                return Ok(node);
            }
            sxp::PACKAGE | sxp::NAMESPACE => {
                self.read_string_vec()?;
                let node = Node::new(Sexp::Environment);
                self.refs.push(node.clone());
                return Ok(node);
            }
            sxp::ENV => {
                self.refs.push(Node::new(Sexp::Environment));
                let _locked = self.reader.read_i32()?;
                for _ in 0..4 {
                    // enclosure, frame, hash table, attributes
                    self.read_item()?;
                }
                return Ok(Node::new(Sexp::Environment));
            }
            sxp::LIST | sxp::LANG | sxp::CLO | sxp::PROM | sxp::DOT | sxp::ATTRLANG | sxp::ATTRLIST => {
                return self.read_pairlist(flags);
            }
            sxp::EXTPTR => {
                self.refs.push(Node::new(Sexp::Opaque(kind)));
                self.read_item()?;
                self.read_item()?;
                Sexp::Opaque(kind)
            }
            sxp::WEAKREF => {
                self.refs.push(Node::new(Sexp::Opaque(kind)));
                Sexp::Opaque(kind)
            }
            sxp::SPECIAL | sxp::BUILTIN => {
                let len = self.read_length()?;
                self.reader.skip(len as u64)?;
                Sexp::Opaque(kind)
            }
            sxp::CHAR => {
                let value = self.read_char(levels)?;
                if has_attr {
                    self.read_item()?;
                }
                return Ok(Node::new(Sexp::Char(value)));
            }
            sxp::LGL | sxp::INT => {
                let len = self.read_length()?;
                let mut values = Self::vec_with_capacity(len)?;
                for _ in 0..len {
                    values.push(self.reader.read_i32()?);
                }
                if kind == sxp::LGL {
                    Sexp::Logical(values)
                } else {
                    Sexp::Integer(values)
                }
            }
            sxp::REAL => {
                let len = self.read_length()?;
                let mut values = Self::vec_with_capacity(len)?;
                for _ in 0..len {
                    values.push(self.reader.read_f64()?);
                }
                Sexp::Real(values)
            }
            sxp::CPLX => {
                let len = self.read_length()?;
                let mut values = Self::vec_with_capacity(len)?;
                for _ in 0..len {
                    values.push((self.reader.read_f64()?, self.reader.read_f64()?));
                }
                Sexp::Complex(values)
            }
            sxp::STR => {
                let len = self.read_length()?;
                let mut values = Self::vec_with_capacity(len)?;
                for _ in 0..len {
                    match self.read_item()?.sexp {
                        Sexp::Char(s) => values.push(s),
                        other => {
                            return Err(ReadStatError::parse(format!(
                                "character vector holds a non-string cell {other:?}"
                            )))
                        }
                    }
                }
                Sexp::Strings(values)
            }
            sxp::VEC | sxp::EXPR => {
                let len = self.read_length()?;
                let mut values = Self::vec_with_capacity(len)?;
                for _ in 0..len {
                    values.push(self.read_item()?);
                }
                Sexp::List(values)
            }
            sxp::RAW => {
                let len = self.read_length()?;
                Sexp::Raw(self.reader.read_bytes(len)?)
            }
            sxp::S4 => Sexp::Opaque(kind),
            sxp::ALTREP => return self.read_altrep(flags),
            sxp::BCODE | sxp::CLASSREF | sxp::GENERICREF => {
                return Err(ReadStatError::parse(format!(
                    "serialized cell type {kind} is not supported"
                )))
            }
            other => {
                return Err(ReadStatError::parse(format!("unknown serialized cell type {other}")));
            }
        };

        let mut node = Node::new(sexp);
        node.is_object = flags & IS_OBJECT != 0;
        if has_attr {
            node.attributes = self.read_attributes()?;
        }
        Ok(node)
    }

    fn read_char(&mut self, levels: u32) -> Result<Option<String>> {
        let len = self.reader.read_i32()?;
        if len == -1 {
            return Ok(None);
        }
        let len = usize::try_from(len)
            .map_err(|_| ReadStatError::parse(format!("negative string length {len}")))?;
        let bytes = self.reader.read_bytes(len)?;
        let text = if levels & (LEVEL_UTF8 | LEVEL_ASCII | LEVEL_BYTES) != 0 {
            String::from_utf8_lossy(&bytes).into_owned()
        } else if levels & LEVEL_LATIN1 != 0 {
            Charset::windows_1252().decode(&bytes)
        } else {
            self.native.decode(&bytes)
        };
        Ok(Some(text))
    }

    /// A length-prefixed vector of CHARSXPs preceded by a zero word.
    fn read_string_vec(&mut self) -> Result<Vec<Option<String>>> {
        if self.reader.read_i32()? != 0 {
            return Err(ReadStatError::parse("string vector marker is not zero"));
        }
        let len = self.read_length()?;
        let mut values = Self::vec_with_capacity(len)?;
        for _ in 0..len {
            match self.read_item()?.sexp {
                Sexp::Char(s) => values.push(s),
                _ => return Err(ReadStatError::parse("string vector holds a non-string cell")),
            }
        }
        Ok(values)
    }

    /// Pairlists are read iteratively along their tails.
    fn read_pairlist(&mut self, first_flags: u32) -> Result<Node> {
        let kind = (first_flags & 0xFF) as u8;
        let mut entries = Vec::new();
        let mut attributes = Vec::new();
        let mut flags = first_flags;
        loop {
            if flags & HAS_ATTR != 0 {
                let attrs = self.read_attributes()?;
                if entries.is_empty() {
                    attributes = attrs;
                }
            }
            let tag = if flags & HAS_TAG != 0 {
                match self.read_item()?.sexp {
                    Sexp::Symbol(name) => Some(name),
                    Sexp::Char(name) => name,
                    _ => None,
                }
            } else {
                None
            };
            let car = self.read_item()?;
            entries.push((tag, car));

            flags = self.reader.read_u32()?;
            match (flags & 0xFF) as u8 {
                sxp::NILVALUE => break,
                sxp::LIST | sxp::ATTRLIST => {}
                _ => {
                    // dotted tail
                    let tail = self.read_with_flags(flags)?;
                    entries.push((None, tail));
                    break;
                }
            }
        }
        let sexp = if matches!(kind, sxp::LIST | sxp::ATTRLIST) {
            Sexp::Pairlist(entries)
        } else {
            Sexp::Opaque(kind)
        };
        Ok(Node {
            sexp,
            attributes,
            is_object: first_flags & IS_OBJECT != 0,
        })
    }

    fn read_attributes(&mut self) -> Result<Vec<(String, Node)>> {
        match self.read_item()?.sexp {
            Sexp::Pairlist(entries) => Ok(entries
                .into_iter()
                .map(|(tag, node)| (tag.unwrap_or_default(), node))
                .collect()),
            Sexp::Null => Ok(Vec::new()),
            other => Err(ReadStatError::parse(format!(
                "attributes are not a pairlist: {other:?}"
            ))),
        }
    }

    /// Expand the compact and wrapper representations R writes for
    /// alternative vector implementations.
    fn read_altrep(&mut self, flags: u32) -> Result<Node> {
        let info = self.read_item()?;
        let state = self.read_item()?;
        let attr = self.read_item()?;
        let class = match &info.sexp {
            Sexp::Pairlist(entries) => match entries.first().map(|(_, n)| &n.sexp) {
                Some(Sexp::Symbol(name)) => name.clone(),
                _ => String::new(),
            },
            _ => String::new(),
        };
        trace!(class = %class, "ALTREP");

        let mut node = match class.as_str() {
            "compact_intseq" | "compact_realseq" => {
                let (n, start, step) = match &state.sexp {
                    Sexp::Real(v) if v.len() == 3 => (v[0], v[1], v[2]),
                    Sexp::Integer(v) if v.len() == 3 => (f64::from(v[0]), f64::from(v[1]), f64::from(v[2])),
                    _ => return Err(ReadStatError::parse("malformed compact sequence state")),
                };
                let n = n as usize;
                if class == "compact_intseq" {
                    let mut values = Self::vec_with_capacity(n)?;
                    values.extend((0..n).map(|i| (start + step * i as f64) as i32));
                    Node::new(Sexp::Integer(values))
                } else {
                    let mut values = Self::vec_with_capacity(n)?;
                    values.extend((0..n).map(|i| start + step * i as f64));
                    Node::new(Sexp::Real(values))
                }
            }
            "deferred_string" => {
                let source = match state.sexp {
                    Sexp::Pairlist(mut entries) if !entries.is_empty() => entries.swap_remove(0).1,
                    _ => return Err(ReadStatError::parse("malformed deferred string state")),
                };
                let strings = match source.sexp {
                    Sexp::Integer(v) => v
                        .into_iter()
                        .map(|x| (x != NA_INTEGER).then(|| x.to_string()))
                        .collect(),
                    Sexp::Real(v) => v
                        .into_iter()
                        .map(|x| (!x.is_nan()).then(|| x.to_string()))
                        .collect(),
                    _ => return Err(ReadStatError::parse("deferred string over a non-numeric vector")),
                };
                Node::new(Sexp::Strings(strings))
            }
            c if c.starts_with("wrap_") => match state.sexp {
                Sexp::List(mut parts) if !parts.is_empty() => parts.swap_remove(0),
                _ => return Err(ReadStatError::parse("malformed wrapper state")),
            },
            other => {
                return Err(ReadStatError::parse(format!(
                    "unsupported alternative representation {other:?}"
                )))
            }
        };

        match attr.sexp {
            Sexp::Pairlist(entries) => {
                node.attributes = entries
                    .into_iter()
                    .map(|(tag, n)| (tag.unwrap_or_default(), n))
                    .collect();
            }
            Sexp::Null => {}
            _ => return Err(ReadStatError::parse("attributes are not a pairlist")),
        }
        node.is_object = node.is_object || flags & IS_OBJECT != 0;
        Ok(node)
    }
}

// ----------------------------------------------------------------------------
// Writing, for fixtures
// ----------------------------------------------------------------------------

/// Minimal XDR writer for building test streams.
#[doc(hidden)]
pub mod build {
    use super::{sxp, HAS_ATTR, HAS_TAG, IS_OBJECT, LEVEL_UTF8};

    #[derive(Debug, Default)]
    pub struct XdrWriter {
        pub bytes: Vec<u8>,
    }

    impl XdrWriter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn int(&mut self, v: i32) -> &mut Self {
            self.bytes.extend_from_slice(&v.to_be_bytes());
            self
        }

        pub fn real(&mut self, v: f64) -> &mut Self {
            self.bytes.extend_from_slice(&v.to_be_bytes());
            self
        }

        fn flags(&mut self, kind: u8, attr: bool, tag: bool, object: bool) -> &mut Self {
            let mut f = u32::from(kind);
            if attr {
                f |= HAS_ATTR;
            }
            if tag {
                f |= HAS_TAG;
            }
            if object {
                f |= IS_OBJECT;
            }
            self.int(f as i32)
        }

        /// `X\n` marker plus a version 2 header.
        pub fn header(&mut self) -> &mut Self {
            self.bytes.extend_from_slice(b"X\n");
            self.int(2).int(0x0004_0201).int(0x0002_0300)
        }

        pub fn nil(&mut self) -> &mut Self {
            self.int(i32::from(sxp::NILVALUE))
        }

        pub fn charsxp(&mut self, s: Option<&str>) -> &mut Self {
            self.int((u32::from(sxp::CHAR) | (LEVEL_UTF8 << 12)) as i32);
            match s {
                Some(s) => {
                    self.int(s.len() as i32);
                    self.bytes.extend_from_slice(s.as_bytes());
                    self
                }
                None => self.int(-1),
            }
        }

        pub fn symbol(&mut self, name: &str) -> &mut Self {
            self.int(i32::from(sxp::SYM));
            self.charsxp(Some(name))
        }

        pub fn ints(&mut self, values: &[i32], attr: bool) -> &mut Self {
            self.flags(sxp::INT, attr, false, attr);
            self.int(values.len() as i32);
            for &v in values {
                self.int(v);
            }
            self
        }

        pub fn logicals(&mut self, values: &[i32]) -> &mut Self {
            self.flags(sxp::LGL, false, false, false);
            self.int(values.len() as i32);
            for &v in values {
                self.int(v);
            }
            self
        }

        pub fn reals(&mut self, values: &[f64], attr: bool) -> &mut Self {
            self.flags(sxp::REAL, attr, false, attr);
            self.int(values.len() as i32);
            for &v in values {
                self.real(v);
            }
            self
        }

        pub fn strings(&mut self, values: &[Option<&str>], attr: bool) -> &mut Self {
            self.flags(sxp::STR, attr, false, false);
            self.int(values.len() as i32);
            for &v in values {
                self.charsxp(v);
            }
            self
        }

        /// Start a generic vector; its elements and then its attributes follow.
        pub fn list(&mut self, len: usize, attr: bool) -> &mut Self {
            self.flags(sxp::VEC, attr, false, attr);
            self.int(len as i32)
        }

        /// Start a tagged pairlist cell; the value and then the tail follow.
        pub fn cell(&mut self, tag: &str) -> &mut Self {
            self.flags(sxp::LIST, false, true, false);
            self.symbol(tag)
        }
    }
}
