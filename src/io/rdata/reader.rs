//! Stream opening, data frame extraction and the two emission modes.

use std::io::{self, Read, Seek, SeekFrom};
use std::ops::ControlFlow;

use flate2::read::GzDecoder;
use tracing::debug;

use super::sexp::{version_string, Node, Sexp, SexpReader, StreamHeader, NA_INTEGER};
use super::{ColumnClass, ColumnData, RColumn, RDataHandler};
use crate::error::{ReadStatError, Result};
use crate::handler::{Dispatcher, Handler};
use crate::io::charset::{self, Charset};
use crate::io::cursor::{ByteReader, Endian};
use crate::metadata::{Compression, FileFormat, FileMetadata, Variable};
use crate::parser::ParserConfiguration;
use crate::value::{Missing, Value, ValueData, ValueType};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xFD, b'7', b'z', b'X', b'Z', 0x00];

// ----------------------------------------------------------------------------
// Stream
// ----------------------------------------------------------------------------

enum Stream<R> {
    Plain(R),
    Gzip(GzDecoder<R>),
}

impl<R> Stream<R> {
    fn into_inner(self) -> R {
        match self {
            Stream::Plain(r) => r,
            Stream::Gzip(r) => r.into_inner(),
        }
    }
}

impl<R: Read> Read for Stream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(r) => r.read(buf),
            Stream::Gzip(r) => r.read(buf),
        }
    }
}

/// Detect the outer compression from the leading bytes.
fn decompress<R: Read + Seek>(source: R) -> Result<(Stream<R>, Compression)> {
    let mut reader = ByteReader::from_seekable(source, Endian::Big)?;
    let start = reader.position();
    let mut magic = [0u8; 6];
    let n = reader.read_up_to(&mut magic)?;
    reader.seek_to(start)?;
    let magic = &magic[..n];
    let inner = reader.into_inner();
    if magic.starts_with(GZIP_MAGIC) {
        Ok((Stream::Gzip(GzDecoder::new(inner)), Compression::Gzip))
    } else if magic.starts_with(BZIP2_MAGIC) {
        Err(ReadStatError::UnsupportedCompression("bzip2".into()))
    } else if magic.starts_with(XZ_MAGIC) {
        Err(ReadStatError::UnsupportedCompression("xz".into()))
    } else {
        Ok((Stream::Plain(inner), Compression::None))
    }
}

struct Session<R> {
    items: SexpReader<Stream<R>>,
    header: StreamHeader,
    compression: Compression,
    charset: Charset,
    workspace: bool,
}

/// Check the signature and header. Workspaces carry an extra `RDX2`/`RDX3`
/// line before the format marker; when `workspace` is set and that line is
/// absent, the stream is reopened as a single object.
fn open_session<R: Read + Seek>(
    mut source: R,
    config: &ParserConfiguration,
    workspace: bool,
) -> Result<Session<R>> {
    let start = source
        .stream_position()
        .map_err(|e| ReadStatError::read_at(0, e))?;
    let (stream, compression) = decompress(source)?;
    let mut reader = ByteReader::new(stream, Endian::Big);
    let mut is_workspace = false;
    if workspace {
        let mut magic = [0u8; 5];
        let n = reader.read_up_to(&mut magic)?;
        if n == magic.len() && (magic == *b"RDX2\n" || magic == *b"RDX3\n") {
            is_workspace = true;
        } else {
            let mut inner = reader.into_inner().into_inner();
            inner
                .seek(SeekFrom::Start(start))
                .map_err(|e| ReadStatError::read_at(start, e))?;
            let (stream, _) = decompress(inner)?;
            reader = ByteReader::new(stream, Endian::Big);
        }
    }
    let mut format = [0u8; 2];
    let n = reader.read_up_to(&mut format)?;
    match &format[..n] {
        b"X\n" => {}
        b"A\n" | b"B\n" => {
            return Err(ReadStatError::parse(
                "only XDR serialization is supported, not ASCII or native binary",
            ))
        }
        _ => return Err(ReadStatError::parse("not an R serialization stream")),
    }

    let mut items = SexpReader::new(reader);
    let header = items.read_header()?;
    let declared = header.native_encoding.as_deref().map(Charset::for_label);
    let charset = charset::resolve(config.encoding.as_deref(), declared, Charset::utf8())?;
    items.set_native(charset);
    debug!(
        written_by = %version_string(header.writer_version),
        charset = charset.name(),
        ?compression,
        workspace = is_workspace,
        "opened R stream"
    );
    Ok(Session {
        items,
        header,
        compression,
        charset,
        workspace: is_workspace,
    })
}

// ----------------------------------------------------------------------------
// Data frames
// ----------------------------------------------------------------------------

enum Store {
    Logical(Vec<i32>),
    Integer(Vec<i32>),
    Real(Vec<f64>),
    Text(Vec<Option<String>>),
}

impl Store {
    fn len(&self) -> usize {
        match self {
            Store::Logical(v) | Store::Integer(v) => v.len(),
            Store::Real(v) => v.len(),
            Store::Text(v) => v.len(),
        }
    }
}

struct FrameColumn {
    name: String,
    store: Store,
    class: ColumnClass,
    levels: Vec<String>,
}

impl FrameColumn {
    fn value_type(&self) -> ValueType {
        match self.store {
            Store::Logical(_) | Store::Integer(_) => ValueType::Int32,
            Store::Real(_) => ValueType::Double,
            Store::Text(_) => ValueType::String,
        }
    }

    fn data(&self) -> ColumnData<'_> {
        match &self.store {
            Store::Logical(v) => ColumnData::Logical(v),
            Store::Integer(v) => ColumnData::Integer(v),
            Store::Real(v) => ColumnData::Real(v),
            Store::Text(v) => ColumnData::Text { len: v.len() },
        }
    }

    fn value_at(&self, row: usize) -> Value {
        match &self.store {
            Store::Logical(v) | Store::Integer(v) => match v[row] {
                NA_INTEGER => Value::missing(ValueType::Int32, Missing::System),
                x => Value::int32(x),
            },
            Store::Real(v) => {
                let x = v[row];
                if x.is_nan() {
                    Value::new(ValueData::Double(x), Missing::System)
                } else {
                    Value::double(x)
                }
            }
            Store::Text(v) => match &v[row] {
                Some(s) => Value::string(s.clone()),
                None => Value::missing(ValueType::String, Missing::System),
            },
        }
    }
}

struct Frame {
    columns: Vec<FrameColumn>,
    rows: usize,
}

fn is_data_frame(node: &Node) -> bool {
    node.is_object && matches!(node.sexp, Sexp::List(_)) && node.inherits("data.frame")
}

/// Rows from `row.names`, which R stores compactly as `c(NA, -n)`.
fn row_count(node: &Node, first_column: Option<&Node>) -> usize {
    match node.attr("row.names") {
        Some(Node {
            sexp: Sexp::Integer(v),
            ..
        }) if v.len() == 2 && v[0] == NA_INTEGER => v[1].unsigned_abs() as usize,
        Some(names) => names.len(),
        None => first_column.map_or(0, Node::len),
    }
}

fn column_class(node: &Node) -> ColumnClass {
    if node.is_object && node.inherits("factor") {
        ColumnClass::Factor
    } else if node.inherits("Date") {
        ColumnClass::Date
    } else if node.inherits("POSIXct") {
        ColumnClass::DateTime
    } else {
        ColumnClass::Plain
    }
}

fn frame_from_node(node: Node) -> Result<Frame> {
    let names: Vec<String> = match node.attr("names").map(|n| &n.sexp) {
        Some(Sexp::Strings(values)) => values.iter().map(|v| v.clone().unwrap_or_default()).collect(),
        _ => Vec::new(),
    };
    let Sexp::List(cells) = &node.sexp else {
        return Err(ReadStatError::parse("data frame is not a list"));
    };
    let rows = row_count(&node, cells.first());

    let mut columns = Vec::with_capacity(cells.len());
    for (index, cell) in cells.iter().enumerate() {
        let name = match names.get(index) {
            Some(n) if !n.is_empty() => n.clone(),
            _ => format!("V{}", index + 1),
        };
        let class = column_class(cell);
        let levels = if class == ColumnClass::Factor {
            cell.string_attr("levels").into_iter().map(String::from).collect()
        } else {
            Vec::new()
        };
        let store = match &cell.sexp {
            Sexp::Logical(v) => Store::Logical(v.clone()),
            Sexp::Integer(v) => Store::Integer(v.clone()),
            Sexp::Real(v) => Store::Real(v.clone()),
            Sexp::Strings(v) => Store::Text(v.clone()),
            other => {
                return Err(ReadStatError::parse(format!(
                    "column {name} has an unsupported type ({})",
                    sexp_name(other)
                )))
            }
        };
        if store.len() != rows {
            return Err(ReadStatError::RowCountMismatch {
                expected: rows as u64,
                actual: store.len() as u64,
            });
        }
        columns.push(FrameColumn {
            name,
            store,
            class,
            levels,
        });
    }
    Ok(Frame { columns, rows })
}

fn sexp_name(sexp: &Sexp) -> &'static str {
    match sexp {
        Sexp::Null => "NULL",
        Sexp::Symbol(_) => "symbol",
        Sexp::Char(_) => "CHARSXP",
        Sexp::Logical(_) => "logical",
        Sexp::Integer(_) => "integer",
        Sexp::Real(_) => "double",
        Sexp::Complex(_) => "complex",
        Sexp::Strings(_) => "character",
        Sexp::List(_) => "list",
        Sexp::Pairlist(_) => "pairlist",
        Sexp::Raw(_) => "raw",
        Sexp::Environment => "environment",
        Sexp::Opaque(_) => "language object",
    }
}

// ----------------------------------------------------------------------------
// Column-oriented emission
// ----------------------------------------------------------------------------

fn check(flow: ControlFlow<()>) -> Result<()> {
    match flow {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(()) => Err(ReadStatError::UserAbort),
    }
}

fn emit_columns<H: RDataHandler + ?Sized>(handler: &mut H, frame: &Frame) -> Result<()> {
    for (index, column) in frame.columns.iter().enumerate() {
        check(handler.column(&RColumn {
            index,
            data: column.data(),
            class: column.class,
        }))?;
        if let Store::Text(values) = &column.store {
            for (i, value) in values.iter().enumerate() {
                check(handler.text_value(value.as_deref(), i))?;
            }
        }
        for (k, level) in column.levels.iter().enumerate() {
            check(handler.value_label(k as i32 + 1, level, index))?;
        }
    }
    for (index, column) in frame.columns.iter().enumerate() {
        check(handler.column_name(&column.name, index))?;
    }
    Ok(())
}

/// Drive an [`RDataHandler`]. A workspace emits every data frame it binds,
/// skipping other objects; a single-object file must hold a data frame.
pub(crate) fn read_columns<R: Read + Seek, H: RDataHandler + ?Sized>(
    source: R,
    config: &ParserConfiguration,
    handler: &mut H,
    workspace: bool,
) -> Result<()> {
    let mut session = open_session(source, config, workspace)?;
    let root = session.items.read_item()?;
    if !session.workspace {
        if !is_data_frame(&root) {
            return Err(ReadStatError::parse("object is not a data frame"));
        }
        return emit_columns(handler, &frame_from_node(root)?);
    }

    let Sexp::Pairlist(entries) = root.sexp else {
        return Err(ReadStatError::parse("workspace does not bind any objects"));
    };
    for (name, node) in entries {
        let name = name.unwrap_or_default();
        if !is_data_frame(&node) {
            debug!(name = %name, kind = sexp_name(&node.sexp), "skipping non-data-frame object");
            continue;
        }
        check(handler.table(&name))?;
        emit_columns(handler, &frame_from_node(node)?)?;
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Row-major emission
// ----------------------------------------------------------------------------

/// Decode an `.rds` data frame into `dispatcher`, transposing its columns
/// into rows. Factor levels become label sets named after their column.
pub(crate) fn read_rds_rows<R: Read + Seek, H: Handler + ?Sized>(
    source: R,
    config: &ParserConfiguration,
    dispatcher: &mut Dispatcher<'_, H>,
) -> Result<()> {
    let mut session = open_session(source, config, false)?;
    dispatcher.signature_ok();
    let root = session.items.read_item()?;
    if !is_data_frame(&root) {
        return Err(ReadStatError::parse("object is not a data frame"));
    }
    let frame = frame_from_node(root)?;

    let mut metadata = FileMetadata::new(FileFormat::Rds {
        version: session.header.version,
    });
    metadata.obs_count = config.rows_to_emit(frame.rows);
    metadata.var_count = frame.columns.len();
    metadata.encoding = session.charset.name().to_string();
    metadata.compression = session.compression;
    metadata.endian = Endian::Big;
    dispatcher.info(&metadata)?;

    for (index, column) in frame.columns.iter().enumerate() {
        let mut var = Variable::new(index, column.name.as_str(), column.value_type());
        var.format = match column.class {
            ColumnClass::Plain => String::new(),
            ColumnClass::Factor => "factor".into(),
            ColumnClass::Date => "Date".into(),
            ColumnClass::DateTime => "POSIXct".into(),
        };
        if column.class == ColumnClass::Factor {
            var.label_set = Some(column.name.clone());
        }
        var.storage_width = match column.store {
            Store::Real(_) => 8,
            Store::Logical(_) | Store::Integer(_) => 4,
            Store::Text(_) => 0,
        };
        dispatcher.variable(&var)?;
    }

    for obs in 0..metadata.obs_count {
        for (index, column) in frame.columns.iter().enumerate() {
            dispatcher.value(obs, index, &column.value_at(obs))?;
        }
    }

    for column in frame.columns.iter().filter(|c| c.class == ColumnClass::Factor) {
        for (k, level) in column.levels.iter().enumerate() {
            dispatcher.value_label(&column.name, &Value::int32(k as i32 + 1), level)?;
        }
    }
    Ok(())
}
