//! Print the decoded event stream of a statistical data file.
//!
//! Usage: statdump <file> [--catalog <file.sas7bcat>] [--encoding <label>] [--rows <n>]
//!
//! The format is picked from the file extension.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use readstat::{
    ColumnData, FileMetadata, Handler, Parser, ParserConfiguration, RColumn, RDataHandler,
    RDataParser, Value, ValueData, Variable,
};

struct Args {
    path: PathBuf,
    catalog: Option<PathBuf>,
    config: ParserConfiguration,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut path = None;
    let mut catalog = None;
    let mut config = ParserConfiguration::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--catalog" => catalog = Some(PathBuf::from(args.next().context("--catalog needs a path")?)),
            "--encoding" => config.encoding = Some(args.next().context("--encoding needs a label")?),
            "--rows" => {
                let n = args.next().context("--rows needs a count")?;
                config.row_limit = Some(n.parse().with_context(|| format!("bad row count {n:?}"))?);
            }
            other if other.starts_with("--") => bail!("unknown option {other}"),
            other => path = Some(PathBuf::from(other)),
        }
    }
    let Some(path) = path else {
        bail!("usage: statdump <file> [--catalog <file>] [--encoding <label>] [--rows <n>]");
    };
    Ok(Args { path, catalog, config })
}

fn render(value: &Value) -> String {
    if let Some(tag) = value.missing_tag() {
        return format!(".{tag}");
    }
    if value.is_missing() {
        return ".".to_string();
    }
    match value.data() {
        ValueData::String(s) | ValueData::LongString(s) => format!("{s:?}"),
        ValueData::Char(v) => v.to_string(),
        ValueData::Int16(v) => v.to_string(),
        ValueData::Int32(v) => v.to_string(),
        ValueData::Float(v) => v.to_string(),
        ValueData::Double(v) => v.to_string(),
    }
}

// ----------------------------------------------------------------------------
// Row-major printing
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Printer {
    row: Vec<String>,
    var_count: usize,
}

impl Handler for Printer {
    fn info(&mut self, metadata: &FileMetadata) -> ControlFlow<()> {
        println!("format:      {}", metadata.format);
        println!("rows:        {}", metadata.obs_count);
        println!("variables:   {}", metadata.var_count);
        println!("encoding:    {}", metadata.encoding);
        println!("compression: {:?}", metadata.compression);
        println!("endian:      {:?}", metadata.endian);
        if !metadata.file_label.is_empty() {
            println!("label:       {}", metadata.file_label);
        }
        if let Some(ts) = &metadata.timestamp {
            println!("timestamp:   {ts}");
        }
        self.var_count = metadata.var_count;
        println!();
        ControlFlow::Continue(())
    }

    fn variable(&mut self, index: usize, variable: &Variable) -> ControlFlow<()> {
        print!("[{index}] {} {}", variable.display_name(), variable.value_type);
        if !variable.format.is_empty() {
            print!(" format={}", variable.format);
        }
        if let Some(set) = &variable.label_set {
            print!(" labels={set}");
        }
        if !variable.label.is_empty() {
            print!(" {:?}", variable.label);
        }
        println!();
        ControlFlow::Continue(())
    }

    fn value(&mut self, obs: usize, var: usize, value: &Value) -> ControlFlow<()> {
        if var == 0 && obs == 0 {
            println!();
        }
        self.row.push(render(value));
        if var + 1 == self.var_count {
            println!("{obs}: {}", self.row.join(" | "));
            self.row.clear();
        }
        ControlFlow::Continue(())
    }

    fn value_label(&mut self, label_set: &str, value: &Value, label: &str) -> ControlFlow<()> {
        println!("label {label_set}: {} = {label:?}", render(value));
        ControlFlow::Continue(())
    }

    fn error(&mut self, message: &str) {
        eprintln!("error: {message}");
    }
}

// ----------------------------------------------------------------------------
// Column printing for workspaces
// ----------------------------------------------------------------------------

struct ColumnPrinter;

impl RDataHandler for ColumnPrinter {
    fn table(&mut self, name: &str) -> ControlFlow<()> {
        println!("\ntable {name}");
        ControlFlow::Continue(())
    }

    fn column(&mut self, column: &RColumn<'_>) -> ControlFlow<()> {
        let kind = match column.data {
            ColumnData::Logical(_) => "logical",
            ColumnData::Integer(_) => "integer",
            ColumnData::Real(_) => "double",
            ColumnData::Text { .. } => "character",
        };
        println!("[{}] {kind} {:?} x{}", column.index, column.class, column.data.len());
        ControlFlow::Continue(())
    }

    fn column_name(&mut self, name: &str, index: usize) -> ControlFlow<()> {
        println!("name [{index}] {name}");
        ControlFlow::Continue(())
    }

    fn value_label(&mut self, code: i32, label: &str, index: usize) -> ControlFlow<()> {
        println!("  level [{index}] {code} = {label:?}");
        ControlFlow::Continue(())
    }

    fn error(&mut self, message: &str) {
        eprintln!("error: {message}");
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn main() -> Result<()> {
    let args = parse_args()?;
    let path = args.path.as_path();
    let shown = path.display();

    if extension(path) == "rdata" || extension(path) == "rda" {
        let mut parser = RDataParser::new(ColumnPrinter).with_configuration(args.config);
        return parser.parse_rdata(path).with_context(|| format!("decoding {shown}"));
    }

    let mut parser = Parser::new(Printer::default()).with_configuration(args.config);
    let result = match (extension(path).as_str(), &args.catalog) {
        ("dta", _) => parser.parse_dta(path),
        ("sav" | "zsav", _) => parser.parse_sav(path),
        ("por", _) => parser.parse_por(path),
        ("sas7bdat", Some(catalog)) => parser.parse_sas7bdat_with_catalog(path, catalog),
        ("sas7bdat", None) => parser.parse_sas7bdat(path),
        ("sas7bcat", _) => parser.parse_sas7bcat(path),
        ("rds", _) => parser.parse_rds(path),
        (other, _) => bail!("unrecognized file extension {other:?}"),
    };
    result.with_context(|| format!("decoding {shown}"))
}
