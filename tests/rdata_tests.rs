//! R `.rds` and `.RData` decoding through both interfaces.

mod common;

use std::io::{Cursor, Write};
use std::ops::ControlFlow;

use flate2::write::GzEncoder;

use common::builders::{rdata, rds, write_frame, RCol};
use common::{row_major, Recorder};
use readstat::io::rdata::XdrWriter;
use readstat::{
    ColumnClass, ColumnData, Compression, ErrorKind, FileFormat, Missing, Parser, RColumn,
    RDataHandler, RDataParser, ValueType,
};

const NA: i32 = i32::MIN;

fn people() -> Vec<(&'static str, RCol)> {
    vec![
        ("age", RCol::Int(vec![31, NA, 58])),
        ("height", RCol::Real(vec![1.82, 1.65, f64::NAN])),
        ("name", RCol::Str(vec![Some("Ada"), None, Some("Cy")])),
        ("smoker", RCol::Logical(vec![0, 1, NA])),
        ("blood", RCol::Factor(vec![2, 1, 2], vec!["A", "B"])),
        ("visit", RCol::Date(vec![19_723.0, 19_724.0, 19_725.0])),
    ]
}

#[test]
fn test_rds_rows_are_transposed() {
    let mut parser = Parser::new(Recorder::new());
    parser.parse_rds_reader(Cursor::new(rds(&people()))).unwrap();
    let rec = parser.into_handler();

    let meta = rec.metadata.as_ref().unwrap();
    assert_eq!(meta.format, FileFormat::Rds { version: 2 });
    assert_eq!(meta.obs_count, 3);
    assert_eq!(meta.var_count, 6);
    assert_eq!(meta.compression, Compression::None);

    assert_eq!(rec.positions(), row_major(3, 6));
    assert_eq!(rec.cell(0, 0).as_i32(), Some(31));
    assert_eq!(rec.cell(1, 0).missing_kind(), Missing::System);
    assert_eq!(rec.cell(0, 1).as_f64(), Some(1.82));
    assert!(rec.cell(2, 1).is_missing());
    assert_eq!(rec.cell(2, 2).as_str(), Some("Cy"));
    assert!(rec.cell(1, 2).is_missing());
    assert_eq!(rec.cell(1, 3).as_i32(), Some(1));
    assert!(rec.cell(2, 3).is_missing());
    assert_eq!(rec.cell(0, 4).as_i32(), Some(2));
    assert_eq!(rec.cell(2, 5).as_f64(), Some(19_725.0));
}

#[test]
fn test_rds_variables_and_factor_labels() {
    let mut parser = Parser::new(Recorder::new());
    parser.parse_rds_reader(Cursor::new(rds(&people()))).unwrap();
    let rec = parser.into_handler();

    let types: Vec<_> = rec.variables.iter().map(|v| v.value_type).collect();
    assert_eq!(
        types,
        [
            ValueType::Int32,
            ValueType::Double,
            ValueType::String,
            ValueType::Int32,
            ValueType::Int32,
            ValueType::Double
        ]
    );
    assert_eq!(rec.variables[4].format, "factor");
    assert_eq!(rec.variables[4].label_set.as_deref(), Some("blood"));
    assert_eq!(rec.variables[5].format, "Date");

    let labels = rec.labels();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels[0].0, "blood");
    assert_eq!(labels[0].1.as_i32(), Some(1));
    assert_eq!(labels[0].2, "A");
    assert_eq!(labels[1].2, "B");
}

#[test]
fn test_gzip_stream() {
    let mut gz = GzEncoder::new(Vec::new(), flate2::Compression::default());
    gz.write_all(&rds(&people())).unwrap();
    let bytes = gz.finish().unwrap();

    let mut parser = Parser::new(Recorder::new());
    parser.parse_rds_reader(Cursor::new(bytes)).unwrap();
    let rec = parser.into_handler();
    assert_eq!(rec.metadata.as_ref().unwrap().compression, Compression::Gzip);
    assert_eq!(rec.values().len(), 18);
}

#[test]
fn test_bzip2_is_unsupported() {
    let mut bytes = b"BZh91AY&SY".to_vec();
    bytes.extend(rds(&people()));
    let mut parser = Parser::new(Recorder::new());
    let err = parser.parse_rds_reader(Cursor::new(bytes)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedCompression);
    assert_eq!(parser.handler().control_event_count(), 0);
}

#[test]
fn test_non_frame_rds_is_rejected() {
    let mut w = XdrWriter::new();
    w.header();
    w.reals(&[1.0, 2.0], false);
    let mut parser = Parser::new(Recorder::new());
    let err = parser.parse_rds_reader(Cursor::new(w.bytes)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
    assert!(parser.handler().metadata.is_none());
}

// ---------------------------------------------------------------------------
// Column interface
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum ColumnEvent {
    Table(String),
    Column(usize, ColumnClass, usize),
    Text(Option<String>, usize),
    Level(i32, String, usize),
    Name(String, usize),
}

#[derive(Default)]
struct Columns {
    events: Vec<ColumnEvent>,
    reals: Vec<Vec<f64>>,
    stop_after: Option<usize>,
}

impl Columns {
    fn flow(&self) -> ControlFlow<()> {
        match self.stop_after {
            Some(n) if self.events.len() >= n => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        }
    }
}

impl RDataHandler for Columns {
    fn table(&mut self, name: &str) -> ControlFlow<()> {
        self.events.push(ColumnEvent::Table(name.to_string()));
        self.flow()
    }

    fn column(&mut self, column: &RColumn<'_>) -> ControlFlow<()> {
        if let ColumnData::Real(v) = column.data {
            self.reals.push(v.to_vec());
        }
        self.events
            .push(ColumnEvent::Column(column.index, column.class, column.data.len()));
        self.flow()
    }

    fn column_name(&mut self, name: &str, index: usize) -> ControlFlow<()> {
        self.events.push(ColumnEvent::Name(name.to_string(), index));
        self.flow()
    }

    fn text_value(&mut self, value: Option<&str>, index: usize) -> ControlFlow<()> {
        self.events
            .push(ColumnEvent::Text(value.map(String::from), index));
        self.flow()
    }

    fn value_label(&mut self, code: i32, label: &str, index: usize) -> ControlFlow<()> {
        self.events
            .push(ColumnEvent::Level(code, label.to_string(), index));
        self.flow()
    }
}

#[test]
fn test_column_interface_order() {
    let frame = vec![
        ("x", RCol::Real(vec![0.5, 1.5])),
        ("s", RCol::Str(vec![Some("p"), None])),
        ("f", RCol::Factor(vec![1, 2], vec!["lo", "hi"])),
    ];
    let mut parser = RDataParser::new(Columns::default());
    parser.parse_rds_reader(Cursor::new(rds(&frame))).unwrap();
    let handler = parser.into_handler();

    use ColumnEvent::*;
    assert_eq!(
        handler.events,
        [
            Column(0, ColumnClass::Plain, 2),
            Column(1, ColumnClass::Plain, 2),
            Text(Some("p".into()), 0),
            Text(None, 1),
            Column(2, ColumnClass::Factor, 2),
            Level(1, "lo".into(), 2),
            Level(2, "hi".into(), 2),
            Name("x".into(), 0),
            Name("s".into(), 1),
            Name("f".into(), 2),
        ]
    );
    assert_eq!(handler.reals, [vec![0.5, 1.5]]);
}

#[test]
fn test_workspace_emits_each_frame() {
    let small: &dyn Fn(&mut XdrWriter) = &|w| write_frame(w, &[("a", RCol::Int(vec![1]))]);
    let scalar: &dyn Fn(&mut XdrWriter) = &|w| {
        w.reals(&[3.0], false);
    };
    let dated: &dyn Fn(&mut XdrWriter) = &|w| write_frame(w, &[("d", RCol::Date(vec![1.0, 2.0]))]);
    let bytes = rdata(&[("first", small), ("pi", scalar), ("second", dated)]);

    let mut parser = RDataParser::new(Columns::default());
    parser.parse_rdata_reader(Cursor::new(bytes)).unwrap();
    let handler = parser.into_handler();

    let tables: Vec<_> = handler
        .events
        .iter()
        .filter_map(|e| match e {
            ColumnEvent::Table(name) => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(tables, ["first", "second"]);
    assert!(handler
        .events
        .contains(&ColumnEvent::Column(0, ColumnClass::Date, 2)));
}

#[test]
fn test_column_handler_abort() {
    let frame = vec![("x", RCol::Real(vec![0.5])), ("y", RCol::Real(vec![1.5]))];
    let mut parser = RDataParser::new(Columns {
        stop_after: Some(1),
        ..Default::default()
    });
    let err = parser.parse_rds_reader(Cursor::new(rds(&frame))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UserAbort);
    assert_eq!(parser.handler().events.len(), 1);
}

#[test]
fn test_workspace_entry_accepts_single_object() {
    let frame = vec![("x", RCol::Real(vec![0.5, 1.5])), ("n", RCol::Int(vec![1, 2]))];
    let mut gz = GzEncoder::new(Vec::new(), flate2::Compression::default());
    gz.write_all(&rds(&frame)).unwrap();
    let compressed = gz.finish().unwrap();

    for bytes in [rds(&frame), compressed] {
        let mut parser = RDataParser::new(Columns::default());
        parser.parse_rdata_reader(Cursor::new(bytes)).unwrap();
        let handler = parser.into_handler();
        assert!(!handler
            .events
            .iter()
            .any(|e| matches!(e, ColumnEvent::Table(_))));
        assert_eq!(handler.events[0], ColumnEvent::Column(0, ColumnClass::Plain, 2));
        assert_eq!(handler.reals, [vec![0.5, 1.5]]);
    }
}

#[test]
fn test_workspace_entry_rejects_other_bytes() {
    let mut parser = RDataParser::new(Columns::default());
    let err = parser
        .parse_rdata_reader(Cursor::new(b"PK\x03\x04 not R at all".to_vec()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
    assert!(parser.handler().events.is_empty());
}

#[test]
fn test_rdata_from_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.RData");
    let frame: &dyn Fn(&mut XdrWriter) = &|w| write_frame(w, &[("a", RCol::Int(vec![1, 2]))]);
    std::fs::write(&path, rdata(&[("df", frame)])).unwrap();

    let mut parser = RDataParser::new(Columns::default());
    parser.parse_rdata(&path).unwrap();
    assert_eq!(parser.handler().events[0], ColumnEvent::Table("df".into()));

    let err = parser.parse_rdata(dir.path().join("nope.RData")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Open);
}
