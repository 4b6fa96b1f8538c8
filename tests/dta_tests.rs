//! Stata DTA decoding across the binary and tagged layouts.

mod common;

use std::io::Cursor;

use common::builders::{dta114, dta_xml, strl_cell, DtaVar, Strl};
use common::{row_major, Recorder};
use readstat::{
    DtaRelease, DtaReleases, ErrorKind, FileFormat, Missing, Parser, ParserConfiguration,
    ValueType,
};

fn decode(bytes: Vec<u8>) -> Recorder {
    let mut parser = Parser::new(Recorder::new());
    parser.parse_dta_reader(Cursor::new(bytes)).unwrap();
    parser.into_handler()
}

/// Three rows of (byte, int, double, str5) in release 114 layout.
fn release_114() -> Vec<u8> {
    let vars = [
        DtaVar::new("rep", 251, "%8.0g").labelled("replab"),
        DtaVar::new("mpg", 252, "%8.0g"),
        DtaVar::new("price", 255, "%9.2f"),
        DtaVar::new("make", 5, "%5s"),
    ];
    let mut data = Vec::new();
    let rows: [(i8, i16, f64, &str); 3] = [(1, 22, 4099.0, "AMC"), (2, 17, 4749.5, "Buick"), (101, 32741, 0.0, "")];
    for (i, (rep, mpg, price, make)) in rows.iter().enumerate() {
        data.push(*rep as u8);
        data.extend_from_slice(&mpg.to_le_bytes());
        let price_bits = if i == 2 {
            0x7fe0_0000_0000_0000u64 + (2u64 << 40)
        } else {
            price.to_bits()
        };
        data.extend_from_slice(&price_bits.to_le_bytes());
        let mut field = make.as_bytes().to_vec();
        field.resize(5, 0);
        data.extend(field);
    }
    dta114(&vars, 3, &data, &[("replab", &[(1, "poor"), (2, "fair")])])
}

#[test]
fn test_release_114_dictionary() {
    let rec = decode(release_114());
    let meta = rec.metadata.as_ref().unwrap();
    assert_eq!(meta.format, FileFormat::Dta(DtaRelease::R114));
    assert_eq!(meta.obs_count, 3);
    assert_eq!(meta.var_count, 4);
    assert_eq!(meta.file_label, "fixture dataset");
    assert_eq!(meta.timestamp.as_deref(), Some("05 Jan 2024 10:30"));

    let types: Vec<_> = rec.variables.iter().map(|v| v.value_type).collect();
    assert_eq!(
        types,
        [ValueType::Char, ValueType::Int16, ValueType::Double, ValueType::String]
    );
    assert_eq!(rec.variables[0].label_set.as_deref(), Some("replab"));
    assert_eq!(rec.variables[2].format, "%9.2f");
    assert_eq!(rec.variables[3].storage_width, 5);
}

#[test]
fn test_release_114_values_and_missing() {
    let rec = decode(release_114());
    assert_eq!(rec.positions(), row_major(3, 4));
    assert_eq!(rec.cell(0, 0).as_char(), Some(1));
    assert_eq!(rec.cell(1, 1).as_i16(), Some(17));
    assert_eq!(rec.cell(1, 2).as_f64(), Some(4749.5));
    assert_eq!(rec.cell(1, 3).as_str(), Some("Buick"));

    assert_eq!(rec.cell(2, 0).missing_kind(), Missing::System);
    assert_eq!(rec.cell(2, 1).missing_kind(), Missing::System);
    assert_eq!(rec.cell(2, 2).missing_tag(), Some('b'));
    assert_eq!(rec.cell(2, 3).as_str(), Some(""));
    assert!(!rec.cell(2, 3).is_missing());
}

#[test]
fn test_release_114_value_labels() {
    let rec = decode(release_114());
    let labels = rec.labels();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels[0].0, "replab");
    assert_eq!(labels[0].1.as_i32(), Some(1));
    assert_eq!(labels[0].2, "poor");
    assert_eq!(labels[1].2, "fair");
}

#[test]
fn test_disabled_release_is_rejected() {
    let config = ParserConfiguration {
        dta_releases: DtaReleases::all() - DtaRelease::R114.flag(),
        ..Default::default()
    };
    let mut parser = Parser::new(Recorder::new()).with_configuration(config);
    let err = parser.parse_dta_reader(Cursor::new(release_114())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
    assert_eq!(parser.handler().control_event_count(), 0);
}

#[test]
fn test_trailing_partial_row_is_width_mismatch() {
    let mut bytes = release_114();
    // cut the value labels and half of the last row
    let labels_len = 4 + 33 + 3 + (8 + 2 * 8 + "poor\0fair\0".len());
    bytes.truncate(bytes.len() - labels_len - 7);
    let mut parser = Parser::new(Recorder::new());
    let err = parser.parse_dta_reader(Cursor::new(bytes)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RowWidthMismatch);
    assert!(parser.handler().values().is_empty());
}

#[test]
fn test_release_117_numeric_types() {
    let vars = [
        DtaVar::new("small", 65530, "%8.0g"),
        DtaVar::new("count", 65528, "%12.0g"),
        DtaVar::new("ratio", 65527, "%9.0g"),
        DtaVar::new("name", 6, "%6s"),
    ];
    let mut data = Vec::new();
    data.push((-5i8) as u8);
    data.extend_from_slice(&100_000i32.to_le_bytes());
    data.extend_from_slice(&0.5f32.to_le_bytes());
    data.extend_from_slice(b"alpha\0");
    data.push(102);
    data.extend_from_slice(&2_147_483_621i32.to_le_bytes());
    data.extend_from_slice(&(0x7f00_0000u32 + (3 << 11)).to_le_bytes());
    data.extend_from_slice(b"beta\0\0");
    let bytes = dta_xml(117, &vars, 2, &data, &[], &[("unused", &[(5, "five")])]);

    let rec = decode(bytes);
    assert_eq!(rec.metadata.as_ref().unwrap().file_label, "xml fixture");
    assert_eq!(rec.cell(0, 0).as_char(), Some(-5));
    assert_eq!(rec.cell(0, 1).as_i32(), Some(100_000));
    assert_eq!(rec.cell(0, 2).as_f32(), Some(0.5));
    assert_eq!(rec.cell(0, 3).as_str(), Some("alpha"));
    assert_eq!(rec.cell(1, 0).missing_tag(), Some('a'));
    assert_eq!(rec.cell(1, 1).missing_kind(), Missing::System);
    assert_eq!(rec.cell(1, 2).missing_tag(), Some('c'));
    assert_eq!(rec.cell(1, 3).as_str(), Some("beta"));
    assert_eq!(rec.labels().len(), 1);
}

#[test]
fn test_release_118_strl_and_labels() {
    let vars = [
        DtaVar::new("id", 65529, "%8.0g").labelled("idlab"),
        DtaVar::new("essay", 32768, "%9s"),
    ];
    let mut data = Vec::new();
    for obs in 1..=3u64 {
        data.extend_from_slice(&(obs as i16).to_le_bytes());
        data.extend(strl_cell(118, 2, obs));
    }
    let strls: Vec<Strl> = (1..=3u64)
        .map(|obs| Strl {
            var: 2,
            obs,
            text: format!("essay number {obs} ").repeat(200),
        })
        .collect();
    let bytes = dta_xml(118, &vars, 3, &data, &strls, &[("idlab", &[(1, "first"), (3, "third")])]);

    let rec = decode(bytes);
    let meta = rec.metadata.as_ref().unwrap();
    assert_eq!(meta.format, FileFormat::Dta(DtaRelease::R118));
    assert_eq!(meta.encoding, "UTF-8");
    for obs in 0..3u64 {
        let expected = format!("essay number {} ", obs + 1).repeat(200);
        assert_eq!(rec.cell(obs as usize, 1).as_str(), Some(expected.as_str()));
    }
    let labels = rec.labels();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels[1].2, "third");
}

#[test]
fn test_xml_data_section_must_match_shape() {
    let vars = [DtaVar::new("x", 65526, "%9.0g")];
    let data: Vec<u8> = [1.0f64, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
    let bytes = dta_xml(117, &vars, 3, &data, &[], &[]);

    let mut parser = Parser::new(Recorder::new());
    let err = parser.parse_dta_reader(Cursor::new(bytes)).unwrap_err();
    assert!(matches!(
        err,
        readstat::ReadStatError::RowCountMismatch {
            expected: 3,
            actual: 2
        }
    ));
}

#[test]
fn test_missing_strl_reference() {
    let vars = [DtaVar::new("s", 32768, "%9s")];
    let bytes = dta_xml(117, &vars, 1, &strl_cell(117, 1, 9), &[], &[]);
    let mut parser = Parser::new(Recorder::new());
    let err = parser.parse_dta_reader(Cursor::new(bytes)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
    assert_eq!(parser.handler().errors().len(), 1);
}
