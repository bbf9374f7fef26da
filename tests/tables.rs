mod common;

use std::fs::{self, File};
use std::io::BufReader;

use gds::{Error, Value};

use common::load_fixture;

#[test]
fn table_scenario() {
    let (_, dicts) = load_fixture();
    let table = dicts.tables.get("test_type").unwrap();

    let encoded = table.encode(["13,12,11", "1,2,TEST_ENUM_3"], None).unwrap();
    assert_eq!(encoded, [13, 12, 11, 0, 1, 0, 2, 3]);

    let rows = table.decode(&encoded, false).unwrap();
    assert_eq!(rows[1][2], Value::from("TEST_ENUM_3"));

    let raw = table.decode(&encoded, true).unwrap();
    assert_eq!(raw[1][2], Value::Int(3));
}

#[test]
fn file_round_trip() {
    let (_, dicts) = load_fixture();
    let table = dicts.tables.get("test_type").unwrap();
    let dir = tempfile::tempdir().unwrap();
    let text_path = dir.path().join("table.txt");
    let bin_path = dir.path().join("table.bin");

    fs::write(&text_path, "\n  1,2,TEST_ENUM_1\n  4,5,6\n\n").unwrap();
    let hdr = [13, 12, 11].map(Value::Int);
    let written = table
        .encode_file(
            BufReader::new(File::open(&text_path).unwrap()),
            File::create(&bin_path).unwrap(),
            Some(&hdr),
        )
        .unwrap();
    assert_eq!(written, 13);
    assert_eq!(
        fs::read(&bin_path).unwrap(),
        [13, 12, 11, 0, 1, 0, 2, 1, 0, 4, 0, 5, 6]
    );

    let mut out = Vec::new();
    let rows = table
        .decode_file(File::open(&bin_path).unwrap(), &mut out, false)
        .unwrap();
    assert_eq!(rows, 3);
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "13,12,11\n1,2,TEST_ENUM_1\n4,5,6\n"
    );
}

#[test]
fn rows_before_a_truncated_row_are_kept() {
    let (_, dicts) = load_fixture();
    let table = dicts.tables.get("test_type").unwrap();
    let encoded = table.encode(["13,12,11", "1,2,3", "4,5,6"], None).unwrap();

    let mut out = Vec::new();
    let err = table
        .decode_file(&encoded[..encoded.len() - 1], &mut out, true)
        .unwrap_err();
    assert!(matches!(err, Error::MalformedTable(_)));
    assert_eq!(String::from_utf8(out).unwrap(), "13,12,11\n1,2,3\n");
}
