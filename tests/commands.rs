mod common;

use gds::cmd::max_cmd_size;
use gds::packet::Packet;
use gds::{Error, Value};

use common::load_fixture;

#[test]
fn encode_and_decode() {
    let (_, dicts) = load_fixture();
    let cmd = dicts
        .commands
        .create_from_str("SET_LIMIT 3 2.5 EU")
        .unwrap();
    let encoded = cmd.encode(max_cmd_size()).unwrap();
    assert_eq!(encoded.len(), 106);
    assert_eq!(
        &encoded[..10],
        &[0x00, 0x02, 0x07, 0x03, 0x40, 0x20, 0x00, 0x00, 0x01, 0xff]
    );
    assert!(encoded[10..].iter().all(|b| *b == 0));

    let decoded = dicts.commands.decode(&encoded).unwrap();
    assert_eq!(decoded.name(), "SET_LIMIT");
    assert_eq!(decoded.get("channel").unwrap(), Some(&Value::Int(3)));
    assert_eq!(decoded.get("limit").unwrap(), Some(&Value::Float(2.5)));
    assert_eq!(decoded.get("units").unwrap(), Some(&Value::from("EU")));
    assert_eq!(decoded.get("spare").unwrap(), Some(&Value::Int(255)));
}

#[test]
fn validation_messages() {
    let (_, dicts) = load_fixture();
    let cmd = dicts
        .commands
        .create("SET_LIMIT", vec![Value::Int(9), Value::Float(1.0), Value::from("OTHER")])
        .unwrap();
    let mut messages = Vec::new();
    assert!(!cmd.validate(&mut messages));
    assert!(messages.iter().any(|m| m.contains("out of range")), "{messages:?}");
    assert!(
        messages.iter().any(|m| m.contains("not in allowed enumerated values")),
        "{messages:?}"
    );
}

#[test]
fn unknown_opcode() {
    let (_, dicts) = load_fixture();
    assert!(matches!(
        dicts.commands.decode(&[0x12, 0x34, 0x00]),
        Err(Error::UnknownSymbol(_))
    ));
}

#[test]
fn dictionary_types_resolve() {
    let (_, dicts) = load_fixture();
    let mut data = vec![0x00, 0x01, 0x00, 0x02];
    data.extend(b"!Foo\0\0\0\0");
    let pkt = dicts.packets.create("EVENTS", &data).unwrap();

    let Some(Value::Evr(evr)) = pkt.get("evr").unwrap() else {
        panic!("evr did not resolve");
    };
    assert_eq!(evr.name(), "EVR_BOOT");
    let Some(Value::Command(cmd)) = pkt.get("cmd").unwrap() else {
        panic!("cmd did not resolve");
    };
    assert_eq!(cmd.name(), "SET_LIMIT");
    assert_eq!(pkt.raw().get("cmd").unwrap(), Some(Value::Int(2)));

    let mut pkt = Packet::new(pkt.definition().clone());
    pkt.set("evr", &Value::from("EVR_TEMP")).unwrap();
    assert_eq!(&pkt.data()[..2], &[0x00, 0x02]);
    assert!(pkt.set("evr", &Value::from("EVR_NOPE")).is_err());
}

#[test]
fn evr_messages() {
    let (_, dicts) = load_fixture();
    let boot = dicts.evrs.get("EVR_BOOT").unwrap();
    let data = hex::decode("21466f6f00ff113344").unwrap();
    assert_eq!(boot.format_message(&data).unwrap(), "! Foo 4279317316");

    let temp = dicts.evrs.get_code(2).unwrap();
    assert_eq!(
        temp.format_message(&21.5f32.to_be_bytes()).unwrap(),
        "temp 21.5"
    );
    assert!(matches!(
        temp.format_message(&[0x41]),
        Err(Error::NotEnoughData { .. })
    ));
}
