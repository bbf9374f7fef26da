mod common;

use std::collections::HashMap;
use std::sync::Arc;

use gds::field::{ByteSpec, FieldDefinition};
use gds::packet::{decode_all, Packet, PacketDefinition};
use gds::types::TypeRegistry;
use gds::Value;
use rand::Rng;

use common::load_fixture;

const CCSDS_FIELDS: [(&str, i128); 7] = [
    ("version", 0),
    ("type", 1),
    ("shflag", 1),
    ("apid", 42),
    ("seqflags", 3),
    ("seqcount", 1234),
    ("length", 5678),
];

#[test]
fn ccsds_scenario_encode() {
    let (_, dicts) = load_fixture();
    let defn = dicts.packets.get("CCSDS_TEST").unwrap();
    assert_eq!(defn.nbytes(), 6);

    let mut pkt = Packet::new(defn.clone());
    for (name, value) in CCSDS_FIELDS {
        pkt.set(name, &Value::Int(value)).unwrap();
    }
    assert_eq!(pkt.data(), hex::decode("182ac4d2162e").unwrap());
}

#[test]
fn ccsds_scenario_decode() {
    let (_, dicts) = load_fixture();
    let pkt = dicts
        .packets
        .create("CCSDS_TEST", &hex::decode("182ac4d2162e").unwrap())
        .unwrap();
    for (name, value) in CCSDS_FIELDS {
        assert_eq!(
            pkt.get(name).unwrap(),
            Some(Value::Int(value)),
            "field {name}"
        );
    }
}

#[test]
fn disjoint_mask_writes_commute() {
    let (_, dicts) = load_fixture();
    let defn = dicts.packets.get("CCSDS_TEST").unwrap();
    let mut rng = rand::thread_rng();

    for _ in 0..100 {
        let apid: i128 = rng.gen_range(0..2048);
        let shflag: i128 = rng.gen_range(0..2);
        let mut bytes = [0u8; 6];
        rng.fill(&mut bytes[..]);

        let mut a = Packet::from_bytes(defn.clone(), &bytes).unwrap();
        a.set("apid", &Value::Int(apid)).unwrap();
        a.set("shflag", &Value::Int(shflag)).unwrap();
        assert_eq!(a.get("apid").unwrap(), Some(Value::Int(apid)));

        let mut b = Packet::from_bytes(defn.clone(), &bytes).unwrap();
        b.set("shflag", &Value::Int(shflag)).unwrap();
        b.set("apid", &Value::Int(apid)).unwrap();

        assert_eq!(a.data(), b.data());
        // bits outside both masks are untouched
        assert_eq!(a.data()[0] & 0xf0, bytes[0] & 0xf0);
        assert_eq!(&a.data()[2..], &bytes[2..]);
    }
}

#[test]
fn guarded_fields_are_none() {
    let (_, dicts) = load_fixture();

    let temp = dicts.packets.create("GUARDED", &[1, 0xff, 0xf6]).unwrap();
    assert_eq!(temp.get("temp").unwrap(), Some(Value::Int(-10)));
    assert_eq!(temp.get("pressure").unwrap(), None);

    let pressure = dicts.packets.create("GUARDED", &[2, 0x00, 0xc8]).unwrap();
    assert_eq!(pressure.get("temp").unwrap(), None);
    assert_eq!(pressure.get("pressure").unwrap(), Some(Value::Float(100.0)));
    assert_eq!(pressure.raw().get("pressure").unwrap(), Some(Value::Int(200)));

    let neither = dicts.packets.create("GUARDED", &[0, 0xff, 0xff]).unwrap();
    assert_eq!(neither.get("temp").unwrap(), None);
    assert_eq!(neither.get("pressure").unwrap(), None);
}

#[test]
fn validation_reports_every_missing_field() {
    let (_, dicts) = load_fixture();
    let defn = dicts.packets.get("CCSDS_TEST").unwrap();

    let values: HashMap<String, Value> = [("version", 0), ("type", 0), ("apid", 42), ("length", 0)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), Value::Int(v)))
        .collect();
    let mut messages = Vec::new();
    assert!(!defn.validate(&values, &mut messages));

    assert!(messages.len() >= 3, "{messages:?}");
    for name in ["shflag", "seqflags", "seqcount"] {
        assert!(
            messages.iter().any(|m| m.contains(name)),
            "no message for {name}: {messages:?}"
        );
    }
}

#[test]
fn history_carries_last_value() {
    let (_, dicts) = load_fixture();

    let first = dicts.packets.create("MODES", &[0, 0]).unwrap();
    assert_eq!(first.get("mode").unwrap(), None);
    assert_eq!(first.get("last_mode").unwrap(), Some(Value::Int(0)));

    dicts.packets.create("MODES", &[1, 1]).unwrap();

    // the guard hides this packet's own mode, history still has the last one
    let later = dicts.packets.create("MODES", &[0, 0]).unwrap();
    assert_eq!(later.get("mode").unwrap(), None);
    assert_eq!(later.get("last_mode").unwrap(), Some(Value::from("SCIENCE")));
    assert_eq!(later.history().get("mode"), Some(Value::from("SCIENCE")));
}

#[test]
fn parallel_decode_keeps_order() {
    let (_, dicts) = load_fixture();
    let defn = dicts.packets.get("CCSDS_TEST").unwrap();

    let chunks: Vec<Vec<u8>> = (0u16..64)
        .map(|i| {
            let mut bytes = vec![0x08, 0x00, 0xc0, 0x00, 0x00, 0x00];
            bytes[4..].copy_from_slice(&i.to_be_bytes());
            bytes
        })
        .collect();
    let packets = decode_all(defn, chunks.iter().map(Vec::as_slice).collect::<Vec<_>>());
    assert_eq!(packets.len(), 64);
    for (i, pkt) in packets.into_iter().enumerate() {
        let pkt = pkt.unwrap();
        assert_eq!(pkt.get("length").unwrap(), Some(Value::from(i)));
        assert_eq!(pkt.get("shflag").unwrap(), Some(Value::Int(1)));
    }
}

#[test]
fn packet_json() {
    let (_, dicts) = load_fixture();
    let pkt = dicts
        .packets
        .create("CCSDS_TEST", &hex::decode("182ac4d2162e").unwrap())
        .unwrap();
    let json = pkt.to_json().unwrap();
    assert_eq!(json["apid"], 42);
    assert_eq!(json["seqcount"], 1234);
}

#[test]
fn array_fields() {
    let types = TypeRegistry::default();
    let defn = PacketDefinition::new(
        "ARRAYS",
        vec![FieldDefinition::builder()
            .name("samples")
            .dtype(types.get("MSB_U16[3]").unwrap())
            .bytes(ByteSpec::Range(0, 5))
            .build()],
    )
    .unwrap();
    let mut pkt = Packet::new(Arc::new(defn));
    pkt.set("samples", &Value::List([1, 2, 3].map(Value::Int).to_vec()))
        .unwrap();
    assert_eq!(pkt.data(), &[0, 1, 0, 2, 0, 3]);
    assert_eq!(pkt.get_index("samples", 2).unwrap(), Some(Value::Int(3)));

    let list = pkt.get_list("samples").unwrap();
    assert_eq!(list.len(), 3);
    let all: Vec<_> = list.iter().map(|v| v.unwrap().unwrap()).collect();
    assert_eq!(all, [1, 2, 3].map(Value::Int).to_vec());

    assert!(pkt
        .set("samples", &Value::List(vec![Value::Int(1)]))
        .is_err());
}
