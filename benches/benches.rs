use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use gds::field::{ByteSpec, Enumeration, FieldDefinition};
use gds::packet::{Packet, PacketDefinition};
use gds::types::TypeRegistry;
use gds::Value;
use rand::Rng;

fn housekeeping() -> Arc<PacketDefinition> {
    let types = TypeRegistry::default();
    let field = |name: &str, dtype: &str| {
        FieldDefinition::builder()
            .name(name)
            .dtype(types.get(dtype).unwrap())
    };
    let fields = vec![
        field("version", "MSB_U16").bytes(ByteSpec::Range(0, 1)).mask(0xe000).build(),
        field("apid", "MSB_U16").bytes(ByteSpec::Prev).mask(0x07ff).build(),
        field("length", "MSB_U16").build(),
        field("mode", "U8")
            .enumeration(Enumeration::new([(0, "SAFE"), (1, "SCIENCE")]).unwrap())
            .build(),
        field("temps", "MSB_I16[16]").build(),
        field("volts", "MSB_F32").build(),
    ];
    Arc::new(PacketDefinition::new("HK", fields).unwrap())
}

fn bench_packet_decode(c: &mut Criterion) {
    let defn = housekeeping();
    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; defn.nbytes()];
    rng.fill(&mut buf[..]);

    let mut group = c.benchmark_group("packet");
    group.throughput(Throughput::Bytes(buf.len() as u64));
    group.bench_function("decode", |b| {
        b.iter(|| {
            let pkt = Packet::from_bytes(defn.clone(), &buf).unwrap();
            for fd in defn.fields() {
                let _ = pkt.get(fd.name()).unwrap();
            }
        });
    });
    group.finish();
}

fn bench_packet_set(c: &mut Criterion) {
    let defn = housekeeping();
    let apid = defn.key("apid").unwrap();
    let mode = Value::from("SCIENCE");

    let mut group = c.benchmark_group("packet");
    group.bench_function("set", |b| {
        let mut pkt = Packet::new(defn.clone());
        b.iter(|| {
            pkt.set_by_key(apid, &Value::Int(42)).unwrap();
            pkt.set("mode", &mode).unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_packet_decode, bench_packet_set);
criterion_main!(benches);
