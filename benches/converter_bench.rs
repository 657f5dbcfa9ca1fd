use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use peer_protocol::core::converter::{FormatConverter, PacketConverter, SecureConverter};
use peer_protocol::protocol::packet::PacketDescriptor;
use peer_protocol::{RawData, SerializationFormat};

#[allow(clippy::unwrap_used)]
fn bench_converters(c: &mut Criterion) {
    let mut group = c.benchmark_group("converter");
    let descriptor = PacketDescriptor::of::<RawData>();
    let sizes = [64usize, 4096, 65536];

    let formats = [
        SerializationFormat::Bincode,
        SerializationFormat::Json,
        SerializationFormat::MessagePack,
    ];

    for &size in &sizes {
        group.throughput(Throughput::Bytes(size as u64));
        let packet = RawData::new("bench", vec![0xAB; size]);

        for format in formats {
            let converter = FormatConverter::new(format);
            group.bench_function(format!("serialize_{}_{size}b", format.name()), |b| {
                b.iter(|| converter.serialize(&packet).unwrap())
            });

            let payload = converter.serialize(&packet).unwrap();
            group.bench_function(format!("deserialize_{}_{size}b", format.name()), |b| {
                b.iter(|| converter.deserialize(&descriptor, &payload).unwrap())
            });
        }

        let secure = SecureConverter::new(Arc::new(FormatConverter::default()));
        secure.install_key([9u8; 32]).unwrap();
        secure.enable_outbound();

        group.bench_function(format!("seal_{size}b"), |b| {
            b.iter(|| secure.serialize(&packet).unwrap())
        });

        let sealed = secure.serialize(&packet).unwrap();
        group.bench_function(format!("open_{size}b"), |b| {
            b.iter_batched(
                || sealed.clone(),
                |payload| secure.deserialize(&descriptor, &payload).unwrap(),
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_converters);
criterion_main!(benches);
