use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use opwire::core::codec::PackCodec;
use opwire::core::packet::{OpCode, Pack};
use tokio_util::codec::{Decoder, Encoder};

#[allow(clippy::unwrap_used)]
fn bench_pack_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack_encode_decode");
    let payload_sizes = [0usize, 64, 512, 4096, 65_000];

    for &size in &payload_sizes {
        group.throughput(Throughput::Bytes((size + 12) as u64));

        group.bench_function(format!("encode_{size}b"), |b| {
            let codec = PackCodec::datagram();
            b.iter_batched(
                || Pack::new(OpCode(1000), 1, vec![0u8; size]),
                |mut pack| codec.encode(&mut pack).unwrap(),
                BatchSize::SmallInput,
            )
        });

        group.bench_function(format!("decode_datagram_{size}b"), |b| {
            let codec = PackCodec::datagram();
            let bytes = codec.encode(&mut Pack::new(OpCode(1000), 1, vec![0u8; size])).unwrap();
            b.iter(|| {
                let decoded = codec.decode_datagram(&bytes);
                assert!(decoded.is_ok());
            })
        });

        group.bench_function(format!("decode_stream_{size}b"), |b| {
            let mut codec = PackCodec::stream();
            let mut wire = BytesMut::new();
            Encoder::encode(&mut codec, Pack::new(OpCode(1000), 1, vec![0u8; size]), &mut wire).unwrap();
            b.iter_batched(
                || wire.clone(),
                |mut buf| codec.decode(&mut buf).unwrap(),
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pack_encode_decode);
criterion_main!(benches);
