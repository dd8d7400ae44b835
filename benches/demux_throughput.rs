use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rtpscribe::media::{AudioStreamRegistry, DatagramRouter};
use rtpscribe::stats::IngestStats;
use std::hint::black_box;
use std::sync::Arc;

/// 20 ms of 8 kHz and 16 kHz 16-bit mono audio behind an RTP header.
const PAYLOAD_SIZES: [usize; 2] = [320, 640];

const CALLS: u16 = 64;

fn datagram(payload_len: usize) -> Vec<u8> {
    let mut data = vec![0x80, 0x0b, 0, 1, 0, 0, 0, 160, 0, 0, 0, 42];
    data.extend((0..payload_len).map(|i| i as u8));
    data
}

/// Registry with `CALLS` streams, one consumer each.
fn registry_with_calls(buffer_bytes: usize) -> (AudioStreamRegistry, Vec<rtpscribe::media::AudioConsumer>) {
    let registry = AudioStreamRegistry::new(buffer_bytes);
    let consumers = (0..CALLS)
        .map(|i| {
            let stream = registry
                .create(10_000 + i)
                .expect("fresh registry has no ports");
            stream.subscribe()
        })
        .collect();
    (registry, consumers)
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    for size in PAYLOAD_SIZES {
        let packet = datagram(size);
        group.throughput(Throughput::Bytes(packet.len() as u64));

        for swap16 in [false, true] {
            let (registry, _consumers) = registry_with_calls(64 * 1024);
            let router = DatagramRouter::new(registry, swap16, Arc::new(IngestStats::default()));
            let label = if swap16 { "routed_swap16" } else { "routed" };
            let mut port = 0u16;

            group.bench_with_input(BenchmarkId::new(label, size), &packet, |b, packet| {
                b.iter(|| {
                    port = (port + 1) % CALLS;
                    black_box(router.dispatch(black_box(packet), 10_000 + port))
                });
            });
        }

        let (registry, _consumers) = registry_with_calls(64 * 1024);
        let router = DatagramRouter::new(registry, true, Arc::new(IngestStats::default()));
        group.bench_with_input(BenchmarkId::new("unrouted", size), &packet, |b, packet| {
            b.iter(|| black_box(router.dispatch(black_box(packet), 9_999)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
