// Relink benchmarks using criterion.
//
// Measures:
//   - Chunk encode / decode throughput
//   - Receive state machine on in-order and replayed traffic
//   - Retransmission buffer write / drain / prune cycle

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::num::{NonZeroU64, NonZeroUsize};
use std::time::Duration;

use bytes::Bytes;
use relink::buffer::{Buffer, Drain};
use relink::{Message, Outbox, RecvState};

// ---------------------------------------------------------------------------
// Chunk encode throughput
// ---------------------------------------------------------------------------

fn bench_chunk_encode(c: &mut Criterion) {
    let sizes: &[usize] = &[64, 1024, 8192, 65536];

    let mut group = c.benchmark_group("chunk_encode");
    for &size in sizes {
        let msg = Message::Chunk {
            seqno: 1_000_000,
            payload: Bytes::from(vec![0xABu8; size]),
        };
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}B")),
            &msg,
            |b, m| {
                b.iter(|| {
                    black_box(m.encode());
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Chunk decode throughput
// ---------------------------------------------------------------------------

fn bench_chunk_decode(c: &mut Criterion) {
    let sizes: &[usize] = &[64, 1024, 8192, 65536];

    let mut group = c.benchmark_group("chunk_decode");
    for &size in sizes {
        let encoded = Message::Chunk {
            seqno: 1_000_000,
            payload: Bytes::from(vec![0xABu8; size]),
        }
        .encode();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}B")),
            &encoded,
            |b, data| {
                b.iter(|| {
                    black_box(Message::decode(black_box(data.clone())).unwrap());
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Ack / Sync encode and decode
// ---------------------------------------------------------------------------

fn bench_control_messages(c: &mut Criterion) {
    let ack = Message::Ack { nackd: 123_456_789 };
    c.bench_function("ack_encode", |b| {
        b.iter(|| {
            black_box(ack.encode());
        });
    });

    let encoded = Message::Sync { nackd: 123_456_789 }.encode();
    c.bench_function("sync_decode", |b| {
        b.iter(|| {
            black_box(Message::decode(black_box(encoded.clone())).unwrap());
        });
    });
}

// ---------------------------------------------------------------------------
// Receive state machine
// ---------------------------------------------------------------------------

fn bench_recv_state(c: &mut Criterion) {
    let payload = Bytes::from_static(b"receive state benchmark payload");
    let ack_frequency = NonZeroU64::new(20).unwrap();

    c.bench_function("recv_in_order_1000", |b| {
        b.iter(|| {
            let mut state = RecvState::new(ack_frequency);
            for seqno in 0..1000 {
                black_box(state.on_chunk(seqno, payload.clone()));
            }
            black_box(state.nread());
        });
    });

    // Every chunk arrives twice, as after a rewind.
    c.bench_function("recv_with_replays_1000", |b| {
        b.iter(|| {
            let mut state = RecvState::new(ack_frequency);
            for seqno in 0..1000 {
                black_box(state.on_chunk(seqno, payload.clone()));
                black_box(state.on_chunk(seqno, payload.clone()));
            }
            black_box(state.nread());
        });
    });
}

// ---------------------------------------------------------------------------
// Retransmission buffer cycle
// ---------------------------------------------------------------------------

fn bench_buffer_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let payload = Bytes::from_static(b"buffer benchmark payload");
    let memory_cap = NonZeroUsize::new(40).unwrap();

    c.bench_function("buffer_write_drain_prune_40", |b| {
        b.iter(|| {
            rt.block_on(async {
                let buf = Buffer::new(memory_cap);
                for _ in 0..40 {
                    buf.write(payload.clone()).await.unwrap();
                }
                for _ in 0..40 {
                    match buf.next().await {
                        Drain::Chunk { seqno, payload } => black_box((seqno, payload)),
                        other => panic!("unexpected drain outcome: {other:?}"),
                    };
                }
                buf.remove(40);
                black_box(buf.pending());
            });
        });
    });
}

// ---------------------------------------------------------------------------
// Criterion harness
// ---------------------------------------------------------------------------

criterion_group! {
    name = relink_benches;
    config = Criterion::default()
        .sample_size(100)
        .measurement_time(Duration::from_secs(5));
    targets =
        bench_chunk_encode,
        bench_chunk_decode,
        bench_control_messages,
        bench_recv_state,
        bench_buffer_cycle
}

criterion_main!(relink_benches);
