use criterion::{criterion_group, criterion_main, Criterion};
use quire_node::broadcast::BroadcastGroup;
use quire_node::protocol::Frame;
use quire_node::storage::{decode_snapshot, encode_snapshot};
use quire_node::store::{Snapshot, StateStore};
use std::hint::black_box;
use std::sync::Arc;

fn sample_document(len: usize) -> String {
    "lorem ipsum dolor sit amet ".chars().cycle().take(len).collect()
}

fn bench_update_encode(c: &mut Criterion) {
    let doc = sample_document(4096);

    c.bench_function("update_encode_4KiB", |b| {
        b.iter(|| {
            let frame = Frame::update(black_box(doc.as_str()));
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = Frame::update(sample_document(4096)).encode().unwrap();

    c.bench_function("update_decode_4KiB", |b| {
        b.iter(|| {
            black_box(Frame::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_cursor_clamp(c: &mut Criterion) {
    let mut store = StateStore::new();
    store.set_document(sample_document(4096));
    let mut position = 0i64;

    c.bench_function("cursor_set_clamped", |b| {
        b.iter(|| {
            position = (position + 37) % 5000;
            black_box(store.set_cursor("bench", black_box(position), 0.0));
        })
    });
}

fn bench_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    for peers in [10usize, 100] {
        let group = BroadcastGroup::new(1024);
        let mut receivers = Vec::with_capacity(peers);
        rt.block_on(async {
            for i in 0..peers {
                receivers.push(group.add_peer(format!("peer-{i}")).await);
            }
        });
        let encoded: Arc<str> = Arc::from(Frame::update(sample_document(256)).encode().unwrap());

        c.bench_function(&format!("fan_out_{peers}_peers"), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let sent = group
                        .broadcast_raw_except(Some("peer-0"), encoded.clone())
                        .await;
                    black_box(sent);
                });
                for rx in receivers.iter_mut() {
                    while rx.try_recv().is_ok() {}
                }
            })
        });
    }
}

fn bench_snapshot_codec(c: &mut Criterion) {
    let mut store = StateStore::new();
    store.set_document(sample_document(64 * 1024));
    for i in 0..50 {
        store.set_cursor(&format!("client-{i}"), i * 100, 1_700_000_000.0);
    }
    let snapshot: Snapshot = store.snapshot();
    let bytes = encode_snapshot(&snapshot).unwrap();

    c.bench_function("snapshot_encode_64KiB", |b| {
        b.iter(|| black_box(encode_snapshot(black_box(&snapshot)).unwrap()))
    });
    c.bench_function("snapshot_decode_64KiB", |b| {
        b.iter(|| black_box(decode_snapshot(black_box(&bytes)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_cursor_clamp,
    bench_fan_out,
    bench_snapshot_codec,
);
criterion_main!(benches);
