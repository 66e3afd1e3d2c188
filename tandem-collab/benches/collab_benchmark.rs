use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tandem_collab::awareness::{AwarenessTable, UserPresence};
use tandem_collab::broadcast::BroadcastGroup;
use tandem_collab::persistence::PersistenceCoordinator;
use tandem_collab::protocol::SyncMessage;
use tandem_collab::room::{RoomConfig, RoomManager};
use tandem_collab::server::ServerCounters;
use tandem_collab::storage::{FileRecord, MemoryStore, SnapshotRecord};
use tandem_core::{ClientId, Document, Operation, StateVector};
use uuid::Uuid;

fn typed_ops(n: usize) -> Vec<Operation> {
    let mut doc = Document::new(ClientId(1));
    (0..n).map(|i| doc.insert(i, "x").unwrap()).collect()
}

fn bench_update_encode(c: &mut Criterion) {
    let msg = SyncMessage::Update {
        operations: typed_ops(1),
    };

    c.bench_function("update_encode_1op", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = SyncMessage::Update {
        operations: typed_ops(1),
    }
    .encode()
    .unwrap();

    c.bench_function("update_decode_1op", |b| {
        b.iter(|| black_box(SyncMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_state_response_encode(c: &mut Criterion) {
    let text: String = (0..10_000).map(|i| (b'a' + (i % 26) as u8) as char).collect();
    let doc = Document::from_text(ClientId(1), &text);

    c.bench_function("state_response_encode_10k_doc", |b| {
        b.iter(|| {
            let msg = SyncMessage::StateResponse {
                operations: doc.diff_since(&StateVector::new()),
                state_vector: doc.state_vector().clone(),
            };
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_presence_apply(c: &mut Criterion) {
    let mut source = AwarenessTable::new();
    let update = source
        .set_local(ClientId(7), UserPresence::new(ClientId(7), "Ana").with_cursor(10, 20))
        .unwrap();

    c.bench_function("presence_apply_remote", |b| {
        b.iter_batched(
            AwarenessTable::new,
            |mut table| black_box(table.apply_remote(&update, None)),
            BatchSize::SmallInput,
        )
    });
}

fn bench_broadcast_1000_frames_100_peers(c: &mut Criterion) {
    let frame = Arc::new(SyncMessage::Update { operations: typed_ops(1) }.encode().unwrap());

    c.bench_function("broadcast_1000_frames_100_peers", |b| {
        b.iter_batched(
            || {
                let group = BroadcastGroup::new(1024);
                let receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
                (group, receivers)
            },
            |(group, mut receivers)| {
                for _ in 0..1000 {
                    group.broadcast_raw(None, Arc::clone(&frame));
                }
                for rx in &mut receivers {
                    while let Ok(frame) = rx.try_recv() {
                        black_box(frame);
                    }
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_snapshot_seal_open(c: &mut Criterion) {
    let text: String = (0..10_000).map(|i| (b'a' + (i % 26) as u8) as char).collect();
    let doc = Document::from_text(ClientId(1), &text);
    let sealed = SnapshotRecord::capture("1", &doc).unwrap().seal().unwrap();

    c.bench_function("snapshot_seal_10k_doc", |b| {
        b.iter(|| black_box(SnapshotRecord::capture("1", &doc).unwrap().seal().unwrap()))
    });
    c.bench_function("snapshot_open_restore_10k_doc", |b| {
        b.iter(|| {
            let record = SnapshotRecord::open(black_box(&sealed)).unwrap();
            black_box(record.restore(ClientId(2)).unwrap());
        })
    });
}

fn bench_room_apply(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let ops = typed_ops(100);

    c.bench_function("room_apply_100_ops_10_sessions", |b| {
        b.iter_batched(
            || {
                runtime.block_on(async {
                    let store = Arc::new(MemoryStore::new());
                    store.insert_file("1", FileRecord::new("")).await;
                    let counters = Arc::new(ServerCounters::default());
                    let persistence =
                        PersistenceCoordinator::new(store.clone(), Duration::from_secs(3600), false, counters.clone());
                    let manager = RoomManager::new(store, persistence, RoomConfig::default(), counters);
                    let mut receivers = Vec::new();
                    let mut room = None;
                    for _ in 0..10 {
                        let (r, rx) = manager.join("file-1", Uuid::new_v4()).await.unwrap();
                        receivers.push(rx);
                        room = Some(r);
                    }
                    (manager, room.unwrap(), receivers)
                })
            },
            |(_manager, room, _receivers)| {
                runtime.block_on(async {
                    black_box(room.apply_operations(Uuid::new_v4(), ops.clone()).await);
                })
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_state_response_encode,
    bench_presence_apply,
    bench_broadcast_1000_frames_100_peers,
    bench_snapshot_seal_open,
    bench_room_apply,
);

criterion_main!(benches);
