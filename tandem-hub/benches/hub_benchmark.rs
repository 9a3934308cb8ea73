use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use tandem_hub::presence::{encode_entries, PresenceTable};
use tandem_hub::protocol::{write_presence, write_update};
use tandem_hub::storage::{DocumentStorage, RocksStore, StoreConfig};
use tandem_hub::{ConnectionHandle, ConnectionId, Message, Session, SharedDoc};
use yrs::{Text, Transact, WriteTxn};

fn text_update(len: usize) -> Vec<u8> {
    let doc = SharedDoc::new(true);
    {
        let mut txn = doc.inner().transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, 0, &"x".repeat(len));
    }
    doc.encode_state()
}

fn bench_message_decode(c: &mut Criterion) {
    let frame = write_update(&text_update(64));

    c.bench_function("message_decode_update", |b| {
        b.iter(|| {
            black_box(Message::decode(black_box(&frame)).unwrap());
        })
    });
}

fn bench_presence_apply_100_clients(c: &mut Criterion) {
    let states: Vec<String> = (0..100).map(|i| format!(r#"{{"cursor":{i}}}"#)).collect();
    let entries: Vec<(u64, u64, &str)> = states
        .iter()
        .enumerate()
        .map(|(i, s)| (i as u64, 1, s.as_str()))
        .collect();
    let update = encode_entries(&entries);

    c.bench_function("presence_apply_100_clients", |b| {
        b.iter(|| {
            let mut table = PresenceTable::new();
            black_box(table.apply_update(black_box(&update)).unwrap());
        })
    });
}

fn bench_presence_encode_all_1000(c: &mut Criterion) {
    let states: Vec<String> = (0..1000).map(|i| format!(r#"{{"cursor":{i}}}"#)).collect();
    let entries: Vec<(u64, u64, &str)> = states
        .iter()
        .enumerate()
        .map(|(i, s)| (i as u64, 1, s.as_str()))
        .collect();
    let mut table = PresenceTable::new();
    table.apply_update(&encode_entries(&entries)).unwrap();

    c.bench_function("presence_encode_all_1000", |b| {
        b.iter(|| {
            black_box(table.encode_all());
        })
    });
}

fn bench_doc_apply_update(c: &mut Criterion) {
    let update = text_update(1024);

    c.bench_function("doc_apply_update_1kb", |b| {
        b.iter(|| {
            let doc = SharedDoc::new(true);
            doc.apply_update(black_box(&update)).unwrap();
        })
    });
}

fn bench_session_fanout_100_connections(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let session = Session::new("bench", SharedDoc::new(true), None, None);

    let mut receivers = Vec::new();
    rt.block_on(async {
        for i in 0..100 {
            let (handle, rx) = ConnectionHandle::new(ConnectionId::new(i));
            session.register(handle).await;
            receivers.push(rx);
        }
    });
    let mut clock = 0u64;
    c.bench_function("session_presence_fanout_100", |b| {
        b.iter(|| {
            clock += 1;
            let frame = write_presence(&encode_entries(&[(1, clock, "{}")]));
            rt.block_on(async {
                black_box(session.dispatch(ConnectionId::new(0), &frame).await.unwrap());
            });
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_rocks_append_update(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let update = text_update(256);

    c.bench_function("rocks_append_update_256B", |b| {
        b.iter(|| {
            black_box(store.append_update("bench", black_box(&update)).unwrap());
        })
    });
}

fn bench_rocks_store_full_state(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let state = text_update(64 * 1024);

    c.bench_function("rocks_store_full_state_64kb", |b| {
        b.iter(|| {
            store.store_full_state("bench", black_box(&state)).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_message_decode,
    bench_presence_apply_100_clients,
    bench_presence_encode_all_1000,
    bench_doc_apply_update,
    bench_session_fanout_100_connections,
    bench_rocks_append_update,
    bench_rocks_store_full_state,
);
criterion_main!(benches);
