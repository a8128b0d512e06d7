//! Throughput benchmarks for Podium.
//!
//! These benchmarks measure the raw operation rate of the ranked store, the
//! event log, and hub fan-out.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use podium_core::skiplist::SkipList;
use podium_core::{
    Broadcaster, Client, EventLog, Hub, HubConfig, MemoryEventLog, MemoryRankedStore,
    RankedSetStore,
};
use podium_protocol::MessageType;
use serde_json::json;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn member(i: u64) -> String {
    format!("player-{i}")
}

/// Spread scores so ties are rare but present.
fn score(i: u64) -> f64 {
    ((i * 7919) % 100_003) as f64
}

/// Benchmark the order-statistics skip list directly.
fn bench_skiplist(c: &mut Criterion) {
    let mut group = c.benchmark_group("skiplist");

    for size in [1_000u64, 100_000].iter() {
        let mut list = SkipList::new();
        for i in 0..*size {
            list.insert(&member(i), score(i));
        }

        group.bench_with_input(BenchmarkId::new("rank", size), size, |b, &size| {
            let mut i = 0u64;
            b.iter(|| {
                let n = i % size;
                i += 1;
                list.rank(black_box(&member(n)), black_box(score(n)))
            });
        });

        group.bench_with_input(BenchmarkId::new("range_100", size), size, |b, &size| {
            let mut i = 0u64;
            b.iter(|| {
                let start = (i % size) as usize + 1;
                i += 1;
                list.range(black_box(start), black_box(start + 99)).count()
            });
        });
    }

    group.bench_function("insert_remove", |b| {
        let mut list = SkipList::new();
        for i in 0..100_000u64 {
            list.insert(&member(i), score(i));
        }
        let mut i = 0u64;
        b.iter(|| {
            let n = i % 100_000;
            i += 1;
            let key = member(n);
            list.remove(&key, score(n));
            list.insert(&key, score(n) + 1.0);
            list.remove(&key, score(n) + 1.0);
            list.insert(&key, score(n));
        });
    });

    group.finish();
}

/// Benchmark the in-memory ranked store.
fn bench_ranked_store(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("ranked_store");

    let store = MemoryRankedStore::new();
    rt.block_on(async {
        for i in 0..100_000u64 {
            store.add_score("board", &member(i), score(i)).await.unwrap();
        }
    });

    group.bench_function("add_score", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let n = i % 100_000;
            i += 1;
            rt.block_on(store.add_score("board", &member(n), score(n + i)))
        });
    });

    group.bench_function("get_rank", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let n = i % 100_000;
            i += 1;
            rt.block_on(store.get_rank("board", black_box(&member(n))))
        });
    });

    group.bench_function("get_top_100", |b| {
        b.iter(|| rt.block_on(store.get_top_n("board", black_box(100))));
    });

    group.bench_function("get_around_10", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let n = i % 100_000;
            i += 1;
            rt.block_on(store.get_around_member("board", &member(n), black_box(10)))
        });
    });

    group.finish();
}

/// Benchmark event log appends and group reads.
fn bench_event_log(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("event_log");
    let payload = podium_protocol::encode_record(&podium_protocol::ScoreEvent::new(
        "board", "player-1", 42.0,
    ))
    .unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("append", |b| {
        let log = MemoryEventLog::new();
        b.iter(|| {
            let log = &log;
            rt.block_on(async {
                log.append("updates", payload.clone()).await.unwrap();
                log.trim("updates", 10_000).await.unwrap();
            })
        });
    });

    group.throughput(Throughput::Elements(16));
    group.bench_function("append_read_ack_16", |b| {
        let log = MemoryEventLog::new();
        rt.block_on(log.ensure_group("updates", "g")).unwrap();
        b.iter(|| {
            let log = &log;
            rt.block_on(async {
                for _ in 0..16 {
                    log.append("updates", payload.clone()).await.unwrap();
                }
                let entries = log
                    .read_group("updates", "g", "c", 16, None)
                    .await
                    .unwrap();
                let ids: Vec<_> = entries.iter().map(|e| e.id).collect();
                log.ack("updates", "g", &ids).await.unwrap();
                log.trim("updates", 10_000).await.unwrap();
            })
        });
    });

    group.finish();
}

/// Benchmark hub fan-out to N topic subscribers.
fn bench_fanout(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("fanout");

    for size in [10usize, 100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (hub, mut receivers) = rt.block_on(async {
                let (hub, _task) = Hub::spawn(HubConfig::default());
                let mut receivers = Vec::with_capacity(size);
                for _ in 0..size {
                    let (client, rx) = Client::new(None, 4);
                    hub.register(client, Some("leaderboard:bench".into()))
                        .await
                        .unwrap();
                    receivers.push(rx);
                }
                (hub, receivers)
            });

            b.iter(|| {
                rt.block_on(async {
                    hub.broadcast(
                        "leaderboard:bench",
                        MessageType::EntryUpdate,
                        json!({"entryId": "p1", "score": 1.0}),
                    )
                    .await;
                    for rx in &mut receivers {
                        black_box(rx.recv().await);
                    }
                })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_skiplist,
    bench_ranked_store,
    bench_event_log,
    bench_fanout,
);
criterion_main!(benches);
