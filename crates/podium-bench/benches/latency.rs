//! Latency benchmarks for Podium.
//!
//! These benchmarks focus on the score-submission path: ranked store write,
//! event append, and delivery to a live subscriber.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use podium_core::{
    Client, Hub, HubConfig, LeaderboardService, MemoryEventLog, MemoryLeaderboardRepository,
    MemoryRankedStore, NewLeaderboard, Outbox, ServiceConfig,
};
use podium_protocol::codec;
use std::sync::Arc;
use std::time::Instant;

fn service(rt: &tokio::runtime::Runtime) -> (LeaderboardService, Hub, String) {
    rt.block_on(async {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let service = LeaderboardService::new(
            Arc::new(MemoryRankedStore::new()),
            Arc::new(MemoryEventLog::new()),
            Arc::new(hub.clone()),
            Arc::new(MemoryLeaderboardRepository::new()),
            Arc::new(Outbox::new(1024)),
            ServiceConfig::default(),
        );
        let board = service
            .create_leaderboard(NewLeaderboard {
                name: "bench".into(),
                ..NewLeaderboard::default()
            })
            .await
            .unwrap();
        (service, hub, board.id)
    })
}

/// Benchmark score submission until the subscriber holds the update.
fn bench_score_to_subscriber(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("score_to_subscriber");

    group.bench_function("single_subscriber", |b| {
        let (service, hub, id) = service(&rt);
        let topic = podium_core::topic::leaderboard(&id);
        let mut rx = rt.block_on(async {
            let (client, rx) = Client::new(None, 16);
            hub.register(client, Some(topic)).await.unwrap();
            rx
        });

        b.iter_custom(|iters| {
            rt.block_on(async {
                let start = Instant::now();
                for i in 0..iters {
                    let entry = format!("player-{}", i % 1000);
                    service
                        .update_entry_score(&id, &entry, i as f64, None)
                        .await
                        .unwrap();
                    let frame = rx.recv().await.unwrap();
                    black_box(codec::decode_envelope(&frame).unwrap());
                }
                start.elapsed()
            })
        });
    });

    group.bench_function("ten_subscribers", |b| {
        let (service, hub, id) = service(&rt);
        let topic = podium_core::topic::leaderboard(&id);
        let mut receivers = rt.block_on(async {
            let mut receivers = Vec::new();
            for _ in 0..10 {
                let (client, rx) = Client::new(None, 16);
                hub.register(client, Some(topic.clone())).await.unwrap();
                receivers.push(rx);
            }
            receivers
        });

        b.iter_custom(|iters| {
            rt.block_on(async {
                let start = Instant::now();
                for i in 0..iters {
                    let entry = format!("player-{}", i % 1000);
                    service
                        .update_entry_score(&id, &entry, i as f64, None)
                        .await
                        .unwrap();
                    for rx in &mut receivers {
                        black_box(rx.recv().await.unwrap());
                    }
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

/// Benchmark leaderboard reads on a populated board.
fn bench_reads(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("reads");

    let (service, _hub, id) = service(&rt);
    rt.block_on(async {
        for i in 0..10_000u64 {
            service
                .update_entry_score(&id, &format!("player-{i}"), (i * 31 % 9973) as f64, None)
                .await
                .unwrap();
        }
    });

    group.bench_function("detail_top_100", |b| {
        b.iter(|| rt.block_on(service.get_leaderboard_detail(black_box(&id))).unwrap());
    });

    group.bench_function("entry_rank", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let entry = format!("player-{}", i % 10_000);
            i += 1;
            rt.block_on(service.get_entry_rank(&id, black_box(&entry)))
                .unwrap()
        });
    });

    group.bench_function("around_radius_5", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let entry = format!("player-{}", i % 10_000);
            i += 1;
            rt.block_on(service.get_around_entry(&id, black_box(&entry), 5))
                .unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_score_to_subscriber, bench_reads);
criterion_main!(benches);
