//! Latency benchmarks for Switchboard.
//!
//! These benchmarks focus on measuring single-message latency.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::time::Instant;
use switchboard_core::{Bus, CancellationToken, Event, Hub, HubConfig, Pipeline, Session};
use switchboard_protocol::Envelope;
use tokio::runtime::Runtime;

/// Benchmark publish + receive latency on the bus.
fn bench_pubsub_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("pubsub_latency");

    group.bench_function("single_subscriber", |b| {
        b.iter_custom(|iters| {
            let bus = Bus::new();
            let mut sub = bus.subscribe(&CancellationToken::new(), "sub-1", ["test"]);

            let start = Instant::now();
            for _ in 0..iters {
                bus.publish("test", vec![0u8; 64]);
                let _ = sub.try_recv();
            }
            start.elapsed()
        });
    });

    group.bench_function("ten_subscribers", |b| {
        b.iter_custom(|iters| {
            let bus = Bus::new();
            let scope = CancellationToken::new();
            let mut subs: Vec<_> = (0..10)
                .map(|i| bus.subscribe(&scope, format!("sub-{i}"), ["test"]))
                .collect();

            let start = Instant::now();
            for _ in 0..iters {
                bus.publish("test", vec![0u8; 64]);
                for sub in &mut subs {
                    let _ = sub.try_recv();
                }
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Benchmark a targeted hub delivery through the control loop.
fn bench_hub_send_to(c: &mut Criterion) {
    let mut group = c.benchmark_group("hub_send_to");
    let rt = Runtime::new().unwrap();

    group.bench_function("round_trip", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let hub = Hub::spawn(HubConfig::default());
                let (session, mut rx) = Session::new(None, 16);
                let id = session.id().to_string();
                hub.register(session).await.unwrap();
                let pong = Envelope::pong();

                let start = Instant::now();
                for _ in 0..iters {
                    hub.send_to(&id, &pong).await.unwrap();
                    rx.recv().await.unwrap();
                }
                let elapsed = start.elapsed();

                hub.shutdown().await.unwrap();
                elapsed
            })
        });
    });

    group.finish();
}

/// Benchmark event and envelope creation.
fn bench_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("creation");

    group.bench_function("event", |b| {
        b.iter(|| Event::new(black_box("orders"), black_box(vec![0u8; 64])))
    });

    group.bench_function("room_envelope", |b| {
        b.iter(|| Envelope::room_message(black_box("chat:lobby"), json!({"text": "hi"})))
    });

    group.finish();
}

/// Benchmark synchronous pipeline processing.
fn bench_pipeline_process(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_process");

    let pipeline = Pipeline::new()
        .stage(|event: Event| {
            let payload = event.payload().to_ascii_uppercase();
            Ok(event.with_payload(payload))
        })
        .stage(|event: Event| Ok(event.with_topic("processed")));

    group.bench_function("two_stages", |b| {
        b.iter(|| pipeline.process(black_box(Event::new("raw", vec![b'a'; 64]))))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_pubsub_latency,
    bench_hub_send_to,
    bench_creation,
    bench_pipeline_process,
);
criterion_main!(benches);
