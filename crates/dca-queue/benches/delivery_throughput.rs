use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dca_queue::{bounded, BufferedDelivery, DeliveryConfig, FnSink};

const EVENTS_PER_PASS: u64 = 100_000;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

/// One decode pass: add every event, complete, wait for the drain.
fn bench_delivery_pass(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("delivery_pass");
    group.throughput(Throughput::Elements(EVENTS_PER_PASS));

    for capacity in [64, 1024, 16 * 1024] {
        group.bench_with_input(BenchmarkId::new("capacity", capacity), &capacity, |b, &capacity| {
            b.to_async(&rt).iter(|| async move {
                let sink = FnSink::new(|n: u64, _ctx: &()| {
                    black_box(n);
                    Ok::<_, std::convert::Infallible>(())
                });
                let delivery = BufferedDelivery::start(DeliveryConfig::with_capacity(capacity), (), sink);
                for i in 0..EVENTS_PER_PASS {
                    delivery.add(i).await.unwrap();
                }
                let report = delivery.wait_for_drain_completion().await.unwrap();
                assert_eq!(report.delivered, EVENTS_PER_PASS);
            });
        });
    }

    group.finish();
}

/// Raw queue halves without the consumer task wrapper.
fn bench_queue_handoff(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("queue_handoff");
    group.throughput(Throughput::Elements(EVENTS_PER_PASS));

    group.bench_function("add_take", |b| {
        b.to_async(&rt).iter(|| async {
            let (mut writer, mut reader) = bounded::<u64>(1024);
            let consumer = tokio::spawn(async move {
                let mut count = 0u64;
                while let Some(n) = reader.recv().await {
                    black_box(n);
                    count += 1;
                }
                count
            });
            for i in 0..EVENTS_PER_PASS {
                writer.add(i).await.unwrap();
            }
            writer.complete_adding();
            assert_eq!(consumer.await.unwrap(), EVENTS_PER_PASS);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_delivery_pass, bench_queue_handoff);
criterion_main!(benches);
