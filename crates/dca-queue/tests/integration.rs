//! Integration tests for dca-queue.

use dca_queue::{bounded, BufferedDelivery, DeliveryConfig, DeliverySink, FnSink, QueueError, StreamExt};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Sink that only delivers when the test hands out a permit.
struct GatedSink {
    gate: Arc<Semaphore>,
    delivered: Arc<Mutex<Vec<u64>>>,
}

impl DeliverySink<u64, ()> for GatedSink {
    type Error = String;

    fn deliver(&mut self, item: u64, _context: &()) -> impl Future<Output = Result<(), String>> + Send {
        let gate = Arc::clone(&self.gate);
        let delivered = Arc::clone(&self.delivered);
        async move {
            let permit = gate.acquire().await.map_err(|e| e.to_string())?;
            permit.forget();
            delivered.lock().unwrap().push(item);
            Ok(())
        }
    }
}

#[tokio::test]
async fn test_add_blocks_when_full_until_one_is_taken() {
    const CAPACITY: usize = 4;
    let (writer, mut reader) = bounded::<u64>(CAPACITY);

    for i in 0..CAPACITY as u64 {
        writer.try_add(i).expect("queue has room");
    }

    let producer = tokio::spawn(async move {
        writer.add(CAPACITY as u64).await.expect("add after a take succeeds");
        writer
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished(), "C+1-th add must wait for a free slot");

    assert_eq!(reader.recv().await, Some(0));
    let mut writer = producer.await.unwrap();
    writer.complete_adding();

    let rest: Vec<u64> = reader.collect().await;
    assert_eq!(rest, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_reader_works_with_stream_combinators() {
    let (mut writer, mut reader) = bounded::<u64>(8);
    for i in 0..6 {
        writer.add(i).await.unwrap();
    }
    writer.complete_adding();

    assert_eq!(reader.recv().await, Some(0));
    let next_two: Vec<u64> = (&mut reader).take(2).collect().await;
    assert_eq!(next_two, vec![1, 2]);
    let rest: Vec<u64> = reader.map(|n| n * 10).collect().await;
    assert_eq!(rest, vec![30, 40, 50]);
}

#[tokio::test]
async fn test_slow_consumer_throttles_producer() {
    let gate = Arc::new(Semaphore::new(0));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = GatedSink {
        gate: Arc::clone(&gate),
        delivered: Arc::clone(&delivered),
    };
    let delivery = BufferedDelivery::start(DeliveryConfig::with_capacity(2), (), sink);

    let producer = tokio::spawn(async move {
        for i in 0..6 {
            delivery.add(i).await.unwrap();
        }
        delivery
    });

    // One item held by the blocked sink plus two queued; the producer waits.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished());
    assert!(delivered.lock().unwrap().is_empty());

    gate.add_permits(6);
    let delivery = producer.await.unwrap();

    let report = delivery.wait_for_drain_completion().await.unwrap();
    assert_eq!(report.delivered, 6);
    assert_eq!(*delivered.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_drain_delivers_every_item_exactly_once() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let sink = FnSink::new(move |n: u64, _ctx: &()| {
        recorder.lock().unwrap().push(n);
        Ok::<_, String>(())
    });

    let mut delivery = BufferedDelivery::start(DeliveryConfig::with_capacity(16), (), sink);
    for i in 0..1_000 {
        delivery.add(i).await.unwrap();
    }
    delivery.complete_adding();

    let report = delivery.wait_for_drain_completion().await.unwrap();
    assert_eq!(report.delivered, 1_000);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1_000);
    assert!(seen.windows(2).all(|w| w[0] + 1 == w[1]));
}

#[tokio::test]
async fn test_abort_keeps_queued_items_and_rejects_new_ones() {
    let gate = Arc::new(Semaphore::new(0));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = GatedSink {
        gate: Arc::clone(&gate),
        delivered: Arc::clone(&delivered),
    };
    let delivery = BufferedDelivery::start(DeliveryConfig::with_capacity(8), (), sink);

    for i in 0..3 {
        delivery.add(i).await.unwrap();
    }

    let abort = delivery.abort_handle();
    abort.abort();
    assert!(delivery.is_aborted());

    let rejected = delivery.add(99).await.unwrap_err();
    assert_eq!(rejected.reason, QueueError::Aborted);
    assert_eq!(rejected.item, 99);

    gate.add_permits(3);
    let report = delivery.wait_for_drain_completion().await.unwrap();
    assert_eq!(report.delivered, 3);
    assert_eq!(*delivered.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_independent_queues_do_not_interfere() {
    let mut tasks = Vec::new();
    for file in 0..4u64 {
        tasks.push(tokio::spawn(async move {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let recorder = Arc::clone(&seen);
            let sink = FnSink::new(move |n: u64, ctx: &u64| {
                recorder.lock().unwrap().push((*ctx, n));
                Ok::<_, String>(())
            });
            let delivery = BufferedDelivery::start(DeliveryConfig::with_capacity(8), file, sink);
            for i in 0..100 {
                delivery.add(i).await.unwrap();
            }
            delivery.wait_for_drain_completion().await.unwrap();
            let seen = seen.lock().unwrap().clone();
            seen
        }));
    }

    for (file, task) in tasks.into_iter().enumerate() {
        let seen = task.await.unwrap();
        assert_eq!(seen.len(), 100);
        assert!(seen.iter().all(|(ctx, _)| *ctx == file as u64));
    }
}

#[tokio::test]
async fn test_wait_for_drain_respects_external_timeout() {
    let gate = Arc::new(Semaphore::new(0));
    let sink = GatedSink {
        gate: Arc::clone(&gate),
        delivered: Arc::new(Mutex::new(Vec::new())),
    };
    let delivery = BufferedDelivery::start(DeliveryConfig::default(), (), sink);
    delivery.add(1).await.unwrap();

    let result = tokio::time::timeout(Duration::from_millis(50), delivery.wait_for_drain_completion()).await;
    assert!(result.is_err(), "drain cannot finish while the sink is stuck");
}
