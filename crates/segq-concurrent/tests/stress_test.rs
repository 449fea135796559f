use futures::executor::block_on;
use segq_concurrent::{AsyncQueue, QueueConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

const PRODUCERS: u64 = 4;
const CONSUMERS: u64 = 4;
const PER_PRODUCER: u64 = 5_000;

fn tag(producer: u64, seq: u64) -> u64 {
    (producer << 32) | seq
}

fn untag(value: u64) -> (u64, u64) {
    (value >> 32, value & 0xffff_ffff)
}

#[test]
fn no_loss_no_duplication_across_threads() {
    let queue = Arc::new(AsyncQueue::with_config(QueueConfig::with_segment_capacity(16)));
    let total = PRODUCERS * PER_PRODUCER;
    let per_consumer = total / CONSUMERS;

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = queue.clone();
            thread::spawn(move || {
                (0..per_consumer)
                    .map(|_| block_on(queue.take()).unwrap())
                    .collect::<Vec<u64>>()
            })
        })
        .collect();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    queue.add(tag(p, seq));
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }

    let mut seen = HashMap::new();
    for consumer in consumers {
        let received = consumer.join().unwrap();
        // Claims from one consumer are sequential, so each producer's items
        // reach it in the order they were added.
        let mut last_seq: HashMap<u64, u64> = HashMap::new();
        for value in received {
            let (producer, seq) = untag(value);
            if let Some(previous) = last_seq.insert(producer, seq) {
                assert!(previous < seq, "producer {producer} reordered: {previous} then {seq}");
            }
            assert!(seen.insert(value, ()).is_none(), "duplicate item {value:#x}");
        }
    }

    assert_eq!(seen.len() as u64, total);
    assert_eq!(queue.count(), 0);
    assert_eq!(queue.awaiter_count(), 0);
}

#[test]
fn add_completes_without_consumers() {
    let queue = Arc::new(AsyncQueue::with_config(QueueConfig::with_segment_capacity(8)));
    let handles: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    queue.add(tag(p, seq));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(queue.count() as u64, PRODUCERS * PER_PRODUCER);

    let mut drained: Vec<u64> = (0..PRODUCERS * PER_PRODUCER)
        .map(|_| block_on(queue.take()).unwrap())
        .collect();
    drained.sort_unstable();
    let mut expected: Vec<u64> = (0..PRODUCERS)
        .flat_map(|p| (0..PER_PRODUCER).map(move |seq| tag(p, seq)))
        .collect();
    expected.sort_unstable();
    assert_eq!(drained, expected);
    assert_eq!(queue.stats().live_segments, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_storm_keeps_every_item() {
    use segq_concurrent::CancellationToken;
    use std::time::Duration;

    let queue = Arc::new(AsyncQueue::new());
    let total = 2_000u64;

    // Consumers that give up quickly race with deliveries.
    let flaky: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..200 {
                    let token = CancellationToken::new();
                    let take = queue.take_with_cancellation(token.clone());
                    token.cancel();
                    if let Ok(value) = take.await {
                        got.push(value);
                    }
                }
                got
            })
        })
        .collect();

    let producer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            for i in 0..total {
                queue.add(i);
                if i % 64 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    producer.await.unwrap();
    let mut received = Vec::new();
    for handle in flaky {
        received.extend(handle.await.unwrap());
    }

    let remaining = queue.count() as u64;
    for _ in 0..remaining {
        let value = tokio::time::timeout(Duration::from_secs(5), queue.take())
            .await
            .expect("resident item delivered")
            .unwrap();
        received.push(value);
    }

    received.sort_unstable();
    assert_eq!(received, (0..total).collect::<Vec<_>>());
    assert_eq!(queue.awaiter_count(), 0);
}

#[test]
fn counting_races_with_deliveries_and_cancellations() {
    use segq_concurrent::CancellationToken;
    use std::sync::atomic::{AtomicBool, Ordering};

    let queue = Arc::new(AsyncQueue::with_config(QueueConfig::with_segment_capacity(8)));
    let done = Arc::new(AtomicBool::new(false));
    let total = 4_000u64;

    let counter = {
        let queue = queue.clone();
        let done = done.clone();
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                let _ = queue.awaiter_count();
                let _ = queue.count();
            }
        })
    };

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut got = Vec::new();
                for _ in 0..500 {
                    let token = CancellationToken::new();
                    let take = queue.take_with_cancellation(token.clone());
                    token.cancel();
                    if let Ok(value) = block_on(take) {
                        got.push(value);
                    }
                }
                got
            })
        })
        .collect();

    let producer = {
        let queue = queue.clone();
        thread::spawn(move || {
            for i in 0..total {
                queue.add(i);
            }
        })
    };

    producer.join().unwrap();
    let mut received: Vec<u64> = consumers
        .into_iter()
        .flat_map(|consumer| consumer.join().unwrap())
        .collect();
    done.store(true, Ordering::Release);
    counter.join().unwrap();

    assert_eq!(queue.awaiter_count(), 0);
    let remaining = queue.count();
    received.extend((0..remaining).map(|_| block_on(queue.take()).unwrap()));
    received.sort_unstable();
    assert_eq!(received, (0..total).collect::<Vec<_>>());
}
