use mqttstream::dispatch::{DispatchQueue, StopMode, WorkerPool};
use mqttstream::{Envelope, StreamStats};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn collecting_handler(seen: Arc<Mutex<Vec<String>>>) -> impl Fn(&Envelope) -> color_eyre::Result<()> {
    move |envelope: &Envelope| -> color_eyre::Result<()> {
        seen.lock().unwrap().push(envelope.topic().to_string());
        Ok(())
    }
}

#[tokio::test]
async fn single_worker_delivers_everything_in_order() {
    let queue = Arc::new(DispatchQueue::new(100));
    let stats = Arc::new(StreamStats::default());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let pool = WorkerPool::start(
        1,
        queue.clone(),
        Arc::new(collecting_handler(seen.clone())),
        stats.clone(),
    );
    for i in 0..100 {
        assert!(queue.offer(Envelope::received(format!("seq/{}", i), "x")));
    }
    pool.stop(StopMode::Drain, Duration::from_secs(5)).await.unwrap();

    let expected: Vec<String> = (0..100).map(|i| format!("seq/{}", i)).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
    assert_eq!(queue.dropped(), 0);
    assert_eq!(stats.snapshot().dispatched, 100);
}

#[tokio::test]
async fn overflow_keeps_the_oldest_and_counts_the_rest() {
    // no workers yet: nothing drains the queue while it fills
    let queue = Arc::new(DispatchQueue::new(10));
    let accepted = (0..25)
        .filter(|i| queue.offer(Envelope::received(format!("burst/{}", i), "x")))
        .count();
    assert_eq!(accepted, 10);
    assert_eq!(queue.dropped(), 15);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let pool = WorkerPool::start(
        1,
        queue.clone(),
        Arc::new(collecting_handler(seen.clone())),
        Arc::new(StreamStats::default()),
    );
    tokio::time::timeout(
        Duration::from_secs(5),
        pool.stop(StopMode::Drain, Duration::from_secs(5)),
    )
    .await
    .expect("drain deadlocked")
    .unwrap();

    let expected: Vec<String> = (0..10).map(|i| format!("burst/{}", i)).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
}

#[tokio::test]
async fn many_workers_deliver_each_message_once() {
    let queue = Arc::new(DispatchQueue::new(1000));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let pool = WorkerPool::start(
        4,
        queue.clone(),
        Arc::new(collecting_handler(seen.clone())),
        Arc::new(StreamStats::default()),
    );
    for i in 0..500 {
        queue.offer(Envelope::received(format!("m/{}", i), "x"));
    }
    pool.stop(StopMode::Drain, Duration::from_secs(5)).await.unwrap();

    let mut topics = seen.lock().unwrap().clone();
    topics.sort();
    topics.dedup();
    assert_eq!(topics.len(), 500);
}
