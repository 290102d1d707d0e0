//! Tests for the shared-data primitives used across tasks.

use std::time::Duration;

use core_resources::shared::{
    BacklogPolicy, ConcurrentMap, ConfigData, ConfigDataOptions, MutableSharedData, SharedData,
};
use core_resources::telemetry::{CollectingSink, Component};

#[derive(Debug, Clone, PartialEq)]
struct Settings {
    workers: usize,
    label: String,
}

#[tokio::test]
async fn test_shared_data_is_one_allocation_across_tasks() {
    let data = SharedData::new(vec![1u64, 2, 3]);
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let data = data.clone();
        tasks.push(tokio::spawn(async move { data.iter().sum::<u64>() }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), 6);
    }
    assert_eq!(data.holders(), 1);
}

#[tokio::test]
async fn test_mutable_shared_data_concurrent_updates() {
    let counter = MutableSharedData::new(0u64);
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let counter = counter.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..100 {
                counter.update(|n| *n += 1).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(*counter.read().await, 800);
    assert_eq!(counter.snapshot().await, 800);
}

#[tokio::test]
async fn test_readers_wait_for_writer() {
    let data = MutableSharedData::new(1u32);
    let mut guard = data.write().await;
    let mut read = tokio_test::task::spawn(data.read());
    tokio_test::assert_pending!(read.poll());

    *guard = 2;
    drop(guard);
    assert!(read.is_woken());
    let value = tokio_test::assert_ready!(read.poll());
    assert_eq!(*value, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_map_across_tasks() {
    let map: ConcurrentMap<u32, u64> = ConcurrentMap::new();
    let mut tasks = Vec::new();
    for t in 0..4u32 {
        let map = map.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..50u32 {
                map.insert(t * 100 + i, u64::from(i));
                let _ = map.get_or_insert_with(9999, || 0);
                map.update(&9999, |hits| *hits += 1);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(map.len(), 201);
    assert_eq!(map.get(&9999), Some(200));

    map.retain(|key, _| *key < 100);
    assert_eq!(map.len(), 50);
}

#[tokio::test]
async fn test_slow_subscriber_ends_on_latest_version() {
    let config = ConfigData::new(
        Settings {
            workers: 0,
            label: "initial".into(),
        },
        ConfigDataOptions {
            backlog: 4,
            policy: BacklogPolicy::DropOldest,
        },
    );
    let mut sub = config.subscribe();

    let reader = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(snapshot) = sub.recv().await {
            seen.push(snapshot.version);
            if snapshot.version == 100 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        (seen, sub.skipped())
    });

    for workers in 1..=100 {
        config.update(Settings {
            workers,
            label: format!("rev-{workers}"),
        });
        if workers % 10 == 0 {
            tokio::task::yield_now().await;
        }
    }

    let (seen, skipped) = tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(seen.len() as u64 + skipped, 100);
    assert_eq!(config.current().workers, 100);
    assert_eq!(config.current().label, "rev-100");
}

#[tokio::test]
async fn test_disconnect_slow_keeps_fast_subscribers() {
    let sink = CollectingSink::new();
    let config = ConfigData::with_sink(
        0u32,
        ConfigDataOptions {
            backlog: 2,
            policy: BacklogPolicy::DisconnectSlow,
        },
        sink.clone(),
    );
    let mut fast = config.subscribe();
    let mut slow = config.subscribe();
    assert_eq!(config.subscriber_count(), 2);

    for v in 1..=3 {
        config.update(v);
        assert_eq!(fast.recv().await.unwrap().version, u64::from(v));
    }

    // The slow subscriber gets what was buffered, then the version that was
    // current when it was cut off, then ends.
    let mut seen = Vec::new();
    while let Some(snapshot) = slow.recv().await {
        seen.push(snapshot.version);
    }
    assert_eq!(seen, vec![1, 2, 3]);
    assert_eq!(seen.last().copied(), Some(config.version()));

    assert_eq!(config.subscriber_count(), 1);
    assert_eq!(sink.matching(Component::Shared, "config_disconnect").len(), 1);
    assert_eq!(sink.matching(Component::Shared, "config_update").len(), 3);
}

#[tokio::test]
async fn test_subscription_ends_when_container_dropped() {
    let config = ConfigData::new(1u8, ConfigDataOptions::default());
    let mut sub = config.subscribe();
    config.update(2);
    drop(config);
    assert_eq!(sub.recv().await.map(|s| *s), Some(2));
    assert!(sub.recv().await.is_none());
}
