use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use memoizer::caching::CacheEngine;
use memoizer::config::CacheConfig;
use memoizer::scheduler::{Scheduler, TokioScheduler};
use memoizer_test::{self as test, Producer};

/// Delegates to tokio, but counts the spawned tasks.
#[derive(Debug, Default)]
struct CountingScheduler {
    spawned: AtomicUsize,
}

impl Scheduler for CountingScheduler {
    fn now(&self) -> Instant {
        TokioScheduler.now()
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        TokioScheduler.spawn(task);
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        TokioScheduler.sleep(duration)
    }
}

#[tokio::test(start_paused = true)]
async fn test_background_refresh_uses_scheduler() {
    test::setup();
    let scheduler = Arc::new(CountingScheduler::default());
    let config = CacheConfig {
        refresh_after: Some(Duration::from_millis(50)),
        ..CacheConfig::with_ttl(Duration::from_millis(100))
    };
    let cache = CacheEngine::<u32, String>::new(config, scheduler.clone());
    let producer = Producer::new(Duration::from_millis(10));

    assert_eq!(cache.get(1, producer.produce()).await.unwrap(), "1-1");
    assert_eq!(scheduler.spawned.load(Ordering::SeqCst), 0);

    tokio::time::advance(Duration::from_millis(60)).await;
    assert_eq!(cache.get(1, producer.produce()).await.unwrap(), "1-1");
    assert_eq!(cache.get(1, producer.produce()).await.unwrap(), "1-1");
    assert_eq!(scheduler.spawned.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.get(1, producer.produce()).await.unwrap(), "1-2");
}

#[tokio::test(start_paused = true)]
async fn test_blocking_refresh_does_not_spawn() {
    test::setup();
    let scheduler = Arc::new(CountingScheduler::default());
    let cache = CacheEngine::<u32, String>::new(
        CacheConfig::with_ttl(Duration::from_millis(100)),
        scheduler.clone(),
    );
    let producer = Producer::new(Duration::from_millis(10));

    for expected in ["1-1", "1-2", "1-3"] {
        assert_eq!(cache.get(1, producer.produce()).await.unwrap(), expected);
        tokio::time::advance(Duration::from_millis(100)).await;
    }
    assert_eq!(scheduler.spawned.load(Ordering::SeqCst), 0);
}
