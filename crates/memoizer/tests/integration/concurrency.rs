use std::sync::Arc;
use std::time::Duration;

use memoizer::caching::{CacheEngine, CacheError};
use memoizer::config::CacheConfig;
use memoizer_test::{self as test, Producer};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct UserKey {
    tenant: u32,
    name: String,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight_across_threads() {
    test::setup();
    let cache = CacheEngine::<UserKey, Arc<str>>::with_tokio(CacheConfig::with_ttl(
        Duration::from_secs(60),
    ));
    let producer = Producer::new(Duration::from_millis(200));

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let cache = cache.clone();
            let producer = producer.clone();
            let key = UserKey {
                tenant: i % 2,
                name: "admin".into(),
            };
            tokio::spawn(async move {
                let produce = producer.produce();
                cache
                    .get(key, move |key: UserKey| {
                        let name = format!("{}/{}", key.tenant, key.name);
                        async move { produce(name).await.map(Arc::from) }
                    })
                    .await
            })
        })
        .collect();

    let mut values = Vec::new();
    for task in tasks {
        values.push(task.await.unwrap().unwrap());
    }

    // one computation per distinct key
    assert_eq!(producer.calls(), 2);
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.refreshes_in_flight(), 0);
    for (i, value) in values.iter().enumerate() {
        assert!(value.starts_with(&format!("{}/admin-", i % 2)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_across_threads() {
    test::setup();
    let cache = CacheEngine::<u32, String>::with_tokio(CacheConfig::with_ttl(
        Duration::from_secs(60),
    ));
    let producer = Producer::new(Duration::from_secs(5));

    let leader = {
        let cache = cache.clone();
        let producer = producer.clone();
        tokio::spawn(async move { cache.get(1, producer.produce()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let followers: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let producer = producer.clone();
            tokio::spawn(async move { cache.get(1, producer.produce()).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    cache.shutdown();
    for follower in followers {
        assert_eq!(follower.await.unwrap(), Err(CacheError::Shutdown));
    }
    assert_eq!(producer.calls(), 1);

    leader.abort();
    assert!(cache.get(2, producer.produce()).await.is_err());
}
