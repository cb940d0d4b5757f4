use std::io::Write;
use std::time::Duration;

use memoizer::caching::CacheEngine;
use memoizer::config::{Config, EvictionPolicy};
use memoizer_test::{self as test, Producer};

#[tokio::test(start_paused = true)]
async fn test_engine_from_config_file() {
    test::setup();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(
        br#"
cache:
  name: users
  ttl: 1s
  max_size: 2
  eviction: lru_updated
logging:
  level: warn
"#,
    )
    .unwrap();

    let config = Config::get(Some(file.path())).unwrap();
    assert_eq!(config.cache.eviction, EvictionPolicy::LruUpdated);

    let cache = CacheEngine::<String, String>::with_tokio(config.cache);
    assert_eq!(cache.config().name, "users");

    let producer = Producer::default();
    for key in ["a", "b", "a", "c"] {
        cache.get(key.to_owned(), producer.produce()).await.unwrap();
    }
    // reading `a` did not protect it, it was written first
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.stats().evictions, 1);
    assert_eq!(cache.get("a".to_owned(), producer.produce()).await.unwrap(), "a-4");

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(cache.get("a".to_owned(), producer.produce()).await.unwrap(), "a-5");
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = Config::get(Some(dir.path().join("memoizer.yml").as_path()));
    assert!(result.is_err());
}
