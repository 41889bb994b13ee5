//! End-to-end behaviour of the query cache as a request handler sees it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use aqcache::{CacheError, CacheSettings, Capacity, FingerprintKey, Lookup, QueryCache};
use bytes::Bytes;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

fn cache_with(capacity: Capacity) -> Arc<QueryCache> {
    Arc::new(QueryCache::new(CacheSettings {
        capacity,
        ..CacheSettings::default()
    }))
}

fn country(cache: &QueryCache, page: &str) -> FingerprintKey {
    cache
        .key_for("/v3/countries", &params(&[("page", page)]))
        .unwrap()
}

async fn store(cache: &QueryCache, key: &FingerprintKey, body: &'static [u8]) {
    cache
        .get_or_compute(key, Duration::from_secs(60), || async move {
            Ok::<_, std::io::Error>(Bytes::from_static(body))
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn least_recently_used_entry_is_evicted_first() {
    init_tracing();
    let cache = cache_with(Capacity::Entries(2));
    let (k1, k2, k3) = (country(&cache, "1"), country(&cache, "2"), country(&cache, "3"));

    store(&cache, &k1, b"one").await;
    store(&cache, &k2, b"two").await;
    store(&cache, &k3, b"three").await;

    assert_eq!(cache.store().lookup(&k1), Lookup::Miss);
    assert!(cache.store().lookup(&k2).is_hit());
    assert!(cache.store().lookup(&k3).is_hit());
    assert_eq!(cache.metrics().evictions, 1);
}

#[tokio::test]
async fn recent_lookup_protects_an_entry_from_eviction() {
    let cache = cache_with(Capacity::Entries(2));
    let (k1, k2, k3) = (country(&cache, "1"), country(&cache, "2"), country(&cache, "3"));

    store(&cache, &k1, b"one").await;
    store(&cache, &k2, b"two").await;
    assert!(cache.store().lookup(&k1).is_hit());
    store(&cache, &k3, b"three").await;

    assert!(cache.store().lookup(&k1).is_hit());
    assert_eq!(cache.store().lookup(&k2), Lookup::Miss);
}

#[tokio::test(start_paused = true)]
async fn concurrent_misses_run_the_query_once() {
    init_tracing();
    let cache = cache_with(Capacity::Entries(16));
    let calls = Arc::new(AtomicUsize::new(0));
    let raw = params(&[("iso", "IN"), ("parameters_id", "2")]);

    let request = |cache: Arc<QueryCache>, calls: Arc<AtomicUsize>| {
        let raw = raw.clone();
        async move {
            cache
                .fetch("/v3/locations", &raw, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, std::io::Error>(Bytes::from_static(b"[delhi]"))
                })
                .await
        }
    };

    let (a, b) = tokio::join!(
        request(Arc::clone(&cache), Arc::clone(&calls)),
        request(Arc::clone(&cache), Arc::clone(&calls)),
    );

    assert_eq!(a.unwrap(), Bytes::from_static(b"[delhi]"));
    assert_eq!(b.unwrap(), Bytes::from_static(b"[delhi]"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let snap = cache.metrics();
    assert_eq!(snap.misses, 2);
    assert_eq!(snap.in_flight, 0);
    assert_eq!(snap.entry_count, 1);
}

#[tokio::test]
async fn many_waiters_share_one_fetch() {
    let cache = cache_with(Capacity::Entries(16));
    let calls = Arc::new(AtomicUsize::new(0));
    let key = country(&cache, "1");

    let mut handles = Vec::new();
    for _ in 0..32 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_compute(&key, Duration::from_secs(60), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, std::io::Error>(Bytes::from_static(b"countries"))
                })
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), Bytes::from_static(b"countries"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_query_is_not_cached_and_can_be_retried() {
    let cache = cache_with(Capacity::Entries(16));
    let key = country(&cache, "1");
    let ttl = Duration::from_secs(60);

    let err = cache
        .get_or_compute(&key, ttl, || async {
            Err::<Bytes, _>(std::io::Error::other("database unavailable"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Upstream(_)));
    assert_eq!(err.to_string(), "database unavailable");
    assert_eq!(cache.store().lookup(&key), Lookup::Miss);

    let body = cache
        .get_or_compute(&key, ttl, || async {
            Ok::<_, std::io::Error>(Bytes::from_static(b"recovered"))
        })
        .await
        .unwrap();
    assert_eq!(body, Bytes::from_static(b"recovered"));
    assert!(cache.store().lookup(&key).is_hit());
}

#[tokio::test(start_paused = true)]
async fn entries_expire_after_their_ttl() {
    let cache = cache_with(Capacity::Entries(16));
    let key = country(&cache, "1");

    cache
        .get_or_compute(&key, Duration::from_secs(1), || async {
            Ok::<_, std::io::Error>(Bytes::from_static(b"fresh"))
        })
        .await
        .unwrap();
    assert!(cache.store().lookup(&key).is_hit());

    tokio::time::advance(Duration::from_secs(2)).await;

    assert_eq!(cache.store().lookup(&key), Lookup::Miss);
    assert_eq!(cache.metrics().expirations, 1);
}

#[tokio::test(start_paused = true)]
async fn endpoint_ttl_override_applies_through_fetch() {
    let settings = CacheSettings::from_toml_str(
        r#"
        default_ttl_secs = 600
        capacity = { entries = 16 }

        [endpoints."/v3/locations/{locations_id}/latest"]
        ttl_secs = 30
        "#,
    )
    .unwrap();
    let cache = QueryCache::new(settings);
    let calls = Arc::new(AtomicUsize::new(0));
    let raw = params(&[("locations_id", "2178")]);

    for _ in 0..2 {
        let calls = Arc::clone(&calls);
        cache
            .fetch("/v3/locations/{locations_id}/latest", &raw, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(Bytes::from_static(b"latest"))
            })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
