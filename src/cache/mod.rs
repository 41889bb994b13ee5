//! Query cache façade, the entry point request handlers call.
//!
//! [`QueryCache`] ties the [`EntryStore`] and the [`Coalescer`] together:
//!
//! 1. Look the key up in the store; a hit returns immediately.
//! 2. On a miss, join or start the key's upstream fetch.
//! 3. A successful fetch is inserted into the store *before* its waiters are released,
//!    so a caller arriving after them either hits the new entry or joins the same fetch.
//!
//! The cache is an optimization and never a correctness dependency: parameters it
//! cannot fingerprint, disabled endpoints, and results too large to store all fall
//! back to computing directly, and upstream errors pass through untouched.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::collections::HashMap;
//!
//! use aqcache::{CacheSettings, QueryCache};
//! use bytes::Bytes;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = Arc::new(QueryCache::new(CacheSettings::from_env()?));
//! let params = HashMap::from([("iso".to_owned(), "US".to_owned())]);
//!
//! let body = cache
//!     .fetch("/v3/locations", &params, || async {
//!         // run the database query here
//!         Ok::<_, std::io::Error>(Bytes::from_static(b"{\"results\":[]}"))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::coalesce::Coalescer;
use crate::config::CacheSettings;
use crate::key::{FingerprintKey, SchemaRegistry};
use crate::metrics::{CacheMetrics, Gauges, MetricsSnapshot};
use crate::store::{EntryStore, Inserted, Lookup};

mod error;

pub use error::{BoxError, CacheError, UpstreamError};

/// Fingerprint-keyed query-result cache with request coalescing.
///
/// Construct one per process and share it as `Arc<QueryCache>`.
pub struct QueryCache {
    settings: CacheSettings,
    schemas: SchemaRegistry,
    store: Arc<EntryStore>,
    coalescer: Coalescer,
    metrics: Arc<CacheMetrics>,
}

impl QueryCache {
    /// Creates a cache with the built-in v3 endpoint schemas.
    pub fn new(settings: CacheSettings) -> Self {
        Self::with_schemas(settings, SchemaRegistry::openaq_v3())
    }

    /// Creates a cache that fingerprints requests with `schemas`.
    pub fn with_schemas(settings: CacheSettings, schemas: SchemaRegistry) -> Self {
        let metrics = Arc::new(CacheMetrics::new());
        let store = Arc::new(EntryStore::new(
            settings.capacity,
            settings.max_ttl(),
            Arc::clone(&metrics),
        ));
        info!(
            capacity = ?settings.capacity,
            default_ttl_secs = settings.default_ttl_secs,
            max_ttl_secs = settings.max_ttl_secs,
            endpoints = schemas.len(),
            "query cache initialised"
        );
        Self {
            settings,
            schemas,
            store,
            coalescer: Coalescer::new(),
            metrics,
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    /// Builds the key for a request to `endpoint` with raw query `params`.
    pub fn key_for(
        &self,
        endpoint: &str,
        params: &HashMap<String, String>,
    ) -> Result<FingerprintKey, CacheError> {
        Ok(crate::key::make_key(&self.schemas, endpoint, params)?)
    }

    /// Returns the cached payload for `key`, or computes, caches and returns it.
    ///
    /// Concurrent calls for the same key share a single `compute` execution. A failed
    /// computation is returned to every waiter and never cached.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Upstream`]: `compute` failed; carries its error verbatim.
    /// - [`CacheError::FetchAborted`]: `compute` panicked or could not be spawned.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &FingerprintKey,
        ttl: Duration,
        compute: F,
    ) -> Result<Bytes, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        if let Lookup::Hit(payload) = self.store.lookup(key) {
            self.metrics.record_hit();
            debug!(key = %key, "cache hit");
            return Ok(payload);
        }
        self.metrics.record_miss();

        self.start_or_join(key, ttl, compute).wait().await
    }

    /// [`get_or_compute`](Self::get_or_compute) with a deadline on this caller's wait.
    ///
    /// On timeout the caller gets [`CacheError::Timeout`]; the shared fetch keeps
    /// running and still populates the cache for later callers.
    pub async fn get_or_compute_with_timeout<F, Fut, E>(
        &self,
        key: &FingerprintKey,
        ttl: Duration,
        timeout: Duration,
        compute: F,
    ) -> Result<Bytes, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        match tokio::time::timeout(timeout, self.get_or_compute(key, ttl, compute)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.metrics.record_timeout();
                debug!(key = %key, ?timeout, "caller stopped waiting for cached result");
                Err(CacheError::Timeout(timeout))
            }
        }
    }

    /// Handler-level entry point: fingerprints the request with the endpoint's schema
    /// and serves it through the cache with the endpoint's configured ttl.
    ///
    /// Requests the cache cannot or should not handle (unknown parameters, disabled
    /// endpoint) are computed directly and not stored.
    ///
    /// # Errors
    ///
    /// Only errors from `compute` (or a panic inside it) are returned.
    pub async fn fetch<F, Fut, E>(
        &self,
        endpoint: &str,
        params: &HashMap<String, String>,
        compute: F,
    ) -> Result<Bytes, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        if !self.settings.is_endpoint_enabled(endpoint) {
            debug!(endpoint, "caching disabled for endpoint, bypassing");
            return self.bypass(compute).await;
        }

        let key = match self.key_for(endpoint, params) {
            Ok(key) => key,
            Err(e) => {
                debug!(endpoint, error = %e, "request not cacheable, bypassing");
                return self.bypass(compute).await;
            }
        };

        let ttl = self.settings.ttl_for(endpoint);
        self.get_or_compute(&key, ttl, compute).await
    }

    /// Computes without touching the cache.
    pub async fn bypass<F, Fut, E>(&self, compute: F) -> Result<Bytes, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: Into<BoxError> + 'static,
    {
        self.metrics.record_bypass();
        compute().await.map_err(CacheError::upstream)
    }

    /// Removes the cached result for `key` and detaches any fetch in flight for it.
    pub fn invalidate(&self, key: &FingerprintKey) -> bool {
        let removed = self.store.invalidate(key);
        self.coalescer.detach(key);
        debug!(key = %key, removed, "invalidated cache entry");
        removed
    }

    /// Removes every cached result under an endpoint prefix, e.g. after an ingestion
    /// run has written new rows. Returns how many entries were removed.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let removed = self.store.invalidate_prefix(prefix);
        let detached = self.coalescer.detach_prefix(prefix);
        info!(prefix, removed, detached, "invalidated cached results");
        removed
    }

    /// Drops every cached result.
    pub fn clear(&self) {
        self.store.clear();
        info!("query cache cleared");
    }

    /// Drops expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }

    /// Current counters and gauges.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(Gauges {
            in_flight: self.coalescer.in_flight(),
            entry_count: self.store.len(),
            estimated_bytes: self.store.estimated_bytes(),
        })
    }

    fn start_or_join<F, Fut, E>(
        &self,
        key: &FingerprintKey,
        ttl: Duration,
        compute: F,
    ) -> crate::coalesce::Waiter
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.coalescer.get_or_start(key, || {
            let store = Arc::clone(&self.store);
            let metrics = Arc::clone(&self.metrics);
            let epoch = store.epoch();
            let key = key.clone();
            let upstream = compute();

            async move {
                let started = Instant::now();
                let outcome = upstream.await;
                metrics.record_fetch(started.elapsed());

                let payload = match outcome {
                    Ok(payload) => payload,
                    Err(e) => {
                        let err = CacheError::upstream(e);
                        metrics.record_upstream_error();
                        debug!(key = %key, error = %err, "upstream fetch failed, not cached");
                        return Err(err);
                    }
                };

                match store.insert_at_epoch(key.clone(), payload.clone(), ttl, epoch) {
                    Ok(Inserted::Stored { evicted }) => {
                        debug!(key = %key, size = payload.len(), evicted, "cached upstream result");
                    }
                    Ok(Inserted::Superseded) => {
                        debug!(key = %key, "result fetched before invalidation, not cached");
                    }
                    Ok(Inserted::Expired) => {}
                    Err(e) => {
                        metrics.record_rejected_insert();
                        warn!(key = %key, error = %e, "upstream result not cached");
                    }
                }
                Ok(payload)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::Capacity;

    fn cache(capacity: Capacity) -> QueryCache {
        QueryCache::new(CacheSettings {
            capacity,
            ..CacheSettings::default()
        })
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn counted(
        calls: &Arc<AtomicUsize>,
        body: &'static [u8],
    ) -> impl FnOnce() -> std::future::Ready<Result<Bytes, std::io::Error>> {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(Bytes::from_static(body)))
        }
    }

    #[tokio::test]
    async fn second_call_served_from_cache() {
        let cache = cache(Capacity::Entries(16));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = cache.key_for("/v3/countries", &params(&[])).unwrap();

        let ttl = Duration::from_secs(60);
        let first = cache.get_or_compute(&key, ttl, counted(&calls, b"P")).await;
        let second = cache.get_or_compute(&key, ttl, counted(&calls, b"Q")).await;

        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snap = cache.metrics();
        assert_eq!((snap.hits, snap.misses), (1, 1));
        assert_eq!(snap.entry_count, 1);
    }

    #[tokio::test]
    async fn unknown_parameter_bypasses_cache() {
        let cache = cache(Capacity::Entries(16));
        let calls = Arc::new(AtomicUsize::new(0));
        let raw = params(&[("not_a_filter", "1")]);

        for _ in 0..2 {
            cache
                .fetch("/v3/locations", &raw, counted(&calls, b"P"))
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let snap = cache.metrics();
        assert_eq!(snap.bypasses, 2);
        assert_eq!(snap.entry_count, 0);
    }

    #[tokio::test]
    async fn disabled_endpoint_bypasses_cache() {
        let mut settings = CacheSettings::default();
        settings.endpoints.insert(
            "/v3/countries".to_owned(),
            crate::config::EndpointSettings {
                enabled: false,
                ttl_secs: None,
            },
        );
        let cache = QueryCache::new(settings);
        let calls = Arc::new(AtomicUsize::new(0));

        cache.fetch("/v3/countries", &params(&[]), counted(&calls, b"P")).await.unwrap();
        cache.fetch("/v3/countries", &params(&[]), counted(&calls, b"P")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn equivalent_requests_share_an_entry() {
        let cache = cache(Capacity::Entries(16));
        let calls = Arc::new(AtomicUsize::new(0));

        let a = params(&[("iso", "US"), ("parameters_id", "2,1"), ("limit", "100")]);
        let b = params(&[("parameters_id", " 1, 2 "), ("iso", "us")]);
        cache.fetch("/v3/locations", &a, counted(&calls, b"P")).await.unwrap();
        cache.fetch("/v3/locations", &b, counted(&calls, b"P")).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_result_returned_but_not_cached() {
        let cache = cache(Capacity::Bytes(64));
        let key = cache.key_for("/v3/countries", &params(&[])).unwrap();

        let body = cache
            .get_or_compute(&key, Duration::from_secs(60), || async {
                Ok::<_, std::io::Error>(Bytes::from(vec![b'x'; 1024]))
            })
            .await
            .unwrap();

        assert_eq!(body.len(), 1024);
        let snap = cache.metrics();
        assert_eq!(snap.rejected_inserts, 1);
        assert_eq!(snap.entry_count, 0);
    }

    #[tokio::test]
    async fn upstream_error_passes_through_verbatim() {
        let cache = cache(Capacity::Entries(16));
        let key = cache.key_for("/v3/countries", &params(&[])).unwrap();

        let err = cache
            .get_or_compute(&key, Duration::from_secs(60), || async {
                let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "statement timeout");
                Err::<Bytes, _>(err)
            })
            .await
            .unwrap_err();

        let upstream = match err {
            CacheError::Upstream(upstream) => upstream,
            other => panic!("expected upstream error, got {other:?}"),
        };
        let io = upstream.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);
        assert_eq!(cache.metrics().upstream_errors, 1);
    }

    #[tokio::test]
    async fn timeout_leaves_shared_fetch_running() {
        let cache = cache(Capacity::Entries(16));
        let key = cache.key_for("/v3/countries", &params(&[])).unwrap();
        let ttl = Duration::from_secs(60);

        let err = cache
            .get_or_compute_with_timeout(&key, ttl, Duration::from_millis(10), || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, std::io::Error>(Bytes::from_static(b"slow"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Timeout(_)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.store().lookup(&key), Lookup::Hit(Bytes::from_static(b"slow")));
        assert_eq!(cache.metrics().timeouts, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn compute_may_read_cache_metrics() {
        let cache = Arc::new(cache(Capacity::Entries(16)));
        let key = cache.key_for("/v3/countries", &params(&[])).unwrap();
        let inner = Arc::clone(&cache);

        let body = cache
            .get_or_compute(&key, Duration::from_secs(60), move || {
                let in_flight = inner.metrics().in_flight;
                async move { Ok::<_, std::io::Error>(Bytes::from(in_flight.to_string())) }
            })
            .await
            .unwrap();

        assert_eq!(body, Bytes::from_static(b"1"));
    }

    #[tokio::test]
    async fn invalidation_forces_refetch() {
        let cache = cache(Capacity::Entries(16));
        let calls = Arc::new(AtomicUsize::new(0));
        let raw = params(&[("iso", "de")]);

        cache.fetch("/v3/locations", &raw, counted(&calls, b"P")).await.unwrap();
        assert_eq!(cache.invalidate_prefix("/v3/locations"), 1);
        cache.fetch("/v3/locations", &raw, counted(&calls, b"P")).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_in_flight_during_invalidation_is_not_cached() {
        let cache = Arc::new(cache(Capacity::Entries(16)));
        let key = cache.key_for("/v3/countries", &params(&[])).unwrap();
        let ttl = Duration::from_secs(60);

        let pending = {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(&key, ttl, || async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok::<_, std::io::Error>(Bytes::from_static(b"before ingest"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.invalidate_prefix("/v3/countries");

        let stale = pending.await.unwrap().unwrap();
        assert_eq!(stale, Bytes::from_static(b"before ingest"));
        assert_eq!(cache.store().lookup(&key), Lookup::Miss);
    }
}
