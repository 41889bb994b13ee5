//! # aqcache
//!
//! A bounded, fingerprint-keyed query-result cache with request coalescing, for the
//! read endpoints of an air-quality data API.
//!
//! Handlers hand the cache a request's endpoint and raw query parameters together
//! with a closure that runs the database query. Equivalent requests (same filters in
//! any order, casing or list ordering) share one cache entry, and concurrent misses on
//! the same request share one database round trip.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use aqcache::{CacheSettings, QueryCache, Sweeper};
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = Arc::new(QueryCache::new(CacheSettings::from_env()?));
//!     let _sweeper = Sweeper::from_settings(&cache);
//!
//!     let params = HashMap::from([("iso".to_owned(), "GB".to_owned())]);
//!     let page = cache
//!         .fetch("/v3/locations", &params, || async {
//!             Ok::<_, std::io::Error>(Bytes::from_static(b"{\"results\":[]}"))
//!         })
//!         .await?;
//!     println!("{} bytes", page.len());
//!     Ok(())
//! }
//! ```

// ── Core ──────────────────────────────────────────────────────────────────────
pub mod cache;
pub mod coalesce;
pub mod key;
pub mod store;

// ── Ambient: configuration, counters, housekeeping ───────────────────────────
pub mod background;
pub mod config;
pub mod metrics;

// ── Upstream seam ─────────────────────────────────────────────────────────────
pub mod database;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use background::Sweeper;
pub use cache::{BoxError, CacheError, QueryCache, UpstreamError};
pub use config::{CacheSettings, Capacity, ConfigError, EndpointSettings};
pub use database::{CachedQueries, QueryExecutor};
pub use key::{FingerprintKey, KeyError, ParamValue, SchemaRegistry, make_key};
pub use metrics::MetricsSnapshot;
pub use store::{EntryStore, Lookup};
