//! Background tasks: periodic reclaim of expired cache entries.
//!
//! Expiry is enforced lazily on lookup, so the sweeper is optional. Without it an
//! expired entry still occupies capacity until it is looked up again or evicted. The
//! sweep runs under the store's own lock, exactly like an insert or an invalidation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::cache::QueryCache;

/// Handle to a running sweeper task. Dropping it stops the task.
pub struct Sweeper {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawns a task that purges expired entries from `cache` every `interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(cache: Arc<QueryCache>, interval: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing can have expired yet.
            ticker.tick().await;
            info!(?interval, "cache sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!(purged, "swept expired cache entries");
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("cache sweeper stopped");
        });

        Self {
            shutdown,
            task: Some(task),
        }
    }

    /// Spawns a sweeper if the cache's settings configure a sweep interval.
    pub fn from_settings(cache: &Arc<QueryCache>) -> Option<Self> {
        let interval = cache.settings().sweep_interval()?;
        Some(Self::spawn(Arc::clone(cache), interval))
    }

    /// Stops the sweeper and waits for its task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::config::{CacheSettings, Capacity};
    use crate::key::{FingerprintKey, ParamValue};

    #[tokio::test(start_paused = true)]
    async fn sweeper_reclaims_expired_entries() {
        let cache = Arc::new(QueryCache::new(CacheSettings {
            capacity: Capacity::Entries(8),
            ..CacheSettings::default()
        }));
        let key = FingerprintKey::new("/v3/owners", [("page", ParamValue::Number("1".into()))]);
        cache
            .store()
            .insert(key, Bytes::from_static(b"owners"), Duration::from_secs(5))
            .unwrap();

        let sweeper = Sweeper::spawn(Arc::clone(&cache), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(cache.store().is_empty());
        assert_eq!(cache.metrics().expirations, 1);
        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn sweeper_only_spawned_when_configured() {
        let cache = Arc::new(QueryCache::new(CacheSettings::default()));
        assert!(Sweeper::from_settings(&cache).is_none());

        let cache = Arc::new(QueryCache::new(CacheSettings {
            sweep_interval_secs: Some(60),
            ..CacheSettings::default()
        }));
        let sweeper = Sweeper::from_settings(&cache).unwrap();
        sweeper.shutdown().await;
    }
}
