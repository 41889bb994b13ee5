//! Request coalescing: at most one in-flight upstream fetch per key.
//!
//! The first caller to miss on a key becomes the leader: its fetch is spawned as an
//! independent tokio task and published in the pending table as a shared completion
//! future. Every later caller for the same key clones that future instead of starting
//! another fetch, so all of them observe the single outcome the task produces.
//!
//! Waiters can be dropped (cancelled, timed out) at any point without affecting the
//! task or the other waiters. The task removes its own pending record when it ends,
//! including when it panics, so a failed fetch is never remembered. The pending table
//! is only locked to publish or look up a record; the caller's `compute` runs outside
//! it and may itself use the coalescer.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cache::CacheError;
use crate::key::FingerprintKey;

type SharedFetch = Shared<BoxFuture<'static, Result<Bytes, CacheError>>>;

struct PendingFetch {
    id: u64,
    result: SharedFetch,
}

type PendingTable = Arc<Mutex<HashMap<FingerprintKey, PendingFetch>>>;

/// A caller's handle on a pending fetch.
///
/// Dropping a `Waiter` only abandons this caller's wait.
#[must_use = "a waiter does nothing unless awaited"]
pub struct Waiter {
    result: SharedFetch,
    leader: bool,
}

impl Waiter {
    /// `true` if this call started the fetch, `false` if it joined one in flight.
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Waits for the shared outcome.
    pub async fn wait(self) -> Result<Bytes, CacheError> {
        self.result.await
    }
}

// Removes the pending record when the fetch task finishes or unwinds.
struct PendingGuard {
    table: PendingTable,
    key: FingerprintKey,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        // The record may already have been detached and replaced by a newer fetch.
        if table.get(&self.key).is_some_and(|p| p.id == self.id) {
            table.remove(&self.key);
        }
    }
}

/// Table of in-flight fetches, keyed by request fingerprint.
#[derive(Default)]
pub struct Coalescer {
    pending: PendingTable,
    next_id: AtomicU64,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the in-flight fetch for `key`, or starts one by calling `compute` and
    /// spawning the future it returns.
    ///
    /// `compute` is only invoked when no fetch is in flight, and never while the
    /// pending table is locked. Outside a tokio runtime nothing can be spawned and the
    /// returned waiter resolves to [`CacheError::FetchAborted`].
    pub fn get_or_start<F, Fut>(&self, key: &FingerprintKey, compute: F) -> Waiter
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, CacheError>> + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            warn!(key = %key, "no tokio runtime available to run upstream fetch");
            return Waiter {
                result: future::ready(Err(CacheError::FetchAborted)).boxed().shared(),
                leader: true,
            };
        };

        let (done, outcome) = oneshot::channel::<Result<Bytes, CacheError>>();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task_key = key.clone();
        let result = outcome
            .map(move |received| {
                received.unwrap_or_else(|_| {
                    warn!(key = %task_key, "upstream fetch ended without a result");
                    Err(CacheError::FetchAborted)
                })
            })
            .boxed()
            .shared();

        {
            let mut table = self.pending.lock();
            if let Some(pending) = table.get(key) {
                debug!(key = %key, "joining in-flight fetch");
                return Waiter {
                    result: pending.result.clone(),
                    leader: false,
                };
            }
            table.insert(
                key.clone(),
                PendingFetch {
                    id,
                    result: result.clone(),
                },
            );
        }

        // From here the record is published; the guard removes it however this ends,
        // and dropping `done` unanswered resolves the waiters as aborted.
        let guard = PendingGuard {
            table: Arc::clone(&self.pending),
            key: key.clone(),
            id,
        };
        let fetch = compute();
        runtime.spawn(async move {
            let outcome = fetch.await;
            drop(guard);
            let _ = done.send(outcome);
        });
        debug!(key = %key, "started upstream fetch");

        Waiter {
            result,
            leader: true,
        }
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns `true` if a fetch for `key` is in flight.
    pub fn is_pending(&self, key: &FingerprintKey) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Forgets the in-flight fetch for `key` without cancelling it. Its current
    /// waiters still get its result; later callers start a fresh fetch.
    pub fn detach(&self, key: &FingerprintKey) -> bool {
        self.pending.lock().remove(key).is_some()
    }

    /// [`detach`](Self::detach) for every in-flight fetch under an endpoint prefix.
    pub fn detach_prefix(&self, prefix: &str) -> usize {
        let mut table = self.pending.lock();
        let before = table.len();
        table.retain(|key, _| !key.matches_prefix(prefix));
        before - table.len()
    }
}
