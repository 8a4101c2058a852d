//! Keyed single-flight for upstream fetches.
//!
//! The first caller for a key becomes the leader: its fetch is spawned onto
//! the runtime and the resulting handle is wrapped in a [`Shared`] future that
//! every later caller for the same key awaits instead of fetching again.
//!
//! The slot is released by a drop guard owned by the spawned task, so it is
//! removed exactly once however the fetch ends (value, error, panic). Because
//! the fetch runs on its own task, callers that go away (client disconnects,
//! timeouts) never cancel it; remaining waiters still receive the result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinError;
use tracing::{debug, error};

type SharedFetch<T> = Shared<BoxFuture<'static, T>>;
type Registry<T> = Arc<Mutex<HashMap<String, Slot<T>>>>;

struct Slot<T> {
    /// Distinguishes fetch cycles for the same key.
    id: u64,
    fetch: SharedFetch<T>,
    /// Callers that joined instead of leading.
    waiters: usize,
}

/// Which part a caller played in a [`Coalescer::fetch_or_join`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchRole {
    /// Started the fetch.
    Leader,
    /// Joined a fetch that was already running.
    Follower,
}

/// At most one in-flight fetch per key; every caller observes the same result.
pub struct Coalescer<T> {
    slots: Registry<T>,
    next_id: AtomicU64,
}

impl<T> Coalescer<T>
where
    T: Clone + Send + Sync + From<JoinError> + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Join the in-flight fetch for `key`, or start one with `fetch`.
    ///
    /// `fetch` is invoked only when this caller becomes the leader. A panic
    /// inside the fetch resolves to `T::from(JoinError)` for every waiter.
    pub async fn fetch_or_join<F, Fut>(&self, key: &str, fetch: F) -> (T, FetchRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (shared, role) = self.claim(key, fetch);
        (shared.await, role)
    }

    /// Number of keys with a fetch currently running.
    pub fn inflight(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Whether a fetch is currently running for `key`.
    pub fn is_inflight(&self, key: &str) -> bool {
        lock(&self.slots).contains_key(key)
    }

    fn claim<F, Fut>(&self, key: &str, fetch: F) -> (SharedFetch<T>, FetchRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        // Lookup and insert happen under one lock so two callers can never
        // both see an empty slot.
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get_mut(key) {
            slot.waiters += 1;
            debug!(key = key, waiters = slot.waiters, "Joining in-flight upstream fetch");
            return (slot.fetch.clone(), FetchRole::Follower);
        }

        // The release guard must not exist while `fetch` runs: if it panicked,
        // dropping the guard would relock `slots` on this thread.
        let fut = fetch();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let release = SlotRelease {
            slots: Arc::clone(&self.slots),
            key: key.to_owned(),
            id,
        };
        let task = tokio::spawn(async move {
            let _release = release;
            fut.await
        });
        let shared = async move {
            task.await.unwrap_or_else(|err| {
                error!(error = %err, "Upstream fetch task did not complete");
                T::from(err)
            })
        }
        .boxed()
        .shared();

        slots.insert(
            key.to_owned(),
            Slot {
                id,
                fetch: shared.clone(),
                waiters: 0,
            },
        );
        debug!(key = key, "Starting upstream fetch");
        (shared, FetchRole::Leader)
    }
}

impl<T> Default for Coalescer<T>
where
    T: Clone + Send + Sync + From<JoinError> + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes its slot from the registry when dropped.
struct SlotRelease<T> {
    slots: Registry<T>,
    key: String,
    id: u64,
}

impl<T> Drop for SlotRelease<T> {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        if slots.get(&self.key).is_some_and(|slot| slot.id == self.id) {
            if let Some(slot) = slots.remove(&self.key) {
                debug!(
                    key = %self.key,
                    waiters = slot.waiters,
                    "Released in-flight upstream fetch"
                );
            }
        }
    }
}

fn lock<T>(slots: &Mutex<HashMap<String, Slot<T>>>) -> MutexGuard<'_, HashMap<String, Slot<T>>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}
