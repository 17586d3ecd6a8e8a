use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;
use std::{
    future::Future,
    hash::Hash,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::{sync::watch, time::Instant};
use tracing::debug;

use crate::error::{StatsError, StatsResult};

/// Value stored for a key once its fetch completed. `None` remembers that the entity does not
/// exist upstream.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: Option<V>,
    pub inserted_at: Instant,
}

// A key is either being fetched by exactly one caller, or holds its last fetched value.
#[derive(Debug)]
enum Slot<V> {
    Pending(watch::Receiver<bool>),
    Ready(CacheEntry<V>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Lookup<V> {
    Hit(V),
    // Cached knowledge that the entity does not exist
    Absent,
    Miss,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

/// TTL cache where concurrent requests for the same key share a single fetch.
pub struct EntityCache<K, V> {
    name: &'static str,
    ttl: Duration,
    slots: DashMap<K, Slot<V>>,
    counters: Counters,
}

enum Step<V> {
    Done(Option<V>),
    Wait(watch::Receiver<bool>),
    Fetch(watch::Sender<bool>),
}

impl<K, V> EntityCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        EntityCache {
            name,
            ttl,
            slots: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &K) -> Lookup<V> {
        match self.slots.get(key).as_deref() {
            Some(Slot::Ready(entry)) if !self.is_expired(entry) => match &entry.value {
                Some(value) => Lookup::Hit(value.clone()),
                None => Lookup::Absent,
            },
            _ => Lookup::Miss,
        }
    }

    /// Store a value obtained by other means, e.g. a username learnt while resolving a uuid.
    /// Keys currently being fetched are left to their fetcher.
    pub fn insert(&self, key: K, value: Option<V>) {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
        };
        match self.slots.entry(key) {
            Entry::Occupied(mut occupied) => {
                if let Slot::Ready(_) = occupied.get() {
                    occupied.insert(Slot::Ready(entry));
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Ready(entry));
            }
        }
    }

    /// Reverse lookup: the first live key whose value satisfies `predicate`.
    ///
    /// This is a linear scan, only worth it when the alternative is an upstream call.
    pub fn find_key(&self, predicate: impl Fn(&V) -> bool) -> Option<K> {
        self.slots.iter().find_map(|item| match item.value() {
            Slot::Ready(CacheEntry {
                value: Some(value),
                inserted_at,
            }) if inserted_at.elapsed() < self.ttl && predicate(value) => Some(item.key().clone()),
            _ => None,
        })
    }

    /// Return the cached value for `key`, calling `fetch` on a miss.
    ///
    /// Only one caller per key runs `fetch` at any time, the others wait for it and read the
    /// value it stored. `Ok(None)` means the entity does not exist upstream; that answer is
    /// cached like a value. Any other failure is not cached: the next caller fetches again.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> StatsResult<Option<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StatsResult<Option<V>>>,
    {
        let sender = loop {
            match self.step(&key) {
                Step::Done(value) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Step::Wait(mut receiver) => {
                    self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    // Err means the fetcher gave up without a value, the slot is free again.
                    let _ = receiver.wait_for(|done| *done).await;
                }
                Step::Fetch(sender) => break sender,
            }
        };
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let guard = PendingGuard {
            cache: self,
            key: &key,
            sender: Some(sender),
        };

        let value = match fetch().await {
            Ok(value) => value,
            Err(StatsError::NotFound) => None,
            Err(e) => {
                debug!("{} cache: fetch failed, releasing key ({})", self.name, e);
                return Err(e);
            }
        };

        self.slots.insert(
            key.clone(),
            Slot::Ready(CacheEntry {
                value: value.clone(),
                inserted_at: Instant::now(),
            }),
        );
        guard.complete();

        Ok(value)
    }

    // Decide under the shard lock what this caller does next. The guard is released before any
    // await happens.
    fn step(&self, key: &K) -> Step<V> {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get() {
                Slot::Ready(entry) if !self.is_expired(entry) => Step::Done(entry.value.clone()),
                Slot::Pending(receiver) => Step::Wait(receiver.clone()),
                Slot::Ready(_) => {
                    let (sender, receiver) = watch::channel(false);
                    occupied.insert(Slot::Pending(receiver));
                    Step::Fetch(sender)
                }
            },
            Entry::Vacant(vacant) => {
                let (sender, receiver) = watch::channel(false);
                vacant.insert(Slot::Pending(receiver));
                Step::Fetch(sender)
            }
        }
    }

    /// Active expiry, removes every entry past its TTL. Returns the number of removed entries.
    pub fn sweep(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            Slot::Ready(entry) => entry.inserted_at.elapsed() < self.ttl,
            Slot::Pending(_) => true,
        });
        before.saturating_sub(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            entries: self.slots.len(),
        }
    }

    fn is_expired(&self, entry: &CacheEntry<V>) -> bool {
        entry.inserted_at.elapsed() >= self.ttl
    }
}

// Clears the pending marker if the fetch fails or its future is dropped, so that waiters
// retry instead of hanging on a key nobody fetches anymore.
struct PendingGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
{
    cache: &'a EntityCache<K, V>,
    key: &'a K,
    sender: Option<watch::Sender<bool>>,
}

impl<K, V> PendingGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
{
    fn complete(mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(true);
        }
    }
}

impl<K, V> Drop for PendingGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if self.sender.is_some() {
            self.cache
                .slots
                .remove_if(self.key, |_, slot| matches!(slot, Slot::Pending(_)));
            // Dropping the sender wakes every waiter with a closed channel.
            self.sender.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test]
    async fn concurrent_fetches_are_coalesced() {
        let cache = Arc::new(EntityCache::<String, u64>::new("test", Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_fetch("key".to_string(), || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(Some(42))
                        })
                        .await
                })
            })
            .collect::<Vec<_>>();

        for result in futures::future::join_all(tasks).await {
            assert_eq!(result.unwrap().unwrap(), Some(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached_and_waiters_retry() {
        let cache = Arc::new(EntityCache::<u32, u32>::new("test", Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let failing = {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(1, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err(StatsError::Transport("boom".to_string()))
                    })
                    .await
            })
        };
        // Let the first caller install its marker.
        tokio::time::sleep(Duration::from_millis(5)).await;

        let waiting = {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(1, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(Some(7))
                    })
                    .await
            })
        };

        assert!(failing.await.unwrap().is_err());
        assert_eq!(waiting.await.unwrap().unwrap(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get(&1), Lookup::Hit(7));
    }

    #[tokio::test]
    async fn not_found_is_cached_as_absent() {
        let cache = EntityCache::<u32, u32>::new("test", Duration::from_secs(60));
        let value = cache
            .get_or_fetch(1, || async { Err(StatsError::NotFound) })
            .await
            .unwrap();
        assert_eq!(value, None);
        assert_eq!(cache.get(&1), Lookup::Absent);

        // The negative answer is served without fetching again.
        let value = cache
            .get_or_fetch(1, || async { Ok(Some(1)) })
            .await
            .unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_their_ttl() {
        let cache = EntityCache::<u32, u32>::new("test", Duration::from_secs(10));
        cache.insert(1, Some(1));
        cache.insert(2, Some(2));
        assert_eq!(cache.get(&1), Lookup::Hit(1));

        tokio::time::advance(Duration::from_secs(11)).await;

        // Passive expiry on read, the entry is still stored until the sweep.
        assert_eq!(cache.get(&1), Lookup::Miss);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.sweep(), 2);
        assert!(cache.is_empty());

        let value = cache
            .get_or_fetch(1, || async { Ok(Some(10)) })
            .await
            .unwrap();
        assert_eq!(value, Some(10));
    }

    #[tokio::test]
    async fn reverse_lookup_ignores_expired_and_absent_entries() {
        let cache = EntityCache::<String, String>::new("test", Duration::from_secs(60));
        cache.insert("uuid-1".to_string(), Some("Notch".to_string()));
        cache.insert("uuid-2".to_string(), None);

        let found = cache.find_key(|name| name.eq_ignore_ascii_case("notch"));
        assert_eq!(found, Some("uuid-1".to_string()));
        assert_eq!(cache.find_key(|name| name == "jeb_"), None);
    }

    #[tokio::test]
    async fn insert_does_not_override_a_pending_fetch() {
        let cache = Arc::new(EntityCache::<u32, u32>::new("test", Duration::from_secs(60)));
        let fetching = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(1, || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Some(1))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.insert(1, Some(99));
        assert_eq!(fetching.await.unwrap().unwrap(), Some(1));
        assert_eq!(cache.get(&1), Lookup::Hit(1));
    }
}
