//! Keyed fixed-window counters with passive expiry.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::clock::Clock;

/// The request count attributed to one key within its current window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterEntry {
    pub key: String,
    pub count: u64,
    pub window_start: DateTime<Utc>,
    pub reset_at: DateTime<Utc>,
}

impl CounterEntry {
    fn fresh(key: &str, now: DateTime<Utc>, window: Duration) -> Self {
        let reset_at = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| now.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            key: key.to_string(),
            count: 1,
            window_start: now,
            reset_at,
        }
    }

    /// An entry is expired from its `reset_at` onwards.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }

    /// Time left in the window, zero once expired.
    pub fn duration_until_reset(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Epoch seconds of the window reset.
    pub fn reset_epoch_secs(&self) -> i64 {
        self.reset_at.timestamp()
    }
}

/// Key counts reported for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    /// Entries physically held, expired or not.
    pub total_keys: usize,
    /// Entries whose window has not yet elapsed.
    pub active_keys: usize,
}

struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Holds one counter entry per admission key.
///
/// Every operation is synchronous and goes through the map's shard lock for
/// the key, so two concurrent increments of the same key are serialized:
/// exactly one creates the entry and the other increments it.
///
/// Expired entries are treated as absent on every read. The optional
/// background sweeper only reclaims memory.
pub struct CounterStore {
    name: String,
    counters: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl CounterStore {
    /// Create a store without a background sweeper.
    pub fn new(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            counters: DashMap::new(),
            clock,
            sweeper: Mutex::new(None),
        }
    }

    /// Create a store and spawn its sweeper on the current tokio runtime.
    pub fn start(
        name: impl Into<String>,
        clock: Arc<dyn Clock>,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        let store = Arc::new(Self::new(name, clock));
        store.spawn_sweeper(sweep_interval);
        store
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Return the live entry for `key`, evicting it if its window has passed.
    pub fn get(&self, key: &str) -> Option<CounterEntry> {
        let now = self.clock.now();
        if self
            .counters
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some()
        {
            trace!(store = %self.name, key = %key, "Evicted expired counter on read");
            return None;
        }
        self.counters.get(key).map(|entry| entry.value().clone())
    }

    /// Count one request against `key`.
    ///
    /// Starts a new window of length `window` when no live entry exists;
    /// otherwise bumps the count and leaves `reset_at` unchanged.
    pub fn increment(&self, key: &str, window: Duration) -> CounterEntry {
        let now = self.clock.now();

        let entry = match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                let entry = occupied.get_mut();
                entry.count += 1;
                entry.clone()
            }
            Entry::Occupied(mut occupied) => {
                let entry = CounterEntry::fresh(key, now, window);
                occupied.insert(entry.clone());
                entry
            }
            Entry::Vacant(vacant) => {
                let entry = CounterEntry::fresh(key, now, window);
                vacant.insert(entry.clone());
                entry
            }
        };

        trace!(
            store = %self.name,
            key = %key,
            count = entry.count,
            "Incremented counter"
        );
        entry
    }

    /// Take one request back from `key`, floored at zero.
    ///
    /// Only applies to a live entry; an expired or evicted entry is left
    /// alone so that a late decrement never resurrects it.
    pub fn decrement(&self, key: &str) -> Option<CounterEntry> {
        let now = self.clock.now();
        let mut entry = self.counters.get_mut(key)?;
        if entry.is_expired(now) {
            return None;
        }
        entry.count = entry.count.saturating_sub(1);
        Some(entry.clone())
    }

    /// Evict one key. Returns whether an entry was present.
    pub fn reset(&self, key: &str) -> bool {
        self.counters.remove(key).is_some()
    }

    /// Evict every key.
    pub fn reset_all(&self) {
        self.counters.clear();
    }

    pub fn stats(&self) -> StoreStats {
        let now = self.clock.now();
        let mut stats = StoreStats::default();
        for entry in self.counters.iter() {
            stats.total_keys += 1;
            if !entry.is_expired(now) {
                stats.active_keys += 1;
            }
        }
        stats
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    /// Spawn the periodic sweep task. Replaces (and stops) any previous one.
    ///
    /// The task holds only a weak reference, so it also ends once the store
    /// is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let store: Weak<Self> = Arc::downgrade(self);
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else { break };
                        let removed = store.sweep();
                        if removed > 0 {
                            debug!(store = %name, removed, "Swept expired counters");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!(store = %name, "Counter sweeper stopped");
        });

        info!(store = %self.name, interval_secs = interval.as_secs(), "Counter sweeper started");
        if let Some(previous) = self.sweeper.lock().replace(Sweeper { shutdown, handle }) {
            let _ = previous.shutdown.send(true);
        }
    }

    /// Whether a sweeper task is currently attached.
    pub fn has_sweeper(&self) -> bool {
        self.sweeper.lock().is_some()
    }

    /// Stop the sweeper and wait for it to finish.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.shutdown.send(true);
            let _ = sweeper.handle.await;
        }
    }
}

impl std::fmt::Debug for CounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterStore")
            .field("name", &self.name)
            .field("keys", &self.counters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::MockClock;

    const WINDOW: Duration = Duration::from_secs(60);

    fn store() -> (CounterStore, MockClock) {
        let clock = MockClock::default();
        (CounterStore::new("test", Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_increment_counts_within_window() {
        let (store, _clock) = store();

        for n in 1..=7 {
            let entry = store.increment("k", WINDOW);
            assert_eq!(entry.count, n);
        }
        assert_eq!(store.get("k").unwrap().count, 7);
    }

    #[test]
    fn test_reset_at_fixed_by_first_increment() {
        let (store, clock) = store();

        let first = store.increment("k", WINDOW);
        clock.advance(Duration::from_secs(30));
        let second = store.increment("k", WINDOW);

        assert_eq!(first.reset_at, second.reset_at);
        assert_eq!(first.window_start, second.window_start);
    }

    #[test]
    fn test_window_elapse_restarts_count() {
        let (store, clock) = store();

        store.increment("k", WINDOW);
        store.increment("k", WINDOW);
        clock.advance(WINDOW);

        let entry = store.increment("k", WINDOW);
        assert_eq!(entry.count, 1);
        assert_eq!(entry.window_start, clock.now());
    }

    #[test]
    fn test_get_evicts_expired_entry() {
        let (store, clock) = store();

        store.increment("k", WINDOW);
        clock.advance(WINDOW + Duration::from_secs(1));

        assert_eq!(store.stats().total_keys, 1);
        assert!(store.get("k").is_none());
        assert_eq!(store.stats().total_keys, 0);
    }

    #[test]
    fn test_decrement_floors_at_zero() {
        let (store, _clock) = store();

        store.increment("k", WINDOW);
        assert_eq!(store.decrement("k").unwrap().count, 0);
        assert_eq!(store.decrement("k").unwrap().count, 0);
    }

    #[test]
    fn test_decrement_never_resurrects() {
        let (store, clock) = store();

        assert!(store.decrement("missing").is_none());
        assert!(store.get("missing").is_none());

        store.increment("k", WINDOW);
        store.increment("k", WINDOW);
        clock.advance(WINDOW);
        assert!(store.decrement("k").is_none());

        // A fresh window starts at one, untouched by the late decrement.
        assert_eq!(store.increment("k", WINDOW).count, 1);
    }

    #[test]
    fn test_reset_and_reset_all() {
        let (store, _clock) = store();

        store.increment("a", WINDOW);
        store.increment("b", WINDOW);
        assert!(store.reset("a"));
        assert!(!store.reset("a"));
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_some());

        store.reset_all();
        assert_eq!(store.stats(), StoreStats::default());
    }

    #[test]
    fn test_stats_and_sweep() {
        let (store, clock) = store();

        store.increment("short", Duration::from_secs(10));
        store.increment("long", WINDOW);
        clock.advance(Duration::from_secs(10));

        assert_eq!(
            store.stats(),
            StoreStats {
                total_keys: 2,
                active_keys: 1
            }
        );
        assert_eq!(store.sweep(), 1);
        assert_eq!(
            store.stats(),
            StoreStats {
                total_keys: 1,
                active_keys: 1
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_single_creator() {
        let clock = MockClock::default();
        let store = Arc::new(CounterStore::new("test", Arc::new(clock)));

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.increment("shared", WINDOW).count })
            })
            .collect();

        let mut counts = Vec::new();
        for result in futures::future::join_all(tasks).await {
            counts.push(result.unwrap());
        }
        counts.sort_unstable();

        assert_eq!(counts, (1..=200).collect::<Vec<u64>>());
        assert_eq!(store.get("shared").unwrap().count, 200);
    }

    #[tokio::test]
    async fn test_sweeper_reclaims_and_shuts_down() {
        let clock = MockClock::default();
        let store = CounterStore::start("test", Arc::new(clock.clone()), Duration::from_millis(10));
        assert!(store.has_sweeper());

        store.increment("k", WINDOW);
        clock.advance(WINDOW);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.stats().total_keys, 0);

        store.shutdown().await;
        assert!(!store.has_sweeper());
    }
}
