use crate::services::logger::Logger;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

type EntryMap<V> = RwLock<HashMap<String, Entry<V>>>;

#[derive(Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
}

/// Thread-safe key/value store with per-entry expiry.
///
/// A sweeper thread owned by the cache wakes every `cleanup_interval` and drops
/// entries whose deadline has passed. `get` never mutates: expired entries are
/// reported as missing and reclaimed by the next sweep. If the thread cannot be
/// started, every write purges expired entries instead.
pub struct TtlCache<V> {
    entries: Arc<EntryMap<V>>,
    stats: Arc<CacheStats>,
    default_ttl: Duration,
    stop_tx: Mutex<Option<Sender<()>>>,
    stopped: AtomicBool,
    inline_sweep: AtomicBool,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(default_ttl: Duration, cleanup_interval: Duration) -> Self {
        let cache = Self::detached(default_ttl);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let tick = if cleanup_interval.is_zero() {
            Duration::from_millis(1)
        } else {
            cleanup_interval
        };

        match spawn_sweeper(
            Arc::downgrade(&cache.entries),
            Arc::downgrade(&cache.stats),
            stop_rx,
            tick,
        ) {
            Ok(()) => {
                *cache.stop_tx.lock().unwrap_or_else(|err| err.into_inner()) = Some(stop_tx);
                cache.inline_sweep.store(false, Ordering::SeqCst);
            }
            Err(err) => {
                Logger::new("cache").warn(
                    "Sweeper thread failed to start, expired entries are purged on write",
                    Some(&serde_json::json!({ "error": err.to_string() })),
                );
            }
        }
        cache
    }

    /// A cache without a sweeper thread.
    fn detached(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(CacheStats::default()),
            default_ttl,
            stop_tx: Mutex::new(None),
            stopped: AtomicBool::new(false),
            inline_sweep: AtomicBool::new(true),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let guard = self.entries.read().unwrap_or_else(|err| err.into_inner());
        match guard.get(key) {
            Some(entry) if !entry.is_expired(Instant::now()) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        let mut guard = self.entries.write().unwrap_or_else(|err| err.into_inner());
        if self.inline_sweep.load(Ordering::Relaxed) {
            let now = Instant::now();
            let before = guard.len();
            guard.retain(|_, entry| entry.expires_at > now);
            self.stats
                .evictions
                .fetch_add((before - guard.len()) as u64, Ordering::Relaxed);
        }
        guard.insert(key.into(), entry);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delete(&self, key: &str) {
        let mut guard = self.entries.write().unwrap_or_else(|err| err.into_inner());
        guard.remove(key);
    }

    /// Removes every key that literally starts with `prefix`. Returns the number removed.
    pub fn delete_by_prefix(&self, prefix: &str) -> usize {
        let mut guard = self.entries.write().unwrap_or_else(|err| err.into_inner());
        let before = guard.len();
        guard.retain(|key, _| !key.starts_with(prefix));
        before - guard.len()
    }

    pub fn clear(&self) {
        let mut guard = self.entries.write().unwrap_or_else(|err| err.into_inner());
        guard.clear();
    }

    /// Entry count, including expired entries not yet swept.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Stops the sweeper. Safe to call any number of times.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let sender = self
            .stop_tx
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "entries": self.len(),
            "hits": self.stats.hits.load(Ordering::Relaxed),
            "misses": self.stats.misses.load(Ordering::Relaxed),
            "writes": self.stats.writes.load(Ordering::Relaxed),
            "evictions": self.stats.evictions.load(Ordering::Relaxed),
            "sweeper": if self.inline_sweep.load(Ordering::Relaxed) { "inline" } else { "thread" },
        })
    }
}

impl<V> Drop for TtlCache<V> {
    fn drop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.stop_tx.lock() {
            if let Some(sender) = guard.take() {
                let _ = sender.send(());
            }
        }
    }
}

fn spawn_sweeper<V>(
    entries: Weak<EntryMap<V>>,
    stats: Weak<CacheStats>,
    stop_rx: Receiver<()>,
    tick: Duration,
) -> std::io::Result<()>
where
    V: Send + Sync + 'static,
{
    std::thread::Builder::new()
        .name("opsgate-cache-sweeper".to_string())
        .spawn(move || loop {
            match stop_rx.recv_timeout(tick) {
                Err(RecvTimeoutError::Timeout) => {
                    if !sweep(&entries, &stats) {
                        return;
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        })
        .map(drop)
}

fn sweep<V>(entries: &Weak<EntryMap<V>>, stats: &Weak<CacheStats>) -> bool {
    let Some(entries) = entries.upgrade() else {
        return false;
    };
    let now = Instant::now();
    let mut guard = entries.write().unwrap_or_else(|err| err.into_inner());
    let before = guard.len();
    guard.retain(|_, entry| entry.expires_at > now);
    let evicted = (before - guard.len()) as u64;
    if let Some(stats) = stats.upgrade() {
        stats.evictions.fetch_add(evicted, Ordering::Relaxed);
    }
    true
}
