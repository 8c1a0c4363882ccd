use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use crate::error::RunError;

/// Key-value, queue, log and pub/sub operations the run core needs from its
/// shared store. Every method that the lock or sequence invariants depend on
/// is atomic with respect to every other call on the same store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Sets `key` only when it is absent or expired. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<bool>;

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()>;

    /// Resets the expiry of `key` only while it still holds `expected`.
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Deletes `key` only while it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> anyhow::Result<bool>;

    async fn delete(&self, key: &str) -> anyhow::Result<bool>;

    /// Sets the expiry of a plain key or a stream log.
    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool>;

    async fn queue_push(&self, queue: &str, value: &str) -> anyhow::Result<()>;

    /// Pops the oldest entry, waiting up to `wait` for one to arrive.
    async fn queue_pop(&self, queue: &str, wait: Duration) -> anyhow::Result<Option<String>>;

    async fn queue_len(&self, queue: &str) -> anyhow::Result<usize>;

    /// Appends to a sequenced log and returns the assigned sequence. Sequences
    /// start at 0 and keep counting after old entries are trimmed to `max_len`.
    async fn stream_append(
        &self,
        key: &str,
        payload: &str,
        max_len: usize,
        ttl: Duration,
    ) -> anyhow::Result<u64>;

    /// Entries with sequence strictly greater than `after` (all when `None`).
    async fn stream_range(
        &self,
        key: &str,
        after: Option<u64>,
        limit: usize,
    ) -> anyhow::Result<Vec<(u64, String)>>;

    /// Returns the number of live subscribers that received the message.
    async fn publish(&self, channel: &str, message: &str) -> anyhow::Result<usize>;

    async fn subscribe(&self, channel: &str) -> anyhow::Result<broadcast::Receiver<String>>;

    async fn purge_expired(&self) -> anyhow::Result<usize>;
}

const CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct StreamLog {
    next_seq: u64,
    entries: VecDeque<(u64, String)>,
    expires_at: Option<Instant>,
}

impl StreamLog {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    kv: HashMap<String, Entry>,
    queues: HashMap<String, VecDeque<String>>,
    streams: HashMap<String, StreamLog>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl Inner {
    fn live_entry(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        if self.kv.get(key).is_some_and(|e| !e.is_live(now)) {
            self.kv.remove(key);
        }
        self.kv.get_mut(key)
    }
}

/// In-process `SharedStore`. Expiry uses tokio's clock so paused-time tests
/// drive TTLs deterministically.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    queue_notify: Notify,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("memory store unavailable");
        }
        Ok(())
    }

    fn try_pop(&self, queue: &str) -> Option<String> {
        self.inner
            .lock()
            .queues
            .get_mut(queue)
            .and_then(VecDeque::pop_front)
    }
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.live_entry(key, now).is_some() {
            return Ok(false);
        }
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: deadline(ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .inner
            .lock()
            .live_entry(key, now)
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()> {
        self.check_available()?;
        self.inner.lock().kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> anyhow::Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.live_entry(key, now) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> anyhow::Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let matches = inner
            .live_entry(key, now)
            .is_some_and(|entry| entry.value == expected);
        if matches {
            inner.kv.remove(key);
        }
        Ok(matches)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let removed_kv = inner.kv.remove(key).is_some();
        let removed_stream = inner.streams.remove(key).is_some();
        Ok(removed_kv || removed_stream)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.live_entry(key, now) {
            entry.expires_at = Some(now + ttl);
            return Ok(true);
        }
        match inner.streams.get_mut(key) {
            Some(log) if log.is_live(now) => {
                log.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn queue_push(&self, queue: &str, value: &str) -> anyhow::Result<()> {
        self.check_available()?;
        self.inner
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(value.to_string());
        self.queue_notify.notify_waiters();
        Ok(())
    }

    async fn queue_pop(&self, queue: &str, wait: Duration) -> anyhow::Result<Option<String>> {
        let until = Instant::now() + wait;
        loop {
            self.check_available()?;
            let notified = self.queue_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(queue) {
                return Ok(Some(value));
            }
            if Instant::now() >= until {
                return Ok(None);
            }
            if tokio::time::timeout_at(until, notified).await.is_err() {
                return Ok(self.try_pop(queue));
            }
        }
    }

    async fn queue_len(&self, queue: &str) -> anyhow::Result<usize> {
        self.check_available()?;
        Ok(self.inner.lock().queues.get(queue).map_or(0, VecDeque::len))
    }

    async fn stream_append(
        &self,
        key: &str,
        payload: &str,
        max_len: usize,
        ttl: Duration,
    ) -> anyhow::Result<u64> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.streams.get(key).is_some_and(|log| !log.is_live(now)) {
            inner.streams.remove(key);
        }
        let log = inner.streams.entry(key.to_string()).or_default();
        let seq = log.next_seq;
        log.next_seq += 1;
        log.entries.push_back((seq, payload.to_string()));
        while max_len > 0 && log.entries.len() > max_len {
            log.entries.pop_front();
        }
        log.expires_at = Some(now + ttl);
        Ok(seq)
    }

    async fn stream_range(
        &self,
        key: &str,
        after: Option<u64>,
        limit: usize,
    ) -> anyhow::Result<Vec<(u64, String)>> {
        self.check_available()?;
        let now = Instant::now();
        let inner = self.inner.lock();
        let Some(log) = inner.streams.get(key).filter(|log| log.is_live(now)) else {
            return Ok(Vec::new());
        };
        Ok(log
            .entries
            .iter()
            .filter(|(seq, _)| after.map_or(true, |after| *seq > after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn publish(&self, channel: &str, message: &str) -> anyhow::Result<usize> {
        self.check_available()?;
        let inner = self.inner.lock();
        let Some(tx) = inner.channels.get(channel) else {
            return Ok(0);
        };
        Ok(tx.send(message.to_string()).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<broadcast::Receiver<String>> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let tx = inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(tx.subscribe())
    }

    async fn purge_expired(&self) -> anyhow::Result<usize> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.kv.len() + inner.streams.len() + inner.channels.len();
        inner.kv.retain(|_, entry| entry.is_live(now));
        inner.streams.retain(|_, log| log.is_live(now));
        inner.channels.retain(|_, tx| tx.receiver_count() > 0);
        let after = inner.kv.len() + inner.streams.len() + inner.channels.len();
        Ok(before - after)
    }
}

pub(crate) const STORE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Runs a store operation up to `attempts` times before surfacing
/// `TransientInfra`.
pub(crate) async fn retry_store<T, F, Fut>(attempts: u32, what: &str, mut op: F) -> Result<T, RunError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::warn!(op = what, attempt, attempts, error = %err, "store operation failed");
                last_err = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(STORE_RETRY_DELAY).await;
                }
            }
        }
    }
    let detail = last_err.map(|e| e.to_string()).unwrap_or_default();
    Err(RunError::TransientInfra(format!("{what}: {detail}")))
}
