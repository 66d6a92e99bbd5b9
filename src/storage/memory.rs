//! Process-local storage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{LimiterRecord, Storage, StorageError, StorageResult};
use crate::clock::{add_duration, Clock, SystemClock};

/// In-memory storage for a single limiter process.
///
/// Counters and blocks live in sharded concurrent maps, so an increment only
/// locks the shard holding its key. Every read compares against the recorded
/// expiry; the optional sweeper only reclaims memory.
pub struct MemoryStorage {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    counters: DashMap<String, LimiterRecord>,
    blocks: DashMap<String, DateTime<Utc>>,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl Inner {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len() + self.blocks.len();

        self.counters.retain(|_, record| record.is_live(now));
        self.blocks.retain(|_, until| now < *until);

        before.saturating_sub(self.counters.len() + self.blocks.len())
    }
}

impl MemoryStorage {
    /// Create an empty store on the system clock, without a sweeper.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: DashMap::new(),
                blocks: DashMap::new(),
                clock,
                closed: AtomicBool::new(false),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Start a background task removing lapsed entries every `interval`.
    ///
    /// Must be called from within a tokio runtime. Replaces any running sweeper.
    pub fn start_sweeper(&self, interval: Duration) {
        // tokio intervals reject a zero period
        let interval = interval.max(Duration::from_millis(1));
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(sweep(weak, interval));

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
        debug!(interval_ms = interval.as_millis() as u64, "Memory storage sweeper started");
    }

    /// Remove every lapsed counter and block now, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// Number of physically present counters and blocks, lapsed or not.
    pub fn entry_count(&self) -> usize {
        self.inner.counters.len() + self.inner.blocks.len()
    }

    fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("counters", &self.inner.counters.len())
            .field("blocks", &self.inner.blocks.len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

async fn sweep(inner: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let removed = inner.purge_expired();
        if removed > 0 {
            trace!(removed = removed, "Swept lapsed entries");
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<LimiterRecord>> {
        self.inner.ensure_open()?;
        let now = self.inner.clock.now();

        Ok(self
            .inner
            .counters
            .get(key)
            .map(|record| *record)
            .filter(|record| record.is_live(now)))
    }

    async fn increment(&self, key: &str, window: Duration) -> StorageResult<u64> {
        self.inner.ensure_open()?;
        let now = self.inner.clock.now();
        let fresh = LimiterRecord {
            count: 0,
            window_expiry: add_duration(now, window),
        };

        // the entry guard holds the shard lock for the whole read-modify-write
        let mut record = self.inner.counters.entry(key.to_owned()).or_insert(fresh);
        if !record.is_live(now) {
            *record = fresh;
        }
        record.count += 1;

        Ok(record.count)
    }

    async fn set_block(&self, key: &str, blocked_until: DateTime<Utc>) -> StorageResult<()> {
        self.inner.ensure_open()?;
        if blocked_until <= self.inner.clock.now() {
            return Ok(());
        }

        self.inner.blocks.insert(key.to_owned(), blocked_until);
        Ok(())
    }

    async fn is_blocked(&self, key: &str) -> StorageResult<Option<DateTime<Utc>>> {
        self.inner.ensure_open()?;
        let now = self.inner.clock.now();

        let until = match self.inner.blocks.get(key) {
            Some(until) => *until,
            None => return Ok(None),
        };

        if now < until {
            Ok(Some(until))
        } else {
            self.inner.blocks.remove_if(key, |_, until| *until <= now);
            Ok(None)
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.ensure_open()?;
        self.inner.counters.remove(key);
        self.inner.blocks.remove(key);
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.stop_sweeper();
            self.inner.counters.clear();
            self.inner.blocks.clear();
            debug!("Memory storage closed");
        }
        Ok(())
    }
}
