use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::metrics::TRACKED_KEYS;

// fixed-window counter for one throttle key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRecord {
    pub window_start: DateTime<Utc>,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Increment {
    pub record: WindowRecord,
    pub admitted: bool,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    // lapsed records read as absent
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<WindowRecord>, StoreError>;

    // atomic per key: fresh window if absent/lapsed, else +1 while under limit,
    // else untouched with admitted = false. expires `window` after window_start
    async fn increment_or_init(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Increment, StoreError>;
}

pub(crate) fn window_end(start: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let span = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
    start.checked_add_signed(span).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Copy)]
struct StoredRecord {
    record: WindowRecord,
    expires_at: DateTime<Utc>,
}

impl StoredRecord {
    fn fresh(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            record: WindowRecord {
                window_start: now,
                count: 1,
            },
            expires_at: window_end(now, window),
        }
    }

    // a clock stepping backwards past window_start also ends the window
    fn lapsed(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at || now < self.record.window_start
    }
}

// Sharded map; the per-key entry guard makes each read-modify-write atomic
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, StoredRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    // returns how many went
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, stored| !stored.lapsed(now));
        before.saturating_sub(self.records.len())
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<WindowRecord>, StoreError> {
        Ok(self
            .records
            .get(key)
            .filter(|stored| !stored.lapsed(now))
            .map(|stored| stored.record))
    }

    async fn increment_or_init(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Increment, StoreError> {
        let outcome = match self.records.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                let stored = slot.insert(StoredRecord::fresh(now, window));
                Increment {
                    record: stored.record,
                    admitted: true,
                }
            }
            Entry::Occupied(mut slot) => {
                let stored = slot.get_mut();
                let admitted = if stored.lapsed(now) {
                    *stored = StoredRecord::fresh(now, window);
                    true
                } else if stored.record.count < limit {
                    stored.record.count += 1;
                    true
                } else {
                    false
                };
                Increment {
                    record: stored.record,
                    admitted,
                }
            }
        };
        Ok(outcome)
    }
}

// Background eviction of lapsed records - runs every `every`
pub async fn sweeper(store: Arc<MemoryStore>, clock: Arc<dyn Clock>, every: Duration) {
    let mut ticker = interval(every);

    tracing::info!("store sweeper started (interval: {:?})", every);

    loop {
        ticker.tick().await;

        let evicted = store.purge_expired(clock.now());
        TRACKED_KEYS.set(store.len() as f64);
        if evicted > 0 {
            tracing::debug!(evicted, remaining = store.len(), "evicted lapsed throttle records");
        }
    }
}
