//! In-process counter store.
//!
//! Each operation holds one DashMap shard lock for the duration of a map
//! access and never across an await. Expiry uses `tokio::time::Instant` so
//! tests can drive windows with `tokio::time::pause` and `advance`.
//!
//! Only suitable for a single process. Use [`RedisStore`](super::RedisStore)
//! when several instances share a limit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::{Counter, CounterStore, StoreError};

/// Sweep expired entries after this many counter creations.
const PURGE_EVERY: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: i64,
    expires_at: Instant,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime rounded up to whole seconds.
    fn ttl_secs(&self, now: Instant) -> u64 {
        let left = self.expires_at.saturating_duration_since(now);
        left.as_secs() + u64::from(left.subsec_nanos() > 0)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    created: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live and not-yet-purged counters.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop every expired counter. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        before.saturating_sub(self.slots.len())
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn init_with_expiry(
        &self,
        key: &str,
        initial: i64,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let fresh = Slot {
            value: initial,
            expires_at: now + ttl,
        };

        let created = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_expired(now) => {
                occupied.insert(fresh);
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        };

        if created && self.created.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1
        {
            self.purge_expired();
        }

        Ok(created)
    }

    async fn decrement_existing(&self, key: &str) -> Result<Option<Counter>, StoreError> {
        let now = Instant::now();

        if let Some(mut slot) = self.slots.get_mut(key)
            && !slot.is_expired(now)
        {
            slot.value -= 1;
            return Ok(Some(Counter {
                value: slot.value,
                ttl_secs: slot.ttl_secs(now),
            }));
        }

        self.slots.remove_if(key, |_, slot| slot.is_expired(now));
        Ok(None)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
