/// Short-TTL cache in front of the `can_attempt` decision
///
/// The cache is a latency optimisation only. The registry invalidates a key
/// before returning from every mutation, and any cache error degrades to an
/// uncached read from the store.
use crate::clock::Clock;
use crate::GuardianResult;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Cache collaborator for boolean breaker decisions
#[cfg_attr(test, mockall::automock)]
pub trait StateCache: Send + Sync {
    fn get(&self, key: &str) -> GuardianResult<Option<bool>>;

    fn set(&self, key: &str, value: bool, ttl: Duration) -> GuardianResult<()>;

    fn invalidate(&self, key: &str) -> GuardianResult<()>;
}

/// In-process TTL cache
pub struct TtlStateCache {
    entries: DashMap<String, (bool, DateTime<Utc>)>,
    clock: Arc<dyn Clock>,
}

impl TtlStateCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl StateCache for TtlStateCache {
    fn get(&self, key: &str) -> GuardianResult<Option<bool>> {
        let now = self.clock.now();

        // Evict on read so an expired entry never answers
        self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);

        Ok(self.entries.get(key).map(|entry| entry.value().0))
    }

    fn set(&self, key: &str, value: bool, ttl: Duration) -> GuardianResult<()> {
        if ttl <= Duration::zero() {
            return Ok(());
        }
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    fn invalidate(&self, key: &str) -> GuardianResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Cache that never stores anything; every read goes to the store
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledCache;

impl StateCache for DisabledCache {
    fn get(&self, _key: &str) -> GuardianResult<Option<bool>> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: bool, _ttl: Duration) -> GuardianResult<()> {
        Ok(())
    }

    fn invalidate(&self, _key: &str) -> GuardianResult<()> {
        Ok(())
    }
}
