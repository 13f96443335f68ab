//! In-process result cache

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

use super::{CacheStats, ResultCache};
use crate::error::Result;
use crate::models::{LookupOutcome, PhoneNumber, Provider};
use crate::utils::{Clock, SystemClock};

#[derive(Debug, Clone)]
struct Entry {
    outcome: LookupOutcome,
    inserted_at: DateTime<Utc>,
    ttl: chrono::Duration,
}

impl Entry {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.inserted_at < self.ttl
    }
}

type Key = (PhoneNumber, Provider);

/// HashMap-backed cache with an injectable clock
pub struct MemoryCache {
    entries: RwLock<HashMap<Key, Entry>>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Entries currently stored, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn miss(&self) -> Result<Option<LookupOutcome>> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, number: &PhoneNumber, provider: Provider) -> Result<Option<LookupOutcome>> {
        let key = (number.clone(), provider);
        let now = self.clock.now();

        let expired = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(&key) {
                Some(entry) if entry.is_fresh(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(entry.outcome.clone()));
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            // A writer may have refreshed it in between
            if entries.get(&key).is_some_and(|e| !e.is_fresh(now)) {
                entries.remove(&key);
                debug!(number = %number, provider = %provider, "Evicted expired cache entry");
            }
        }

        self.miss()
    }

    async fn put(
        &self,
        number: &PhoneNumber,
        provider: Provider,
        outcome: &LookupOutcome,
        ttl: Duration,
    ) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let entry = Entry {
            outcome: outcome.clone(),
            inserted_at: self.clock.now(),
            ttl,
        };
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((number.clone(), provider), entry);
        Ok(())
    }

    async fn invalidate_all(&self) -> Result<u64> {
        let removed = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let removed = entries.len() as u64;
            entries.clear();
            removed
        };
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        debug!(removed, "Cache invalidated");
        Ok(removed)
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
