use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::job::JobId;
use crate::params::Fingerprint;

/// Pointer from a parameter fingerprint to a completed job whose result
/// may be reused. Entries are opaque pointers, not accumulators, so
/// conflicting writes are simply last-write-wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub source_job_id: JobId,
    pub created_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Content-addressed result cache with TTL expiry.
///
/// The backing store enforces expiry itself; the orchestrator never polls.
/// A failing cache must degrade to a miss, never fail the job, so every
/// method returns a `CacheError` the caller is expected to swallow.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn lookup(&self, fp: &Fingerprint) -> Result<Option<CacheEntry>, CacheError>;

    async fn store(
        &self,
        fp: &Fingerprint,
        source_job_id: JobId,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn invalidate(&self, fp: &Fingerprint) -> Result<(), CacheError>;
}

struct StoredEntry {
    entry: CacheEntry,
    expires_at: Instant,
}

/// In-memory cache. Expired entries are dropped lazily on lookup, which
/// keeps `lookup` the only place that needs to know about time.
#[derive(Default)]
pub struct MemoryResultCache {
    entries: Mutex<HashMap<Fingerprint, StoredEntry>>,
}

impl MemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries, for tests and diagnostics.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn lookup(&self, fp: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        let mut entries = self.entries.lock().await;
        match entries.get(fp) {
            Some(stored) if stored.expires_at > Instant::now() => Ok(Some(stored.entry.clone())),
            Some(_) => {
                entries.remove(fp);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn store(
        &self,
        fp: &Fingerprint,
        source_job_id: JobId,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let stored = StoredEntry {
            entry: CacheEntry {
                source_job_id,
                created_at: Utc::now(),
            },
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().await.insert(*fp, stored);
        Ok(())
    }

    async fn invalidate(&self, fp: &Fingerprint) -> Result<(), CacheError> {
        self.entries.lock().await.remove(fp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Parameters;

    fn fp(len: f64) -> Fingerprint {
        Parameters::new()
            .set("length", len)
            .fingerprint()
            .unwrap()
    }

    #[tokio::test]
    async fn store_then_lookup() {
        let cache = MemoryResultCache::new();
        let id = JobId::new();
        let fp = fp(5.0);

        cache.store(&fp, id, Duration::from_secs(60)).await.unwrap();
        let entry = cache.lookup(&fp).await.unwrap().unwrap();
        assert_eq!(entry.source_job_id, id);
    }

    #[tokio::test]
    async fn lookup_miss() {
        let cache = MemoryResultCache::new();
        assert!(cache.lookup(&fp(1.0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_is_last_write_wins() {
        let cache = MemoryResultCache::new();
        let fp = fp(5.0);
        let first = JobId::new();
        let second = JobId::new();

        cache
            .store(&fp, first, Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .store(&fp, second, Duration::from_secs(60))
            .await
            .unwrap();

        let entry = cache.lookup(&fp).await.unwrap().unwrap();
        assert_eq!(entry.source_job_id, second);
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = MemoryResultCache::new();
        let fp = fp(5.0);
        cache
            .store(&fp, JobId::new(), Duration::from_secs(60))
            .await
            .unwrap();
        cache.invalidate(&fp).await.unwrap();
        assert!(cache.lookup(&fp).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_not_returned() {
        let cache = MemoryResultCache::new();
        let fp = fp(5.0);
        cache
            .store(&fp, JobId::new(), Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.lookup(&fp).await.unwrap().is_none());
        // Lazy removal actually dropped it.
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpired_entry_survives() {
        let cache = MemoryResultCache::new();
        let fp = fp(5.0);
        cache
            .store(&fp, JobId::new(), Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.lookup(&fp).await.unwrap().is_some());
    }
}
